//! Listening-socket handle on the base loop.
//!
//! The acceptor owns a nonblocking listening socket registered with
//! read-interest only. Each readable event drains the accept queue and
//! hands every accepted stream, already nonblocking, to the embedder's
//! new-connection callback. Ownership of accepted descriptors transfers
//! to the callback; the acceptor never closes them and never tears itself
//! down on accept failure.

use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleRef};
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Invoked on the base loop's thread with each accepted stream and its
/// peer address.
pub type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr)>;

struct AcceptorState {
    listener: TcpListener,
    on_new_connection: Option<NewConnectionCallback>,
}

pub struct Acceptor {
    handle: HandleRef,
    state: Rc<RefCell<AcceptorState>>,
    local_addr: SocketAddr,
    listening: bool,
}

impl Acceptor {
    /// Bind `addr` and register the listener on `event_loop` without
    /// enabling read-interest yet.
    pub fn new(event_loop: &EventLoop, addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        let listener = bind_listening_socket(addr, reuse_port)?;
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();

        let state = Rc::new(RefCell::new(AcceptorState {
            listener,
            on_new_connection: None,
        }));
        let handle = Handle::new(event_loop, fd);
        let accept_state = Rc::clone(&state);
        handle
            .borrow_mut()
            .set_read_callback(move |_| accept_ready(&accept_state));

        Ok(Acceptor {
            handle,
            state,
            local_addr,
            listening: false,
        })
    }

    pub fn set_new_connection_callback(
        &mut self,
        cb: impl FnMut(TcpStream, SocketAddr) + 'static,
    ) {
        self.state.borrow_mut().on_new_connection = Some(Box::new(cb));
    }

    /// Enable read-interest; accepted connections start flowing to the
    /// callback once the loop runs.
    pub fn listen(&mut self) {
        self.listening = true;
        self.handle.borrow_mut().enable_reading();
        debug!(addr = %self.local_addr, "listening");
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let mut handle = self.handle.borrow_mut();
        handle.disable_all();
        handle.remove();
    }
}

fn accept_ready(state: &Rc<RefCell<AcceptorState>>) {
    let mut state = state.borrow_mut();
    let state = &mut *state;
    loop {
        match state.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!(peer = %peer, error = %err, "could not make accepted stream nonblocking");
                    continue;
                }
                debug!(peer = %peer, "accepted connection");
                match state.on_new_connection.as_mut() {
                    Some(cb) => cb(stream, peer),
                    None => warn!(peer = %peer, "no new-connection callback, closing"),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                // EMFILE/ENFILE keep the listener registered; the backlog
                // is retried on the next readable event.
                match err.raw_os_error() {
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        error!(error = %err, "accept failed, descriptors exhausted")
                    }
                    _ => error!(error = %err, "accept failed"),
                }
                break;
            }
        }
    }
}

/// Nonblocking listener with address reuse and an optional SO_REUSEPORT
/// for kernel-level balancing across processes.
fn bind_listening_socket(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
