//! spindle echo server
//!
//! Demonstrates the multi-reactor wiring: a base loop accepts
//! connections, a round-robin pool of worker loops owns them. Each
//! accepted stream migrates to its worker via `run_in_loop`, gets a
//! tie-guarded handle there, and echoes whatever it reads.
//!
//! Configuration via CLI arguments or TOML file; logging via
//! `RUST_LOG`-style filtering.

mod config;

use config::{Backend, Config};
use spindle::mux::USE_POLL_ENV;
use spindle::{Acceptor, EventLoop, Handle, HandleRef, LoopThreadPool, Timestamp};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if config.backend == Backend::Poll {
        std::env::set_var(USE_POLL_ENV, "1");
    }

    let addr: SocketAddr = config.listen.parse()?;
    info!(
        addr = %addr,
        workers = config.workers,
        backend = ?config.backend,
        "Starting spindle echo server"
    );

    let base = EventLoop::new();
    let mut pool = LoopThreadPool::new(&base, "worker");
    pool.set_thread_count(config.workers);
    pool.start(None)?;
    let pool = Rc::new(RefCell::new(pool));

    let mut acceptor = Acceptor::new(&base, addr, config.reuse_port)?;
    acceptor.set_new_connection_callback(move |stream, peer| {
        let worker = pool.borrow_mut().get_next_loop();
        worker.run_in_loop(move || EchoConnection::establish(stream, peer));
    });
    acceptor.listen();

    info!(addr = %acceptor.local_addr(), "Accepting connections");
    base.run();
    Ok(())
}

thread_local! {
    /// Connections owned by this worker thread, keyed by descriptor.
    static CONNECTIONS: RefCell<HashMap<RawFd, Rc<EchoConnection>>> =
        RefCell::new(HashMap::new());
}

/// One echoing connection, owned by exactly one worker loop.
struct EchoConnection {
    fd: RawFd,
    peer: SocketAddr,
    stream: RefCell<TcpStream>,
    handle: HandleRef,
}

impl EchoConnection {
    /// Runs on the worker loop's thread: wrap the accepted stream in a
    /// handle, tie it, and start reading.
    fn establish(stream: TcpStream, peer: SocketAddr) {
        let Some(event_loop) = EventLoop::current() else {
            error!(peer = %peer, "no event loop on this thread, dropping connection");
            return;
        };
        let fd = stream.as_raw_fd();
        let handle = Handle::new(&event_loop, fd);
        let conn = Rc::new(EchoConnection {
            fd,
            peer,
            stream: RefCell::new(stream),
            handle: Rc::clone(&handle),
        });
        {
            let mut h = handle.borrow_mut();
            // Late events promote through the tie; once the connection is
            // dropped they are discarded instead of dispatched.
            h.tie(&conn);
            let weak = Rc::downgrade(&conn);
            h.set_read_callback(move |ts| {
                if let Some(conn) = weak.upgrade() {
                    conn.on_readable(ts);
                }
            });
            let weak = Rc::downgrade(&conn);
            h.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.close("peer hung up");
                }
            });
            let weak = Rc::downgrade(&conn);
            h.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.close("socket error");
                }
            });
        }
        handle.borrow_mut().enable_reading();
        debug!(peer = %peer, "connection established");
        CONNECTIONS.with(|conns| conns.borrow_mut().insert(fd, conn));
    }

    fn on_readable(&self, _receive_time: Timestamp) {
        let mut stream = self.stream.borrow_mut();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    drop(stream);
                    self.close("peer closed");
                    return;
                }
                Ok(n) => {
                    if let Err(err) = write_fully(&mut stream, &buf[..n]) {
                        if err.kind() == io::ErrorKind::WouldBlock {
                            // Best-effort echo: a saturated socket drops
                            // the tail instead of buffering it.
                            warn!(peer = %self.peer, "send buffer full, dropping tail");
                        } else {
                            drop(stream);
                            self.close("write failed");
                            return;
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "read failed");
                    drop(stream);
                    self.close("read failed");
                    return;
                }
            }
        }
    }

    fn close(&self, reason: &str) {
        debug!(peer = %self.peer, reason, "closing connection");
        {
            let mut h = self.handle.borrow_mut();
            h.disable_all();
            h.remove();
        }
        // Dropping the table entry releases the stream; the tie guard
        // swallows anything still in flight.
        CONNECTIONS.with(|conns| conns.borrow_mut().remove(&self.fd));
    }
}

fn write_fully(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match stream.write(data) {
            Ok(n) => data = &data[n..],
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_echo_round_trip_through_worker_pool() {
        let (addr_tx, addr_rx) = mpsc::channel();
        let server = thread::spawn(move || {
            let base = EventLoop::new();
            let mut pool = LoopThreadPool::new(&base, "echo-test");
            pool.set_thread_count(2);
            pool.start(None).unwrap();
            let pool = Rc::new(RefCell::new(pool));

            let mut acceptor =
                Acceptor::new(&base, "127.0.0.1:0".parse().unwrap(), false).unwrap();
            acceptor.set_new_connection_callback(move |stream, peer| {
                let worker = pool.borrow_mut().get_next_loop();
                worker.run_in_loop(move || EchoConnection::establish(stream, peer));
            });
            acceptor.listen();
            addr_tx.send((acceptor.local_addr(), base.handle())).unwrap();
            base.run();
        });

        let (addr, base_handle) = addr_rx.recv().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let message = b"hello spindle";
        client.write_all(message).unwrap();

        let mut echoed = Vec::new();
        let mut buf = [0u8; 64];
        while echoed.len() < message.len() {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed before full echo");
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&echoed, message);

        base_handle.quit();
        server.join().unwrap();
    }
}
