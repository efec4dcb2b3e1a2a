//! Wall-clock instants handed to read callbacks.
//!
//! A `Timestamp` is captured immediately after the multiplexer's blocking
//! call returns, so every callback dispatched from one poll batch observes
//! the same receive time.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Wrap a raw microsecond count.
    pub fn from_micros(micros: i64) -> Self {
        Timestamp { micros }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp { micros }
    }

    /// Microseconds since the Unix epoch.
    pub fn micros_since_epoch(&self) -> i64 {
        self.micros
    }

    /// A default-constructed timestamp is not a real instant.
    pub fn is_valid(&self) -> bool {
        self.micros > 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micros / MICROS_PER_SECOND;
        let micros = self.micros % MICROS_PER_SECOND;
        write!(f, "{seconds}.{micros:06}")
    }
}
