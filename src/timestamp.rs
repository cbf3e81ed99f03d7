use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock instant with microsecond resolution.
///
/// Passed to message callbacks as the poll-return time of the batch that
/// produced the data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

const MICROS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    /// Returns the number of microseconds since the Unix epoch.
    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micros_since_epoch / MICROS_PER_SECOND;
        let micros = self.micros_since_epoch % MICROS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}
