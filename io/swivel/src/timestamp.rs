use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Wall-clock instant in microseconds since the Unix epoch.
///
/// Threaded through read dispatch as the event-receipt time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp { micros }
    }

    pub const fn from_micros(micros: i64) -> Self {
        Timestamp { micros }
    }

    pub const fn micros(&self) -> i64 {
        self.micros
    }

    pub const fn valid(&self) -> bool {
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
