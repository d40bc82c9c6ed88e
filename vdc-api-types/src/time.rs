//! Small epoch helpers; all persisted timestamps are UTC epoch values.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Milliseconds since the epoch.
pub fn epoch_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
