use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch, used for eject deadlines and request timeouts.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Milliseconds since the epoch, used for the timing wheel's finer-grained
/// request-timeout bookkeeping.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}
