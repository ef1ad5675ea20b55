use chrono::Utc;

/// Current wall-clock time in epoch milliseconds.
///
/// All bus timestamps and counter intervals use this scale; monotonic
/// measurements use [`std::time::Instant`] instead.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
