//! Cooldown checks shared by the poll scheduler and the normalizer throttle
//!
//! Pure functions that take the clock as an argument.

use chrono::{DateTime, Utc};

/// Check if enough time has elapsed since `last` to allow another run.
///
/// # Arguments
/// * `last` - When the previous run happened (None if never)
/// * `cooldown_secs` - Minimum seconds that must elapse between runs
///
/// # Returns
/// `true` if enough time has passed (or never ran), `false` if still in cooldown
pub fn cooldown_elapsed(last: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    cooldown_elapsed_at(last, cooldown_secs, Utc::now())
}

/// [`cooldown_elapsed`] against an explicit clock
pub fn cooldown_elapsed_at(
    last: Option<DateTime<Utc>>,
    cooldown_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    match last {
        Some(last) => (now - last).num_seconds() >= cooldown_secs as i64,
        None => true, // Never ran, so cooldown has "elapsed"
    }
}
