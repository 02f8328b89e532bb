use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// Locks a mutex, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Compact two-unit duration such as "3d4h", "12m30s" or "45s".
pub fn format_compact(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        total % 86_400 / 3_600,
        total % 3_600 / 60,
        total % 60,
    );

    let pair = |major: u64, major_unit: &str, minor: u64, minor_unit: &str| {
        if minor == 0 {
            format!("{}{}", major, major_unit)
        } else {
            format!("{}{}{}{}", major, major_unit, minor, minor_unit)
        }
    };

    if days > 0 {
        pair(days, "d", hours, "h")
    } else if hours > 0 {
        pair(hours, "h", minutes, "m")
    } else if minutes > 0 {
        pair(minutes, "m", seconds, "s")
    } else {
        format!("{}s", seconds)
    }
}

/// Time elapsed since `when`; clock skew into the future counts as zero.
pub fn format_ago(when: SystemTime) -> String {
    format_compact(SystemTime::now().duration_since(when).unwrap_or_default())
}
