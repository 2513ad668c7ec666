//! # Retry Backoff
//!
//! Exponential backoff for reconnect and resubscribe retries. The delay is a
//! pure function of the attempt count; arming and firing the deadline is the
//! network task's job, so nothing here ever blocks.

use embassy_time::Duration;

/// Delay before the first retry.
pub const MIN_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on the retry delay.
pub const MAX_DELAY: Duration = Duration::from_millis(5000);

// MIN_DELAY << 5 reaches 8s > MAX_DELAY, so counting stops there and the
// shift exponent stays bounded.
const MAX_COUNTED_ATTEMPTS: u8 = 5;

/// Returns the delay for the current attempt and advances the counter.
///
/// The delay doubles per attempt starting from [`MIN_DELAY`] and saturates at
/// [`MAX_DELAY`]; the counter itself saturates once the cap is reached.
pub fn next_delay(attempts: &mut u8) -> Duration {
    let delay = Duration::from_ticks(
        (MIN_DELAY.as_ticks() << (*attempts).min(MAX_COUNTED_ATTEMPTS)).min(MAX_DELAY.as_ticks()),
    );
    if *attempts < MAX_COUNTED_ATTEMPTS {
        *attempts += 1;
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let mut attempts = 0;
        assert_eq!(next_delay(&mut attempts), Duration::from_millis(250));
        assert_eq!(next_delay(&mut attempts), Duration::from_millis(500));
        assert_eq!(next_delay(&mut attempts), Duration::from_millis(1000));
        assert_eq!(next_delay(&mut attempts), Duration::from_millis(2000));
        assert_eq!(next_delay(&mut attempts), Duration::from_millis(4000));
    }

    #[test]
    fn delay_saturates_at_max() {
        let mut attempts = 0;
        for _ in 0..32 {
            let delay = next_delay(&mut attempts);
            assert!(delay <= MAX_DELAY);
        }
        assert_eq!(next_delay(&mut attempts), MAX_DELAY);
        // The counter stops growing once the cap is reached.
        assert_eq!(attempts, MAX_COUNTED_ATTEMPTS);
    }

    #[test]
    fn reset_counter_restarts_from_min() {
        let mut attempts = 0;
        for _ in 0..8 {
            next_delay(&mut attempts);
        }
        attempts = 0;
        assert_eq!(next_delay(&mut attempts), MIN_DELAY);
    }
}
