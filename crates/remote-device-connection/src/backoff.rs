//! Reconnection backoff sequence.

use std::time::Duration;

/// Delay before each reconnection attempt, in seconds. The last value is
/// the cap used for every later attempt.
pub const RECONNECT_BACKOFF_SECS: [u64; 7] = [0, 1, 2, 4, 8, 16, 30];

/// Delay before reconnection attempt `attempt` (0-based).
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    let index = usize::try_from(attempt)
        .unwrap_or(usize::MAX)
        .min(RECONNECT_BACKOFF_SECS.len() - 1);
    Duration::from_secs(RECONNECT_BACKOFF_SECS[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_then_cap() {
        let delays: Vec<u64> = (0..10).map(|a| reconnect_delay(a).as_secs()).collect();
        assert_eq!(delays, [0, 1, 2, 4, 8, 16, 30, 30, 30, 30]);
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_secs(30));
    }
}
