use std::time::Duration;
use time::OffsetDateTime;

/// Returns how long a fetch must still wait, given the last fetch time.
///
/// `None` means fetching now is allowed. A `fetched_at` in the future is
/// treated as "just fetched".
pub fn fetch_throttle_remaining(
    fetched_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
    min_interval: Duration,
) -> Option<Duration> {
    let fetched_at = fetched_at?;
    let min_interval = time::Duration::try_from(min_interval).ok()?;
    let elapsed = (now - fetched_at).max(time::Duration::ZERO);
    if elapsed >= min_interval {
        return None;
    }
    Duration::try_from(min_interval - elapsed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_throttle() {
        let now = OffsetDateTime::now_utc();
        let min = Duration::from_secs(30);

        assert_eq!(fetch_throttle_remaining(None, now, min), None);
        assert_eq!(
            fetch_throttle_remaining(Some(now - time::Duration::seconds(40)), now, min),
            None
        );
        assert_eq!(
            fetch_throttle_remaining(Some(now - time::Duration::seconds(10)), now, min),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            fetch_throttle_remaining(Some(now + time::Duration::seconds(5)), now, min),
            Some(min)
        );
        assert_eq!(
            fetch_throttle_remaining(Some(now), now, Duration::ZERO),
            None
        );
    }
}
