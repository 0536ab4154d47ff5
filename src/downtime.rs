//! Running downtime counter

/// Compute the new downtime of a service after a probe.
///
/// Any successful probe resets downtime. A failed probe adds the time since
/// the service was last recorded plus the time spent in the current cycle
/// before this probe finished.
pub fn accumulate(
    available: bool,
    prior_downtime_secs: u64,
    since_last_update_secs: u64,
    elapsed_in_cycle_secs: u64,
) -> u64 {
    if available {
        return 0;
    }

    prior_downtime_secs
        .saturating_add(since_last_update_secs)
        .saturating_add(elapsed_in_cycle_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_resets_downtime() {
        assert_eq!(accumulate(true, 0, 0, 0), 0);
        assert_eq!(accumulate(true, 900, 60, 12), 0);
        assert_eq!(accumulate(true, u64::MAX, u64::MAX, u64::MAX), 0);
    }

    #[test]
    fn test_unavailable_adds_both_gaps() {
        assert_eq!(accumulate(false, 0, 60, 0), 60);
        assert_eq!(accumulate(false, 100, 60, 5), 165);
        assert_eq!(accumulate(false, 100, 5, 60), accumulate(false, 100, 60, 5));
    }

    #[test]
    fn test_unavailable_saturates() {
        assert_eq!(accumulate(false, u64::MAX - 1, 10, 10), u64::MAX);
    }
}
