//! Start offset selection for newly assigned partitions.

use crate::config::StartOffset;
use crate::model::{NakadiPartition, Offset};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Choose where a newly assigned partition starts.
///
/// A persisted offset is used when it lies inside the broker's current
/// `[oldest, newest]` window, clamped to the nearest edge otherwise. Without
/// a usable persisted offset the configured default applies.
pub fn resolve_start_offset(
    persisted: Option<&Offset>,
    partition: &NakadiPartition,
    default: StartOffset,
) -> Offset {
    let fallback = match default {
        StartOffset::Newest => partition.newest(),
        StartOffset::Oldest => partition.oldest(),
    };

    let Some(persisted) = persisted else {
        return fallback;
    };

    if persisted.ordinal().is_none() {
        warn!(
            partition = %partition.partition,
            offset = %persisted,
            "Persisted offset is not a valid broker offset, using default"
        );
        return fallback;
    }

    let newest = partition.newest();
    let mut oldest = partition.oldest();
    if oldest.compare(&newest) == Some(Ordering::Greater) {
        oldest = newest.clone();
    }

    if persisted.compare(&oldest) == Some(Ordering::Less) {
        warn!(
            partition = %partition.partition,
            offset = %persisted,
            oldest = %oldest,
            "Persisted offset was purged by retention, clamping to oldest"
        );
        return oldest;
    }

    if persisted.compare(&newest) == Some(Ordering::Greater) {
        warn!(
            partition = %partition.partition,
            offset = %persisted,
            newest = %newest,
            "Persisted offset is ahead of the newest offset, clamping to newest"
        );
        return newest;
    }

    debug!(partition = %partition.partition, offset = %persisted, "Resuming from persisted offset");
    persisted.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(oldest: &str, newest: &str) -> NakadiPartition {
        NakadiPartition {
            partition: "0".to_string(),
            oldest_available_offset: oldest.to_string(),
            newest_available_offset: newest.to_string(),
            unconsumed_events: None,
        }
    }

    fn offset(value: &str) -> Offset {
        Offset::parse(value)
    }

    #[test]
    fn test_inside_window_is_kept() {
        let resolved = resolve_start_offset(Some(&offset("15")), &window("10", "20"), StartOffset::Newest);
        assert_eq!(resolved, offset("15"));

        let resolved = resolve_start_offset(Some(&offset("10")), &window("10", "20"), StartOffset::Newest);
        assert_eq!(resolved, offset("10"));
    }

    #[test]
    fn test_below_oldest_is_clamped() {
        let resolved = resolve_start_offset(Some(&offset("3")), &window("10", "20"), StartOffset::Newest);
        assert_eq!(resolved, offset("10"));
    }

    #[test]
    fn test_above_newest_is_clamped() {
        let resolved = resolve_start_offset(Some(&offset("99")), &window("10", "20"), StartOffset::Oldest);
        assert_eq!(resolved, offset("20"));
    }

    #[test]
    fn test_oldest_after_newest_treated_as_newest() {
        let resolved = resolve_start_offset(Some(&offset("19")), &window("21", "20"), StartOffset::Newest);
        assert_eq!(resolved, offset("20"));

        let resolved = resolve_start_offset(Some(&offset("20")), &window("21", "20"), StartOffset::Newest);
        assert_eq!(resolved, offset("20"));
    }

    #[test]
    fn test_unparseable_falls_back_to_default() {
        let partition = window("10", "20");
        assert_eq!(
            resolve_start_offset(Some(&offset("garbage")), &partition, StartOffset::Newest),
            offset("20")
        );
        assert_eq!(
            resolve_start_offset(Some(&offset("garbage")), &partition, StartOffset::Oldest),
            offset("10")
        );
    }

    #[test]
    fn test_absent_uses_default() {
        let partition = window("BEGIN", "7");
        assert_eq!(resolve_start_offset(None, &partition, StartOffset::Newest), offset("7"));
        assert_eq!(resolve_start_offset(None, &partition, StartOffset::Oldest), Offset::Begin);
    }

    #[test]
    fn test_begin_persisted_inside_begin_window() {
        let resolved = resolve_start_offset(Some(&Offset::Begin), &window("BEGIN", "7"), StartOffset::Newest);
        assert_eq!(resolved, Offset::Begin);
    }

    #[test]
    fn test_clamping_property() {
        for oldest in 0u64..6 {
            for newest in oldest..8 {
                for persisted in 0u64..10 {
                    let resolved = resolve_start_offset(
                        Some(&offset(&persisted.to_string())),
                        &window(&oldest.to_string(), &newest.to_string()),
                        StartOffset::Newest,
                    );
                    let expected = persisted.clamp(oldest, newest);
                    assert_eq!(resolved, offset(&expected.to_string()));
                }
            }
        }
    }
}
