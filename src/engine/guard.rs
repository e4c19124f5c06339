use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::SlotTable;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_timestamp(t: Option<Ms>) -> Result<(), EngineError> {
    match t {
        Some(t) if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) => {
            Err(EngineError::InvalidInput("timestamp out of range"))
        }
        _ => Ok(()),
    }
}

/// Bounds in range and `ends_at >= starts_at`.
pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    validate_timestamp(window.starts_at)?;
    validate_timestamp(window.ends_at)?;
    if let (Some(starts_at), Some(ends_at)) = (window.starts_at, window.ends_at)
        && !window.is_ordered()
    {
        return Err(EngineError::InvalidWindow { starts_at, ends_at });
    }
    Ok(())
}

pub(crate) fn validate_rank(rank: Option<Rank>) -> Result<(), EngineError> {
    match rank {
        Some(r) if !(MIN_RANK..=MAX_RANK).contains(&r) => {
            Err(EngineError::InvalidInput("rank out of range"))
        }
        _ => Ok(()),
    }
}

pub(crate) fn validate_event_id(event_id: &str) -> Result<(), EngineError> {
    if event_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("event_id is required"));
    }
    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(EngineError::InvalidInput("event_id too long"));
    }
    Ok(())
}

/// The slot whose activation is being checked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    /// The candidate's own row when it already exists.
    pub exclude: Option<Ulid>,
    pub is_active: bool,
    pub window: Window,
}

/// Reject activating a slot when `max_active` active slots already overlap
/// its window.
///
/// This counts existing slots that overlap the candidate, not the peak
/// number of slots live at one instant: two active slots in disjoint windows
/// that both touch the candidate count as two.
pub(crate) fn check_capacity(
    table: &SlotTable,
    candidate: &Candidate,
    max_active: usize,
) -> Result<(), EngineError> {
    if !candidate.is_active {
        return Ok(());
    }
    let overlapping = table
        .active_overlapping(&candidate.window, candidate.exclude)
        .count();
    if overlapping >= max_active {
        metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
        return Err(EngineError::CapacityExceeded {
            max_active,
            overlapping,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(windows: &[(bool, Window)]) -> (SlotTable, Vec<Ulid>) {
        let mut table = SlotTable::new();
        let mut ids = Vec::new();
        for (i, (is_active, window)) in windows.iter().enumerate() {
            let slot = FeaturedSlot {
                id: Ulid::new(),
                event_id: format!("evt-{i}"),
                rank: i as Rank,
                is_active: *is_active,
                window: *window,
                created_at: 0,
                updated_at: 0,
            };
            ids.push(slot.id);
            table.apply(&Event::SlotInserted { slot });
        }
        (table, ids)
    }

    fn active(window: Window) -> Candidate {
        Candidate {
            exclude: None,
            is_active: true,
            window,
        }
    }

    #[test]
    fn full_table_rejects_activation() {
        let (table, _) = table_with(&[(true, Window::unbounded()), (true, Window::unbounded())]);
        let err = check_capacity(&table, &active(Window::unbounded()), 2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { max_active: 2, overlapping: 2 }
        ));
    }

    #[test]
    fn inactive_candidate_always_passes() {
        let (table, _) = table_with(&[(true, Window::unbounded()), (true, Window::unbounded())]);
        let candidate = Candidate {
            exclude: None,
            is_active: false,
            window: Window::unbounded(),
        };
        assert!(check_capacity(&table, &candidate, 2).is_ok());
        assert!(check_capacity(&table, &candidate, 0).is_ok());
    }

    #[test]
    fn inactive_and_disjoint_slots_do_not_count() {
        let (table, _) = table_with(&[
            (false, Window::unbounded()),
            (true, Window::new(Some(0), Some(100))),
        ]);
        let later = active(Window::new(Some(101), Some(200)));
        assert!(check_capacity(&table, &later, 1).is_ok());
    }

    #[test]
    fn touching_windows_count_as_overlap() {
        let (table, _) = table_with(&[(true, Window::new(Some(0), Some(100)))]);
        let touching = active(Window::new(Some(100), Some(200)));
        assert!(check_capacity(&table, &touching, 1).is_err());
    }

    #[test]
    fn excluded_row_is_not_counted() {
        let (table, ids) = table_with(&[(true, Window::unbounded()), (true, Window::unbounded())]);
        let candidate = Candidate {
            exclude: Some(ids[0]),
            is_active: true,
            window: Window::unbounded(),
        };
        assert!(check_capacity(&table, &candidate, 2).is_ok());
    }

    #[test]
    fn counts_pairwise_overlaps_not_peak_concurrency() {
        // [0,10] and [20,30] never run together, yet both overlap [0,30].
        // At most two slots would be live at any instant, but the count is
        // pairwise with the candidate: 2 >= 2 rejects.
        let (table, _) = table_with(&[
            (true, Window::new(Some(0), Some(10))),
            (true, Window::new(Some(20), Some(30))),
        ]);
        let spanning = active(Window::new(Some(0), Some(30)));
        assert!(matches!(
            check_capacity(&table, &spanning, 2),
            Err(EngineError::CapacityExceeded { overlapping: 2, .. })
        ));
    }

    #[test]
    fn window_validation() {
        assert!(validate_window(&Window::new(Some(10), Some(10))).is_ok());
        assert!(validate_window(&Window::new(None, None)).is_ok());
        assert!(matches!(
            validate_window(&Window::new(Some(20), Some(10))),
            Err(EngineError::InvalidWindow { starts_at: 20, ends_at: 10 })
        ));
        assert!(matches!(
            validate_window(&Window::new(Some(-1), None)),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn input_validation() {
        assert!(validate_event_id("evt_1").is_ok());
        assert!(validate_event_id("  ").is_err());
        assert!(validate_event_id(&"x".repeat(MAX_EVENT_ID_LEN + 1)).is_err());
        assert!(validate_rank(Some(MAX_RANK)).is_ok());
        assert!(validate_rank(Some(MAX_RANK + 1)).is_err());
        assert!(validate_rank(None).is_ok());
    }
}
