//! Capacity limits for distinct keys per day
//!
//! Two independent gates bound how much a single day can hold:
//!
//! - event-vector buffer: distinct event vectors per (report, day, system profile)
//! - string buffer: distinct strings per (report, day)
//!
//! A limit of 0 means unlimited. Limits bound new keys only; updates to keys
//! already stored always pass.

use crate::storage::{DayIndex, ReportKey, StorageResult, StoreTx, StringHash, SystemProfileHash};

/// Outcome of looking up a bucket index for a string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringIndex {
    /// The string already has this index for the day
    Existing(u32),
    /// The string may take this new index; the caller persists it
    New(u32),
    /// The string buffer for the day is full
    Full,
}

/// Whether one more distinct event vector fits for (report, day, profile)
pub fn can_add_event_vector(
    tx: &StoreTx<'_>,
    report: &ReportKey,
    day_index: DayIndex,
    system_profile_hash: SystemProfileHash,
    event_vector_buffer_max: u64,
) -> StorageResult<bool> {
    if event_vector_buffer_max == 0 {
        return Ok(true);
    }

    let stored = tx.count_event_vectors(report, day_index, system_profile_hash)?;
    if stored >= event_vector_buffer_max {
        tracing::warn!(
            "Dropping event vector for report {}, exceeding event_vector_buffer_max {}",
            report,
            event_vector_buffer_max
        );
        return Ok(false);
    }

    Ok(true)
}

/// Find or allocate the bucket index of a string for (report, day)
pub fn assign_string_index(
    tx: &StoreTx<'_>,
    report: &ReportKey,
    day_index: DayIndex,
    string_buffer_max: u64,
    hash: &StringHash,
) -> StorageResult<StringIndex> {
    if let Some(index) = tx.string_list_index(report, day_index, hash)? {
        return Ok(StringIndex::Existing(index));
    }

    let candidate = tx
        .max_string_list_index(report, day_index)?
        .map_or(0, |max| max + 1);

    if string_buffer_max > 0 && u64::from(candidate) >= string_buffer_max {
        return Ok(StringIndex::Full);
    }

    Ok(StringIndex::New(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AggregateValue, EventVector, Store, SystemProfile};

    const DAY: DayIndex = 19202;

    fn report() -> ReportKey {
        ReportKey::new(1, 2, 3, 4)
    }

    fn store_with_strings(indices: &[(u32, &str)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.insert_report_if_absent(&report(), DAY)?;
                for (index, value) in indices {
                    tx.insert_string_hash(&report(), DAY, *index, &StringHash::of(value))?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn test_nothing_found_gets_zero() {
        let store = store_with_strings(&[(12, "a")]);
        let result = store
            .transaction(|tx| {
                let other = ReportKey::new(1, 2, 3, 5);
                Ok((
                    assign_string_index(tx, &other, DAY, 0, &StringHash::of("a"))?,
                    assign_string_index(tx, &report(), DAY + 1, 0, &StringHash::of("a"))?,
                ))
            })
            .unwrap();
        assert_eq!(result, (StringIndex::New(0), StringIndex::New(0)));
    }

    #[test]
    fn test_match_ignores_buffer_max() {
        let store = store_with_strings(&[(12, "a"), (13, "b")]);
        let index = store
            .transaction(|tx| assign_string_index(tx, &report(), DAY, 1, &StringHash::of("a")))
            .unwrap();
        assert_eq!(index, StringIndex::Existing(12));
    }

    #[test]
    fn test_new_hash_gets_next_index() {
        let store = store_with_strings(&[(12, "a"), (13, "b")]);
        let (unbounded, bounded) = store
            .transaction(|tx| {
                Ok((
                    assign_string_index(tx, &report(), DAY, 0, &StringHash::of("c"))?,
                    assign_string_index(tx, &report(), DAY, 100, &StringHash::of("c"))?,
                ))
            })
            .unwrap();
        assert_eq!(unbounded, StringIndex::New(14));
        assert_eq!(bounded, StringIndex::New(14));
    }

    #[test]
    fn test_buffer_max_reached() {
        let store = store_with_strings(&[(12, "a"), (13, "b")]);
        let index = store
            .transaction(|tx| assign_string_index(tx, &report(), DAY, 14, &StringHash::of("c")))
            .unwrap();
        assert_eq!(index, StringIndex::Full);
    }

    #[test]
    fn test_event_vector_limit() {
        let store = Store::open_in_memory().unwrap();
        let profile = SystemProfile::default().system_version("1.2.3");

        store
            .transaction(|tx| {
                let hash = profile.content_hash()?;
                tx.insert_system_profile(hash, &profile)?;
                tx.insert_report_if_absent(&report(), DAY)?;

                assert!(can_add_event_vector(tx, &report(), DAY, hash, 2)?);
                for code in [1, 2] {
                    tx.insert_aggregate(
                        &report(),
                        DAY,
                        &EventVector::new(vec![code]),
                        hash,
                        &AggregateValue::Integer(1),
                    )?;
                }

                assert!(!can_add_event_vector(tx, &report(), DAY, hash, 2)?);
                assert!(can_add_event_vector(tx, &report(), DAY, hash, 3)?);
                assert!(can_add_event_vector(tx, &report(), DAY, hash, 0)?);
                // Other days and profiles have their own budget
                assert!(can_add_event_vector(tx, &report(), DAY + 1, hash, 2)?);
                assert!(can_add_event_vector(tx, &report(), DAY, hash.wrapping_add(1), 2)?);
                Ok(())
            })
            .unwrap();
    }
}
