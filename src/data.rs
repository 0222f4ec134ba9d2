//! Data Service
//!
//! The transactional entry point of the pipeline. Every mutating operation
//! runs as one store transaction on tokio's blocking pool:
//!
//! - Aggregation: occurrence → capacity gate → read-combine-write
//! - Generation: per-report backfill over the days since the last emission
//! - Cleanup: retention and orphan removal
//! - Enablement: first-enabled / disabled timestamps with a grace period
//!
//! Observation generators run between transactions, never inside one.

use crate::aggregation::{
    assign_string_index, can_add_event_vector, combine, initial_value, Occurrence, StringIndex,
};
use crate::observation::{group_by_profile, ObservationGenerator};
use crate::operations::OperationLogger;
use crate::storage::{
    AggregateRow, AggregateValue, DayIndex, EventVector, GlobalKey, QueuedObservation, ReportKey,
    StorageError, StorageResult, Store, StoreStats, StoreTx, StringHash, SystemProfile,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Configuration for the data service
#[derive(Debug, Clone)]
pub struct DataServiceConfig {
    /// Most days generated per report in one pass, including the most recent day
    pub max_backfill_days: u32,
    /// A disable longer than this starts a new enablement session
    pub disabled_reset: Duration,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            max_backfill_days: 7,
            disabled_reset: Duration::days(2),
        }
    }
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Aggregate rows older than the retention horizon
    pub old_aggregates: usize,
    /// String hash rows older than the retention horizon
    pub old_string_hashes: usize,
    /// Reports no longer in the relevant set (their rows cascade)
    pub reports: usize,
    pub system_profiles: usize,
}

/// Transactional operations over the aggregate store
pub struct DataService {
    store: Arc<Store>,
    operation_logger: Arc<dyn OperationLogger>,
    config: DataServiceConfig,
}

impl DataService {
    pub fn new(store: Arc<Store>, operation_logger: Arc<dyn OperationLogger>) -> Self {
        Self::with_config(store, operation_logger, DataServiceConfig::default())
    }

    pub fn with_config(
        store: Arc<Store>,
        operation_logger: Arc<dyn OperationLogger>,
        config: DataServiceConfig,
    ) -> Self {
        Self {
            store,
            operation_logger,
            config,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &DataServiceConfig {
        &self.config
    }

    /// Run `f` against the store on the blocking pool
    async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Store) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    // ==================== Enablement ====================

    /// Record that the logger is disabled; the latest call wins
    pub async fn logger_disabled(&self, now: DateTime<Utc>) -> StorageResult<()> {
        self.run(move |store| {
            store.transaction(|tx| {
                tx.upsert_global_value(GlobalKey::InitialDisabledTime, &time_to_db_string(now))
            })
        })
        .await
    }

    /// Record that the logger is enabled and return the start of the session.
    ///
    /// A re-enable within the grace period continues the previous session.
    pub async fn logger_enabled(&self, now: DateTime<Utc>) -> StorageResult<DateTime<Utc>> {
        let disabled_reset = self.config.disabled_reset;
        self.run(move |store| store.transaction(|tx| logger_enabled_tx(tx, now, disabled_reset)))
            .await
    }

    // ==================== Aggregation ====================

    /// Add `count` to the counter for (report, day, profile, event vector).
    ///
    /// A new event vector beyond `event_vector_buffer_max` is dropped silently.
    pub async fn aggregate_count(
        &self,
        report: ReportKey,
        day_index: DayIndex,
        system_profile: SystemProfile,
        event_vector: EventVector,
        event_vector_buffer_max: u64,
        count: i64,
    ) -> StorageResult<()> {
        self.run(move |store| {
            store.transaction(|tx| {
                aggregate_report_all(
                    tx,
                    &report,
                    day_index,
                    &system_profile,
                    &event_vector,
                    event_vector_buffer_max,
                    Occurrence::Count(count),
                )
                .map(|_| ())
            })
        })
        .await
    }

    /// Count one occurrence of `value` in the string histogram for the key.
    ///
    /// A new string beyond `string_buffer_max` is dropped and reported to the
    /// operation logger.
    #[allow(clippy::too_many_arguments)]
    pub async fn aggregate_string(
        &self,
        report: ReportKey,
        day_index: DayIndex,
        system_profile: SystemProfile,
        event_vector: EventVector,
        event_vector_buffer_max: u64,
        string_buffer_max: u64,
        value: String,
    ) -> StorageResult<()> {
        let operation_logger = Arc::clone(&self.operation_logger);
        self.run(move |store| {
            store.transaction(|tx| {
                let hash = StringHash::of(&value);
                let index = assign_string_index(tx, &report, day_index, string_buffer_max, &hash)?;

                let list_index = match index {
                    StringIndex::Existing(i) | StringIndex::New(i) => i,
                    StringIndex::Full => {
                        tracing::warn!(
                            "Dropping string for report {}, exceeding string_buffer_max {}",
                            report,
                            string_buffer_max
                        );
                        operation_logger
                            .record_string_buffer_max_exceeded(report.metric_id, report.report_id);
                        return Ok(());
                    }
                };

                let stored = aggregate_report_all(
                    tx,
                    &report,
                    day_index,
                    &system_profile,
                    &event_vector,
                    event_vector_buffer_max,
                    Occurrence::StringIndex(list_index),
                )?;

                // Only keep a new index if an aggregate now refers to it
                if stored && matches!(index, StringIndex::New(_)) {
                    tx.insert_string_hash(&report, day_index, list_index, &hash)?;
                }
                Ok(())
            })
        })
        .await
    }

    // ==================== Observation Generation ====================

    /// Generate and queue observations for every outstanding day of a report.
    ///
    /// A report without bookkeeping is marked as sent through
    /// `most_recent_day_index` and owes no history. Otherwise each day from
    /// `max(last_sent + 1, day_index_enabled, most_recent - max_backfill + 1)`
    /// through `most_recent_day_index` is handed to the generator returned by
    /// `generator_supplier`, oldest first. Days before that window are never
    /// generated. Returns the number of batches queued.
    ///
    /// Each day's batches are queued in the same transaction that advances the
    /// report to that day, and only if no other invocation advanced it since it
    /// was read. A losing invocation stops without queuing anything more. A
    /// generator failure stops the pass at the failing day, which is retried on
    /// the next run.
    pub async fn generate_observations<S, G>(
        &self,
        report: ReportKey,
        most_recent_day_index: DayIndex,
        day_index_enabled: DayIndex,
        mut generator_supplier: S,
    ) -> StorageResult<usize>
    where
        S: FnMut(DayIndex) -> G + Send + 'static,
        G: ObservationGenerator,
    {
        let max_backfill_days = self.config.max_backfill_days;
        self.run(move |store| {
            let first_day = store.transaction(|tx| match tx.last_sent_day_index(&report)? {
                None => {
                    tx.insert_report_if_absent(&report, most_recent_day_index)?;
                    Ok(None)
                }
                Some(last_sent) => Ok(Some((
                    last_sent,
                    first_day_to_generate(
                        last_sent,
                        most_recent_day_index,
                        day_index_enabled,
                        max_backfill_days,
                    ),
                ))),
            })?;

            let Some((mut last_sent, first_day)) = first_day else {
                tracing::debug!(
                    "Report {} has no history, marked sent through day {}",
                    report,
                    most_recent_day_index
                );
                return Ok(0);
            };

            let mut queued = 0;
            for day_index in first_day..=most_recent_day_index {
                let records =
                    store.transaction(|tx| tx.event_records_for_day(&report, day_index))?;
                let events = group_by_profile(records);

                let generator = generator_supplier(day_index);
                let batches = generator
                    .generate_observations(day_index, &events)
                    .map_err(|e| StorageError::Generator {
                        day_index,
                        reason: e.to_string(),
                    })?;

                let claimed = store.transaction(|tx| {
                    if !tx.advance_last_sent_day_index(&report, last_sent, day_index)? {
                        return Ok(false);
                    }
                    tx.insert_observation_batches(&batches)?;
                    Ok(true)
                })?;
                if !claimed {
                    tracing::debug!(
                        "Report {} advanced past day {} concurrently, stopping",
                        report,
                        last_sent
                    );
                    return Ok(queued);
                }

                let observations: usize = batches.iter().map(|b| b.observation_count()).sum();
                tracing::info!(
                    "Generated {} observations in {} batches for day {} of report {}",
                    observations,
                    batches.len(),
                    day_index,
                    report
                );
                last_sent = day_index;
                queued += batches.len();
            }

            // TODO: surface days skipped because they fell before the backfill window
            if last_sent < most_recent_day_index {
                store.transaction(|tx| {
                    tx.advance_last_sent_day_index(&report, last_sent, most_recent_day_index)
                })?;
            }

            Ok(queued)
        })
        .await
    }

    /// Last day observations were generated for, if the report is known
    pub async fn last_sent_day_index(&self, report: ReportKey) -> StorageResult<Option<DayIndex>> {
        self.run(move |store| store.transaction(|tx| tx.last_sent_day_index(&report)))
            .await
    }

    // ==================== Cleanup ====================

    /// Delete data that is no longer needed.
    ///
    /// Removes aggregates and string hashes before `oldest_day_index_to_keep`,
    /// every report not in `relevant_reports` (with its rows), and finally any
    /// system profile no remaining aggregate references. Queued observation
    /// batches are not pruned here; they leave the queue only through
    /// `remove_sent_observations`.
    pub async fn cleanup(
        &self,
        relevant_reports: Vec<ReportKey>,
        oldest_day_index_to_keep: DayIndex,
    ) -> StorageResult<CleanupSummary> {
        self.run(move |store| {
            store.transaction(|tx| {
                let relevant: HashSet<ReportKey> = relevant_reports.into_iter().collect();
                let irrelevant: Vec<ReportKey> = tx
                    .report_keys()?
                    .into_iter()
                    .filter(|r| !relevant.contains(r))
                    .collect();

                let summary = CleanupSummary {
                    old_aggregates: tx.delete_aggregates_before(oldest_day_index_to_keep)?,
                    old_string_hashes: tx.delete_string_hashes_before(oldest_day_index_to_keep)?,
                    reports: tx.delete_reports(&irrelevant)?,
                    system_profiles: tx.delete_unused_system_profiles()?,
                };

                tracing::info!(
                    "Cleanup before day {}: {} aggregates, {} strings, {} reports, {} profiles",
                    oldest_day_index_to_keep,
                    summary.old_aggregates,
                    summary.old_string_hashes,
                    summary.reports,
                    summary.system_profiles
                );
                Ok(summary)
            })
        })
        .await
    }

    // ==================== Observation Queue ====================

    /// Queued observation batches, oldest first
    pub async fn oldest_observations(&self, limit: usize) -> StorageResult<Vec<QueuedObservation>> {
        self.run(move |store| store.transaction(|tx| tx.oldest_observations(limit)))
            .await
    }

    /// Drop batches that were uploaded
    pub async fn remove_sent_observations(&self, ids: Vec<i64>) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(move |store| store.transaction(|tx| tx.delete_observations(&ids)))
            .await
    }

    // ==================== Inspection ====================

    pub async fn stats(&self) -> StorageResult<StoreStats> {
        self.run(|store| store.transaction(|tx| tx.stats())).await
    }

    pub async fn aggregate_rows(&self) -> StorageResult<Vec<AggregateRow>> {
        self.run(|store| store.transaction(|tx| tx.aggregate_rows()))
            .await
    }
}

fn time_to_db_string(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn time_from_db_string(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!("Ignoring unparseable stored time {:?}: {}", s, e);
            None
        }
    }
}

fn logger_enabled_tx(
    tx: &StoreTx<'_>,
    now: DateTime<Utc>,
    disabled_reset: Duration,
) -> StorageResult<DateTime<Utc>> {
    let values = tx.global_values()?;
    let mut enabled_time = values
        .get(&GlobalKey::InitialEnabledTime)
        .and_then(|s| time_from_db_string(s));

    if let Some(disabled) = values.get(&GlobalKey::InitialDisabledTime) {
        let disabled_too_long = time_from_db_string(disabled)
            .map_or(true, |disabled_time| now - disabled_time > disabled_reset);
        if disabled_too_long {
            enabled_time = None;
        }
        tx.delete_global_value(GlobalKey::InitialDisabledTime)?;
    }

    match enabled_time {
        Some(t) => Ok(t),
        None => {
            tx.upsert_global_value(GlobalKey::InitialEnabledTime, &time_to_db_string(now))?;
            Ok(now)
        }
    }
}

/// Insert-or-combine one occurrence under the report-all profile policy.
///
/// Returns whether a row was written; false means the event-vector gate
/// dropped it.
fn aggregate_report_all(
    tx: &StoreTx<'_>,
    report: &ReportKey,
    day_index: DayIndex,
    system_profile: &SystemProfile,
    event_vector: &EventVector,
    event_vector_buffer_max: u64,
    occurrence: Occurrence,
) -> StorageResult<bool> {
    let hash = system_profile.content_hash()?;
    tx.insert_system_profile(hash, system_profile)?;
    tx.insert_report_if_absent(report, day_index.saturating_sub(1))?;

    match tx.aggregate_value_bytes(report, day_index, event_vector, hash)? {
        Some(bytes) => {
            let existing = match AggregateValue::from_bytes(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(
                        "Replacing undecodable aggregate for report {} day {}: {}",
                        report,
                        day_index,
                        e
                    );
                    None
                }
            };
            let value = combine(existing.as_ref(), occurrence);
            tx.update_aggregate(report, day_index, event_vector, hash, &value)?;
            Ok(true)
        }
        None => {
            if !can_add_event_vector(tx, report, day_index, hash, event_vector_buffer_max)? {
                return Ok(false);
            }
            tx.insert_aggregate(
                report,
                day_index,
                event_vector,
                hash,
                &initial_value(occurrence),
            )?;
            Ok(true)
        }
    }
}

fn first_day_to_generate(
    last_sent: DayIndex,
    most_recent: DayIndex,
    day_index_enabled: DayIndex,
    max_backfill_days: u32,
) -> DayIndex {
    let window_start = most_recent.saturating_sub(max_backfill_days.max(1) - 1);
    last_sent
        .saturating_add(1)
        .max(day_index_enabled)
        .max(window_start)
}
