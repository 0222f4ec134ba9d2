//! Periodic Job
//!
//! Once per interval: record enablement, generate observations for every
//! report of the registry up to the most recently completed day, then clean
//! up data past retention.

use crate::clock::{day_index, Clock};
use crate::data::{CleanupSummary, DataService};
use crate::logger::EnabledFlag;
use crate::observation::{NonPrivateGenerator, ObservationGenerator};
use crate::registry::{Registry, ReportType};
use crate::storage::{DayIndex, ReportKey, StorageResult};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Builds the observation generator for a report and day
pub trait GeneratorFactory: Send + Sync {
    /// Whether reports of this type can be generated at all
    fn supports(&self, report_type: ReportType) -> bool;

    fn generator(
        &self,
        report: ReportKey,
        report_type: ReportType,
        day_index: DayIndex,
    ) -> Box<dyn ObservationGenerator>;
}

/// Emits every supported report without a privacy mechanism
#[derive(Debug, Clone, Copy, Default)]
pub struct NonPrivateGeneratorFactory;

impl GeneratorFactory for NonPrivateGeneratorFactory {
    fn supports(&self, report_type: ReportType) -> bool {
        matches!(
            report_type,
            ReportType::FleetwideOccurrenceCounts | ReportType::StringCounts
        )
    }

    fn generator(
        &self,
        report: ReportKey,
        _report_type: ReportType,
        _day_index: DayIndex,
    ) -> Box<dyn ObservationGenerator> {
        Box::new(NonPrivateGenerator::new(report))
    }
}

/// Configuration for the periodic job
#[derive(Debug, Clone)]
pub struct PeriodicJobConfig {
    /// Days of aggregates kept, counting the most recent completed day
    pub retention_days: u32,
    /// Reports never generated by this job
    pub ignored_reports: HashSet<ReportKey>,
}

impl Default for PeriodicJobConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            ignored_reports: HashSet::new(),
        }
    }
}

/// Outcome of one job run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// False when the run only recorded that logging is disabled
    pub enabled: bool,
    pub most_recent_day_index: Option<DayIndex>,
    pub reports_processed: usize,
    /// Reports with no generator for their type, or ignored
    pub reports_skipped: usize,
    /// Reports whose generation failed; retried next run
    pub reports_failed: usize,
    /// Batches generated by this run
    pub batches_generated: usize,
    /// Batches waiting for upload after this run
    pub batches_queued: u64,
    pub cleanup: Option<CleanupSummary>,
}

/// Drives observation generation and cleanup
pub struct PeriodicJob {
    data_service: Arc<DataService>,
    registry: Arc<Registry>,
    factory: Arc<dyn GeneratorFactory>,
    clock: Arc<dyn Clock>,
    enabled: EnabledFlag,
    config: PeriodicJobConfig,
}

impl PeriodicJob {
    pub fn new(
        data_service: Arc<DataService>,
        registry: Arc<Registry>,
        factory: Arc<dyn GeneratorFactory>,
        clock: Arc<dyn Clock>,
        enabled: EnabledFlag,
        config: PeriodicJobConfig,
    ) -> Self {
        Self {
            data_service,
            registry,
            factory,
            clock,
            enabled,
            config,
        }
    }

    /// Run one pass of generation and cleanup
    pub async fn generate_aggregated_observations(&self) -> StorageResult<JobSummary> {
        let now = self.clock.now();

        if !self.enabled.is_enabled() {
            self.data_service.logger_disabled(now).await?;
            tracing::info!("Logging disabled, skipping observation generation");
            return Ok(JobSummary::default());
        }

        let enabled_time = self.data_service.logger_enabled(now).await?;
        let day_index_enabled = day_index(enabled_time);
        let Some(most_recent_day_index) = day_index(now).checked_sub(1) else {
            return Ok(JobSummary {
                enabled: true,
                ..JobSummary::default()
            });
        };

        let mut summary = JobSummary {
            enabled: true,
            most_recent_day_index: Some(most_recent_day_index),
            ..JobSummary::default()
        };

        for (report, definition) in self.registry.reports() {
            let report_type = definition.report_type;
            if self.config.ignored_reports.contains(&report)
                || !self.factory.supports(report_type)
            {
                summary.reports_skipped += 1;
                continue;
            }

            let factory = Arc::clone(&self.factory);
            let result = self
                .data_service
                .generate_observations(
                    report,
                    most_recent_day_index,
                    day_index_enabled,
                    move |day| factory.generator(report, report_type, day),
                )
                .await;

            match result {
                Ok(batches) => {
                    summary.reports_processed += 1;
                    summary.batches_generated += batches;
                }
                Err(e) => {
                    tracing::error!(report = %report, error = %e, "Observation generation failed");
                    summary.reports_failed += 1;
                }
            }
        }

        let oldest_day_index_to_keep =
            most_recent_day_index.saturating_sub(self.config.retention_days.saturating_sub(1));
        summary.cleanup = Some(
            self.data_service
                .cleanup(self.registry.report_keys(), oldest_day_index_to_keep)
                .await?,
        );
        summary.batches_queued = self.data_service.stats().await?.observation_batches;

        tracing::info!(
            processed = summary.reports_processed,
            skipped = summary.reports_skipped,
            failed = summary.reports_failed,
            batches = summary.batches_generated,
            queued = summary.batches_queued,
            "Periodic job completed"
        );
        Ok(summary)
    }

    /// Run the job every `interval` until `shutdown` resolves.
    ///
    /// Failed runs are logged and retried on the next tick.
    pub fn spawn<F>(self: Arc<Self>, interval: std::time::Duration, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(interval_secs = interval.as_secs(), "Starting periodic job");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::info!("Periodic job stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.generate_aggregated_observations().await {
                            tracing::error!(error = %e, "Periodic job failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::observation::{EventRecordsByProfile, GeneratorError};
    use crate::operations::NoOpOperationLogger;
    use crate::storage::{EventVector, GlobalKey, ObservationBatch, Store, SystemProfile};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex;

    const REGISTRY: &str = r#"
        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 10
        metric_type = "occurrence"

        [[metrics.reports]]
        id = 1
        report_type = "fleetwide_occurrence_counts"

        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 20
        metric_type = "string_count"

        [[metrics.reports]]
        id = 1
        report_type = "string_counts"
    "#;

    const OCCURRENCE_REPORT: ReportKey = ReportKey {
        customer_id: 1,
        project_id: 2,
        metric_id: 10,
        report_id: 1,
    };

    const STRING_REPORT: ReportKey = ReportKey {
        customer_id: 1,
        project_id: 2,
        metric_id: 20,
        report_id: 1,
    };

    // 2022-07-28, day 19201
    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2022-07-28T14:15:30Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    const TODAY: DayIndex = 19201;

    /// Records (report, day) for every generator built
    #[derive(Default)]
    struct RecordingFactory {
        calls: Arc<Mutex<Vec<(ReportKey, DayIndex)>>>,
        failing: HashSet<ReportKey>,
    }

    struct RecordingGenerator {
        report: ReportKey,
        calls: Arc<Mutex<Vec<(ReportKey, DayIndex)>>>,
        fail: bool,
    }

    impl ObservationGenerator for RecordingGenerator {
        fn generate_observations(
            &self,
            day_index: DayIndex,
            events: &EventRecordsByProfile,
        ) -> Result<Vec<ObservationBatch>, GeneratorError> {
            self.calls.lock().unwrap().push((self.report, day_index));
            if self.fail {
                return Err(GeneratorError("boom".to_string()));
            }
            NonPrivateGenerator::new(self.report).generate_observations(day_index, events)
        }
    }

    impl GeneratorFactory for RecordingFactory {
        fn supports(&self, report_type: ReportType) -> bool {
            report_type == ReportType::FleetwideOccurrenceCounts
        }

        fn generator(
            &self,
            report: ReportKey,
            _report_type: ReportType,
            _day_index: DayIndex,
        ) -> Box<dyn ObservationGenerator> {
            Box::new(RecordingGenerator {
                report,
                calls: Arc::clone(&self.calls),
                fail: self.failing.contains(&report),
            })
        }
    }

    struct Fixture {
        data_service: Arc<DataService>,
        clock: Arc<FakeClock>,
        enabled: EnabledFlag,
        calls: Arc<Mutex<Vec<(ReportKey, DayIndex)>>>,
        job: PeriodicJob,
    }

    fn fixture_with(factory: RecordingFactory, config: PeriodicJobConfig) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let data_service = Arc::new(DataService::new(store, Arc::new(NoOpOperationLogger)));
        let clock = Arc::new(FakeClock::new(now()));
        let enabled = EnabledFlag::new(true);
        let calls = Arc::clone(&factory.calls);
        let job = PeriodicJob::new(
            Arc::clone(&data_service),
            Arc::new(REGISTRY.parse().unwrap()),
            Arc::new(factory),
            clock.clone(),
            enabled.clone(),
            config,
        );
        Fixture {
            data_service,
            clock,
            enabled,
            calls,
            job,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingFactory::default(), PeriodicJobConfig::default())
    }

    #[tokio::test]
    async fn test_first_run_marks_reports_without_backfill() {
        let f = fixture();

        let summary = f.job.generate_aggregated_observations().await.unwrap();

        assert!(summary.enabled);
        assert_eq!(summary.most_recent_day_index, Some(TODAY - 1));
        assert_eq!(summary.reports_processed, 1);
        assert_eq!(summary.reports_skipped, 1);
        assert_eq!(summary.batches_generated, 0);
        assert!(f.calls.lock().unwrap().is_empty());
        assert_eq!(
            f.data_service
                .last_sent_day_index(OCCURRENCE_REPORT)
                .await
                .unwrap(),
            Some(TODAY - 1)
        );
        // Unsupported report types are left alone
        assert_eq!(
            f.data_service
                .last_sent_day_index(STRING_REPORT)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_daily_runs_generate_each_completed_day() {
        let f = fixture();
        f.job.generate_aggregated_observations().await.unwrap();

        f.data_service
            .aggregate_count(
                OCCURRENCE_REPORT,
                TODAY,
                SystemProfile::default(),
                EventVector::new(vec![1]),
                0,
                5,
            )
            .await
            .unwrap();

        f.clock.advance(Duration::days(1));
        let summary = f.job.generate_aggregated_observations().await.unwrap();

        assert_eq!(*f.calls.lock().unwrap(), vec![(OCCURRENCE_REPORT, TODAY)]);
        assert_eq!(summary.batches_generated, 1);
        assert_eq!(summary.batches_queued, 1);

        let queued = f.data_service.oldest_observations(10).await.unwrap();
        assert_eq!(queued[0].batch.metadata.report, OCCURRENCE_REPORT);
        assert_eq!(queued[0].batch.metadata.day_index, TODAY);
    }

    #[tokio::test]
    async fn test_backfill_after_downtime() {
        let f = fixture();
        f.job.generate_aggregated_observations().await.unwrap();

        f.clock.advance(Duration::days(20));
        f.job.generate_aggregated_observations().await.unwrap();

        let days: Vec<DayIndex> = f.calls.lock().unwrap().iter().map(|(_, d)| *d).collect();
        let most_recent = TODAY + 19;
        assert_eq!(days, ((most_recent - 6)..=most_recent).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_disabled_records_time_and_skips() {
        let f = fixture();
        f.enabled.set(false);

        let summary = f.job.generate_aggregated_observations().await.unwrap();

        assert!(!summary.enabled);
        assert!(f.calls.lock().unwrap().is_empty());
        let values = f
            .data_service
            .store()
            .transaction(|tx| tx.global_values())
            .unwrap();
        assert!(values.contains_key(&GlobalKey::InitialDisabledTime));
        assert!(!values.contains_key(&GlobalKey::InitialEnabledTime));
    }

    #[tokio::test]
    async fn test_ignored_reports_skipped() {
        let config = PeriodicJobConfig {
            ignored_reports: [OCCURRENCE_REPORT].into_iter().collect(),
            ..PeriodicJobConfig::default()
        };
        let f = fixture_with(RecordingFactory::default(), config);

        let summary = f.job.generate_aggregated_observations().await.unwrap();

        assert_eq!(summary.reports_processed, 0);
        assert_eq!(summary.reports_skipped, 2);
    }

    #[tokio::test]
    async fn test_failed_report_retried_next_run() {
        let factory = RecordingFactory {
            failing: [OCCURRENCE_REPORT].into_iter().collect(),
            ..RecordingFactory::default()
        };
        let f = fixture_with(factory, PeriodicJobConfig::default());
        f.job.generate_aggregated_observations().await.unwrap();

        f.clock.advance(Duration::days(1));
        let summary = f.job.generate_aggregated_observations().await.unwrap();

        assert_eq!(summary.reports_failed, 1);
        assert!(summary.cleanup.is_some());
        assert_eq!(
            f.data_service
                .last_sent_day_index(OCCURRENCE_REPORT)
                .await
                .unwrap(),
            Some(TODAY - 1)
        );
    }

    #[tokio::test]
    async fn test_cleanup_uses_retention() {
        let config = PeriodicJobConfig {
            retention_days: 2,
            ..PeriodicJobConfig::default()
        };
        let f = fixture_with(RecordingFactory::default(), config);

        for day in [TODAY - 3, TODAY - 2, TODAY - 1] {
            f.data_service
                .aggregate_count(
                    OCCURRENCE_REPORT,
                    day,
                    SystemProfile::default(),
                    EventVector::new(vec![1]),
                    0,
                    1,
                )
                .await
                .unwrap();
        }

        let summary = f.job.generate_aggregated_observations().await.unwrap();

        // Keeps TODAY - 2 and TODAY - 1
        assert_eq!(summary.cleanup.unwrap().old_aggregates, 1);
        let days: Vec<DayIndex> = f
            .data_service
            .aggregate_rows()
            .await
            .unwrap()
            .iter()
            .map(|r| r.day_index)
            .collect();
        assert_eq!(days, vec![TODAY - 2, TODAY - 1]);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let f = fixture();
        let data_service = Arc::clone(&f.data_service);
        let job = Arc::new(f.job);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = job.spawn(std::time::Duration::from_secs(3600), async {
            let _ = rx.await;
        });

        // The first tick fires immediately
        for _ in 0..100 {
            if data_service
                .last_sent_day_index(OCCURRENCE_REPORT)
                .await
                .unwrap()
                .is_some()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            data_service
                .last_sent_day_index(OCCURRENCE_REPORT)
                .await
                .unwrap(),
            Some(TODAY - 1)
        );

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
