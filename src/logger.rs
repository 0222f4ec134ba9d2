//! Logger facade
//!
//! Applications log against a metric; the logger fans the event out to each
//! report of that metric the device may collect for, and aggregates it for
//! the current day and system profile.

use crate::clock::{day_index, Clock};
use crate::data::DataService;
use crate::registry::{MetricDefinition, MetricType, Registry, ReleaseStage, ReportDefinition};
use crate::storage::{EventVector, StorageError, SystemProfile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Logging errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log for metric {metric_id}: {reason}")]
    Validation { metric_id: u32, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Whether logging is currently enabled, shared by the logger and the periodic job
#[derive(Debug, Clone)]
pub struct EnabledFlag(Arc<AtomicBool>);

impl EnabledFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

impl Default for EnabledFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Logs events for the metrics of one project
pub struct CobaltLogger {
    customer_id: u32,
    project_id: u32,
    registry: Arc<Registry>,
    data_service: Arc<DataService>,
    clock: Arc<dyn Clock>,
    enabled: EnabledFlag,
    release_stage: ReleaseStage,
    system_profile: SystemProfile,
}

impl CobaltLogger {
    pub fn new(
        customer_id: u32,
        project_id: u32,
        registry: Arc<Registry>,
        data_service: Arc<DataService>,
        clock: Arc<dyn Clock>,
        enabled: EnabledFlag,
    ) -> Self {
        Self {
            customer_id,
            project_id,
            registry,
            data_service,
            clock,
            enabled,
            release_stage: ReleaseStage::Ga,
            system_profile: SystemProfile::default(),
        }
    }

    /// Release stage of the device build
    pub fn with_release_stage(mut self, release_stage: ReleaseStage) -> Self {
        self.release_stage = release_stage;
        self
    }

    /// System profile attached to every logged event
    pub fn with_system_profile(mut self, system_profile: SystemProfile) -> Self {
        self.system_profile = system_profile;
        self
    }

    /// Log `count` occurrences of the event described by `event_codes`
    pub async fn log_occurrence(
        &self,
        metric_id: u32,
        count: i64,
        event_codes: &[i32],
    ) -> Result<(), LogError> {
        let Some(metric) = self.loggable_metric(metric_id, MetricType::Occurrence)? else {
            return Ok(());
        };
        if count < 0 {
            return Err(validation(metric_id, format!("negative count {}", count)));
        }
        let event_vector = event_vector(metric_id, event_codes)?;
        let day = day_index(self.clock.now());

        for report in self.collected_reports(metric) {
            self.data_service
                .aggregate_count(
                    metric.report_key(report),
                    day,
                    self.system_profile.clone(),
                    event_vector.clone(),
                    report.event_vector_buffer_max,
                    count,
                )
                .await?;
        }
        Ok(())
    }

    /// Log one occurrence of `value` for the event described by `event_codes`
    pub async fn log_string(
        &self,
        metric_id: u32,
        value: &str,
        event_codes: &[i32],
    ) -> Result<(), LogError> {
        let Some(metric) = self.loggable_metric(metric_id, MetricType::StringCount)? else {
            return Ok(());
        };
        let event_vector = event_vector(metric_id, event_codes)?;
        let day = day_index(self.clock.now());

        for report in self.collected_reports(metric) {
            self.data_service
                .aggregate_string(
                    metric.report_key(report),
                    day,
                    self.system_profile.clone(),
                    event_vector.clone(),
                    report.event_vector_buffer_max,
                    report.string_buffer_max,
                    value.to_string(),
                )
                .await?;
        }
        Ok(())
    }

    /// The metric to log against, or None if the log should be dropped
    fn loggable_metric(
        &self,
        metric_id: u32,
        expected: MetricType,
    ) -> Result<Option<&MetricDefinition>, LogError> {
        if !self.enabled.is_enabled() {
            tracing::debug!("Logger disabled, dropping log for metric {}", metric_id);
            return Ok(None);
        }

        let Some(metric) = self
            .registry
            .metric(self.customer_id, self.project_id, metric_id)
        else {
            tracing::debug!("Unknown metric {}, dropping log", metric_id);
            return Ok(None);
        };

        if metric.metric_type != expected {
            return Err(validation(
                metric_id,
                format!("metric is {:?}, logged as {:?}", metric.metric_type, expected),
            ));
        }

        if self.release_stage > metric.max_release_stage {
            tracing::debug!(
                "Metric {} not collected at release stage {:?}",
                metric_id,
                self.release_stage
            );
            return Ok(None);
        }

        Ok(Some(metric))
    }

    fn collected_reports<'a>(
        &'a self,
        metric: &'a MetricDefinition,
    ) -> impl Iterator<Item = &'a ReportDefinition> + 'a {
        metric
            .supported_reports()
            .filter(move |r| self.release_stage <= metric.report_release_stage(r))
    }
}

fn validation(metric_id: u32, reason: String) -> LogError {
    LogError::Validation { metric_id, reason }
}

fn event_vector(metric_id: u32, event_codes: &[i32]) -> Result<EventVector, LogError> {
    let codes = event_codes
        .iter()
        .map(|&code| {
            u32::try_from(code)
                .map_err(|_| validation(metric_id, format!("negative event code {}", code)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EventVector::new(codes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::operations::NoOpOperationLogger;
    use crate::storage::{AggregateValue, ReportKey, Store};
    use chrono::{DateTime, Utc};

    const REGISTRY: &str = r#"
        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 10
        metric_type = "occurrence"

        [[metrics.reports]]
        id = 1
        report_type = "fleetwide_occurrence_counts"

        [[metrics.reports]]
        id = 2
        report_type = "fleetwide_occurrence_counts"
        max_release_stage = "dogfood"

        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 20
        metric_type = "string_count"

        [[metrics.reports]]
        id = 1
        report_type = "string_counts"
        string_buffer_max = 1

        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 30
        metric_type = "occurrence"
        max_release_stage = "fishfood"

        [[metrics.reports]]
        id = 1
        report_type = "fleetwide_occurrence_counts"
    "#;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2022-07-28T14:15:30Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    const TODAY: u32 = 19201;

    struct Fixture {
        data_service: Arc<DataService>,
        enabled: EnabledFlag,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(Store::open_in_memory().unwrap());
            Self {
                data_service: Arc::new(DataService::new(store, Arc::new(NoOpOperationLogger))),
                enabled: EnabledFlag::new(true),
            }
        }

        fn logger(&self, release_stage: ReleaseStage) -> CobaltLogger {
            CobaltLogger::new(
                1,
                2,
                Arc::new(REGISTRY.parse().unwrap()),
                Arc::clone(&self.data_service),
                Arc::new(FakeClock::new(now())),
                self.enabled.clone(),
            )
            .with_release_stage(release_stage)
            .with_system_profile(SystemProfile::default().app_version("1.0"))
        }
    }

    #[tokio::test]
    async fn test_log_occurrence_all_reports() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Debug);

        logger.log_occurrence(10, 3, &[1, 2]).await.unwrap();
        logger.log_occurrence(10, 4, &[1, 2]).await.unwrap();

        let rows = fixture.data_service.aggregate_rows().await.unwrap();
        let reports: Vec<ReportKey> = rows.iter().map(|r| r.report).collect();
        assert_eq!(
            reports,
            vec![ReportKey::new(1, 2, 10, 1), ReportKey::new(1, 2, 10, 2)]
        );
        for row in rows {
            assert_eq!(row.day_index, TODAY);
            assert_eq!(row.event_vector, EventVector::new(vec![1, 2]));
            assert_eq!(row.system_profile, SystemProfile::default().app_version("1.0"));
            assert_eq!(row.aggregate_value, AggregateValue::Integer(7));
        }
    }

    #[tokio::test]
    async fn test_log_occurrence_report_in_earlier_stage_skipped() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::OpenBeta);

        logger.log_occurrence(10, 1, &[]).await.unwrap();

        let rows = fixture.data_service.aggregate_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].report, ReportKey::new(1, 2, 10, 1));
    }

    #[tokio::test]
    async fn test_log_occurrence_metric_in_earlier_stage_dropped() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Dogfood);

        logger.log_occurrence(30, 1, &[1]).await.unwrap();

        assert!(fixture.data_service.aggregate_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_disabled_dropped() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Ga);
        fixture.enabled.set(false);

        logger.log_occurrence(10, 1, &[1]).await.unwrap();
        logger.log_string(20, "a", &[1]).await.unwrap();

        assert!(fixture.data_service.aggregate_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_unknown_metric_dropped() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Ga);

        logger.log_occurrence(99, 1, &[1]).await.unwrap();

        assert!(fixture.data_service.aggregate_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_validation_errors() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Ga);

        assert!(matches!(
            logger.log_occurrence(10, -1, &[1]).await,
            Err(LogError::Validation { metric_id: 10, .. })
        ));
        assert!(matches!(
            logger.log_occurrence(10, 1, &[1, -2]).await,
            Err(LogError::Validation { metric_id: 10, .. })
        ));
        assert!(matches!(
            logger.log_string(20, "a", &[-1]).await,
            Err(LogError::Validation { metric_id: 20, .. })
        ));
        // Wrong metric type for the call
        assert!(matches!(
            logger.log_string(10, "a", &[]).await,
            Err(LogError::Validation { metric_id: 10, .. })
        ));
        assert!(matches!(
            logger.log_occurrence(20, 1, &[]).await,
            Err(LogError::Validation { metric_id: 20, .. })
        ));

        assert!(fixture.data_service.aggregate_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_string_uses_report_buffer_max() {
        let fixture = Fixture::new();
        let logger = fixture.logger(ReleaseStage::Ga);

        logger.log_string(20, "a", &[1]).await.unwrap();
        logger.log_string(20, "b", &[1]).await.unwrap();
        logger.log_string(20, "a", &[1]).await.unwrap();

        let rows = fixture.data_service.aggregate_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].aggregate_value,
            AggregateValue::IndexHistogram([(0, 2)].into_iter().collect())
        );
    }
}
