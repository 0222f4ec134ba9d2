//! Metric registry
//!
//! Static description of the metrics a device logs and the reports computed
//! from them. Loaded from TOML:
//!
//! ```toml
//! [[metrics]]
//! customer_id = 1
//! project_id = 2
//! id = 3
//! metric_type = "occurrence"
//! max_release_stage = "ga"
//!
//! [[metrics.reports]]
//! id = 4
//! report_type = "fleetwide_occurrence_counts"
//! event_vector_buffer_max = 100
//! ```

use crate::storage::ReportKey;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maturity of a metric or device build; later stages are more public
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStage {
    Debug,
    Fishfood,
    Dogfood,
    OpenBeta,
    #[default]
    Ga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Occurrence,
    StringCount,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    FleetwideOccurrenceCounts,
    StringCounts,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportDefinition {
    pub id: u32,
    pub report_type: ReportType,
    /// Distinct event vectors per (day, system profile); 0 is unlimited
    #[serde(default)]
    pub event_vector_buffer_max: u64,
    /// Distinct strings per day; 0 is unlimited
    #[serde(default)]
    pub string_buffer_max: u64,
    /// Latest device release stage the report collects from; unset follows the metric
    #[serde(default)]
    pub max_release_stage: Option<ReleaseStage>,
}

impl ReportDefinition {
    /// Whether this report can aggregate data of `metric_type`
    pub fn accepts(&self, metric_type: MetricType) -> bool {
        matches!(
            (metric_type, self.report_type),
            (MetricType::Occurrence, ReportType::FleetwideOccurrenceCounts)
                | (MetricType::StringCount, ReportType::StringCounts)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricDefinition {
    pub customer_id: u32,
    pub project_id: u32,
    pub id: u32,
    pub metric_type: MetricType,
    /// Latest device release stage the metric is logged on
    #[serde(default)]
    pub max_release_stage: ReleaseStage,
    #[serde(default)]
    pub reports: Vec<ReportDefinition>,
}

impl MetricDefinition {
    pub fn report_key(&self, report: &ReportDefinition) -> ReportKey {
        ReportKey::new(self.customer_id, self.project_id, self.id, report.id)
    }

    /// Whether the client can aggregate `report` for this metric.
    ///
    /// The report type must match the metric type and the report may not
    /// outlive the metric's release stage.
    pub fn supports(&self, report: &ReportDefinition) -> bool {
        report.accepts(self.metric_type)
            && report
                .max_release_stage
                .map_or(true, |stage| stage <= self.max_release_stage)
    }

    /// Latest device release stage `report` collects from
    pub fn report_release_stage(&self, report: &ReportDefinition) -> ReleaseStage {
        report
            .max_release_stage
            .map_or(self.max_release_stage, |stage| stage.min(self.max_release_stage))
    }

    /// Reports the client aggregates for this metric
    pub fn supported_reports(&self) -> impl Iterator<Item = &ReportDefinition> {
        self.reports.iter().filter(move |r| self.supports(r))
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read registry {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse registry: {0}")]
    Parse(String),

    #[error("Duplicate metric {customer_id}/{project_id}/{metric_id}")]
    DuplicateMetric {
        customer_id: u32,
        project_id: u32,
        metric_id: u32,
    },

    #[error("Duplicate report {report_id} in metric {metric_id}")]
    DuplicateReport { metric_id: u32, report_id: u32 },
}

/// Every metric known to the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl Registry {
    pub fn new(metrics: Vec<MetricDefinition>) -> Result<Self, RegistryError> {
        let registry = Self { metrics };
        registry.validate()?;
        Ok(registry)
    }

    /// Load and validate a registry file
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut metric_keys = HashSet::new();
        for metric in &self.metrics {
            if !metric_keys.insert((metric.customer_id, metric.project_id, metric.id)) {
                return Err(RegistryError::DuplicateMetric {
                    customer_id: metric.customer_id,
                    project_id: metric.project_id,
                    metric_id: metric.id,
                });
            }

            let mut report_ids = HashSet::new();
            for report in &metric.reports {
                if !report_ids.insert(report.id) {
                    return Err(RegistryError::DuplicateReport {
                        metric_id: metric.id,
                        report_id: report.id,
                    });
                }
                if !metric.supports(report) {
                    tracing::warn!(
                        "Report {} of metric {} is not supported and will be skipped",
                        report.id,
                        metric.id
                    );
                }
            }
        }
        Ok(())
    }

    pub fn metric(
        &self,
        customer_id: u32,
        project_id: u32,
        metric_id: u32,
    ) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| {
            m.customer_id == customer_id && m.project_id == project_id && m.id == metric_id
        })
    }

    /// Every supported report with its definition
    pub fn reports(&self) -> impl Iterator<Item = (ReportKey, &ReportDefinition)> {
        self.metrics
            .iter()
            .flat_map(|m| m.supported_reports().map(move |r| (m.report_key(r), r)))
    }

    pub fn report_keys(&self) -> Vec<ReportKey> {
        self.reports().map(|(key, _)| key).collect()
    }
}

impl std::str::FromStr for Registry {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let registry: Registry =
            toml::from_str(s).map_err(|e| RegistryError::Parse(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 3
        metric_type = "occurrence"
        max_release_stage = "dogfood"

        [[metrics.reports]]
        id = 4
        report_type = "fleetwide_occurrence_counts"
        event_vector_buffer_max = 100

        [[metrics.reports]]
        id = 5
        report_type = "fleetwide_means"
        max_release_stage = "fishfood"

        [[metrics.reports]]
        id = 8
        report_type = "fleetwide_occurrence_counts"
        max_release_stage = "fishfood"

        [[metrics]]
        customer_id = 1
        project_id = 2
        id = 6
        metric_type = "string_count"

        [[metrics.reports]]
        id = 7
        report_type = "string_counts"
        string_buffer_max = 10
    "#;

    #[test]
    fn test_parse_registry() {
        let registry: Registry = REGISTRY.parse().unwrap();

        let metric = registry.metric(1, 2, 3).unwrap();
        assert_eq!(metric.metric_type, MetricType::Occurrence);
        assert_eq!(metric.max_release_stage, ReleaseStage::Dogfood);
        assert_eq!(metric.reports[0].event_vector_buffer_max, 100);
        assert_eq!(metric.reports[0].max_release_stage, None);
        assert_eq!(
            metric.report_release_stage(&metric.reports[0]),
            ReleaseStage::Dogfood
        );
        assert_eq!(metric.reports[1].report_type, ReportType::Other);
        assert_eq!(
            metric.reports[1].max_release_stage,
            Some(ReleaseStage::Fishfood)
        );

        let strings = registry.metric(1, 2, 6).unwrap();
        assert_eq!(strings.reports[0].string_buffer_max, 10);

        assert!(registry.metric(1, 2, 4).is_none());
    }

    #[test]
    fn test_report_keys() {
        let registry: Registry = REGISTRY.parse().unwrap();
        assert_eq!(
            registry.report_keys(),
            vec![
                ReportKey::new(1, 2, 3, 4),
                ReportKey::new(1, 2, 3, 8),
                ReportKey::new(1, 2, 6, 7),
            ]
        );
    }

    #[test]
    fn test_release_stage_order() {
        assert!(ReleaseStage::Debug < ReleaseStage::Fishfood);
        assert!(ReleaseStage::Fishfood < ReleaseStage::Dogfood);
        assert!(ReleaseStage::Dogfood < ReleaseStage::OpenBeta);
        assert!(ReleaseStage::OpenBeta < ReleaseStage::Ga);
    }

    fn metric(id: u32, metric_type: MetricType, reports: Vec<ReportDefinition>) -> MetricDefinition {
        MetricDefinition {
            customer_id: 1,
            project_id: 1,
            id,
            metric_type,
            max_release_stage: ReleaseStage::Ga,
            reports,
        }
    }

    fn report(id: u32, report_type: ReportType) -> ReportDefinition {
        ReportDefinition {
            id,
            report_type,
            event_vector_buffer_max: 0,
            string_buffer_max: 0,
            max_release_stage: None,
        }
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let result = Registry::new(vec![
            metric(1, MetricType::Occurrence, vec![]),
            metric(1, MetricType::Occurrence, vec![]),
        ]);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateMetric { metric_id: 1, .. })
        ));

        let result = Registry::new(vec![metric(
            1,
            MetricType::Occurrence,
            vec![
                report(2, ReportType::FleetwideOccurrenceCounts),
                report(2, ReportType::FleetwideOccurrenceCounts),
            ],
        )]);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateReport {
                metric_id: 1,
                report_id: 2
            })
        ));
    }

    #[test]
    fn test_supported_reports() {
        let mut occurrence = metric(
            1,
            MetricType::Occurrence,
            vec![
                report(2, ReportType::FleetwideOccurrenceCounts),
                report(3, ReportType::StringCounts),
                report(4, ReportType::Other),
            ],
        );
        let ids: Vec<u32> = occurrence.supported_reports().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);

        // A report may not collect from later stages than its metric
        occurrence.max_release_stage = ReleaseStage::Dogfood;
        assert!(occurrence.supports(&occurrence.reports[0]));
        occurrence.reports[0].max_release_stage = Some(ReleaseStage::Ga);
        assert!(!occurrence.supports(&occurrence.reports[0]));
        occurrence.reports[0].max_release_stage = Some(ReleaseStage::Fishfood);
        assert!(occurrence.supports(&occurrence.reports[0]));
        assert_eq!(
            occurrence.report_release_stage(&occurrence.reports[0]),
            ReleaseStage::Fishfood
        );

        let strings = metric(
            5,
            MetricType::StringCount,
            vec![report(6, ReportType::StringCounts)],
        );
        assert!(strings.supports(&strings.reports[0]));
    }

    #[test]
    fn test_parse_error() {
        let result: Result<Registry, _> = "[[metrics]]\nid = ".parse();
        assert!(matches!(result, Err(RegistryError::Parse(_))));
    }
}
