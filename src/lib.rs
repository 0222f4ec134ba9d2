//! # Cobalt Store
//!
//! On-device aggregation store for privacy-preserving telemetry. Events are
//! folded into per-day aggregates, turned into observations once a day is
//! complete, and dropped after a retention horizon.
//!
//! ## Features
//!
//! - **Bounded aggregation**: counters and string histograms with per-day
//!   capacity limits on distinct event vectors and strings
//! - **Backfill**: missed days are generated on the next run, up to a window
//! - **Atomicity**: every operation is one SQLite transaction
//! - **Enablement tracking**: logging sessions survive short disables
//!
//! ## Modules
//!
//! - [`storage`]: SQLite tables and composite-key operations
//! - [`aggregation`]: combine functions and capacity gates
//! - [`data`]: the transactional [`DataService`]
//! - [`logger`]: the [`CobaltLogger`] facade over a [`Registry`]
//! - [`periodic`]: the daily generation and cleanup job
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cobalt_store::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Store::open(std::path::Path::new("./cobalt.db"))?);
//!     let data_service = Arc::new(DataService::new(store, Arc::new(NoOpOperationLogger)));
//!
//!     let registry: Registry = r#"
//!         [[metrics]]
//!         customer_id = 1
//!         project_id = 1
//!         id = 1
//!         metric_type = "occurrence"
//!
//!         [[metrics.reports]]
//!         id = 1
//!         report_type = "fleetwide_occurrence_counts"
//!     "#
//!     .parse()?;
//!     let registry = Arc::new(registry);
//!
//!     let enabled = EnabledFlag::new(true);
//!     let logger = CobaltLogger::new(
//!         1,
//!         1,
//!         Arc::clone(&registry),
//!         Arc::clone(&data_service),
//!         Arc::new(SystemClock),
//!         enabled.clone(),
//!     );
//!     logger.log_occurrence(1, 1, &[3, 4]).await?;
//!
//!     let job = PeriodicJob::new(
//!         data_service,
//!         registry,
//!         Arc::new(NonPrivateGeneratorFactory),
//!         Arc::new(SystemClock),
//!         enabled,
//!         PeriodicJobConfig::default(),
//!     );
//!     let summary = job.generate_aggregated_observations().await?;
//!     println!("{} batches queued", summary.batches_queued);
//!
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod data;
pub mod logger;
pub mod observation;
pub mod operations;
pub mod periodic;
pub mod registry;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    AggregateRow, AggregateValue, DayIndex, EventRecord, EventVector, ObservationBatch,
    ObservationMetadata, QueuedObservation, ReportKey, StorageError, StorageResult, Store,
    StoreStats, SystemProfile,
};

pub use aggregation::{combine, Occurrence};

pub use clock::{day_index, Clock, FakeClock, SystemClock};

pub use data::{CleanupSummary, DataService, DataServiceConfig};

pub use observation::{
    EventRecordsByProfile, GeneratorError, NonPrivateGenerator, ObservationGenerator,
};

pub use operations::{CountingOperationLogger, NoOpOperationLogger, OperationLogger};

pub use registry::{
    MetricDefinition, MetricType, Registry, RegistryError, ReleaseStage, ReportDefinition,
    ReportType,
};

pub use logger::{CobaltLogger, EnabledFlag, LogError};

pub use periodic::{
    GeneratorFactory, JobSummary, NonPrivateGeneratorFactory, PeriodicJob, PeriodicJobConfig,
};

pub use config::{
    AggregationConfig, Config, ConfigError, LoggingConfig, RegistryConfig, StorageConfig,
};
