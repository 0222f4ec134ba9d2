//! Observation generation interface
//!
//! The privacy encoding of a day's aggregates lives outside this crate. The
//! store hands each day's records to an [`ObservationGenerator`] and queues
//! whatever batches come back.

use crate::storage::{
    AggregateValue, DayIndex, EventRecord, ObservationBatch, ObservationMetadata, ReportKey,
    SystemProfile,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// One day's aggregates for a report, grouped by system profile
pub type EventRecordsByProfile = BTreeMap<SystemProfile, Vec<EventRecord>>;

/// Generator failure; aborts the current generation pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct GeneratorError(pub String);

/// Turns a day's aggregated events into observation batches.
///
/// Called once per day in the backfill window, including days without any
/// events, so schemes that report "no activity" can do so.
pub trait ObservationGenerator: Send {
    fn generate_observations(
        &self,
        day_index: DayIndex,
        events: &EventRecordsByProfile,
    ) -> Result<Vec<ObservationBatch>, GeneratorError>;
}

impl<G: ObservationGenerator + ?Sized> ObservationGenerator for Box<G> {
    fn generate_observations(
        &self,
        day_index: DayIndex,
        events: &EventRecordsByProfile,
    ) -> Result<Vec<ObservationBatch>, GeneratorError> {
        (**self).generate_observations(day_index, events)
    }
}

/// Group joined rows into a profile → records multimap
pub fn group_by_profile(records: Vec<(SystemProfile, EventRecord)>) -> EventRecordsByProfile {
    let mut grouped = EventRecordsByProfile::new();
    for (profile, record) in records {
        grouped.entry(profile).or_default().push(record);
    }
    grouped
}

/// Emits every aggregate as-is, one batch per system profile.
///
/// For reports configured without a privacy mechanism. Days without events
/// produce no batches.
#[derive(Debug, Clone, Copy)]
pub struct NonPrivateGenerator {
    report: ReportKey,
}

impl NonPrivateGenerator {
    pub fn new(report: ReportKey) -> Self {
        Self { report }
    }
}

/// Wire form of a single non-private observation
#[derive(serde::Serialize)]
struct NonPrivateObservation<'a> {
    event_codes: &'a [u32],
    value: &'a AggregateValue,
}

impl ObservationGenerator for NonPrivateGenerator {
    fn generate_observations(
        &self,
        day_index: DayIndex,
        events: &EventRecordsByProfile,
    ) -> Result<Vec<ObservationBatch>, GeneratorError> {
        let mut batches = Vec::with_capacity(events.len());

        for (profile, records) in events {
            let observations = records
                .iter()
                .map(|record| {
                    bincode::serialize(&NonPrivateObservation {
                        event_codes: record.event_vector.codes(),
                        value: &record.aggregate_value,
                    })
                    .map_err(|e| GeneratorError(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            batches.push(ObservationBatch::new(
                ObservationMetadata {
                    report: self.report,
                    day_index,
                    system_profile: Some(profile.clone()),
                },
                observations,
            ));
        }

        Ok(batches)
    }
}
