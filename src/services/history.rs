//! Session history fed by the push channel.
//!
//! Events and schedule echoes are appended as they arrive. Scale samples are
//! identified by (scale, CreatedOn) and a sample already seen is dropped.

use crate::models::feeder::{HistoryData, MachineStatus, PushMessage, Scale, ScaleData};
use crate::notify::Channel;
use log::{debug, warn};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IngestOutcome {
    pub status: Option<MachineStatus>,
    pub events: usize,
    pub samples: usize,
    pub duplicate_samples: usize,
    pub schedules: usize,
    /// The delta holds a Feed, MissedFeed or SkippedFeed event.
    pub feeding_event: bool,
}

pub struct HistoryIngestor {
    history: HistoryData,
    seen_samples: HashSet<(Scale, i64)>,
    delta: Channel<HistoryData>,
}

impl Default for HistoryIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryIngestor {
    pub fn new() -> Self {
        HistoryIngestor {
            history: HistoryData::default(),
            seen_samples: HashSet::new(),
            delta: Channel::new("history.delta"),
        }
    }

    pub fn history(&self) -> &HistoryData {
        &self.history
    }

    /// Accepted part of every non-empty history delta.
    pub fn delta(&self) -> &Channel<HistoryData> {
        &self.delta
    }

    pub fn ingest_text(&mut self, text: &str) -> Result<IngestOutcome, serde_json::Error> {
        let message: PushMessage = serde_json::from_str(text).inspect_err(|e| warn!("Dropping push message: {}", e))?;
        Ok(self.ingest(message))
    }

    pub fn ingest(&mut self, message: PushMessage) -> IngestOutcome {
        let mut outcome = IngestOutcome {
            status: message.status,
            ..IngestOutcome::default()
        };
        let Some(incoming) = message.history else {
            return outcome;
        };

        let mut accepted = HistoryData {
            events: incoming.events,
            schedules: incoming.schedules,
            scale_data: Vec::new(),
        };
        for sample in incoming.scale_data {
            if self.seen_samples.insert(sample.identity()) {
                accepted.scale_data.push(sample);
            } else {
                outcome.duplicate_samples += 1;
            }
        }

        outcome.events = accepted.events.len();
        outcome.samples = accepted.scale_data.len();
        outcome.schedules = accepted.schedules.len();
        outcome.feeding_event = accepted.events.iter().any(|e| e.kind.is_feeding());
        debug!(
            "Ingested {} event(s), {} sample(s) ({} duplicate), {} schedule echo(es)",
            outcome.events, outcome.samples, outcome.duplicate_samples, outcome.schedules
        );

        if accepted.is_empty() {
            return outcome;
        }
        self.history.events.extend(accepted.events.iter().cloned());
        self.history.scale_data.extend(accepted.scale_data.iter().cloned());
        self.history.schedules.extend(accepted.schedules.iter().cloned());
        self.delta.publish(accepted);
        outcome
    }

    /// (CreatedOn, Value) points of one scale, in arrival order.
    pub fn scale_series(&self, scale: Scale) -> Vec<(i64, f64)> {
        self.history
            .scale_data
            .iter()
            .filter(|d| d.scale == scale)
            .map(|d: &ScaleData| (d.created_on, d.value))
            .collect()
    }
}
