use crate::ingest::{DiscardReason, IngestOutcome};
use crate::scheduler::ScheduledJob;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub persisted_messages: AtomicU64,
    pub persisted_readings: AtomicU64,
    pub sensors_created: AtomicU64,
    pub status_transitions: AtomicU64,
    pub discarded_invalid_json: AtomicU64,
    pub discarded_topic: AtomicU64,
    pub discarded_unknown_gateway: AtomicU64,
    pub discarded_unassigned: AtomicU64,
    pub discarded_empty: AtomicU64,
    pub storage_failures: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub persisted_messages: u64,
    pub persisted_readings: u64,
    pub sensors_created: u64,
    pub status_transitions: u64,
    pub discarded: u64,
    pub storage_failures: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Persisted {
                readings,
                sensor_created,
                status_recorded,
            } => {
                self.persisted_messages.fetch_add(1, Ordering::Relaxed);
                self.persisted_readings.fetch_add(*readings, Ordering::Relaxed);
                if *sensor_created {
                    self.sensors_created.fetch_add(1, Ordering::Relaxed);
                }
                if *status_recorded {
                    self.status_transitions.fetch_add(1, Ordering::Relaxed);
                }
                self.clear_error();
            }
            IngestOutcome::Discarded(reason) => {
                self.discard_counter(*reason).fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Failed(err) => {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                self.record_error(err.to_string());
            }
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    fn discard_counter(&self, reason: DiscardReason) -> &AtomicU64 {
        match reason {
            DiscardReason::InvalidJson => &self.discarded_invalid_json,
            DiscardReason::TopicMismatch => &self.discarded_topic,
            DiscardReason::UnknownGateway => &self.discarded_unknown_gateway,
            DiscardReason::NoActiveAssignment => &self.discarded_unassigned,
            DiscardReason::NoReadings => &self.discarded_empty,
        }
    }

    pub fn discarded(&self, reason: DiscardReason) -> u64 {
        self.discard_counter(reason).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let discarded = [
            DiscardReason::InvalidJson,
            DiscardReason::TopicMismatch,
            DiscardReason::UnknownGateway,
            DiscardReason::NoActiveAssignment,
            DiscardReason::NoReadings,
        ]
        .into_iter()
        .map(|reason| self.discarded(reason))
        .sum();
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted_messages: self.persisted_messages.load(Ordering::Relaxed),
            persisted_readings: self.persisted_readings.load(Ordering::Relaxed),
            sensors_created: self.sensors_created.load(Ordering::Relaxed),
            status_transitions: self.status_transitions.load(Ordering::Relaxed),
            discarded,
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// Periodically logs the ingest counters.
pub struct StatsReporter {
    stats: Arc<IngestStats>,
}

impl StatsReporter {
    pub fn new(stats: Arc<IngestStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl ScheduledJob for StatsReporter {
    fn name(&self) -> &'static str {
        "stats-reporter"
    }

    async fn run(&self) {
        let snapshot = self.stats.snapshot();
        tracing::info!(
            received = snapshot.received,
            persisted_messages = snapshot.persisted_messages,
            persisted_readings = snapshot.persisted_readings,
            sensors_created = snapshot.sensors_created,
            discarded = snapshot.discarded,
            storage_failures = snapshot.storage_failures,
            mqtt_connected = snapshot.mqtt_connected,
            "ingest stats"
        );
    }
}
