mod ingestor;
mod topic;


pub use topic::subscription_filter;

use crate::assignment::AssignmentResolver;
use crate::error::StoreError;
use crate::stats::IngestStats;
use crate::store::IngestStore;
use std::sync::Arc;

const METADATA_SOURCE: &str = "mqtt";

/// Routes device messages from the transport into storage.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn IngestStore>,
    resolver: AssignmentResolver,
    namespace: String,
    stats: Arc<IngestStats>,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Persisted {
        readings: u64,
        sensor_created: bool,
        status_recorded: bool,
    },
    Discarded(DiscardReason),
    /// The message transaction was rolled back.
    Failed(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    InvalidJson,
    TopicMismatch,
    UnknownGateway,
    NoActiveAssignment,
    NoReadings,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::InvalidJson => "invalid_json",
            DiscardReason::TopicMismatch => "topic_mismatch",
            DiscardReason::UnknownGateway => "unknown_gateway",
            DiscardReason::NoActiveAssignment => "no_active_assignment",
            DiscardReason::NoReadings => "no_readings",
        }
    }
}
