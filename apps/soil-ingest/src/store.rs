mod postgres;

#[cfg(test)]
pub mod memory;
#[cfg(test)]
mod postgres_tests;

pub use postgres::{build_pool, PostgresStore};

use crate::error::StoreError;
use crate::status::GatewayStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRow {
    pub id: i64,
    pub gateway_uid: String,
    pub status: GatewayStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub id: i64,
    pub gateway_id: i64,
    pub farm_id: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FarmRow {
    pub id: i64,
    pub farmer_id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRow {
    pub id: i64,
    pub gateway_id: i64,
    pub sensor_uid: String,
    pub sensor_type: String,
}

#[derive(Debug, Clone)]
pub struct NewSensor {
    pub gateway_id: i64,
    pub sensor_uid: String,
    pub name: String,
    pub sensor_type: String,
    pub unit: String,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub sensor_id: i64,
    pub gateway_id: i64,
    pub value: f64,
    pub unit: String,
    pub metadata: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Everything one message writes, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct ReadingBatch {
    pub gateway_id: i64,
    pub readings: Vec<NewReading>,
    pub seen_at: DateTime<Utc>,
    /// Device uptime to log as an `online` history entry, set only when the
    /// gateway was not already online.
    pub online_uptime: Option<i64>,
}

/// Storage operations the ingestion core needs from the shared database.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn find_gateway(&self, gateway_uid: &str) -> Result<Option<GatewayRow>, StoreError>;

    /// Assignments of the gateway still flagged `is_active`; expiry is judged
    /// by the caller.
    async fn flagged_assignments(&self, gateway_id: i64)
        -> Result<Vec<AssignmentRow>, StoreError>;

    async fn find_farm(&self, farm_id: i64) -> Result<Option<FarmRow>, StoreError>;

    async fn find_sensor(&self, sensor_uid: &str) -> Result<Option<SensorRow>, StoreError>;

    /// Inserts the sensor, or returns the row another writer created first.
    async fn create_sensor(&self, sensor: &NewSensor) -> Result<SensorRow, StoreError>;

    /// Inserts the readings, the optional `online` history entry and the
    /// gateway `online`/`last_seen` update in a single transaction.
    async fn persist_readings(&self, batch: &ReadingBatch) -> Result<u64, StoreError>;

    /// Gateways neither `offline` nor `maintenance` whose `last_seen` is
    /// before `cutoff` or was never set.
    async fn stale_gateways(&self, cutoff: DateTime<Utc>) -> Result<Vec<GatewayRow>, StoreError>;

    /// Flips one gateway offline and appends its history entry. Returns
    /// `false` when the gateway no longer qualifies.
    async fn mark_gateway_offline(
        &self,
        gateway_id: i64,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Reading timestamps for a gateway since `since`, ascending.
    async fn observation_times(
        &self,
        gateway_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;
}

pub(crate) fn decode_status(gateway_uid: &str, raw: &str) -> Result<GatewayStatus, StoreError> {
    GatewayStatus::parse(raw).ok_or_else(|| {
        StoreError::Integrity(format!("gateway {gateway_uid} has unknown status {raw:?}"))
    })
}
