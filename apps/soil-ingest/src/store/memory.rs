//! In-process [`IngestStore`] used by unit tests, with failure injection.

use super::{
    AssignmentRow, FarmRow, GatewayRow, IngestStore, NewReading, NewSensor, ReadingBatch,
    SensorRow,
};
use crate::error::StoreError;
use crate::status::GatewayStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// A `gateway_status_history` row as recorded by the double.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusHistoryRow {
    pub gateway_id: i64,
    pub status: GatewayStatus,
    pub uptime_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    gateways: Vec<GatewayRow>,
    assignments: Vec<AssignmentRow>,
    farms: Vec<FarmRow>,
    sensors: Vec<SensorRow>,
    sensor_data: Vec<NewReading>,
    history: Vec<StatusHistoryRow>,
    fail_reading_at: Option<usize>,
    fail_offline_for: HashSet<i64>,
    fail_lookups: bool,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_gateway(
        &self,
        gateway_uid: &str,
        status: GatewayStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.gateways.push(GatewayRow {
            id,
            gateway_uid: gateway_uid.to_string(),
            status,
            last_seen,
        });
        id
    }

    pub fn add_farm(&self, id: i64, farmer_id: Option<i64>) {
        self.lock().farms.push(FarmRow {
            id,
            farmer_id,
            name: format!("farm-{id}"),
        });
    }

    pub fn add_assignment(
        &self,
        gateway_id: i64,
        farm_id: i64,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        is_active: bool,
    ) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.assignments.push(AssignmentRow {
            id,
            gateway_id,
            farm_id,
            start_date,
            end_date,
            is_active,
        });
        id
    }

    pub fn add_sensor(&self, gateway_id: i64, sensor_uid: &str, sensor_type: &str) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.sensors.push(SensorRow {
            id,
            gateway_id,
            sensor_uid: sensor_uid.to_string(),
            sensor_type: sensor_type.to_string(),
        });
        id
    }

    pub fn set_gateway_status(&self, gateway_id: i64, status: GatewayStatus) {
        let mut state = self.lock();
        if let Some(gateway) = state.gateways.iter_mut().find(|g| g.id == gateway_id) {
            gateway.status = status;
        }
    }

    /// The `position`-th reading (1-based) of the next batches fails.
    pub fn fail_reading_at(&self, position: usize) {
        self.lock().fail_reading_at = Some(position);
    }

    pub fn fail_offline_for(&self, gateway_id: i64) {
        self.lock().fail_offline_for.insert(gateway_id);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.lock().fail_lookups = fail;
    }

    pub fn gateway(&self, gateway_uid: &str) -> Option<GatewayRow> {
        self.lock()
            .gateways
            .iter()
            .find(|g| g.gateway_uid == gateway_uid)
            .cloned()
    }

    pub fn sensors(&self) -> Vec<SensorRow> {
        self.lock().sensors.clone()
    }

    pub fn readings(&self) -> Vec<NewReading> {
        self.lock().sensor_data.clone()
    }

    pub fn history(&self) -> Vec<StatusHistoryRow> {
        self.lock().history.clone()
    }

    pub fn push_reading(&self, gateway_id: i64, timestamp: DateTime<Utc>) {
        self.lock().sensor_data.push(NewReading {
            sensor_id: 0,
            gateway_id,
            value: 0.0,
            unit: String::new(),
            metadata: serde_json::Value::Null,
            timestamp,
        });
    }

    fn check_lookups(&self) -> Result<(), StoreError> {
        if self.lock().fail_lookups {
            return Err(StoreError::Injected("lookup failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn find_gateway(&self, gateway_uid: &str) -> Result<Option<GatewayRow>, StoreError> {
        self.check_lookups()?;
        Ok(self.gateway(gateway_uid))
    }

    async fn flagged_assignments(
        &self,
        gateway_id: i64,
    ) -> Result<Vec<AssignmentRow>, StoreError> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.gateway_id == gateway_id && a.is_active)
            .cloned()
            .collect())
    }

    async fn find_farm(&self, farm_id: i64) -> Result<Option<FarmRow>, StoreError> {
        Ok(self.lock().farms.iter().find(|f| f.id == farm_id).cloned())
    }

    async fn find_sensor(&self, sensor_uid: &str) -> Result<Option<SensorRow>, StoreError> {
        Ok(self
            .lock()
            .sensors
            .iter()
            .find(|s| s.sensor_uid == sensor_uid)
            .cloned())
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<SensorRow, StoreError> {
        let mut state = self.lock();
        if let Some(existing) = state
            .sensors
            .iter()
            .find(|s| s.sensor_uid == sensor.sensor_uid)
        {
            return Ok(existing.clone());
        }
        let row = SensorRow {
            id: state.next_id(),
            gateway_id: sensor.gateway_id,
            sensor_uid: sensor.sensor_uid.clone(),
            sensor_type: sensor.sensor_type.clone(),
        };
        state.sensors.push(row.clone());
        Ok(row)
    }

    async fn persist_readings(&self, batch: &ReadingBatch) -> Result<u64, StoreError> {
        let mut state = self.lock();

        let mut staged = Vec::with_capacity(batch.readings.len());
        for (index, reading) in batch.readings.iter().enumerate() {
            if state.fail_reading_at == Some(index + 1) {
                return Err(StoreError::Injected(format!(
                    "insert of reading {} failed",
                    index + 1
                )));
            }
            staged.push(reading.clone());
        }

        let Some(position) = state.gateways.iter().position(|g| g.id == batch.gateway_id) else {
            return Err(StoreError::Integrity(format!(
                "gateway {} does not exist",
                batch.gateway_id
            )));
        };

        if let Some(uptime) = batch.online_uptime {
            state.history.push(StatusHistoryRow {
                gateway_id: batch.gateway_id,
                status: GatewayStatus::Online,
                uptime_seconds: Some(uptime),
                created_at: batch.seen_at,
            });
        }
        let inserted = staged.len() as u64;
        state.sensor_data.extend(staged);
        let gateway = &mut state.gateways[position];
        gateway.status = GatewayStatus::Online;
        gateway.last_seen = Some(batch.seen_at);
        Ok(inserted)
    }

    async fn stale_gateways(&self, cutoff: DateTime<Utc>) -> Result<Vec<GatewayRow>, StoreError> {
        Ok(self
            .lock()
            .gateways
            .iter()
            .filter(|g| is_stale(g, cutoff))
            .cloned()
            .collect())
    }

    async fn mark_gateway_offline(
        &self,
        gateway_id: i64,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.fail_offline_for.contains(&gateway_id) {
            return Err(StoreError::Injected(format!(
                "offline update for gateway {gateway_id} failed"
            )));
        }
        let Some(gateway) = state
            .gateways
            .iter_mut()
            .find(|g| g.id == gateway_id && is_stale(g, cutoff))
        else {
            return Ok(false);
        };
        gateway.status = GatewayStatus::Offline;
        state.history.push(StatusHistoryRow {
            gateway_id,
            status: GatewayStatus::Offline,
            uptime_seconds: None,
            created_at: at,
        });
        Ok(true)
    }

    async fn observation_times(
        &self,
        gateway_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let mut times: Vec<_> = self
            .lock()
            .sensor_data
            .iter()
            .filter(|r| r.gateway_id == gateway_id && r.timestamp >= since)
            .map(|r| r.timestamp)
            .collect();
        times.sort_unstable();
        Ok(times)
    }
}

fn is_stale(gateway: &GatewayRow, cutoff: DateTime<Utc>) -> bool {
    !matches!(
        gateway.status,
        GatewayStatus::Offline | GatewayStatus::Maintenance
    ) && gateway.last_seen.map_or(true, |seen| seen < cutoff)
}
