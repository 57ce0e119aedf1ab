use super::topic::parse_data_topic;
use super::{DiscardReason, IngestOutcome, Ingestor, METADATA_SOURCE};
use crate::assignment::{AssignmentResolver, Resolution, ResolvedAssignment};
use crate::error::StoreError;
use crate::payload::{parse_payload, Reading};
use crate::stats::IngestStats;
use crate::status::GatewayStatus;
use crate::store::{GatewayRow, IngestStore, NewReading, NewSensor, ReadingBatch, SensorRow};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

impl Ingestor {
    pub fn new(
        store: Arc<dyn IngestStore>,
        namespace: impl Into<String>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            resolver: AssignmentResolver::new(store.clone()),
            store,
            namespace: namespace.into(),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn handle_message(&self, topic: &str, payload: &mut [u8]) -> IngestOutcome {
        self.handle_message_at(topic, payload, Utc::now()).await
    }

    /// Processes one message with `now` as the processing instant.
    pub async fn handle_message_at(
        &self,
        topic: &str,
        payload: &mut [u8],
        now: DateTime<Utc>,
    ) -> IngestOutcome {
        self.stats.record_received();
        let outcome = self.process(topic, payload, now).await;
        if let IngestOutcome::Discarded(reason) = &outcome {
            tracing::debug!(
                topic = %topic,
                reason = reason.as_str(),
                "message discarded"
            );
        }
        self.stats.record_outcome(&outcome);
        outcome
    }

    async fn process(&self, topic: &str, payload: &mut [u8], now: DateTime<Utc>) -> IngestOutcome {
        let document = match simd_json::to_borrowed_value(payload) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(
                    topic = %topic,
                    error = %err,
                    "discarding message with invalid JSON"
                );
                return IngestOutcome::Discarded(DiscardReason::InvalidJson);
            }
        };

        let Some(route) = parse_data_topic(&self.namespace, topic) else {
            tracing::warn!(topic = %topic, "discarding message on unexpected topic");
            return IngestOutcome::Discarded(DiscardReason::TopicMismatch);
        };

        let resolved = match self.resolver.resolve(route.gateway_uid, now).await {
            Ok(Resolution::Active(resolved)) => resolved,
            Ok(Resolution::UnknownGateway) => {
                tracing::warn!(
                    gateway = %route.gateway_uid,
                    "gateway is not registered; discarding message"
                );
                return IngestOutcome::Discarded(DiscardReason::UnknownGateway);
            }
            Ok(Resolution::Unassigned(_)) => {
                tracing::warn!(
                    gateway = %route.gateway_uid,
                    "gateway has no active assignment; discarding message"
                );
                return IngestOutcome::Discarded(DiscardReason::NoActiveAssignment);
            }
            Err(err) => {
                tracing::error!(
                    gateway = %route.gateway_uid,
                    error = %err,
                    "failed to resolve gateway assignment"
                );
                return IngestOutcome::Failed(err);
            }
        };

        let parsed = parse_payload(route.gateway_uid, route.sensor_uid, &document, now);
        let Some(first) = parsed.readings.first() else {
            tracing::warn!(
                gateway = %route.gateway_uid,
                sensor = %route.sensor_uid,
                "no readings survived parsing"
            );
            return IngestOutcome::Discarded(DiscardReason::NoReadings);
        };

        let (sensor, sensor_created) =
            match self.resolve_sensor(&resolved.gateway, route.sensor_uid, first).await {
                Ok(found) => found,
                Err(err) => {
                    tracing::error!(
                        sensor = %route.sensor_uid,
                        error = %err,
                        "failed to resolve sensor"
                    );
                    return IngestOutcome::Failed(err);
                }
            };

        let online_uptime = parsed
            .uptime_seconds
            .filter(|_| resolved.gateway.status != GatewayStatus::Online);
        let batch = ReadingBatch {
            gateway_id: resolved.gateway.id,
            readings: parsed
                .readings
                .iter()
                .map(|reading| new_reading(&resolved, &sensor, reading))
                .collect(),
            seen_at: now,
            online_uptime,
        };

        match self.store.persist_readings(&batch).await {
            Ok(readings) => {
                tracing::info!(
                    gateway = %route.gateway_uid,
                    sensor = %route.sensor_uid,
                    readings,
                    farm = resolved.assignment.farm_id,
                    "persisted sensor readings"
                );
                if let Some(uptime) = online_uptime {
                    tracing::info!(
                        gateway = %route.gateway_uid,
                        previous = %resolved.gateway.status,
                        uptime,
                        "gateway came back online"
                    );
                }
                IngestOutcome::Persisted {
                    readings,
                    sensor_created,
                    status_recorded: online_uptime.is_some(),
                }
            }
            Err(err) => {
                tracing::error!(
                    gateway = %route.gateway_uid,
                    sensor = %route.sensor_uid,
                    readings = batch.readings.len(),
                    error = %err,
                    "failed to persist readings; message rolled back"
                );
                IngestOutcome::Failed(err)
            }
        }
    }

    /// Looks the sensor up by uid, registering it under `gateway` on first
    /// sight. An existing binding to another gateway is kept.
    async fn resolve_sensor(
        &self,
        gateway: &GatewayRow,
        sensor_uid: &str,
        first: &Reading,
    ) -> Result<(SensorRow, bool), StoreError> {
        if let Some(sensor) = self.store.find_sensor(sensor_uid).await? {
            if sensor.gateway_id != gateway.id {
                tracing::warn!(
                    sensor = %sensor_uid,
                    bound_gateway = sensor.gateway_id,
                    topic_gateway = gateway.id,
                    "sensor is bound to a different gateway; keeping existing binding"
                );
            }
            return Ok((sensor, false));
        }

        let sensor_type = first.sensor_type;
        let sensor = self
            .store
            .create_sensor(&NewSensor {
                gateway_id: gateway.id,
                sensor_uid: sensor_uid.to_string(),
                name: sensor_uid.to_string(),
                sensor_type: sensor_type.to_string(),
                unit: first.unit.to_string(),
            })
            .await?;
        tracing::info!(
            sensor = %sensor_uid,
            gateway = %gateway.gateway_uid,
            sensor_type,
            "auto-registered sensor"
        );
        Ok((sensor, true))
    }
}

fn new_reading(
    resolved: &ResolvedAssignment,
    sensor: &SensorRow,
    reading: &Reading,
) -> NewReading {
    NewReading {
        sensor_id: sensor.id,
        gateway_id: resolved.gateway.id,
        value: reading.value,
        unit: reading.unit.to_string(),
        metadata: json!({
            "source": METADATA_SOURCE,
            "raw_value": reading.raw_value,
            "tag": reading.tag,
            "sensor_type": reading.sensor_type,
            "farm_id": resolved.assignment.farm_id,
            "farmer_id": resolved.farmer_id,
            "assignment_id": resolved.assignment.id,
        }),
        timestamp: reading.timestamp,
    }
}
