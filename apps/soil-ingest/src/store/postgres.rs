use super::{
    decode_status, AssignmentRow, FarmRow, GatewayRow, IngestStore, NewSensor, ReadingBatch,
    SensorRow,
};
use crate::error::StoreError;
use crate::status::GatewayStatus;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder};

type GatewayTuple = (i64, String, String, Option<DateTime<Utc>>);
type AssignmentTuple = (i64, i64, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>);

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn gateway_from_tuple(row: GatewayTuple) -> Result<GatewayRow, StoreError> {
    let (id, gateway_uid, status, last_seen) = row;
    let status = decode_status(&gateway_uid, &status)?;
    Ok(GatewayRow {
        id,
        gateway_uid,
        status,
        last_seen,
    })
}

#[async_trait]
impl IngestStore for PostgresStore {
    async fn find_gateway(&self, gateway_uid: &str) -> Result<Option<GatewayRow>, StoreError> {
        let row = sqlx::query_as::<_, GatewayTuple>(
            r#"
            SELECT id, gateway_uid, COALESCE(status, 'offline'), last_seen
            FROM gateways
            WHERE gateway_uid = $1
            "#,
        )
        .bind(gateway_uid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(gateway_from_tuple).transpose()
    }

    async fn flagged_assignments(
        &self,
        gateway_id: i64,
    ) -> Result<Vec<AssignmentRow>, StoreError> {
        let rows = sqlx::query_as::<_, AssignmentTuple>(
            r#"
            SELECT id, gateway_id, farm_id, start_date, end_date
            FROM gateway_assignments
            WHERE gateway_id = $1 AND is_active IS TRUE
            ORDER BY start_date DESC NULLS LAST, id DESC
            "#,
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, gateway_id, farm_id, start_date, end_date)| AssignmentRow {
                id,
                gateway_id,
                farm_id,
                start_date: start_date.unwrap_or(DateTime::<Utc>::MIN_UTC),
                end_date,
                is_active: true,
            })
            .collect())
    }

    async fn find_farm(&self, farm_id: i64) -> Result<Option<FarmRow>, StoreError> {
        let row = sqlx::query_as::<_, (i64, Option<i64>, String)>(
            "SELECT id, farmer_id, name FROM farms WHERE id = $1",
        )
        .bind(farm_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, farmer_id, name)| FarmRow {
            id,
            farmer_id,
            name,
        }))
    }

    async fn find_sensor(&self, sensor_uid: &str) -> Result<Option<SensorRow>, StoreError> {
        let row = sqlx::query_as::<_, (i64, i64, String, String)>(
            "SELECT id, gateway_id, sensor_uid, type FROM sensors WHERE sensor_uid = $1",
        )
        .bind(sensor_uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, gateway_id, sensor_uid, sensor_type)| SensorRow {
            id,
            gateway_id,
            sensor_uid,
            sensor_type,
        }))
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<SensorRow, StoreError> {
        let inserted = sqlx::query_as::<_, (i64, i64, String, String)>(
            r#"
            INSERT INTO sensors
                (gateway_id, sensor_uid, name, type, unit, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'active', NOW(), NOW())
            ON CONFLICT (sensor_uid) DO NOTHING
            RETURNING id, gateway_id, sensor_uid, type
            "#,
        )
        .bind(sensor.gateway_id)
        .bind(&sensor.sensor_uid)
        .bind(&sensor.name)
        .bind(&sensor.sensor_type)
        .bind(&sensor.unit)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, gateway_id, sensor_uid, sensor_type)) = inserted {
            return Ok(SensorRow {
                id,
                gateway_id,
                sensor_uid,
                sensor_type,
            });
        }

        // Lost the race to a concurrent ingestor.
        self.find_sensor(&sensor.sensor_uid).await?.ok_or_else(|| {
            StoreError::Integrity(format!(
                "sensor {} conflicted on insert but cannot be read back",
                sensor.sensor_uid
            ))
        })
    }

    async fn persist_readings(&self, batch: &ReadingBatch) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(uptime) = batch.online_uptime {
            sqlx::query(
                r#"
                INSERT INTO gateway_status_history (gateway_id, status, uptime_seconds, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(batch.gateway_id)
            .bind(GatewayStatus::Online.as_str())
            .bind(uptime)
            .bind(batch.seen_at)
            .execute(&mut *tx)
            .await?;
        }

        let mut inserted = 0;
        if !batch.readings.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO sensor_data
                    (sensor_id, gateway_id, value, unit, metadata, "timestamp") "#,
            );
            builder.push_values(batch.readings.iter(), |mut b, reading| {
                b.push_bind(reading.sensor_id)
                    .push_bind(reading.gateway_id)
                    .push_bind(reading.value)
                    .push_bind(&reading.unit)
                    .push_bind(SqlJson(&reading.metadata))
                    .push_bind(reading.timestamp);
            });
            inserted = builder.build().execute(&mut *tx).await?.rows_affected();
        }

        sqlx::query(
            r#"
            UPDATE gateways
            SET status = $2, last_seen = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(batch.gateway_id)
        .bind(GatewayStatus::Online.as_str())
        .bind(batch.seen_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn stale_gateways(&self, cutoff: DateTime<Utc>) -> Result<Vec<GatewayRow>, StoreError> {
        let rows = sqlx::query_as::<_, GatewayTuple>(
            r#"
            SELECT id, gateway_uid, COALESCE(status, 'offline'), last_seen
            FROM gateways
            WHERE COALESCE(status, 'offline') NOT IN ('offline', 'maintenance')
              AND (last_seen IS NULL OR last_seen < $1)
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(gateway_from_tuple).collect()
    }

    async fn mark_gateway_offline(
        &self,
        gateway_id: i64,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE gateways
            SET status = 'offline', updated_at = $3
            WHERE id = $1
              AND COALESCE(status, 'offline') NOT IN ('offline', 'maintenance')
              AND (last_seen IS NULL OR last_seen < $2)
            "#,
        )
        .bind(gateway_id)
        .bind(cutoff)
        .bind(at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO gateway_status_history (gateway_id, status, uptime_seconds, created_at)
            VALUES ($1, $2, NULL, $3)
            "#,
        )
        .bind(gateway_id)
        .bind(GatewayStatus::Offline.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn observation_times(
        &self,
        gateway_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let rows = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT "timestamp"
            FROM sensor_data
            WHERE gateway_id = $1 AND "timestamp" >= $2
            ORDER BY "timestamp" ASC
            "#,
        )
        .bind(gateway_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
