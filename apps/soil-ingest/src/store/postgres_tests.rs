use super::{IngestStore, NewReading, NewSensor, PostgresStore, ReadingBatch};
use crate::status::GatewayStatus;
use crate::sweeper::OfflineSweeper;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS gateways (
        id bigserial primary key,
        gateway_uid text not null unique,
        status text null,
        last_seen timestamptz null,
        updated_at timestamptz null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS farms (
        id bigint primary key,
        farmer_id bigint null,
        name text not null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateway_assignments (
        id bigserial primary key,
        gateway_id bigint not null references gateways(id),
        farm_id bigint not null references farms(id),
        start_date timestamptz null,
        end_date timestamptz null,
        is_active boolean not null default true
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id bigserial primary key,
        gateway_id bigint not null references gateways(id),
        sensor_uid text not null unique,
        name text not null,
        type text not null,
        unit text not null default '',
        status text not null,
        created_at timestamptz not null,
        updated_at timestamptz not null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_data (
        id bigserial primary key,
        sensor_id bigint not null references sensors(id),
        gateway_id bigint not null references gateways(id),
        value double precision not null,
        unit text not null,
        metadata jsonb null,
        "timestamp" timestamptz not null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateway_status_history (
        id bigserial primary key,
        gateway_id bigint not null references gateways(id),
        status text not null,
        uptime_seconds bigint null,
        created_at timestamptz not null
    )
    "#,
];

/// Returns the test database url when integration tests are enabled.
fn integration_url() -> Option<String> {
    if env::var("INGEST_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("INGEST_TEST_DATABASE_URL").ok()
}

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    for ddl in TABLES {
        sqlx::query(ddl).execute(&pool).await?;
    }
    Ok(pool)
}

async fn teardown(pool: PgPool, schema: &str) -> Result<()> {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&pool)
        .await?;
    pool.close().await;
    Ok(())
}

fn schema_for(test: &str) -> String {
    format!("soil_ingest_{test}_{}", std::process::id())
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

async fn insert_gateway(
    pool: &PgPool,
    uid: &str,
    status: &str,
    last_seen: Option<DateTime<Utc>>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO gateways (gateway_uid, status, last_seen) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(uid)
    .bind(status)
    .bind(last_seen)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn count(pool: &PgPool, table: &str) -> Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?)
}

fn reading(sensor_id: i64, gateway_id: i64, value: f64) -> NewReading {
    NewReading {
        sensor_id,
        gateway_id,
        value,
        unit: "%".to_string(),
        metadata: json!({ "source": "mqtt", "raw_value": value * 10.0 }),
        timestamp: now(),
    }
}

#[tokio::test]
async fn persist_readings_commits_or_rolls_back_as_a_unit() -> Result<()> {
    let Some(database_url) = integration_url() else {
        return Ok(());
    };
    let schema = schema_for("persist");
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = PostgresStore::new(pool.clone());

    let gateway_id = insert_gateway(&pool, "GW-1", "offline", None).await?;
    let sensor = store
        .create_sensor(&NewSensor {
            gateway_id,
            sensor_uid: "SEM225-01".to_string(),
            name: "SEM225-01".to_string(),
            sensor_type: "moisture".to_string(),
            unit: "%".to_string(),
        })
        .await?;

    // Third reading violates the sensor foreign key.
    let broken = ReadingBatch {
        gateway_id,
        readings: vec![
            reading(sensor.id, gateway_id, 45.0),
            reading(sensor.id, gateway_id, 46.0),
            reading(sensor.id + 10_000, gateway_id, 47.0),
        ],
        seen_at: now(),
        online_uptime: Some(600),
    };
    assert!(store.persist_readings(&broken).await.is_err());
    assert_eq!(count(&pool, "sensor_data").await?, 0);
    assert_eq!(count(&pool, "gateway_status_history").await?, 0);
    let gateway = store.find_gateway("GW-1").await?.expect("gateway");
    assert_eq!(gateway.status, GatewayStatus::Offline);
    assert_eq!(gateway.last_seen, None);

    let good = ReadingBatch {
        readings: vec![
            reading(sensor.id, gateway_id, 45.0),
            reading(sensor.id, gateway_id, 46.0),
        ],
        ..broken
    };
    assert_eq!(store.persist_readings(&good).await?, 2);
    assert_eq!(count(&pool, "sensor_data").await?, 2);
    let gateway = store.find_gateway("GW-1").await?.expect("gateway");
    assert_eq!(gateway.status, GatewayStatus::Online);
    assert_eq!(gateway.last_seen, Some(now()));
    let uptime = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT uptime_seconds FROM gateway_status_history WHERE status = 'online'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(uptime, Some(600));
    assert_eq!(
        store.observation_times(gateway_id, now() - ChronoDuration::hours(1)).await?,
        vec![now(), now()]
    );

    teardown(pool, &schema).await
}

#[tokio::test]
async fn create_sensor_returns_existing_row_on_conflict() -> Result<()> {
    let Some(database_url) = integration_url() else {
        return Ok(());
    };
    let schema = schema_for("sensor");
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = PostgresStore::new(pool.clone());

    let first_gateway = insert_gateway(&pool, "GW-1", "online", Some(now())).await?;
    let second_gateway = insert_gateway(&pool, "GW-2", "online", Some(now())).await?;
    let new_sensor = |gateway_id| NewSensor {
        gateway_id,
        sensor_uid: "SEM225-09".to_string(),
        name: "SEM225-09".to_string(),
        sensor_type: "temperature".to_string(),
        unit: "°C".to_string(),
    };

    let created = store.create_sensor(&new_sensor(first_gateway)).await?;
    let again = store.create_sensor(&new_sensor(second_gateway)).await?;
    assert_eq!(created, again);
    assert_eq!(again.gateway_id, first_gateway);
    assert_eq!(count(&pool, "sensors").await?, 1);

    teardown(pool, &schema).await
}

#[tokio::test]
async fn flagged_assignments_and_farm_lookup() -> Result<()> {
    let Some(database_url) = integration_url() else {
        return Ok(());
    };
    let schema = schema_for("assign");
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = PostgresStore::new(pool.clone());

    let gateway_id = insert_gateway(&pool, "GW-1", "online", None).await?;
    sqlx::query("INSERT INTO farms (id, farmer_id, name) VALUES (9, 4, 'north field')")
        .execute(&pool)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO gateway_assignments (gateway_id, farm_id, start_date, end_date, is_active)
        VALUES ($1, 9, $2, NULL, TRUE), ($1, 9, $3, NULL, FALSE)
        "#,
    )
    .bind(gateway_id)
    .bind(now() - ChronoDuration::days(10))
    .bind(now() - ChronoDuration::days(1))
    .execute(&pool)
    .await?;

    let flagged = store.flagged_assignments(gateway_id).await?;
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].farm_id, 9);
    assert_eq!(flagged[0].end_date, None);
    let farm = store.find_farm(9).await?.expect("farm");
    assert_eq!(farm.farmer_id, Some(4));
    assert!(store.find_farm(10).await?.is_none());

    teardown(pool, &schema).await
}

#[tokio::test]
async fn sweep_marks_stale_gateways_once() -> Result<()> {
    let Some(database_url) = integration_url() else {
        return Ok(());
    };
    let schema = schema_for("sweep");
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = Arc::new(PostgresStore::new(pool.clone()));

    let stale = Some(now() - ChronoDuration::minutes(10));
    let fresh = Some(now() - ChronoDuration::seconds(30));
    insert_gateway(&pool, "stale", "online", stale).await?;
    insert_gateway(&pool, "fresh", "online", fresh).await?;
    insert_gateway(&pool, "never-seen", "restarted", None).await?;
    insert_gateway(&pool, "maintenance", "maintenance", None).await?;

    let sweeper = OfflineSweeper::new(store.clone(), Duration::from_secs(120));
    let first = sweeper.sweep_at(now()).await?;
    assert_eq!(first.marked_offline, 2);
    assert_eq!(first.failed, 0);
    let second = sweeper.sweep_at(now()).await?;
    assert_eq!(second.scanned, 0);
    assert_eq!(count(&pool, "gateway_status_history").await?, 2);

    let statuses = sqlx::query_as::<_, (String, Option<String>)>(
        "SELECT gateway_uid, status FROM gateways ORDER BY gateway_uid",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(
        statuses,
        vec![
            ("fresh".to_string(), Some("online".to_string())),
            ("maintenance".to_string(), Some("maintenance".to_string())),
            ("never-seen".to_string(), Some("offline".to_string())),
            ("stale".to_string(), Some("offline".to_string())),
        ]
    );

    teardown(pool, &schema).await
}
