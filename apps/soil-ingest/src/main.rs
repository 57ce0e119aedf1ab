mod assignment;
mod cli;
mod config;
mod error;
mod ingest;
mod mqtt;
mod payload;
mod scheduler;
mod stats;
mod status;
mod store;
mod sweeper;

use crate::cli::{Args, Command};
use crate::config::Config;
use crate::ingest::Ingestor;
use crate::scheduler::{IntervalScheduler, Scheduler};
use crate::stats::{IngestStats, StatsReporter};
use crate::status::load_timeline;
use crate::store::{build_pool, IngestStore, PostgresStore};
use crate::sweeper::OfflineSweeper;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use futures::future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            config
                .log_level
                .as_deref()
                .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| "info,soil_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "soil-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    tracing::warn!(error=%err, "failed to install SIGTERM handler");
                    future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        future::pending::<()>().await;
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::warn!(error=%err, "failed to listen for ctrl-c");
                future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

async fn run(config: Config, store: Arc<dyn IngestStore>) -> Result<()> {
    let cancel = CancellationToken::new();
    let stats = Arc::new(IngestStats::new());
    let ingestor = Ingestor::new(
        store.clone(),
        config.topic_namespace.clone(),
        stats.clone(),
    );

    let mut schedulers: Vec<IntervalScheduler> = Vec::new();
    let mut sweep_scheduler = IntervalScheduler::new(config.sweep_interval(), &cancel);
    let sweeper = OfflineSweeper::new(store, config.sweep_threshold());
    sweep_scheduler.start(Arc::new(sweeper))?;
    schedulers.push(sweep_scheduler);
    if let Some(period) = config.stats_log_interval() {
        let mut stats_scheduler = IntervalScheduler::new(period, &cancel);
        stats_scheduler.start(Arc::new(StatsReporter::new(stats.clone())))?;
        schedulers.push(stats_scheduler);
    }

    tracing::info!(
        namespace = %config.topic_namespace,
        sweep_interval_secs = config.sweep_interval_secs,
        sweep_threshold_secs = config.sweep_threshold_secs,
        "soil-ingest starting"
    );

    let mut mqtt_handle = {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            mqtt::run_listener(config, ingestor, cancel).await
        })
    };

    let listener_finished = tokio::select! {
        res = &mut mqtt_handle => Some(res),
        _ = shutdown_signal() => None,
    };
    cancel.cancel();

    let listener_result = match listener_finished {
        Some(res) => res,
        None => mqtt_handle.await,
    };
    match listener_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener exited"),
        Err(err) => tracing::error!(error=%err, "MQTT task failed"),
    }

    for scheduler in &mut schedulers {
        scheduler.stop().await;
    }
    tracing::info!(stats = ?stats.snapshot(), "soil-ingest stopped");
    Ok(())
}

async fn sweep_once(config: &Config, store: Arc<dyn IngestStore>) -> Result<()> {
    let sweeper = OfflineSweeper::new(store, config.sweep_threshold());
    let report = sweeper.sweep_at(Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn print_history(
    config: &Config,
    store: Arc<dyn IngestStore>,
    gateway_uid: &str,
    limit: usize,
    window_hours: i64,
) -> Result<()> {
    let window = ChronoDuration::try_hours(window_hours)
        .with_context(|| format!("history window of {window_hours} hours is out of range"))?;
    let timeline = load_timeline(
        store.as_ref(),
        gateway_uid,
        &config.status_thresholds(),
        Utc::now(),
        window,
        limit,
    )
    .await?
    .with_context(|| format!("gateway {gateway_uid} is not registered"))?;
    println!("{}", serde_json::to_string_pretty(&timeline)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to the database")?;
    let store: Arc<dyn IngestStore> = Arc::new(PostgresStore::new(pool));

    match args.command() {
        Command::Run => run(config, store).await,
        Command::Sweep => sweep_once(&config, store).await,
        Command::History {
            gateway_uid,
            limit,
            window_hours,
        } => print_history(&config, store, &gateway_uid, limit, window_hours).await,
    }
}
