//! Owned interval scheduler for background jobs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self);
}

/// Start/stop lifecycle over a single registered job.
#[async_trait]
pub trait Scheduler: Send {
    fn start(&mut self, job: Arc<dyn ScheduledJob>) -> Result<()>;

    /// Waits for an in-progress run to finish.
    async fn stop(&mut self);

    fn is_running(&self) -> bool;
}

pub struct IntervalScheduler {
    period: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl IntervalScheduler {
    /// Stops on its own when `parent` is cancelled.
    pub fn new(period: Duration, parent: &CancellationToken) -> Self {
        Self {
            period,
            cancel: parent.child_token(),
            handle: None,
        }
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    fn start(&mut self, job: Arc<dyn ScheduledJob>) -> Result<()> {
        if self.is_running() {
            bail!("scheduler already running; cannot start job {}", job.name());
        }
        if self.period.is_zero() {
            bail!("job {} needs a non-zero period", job.name());
        }

        let period = self.period;
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                job = job.name(),
                period_ms = period.as_millis() as u64,
                "scheduled job started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        job.run().await;
                    }
                }
            }
            tracing::info!(job = job.name(), "scheduled job stopped");
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "scheduled job task failed");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
