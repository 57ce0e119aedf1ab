use crate::error::StoreError;
use crate::scheduler::ScheduledJob;
use crate::store::IngestStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub marked_offline: usize,
    pub failed: usize,
}

/// Flips gateways offline once their `last_seen` is older than `threshold`.
///
/// Each gateway is updated in its own transaction, so one failing row is
/// logged and counted without undoing the others.
pub struct OfflineSweeper {
    store: Arc<dyn IngestStore>,
    threshold: ChronoDuration,
}

impl OfflineSweeper {
    pub fn new(store: Arc<dyn IngestStore>, threshold: Duration) -> Self {
        let threshold =
            ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::minutes(2));
        Self { store, threshold }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let cutoff = now
            .checked_sub_signed(self.threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self.store.stale_gateways(cutoff).await?;
        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for gateway in &stale {
            match self.store.mark_gateway_offline(gateway.id, cutoff, now).await {
                Ok(true) => {
                    report.marked_offline += 1;
                    tracing::info!(
                        gateway = %gateway.gateway_uid,
                        previous = %gateway.status,
                        last_seen = ?gateway.last_seen,
                        "gateway marked offline"
                    );
                }
                Ok(false) => {
                    tracing::debug!(
                        gateway = %gateway.gateway_uid,
                        "gateway changed before sweep; skipped"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(
                        gateway = %gateway.gateway_uid,
                        error = %err,
                        "failed to mark gateway offline"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl ScheduledJob for OfflineSweeper {
    fn name(&self) -> &'static str {
        "offline-sweeper"
    }

    async fn run(&self) {
        match self.sweep_at(Utc::now()).await {
            Ok(report) if report.marked_offline > 0 || report.failed > 0 => {
                tracing::info!(
                    scanned = report.scanned,
                    marked_offline = report.marked_offline,
                    failed = report.failed,
                    "offline sweep finished"
                );
            }
            Ok(_) => tracing::debug!("offline sweep found no stale gateways"),
            Err(err) => tracing::warn!("offline sweep failed: {err:#}"),
        }
    }
}
