//! Gateway status vocabulary and the gap-based status reconstruction.
//!
//! `reconstruct_history` is a read-time projection over observation
//! timestamps. The persisted `gateway_status_history` table written by the
//! ingestor and the sweeper stays the record of truth.

use crate::error::StoreError;
use crate::store::IngestStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Online,
    Offline,
    Maintenance,
    Restarted,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Online => "online",
            GatewayStatus::Offline => "offline",
            GatewayStatus::Maintenance => "maintenance",
            GatewayStatus::Restarted => "restarted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(GatewayStatus::Online),
            "offline" => Some(GatewayStatus::Offline),
            "maintenance" => Some(GatewayStatus::Maintenance),
            "restarted" => Some(GatewayStatus::Restarted),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gap thresholds used when classifying the silence between observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    pub offline: ChronoDuration,
    pub restart: ChronoDuration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            offline: ChronoDuration::minutes(5),
            restart: ChronoDuration::minutes(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPeriod {
    pub status: GatewayStatus,
    pub uptime_seconds: i64,
    pub created_at: DateTime<Utc>,
}

/// Online iff the latest observation is within the offline threshold of `now`.
pub fn current_status(
    last_observation: Option<DateTime<Utc>>,
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
) -> GatewayStatus {
    match last_observation {
        Some(seen) if now - seen <= thresholds.offline => GatewayStatus::Online,
        _ => GatewayStatus::Offline,
    }
}

pub fn classify_gap(gap: ChronoDuration, thresholds: &StatusThresholds) -> GatewayStatus {
    if gap > thresholds.offline {
        GatewayStatus::Offline
    } else if gap > thresholds.restart {
        GatewayStatus::Restarted
    } else {
        GatewayStatus::Online
    }
}

/// Rebuilds a most-recent-first list of status periods from raw observation
/// timestamps.
///
/// Online periods report the running uptime total when they close; other
/// periods report their own duration. The trailing period is closed against
/// `now`: an online run whose silence exceeds the offline threshold is split
/// into an online slice capped at the threshold and an offline remainder,
/// otherwise the tail is labelled with [`current_status`].
pub fn reconstruct_history(
    observations: &[DateTime<Utc>],
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<StatusPeriod> {
    let mut ordered = observations.to_vec();
    ordered.sort_unstable();

    let Some((&first, rest)) = ordered.split_first() else {
        let mut periods = vec![StatusPeriod {
            status: GatewayStatus::Offline,
            uptime_seconds: 0,
            created_at: now,
        }];
        periods.truncate(limit);
        return periods;
    };

    let mut periods = Vec::new();
    let mut total_uptime = 0_i64;
    let mut status = GatewayStatus::Online;
    let mut started = first;
    let mut previous = first;

    for &observed in rest {
        let next = classify_gap(observed - previous, thresholds);
        if next != status {
            let duration = (previous - started).num_seconds();
            periods.push(close_period(status, started, duration, &mut total_uptime));
            status = next;
            started = observed;
        }
        previous = observed;
    }

    let silence = now - previous;
    if silence > thresholds.offline && status == GatewayStatus::Online {
        total_uptime += (previous - started).num_seconds() + thresholds.offline.num_seconds();
        periods.push(StatusPeriod {
            status: GatewayStatus::Online,
            uptime_seconds: total_uptime,
            created_at: started,
        });
        let offline_from = previous + thresholds.offline;
        periods.push(StatusPeriod {
            status: GatewayStatus::Offline,
            uptime_seconds: (now - offline_from).num_seconds(),
            created_at: offline_from,
        });
    } else {
        let duration = (now - started).num_seconds();
        if status == GatewayStatus::Online {
            total_uptime += duration;
        }
        let actual = current_status(Some(previous), thresholds, now);
        let uptime_seconds = if actual == GatewayStatus::Online {
            total_uptime
        } else {
            duration
        };
        periods.push(StatusPeriod {
            status: actual,
            uptime_seconds,
            created_at: started,
        });
    }

    periods.reverse();
    periods.truncate(limit);
    periods
}

fn close_period(
    status: GatewayStatus,
    started: DateTime<Utc>,
    duration: i64,
    total_uptime: &mut i64,
) -> StatusPeriod {
    let uptime_seconds = if status == GatewayStatus::Online {
        *total_uptime += duration;
        *total_uptime
    } else {
        duration
    };
    StatusPeriod {
        status,
        uptime_seconds,
        created_at: started,
    }
}

/// Compact human rendering of an uptime counter, e.g. `2h 5m`.
pub fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3_600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86_400 {
        format!("{}h {}m", seconds / 3_600, (seconds % 3_600) / 60)
    } else {
        format!("{}d {}h", seconds / 86_400, (seconds % 86_400) / 3_600)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub status: GatewayStatus,
    pub uptime_seconds: i64,
    pub uptime: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusTimeline {
    pub gateway_uid: String,
    pub current_status: GatewayStatus,
    pub last_observation: Option<DateTime<Utc>>,
    pub periods: Vec<TimelineEntry>,
}

pub fn build_timeline(
    gateway_uid: &str,
    observations: &[DateTime<Utc>],
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
    limit: usize,
) -> StatusTimeline {
    let last_observation = observations.iter().max().copied();
    let periods = reconstruct_history(observations, thresholds, now, limit)
        .into_iter()
        .map(|period| TimelineEntry {
            status: period.status,
            uptime_seconds: period.uptime_seconds,
            uptime: format_uptime(period.uptime_seconds),
            created_at: period.created_at,
        })
        .collect();
    StatusTimeline {
        gateway_uid: gateway_uid.to_string(),
        current_status: current_status(last_observation, thresholds, now),
        last_observation,
        periods,
    }
}

/// Rebuilds the timeline of `gateway_uid` from its readings of the last
/// `window`. `None` when the gateway is not registered. A window reaching
/// past the earliest representable time covers every reading.
pub async fn load_timeline(
    store: &dyn IngestStore,
    gateway_uid: &str,
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
    window: ChronoDuration,
    limit: usize,
) -> Result<Option<StatusTimeline>, StoreError> {
    let Some(gateway) = store.find_gateway(gateway_uid).await? else {
        return Ok(None);
    };
    let since = now
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let observations = store.observation_times(gateway.id, since).await?;
    Ok(Some(build_timeline(
        &gateway.gateway_uid,
        &observations,
        thresholds,
        now,
        limit.clamp(1, MAX_HISTORY_LIMIT),
    )))
}
