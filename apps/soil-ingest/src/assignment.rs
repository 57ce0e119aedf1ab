use crate::error::StoreError;
use crate::store::{AssignmentRow, GatewayRow, IngestStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAssignment {
    pub gateway: GatewayRow,
    pub assignment: AssignmentRow,
    pub farmer_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    UnknownGateway,
    Unassigned(GatewayRow),
    Active(ResolvedAssignment),
}

#[cfg(test)]
impl Resolution {
    pub fn active(self) -> Option<ResolvedAssignment> {
        match self {
            Resolution::Active(resolved) => Some(resolved),
            _ => None,
        }
    }
}

/// Active means flagged active and not yet ended at `now`.
pub fn is_active_at(assignment: &AssignmentRow, now: DateTime<Utc>) -> bool {
    assignment.is_active && assignment.end_date.map_or(true, |end| end > now)
}

/// Picks the governing assignment. Several active rows break the
/// one-active-assignment rule; the latest `start_date` wins.
pub fn select_active(
    gateway_uid: &str,
    candidates: Vec<AssignmentRow>,
    now: DateTime<Utc>,
) -> Option<AssignmentRow> {
    let active: Vec<AssignmentRow> = candidates
        .into_iter()
        .filter(|assignment| is_active_at(assignment, now))
        .collect();
    if active.len() > 1 {
        let ids: Vec<i64> = active.iter().map(|a| a.id).collect();
        tracing::warn!(
            gateway = %gateway_uid,
            assignments = ?ids,
            "gateway has several active assignments; using the most recent start_date"
        );
    }
    active
        .into_iter()
        .max_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)))
}

#[derive(Clone)]
pub struct AssignmentResolver {
    store: Arc<dyn IngestStore>,
}

impl AssignmentResolver {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        gateway_uid: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let Some(gateway) = self.store.find_gateway(gateway_uid).await? else {
            return Ok(Resolution::UnknownGateway);
        };

        let candidates = self.store.flagged_assignments(gateway.id).await?;
        let Some(assignment) = select_active(gateway_uid, candidates, now) else {
            return Ok(Resolution::Unassigned(gateway));
        };

        let farmer_id = match self.store.find_farm(assignment.farm_id).await? {
            Some(farm) => farm.farmer_id,
            None => {
                tracing::debug!(
                    gateway = %gateway_uid,
                    farm = assignment.farm_id,
                    "assigned farm not found"
                );
                None
            }
        };

        Ok(Resolution::Active(ResolvedAssignment {
            gateway,
            assignment,
            farmer_id,
        }))
    }
}
