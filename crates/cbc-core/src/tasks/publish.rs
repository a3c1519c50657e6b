//! Publish the verdict to the compliance store under the event's result token.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{CbcError, Result};
use crate::event::TriggerEvent;
use crate::store::{ComplianceStore, ComplianceType, Evaluation};

/// Source of the evaluation's `OrderingTimestamp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingTimestamp {
    /// Always 2015-01-01T00:00:00Z. The store keeps the record with the
    /// latest timestamp, so a constant makes every publish tie.
    #[default]
    Fixed,
    /// The event's `notificationCreationTime`.
    NotificationTime,
    /// Wall-clock time at publish.
    Now,
}

impl OrderingTimestamp {
    pub fn resolve(&self, event: &TriggerEvent, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            OrderingTimestamp::Fixed => Utc
                .with_ymd_and_hms(2015, 1, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| CbcError::PublishFailed("invalid fixed timestamp".into())),
            OrderingTimestamp::NotificationTime => {
                DateTime::parse_from_rfc3339(&event.notification_creation_time)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| {
                        CbcError::InvalidEvent(format!(
                            "notificationCreationTime '{}': {e}",
                            event.notification_creation_time
                        ))
                    })
            }
            OrderingTimestamp::Now => Ok(now),
        }
    }
}

pub struct EvaluationPublisher {
    store: Arc<dyn ComplianceStore>,
    ordering: OrderingTimestamp,
}

impl EvaluationPublisher {
    pub fn new(store: Arc<dyn ComplianceStore>, ordering: OrderingTimestamp) -> Self {
        Self { store, ordering }
    }

    /// Publish exactly one evaluation. Failures are never retried; a token
    /// that was already consumed surfaces as `ResultTokenUsed`, every other
    /// failure as `PublishFailed`.
    pub fn publish(&self, event: &TriggerEvent, compliant: bool, now: DateTime<Utc>) -> Result<ComplianceType> {
        let compliance = ComplianceType::from_verdict(compliant);
        let evaluation = Evaluation {
            compliance_resource_type: event.resource_type.clone(),
            compliance_resource_id: event.resource_id.clone(),
            compliance_type: compliance,
            annotation: None,
            ordering_timestamp: self.ordering.resolve(event, now)?,
        };
        self.store
            .put_evaluations(&event.result_token, std::slice::from_ref(&evaluation))
            .map_err(|e| match e {
                CbcError::PublishFailed(_) | CbcError::ResultTokenUsed(_) => e,
                other => CbcError::PublishFailed(other.to_string()),
            })?;
        info!(
            rule = %event.config_rule_name,
            resource_id = %event.resource_id,
            compliance = %compliance,
            "verdict published"
        );
        Ok(compliance)
    }
}
