//! Durable per-event workflow instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::event::TriggerEvent;
use crate::locator::ObjectLocator;
use crate::tasks::{ComplianceStatus, ResultsReport, SubmissionAck};

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
///
/// Transitions: `Pending → Running → Pending | Succeeded | Failed`.
///
/// The engine writes `Running` before executing a task. A run found in
/// `Running` after a restart is re-queued as `Pending` at the same state, so
/// task delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for `next_tick_at`.
    Pending,
    /// A task is executing (or the process died while it was).
    Running,
    Succeeded,
    Failed { error: String, cause: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// RunContext / StepRecord
// ---------------------------------------------------------------------------

/// Values produced by earlier states and consumed by later ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<SubmissionAck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_locator: Option<ObjectLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_status: Option<ComplianceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ResultsReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<ComplianceStatus>,
    /// Message of the most recent task error, used as the cause of a `Fail`
    /// state that does not define its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// Failed with a retryable error; the run sleeps until `retry_at`.
    Retrying { error: String, retry_at: DateTime<Utc> },
    /// Failed and routed to `next` by a catch rule.
    Caught { error: String, next: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// Which orchestrator instance accepted the event.
    pub orchestrator_id: String,
    pub event: TriggerEvent,
    /// Name of the state to execute next, or the terminal state reached.
    pub state: String,
    pub status: RunStatus,
    #[serde(default)]
    pub context: RunContext,
    /// Task executions per state name.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    /// Durable timer: the run is not picked up before this instant.
    pub next_tick_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        orchestrator_id: impl Into<String>,
        event: TriggerEvent,
        start_at: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            orchestrator_id: orchestrator_id.into(),
            event,
            state: start_at.into(),
            status: RunStatus::Pending,
            context: RunContext::default(),
            attempts: BTreeMap::new(),
            history: Vec::new(),
            next_tick_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_for(&self, state: &str) -> u32 {
        self.attempts.get(state).copied().unwrap_or(0)
    }

    /// Step records for one state, oldest first.
    pub fn steps_for<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.history.iter().filter(move |s| s.state == state)
    }
}
