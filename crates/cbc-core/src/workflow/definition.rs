//! The state machine a run executes.
//!
//! States are typed: a `Task` names one of the fixed task adapters, a
//! `Choice` evaluates one of a fixed set of conditions against the run. The
//! definition serializes to JSON for inspection (`cbc definition`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CbcError, ErrorKind, Result};
use crate::workflow::retry::{CatchRule, RetryPolicy};

pub const PARSE_INPUT: &str = "ParseInput";
pub const SKIP_DELETED_RESOURCE: &str = "SkipDeletedResource";
pub const SUBMIT_REQUEST: &str = "SubmitRequest";
pub const QUERY_COMPLIANCE_INITIAL: &str = "QueryComplianceInitial";
pub const POLL_FOR_REPORT: &str = "PollForReport";
pub const RESULTS_REPORT_DOES_NOT_EXIST: &str = "ResultsReportDoesNotExist";
pub const FETCH_REPORT: &str = "FetchReport";
pub const PUBLISH_VERDICT: &str = "PublishVerdict";
pub const QUERY_COMPLIANCE_FINAL: &str = "QueryComplianceFinal";
pub const COMPARE_TO_EXPECTED: &str = "CompareToExpected";
pub const CONFIRMED: &str = "Confirmed";
pub const COMPLIANCE_STATUS_MISMATCH: &str = "ComplianceStatusMismatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    SubmitRequest,
    QueryComplianceInitial,
    PollForReport,
    FetchReport,
    PublishVerdict,
    QueryComplianceFinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// The event's configuration item is deleted.
    ResourceDeleted,
    /// The final compliance query returned the published verdict.
    FinalStatusMatchesVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all_fields = "PascalCase")]
pub enum State {
    Task {
        resource: TaskKind,
        next: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        retry: Vec<RetryPolicy>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        catch: Vec<CatchRule>,
    },
    Choice {
        choices: Vec<ChoiceRule>,
        default: String,
    },
    Pass {
        next: String,
    },
    Succeed,
    Fail {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl State {
    /// Every state name this state can transition to.
    fn targets(&self) -> Vec<&str> {
        match self {
            State::Task { next, catch, .. } => std::iter::once(next.as_str())
                .chain(catch.iter().map(|c| c.next.as_str()))
                .collect(),
            State::Choice { choices, default } => choices
                .iter()
                .map(|c| c.next.as_str())
                .chain(std::iter::once(default.as_str()))
                .collect(),
            State::Pass { next } => vec![next.as_str()],
            State::Succeed | State::Fail { .. } => Vec::new(),
        }
    }
}

/// Tunables that shape the standard definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionParams {
    pub poll_retry: RetryPolicy,
    pub verify_retry: Option<RetryPolicy>,
}

impl Default for DefinitionParams {
    fn default() -> Self {
        Self {
            poll_retry: RetryPolicy::on(ErrorKind::ObjectDoesNotExist, 1000, 2.0, 8),
            verify_retry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateMachine {
    pub comment: String,
    pub start_at: String,
    pub states: BTreeMap<String, State>,
}

impl StateMachine {
    /// Submit, poll for the report, publish the verdict and confirm it.
    pub fn standard(params: &DefinitionParams) -> Self {
        let mut states = BTreeMap::new();
        let task = |resource, next: &str, retry: Vec<RetryPolicy>, catch: Vec<CatchRule>| State::Task {
            resource,
            next: next.to_string(),
            retry,
            catch,
        };

        states.insert(
            PARSE_INPUT.to_string(),
            State::Choice {
                choices: vec![ChoiceRule {
                    condition: Condition::ResourceDeleted,
                    next: SKIP_DELETED_RESOURCE.to_string(),
                }],
                default: SUBMIT_REQUEST.to_string(),
            },
        );
        states.insert(SKIP_DELETED_RESOURCE.to_string(), State::Succeed);
        states.insert(
            SUBMIT_REQUEST.to_string(),
            task(TaskKind::SubmitRequest, QUERY_COMPLIANCE_INITIAL, vec![], vec![]),
        );
        states.insert(
            QUERY_COMPLIANCE_INITIAL.to_string(),
            task(TaskKind::QueryComplianceInitial, POLL_FOR_REPORT, vec![], vec![]),
        );
        states.insert(
            POLL_FOR_REPORT.to_string(),
            task(
                TaskKind::PollForReport,
                FETCH_REPORT,
                vec![params.poll_retry.clone()],
                vec![CatchRule {
                    error_equals: vec![ErrorKind::ObjectDoesNotExist],
                    next: RESULTS_REPORT_DOES_NOT_EXIST.to_string(),
                }],
            ),
        );
        states.insert(
            RESULTS_REPORT_DOES_NOT_EXIST.to_string(),
            State::Fail {
                error: RESULTS_REPORT_DOES_NOT_EXIST.to_string(),
                cause: Some("results report never appeared within the poll budget".into()),
            },
        );
        states.insert(
            FETCH_REPORT.to_string(),
            task(TaskKind::FetchReport, PUBLISH_VERDICT, vec![], vec![]),
        );
        states.insert(
            PUBLISH_VERDICT.to_string(),
            task(TaskKind::PublishVerdict, QUERY_COMPLIANCE_FINAL, vec![], vec![]),
        );
        states.insert(
            QUERY_COMPLIANCE_FINAL.to_string(),
            task(
                TaskKind::QueryComplianceFinal,
                COMPARE_TO_EXPECTED,
                params.verify_retry.iter().cloned().collect(),
                vec![CatchRule {
                    error_equals: vec![ErrorKind::ComplianceMismatch],
                    next: COMPLIANCE_STATUS_MISMATCH.to_string(),
                }],
            ),
        );
        states.insert(
            COMPARE_TO_EXPECTED.to_string(),
            State::Choice {
                choices: vec![ChoiceRule {
                    condition: Condition::FinalStatusMatchesVerdict,
                    next: CONFIRMED.to_string(),
                }],
                default: COMPLIANCE_STATUS_MISMATCH.to_string(),
            },
        );
        states.insert(CONFIRMED.to_string(), State::Succeed);
        states.insert(
            COMPLIANCE_STATUS_MISMATCH.to_string(),
            State::Fail {
                error: COMPLIANCE_STATUS_MISMATCH.to_string(),
                cause: None,
            },
        );

        Self {
            comment: "Submit a compliance evaluation, wait for its results report and publish the verdict".into(),
            start_at: PARSE_INPUT.to_string(),
            states,
        }
    }

    pub fn state(&self, name: &str) -> Result<&State> {
        self.states
            .get(name)
            .ok_or_else(|| CbcError::InvalidDefinition(format!("unknown state '{name}'")))
    }

    /// Structural checks: the start state and every transition target exist,
    /// choices have at least one rule, catch rules lead to a `Fail` state and
    /// retry policies are well-formed.
    pub fn validate(&self) -> Result<()> {
        if !self.states.contains_key(&self.start_at) {
            return Err(CbcError::InvalidDefinition(format!(
                "start state '{}' does not exist",
                self.start_at
            )));
        }
        for (name, state) in &self.states {
            for target in state.targets() {
                if !self.states.contains_key(target) {
                    return Err(CbcError::InvalidDefinition(format!(
                        "state '{name}' transitions to unknown state '{target}'"
                    )));
                }
            }
            match state {
                State::Choice { choices, .. } if choices.is_empty() => {
                    return Err(CbcError::InvalidDefinition(format!(
                        "choice state '{name}' has no rules"
                    )));
                }
                State::Task { retry, catch, .. } => {
                    for policy in retry {
                        if policy.error_equals.is_empty() || policy.backoff_rate < 1.0 {
                            return Err(CbcError::InvalidDefinition(format!(
                                "state '{name}' has a malformed retry policy"
                            )));
                        }
                    }
                    for rule in catch {
                        if !matches!(self.states.get(&rule.next), Some(State::Fail { .. })) {
                            return Err(CbcError::InvalidDefinition(format!(
                                "catch on '{name}' must lead to a Fail state, not '{}'",
                                rule.next
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_definition_is_valid() {
        StateMachine::standard(&DefinitionParams::default())
            .validate()
            .unwrap();
    }

    #[test]
    fn poll_state_retries_only_on_absence() {
        let sm = StateMachine::standard(&DefinitionParams::default());
        match sm.state(POLL_FOR_REPORT).unwrap() {
            State::Task { retry, catch, .. } => {
                assert_eq!(retry.len(), 1);
                assert_eq!(retry[0].error_equals, vec![ErrorKind::ObjectDoesNotExist]);
                assert_eq!(retry[0].max_attempts, 8);
                assert_eq!(catch[0].next, RESULTS_REPORT_DOES_NOT_EXIST);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn verify_retry_knob_is_optional() {
        let sm = StateMachine::standard(&DefinitionParams::default());
        let State::Task { retry, .. } = sm.state(QUERY_COMPLIANCE_FINAL).unwrap() else {
            panic!("not a task");
        };
        assert!(retry.is_empty());

        let params = DefinitionParams {
            verify_retry: Some(RetryPolicy::on(ErrorKind::ComplianceMismatch, 2000, 1.5, 3)),
            ..DefinitionParams::default()
        };
        let sm = StateMachine::standard(&params);
        let State::Task { retry, .. } = sm.state(QUERY_COMPLIANCE_FINAL).unwrap() else {
            panic!("not a task");
        };
        assert_eq!(retry[0].max_attempts, 3);
    }

    #[test]
    fn dangling_transition_is_rejected() {
        let mut sm = StateMachine::standard(&DefinitionParams::default());
        sm.states.remove(FETCH_REPORT);
        let err = sm.validate().unwrap_err();
        assert!(err.to_string().contains("FetchReport"), "{err}");
    }

    #[test]
    fn catch_must_target_fail_state() {
        let mut sm = StateMachine::standard(&DefinitionParams::default());
        sm.states
            .insert(RESULTS_REPORT_DOES_NOT_EXIST.to_string(), State::Succeed);
        assert!(sm.validate().is_err());
    }

    #[test]
    fn json_form_reads_like_a_state_language() {
        let sm = StateMachine::standard(&DefinitionParams::default());
        let value: serde_json::Value = serde_json::from_str(&sm.to_json().unwrap()).unwrap();
        assert_eq!(value["StartAt"], "ParseInput");
        let poll = &value["States"]["PollForReport"];
        assert_eq!(poll["Type"], "Task");
        assert_eq!(poll["Retry"][0]["ErrorEquals"][0], "ObjectDoesNotExist");
        assert_eq!(poll["Retry"][0]["BackoffRate"], 2.0);
        assert_eq!(value["States"]["Confirmed"]["Type"], "Succeed");

        let back: StateMachine = serde_json::from_value(value).unwrap();
        assert_eq!(back, sm);
    }
}
