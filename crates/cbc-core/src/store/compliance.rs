//! Compliance-status store clients.
//!
//! [`AwsConfigStore`] speaks the AWS Config JSON 1.1 protocol.
//! [`LocalComplianceStore`] keeps the same data in a JSON file (or in memory)
//! and enforces the one property the workflow depends on: a result token is
//! valid for exactly one `put_evaluations` call.

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{CbcError, Result};
use crate::event::TriggerEvent;
use crate::http::{build_client, error_body, send_signed};
use crate::sigv4::Signer;

const TARGET_PREFIX: &str = "StarlingDoveService";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceType {
    Compliant,
    NonCompliant,
    NotApplicable,
    InsufficientData,
}

impl ComplianceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceType::Compliant => "COMPLIANT",
            ComplianceType::NonCompliant => "NON_COMPLIANT",
            ComplianceType::NotApplicable => "NOT_APPLICABLE",
            ComplianceType::InsufficientData => "INSUFFICIENT_DATA",
        }
    }

    pub fn from_verdict(compliant: bool) -> Self {
        if compliant {
            ComplianceType::Compliant
        } else {
            ComplianceType::NonCompliant
        }
    }
}

impl std::fmt::Display for ComplianceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationResultQualifier {
    pub config_rule_name: String,
    pub resource_type: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationResultIdentifier {
    pub evaluation_result_qualifier: EvaluationResultQualifier,
}

/// One stored compliance record for a (rule, resource) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationResult {
    pub evaluation_result_identifier: EvaluationResultIdentifier,
    pub compliance_type: ComplianceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl EvaluationResult {
    pub fn new(rule: &str, resource_type: &str, resource_id: &str, compliance: ComplianceType) -> Self {
        Self {
            evaluation_result_identifier: EvaluationResultIdentifier {
                evaluation_result_qualifier: EvaluationResultQualifier {
                    config_rule_name: rule.to_string(),
                    resource_type: resource_type.to_string(),
                    resource_id: resource_id.to_string(),
                },
            },
            compliance_type: compliance,
            annotation: None,
        }
    }

    pub fn qualifier(&self) -> &EvaluationResultQualifier {
        &self.evaluation_result_identifier.evaluation_result_qualifier
    }
}

/// An evaluation to publish under a result token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Evaluation {
    pub compliance_resource_type: String,
    pub compliance_resource_id: String,
    pub compliance_type: ComplianceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub ordering_timestamp: DateTime<Utc>,
}

/// Access to the per-(resource, rule) compliance status.
pub trait ComplianceStore: Send + Sync {
    /// All records for one resource, across rules, restricted to `types`.
    fn compliance_by_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        types: &[ComplianceType],
    ) -> Result<Vec<EvaluationResult>>;

    /// Up to `limit` records for one rule, restricted to `types`.
    fn compliance_by_rule(
        &self,
        config_rule_name: &str,
        types: &[ComplianceType],
        limit: u32,
    ) -> Result<Vec<EvaluationResult>>;

    fn put_evaluations(&self, result_token: &str, evaluations: &[Evaluation]) -> Result<()>;

    /// Called when a trigger event is accepted. Stores that issue their own
    /// result tokens use this to learn which rule a token belongs to.
    fn observe_trigger(&self, _event: &TriggerEvent) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// AwsConfigStore
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DetailsPage {
    #[serde(default)]
    evaluation_results: Vec<EvaluationResult>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutEvaluationsOutput {
    #[serde(default)]
    failed_evaluations: Vec<serde_json::Value>,
}

/// AWS Config client (JSON 1.1 over HTTPS, SigV4 service `config`).
pub struct AwsConfigStore {
    client: Client,
    endpoint: Url,
    signer: Signer,
}

impl AwsConfigStore {
    pub fn new(signer: Signer, region: &str, endpoint: Option<&str>) -> Result<Self> {
        let raw = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://config.{region}.amazonaws.com/"));
        let endpoint = Url::parse(&raw)
            .map_err(|e| CbcError::Upstream(format!("invalid config endpoint '{raw}': {e}")))?;
        Ok(Self {
            client: build_client()?,
            endpoint,
            signer,
        })
    }

    /// One JSON 1.1 call. Non-2xx responses are returned as `Err(status, body)`
    /// so callers can pick the error class.
    fn call(
        &self,
        operation: &str,
        body: &serde_json::Value,
    ) -> Result<std::result::Result<serde_json::Value, (u16, String)>> {
        let target = format!("{TARGET_PREFIX}.{operation}");
        debug!(target = %target, "config api call");
        let response = send_signed(
            &self.client,
            &self.signer,
            Method::POST,
            self.endpoint.clone(),
            &[("content-type", JSON_CONTENT_TYPE), ("x-amz-target", &target)],
            serde_json::to_vec(body)?,
        )?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Err((status.as_u16(), error_body(response))));
        }
        let bytes = response.bytes()?;
        if bytes.is_empty() {
            return Ok(Ok(serde_json::Value::Object(Default::default())));
        }
        Ok(Ok(serde_json::from_slice(&bytes)?))
    }

    fn query(&self, operation: &str, body: &serde_json::Value) -> Result<DetailsPage> {
        match self.call(operation, body)? {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err((status, text)) => Err(CbcError::Upstream(format!(
                "{operation} returned {status}: {text}"
            ))),
        }
    }
}

impl ComplianceStore for AwsConfigStore {
    fn compliance_by_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        types: &[ComplianceType],
    ) -> Result<Vec<EvaluationResult>> {
        let mut results = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut body = serde_json::json!({
                "ResourceType": resource_type,
                "ResourceId": resource_id,
                "ComplianceTypes": types,
            });
            if let Some(token) = &next_token {
                body["NextToken"] = serde_json::Value::String(token.clone());
            }
            let page = self.query("GetComplianceDetailsByResource", &body)?;
            results.extend(page.evaluation_results);
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(results)
    }

    fn compliance_by_rule(
        &self,
        config_rule_name: &str,
        types: &[ComplianceType],
        limit: u32,
    ) -> Result<Vec<EvaluationResult>> {
        let body = serde_json::json!({
            "ConfigRuleName": config_rule_name,
            "ComplianceTypes": types,
            "Limit": limit,
        });
        Ok(self
            .query("GetComplianceDetailsByConfigRule", &body)?
            .evaluation_results)
    }

    fn put_evaluations(&self, result_token: &str, evaluations: &[Evaluation]) -> Result<()> {
        let body = serde_json::json!({
            "Evaluations": evaluations,
            "ResultToken": result_token,
        });
        let value = match self.call("PutEvaluations", &body)? {
            Ok(value) => value,
            Err((status, text)) => {
                return Err(CbcError::PublishFailed(format!("PutEvaluations returned {status}: {text}")))
            }
        };
        let output: PutEvaluationsOutput = serde_json::from_value(value)?;
        if !output.failed_evaluations.is_empty() {
            return Err(CbcError::PublishFailed(format!(
                "{} evaluation(s) rejected: {}",
                output.failed_evaluations.len(),
                serde_json::Value::Array(output.failed_evaluations)
            )));
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "aws-config"
    }
}

// ---------------------------------------------------------------------------
// LocalComplianceStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenState {
    config_rule_name: String,
    used: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    #[serde(default)]
    tokens: BTreeMap<String, TokenState>,
    #[serde(default)]
    results: Vec<EvaluationResult>,
}

/// File-backed (or in-memory) compliance store for development and tests.
///
/// Tokens must be registered through [`ComplianceStore::observe_trigger`]
/// before they can be used, and each is consumed by its first publish.
pub struct LocalComplianceStore {
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalComplianceStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Open (or start) a store persisted at `path`. The file is re-read on
    /// every operation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: Some(path.into()),
            state: Mutex::new(LocalState::default()),
        };
        drop(store.lock()?);
        Ok(store)
    }

    /// Set the stored status for a (rule, resource) pair directly.
    pub fn record(
        &self,
        rule: &str,
        resource_type: &str,
        resource_id: &str,
        compliance: ComplianceType,
    ) -> Result<()> {
        let mut state = self.lock()?;
        upsert(&mut state, EvaluationResult::new(rule, resource_type, resource_id, compliance));
        self.persist(&state)
    }

    /// Lock the state, first reloading it from disk so that writes made by
    /// other processes sharing the file are visible.
    fn lock(&self) -> Result<MutexGuard<'_, LocalState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CbcError::Upstream("local compliance store lock poisoned".into()))?;
        if let Some(path) = self.path.as_ref().filter(|p| p.exists()) {
            *state = serde_json::from_slice(&std::fs::read(path)?)?;
        }
        Ok(state)
    }

    fn persist(&self, state: &LocalState) -> Result<()> {
        if let Some(path) = &self.path {
            let data = serde_json::to_vec_pretty(state)?;
            crate::io::atomic_write(path, &data)?;
        }
        Ok(())
    }
}

fn upsert(state: &mut LocalState, result: EvaluationResult) {
    let existing = state
        .results
        .iter_mut()
        .find(|r| r.qualifier() == result.qualifier());
    match existing {
        Some(slot) => *slot = result,
        None => state.results.push(result),
    }
}

impl ComplianceStore for LocalComplianceStore {
    fn compliance_by_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        types: &[ComplianceType],
    ) -> Result<Vec<EvaluationResult>> {
        let state = self.lock()?;
        Ok(state
            .results
            .iter()
            .filter(|r| {
                let q = r.qualifier();
                q.resource_type == resource_type
                    && q.resource_id == resource_id
                    && types.contains(&r.compliance_type)
            })
            .cloned()
            .collect())
    }

    fn compliance_by_rule(
        &self,
        config_rule_name: &str,
        types: &[ComplianceType],
        limit: u32,
    ) -> Result<Vec<EvaluationResult>> {
        let state = self.lock()?;
        Ok(state
            .results
            .iter()
            .filter(|r| {
                r.qualifier().config_rule_name == config_rule_name
                    && types.contains(&r.compliance_type)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn put_evaluations(&self, result_token: &str, evaluations: &[Evaluation]) -> Result<()> {
        let mut state = self.lock()?;
        let rule = match state.tokens.get_mut(result_token) {
            None => {
                return Err(CbcError::PublishFailed(format!(
                    "invalid result token '{result_token}'"
                )))
            }
            Some(token) if token.used => {
                warn!(token = %result_token, "result token reused");
                return Err(CbcError::ResultTokenUsed(result_token.to_string()));
            }
            Some(token) => {
                token.used = true;
                token.config_rule_name.clone()
            }
        };
        for evaluation in evaluations {
            let mut result = EvaluationResult::new(
                &rule,
                &evaluation.compliance_resource_type,
                &evaluation.compliance_resource_id,
                evaluation.compliance_type,
            );
            result.annotation = evaluation.annotation.clone();
            upsert(&mut state, result);
        }
        info!(rule = %rule, count = evaluations.len(), "evaluations recorded");
        self.persist(&state)
    }

    fn observe_trigger(&self, event: &TriggerEvent) -> Result<()> {
        let mut state = self.lock()?;
        if state.tokens.contains_key(&event.result_token) {
            return Ok(());
        }
        state.tokens.insert(
            event.result_token.clone(),
            TokenState {
                config_rule_name: event.config_rule_name.clone(),
                used: false,
            },
        );
        self.persist(&state)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::sqs_payload;
    use crate::sigv4::Credentials;
    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;
    use tempfile::TempDir;

    const BOTH: &[ComplianceType] = &[ComplianceType::Compliant, ComplianceType::NonCompliant];

    fn sqs_event() -> TriggerEvent {
        TriggerEvent::from_value(sqs_payload("OK", "2024-01-01T00:00:00Z")).unwrap()
    }

    fn evaluation(compliance: ComplianceType) -> Evaluation {
        Evaluation {
            compliance_resource_type: "AWS::SQS::Queue".into(),
            compliance_resource_id: "q-1".into(),
            compliance_type: compliance,
            annotation: None,
            ordering_timestamp: Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn aws_store(server: &mockito::Server) -> AwsConfigStore {
        let signer = Signer::new(
            Credentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            "us-east-1",
            "config",
        );
        AwsConfigStore::new(signer, "us-east-1", Some(&server.url())).unwrap()
    }

    #[test]
    fn evaluation_serializes_like_the_api() {
        let value = serde_json::to_value(evaluation(ComplianceType::Compliant)).unwrap();
        assert_eq!(value["ComplianceType"], "COMPLIANT");
        assert_eq!(value["ComplianceResourceId"], "q-1");
        assert_eq!(value["OrderingTimestamp"], 1_420_070_400);
        assert!(value.get("Annotation").is_none());
    }

    #[test]
    fn local_token_is_single_use() {
        let store = LocalComplianceStore::in_memory();
        store.observe_trigger(&sqs_event()).unwrap();

        store
            .put_evaluations("tok-1", &[evaluation(ComplianceType::Compliant)])
            .unwrap();
        let err = store
            .put_evaluations("tok-1", &[evaluation(ComplianceType::NonCompliant)])
            .unwrap_err();
        assert!(matches!(err, CbcError::ResultTokenUsed(ref t) if t == "tok-1"), "{err}");

        let results = store
            .compliance_by_resource("AWS::SQS::Queue", "q-1", BOTH)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].compliance_type, ComplianceType::Compliant);
        assert_eq!(results[0].qualifier().config_rule_name, "SQS-PoC");
    }

    #[test]
    fn local_unknown_token_is_rejected() {
        let store = LocalComplianceStore::in_memory();
        let err = store
            .put_evaluations("never-issued", &[evaluation(ComplianceType::Compliant)])
            .unwrap_err();
        assert!(err.to_string().contains("invalid result token"), "{err}");
    }

    #[test]
    fn local_queries_filter_by_type_and_rule() {
        let store = LocalComplianceStore::in_memory();
        store
            .record("SQS-PoC", "AWS::SQS::Queue", "q-1", ComplianceType::NotApplicable)
            .unwrap();
        store
            .record("Other", "AWS::SQS::Queue", "q-1", ComplianceType::NonCompliant)
            .unwrap();

        let by_resource = store
            .compliance_by_resource("AWS::SQS::Queue", "q-1", BOTH)
            .unwrap();
        assert_eq!(by_resource.len(), 1);
        assert_eq!(by_resource[0].qualifier().config_rule_name, "Other");

        let all = [
            ComplianceType::Compliant,
            ComplianceType::NonCompliant,
            ComplianceType::NotApplicable,
        ];
        let by_rule = store.compliance_by_rule("SQS-PoC", &all, 100).unwrap();
        assert_eq!(by_rule.len(), 1);
        assert_eq!(by_rule[0].compliance_type, ComplianceType::NotApplicable);
    }

    #[test]
    fn local_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compliance.json");
        {
            let store = LocalComplianceStore::open(&path).unwrap();
            store.observe_trigger(&sqs_event()).unwrap();
            store
                .put_evaluations("tok-1", &[evaluation(ComplianceType::NonCompliant)])
                .unwrap();
        }
        let store = LocalComplianceStore::open(&path).unwrap();
        let results = store
            .compliance_by_resource("AWS::SQS::Queue", "q-1", BOTH)
            .unwrap();
        assert_eq!(results[0].compliance_type, ComplianceType::NonCompliant);
        assert!(store
            .put_evaluations("tok-1", &[evaluation(ComplianceType::Compliant)])
            .is_err());
    }

    #[test]
    fn local_store_sees_writes_from_another_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compliance.json");
        let intake = LocalComplianceStore::open(&path).unwrap();
        let worker = LocalComplianceStore::open(&path).unwrap();

        intake.observe_trigger(&sqs_event()).unwrap();
        worker
            .put_evaluations("tok-1", &[evaluation(ComplianceType::Compliant)])
            .unwrap();

        let seen = intake
            .compliance_by_resource("AWS::SQS::Queue", "q-1", BOTH)
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].compliance_type, ComplianceType::Compliant);
    }

    #[test]
    fn aws_by_resource_follows_next_token() {
        let mut server = mockito::Server::new();
        let record = |rule: &str| {
            json!({
                "EvaluationResultIdentifier": {
                    "EvaluationResultQualifier": {
                        "ConfigRuleName": rule,
                        "ResourceType": "AWS::SQS::Queue",
                        "ResourceId": "q-1"
                    },
                    "OrderingTimestamp": 1.42007040E9
                },
                "ComplianceType": "COMPLIANT",
                "ResultRecordedTime": 1.7E9
            })
        };
        let _second = server
            .mock("POST", "/")
            .match_header("x-amz-target", "StarlingDoveService.GetComplianceDetailsByResource")
            .match_body(Matcher::PartialJson(json!({"NextToken": "page-2"})))
            .with_body(json!({"EvaluationResults": [record("B")]}).to_string())
            .create();
        let _first = server
            .mock("POST", "/")
            .match_header("x-amz-target", "StarlingDoveService.GetComplianceDetailsByResource")
            .match_body(Matcher::Json(json!({
                "ResourceType": "AWS::SQS::Queue",
                "ResourceId": "q-1",
                "ComplianceTypes": ["COMPLIANT", "NON_COMPLIANT"]
            })))
            .with_body(
                json!({"EvaluationResults": [record("A")], "NextToken": "page-2"}).to_string(),
            )
            .create();

        let results = aws_store(&server)
            .compliance_by_resource("AWS::SQS::Queue", "q-1", BOTH)
            .unwrap();
        let rules: Vec<_> = results
            .iter()
            .map(|r| r.qualifier().config_rule_name.as_str())
            .collect();
        assert_eq!(rules, ["A", "B"]);
    }

    #[test]
    fn aws_put_evaluations_surfaces_failed_entries() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/")
            .match_header("x-amz-target", "StarlingDoveService.PutEvaluations")
            .match_header("content-type", "application/x-amz-json-1.1")
            .match_body(Matcher::PartialJson(json!({"ResultToken": "tok-1"})))
            .with_body(json!({"FailedEvaluations": [{"ComplianceResourceId": "q-1"}]}).to_string())
            .create();
        let err = aws_store(&server)
            .put_evaluations("tok-1", &[evaluation(ComplianceType::Compliant)])
            .unwrap_err();
        assert!(matches!(err, CbcError::PublishFailed(_)), "{err}");
    }

    #[test]
    fn aws_put_evaluations_rejected_token_is_publish_failure() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"__type":"InvalidResultTokenException"}"#)
            .create();
        let err = aws_store(&server)
            .put_evaluations("tok-1", &[evaluation(ComplianceType::Compliant)])
            .unwrap_err();
        assert!(err.to_string().contains("InvalidResultTokenException"), "{err}");
        assert!(matches!(err, CbcError::PublishFailed(_)));
    }

    #[test]
    fn aws_query_error_is_upstream() {
        let mut server = mockito::Server::new();
        let _m = server.mock("POST", "/").with_status(500).create();
        let err = aws_store(&server)
            .compliance_by_rule("SQS-PoC", BOTH, 100)
            .unwrap_err();
        assert!(matches!(err, CbcError::Upstream(_)), "{err}");
    }
}
