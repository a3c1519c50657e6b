//! Persist the raw trigger event and submit an evaluation request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::endpoint::EvaluationEndpoint;
use crate::error::{CbcError, Result};
use crate::event::TriggerEvent;
use crate::locator::ObjectLocator;
use crate::store::ObjectStore;

/// How the event reaches the evaluator inside the request envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// `Input` is `{"Bucket", "Key"}` of the persisted raw input record.
    #[default]
    Pointer,
    /// `Input` is the raw invocation payload itself.
    Inline,
}

/// Acknowledgement returned by the evaluation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionAck {
    pub status_code: u16,
    pub content: serde_json::Value,
}

impl SubmissionAck {
    /// Where the evaluator will write its results report.
    ///
    /// The first matching shape wins:
    /// `ResultsReport.S3Uri`, `ResultsReport.{Bucket,Key}`,
    /// `ResultsReportS3Uri`, `S3Uri`, `Response.ResultsReport.S3Uri`,
    /// `ResultsReport.Url`.
    pub fn results_report_locator(&self) -> Result<ObjectLocator> {
        let c = &self.content;
        let text = |pointer: &str| c.pointer(pointer).and_then(|v| v.as_str());

        if let Some(uri) = text("/ResultsReport/S3Uri") {
            return ObjectLocator::parse(uri);
        }
        if let (Some(bucket), Some(key)) = (text("/ResultsReport/Bucket"), text("/ResultsReport/Key")) {
            return ObjectLocator::from_parts(Some(bucket), Some(key), None);
        }
        for pointer in ["/ResultsReportS3Uri", "/S3Uri", "/Response/ResultsReport/S3Uri", "/ResultsReport/Url"] {
            if let Some(uri) = text(pointer) {
                return ObjectLocator::parse(uri);
            }
        }
        Err(CbcError::InvalidLocator(format!(
            "no results report location in endpoint response: {c}"
        )))
    }
}

/// Writes the raw input record, then POSTs the envelope.
pub struct Submitter {
    objects: Arc<dyn ObjectStore>,
    endpoint: Arc<dyn EvaluationEndpoint>,
    raw_input_bucket: String,
    environment: String,
    input_mode: InputMode,
}

impl Submitter {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        endpoint: Arc<dyn EvaluationEndpoint>,
        raw_input_bucket: impl Into<String>,
        environment: impl Into<String>,
        input_mode: InputMode,
    ) -> Self {
        Self {
            objects,
            endpoint,
            raw_input_bucket: raw_input_bucket.into(),
            environment: environment.into(),
            input_mode,
        }
    }

    /// Persist the raw record (write-once) and submit.
    ///
    /// A record already present under the event's key is left untouched, so
    /// a re-delivered invocation does not rewrite it.
    pub fn submit(&self, event: &TriggerEvent) -> Result<SubmissionAck> {
        let key = event.raw_input_key();
        let bucket = &self.raw_input_bucket;
        if self.objects.exists(bucket, &key)? {
            debug!(bucket = %bucket, key = %key, "raw input already persisted");
        } else {
            let body = serde_json::to_vec(&event.raw)?;
            self.objects.put(bucket, &key, &body)?;
            debug!(bucket = %bucket, key = %key, "raw input persisted");
        }

        let envelope = self.envelope(event, &key);
        let ack = self.endpoint.submit(&envelope)?;
        info!(
            rule = %event.config_rule_name,
            resource_id = %event.resource_id,
            status = ack.status_code,
            "evaluation submitted"
        );
        Ok(ack)
    }

    fn envelope(&self, event: &TriggerEvent, key: &str) -> serde_json::Value {
        let input = match self.input_mode {
            InputMode::Pointer => serde_json::json!({
                "Bucket": self.raw_input_bucket,
                "Key": key,
            }),
            InputMode::Inline => event.raw.clone(),
        };
        serde_json::json!({
            "Context": { "EnvironmentEvaluation": self.environment },
            "Input": input,
        })
    }
}
