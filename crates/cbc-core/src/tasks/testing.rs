//! Test doubles shared by task and engine tests.

use std::sync::Mutex;

use crate::endpoint::EvaluationEndpoint;
use crate::error::{CbcError, Result};
use crate::tasks::submit::SubmissionAck;

/// Endpoint that records every envelope and answers with a fixed report
/// location, or with a fixed rejection.
pub(crate) struct StaticEndpoint {
    response: std::result::Result<serde_json::Value, u16>,
    sent: Mutex<Vec<serde_json::Value>>,
}

impl StaticEndpoint {
    pub(crate) fn reporting_to(uri: &str) -> Self {
        Self {
            response: Ok(serde_json::json!({ "ResultsReport": { "S3Uri": uri } })),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting(status: u16) -> Self {
        Self {
            response: Err(status),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn envelopes(&self) -> Vec<serde_json::Value> {
        self.sent.lock().unwrap().clone()
    }
}

impl EvaluationEndpoint for StaticEndpoint {
    fn submit(&self, envelope: &serde_json::Value) -> Result<SubmissionAck> {
        self.sent.lock().unwrap().push(envelope.clone());
        match &self.response {
            Ok(content) => Ok(SubmissionAck {
                status_code: 200,
                content: content.clone(),
            }),
            Err(status) => Err(CbcError::SubmissionRejected {
                status: *status,
                body: "rejected".into(),
            }),
        }
    }
}
