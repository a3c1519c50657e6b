//! Client for the external evaluation endpoint (the control broker).

use reqwest::blocking::Client;
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};

use crate::error::{CbcError, Result};
use crate::http::{build_client, error_body, parse_url, send_signed};
use crate::sigv4::Signer;
use crate::tasks::submit::SubmissionAck;

/// Accepts an evaluation request envelope and acknowledges it.
pub trait EvaluationEndpoint: Send + Sync {
    /// POST the envelope. Anything other than `200` with a JSON body is an
    /// error; the ack is only returned for accepted submissions.
    fn submit(&self, envelope: &serde_json::Value) -> Result<SubmissionAck>;
}

/// SigV4-signed HTTPS endpoint (service `execute-api`).
pub struct SignedEndpoint {
    client: Client,
    invoke_url: Url,
    signer: Signer,
}

impl SignedEndpoint {
    /// The signing host is taken from `invoke_url`, including any non-default
    /// port.
    pub fn new(invoke_url: &str, signer: Signer) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            invoke_url: parse_url(invoke_url)?,
            signer,
        })
    }
}

impl EvaluationEndpoint for SignedEndpoint {
    fn submit(&self, envelope: &serde_json::Value) -> Result<SubmissionAck> {
        let body = serde_json::to_vec(envelope)?;
        debug!(url = %self.invoke_url, bytes = body.len(), "submitting evaluation request");
        let response = send_signed(
            &self.client,
            &self.signer,
            Method::POST,
            self.invoke_url.clone(),
            &[("content-type", "application/json")],
            body,
        )?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = error_body(response);
            warn!(status = status.as_u16(), "evaluation endpoint rejected submission");
            return Err(CbcError::SubmissionRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let bytes = response.bytes()?;
        let content: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            CbcError::Upstream(format!("evaluation endpoint returned a non-JSON body: {e}"))
        })?;
        Ok(SubmissionAck {
            status_code: status.as_u16(),
            content,
        })
    }
}
