//! Query the stored compliance status of a (resource, rule) pair.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CbcError, Result};
use crate::store::{ComplianceStore, ComplianceType};

/// Upper bound the by-rule cross-check asks for.
const BY_RULE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    /// No record exists for the rule and resource.
    Unknown,
}

impl ComplianceStatus {
    pub fn from_verdict(compliant: bool) -> Self {
        if compliant {
            ComplianceStatus::Compliant
        } else {
            ComplianceStatus::NonCompliant
        }
    }

    fn from_type(t: ComplianceType) -> Self {
        match t {
            ComplianceType::Compliant => ComplianceStatus::Compliant,
            ComplianceType::NonCompliant => ComplianceStatus::NonCompliant,
            ComplianceType::NotApplicable | ComplianceType::InsufficientData => {
                ComplianceStatus::Unknown
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "compliant",
            ComplianceStatus::NonCompliant => "non_compliant",
            ComplianceStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub config_rule_name: String,
    /// When set, a status other than this verdict is a `ComplianceMismatch`.
    #[serde(default)]
    pub expected: Option<bool>,
}

pub struct ComplianceVerifier {
    store: Arc<dyn ComplianceStore>,
}

impl ComplianceVerifier {
    pub fn new(store: Arc<dyn ComplianceStore>) -> Self {
        Self { store }
    }

    /// Look up the current status.
    ///
    /// The by-resource query is authoritative: records are filtered to the
    /// rule and the first one wins. The by-rule query only serves as a
    /// cross-check and a disagreement is logged, never raised.
    pub fn verify(&self, req: &VerifyRequest) -> Result<ComplianceStatus> {
        let types = [ComplianceType::Compliant, ComplianceType::NonCompliant];
        let status = self
            .store
            .compliance_by_resource(&req.resource_type, &req.resource_id, &types)?
            .into_iter()
            .find(|r| r.qualifier().config_rule_name == req.config_rule_name)
            .map(|r| ComplianceStatus::from_type(r.compliance_type))
            .unwrap_or(ComplianceStatus::Unknown);

        let by_rule = self.cross_check(req)?;
        if by_rule != status {
            warn!(
                rule = %req.config_rule_name,
                resource_id = %req.resource_id,
                by_resource = %status,
                by_rule = %by_rule,
                "compliance queries disagree"
            );
        }
        debug!(rule = %req.config_rule_name, resource_id = %req.resource_id, status = %status, "compliance status");

        if let Some(expected) = req.expected {
            let expected = ComplianceStatus::from_verdict(expected);
            if expected != status {
                return Err(CbcError::ComplianceMismatch {
                    expected: expected.to_string(),
                    actual: status.to_string(),
                });
            }
        }
        Ok(status)
    }

    fn cross_check(&self, req: &VerifyRequest) -> Result<ComplianceStatus> {
        let types = [
            ComplianceType::Compliant,
            ComplianceType::NonCompliant,
            ComplianceType::NotApplicable,
        ];
        Ok(self
            .store
            .compliance_by_rule(&req.config_rule_name, &types, BY_RULE_LIMIT)?
            .into_iter()
            .find(|r| r.qualifier().resource_id == req.resource_id)
            .map(|r| ComplianceStatus::from_type(r.compliance_type))
            .unwrap_or(ComplianceStatus::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::LocalComplianceStore;

    fn request(expected: Option<bool>) -> VerifyRequest {
        VerifyRequest {
            resource_type: "AWS::SQS::Queue".into(),
            resource_id: "q-1".into(),
            config_rule_name: "SQS-PoC".into(),
            expected,
        }
    }

    fn verifier() -> (Arc<LocalComplianceStore>, ComplianceVerifier) {
        let store = Arc::new(LocalComplianceStore::in_memory());
        (store.clone(), ComplianceVerifier::new(store))
    }

    #[test]
    fn no_record_is_unknown() {
        let (_, v) = verifier();
        assert_eq!(v.verify(&request(None)).unwrap(), ComplianceStatus::Unknown);
    }

    #[test]
    fn only_the_requested_rule_counts() {
        let (store, v) = verifier();
        store
            .record("Other", "AWS::SQS::Queue", "q-1", ComplianceType::NonCompliant)
            .unwrap();
        store
            .record("SQS-PoC", "AWS::SQS::Queue", "q-1", ComplianceType::Compliant)
            .unwrap();
        assert_eq!(v.verify(&request(None)).unwrap(), ComplianceStatus::Compliant);
    }

    #[test]
    fn expected_status_must_match() {
        let (store, v) = verifier();
        store
            .record("SQS-PoC", "AWS::SQS::Queue", "q-1", ComplianceType::NonCompliant)
            .unwrap();
        assert_eq!(
            v.verify(&request(Some(false))).unwrap(),
            ComplianceStatus::NonCompliant
        );
        let err = v.verify(&request(Some(true))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComplianceMismatch);
    }

    #[test]
    fn unknown_never_satisfies_an_expectation() {
        let (_, v) = verifier();
        assert!(v.verify(&request(Some(true))).is_err());
        assert!(v.verify(&request(Some(false))).is_err());
    }
}
