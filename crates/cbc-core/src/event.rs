//! Trigger events delivered by the configuration-change rule.
//!
//! The rule invocation payload carries `invokingEvent` as a string-encoded
//! JSON document. It is decoded once on intake; the verbatim payload is kept
//! alongside so the raw input record can be persisted exactly as received.

use serde::{Deserialize, Serialize};

use crate::error::{CbcError, Result};

/// Statuses for which the configuration item no longer exists. Events in
/// these states are acknowledged without submitting an evaluation.
const DELETED_STATUSES: &[&str] = &["ResourceDeleted", "ResourceDeletedNotRecorded"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationItem {
    pub configuration_item_status: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokingEvent {
    configuration_item: ConfigurationItem,
    notification_creation_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationPayload {
    invoking_event: serde_json::Value,
    #[serde(default)]
    rule_parameters: Option<serde_json::Value>,
    result_token: String,
    config_rule_name: String,
}

/// A resource configuration change, decoded from the rule invocation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub resource_type: String,
    pub resource_id: String,
    pub config_rule_name: String,
    pub result_token: String,
    pub configuration_item: ConfigurationItem,
    pub notification_creation_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_parameters: Option<serde_json::Value>,
    /// The invocation payload exactly as received.
    pub raw: serde_json::Value,
}

impl TriggerEvent {
    /// Decode a rule invocation payload.
    ///
    /// Accepts the bare payload or the `{"Config": payload}` wrapper used when
    /// the payload is forwarded into a workflow execution. `invokingEvent` and
    /// `ruleParameters` may be string-encoded JSON or inline objects.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw = match value {
            serde_json::Value::Object(mut map) if map.contains_key("Config") => {
                map.remove("Config").unwrap_or_default()
            }
            other => other,
        };

        let payload: InvocationPayload = serde_json::from_value(raw.clone())
            .map_err(|e| CbcError::InvalidEvent(e.to_string()))?;

        let invoking: InvokingEvent = decode_embedded(payload.invoking_event, "invokingEvent")?;

        let rule_parameters = match payload.rule_parameters {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(decode_embedded::<serde_json::Value>(v, "ruleParameters")?),
        };

        if payload.result_token.is_empty() {
            return Err(CbcError::InvalidEvent("resultToken is empty".into()));
        }

        Ok(Self {
            resource_type: invoking.configuration_item.resource_type.clone(),
            resource_id: invoking.configuration_item.resource_id.clone(),
            config_rule_name: payload.config_rule_name,
            result_token: payload.result_token,
            configuration_item: invoking.configuration_item,
            notification_creation_time: invoking.notification_creation_time,
            rule_parameters,
            raw,
        })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| CbcError::InvalidEvent(e.to_string()))?;
        Self::from_value(value)
    }

    /// Deterministic key under which the raw input record is stored:
    /// `{configRuleName}-{resourceType}-{resourceId}-{notificationCreationTime}`.
    pub fn raw_input_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.config_rule_name,
            self.resource_type,
            self.resource_id,
            self.notification_creation_time
        )
    }

    pub fn is_resource_deleted(&self) -> bool {
        DELETED_STATUSES.contains(&self.configuration_item.configuration_item_status.as_str())
    }
}

fn decode_embedded<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    field: &str,
) -> Result<T> {
    let decoded = match value {
        serde_json::Value::String(s) => serde_json::from_str(&s)
            .map_err(|e| CbcError::InvalidEvent(format!("{field} is not valid JSON: {e}")))?,
        other => other,
    };
    serde_json::from_value(decoded).map_err(|e| CbcError::InvalidEvent(format!("{field}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sqs_payload(status: &str, time: &str) -> serde_json::Value {
        let invoking = json!({
            "configurationItem": {
                "configurationItemStatus": status,
                "resourceType": "AWS::SQS::Queue",
                "resourceId": "q-1",
                "configuration": { "fifoQueue": true }
            },
            "notificationCreationTime": time
        });
        json!({
            "invokingEvent": invoking.to_string(),
            "resultToken": "tok-1",
            "configRuleName": "SQS-PoC"
        })
    }

    #[test]
    fn decodes_string_encoded_invoking_event() {
        let event =
            TriggerEvent::from_value(sqs_payload("OK", "2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(event.resource_type, "AWS::SQS::Queue");
        assert_eq!(event.resource_id, "q-1");
        assert_eq!(event.config_rule_name, "SQS-PoC");
        assert_eq!(event.result_token, "tok-1");
        assert_eq!(event.configuration_item.configuration["fifoQueue"], true);
        assert!(event.rule_parameters.is_none());
    }

    #[test]
    fn raw_input_key_is_deterministic() {
        let event =
            TriggerEvent::from_value(sqs_payload("OK", "2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(
            event.raw_input_key(),
            "SQS-PoC-AWS::SQS::Queue-q-1-2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn accepts_config_wrapper_and_inline_objects() {
        let payload = json!({
            "Config": {
                "invokingEvent": {
                    "configurationItem": {
                        "configurationItemStatus": "OK",
                        "resourceType": "AWS::SQS::Queue",
                        "resourceId": "q-2"
                    },
                    "notificationCreationTime": "2024-02-02T00:00:00Z"
                },
                "ruleParameters": "{\"threshold\": 3}",
                "resultToken": "tok-2",
                "configRuleName": "SQS-PoC"
            }
        });
        let event = TriggerEvent::from_value(payload).unwrap();
        assert_eq!(event.resource_id, "q-2");
        assert_eq!(event.rule_parameters.unwrap()["threshold"], 3);
        assert!(event.raw.get("Config").is_none(), "raw keeps the unwrapped payload");
    }

    #[test]
    fn deleted_items_are_detected() {
        let event = TriggerEvent::from_value(sqs_payload(
            "ResourceDeleted",
            "2024-01-01T00:00:00Z",
        ))
        .unwrap();
        assert!(event.is_resource_deleted());
    }

    #[test]
    fn missing_token_is_rejected() {
        let mut payload = sqs_payload("OK", "2024-01-01T00:00:00Z");
        payload["resultToken"] = json!("");
        let err = TriggerEvent::from_value(payload).unwrap_err();
        assert!(matches!(err, CbcError::InvalidEvent(_)));
    }

    #[test]
    fn malformed_invoking_event_is_rejected() {
        let payload = json!({
            "invokingEvent": "{not json",
            "resultToken": "tok",
            "configRuleName": "r"
        });
        let err = TriggerEvent::from_value(payload).unwrap_err();
        assert!(err.to_string().contains("invokingEvent"), "{err}");
    }
}
