//! Inbound chat payload shared by every transport.

use chabito::db::ContactInfo;
use chabito::models::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const INVALID_JSON_DETAIL: &str = "Payload must be valid JSON";
pub const INVALID_PAYLOAD_DETAIL: &str = "Payload does not match InputMessageDTO";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub message: String,
    pub user_id: String,
    pub sender_nickname: Option<String>,
    pub sender_jid: Option<String>,
    pub mime_type: Option<String>,
    pub file_base64: Option<String>,
}

/// One field-level problem, shaped like the validation errors clients already parse
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub loc: Vec<String>,
    pub msg: String,
    pub input: Value,
}

impl ValidationIssue {
    fn new(kind: &str, loc: &[&str], msg: &str, input: Value) -> Self {
        Self {
            kind: kind.to_string(),
            loc: loc.iter().map(|s| s.to_string()).collect(),
            msg: msg.to_string(),
            input,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Payload must be valid JSON")]
    InvalidJson,

    #[error("Payload does not match InputMessageDTO")]
    InvalidPayload(Vec<ValidationIssue>),
}

impl PayloadError {
    pub fn code(&self) -> &'static str {
        match self {
            PayloadError::InvalidJson => "invalid_json",
            PayloadError::InvalidPayload(_) => "invalid_payload",
        }
    }

    /// Structured body sent back to the client
    pub fn to_json(&self) -> Value {
        match self {
            PayloadError::InvalidJson => json!({
                "error": self.code(),
                "detail": INVALID_JSON_DETAIL,
            }),
            PayloadError::InvalidPayload(issues) => json!({
                "error": self.code(),
                "detail": INVALID_PAYLOAD_DETAIL,
                "validation_errors": issues,
            }),
        }
    }
}

/// Decode and validate a raw text frame or request body.
///
/// Every field problem is reported, not just the first one.
pub fn parse_payload(raw: &str) -> Result<InputMessage, PayloadError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| PayloadError::InvalidJson)?;
    validate(&value)
}

fn validate(value: &Value) -> Result<InputMessage, PayloadError> {
    let Some(object) = value.as_object() else {
        return Err(PayloadError::InvalidPayload(vec![ValidationIssue::new(
            "model_type",
            &[],
            "Input should be a valid dictionary",
            value.clone(),
        )]));
    };

    let mut issues = Vec::new();
    let message = required_string(object, "message", value, &mut issues);
    let user_id = required_string(object, "user_id", value, &mut issues);
    let sender_nickname = optional_string(object, "sender_nickname", &mut issues);
    let sender_jid = optional_string(object, "sender_jid", &mut issues);
    let mime_type = optional_string(object, "mime_type", &mut issues);
    let file_base64 = optional_string(object, "file_base64", &mut issues);

    match (message, user_id) {
        (Some(message), Some(user_id)) if issues.is_empty() => Ok(InputMessage {
            message,
            user_id,
            sender_nickname,
            sender_jid,
            mime_type,
            file_base64,
        }),
        _ => Err(PayloadError::InvalidPayload(issues)),
    }
}

fn required_string(
    object: &Map<String, Value>,
    field: &str,
    payload: &Value,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match object.get(field) {
        None => {
            issues.push(ValidationIssue::new(
                "missing",
                &[field],
                "Field required",
                payload.clone(),
            ));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            issues.push(string_type_issue(field, other));
            None
        }
    }
}

fn optional_string(
    object: &Map<String, Value>,
    field: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match object.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            issues.push(string_type_issue(field, other));
            None
        }
    }
}

fn string_type_issue(field: &str, input: &Value) -> ValidationIssue {
    ValidationIssue::new(
        "string_type",
        &[field],
        "Input should be a valid string",
        input.clone(),
    )
}

impl InputMessage {
    /// The human message for the agent: the text, plus the attachment when it is an image
    pub fn to_human_message(&self) -> Message {
        let mut message = Message::human().with_text(&self.message);
        match (&self.file_base64, &self.mime_type) {
            (Some(data), Some(mime_type)) if mime_type.starts_with("image/") => {
                message = message.with_image(data, mime_type);
            }
            (Some(_), mime_type) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    mime_type = mime_type.as_deref().unwrap_or("unknown"),
                    "ignoring unsupported attachment"
                );
            }
            _ => {}
        }
        message
    }

    pub fn contact(&self) -> ContactInfo {
        ContactInfo::new(
            &self.user_id,
            self.sender_nickname.as_deref().unwrap_or(&self.user_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_payload() {
        let input = parse_payload(r#"{"message": "hola", "user_id": "u1"}"#).unwrap();
        assert_eq!(input.message, "hola");
        assert_eq!(input.user_id, "u1");
        assert!(input.sender_nickname.is_none());
        assert!(input.file_base64.is_none());
    }

    #[test]
    fn test_parse_full_payload() {
        let input = parse_payload(
            r#"{"message": "mira", "user_id": "u1", "sender_nickname": "Ana",
                "sender_jid": "521@s.whatsapp.net", "mime_type": "image/png",
                "file_base64": "aGVsbG8=", "extra": 1}"#,
        )
        .unwrap();
        assert_eq!(input.sender_nickname.as_deref(), Some("Ana"));
        assert_eq!(input.sender_jid.as_deref(), Some("521@s.whatsapp.net"));
        assert_eq!(input.mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_invalid_json() {
        let err = parse_payload("not-json").unwrap_err();
        assert_eq!(err, PayloadError::InvalidJson);
        assert_eq!(
            err.to_json(),
            json!({"error": "invalid_json", "detail": "Payload must be valid JSON"})
        );
    }

    #[test]
    fn test_wrong_type_and_missing_field() {
        let err = parse_payload(r#"{"message": 123}"#).unwrap_err();
        let PayloadError::InvalidPayload(issues) = &err else {
            panic!("expected invalid payload");
        };
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].kind, "string_type");
        assert_eq!(issues[0].loc, vec!["message".to_string()]);
        assert_eq!(issues[0].input, json!(123));
        assert_eq!(issues[1].kind, "missing");
        assert_eq!(issues[1].loc, vec!["user_id".to_string()]);

        let body = err.to_json();
        assert_eq!(body["error"], "invalid_payload");
        assert_eq!(body["detail"], "Payload does not match InputMessageDTO");
        assert_eq!(err.to_string(), "Payload does not match InputMessageDTO");
        assert_eq!(body["validation_errors"][0]["type"], "string_type");
        assert_eq!(body["validation_errors"][0]["msg"], "Input should be a valid string");
    }

    #[test]
    fn test_non_object_payload() {
        let err = parse_payload("[1, 2]").unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }

    #[test]
    fn test_null_optional_fields() {
        let input =
            parse_payload(r#"{"message": "hola", "user_id": "u1", "mime_type": null}"#).unwrap();
        assert!(input.mime_type.is_none());
        assert!(parse_payload(r#"{"message": "hola", "user_id": "u1", "mime_type": 1}"#).is_err());
    }

    #[test]
    fn test_human_message_with_image() {
        let input = parse_payload(
            r#"{"message": "mira", "user_id": "u1",
                "mime_type": "image/jpeg", "file_base64": "AAAA"}"#,
        )
        .unwrap();
        let message = input.to_human_message();
        assert_eq!(message.text(), "mira");
        assert_eq!(message.images().len(), 1);
        assert_eq!(message.images()[0].mime_type, "image/jpeg");
    }

    #[test]
    fn test_non_image_attachment_is_ignored() {
        let input = parse_payload(
            r#"{"message": "escucha", "user_id": "u1",
                "mime_type": "audio/ogg", "file_base64": "AAAA"}"#,
        )
        .unwrap();
        let message = input.to_human_message();
        assert_eq!(message.text(), "escucha");
        assert!(message.images().is_empty());
    }

    #[test]
    fn test_contact_falls_back_to_user_id() {
        let input = parse_payload(r#"{"message": "hola", "user_id": "521"}"#).unwrap();
        assert_eq!(input.contact(), ContactInfo::new("521", "521"));
    }
}
