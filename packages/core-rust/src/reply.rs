//! Structured reply body shared by every worker.
//!
//! Business failures travel inside a successful reply as
//! `{"status": "error", ...}`; the transport only reports its own failures.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Outcome reported by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// JSON reply body: `{status, message?, data?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyBody {
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ReplyBody {
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            message: None,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn ok_message(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            message: Some(message.into()),
            data: None,
            error: None,
        }
    }

    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: None,
            data: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Human-readable failure text: `error`, falling back to `message`.
    #[must_use]
    pub fn failure_text(&self) -> Option<&str> {
        if self.is_ok() {
            return None;
        }
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .or(Some("unspecified error"))
    }

    /// Serializes to JSON bytes. Serializing this type cannot fail: every
    /// field is a string, an enum, or an already-valid JSON value.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Parses a reply body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if `bytes` is not a reply body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ok_body_wire_shape() {
        let body = ReplyBody::ok(json!({"credits": 5}));
        let value: serde_json::Value = serde_json::from_slice(&body.to_bytes()).unwrap();
        assert_eq!(value, json!({"status": "ok", "data": {"credits": 5}}));
    }

    #[test]
    fn error_body_reports_failure_text() {
        let body = ReplyBody::error("Failed to process data: db down");
        assert!(!body.is_ok());
        assert_eq!(body.failure_text(), Some("Failed to process data: db down"));
    }

    #[test]
    fn error_with_only_message_falls_back() {
        let body: ReplyBody =
            serde_json::from_str(r#"{"status":"error","message":"Invalid payload"}"#).unwrap();
        assert_eq!(body.failure_text(), Some("Invalid payload"));
        assert_eq!(ReplyBody::ok_message("done").failure_text(), None);
    }

    #[test]
    fn non_reply_json_is_rejected() {
        assert!(ReplyBody::from_slice(br#"{"credits": 5}"#).is_err());
    }
}
