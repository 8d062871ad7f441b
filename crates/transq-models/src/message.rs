//! Queue message bodies.
//!
//! Messages are JSON objects with a `type` tag. Decoding distinguishes a
//! body that is not a message at all from a well-formed message of a type
//! this version does not know, so callers can drop both without crashing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobId};

/// Tag of a transcode work message.
pub const TRANSCODE_TYPE: &str = "TRANSCODE";

/// Tag of a completion notification.
pub const NOTIFY_TYPE: &str = "NOTIFY";

/// Why a queue body could not be turned into a [`WorkMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Payload of a `TRANSCODE` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeMessage {
    pub job_id: JobId,
    pub owner_id: String,
    pub input_ref: String,
    pub output_ref: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TranscodeMessage {
    /// Build the work message describing a job record.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            input_ref: job.input_ref.clone(),
            output_ref: job.output_ref.clone(),
            params: job.params.clone(),
        }
    }
}

/// A message on the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkMessage {
    #[serde(rename = "TRANSCODE")]
    Transcode(TranscodeMessage),
}

impl WorkMessage {
    /// Decode a raw queue body.
    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let kind = value
            .as_object()
            .ok_or_else(|| DecodeError::Malformed("body is not a JSON object".into()))?
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing string field `type`".into()))?;

        if kind != TRANSCODE_TYPE {
            return Err(DecodeError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Encode to the JSON wire format.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Type tag of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            WorkMessage::Transcode(_) => TRANSCODE_TYPE,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            WorkMessage::Transcode(m) => &m.job_id,
        }
    }
}

/// Completion notification published after a job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: JobId,
    pub owner_id: String,
    pub output_ref: String,
}

impl NotifyMessage {
    pub fn new(job_id: JobId, owner_id: impl Into<String>, output_ref: impl Into<String>) -> Self {
        Self {
            kind: NOTIFY_TYPE.to_string(),
            job_id,
            owner_id: owner_id.into(),
            output_ref: output_ref.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_transcode() {
        let body = json!({
            "type": "TRANSCODE",
            "jobId": "v1",
            "ownerId": "owner-1",
            "inputRef": "raw/v1.mov",
            "outputRef": "out/v1.mp4",
            "params": { "resolution": "1080p" }
        })
        .to_string();

        let WorkMessage::Transcode(msg) = WorkMessage::decode(&body).unwrap();
        assert_eq!(msg.job_id, JobId::from("v1"));
        assert_eq!(msg.params["resolution"], "1080p");
    }

    #[test]
    fn test_encode_carries_type_tag() {
        let msg = WorkMessage::Transcode(TranscodeMessage {
            job_id: JobId::from("v1"),
            owner_id: "owner-1".into(),
            input_ref: "raw/v1.mov".into(),
            output_ref: "out/v1.mp4".into(),
            params: json!({}),
        });
        assert_eq!(msg.message_type(), TRANSCODE_TYPE);
        assert_eq!(msg.job_id(), &JobId::from("v1"));

        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "TRANSCODE");
        assert_eq!(value["outputRef"], "out/v1.mp4");
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            WorkMessage::decode("not-json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            WorkMessage::decode("[1, 2]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_fields_is_malformed() {
        let body = json!({ "type": "TRANSCODE", "jobId": "v1" }).to_string();
        assert!(matches!(
            WorkMessage::decode(&body),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let body = json!({ "type": "THUMBNAIL", "jobId": "v1" }).to_string();
        assert_eq!(
            WorkMessage::decode(&body),
            Err(DecodeError::UnknownType("THUMBNAIL".into()))
        );
    }

    #[test]
    fn test_notify_wire_format() {
        let msg = NotifyMessage::new(JobId::from("v1"), "owner-1", "out/v1.mp4");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "NOTIFY");
        assert_eq!(value["jobId"], "v1");
    }
}
