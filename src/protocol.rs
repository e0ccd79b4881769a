//! Codec & Protocol
//!
//! Every socket frame is a JSON object `{id, type, action?, payload?, metadata?}`.
//! `Frame` is the envelope we decode inbound frames into and the enum of
//! frames we encode back onto the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, RetryInfo};

/// Inbound frame from the client: the only shape a socket frame can take
/// when it originates client-side.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RequestFrame {
    /// Parse an inbound wire message, rejecting malformed JSON.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::StreamerError> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::StreamerError::validation(format!("malformed frame: {e}")))
    }
}

/// Outbound frames the server may emit for a given request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum ResponseFrame {
    #[serde(rename = "ack")]
    Ack {
        id: String,
        status: AckStatus,
        message: String,
    },
    #[serde(rename = "progress")]
    Progress {
        id: String,
        percentage: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
        timestamp: i64,
    },
    #[serde(rename = "result")]
    Result {
        id: String,
        success: bool,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<RetryInfo>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Queued,
    Accepted,
}

impl ResponseFrame {
    pub fn ack_queued(id: impl Into<String>, request_id: &str) -> Self {
        ResponseFrame::Ack {
            id: id.into(),
            status: AckStatus::Queued,
            message: format!("queued as {request_id}"),
        }
    }

    pub fn ack_accepted(id: impl Into<String>) -> Self {
        ResponseFrame::Ack {
            id: id.into(),
            status: AckStatus::Accepted,
            message: "accepted".to_string(),
        }
    }

    pub fn result(id: impl Into<String>, data: Value) -> Self {
        ResponseFrame::Result {
            id: id.into(),
            success: true,
            data,
            metadata: None,
        }
    }

    pub fn error(id: Option<String>, err: &crate::error::StreamerError) -> Self {
        ResponseFrame::Error {
            id,
            code: err.code,
            message: err.message.clone(),
            details: None,
            retry: err.retry.clone(),
        }
    }

    /// Serialize for transmission over the socket; every frame is UTF-8 JSON.
    /// An unmarshalable value (e.g. non-finite floats nested in `data`) fails
    /// fast with `VALIDATION_ERROR` rather than panicking.
    pub fn encode(&self) -> Result<Vec<u8>, crate::error::StreamerError> {
        serde_json::to_vec(self)
            .map_err(|e| crate::error::StreamerError::validation(format!("unmarshalable frame: {e}")))
    }
}
