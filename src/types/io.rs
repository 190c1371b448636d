//! Input and output records for job execution.
//!
//! An [`Input`] is a `(key, value)` pair waiting to be dispatched to the
//! backend; an [`Output`] is the per-key result a worker produced. Values are
//! opaque byte sequences as far as the engine is concerned — the REST gateway
//! happens to put JSON in them, but nothing here depends on that.

use serde::{Deserialize, Serialize};

/// A single unit of work: one key/value pair to POST to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// Opaque key; becomes the last URL path segment and the result-store key.
    pub key: String,

    /// POST body sent to the backend.
    pub value: Vec<u8>,

    /// How many times this input has been re-enqueued after a failure.
    /// Engine-private; starts at 0.
    pub(crate) retry_count: u32,
}

impl Input {
    /// Creates a fresh input with a zero retry count.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Input {
            key: key.into(),
            value: value.into(),
            retry_count: 0,
        }
    }
}

/// Details of an unrecoverable per-key failure.
///
/// Stored in the result store's error keyspace and surfaced over REST, so
/// this is serde-serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputError {
    /// HTTP status the backend replied with, or 0 when no response was
    /// obtained (e.g. request construction failure).
    #[serde(rename = "statusCode")]
    pub status_code: u16,

    /// Human-readable classification of the failure.
    pub message: String,

    /// Response body read best-effort from the failing reply.
    pub body: String,
}

/// The definitive result for one input key: either the backend's response
/// body or the error that ended the attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub key: String,

    /// Backend response body on success; empty when `error` is set.
    pub value: Vec<u8>,

    pub error: Option<OutputError>,
}

impl Output {
    /// A successful output carrying the backend's response body.
    pub fn success(key: impl Into<String>, value: Vec<u8>) -> Self {
        Output {
            key: key.into(),
            value,
            error: None,
        }
    }

    /// A failed output carrying the terminal error for this key.
    pub fn failed(key: impl Into<String>, error: OutputError) -> Self {
        Output {
            key: key.into(),
            value: Vec::new(),
            error: Some(error),
        }
    }

    /// Returns true if this output represents a successful backend call.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_input_starts_with_zero_retries() {
        let input = Input::new("k", b"v".to_vec());
        assert_eq!(input.retry_count, 0);
    }

    #[test]
    fn success_output_has_no_error() {
        let out = Output::success("k", b"body".to_vec());
        assert!(out.is_success());
        assert_eq!(out.value, b"body");
    }

    #[test]
    fn failed_output_has_empty_value() {
        let out = Output::failed(
            "k",
            OutputError {
                status_code: 400,
                message: "backend returned 400".to_string(),
                body: "bad".to_string(),
            },
        );
        assert!(!out.is_success());
        assert!(out.value.is_empty());
        assert_eq!(out.error.as_ref().unwrap().status_code, 400);
    }

    #[test]
    fn output_error_serializes_status_code_in_camel_case() {
        let err = OutputError {
            status_code: 502,
            message: "m".to_string(),
            body: "b".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["statusCode"], 502);
    }
}
