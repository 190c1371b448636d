//! Newtype wrapper for job identifiers.
//!
//! Job IDs are UUID v4 values. The newtype prevents bare strings from being
//! passed where a job identifier is expected and makes registry keys
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing an invalid job identifier.
#[derive(Debug, Clone, Error)]
#[error("invalid job id: {preview}")]
pub struct InvalidJobId {
    preview: String,
}

/// A job identifier (UUID v4).
///
/// Construction happens via [`JobId::new`] (fresh random ID) or
/// [`JobId::parse`], which validates the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random (v4) job ID.
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    /// Parses a string as a job ID, validating the UUID format.
    pub fn parse(s: &str) -> Result<Self, InvalidJobId> {
        Uuid::parse_str(s).map(JobId).map_err(|_| InvalidJobId {
            preview: s.chars().take(40).collect(),
        })
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn parse_roundtrips_display() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(JobId::parse("not-a-uuid").is_err());
        assert!(JobId::parse("").is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
