//! # Operation Outcomes
//!
//! The uniform two-shape result surfaced at the boundary: either
//! `{status: "success", data, message}` or `{status: "error", data: null,
//! message}` with an enumerated error kind.
//!
//! Internally everything is `Result<T, CorpusError>`; this envelope exists
//! for boundary layers that serialize results instead of branching on a
//! Rust enum.

use crate::types::CorpusError;
use serde::Serialize;

/// Outcome discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Serializable operation envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    /// `success` or `error`.
    pub status: OutcomeStatus,
    /// Payload on success, `null` on error.
    pub data: Option<T>,
    /// Human-readable diagnostic.
    pub message: String,
    /// Enumerated error kind; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl<T> Outcome<T> {
    /// Successful outcome.
    #[must_use]
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            data: Some(data),
            message: message.into(),
            kind: None,
        }
    }

    /// Failed outcome carrying the error's message and kind.
    #[must_use]
    pub fn error(error: &CorpusError) -> Self {
        Self {
            status: OutcomeStatus::Error,
            data: None,
            message: error.to_string(),
            kind: Some(error.kind()),
        }
    }

    /// Whether the outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

impl<T> From<Result<T, CorpusError>> for Outcome<T> {
    fn from(result: Result<T, CorpusError>) -> Self {
        match result {
            Ok(data) => Self::success(data, "ok"),
            Err(error) => Self::error(&error),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityRef;

    #[test]
    fn success_carries_data() {
        let outcome: Outcome<u32> = Ok(7).into();
        assert!(outcome.is_success());
        assert_eq!(outcome.data, Some(7));
        assert_eq!(outcome.kind, None);
    }

    #[test]
    fn error_carries_message_and_kind() {
        let outcome: Outcome<u32> =
            Err(CorpusError::EntityNotFound(EntityRef::new("a", "1"))).into();
        assert!(!outcome.is_success());
        assert_eq!(outcome.data, None);
        assert_eq!(outcome.kind, Some("not_found"));
        assert!(outcome.message.contains("a:1"));
    }

    #[test]
    fn serialized_shape_matches_the_boundary_contract() {
        let outcome: Outcome<u32> = Outcome::success(1, "ok");
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"], 1);
        assert_eq!(json["message"], "ok");

        let failed: Outcome<u32> = Outcome::error(&CorpusError::Validation("bad".into()));
        let json = serde_json::to_value(&failed).expect("serialize");
        assert_eq!(json["status"], "error");
        assert_eq!(json["data"], serde_json::Value::Null);
        assert_eq!(json["kind"], "validation_failed");
    }
}
