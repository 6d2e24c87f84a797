//! Outcome model: what a worker reports when it releases a lease.

use serde::{Deserialize, Serialize};

/// Result of one attempt, as reported on release.
///
/// - `success`: the task is done; the optional result document is stored.
/// - `failure`: the attempt is counted; retry policy decides requeue vs fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Failure {
        reason: String,
    },
}

impl Outcome {
    pub fn success(result: serde_json::Value) -> Self {
        Outcome::Success {
            result: Some(result),
        }
    }

    pub fn success_empty() -> Self {
        Outcome::Success { result: None }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_tagged() {
        let v = serde_json::to_value(Outcome::failure("boom")).unwrap();
        assert_eq!(v["outcome"], "failure");
        assert_eq!(v["reason"], "boom");

        let back: Outcome =
            serde_json::from_value(serde_json::json!({"outcome": "success"})).unwrap();
        assert_eq!(back, Outcome::success_empty());
    }
}
