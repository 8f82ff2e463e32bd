//! Commit outcomes and their status codes.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Value, json};

/// Result of a commit, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// 200
    Applied,
    /// 202: queued, waiting on these nodes.
    Deferred(BTreeSet<String>),
    /// 400: validation failed or queueing would close a dependency cycle.
    Invalid(String),
    /// 402
    AlreadyCommitting(String),
    /// 404
    NotFound(String),
    /// 405: the configuration pass failed on `nodes` after one retry.
    Failed { message: String, nodes: Vec<String> },
    /// 500: persistence or other internal failure.
    Internal(String),
}

impl CommitOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            CommitOutcome::Applied => 200,
            CommitOutcome::Deferred(_) => 202,
            CommitOutcome::Invalid(_) => 400,
            CommitOutcome::AlreadyCommitting(_) => 402,
            CommitOutcome::NotFound(_) => 404,
            CommitOutcome::Failed { .. } => 405,
            CommitOutcome::Internal(_) => 500,
        }
    }

    /// Body returned alongside the status code.
    pub fn payload(&self) -> Value {
        match self {
            CommitOutcome::Applied => json!({}),
            CommitOutcome::Deferred(nodes) => json!(nodes),
            CommitOutcome::Failed { message, .. } => json!(message),
            CommitOutcome::Invalid(m)
            | CommitOutcome::AlreadyCommitting(m)
            | CommitOutcome::NotFound(m)
            | CommitOutcome::Internal(m) => json!(m),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommitOutcome::Applied)
    }

    /// Build the 405 outcome for nodes that failed their configuration pass.
    pub fn failed_on(nodes: Vec<String>) -> Self {
        let message = format!("Failed to apply the proposal to: {}", nodes.join(" "));
        CommitOutcome::Failed { message, nodes }
    }
}

impl fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code(), self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_lists_nodes() {
        let outcome = CommitOutcome::failed_on(vec!["n1".into(), "n3".into()]);
        assert_eq!(outcome.status_code(), 405);
        assert_eq!(outcome.payload(), json!("Failed to apply the proposal to: n1 n3"));
    }

    #[test]
    fn deferred_payload_is_node_list() {
        let outcome = CommitOutcome::Deferred(["n2".to_string(), "n1".to_string()].into());
        assert_eq!(outcome.status_code(), 202);
        assert_eq!(outcome.payload(), json!(["n1", "n2"]));
        assert_eq!(outcome.to_string(), r#"202 ["n1","n2"]"#);
    }
}
