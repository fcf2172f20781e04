use std::fmt;

use crate::model::GroupId;
use crate::store::StoreError;

/// Errors that abort (or, for [`CompactError::BatchLoad`], retry) a run.
#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    /// The scope has no edges and no groups.
    #[error("scope {scope} has no state groups")]
    ScopeNotFound { scope: String },

    /// The parent graph is not acyclic.
    #[error("state group graph contains a cycle through {}", join_groups(.members))]
    CyclicGraph { members: Vec<GroupId> },

    /// A delta batch could not be read, even after local retries.
    #[error("failed to load delta batch starting at group {first_group} after {attempts} attempt(s): {source}")]
    BatchLoad {
        first_group: GroupId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Input data broke a model invariant; continuing would mean guessing.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Non-retryable store failure outside of batch loading.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CompactError {
    /// Shorthand for [`CompactError::InvariantViolation`].
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ScopeNotFound { .. } => ErrorCode::ScopeNotFound,
            Self::CyclicGraph { .. } => ErrorCode::CyclicGraph,
            Self::BatchLoad { .. } => ErrorCode::BatchLoadFailed,
            Self::InvariantViolation(_) => ErrorCode::InvariantViolation,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Config(_) => ErrorCode::ConfigInvalid,
        }
    }

    /// Whether retrying the failed unit of work could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::BatchLoad { .. })
    }
}

fn join_groups(members: &[GroupId]) -> String {
    members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Machine-readable error codes for operators and wrapping tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalid,
    ScopeNotFound,
    CyclicGraph,
    InvariantViolation,
    BatchLoadFailed,
    StoreFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "E1001",
            Self::ScopeNotFound => "E2001",
            Self::CyclicGraph => "E2002",
            Self::InvariantViolation => "E2003",
            Self::BatchLoadFailed => "E5001",
            Self::StoreFailure => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Invalid configuration",
            Self::ScopeNotFound => "Scope not found",
            Self::CyclicGraph => "State group graph is cyclic",
            Self::InvariantViolation => "State data invariant violated",
            Self::BatchLoadFailed => "Delta batch load failed",
            Self::StoreFailure => "Store failure",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid => Some("Fix the value in the config file or flag and retry."),
            Self::ScopeNotFound => Some("Check the room id; it must own at least one state group."),
            Self::CyclicGraph => {
                Some("Remove the offending state_group_edges rows; groups must form a DAG.")
            }
            Self::InvariantViolation => {
                Some("Repair the upstream state rows, then re-run the compaction from scratch.")
            }
            Self::BatchLoadFailed => Some("Check store availability and re-run; the run is idempotent."),
            Self::StoreFailure => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::{CompactError, ErrorCode};
    use crate::store::StoreError;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigInvalid,
            ErrorCode::ScopeNotFound,
            ErrorCode::CyclicGraph,
            ErrorCode::InvariantViolation,
            ErrorCode::BatchLoadFailed,
            ErrorCode::StoreFailure,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::CyclicGraph.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn cycle_message_lists_members() {
        let err = CompactError::CyclicGraph {
            members: vec![3, 4, 5],
        };
        assert_eq!(
            err.to_string(),
            "state group graph contains a cycle through 3 -> 4 -> 5"
        );
        assert_eq!(err.code(), ErrorCode::CyclicGraph);
    }

    #[test]
    fn only_batch_loads_are_retryable() {
        let batch = CompactError::BatchLoad {
            first_group: 1,
            attempts: 3,
            source: StoreError::Unavailable("down".into()),
        };
        assert!(batch.is_retryable());
        assert!(!CompactError::invariant("x").is_retryable());
        assert!(
            !CompactError::ScopeNotFound {
                scope: "!r".into()
            }
            .is_retryable()
        );
    }
}
