use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code used when an install is interrupted (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("{}", unknown_dependency_message(.name, .required_by.as_deref(), .suggestion.as_deref()))]
    UnknownDependency {
        name: String,
        required_by: Option<String>,
        suggestion: Option<String>,
    },

    #[error("Invalid formula {name}: {reason}")]
    InvalidFormula { name: String, reason: String },

    #[error("Failed to fetch {url} after {attempts} attempt(s): {reason}")]
    FetchFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Integrity check failed: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Failed to extract {}: {reason}", .archive.display())]
    Extraction { archive: PathBuf, reason: String },

    #[error("Install step {index} ({step}) failed with {status}\n{output}")]
    InstallStepFailed {
        index: usize,
        step: String,
        status: String,
        output: String,
    },

    #[error("Validation `{command}` failed with {status}\n{output}")]
    ValidationFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Dependency {dependency} failed to install")]
    DependencyFailed { dependency: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("Cannot uninstall {name}: required by {}", .dependents.join(", "))]
    HasDependents {
        name: String,
        dependents: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

fn unknown_dependency_message(
    name: &str,
    required_by: Option<&str>,
    suggestion: Option<&str>,
) -> String {
    let mut message = match required_by {
        Some(parent) => format!("Unknown dependency {} (required by {})", name, parent),
        None => format!("No formula named {}", name),
    };
    if let Some(suggestion) = suggestion {
        message.push_str(&format!("; did you mean {}?", suggestion));
    }
    message
}

impl InstallError {
    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            InstallError::CyclicDependency { .. }
            | InstallError::UnknownDependency { .. }
            | InstallError::InvalidFormula { .. }
            | InstallError::DependencyFailed { .. } => 2,
            InstallError::FetchFailed { .. } => 3,
            InstallError::IntegrityMismatch { .. } => 4,
            InstallError::Extraction { .. } | InstallError::InstallStepFailed { .. } => 5,
            InstallError::ValidationFailed { .. } => 6,
            InstallError::HasDependents { .. } => 7,
            InstallError::Cancelled => EXIT_CANCELLED,
            InstallError::NotInstalled(_)
            | InstallError::Io(_)
            | InstallError::Json(_)
            | InstallError::Other(_) => 1,
        }
    }
}

/// Per-formula install state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Resolving,
    Fetching,
    Verifying,
    Installing,
    Validating,
    Committed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolving => "resolving",
            Phase::Fetching => "fetching",
            Phase::Verifying => "verifying",
            Phase::Installing => "installing",
            Phase::Validating => "validating",
            Phase::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// A failure attributed to one formula and the phase it was in.
#[derive(Error, Debug)]
#[error("{formula}: {phase} failed: {error}")]
pub struct InstallFailure {
    pub formula: String,
    pub phase: Phase,
    #[source]
    pub error: InstallError,
}

impl InstallFailure {
    pub fn new(formula: impl Into<String>, phase: Phase, error: InstallError) -> Self {
        Self {
            formula: formula.into(),
            phase,
            error,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = InstallError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_unknown_dependency_message() {
        let err = InstallError::UnknownDependency {
            name: "nunpy".into(),
            required_by: Some("earthscii".into()),
            suggestion: Some("numpy".into()),
        };
        assert_eq!(
            err.to_string(),
            "Unknown dependency nunpy (required by earthscii); did you mean numpy?"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let codes = [
            InstallError::CyclicDependency { cycle: vec![] }.exit_code(),
            InstallError::FetchFailed {
                url: String::new(),
                attempts: 3,
                reason: String::new(),
            }
            .exit_code(),
            InstallError::IntegrityMismatch {
                expected: String::new(),
                actual: String::new(),
            }
            .exit_code(),
            InstallError::InstallStepFailed {
                index: 0,
                step: String::new(),
                status: String::new(),
                output: String::new(),
            }
            .exit_code(),
            InstallError::ValidationFailed {
                command: String::new(),
                status: String::new(),
                output: String::new(),
            }
            .exit_code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_failure_carries_formula_and_phase() {
        let failure = InstallFailure::new(
            "libx",
            Phase::Verifying,
            InstallError::IntegrityMismatch {
                expected: "aa".into(),
                actual: "bb".into(),
            },
        );
        let message = failure.to_string();
        assert!(message.starts_with("libx: verifying failed"));
        assert!(message.contains("expected sha256 aa, got bb"));
        assert_eq!(failure.exit_code(), 4);
    }
}
