//! Failure taxonomy for the pipeline.
//!
//! Four causes are kept distinguishable end to end, from the failing step
//! through the structured report: infrastructure, conformance, crash
//! discovery and policy. They are never collapsed into one generic failure.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure classification carried into job reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Topology, gateway or tool never became usable; no test verdict exists.
    Infrastructure,
    /// One or more conformance cases failed against a live topology.
    Conformance,
    /// A fuzz target produced a crashing input.
    CrashFound,
    /// A dependency/license/style gate rejected the tree.
    Policy,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Infrastructure => write!(f, "infrastructure"),
            FailureClass::Conformance => write!(f, "conformance"),
            FailureClass::CrashFound => write!(f, "crash_found"),
            FailureClass::Policy => write!(f, "policy"),
        }
    }
}

/// A classified pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cluster, gateway or external tool failed to become ready.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// The conformance suite reported failing cases. All case results are
    /// still available in the suite report; this only carries the totals.
    #[error("conformance failure: {failed} of {total} cases failed")]
    Conformance { failed: usize, total: usize },

    /// A fuzz target crashed. The artifact paths survive the run.
    #[error("crash found in fuzz target '{target}'")]
    CrashFound {
        target: String,
        artifacts: Vec<PathBuf>,
    },

    /// A policy gate (fmt, clippy, license/dependency scan) rejected the tree.
    #[error("policy violation from {tool}: {detail}")]
    Policy { tool: String, detail: String },
}

impl PipelineError {
    /// Classify this error for the structured report.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            PipelineError::Infrastructure(_) => FailureClass::Infrastructure,
            PipelineError::Conformance { .. } => FailureClass::Conformance,
            PipelineError::CrashFound { .. } => FailureClass::CrashFound,
            PipelineError::Policy { .. } => FailureClass::Policy,
        }
    }

    /// Shorthand for an infrastructure failure with context.
    pub fn infra(msg: impl Into<String>) -> Self {
        PipelineError::Infrastructure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        assert_eq!(
            PipelineError::infra("node 2 not ready").class(),
            FailureClass::Infrastructure
        );
        assert_eq!(
            PipelineError::Conformance {
                failed: 1,
                total: 10
            }
            .class(),
            FailureClass::Conformance
        );
        assert_eq!(
            PipelineError::CrashFound {
                target: "parse_frame".to_string(),
                artifacts: vec![],
            }
            .class(),
            FailureClass::CrashFound
        );
        assert_eq!(
            PipelineError::Policy {
                tool: "cargo-deny".to_string(),
                detail: "GPL-3.0 in tree".to_string(),
            }
            .class(),
            FailureClass::Policy
        );
    }

    #[test]
    fn test_display_keeps_causes_distinguishable() {
        let infra = PipelineError::infra("gateway bind refused").to_string();
        let conf = PipelineError::Conformance {
            failed: 2,
            total: 40,
        }
        .to_string();
        assert!(infra.contains("infrastructure"));
        assert!(conf.contains("2 of 40"));
        assert_ne!(infra, conf);
    }

    #[test]
    fn test_failure_class_serializes_snake_case() {
        let json = serde_json::to_string(&FailureClass::CrashFound).unwrap();
        assert_eq!(json, "\"crash_found\"");
    }
}
