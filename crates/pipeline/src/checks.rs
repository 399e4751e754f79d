//! Policy gates and the docs bundle.
//!
//! Thin wrappers around existing tools — no internal state machine. A gate
//! rejecting the tree is a [`PolicyViolation`]; a tool that cannot even be
//! spawned is an infrastructure failure. None of these need a live topology.
//!
//! [`PolicyViolation`]: crate::error::FailureClass::Policy

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PipelineError;

/// One external gate.
#[derive(Debug, Clone)]
pub struct PolicyCheck {
    pub name: &'static str,
    program: &'static str,
    args: &'static [&'static str],
}

/// The standard gate set: style, lint, license/dependency scan.
pub const POLICY_CHECKS: &[PolicyCheck] = &[
    PolicyCheck {
        name: "fmt",
        program: "cargo",
        args: &["fmt", "--all", "--check"],
    },
    PolicyCheck {
        name: "clippy",
        program: "cargo",
        args: &["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"],
    },
    PolicyCheck {
        name: "licenses",
        program: "cargo",
        args: &["deny", "check", "licenses", "bans"],
    },
];

impl PolicyCheck {
    /// Run the gate in `dir`.
    pub async fn run(&self, dir: &Path) -> Result<(), PipelineError> {
        debug!(check = self.name, "running policy check");
        let output = Command::new(self.program)
            .args(self.args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| {
                PipelineError::infra(format!("spawning {} for {}: {e}", self.program, self.name))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PipelineError::Policy {
                tool: self.name.to_string(),
                detail: stderr.lines().last().unwrap_or("no output").to_string(),
            })
        }
    }
}

/// Build one feature-matrix cell: plain compilation, a wrapper around cargo.
pub async fn run_matrix_build(
    dir: &Path,
    features: &[String],
    no_default_features: bool,
    cargo_home: Option<&Path>,
) -> Result<(), PipelineError> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--all-targets"]);
    if no_default_features {
        cmd.arg("--no-default-features");
    }
    if !features.is_empty() {
        cmd.arg("--features");
        cmd.arg(features.join(","));
    }
    cmd.current_dir(dir);
    if let Some(home) = cargo_home {
        cmd.env("CARGO_HOME", home);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| PipelineError::infra(format!("spawning cargo build: {e}")))?;
    if !output.status.success() {
        return Err(PipelineError::infra(format!(
            "build failed: {}",
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or("no output")
        )));
    }
    Ok(())
}

/// Generate documentation and compress it into one external artifact.
pub async fn build_docs_bundle(dir: &Path, bundle: &Path) -> Result<PathBuf, PipelineError> {
    let output = Command::new("cargo")
        .args(["doc", "--no-deps"])
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| PipelineError::infra(format!("spawning cargo doc: {e}")))?;
    if !output.status.success() {
        return Err(PipelineError::infra(format!(
            "cargo doc failed: {}",
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or("no output")
        )));
    }

    let doc_dir = dir.join("target").join("doc");
    let output = Command::new("tar")
        .arg("czf")
        .arg(bundle)
        .arg("-C")
        .arg(&doc_dir)
        .arg(".")
        .output()
        .await
        .map_err(|e| PipelineError::infra(format!("spawning tar: {e}")))?;
    if !output.status.success() {
        return Err(PipelineError::infra(format!(
            "doc bundle compression failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    info!(bundle = %bundle.display(), "documentation bundle built");
    Ok(bundle.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    #[test]
    fn test_standard_gate_set() {
        let names: Vec<&str> = POLICY_CHECKS.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["fmt", "clippy", "licenses"]);
    }

    #[tokio::test]
    async fn test_missing_tool_is_infrastructure_not_policy() {
        let check = PolicyCheck {
            name: "ghost",
            program: "definitely-not-a-real-tool-9b1f",
            args: &[],
        };
        let err = check.run(Path::new(".")).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Infrastructure);
    }

    #[tokio::test]
    async fn test_nonzero_gate_exit_is_policy_violation() {
        let check = PolicyCheck {
            name: "always-red",
            program: "false",
            args: &[],
        };
        let err = check.run(Path::new(".")).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Policy);
        match err {
            PipelineError::Policy { tool, .. } => assert_eq!(tool, "always-red"),
            other => panic!("expected policy violation, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_passing_gate_is_silent() {
        let check = PolicyCheck {
            name: "always-green",
            program: "true",
            args: &[],
        };
        check.run(Path::new(".")).await.unwrap();
    }
}
