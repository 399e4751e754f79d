//! Conformance test execution.
//!
//! Runs the client library's behavioral suite and its embedded doc-example
//! suite against a live target, as two distinct passes — they cannot share
//! one invocation context. The suites themselves are external collaborators
//! reached through `cargo test`; this module assembles their environment,
//! parses the harness output into per-case outcomes, and never fails fast
//! mid-suite.
//!
//! Cases run concurrently against the one shared topology; any resource a
//! case creates (topic names and the like) must be namespaced by the suite
//! itself, since nothing here serializes cases.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::selector::TestTarget;

/// Environment the client suite recognizes.
pub const ENV_INTEGRATION: &str = "TEST_INTEGRATION";
pub const ENV_CONNECT: &str = "KAFKA_CONNECT";
pub const ENV_SASL_CONNECT: &str = "KAFKA_SASL_CONNECT";
pub const ENV_SOCKS_PROXY: &str = "SOCKS_PROXY";

/// The two suite kinds, executed as separate passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    /// Unit and integration tests (`cargo test --lib --tests`).
    Behavioral,
    /// Embedded documentation examples (`cargo test --doc`).
    DocExamples,
}

impl std::fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuiteKind::Behavioral => write!(f, "behavioral"),
            SuiteKind::DocExamples => write!(f, "doc-examples"),
        }
    }
}

/// Outcome of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    /// Ignored by the harness — typically a live-topology case with the
    /// integration gate off.
    Skipped,
}

/// All case outcomes of one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub kind: SuiteKind,
    pub cases: BTreeMap<String, CaseStatus>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl SuiteReport {
    #[must_use]
    pub fn count(&self, status: CaseStatus) -> usize {
        self.cases.values().filter(|s| **s == status).count()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.count(CaseStatus::Failed) == 0
    }
}

/// Both passes of one conformance job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConformanceReport {
    /// Job label, e.g. the backend variant.
    pub label: String,
    pub suites: Vec<SuiteReport>,
}

impl ConformanceReport {
    #[must_use]
    pub fn total_cases(&self) -> usize {
        self.suites.iter().map(|s| s.cases.len()).sum()
    }

    #[must_use]
    pub fn failed_cases(&self) -> usize {
        self.suites.iter().map(|s| s.count(CaseStatus::Failed)).sum()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed_cases() == 0
    }

    /// Convert a failing report into the classified error, keeping the
    /// per-case results intact for the structured report.
    pub fn ensure_passed(&self) -> Result<(), PipelineError> {
        if self.all_passed() {
            Ok(())
        } else {
            Err(PipelineError::Conformance {
                failed: self.failed_cases(),
                total: self.total_cases(),
            })
        }
    }
}

impl std::fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Conformance [{}]", self.label)?;
        for suite in &self.suites {
            writeln!(
                f,
                "  {}: {} passed, {} failed, {} skipped ({:?})",
                suite.kind,
                suite.count(CaseStatus::Passed),
                suite.count(CaseStatus::Failed),
                suite.count(CaseStatus::Skipped),
                suite.duration
            )?;
            for (name, status) in &suite.cases {
                if *status == CaseStatus::Failed {
                    writeln!(f, "    [FAIL] {name}")?;
                }
            }
        }
        Ok(())
    }
}

/// Runs the client suite against one [`TestTarget`].
pub struct ConformanceExecutor {
    client_dir: PathBuf,
    /// Restored dependency state, threaded in as `CARGO_HOME`.
    cargo_home: Option<PathBuf>,
    target: TestTarget,
    label: String,
}

impl ConformanceExecutor {
    pub fn new(client_dir: impl Into<PathBuf>, target: TestTarget, label: impl Into<String>) -> Self {
        Self {
            client_dir: client_dir.into(),
            cargo_home: None,
            target,
            label: label.into(),
        }
    }

    /// Thread restored dependency state through as the cargo home.
    #[must_use]
    pub fn with_cargo_home(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cargo_home = Some(dir.into());
        self
    }

    /// The environment handed to the suite process.
    #[must_use]
    pub fn suite_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(ENV_CONNECT.to_string(), self.target.bootstrap_servers())];
        if self.target.integration {
            env.push((ENV_INTEGRATION.to_string(), "1".to_string()));
        }
        if let Some(sasl) = &self.target.sasl {
            env.push((ENV_SASL_CONNECT.to_string(), sasl.clone()));
        }
        if let Some(proxy) = &self.target.proxy {
            env.push((ENV_SOCKS_PROXY.to_string(), proxy.clone()));
        }
        env
    }

    fn suite_command(&self, kind: SuiteKind) -> Command {
        let mut cmd = Command::new("cargo");
        cmd.arg("test");
        match kind {
            SuiteKind::Behavioral => {
                cmd.args(["--lib", "--tests"]);
            }
            SuiteKind::DocExamples => {
                cmd.arg("--doc");
            }
        }
        if !self.target.features.is_empty() {
            cmd.arg("--features");
            cmd.arg(self.target.features.join(","));
        }
        cmd.arg("--");
        if self.target.integration {
            // Live-topology cases are marked ignored; pull them in only when
            // the gate is on, otherwise they report as skipped.
            cmd.arg("--include-ignored");
        }
        cmd.current_dir(&self.client_dir);
        for (key, value) in self.suite_env() {
            cmd.env(key, value);
        }
        if let Some(home) = &self.cargo_home {
            cmd.env("CARGO_HOME", home);
        }
        cmd
    }

    /// Run one pass and collect per-case outcomes.
    ///
    /// A process that cannot be spawned is an infrastructure failure; a
    /// nonzero exit with parsed case failures is a conformance result, left
    /// for the caller to classify via [`ConformanceReport::ensure_passed`].
    pub async fn run_suite(&self, kind: SuiteKind) -> Result<SuiteReport, PipelineError> {
        info!(label = %self.label, suite = %kind, "running conformance pass");
        let start = std::time::Instant::now();
        let output = self
            .suite_command(kind)
            .output()
            .await
            .map_err(|e| PipelineError::infra(format!("spawning cargo test: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cases = parse_libtest_output(&stdout);
        debug!(suite = %kind, cases = cases.len(), "suite pass finished");

        if cases.is_empty() && !output.status.success() {
            // The harness died before reporting a single case.
            return Err(PipelineError::infra(format!(
                "{kind} suite produced no case results: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("no output")
            )));
        }

        Ok(SuiteReport {
            kind,
            cases,
            duration: start.elapsed(),
        })
    }

    /// Run both passes. Pass two runs even if pass one had failures.
    pub async fn run_all(&self) -> Result<ConformanceReport, PipelineError> {
        let behavioral = self.run_suite(SuiteKind::Behavioral).await?;
        let doc_examples = self.run_suite(SuiteKind::DocExamples).await?;
        Ok(ConformanceReport {
            label: self.label.clone(),
            suites: vec![behavioral, doc_examples],
        })
    }
}

/// Parse libtest's line-per-case output.
fn parse_libtest_output(stdout: &str) -> BTreeMap<String, CaseStatus> {
    let mut cases = BTreeMap::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix("test ") else {
            continue;
        };
        // `test <name> ... <status>`; doc-test names contain spaces, so
        // split on the separator, not on whitespace.
        let Some((name, status)) = rest.rsplit_once(" ... ") else {
            continue;
        };
        let status = match status.trim() {
            "ok" => CaseStatus::Passed,
            "FAILED" => CaseStatus::Failed,
            "ignored" => CaseStatus::Skipped,
            s if s.starts_with("ignored,") => CaseStatus::Skipped,
            _ => continue,
        };
        cases.insert(name.trim().to_string(), status);
    }
    cases
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TestTarget {
        TestTarget {
            bootstrap: vec![
                "invalid:9092".to_string(),
                "127.0.0.1:9014".to_string(),
                "127.0.0.1:9015".to_string(),
            ],
            sasl: Some("127.0.0.1:9017".to_string()),
            proxy: Some("127.0.0.1:1080".to_string()),
            features: vec![],
            integration: true,
        }
    }

    #[test]
    fn test_suite_env_carries_full_surface() {
        let executor = ConformanceExecutor::new("/tmp/client", target(), "kafka");
        let env = executor.suite_env();
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(
            get(ENV_CONNECT),
            Some("invalid:9092,127.0.0.1:9014,127.0.0.1:9015")
        );
        assert_eq!(get(ENV_INTEGRATION), Some("1"));
        assert_eq!(get(ENV_SASL_CONNECT), Some("127.0.0.1:9017"));
        assert_eq!(get(ENV_SOCKS_PROXY), Some("127.0.0.1:1080"));
    }

    #[test]
    fn test_unit_only_mode_omits_integration_gate() {
        let mut t = target();
        t.integration = false;
        t.sasl = None;
        t.proxy = None;
        let executor = ConformanceExecutor::new("/tmp/client", t, "kafka");
        let env = executor.suite_env();
        assert!(env.iter().all(|(k, _)| k == ENV_CONNECT));
    }

    #[test]
    fn test_parse_behavioral_output() {
        let stdout = "\
running 4 tests
test client::tests::discovers_controller ... ok
test client::tests::redirects_from_non_leader ... ok
test produce_roundtrip ... FAILED
test needs_live_cluster ... ignored

failures:
    produce_roundtrip
";
        let cases = parse_libtest_output(stdout);
        assert_eq!(cases.len(), 4);
        assert_eq!(
            cases["client::tests::discovers_controller"],
            CaseStatus::Passed
        );
        assert_eq!(cases["produce_roundtrip"], CaseStatus::Failed);
        assert_eq!(cases["needs_live_cluster"], CaseStatus::Skipped);
    }

    #[test]
    fn test_parse_doc_example_output() {
        let stdout = "\
running 2 tests
test src/client/mod.rs - client::Client (line 53) ... ok
test src/lib.rs - (line 20) ... FAILED
";
        let cases = parse_libtest_output(stdout);
        assert_eq!(
            cases["src/client/mod.rs - client::Client (line 53)"],
            CaseStatus::Passed
        );
        assert_eq!(cases["src/lib.rs - (line 20)"], CaseStatus::Failed);
    }

    #[test]
    fn test_parse_ignores_noise_lines() {
        let stdout = "\
   Compiling client v0.1.0
warning: unused variable
test result: ok. 2 passed; 0 failed
";
        assert!(parse_libtest_output(stdout).is_empty());
    }

    #[test]
    fn test_report_accounting_and_classification() {
        let mut cases = BTreeMap::new();
        cases.insert("a".to_string(), CaseStatus::Passed);
        cases.insert("b".to_string(), CaseStatus::Failed);
        cases.insert("c".to_string(), CaseStatus::Skipped);
        let report = ConformanceReport {
            label: "kafka".to_string(),
            suites: vec![SuiteReport {
                kind: SuiteKind::Behavioral,
                cases,
                duration: Duration::from_secs(1),
            }],
        };
        assert_eq!(report.total_cases(), 3);
        assert_eq!(report.failed_cases(), 1);
        match report.ensure_passed().unwrap_err() {
            PipelineError::Conformance { failed, total } => {
                assert_eq!((failed, total), (1, 3));
            }
            other => panic!("expected conformance failure, got {other}"),
        }
    }

    /// Repeating a pass over identical harness output yields an identical
    /// pass/fail set.
    #[test]
    fn test_parse_is_deterministic() {
        let stdout = "test a ... ok\ntest b ... FAILED\ntest c ... ignored\n";
        assert_eq!(parse_libtest_output(stdout), parse_libtest_output(stdout));
    }
}
