//! Fuzz campaign driver.
//!
//! Processes registered targets strictly one at a time — bounded resource
//! use, unambiguous crash attribution. The instrumented harness is an opaque
//! executable behind the [`HarnessRunner`] seam: it is fed a corpus and an
//! iteration budget and reports crash or clean. A crash halts only its own
//! target; every other target still runs its full budget, and the crash is
//! never averaged away across the set.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::cache::count_files;
use crate::error::FailureClass;

/// A registered fuzz target with its state containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzTarget {
    pub name: String,
    /// Accumulated inputs known to exercise the target's code paths.
    pub corpus_dir: PathBuf,
    /// Crash-triggering inputs preserved across runs.
    pub artifact_dir: PathBuf,
}

impl FuzzTarget {
    /// Lay a target's containers out under one campaign work directory, so
    /// the whole campaign state travels through the fuzz cache as one tree.
    pub fn under(work_dir: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            corpus_dir: work_dir.join("corpus").join(&name),
            artifact_dir: work_dir.join("artifacts").join(&name),
            name,
        }
    }
}

/// What one bounded harness execution produced.
#[derive(Debug, Clone)]
pub enum HarnessOutcome {
    /// Budget exhausted without a crash.
    Clean { iterations: u64 },
    /// A crashing input was found; the run stopped there.
    Crash { artifacts: Vec<PathBuf> },
}

/// Seam to the instrumented harness executable.
#[async_trait]
pub trait HarnessRunner: Send + Sync {
    /// Build the instrumented harness for one target.
    async fn build(&self, target: &str) -> AnyResult<()>;
    /// Execute up to `runs` iterations seeded from the target's corpus.
    async fn run(&self, target: &FuzzTarget, runs: u64) -> AnyResult<HarnessOutcome>;
}

/// Production runner shelling out to cargo-fuzz.
#[derive(Debug, Clone)]
pub struct CargoFuzzRunner {
    /// Directory containing the client's `fuzz/` workspace.
    project_dir: PathBuf,
}

impl CargoFuzzRunner {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }
}

#[async_trait]
impl HarnessRunner for CargoFuzzRunner {
    async fn build(&self, target: &str) -> AnyResult<()> {
        let output = Command::new("cargo")
            .args(["fuzz", "build", target])
            .current_dir(&self.project_dir)
            .output()
            .await
            .with_context(|| format!("spawning cargo fuzz build for {target}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "harness build failed for {target}: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("no output")
            );
        }
        Ok(())
    }

    async fn run(&self, target: &FuzzTarget, runs: u64) -> AnyResult<HarnessOutcome> {
        fs::create_dir_all(&target.corpus_dir)?;
        fs::create_dir_all(&target.artifact_dir)?;

        let output = Command::new("cargo")
            .args(["fuzz", "run", &target.name])
            .arg(&target.corpus_dir)
            .arg("--")
            .arg(format!("-runs={runs}"))
            .arg(format!("-artifact_prefix={}/", target.artifact_dir.display()))
            .current_dir(&self.project_dir)
            .output()
            .await
            .with_context(|| format!("spawning cargo fuzz run for {}", target.name))?;

        if output.status.success() {
            return Ok(HarnessOutcome::Clean { iterations: runs });
        }

        let artifacts: Vec<PathBuf> = fs::read_dir(&target.artifact_dir)
            .map(|entries| entries.flatten().map(|e| e.path()).collect())
            .unwrap_or_default();
        if artifacts.is_empty() {
            // Nonzero exit without a preserved input is a harness problem,
            // not a crash discovery.
            anyhow::bail!(
                "harness exited nonzero for {} without artifacts: {}",
                target.name,
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("no output")
            );
        }
        Ok(HarnessOutcome::Crash { artifacts })
    }
}

/// Final status of one target's campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TargetStatus {
    /// Exhausted its budget without crashing.
    Clean { iterations: u64 },
    /// Produced a crashing input; remaining iterations skipped.
    Crashed { artifacts: Vec<PathBuf> },
    /// The harness never ran (build or spawn failure).
    Infrastructure { detail: String },
}

/// Per-target outcome plus corpus accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignResult {
    pub target: String,
    #[serde(flatten)]
    pub status: TargetStatus,
    pub corpus_before: u64,
    pub corpus_after: u64,
}

impl CampaignResult {
    /// Inputs added to the corpus by this target's run.
    #[must_use]
    pub fn corpus_delta(&self) -> u64 {
        self.corpus_after.saturating_sub(self.corpus_before)
    }
}

/// The whole campaign: one result per registered target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub results: Vec<CampaignResult>,
    pub passed: bool,
}

impl CampaignReport {
    /// Dominant failure class, if the campaign failed: a crash anywhere
    /// outranks a harness that never ran.
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        if self.passed {
            return None;
        }
        let crashed = self
            .results
            .iter()
            .any(|r| matches!(r.status, TargetStatus::Crashed { .. }));
        Some(if crashed {
            FailureClass::CrashFound
        } else {
            FailureClass::Infrastructure
        })
    }

    /// All preserved crash artifacts across targets.
    #[must_use]
    pub fn crash_artifacts(&self) -> Vec<&Path> {
        self.results
            .iter()
            .filter_map(|r| match &r.status {
                TargetStatus::Crashed { artifacts } => Some(artifacts),
                _ => None,
            })
            .flatten()
            .map(PathBuf::as_path)
            .collect()
    }
}

impl std::fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Fuzz campaign: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        )?;
        for result in &self.results {
            match &result.status {
                TargetStatus::Clean { iterations } => writeln!(
                    f,
                    "  [CLEAN] {} ({} iterations, corpus +{})",
                    result.target,
                    iterations,
                    result.corpus_delta()
                )?,
                TargetStatus::Crashed { artifacts } => writeln!(
                    f,
                    "  [CRASH] {} ({} artifacts preserved)",
                    result.target,
                    artifacts.len()
                )?,
                TargetStatus::Infrastructure { detail } => {
                    writeln!(f, "  [INFRA] {} ({detail})", result.target)?
                }
            }
        }
        Ok(())
    }
}

/// Drives one campaign across all registered targets.
pub struct FuzzCampaignDriver<R> {
    runner: R,
    targets: Vec<FuzzTarget>,
    runs: u64,
}

impl<R: HarnessRunner> FuzzCampaignDriver<R> {
    pub fn new(runner: R, targets: Vec<FuzzTarget>, runs: u64) -> Self {
        Self {
            runner,
            targets,
            runs,
        }
    }

    /// Run every target to completion, strictly sequentially.
    ///
    /// No outcome short-circuits the loop: a crash or a harness failure on
    /// one target still leaves every later target its full budget.
    pub async fn run_campaign(&self) -> CampaignReport {
        let mut results = Vec::with_capacity(self.targets.len());
        let mut passed = true;

        for target in &self.targets {
            info!(target = %target.name, runs = self.runs, "fuzz target starting");
            let corpus_before = count_files(&target.corpus_dir);

            let status = match self.runner.build(&target.name).await {
                Err(e) => {
                    error!(target = %target.name, error = %e, "harness build failed");
                    TargetStatus::Infrastructure {
                        detail: format!("{e:#}"),
                    }
                }
                Ok(()) => match self.runner.run(target, self.runs).await {
                    Ok(HarnessOutcome::Clean { iterations }) => {
                        info!(target = %target.name, iterations, "target clean");
                        TargetStatus::Clean { iterations }
                    }
                    Ok(HarnessOutcome::Crash { artifacts }) => {
                        warn!(
                            target = %target.name,
                            artifacts = artifacts.len(),
                            "crash found, halting this target"
                        );
                        TargetStatus::Crashed { artifacts }
                    }
                    Err(e) => {
                        error!(target = %target.name, error = %e, "harness run failed");
                        TargetStatus::Infrastructure {
                            detail: format!("{e:#}"),
                        }
                    }
                },
            };

            if !matches!(status, TargetStatus::Clean { .. }) {
                passed = false;
            }
            results.push(CampaignResult {
                target: target.name.clone(),
                status,
                corpus_before,
                corpus_after: count_files(&target.corpus_dir),
            });
        }

        CampaignReport { results, passed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted runner recording call order.
    struct StubRunner {
        calls: Mutex<Vec<String>>,
        /// Target that crashes, writing one artifact.
        crash_target: Option<String>,
        /// Target whose build fails.
        broken_target: Option<String>,
        /// Inputs each clean run adds to the corpus.
        corpus_growth: u64,
    }

    impl StubRunner {
        fn clean() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                crash_target: None,
                broken_target: None,
                corpus_growth: 3,
            }
        }
    }

    #[async_trait]
    impl HarnessRunner for &StubRunner {
        async fn build(&self, target: &str) -> AnyResult<()> {
            self.calls.lock().unwrap().push(format!("build:{target}"));
            if self.broken_target.as_deref() == Some(target) {
                anyhow::bail!("sanitizer flags rejected");
            }
            Ok(())
        }

        async fn run(&self, target: &FuzzTarget, runs: u64) -> AnyResult<HarnessOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("run:{}:{runs}", target.name));
            fs::create_dir_all(&target.corpus_dir)?;
            if self.crash_target.as_deref() == Some(target.name.as_str()) {
                fs::create_dir_all(&target.artifact_dir)?;
                let artifact = target.artifact_dir.join("crash-deadbeef");
                fs::write(&artifact, b"\x00\x01")?;
                // The crashing input also lands in the corpus.
                fs::write(target.corpus_dir.join("crash-seed"), b"\x00\x01")?;
                return Ok(HarnessOutcome::Crash {
                    artifacts: vec![artifact],
                });
            }
            for i in 0..self.corpus_growth {
                fs::write(target.corpus_dir.join(format!("new-{i}")), b"x")?;
            }
            Ok(HarnessOutcome::Clean { iterations: runs })
        }
    }

    fn targets(work: &Path, names: &[&str]) -> Vec<FuzzTarget> {
        names.iter().map(|n| FuzzTarget::under(work, *n)).collect()
    }

    #[tokio::test]
    async fn test_clean_campaign_passes_with_full_budgets() {
        let tmp = TempDir::new().unwrap();
        let runner = StubRunner::clean();
        let driver = FuzzCampaignDriver::new(
            &runner,
            targets(tmp.path(), &["protocol_reader", "record_batch"]),
            50_000,
        );

        let report = driver.run_campaign().await;
        assert!(report.passed);
        assert!(report.failure_class().is_none());
        for result in &report.results {
            assert!(matches!(
                result.status,
                TargetStatus::Clean { iterations: 50_000 }
            ));
            assert_eq!(result.corpus_delta(), 3);
        }
    }

    #[tokio::test]
    async fn test_targets_run_strictly_sequentially() {
        let tmp = TempDir::new().unwrap();
        let runner = StubRunner::clean();
        let driver =
            FuzzCampaignDriver::new(&runner, targets(tmp.path(), &["a", "b", "c"]), 10);
        driver.run_campaign().await;

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "build:a", "run:a:10", "build:b", "run:b:10", "build:c", "run:c:10"
            ]
        );
    }

    /// Scenario: `parse_frame` starts with 120 corpus entries and crashes at
    /// iteration 4000 of 100000. The artifact is preserved, its remaining
    /// iterations are skipped, the other target still runs its full budget,
    /// and the campaign is marked failed.
    #[tokio::test]
    async fn test_crash_halts_one_target_not_the_campaign() {
        let tmp = TempDir::new().unwrap();
        let all = targets(tmp.path(), &["parse_frame", "record_batch"]);
        for i in 0..120 {
            fs::create_dir_all(&all[0].corpus_dir).unwrap();
            fs::write(all[0].corpus_dir.join(format!("seed-{i}")), b"s").unwrap();
        }

        let mut runner = StubRunner::clean();
        runner.crash_target = Some("parse_frame".to_string());
        let driver = FuzzCampaignDriver::new(&runner, all, 100_000);
        let report = driver.run_campaign().await;

        assert!(!report.passed);
        assert_eq!(report.failure_class(), Some(FailureClass::CrashFound));

        let crashed = &report.results[0];
        assert_eq!(crashed.target, "parse_frame");
        match &crashed.status {
            TargetStatus::Crashed { artifacts } => {
                assert_eq!(artifacts.len(), 1);
                assert!(artifacts[0].exists(), "artifact preserved on disk");
            }
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(crashed.corpus_before, 120);
        assert_eq!(crashed.corpus_after, 121);

        // The second target is unaffected and ran its full budget.
        assert!(matches!(
            report.results[1].status,
            TargetStatus::Clean {
                iterations: 100_000
            }
        ));
        // Both targets were still attempted: run appears for each.
        let calls = runner.calls.lock().unwrap();
        assert!(calls.contains(&"run:parse_frame:100000".to_string()));
        assert!(calls.contains(&"run:record_batch:100000".to_string()));
    }

    #[tokio::test]
    async fn test_build_failure_is_infrastructure_and_spares_other_targets() {
        let tmp = TempDir::new().unwrap();
        let mut runner = StubRunner::clean();
        runner.broken_target = Some("parse_frame".to_string());
        let driver = FuzzCampaignDriver::new(
            &runner,
            targets(tmp.path(), &["parse_frame", "record_batch"]),
            1_000,
        );
        let report = driver.run_campaign().await;

        assert!(!report.passed);
        assert_eq!(report.failure_class(), Some(FailureClass::Infrastructure));
        assert!(matches!(
            report.results[0].status,
            TargetStatus::Infrastructure { .. }
        ));
        assert!(matches!(
            report.results[1].status,
            TargetStatus::Clean { .. }
        ));
        // The broken target's harness was never run.
        let calls = runner.calls.lock().unwrap();
        assert!(!calls.iter().any(|c| c == "run:parse_frame:1000"));
    }

    #[tokio::test]
    async fn test_crash_outranks_infrastructure_in_classification() {
        let tmp = TempDir::new().unwrap();
        let mut runner = StubRunner::clean();
        runner.crash_target = Some("a".to_string());
        runner.broken_target = Some("b".to_string());
        let driver = FuzzCampaignDriver::new(&runner, targets(tmp.path(), &["a", "b"]), 10);
        let report = driver.run_campaign().await;
        assert_eq!(report.failure_class(), Some(FailureClass::CrashFound));
        assert_eq!(report.crash_artifacts().len(), 1);
    }
}
