//! Structured run report.
//!
//! One report per pipeline invocation, with every failure cause kept
//! distinguishable. The process exit code only says pass/fail; the
//! classification lives here.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::{DagReport, JobStatus};
use crate::error::{FailureClass, PipelineError};
use crate::executor::ConformanceReport;
use crate::fuzz::CampaignReport;

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub passed: bool,
    /// Distinct failure causes, most severe first as observed.
    pub failure_classes: Vec<FailureClass>,
    pub dag: DagReport,
    /// Per-variant conformance detail, when conformance jobs ran.
    pub conformance: Vec<ConformanceReport>,
    /// Fuzz campaign detail, when a campaign ran.
    pub campaign: Option<CampaignReport>,
}

impl PipelineReport {
    pub fn from_dag(
        started_at: DateTime<Utc>,
        dag: DagReport,
        conformance: Vec<ConformanceReport>,
        campaign: Option<CampaignReport>,
    ) -> Self {
        let mut failure_classes = dag.failure_classes();
        if let Some(class) = campaign.as_ref().and_then(CampaignReport::failure_class) {
            if !failure_classes.contains(&class) {
                failure_classes.push(class);
            }
        }
        let passed = dag.passed() && campaign.as_ref().is_none_or(|c| c.passed);
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            completed_at: Utc::now(),
            passed,
            failure_classes,
            dag,
            conformance,
            campaign,
        }
    }

    /// 0 on full success, 1 on any failure. Causes stay in the report.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.passed)
    }

    /// Persist the report as JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::infra(format!("creating report dir {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::infra(format!("encoding report: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| PipelineError::infra(format!("writing report {}: {e}", path.display())))
    }
}

impl std::fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pipeline Report")?;
        writeln!(f, "===============")?;
        writeln!(f, "Run: {}", self.run_id)?;
        writeln!(
            f,
            "Status: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        )?;
        if !self.failure_classes.is_empty() {
            let classes: Vec<String> = self
                .failure_classes
                .iter()
                .map(ToString::to_string)
                .collect();
            writeln!(f, "Causes: {}", classes.join(", "))?;
        }
        writeln!(f)?;

        writeln!(f, "Jobs:")?;
        for job in &self.dag.jobs {
            match &job.status {
                JobStatus::Passed { summary } => {
                    writeln!(f, "  [PASS] {} - {summary} ({:?})", job.name, job.duration)?
                }
                JobStatus::Failed { class, detail } => {
                    writeln!(f, "  [FAIL] {} - {class}: {detail}", job.name)?
                }
                JobStatus::Skipped { blocked_on } => writeln!(
                    f,
                    "  [SKIP] {} - blocked on {}",
                    job.name,
                    blocked_on.join(", ")
                )?,
            }
        }

        for conformance in &self.conformance {
            writeln!(f)?;
            write!(f, "{conformance}")?;
        }
        if let Some(campaign) = &self.campaign {
            writeln!(f)?;
            write!(f, "{campaign}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::JobReport;
    use std::time::Duration;

    fn dag(jobs: Vec<JobReport>) -> DagReport {
        DagReport { jobs }
    }

    fn passed_job(name: &str) -> JobReport {
        JobReport {
            name: name.to_string(),
            status: JobStatus::Passed {
                summary: "ok".to_string(),
            },
            duration: Duration::from_secs(1),
        }
    }

    fn failed_job(name: &str, class: FailureClass) -> JobReport {
        JobReport {
            name: name.to_string(),
            status: JobStatus::Failed {
                class,
                detail: "boom".to_string(),
            },
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_exit_codes() {
        let green = PipelineReport::from_dag(Utc::now(), dag(vec![passed_job("fmt")]), vec![], None);
        assert_eq!(green.exit_code(), 0);
        assert!(green.passed);

        let red = PipelineReport::from_dag(
            Utc::now(),
            dag(vec![failed_job("clippy", FailureClass::Policy)]),
            vec![],
            None,
        );
        assert_eq!(red.exit_code(), 1);
        assert_eq!(red.failure_classes, vec![FailureClass::Policy]);
    }

    #[test]
    fn test_campaign_failure_folds_into_classes() {
        let report = PipelineReport::from_dag(
            Utc::now(),
            dag(vec![passed_job("fuzz-build")]),
            vec![],
            Some(CampaignReport {
                results: vec![],
                passed: false,
            }),
        );
        assert!(!report.passed);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_json_round_trip_keeps_causes() {
        let report = PipelineReport::from_dag(
            Utc::now(),
            dag(vec![
                failed_job("conformance-kafka", FailureClass::Conformance),
                failed_job("licenses", FailureClass::Policy),
                passed_job("conformance-redpanda"),
            ]),
            vec![],
            None,
        );
        let json = serde_json::to_string(&report).unwrap();
        let back: PipelineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.failure_classes.len(), 2);
        assert!(back.failure_classes.contains(&FailureClass::Conformance));
        assert!(back.failure_classes.contains(&FailureClass::Policy));
        assert!(back.dag.job("conformance-redpanda").unwrap().passed());
    }

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("reports/nested/run.json");
        let report =
            PipelineReport::from_dag(Utc::now(), dag(vec![passed_job("fmt")]), vec![], None);
        report.write_json(&path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_display_lists_every_job_state() {
        let report = PipelineReport::from_dag(
            Utc::now(),
            dag(vec![
                passed_job("fmt"),
                failed_job("provision", FailureClass::Infrastructure),
                JobReport {
                    name: "conformance".to_string(),
                    status: JobStatus::Skipped {
                        blocked_on: vec!["provision".to_string()],
                    },
                    duration: Duration::ZERO,
                },
            ]),
            vec![],
            None,
        );
        let text = report.to_string();
        assert!(text.contains("[PASS] fmt"));
        assert!(text.contains("[FAIL] provision - infrastructure"));
        assert!(text.contains("[SKIP] conformance - blocked on provision"));
    }
}
