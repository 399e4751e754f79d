//! Explicit job DAG.
//!
//! Jobs declare their inputs by name; the runner parallelizes branches with
//! no data dependency and serializes dependent ones. A failing job never
//! implicitly cancels siblings — every schedulable job completes and
//! reports, maximizing diagnostic yield from one run. Jobs downstream of a
//! failure are reported as skipped, and a final aggregate gate requires
//! every job to pass.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{FailureClass, PipelineError};

type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<String, PipelineError>> + Send>;

/// One node in the graph.
pub struct Job {
    name: String,
    deps: Vec<String>,
    timeout: Option<Duration>,
    run: JobFn,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<String, PipelineError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            deps: Vec::new(),
            timeout: None,
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Declare a dependency; this job runs only after `dep` passed.
    #[must_use]
    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Wall-clock ceiling for the job. Exceeding it is an infrastructure
    /// failure; the job's own cleanup (teardown, cache save) is expected to
    /// live inside the closure, before any await this can cut short.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final state of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    Passed { summary: String },
    Failed { class: FailureClass, detail: String },
    /// Never ran; a dependency did not pass.
    Skipped { blocked_on: Vec<String> },
}

/// One job's report entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    #[serde(flatten)]
    pub status: JobStatus,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl JobReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self.status, JobStatus::Passed { .. })
    }

    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.status {
            JobStatus::Failed { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Aggregate result of one DAG run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagReport {
    pub jobs: Vec<JobReport>,
}

impl DagReport {
    /// The aggregate gate: every job passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.jobs.iter().all(JobReport::passed)
    }

    /// Distinct failure classes observed, for the structured report.
    #[must_use]
    pub fn failure_classes(&self) -> Vec<FailureClass> {
        let mut seen = Vec::new();
        for job in &self.jobs {
            if let Some(class) = job.failure_class() {
                if !seen.contains(&class) {
                    seen.push(class);
                }
            }
        }
        seen
    }

    #[must_use]
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// The graph itself.
#[derive(Default)]
pub struct Dag {
    jobs: Vec<Job>,
}

impl Dag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: Job) -> &mut Self {
        self.jobs.push(job);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Reject duplicate names, unknown dependencies and cycles before
    /// anything runs.
    fn validate(&self) -> Result<(), PipelineError> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(PipelineError::infra(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
        }
        for job in &self.jobs {
            for dep in &job.deps {
                if !names.contains(dep.as_str()) {
                    return Err(PipelineError::infra(format!(
                        "job '{}' depends on unknown job '{dep}'",
                        job.name
                    )));
                }
            }
        }

        // Kahn's algorithm; leftovers mean a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .jobs
            .iter()
            .map(|j| (j.name.as_str(), j.deps.len()))
            .collect();
        let mut queue: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(name) = queue.pop() {
            visited += 1;
            for job in &self.jobs {
                if job.deps.iter().any(|d| d == name) {
                    let d = indegree.get_mut(job.name.as_str()).expect("known job");
                    *d -= 1;
                    if *d == 0 {
                        queue.push(job.name.as_str());
                    }
                }
            }
        }
        if visited != self.jobs.len() {
            return Err(PipelineError::infra("job graph contains a cycle"));
        }
        Ok(())
    }

    /// Run the graph to completion.
    pub async fn run(self) -> Result<DagReport, PipelineError> {
        self.validate()?;

        let mut remaining = self.jobs;
        // name -> passed
        let mut done: HashMap<String, bool> = HashMap::new();
        let mut reports = Vec::new();
        let mut running = JoinSet::new();

        loop {
            // Schedule everything whose dependencies are settled. Skips can
            // cascade, so scan until a pass makes no progress.
            loop {
                let mut progressed = false;
                let mut i = 0;
                while i < remaining.len() {
                    let settled = remaining[i].deps.iter().all(|d| done.contains_key(d));
                    if !settled {
                        i += 1;
                        continue;
                    }
                    let job = remaining.remove(i);
                    progressed = true;

                    let blocked_on: Vec<String> = job
                        .deps
                        .iter()
                        .filter(|d| !done[d.as_str()])
                        .cloned()
                        .collect();
                    if !blocked_on.is_empty() {
                        warn!(job = %job.name, ?blocked_on, "skipping job, dependency failed");
                        done.insert(job.name.clone(), false);
                        reports.push(JobReport {
                            name: job.name,
                            status: JobStatus::Skipped { blocked_on },
                            duration: Duration::ZERO,
                        });
                        continue;
                    }

                    debug!(job = %job.name, "scheduling job");
                    let name = job.name;
                    let timeout = job.timeout;
                    let run = job.run;
                    running.spawn(async move {
                        let start = std::time::Instant::now();
                        let result = match timeout {
                            Some(limit) => match tokio::time::timeout(limit, run()).await {
                                Ok(r) => r,
                                Err(_) => Err(PipelineError::infra(format!(
                                    "job timed out after {limit:?}"
                                ))),
                            },
                            None => run().await,
                        };
                        (name, start.elapsed(), result)
                    });
                }
                if !progressed {
                    break;
                }
            }

            if running.is_empty() {
                break;
            }

            // Join one finished job; siblings keep running regardless of
            // its outcome.
            match running.join_next().await.expect("joinset not empty") {
                Ok((name, duration, result)) => {
                    let (passed, status) = match result {
                        Ok(summary) => {
                            info!(job = %name, ?duration, "job passed");
                            (true, JobStatus::Passed { summary })
                        }
                        Err(e) => {
                            warn!(job = %name, error = %e, "job failed");
                            (
                                false,
                                JobStatus::Failed {
                                    class: e.class(),
                                    detail: e.to_string(),
                                },
                            )
                        }
                    };
                    done.insert(name.clone(), passed);
                    reports.push(JobReport {
                        name,
                        status,
                        duration,
                    });
                }
                Err(join_error) => {
                    // A panicking job fails itself, never the runner.
                    warn!(error = %join_error, "job panicked");
                    reports.push(JobReport {
                        name: format!("panicked-{}", reports.len()),
                        status: JobStatus::Failed {
                            class: FailureClass::Infrastructure,
                            detail: join_error.to_string(),
                        },
                        duration: Duration::ZERO,
                    });
                }
            }
        }

        Ok(DagReport { jobs: reports })
    }
}
