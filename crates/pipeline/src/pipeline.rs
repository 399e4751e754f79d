//! Pipeline assembly.
//!
//! Wires the configuration into the job DAG — policy gates, the feature
//! build matrix, the two backend-variant conformance jobs (each owning an
//! exclusive topology on a disjoint port range), the fuzz harness build and
//! the docs bundle — plus the scheduled fuzz campaign with its
//! restore-then-guaranteed-save cache scope and single failure notification.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, DependencyKey};
use crate::checks::{self, POLICY_CHECKS};
use crate::config::{BackendVariant, ConfigError, FeatureSelection, PipelineConfig};
use crate::dag::{Dag, Job};
use crate::error::{FailureClass, PipelineError};
use crate::executor::{ConformanceExecutor, ConformanceReport};
use crate::fuzz::{CampaignReport, CargoFuzzRunner, FuzzCampaignDriver, FuzzTarget, HarnessRunner};
use crate::gateway::InterpositionGateway;
use crate::notify::{FailureNotice, NotificationSink};
use crate::report::PipelineReport;
use crate::selector::TargetSelector;
use crate::topology::{ContainerRuntime, DockerRuntime, TopologyProvisioner};

/// Port spacing between the concurrent backend-variant jobs; each owns its
/// whole range, so the two topologies can never collide.
const VARIANT_PORT_STRIDE: u16 = 100;

fn variant_base_port(config: &PipelineConfig, backend: BackendVariant) -> u16 {
    match backend {
        BackendVariant::Kafka => config.base_port,
        BackendVariant::Redpanda => config.base_port + VARIANT_PORT_STRIDE,
    }
}

fn variant_proxy_bind(bind: SocketAddr, backend: BackendVariant) -> SocketAddr {
    if bind.port() == 0 {
        return bind;
    }
    let offset = match backend {
        BackendVariant::Kafka => 0,
        BackendVariant::Redpanda => 1,
    };
    SocketAddr::new(bind.ip(), bind.port() + offset)
}

/// One backend variant's conformance round: provision, interpose, select,
/// execute both suite passes, tear down on every path.
pub async fn conformance_round<R: ContainerRuntime>(
    runtime: R,
    config: &PipelineConfig,
    backend: BackendVariant,
    base_port: u16,
) -> Result<ConformanceReport, PipelineError> {
    let provisioner = TopologyProvisioner::for_backend(runtime, config, backend, base_port);
    let mut topology = provisioner.provision().await?;

    let gateway = match config.proxy_bind {
        Some(bind) => {
            let bind = variant_proxy_bind(bind, backend);
            match InterpositionGateway::bind(bind, topology.seed().listeners.external).await {
                Ok(gateway) => Some(gateway),
                Err(e) => {
                    provisioner.teardown(&topology).await;
                    return Err(e);
                }
            }
        }
        None => None,
    };
    if let Some(gateway) = &gateway {
        topology.proxy = Some(gateway.local_addr());
    }

    let selector = TargetSelector::new(config.placeholder_first, config.integration);
    let result = match selector.select(&topology) {
        Ok(target) => {
            let executor =
                ConformanceExecutor::new(&config.client_dir, target, backend.to_string());
            executor.run_all().await
        }
        Err(e) => Err(e),
    };

    // Teardown runs whatever the suites did; no topology outlives its job.
    if let Some(gateway) = gateway {
        gateway.shutdown().await;
    }
    provisioner.teardown(&topology).await;

    result
}

/// One feature-matrix build inside the dependency-cache scope: restore
/// before, save after, on every exit path.
pub async fn build_with_dependency_cache(
    config: &PipelineConfig,
    store: &CacheStore,
    selection: &FeatureSelection,
) -> Result<String, PipelineError> {
    let lockfile = config.client_dir.join("Cargo.lock");
    let key = DependencyKey::for_manifest(&config.branch, &lockfile)?;
    let cargo_home = config
        .cache_dir
        .join("work")
        .join(format!("cargo-home-{}", selection.name));

    let outcome = store.restore_dependencies(&key, &cargo_home)?;
    info!(selection = %selection.name, restore = %outcome, "dependency state restored");

    let result = checks::run_matrix_build(
        &config.client_dir,
        &selection.features,
        selection.no_default_features,
        Some(&cargo_home),
    )
    .await;

    // Unconditional release; a failed save only costs the next run time.
    if let Err(e) = store.save_dependencies(&key, &cargo_home) {
        warn!(selection = %selection.name, error = %e, "dependency cache save failed");
    }

    result?;
    Ok(format!("{} build clean (cache {outcome})", selection.name))
}

/// The assembled pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    store: CacheStore,
    sink: NotificationSink,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = CacheStore::new(config.cache_dir.clone());
        let sink = NotificationSink::new(config.webhook_url.clone());
        Ok(Self {
            config,
            store,
            sink,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether the failure notification has fired this run.
    #[must_use]
    pub fn notification_fired(&self) -> bool {
        self.sink.has_fired()
    }

    /// Build the job graph. Branches with no data dependency — the policy
    /// gates, every matrix build, both conformance variants, the fuzz
    /// harness build and the docs bundle — all run concurrently.
    pub fn build_dag(&self) -> (Dag, Arc<Mutex<Vec<ConformanceReport>>>) {
        let mut dag = Dag::new();
        let collector = Arc::new(Mutex::new(Vec::new()));

        for check in POLICY_CHECKS {
            let check = check.clone();
            let dir = self.config.client_dir.clone();
            dag.add(
                Job::new(check.name, move || async move {
                    check.run(&dir).await?;
                    Ok(format!("{} clean", check.name))
                })
                .with_timeout(self.config.job_timeout),
            );
        }

        for selection in &self.config.feature_matrix {
            let config = self.config.clone();
            let store = self.store.clone();
            let selection = selection.clone();
            dag.add(
                Job::new(format!("build-{}", selection.name), move || async move {
                    build_with_dependency_cache(&config, &store, &selection).await
                })
                .with_timeout(self.config.job_timeout),
            );
        }

        for backend in [BackendVariant::Kafka, BackendVariant::Redpanda] {
            let config = self.config.clone();
            let collector = Arc::clone(&collector);
            let base_port = variant_base_port(&self.config, backend);
            dag.add(
                Job::new(format!("conformance-{backend}"), move || async move {
                    let report =
                        conformance_round(DockerRuntime, &config, backend, base_port).await?;
                    let summary = format!(
                        "{} cases, {} failed",
                        report.total_cases(),
                        report.failed_cases()
                    );
                    let verdict = report.ensure_passed();
                    collector.lock().unwrap().push(report);
                    verdict?;
                    Ok(summary)
                })
                .with_timeout(self.config.job_timeout),
            );
        }

        {
            let fuzz = self.config.fuzz.clone();
            let client_dir = self.config.client_dir.clone();
            dag.add(
                Job::new("fuzz-build", move || async move {
                    let runner = CargoFuzzRunner::new(client_dir);
                    for target in &fuzz.targets {
                        runner
                            .build(target)
                            .await
                            .map_err(|e| PipelineError::infra(format!("{e:#}")))?;
                    }
                    Ok(format!("{} harnesses built", fuzz.targets.len()))
                })
                .with_timeout(self.config.job_timeout),
            );
        }

        {
            let client_dir = self.config.client_dir.clone();
            let bundle = self.config.artifacts_dir.join("docs.tar.gz");
            dag.add(
                Job::new("docs", move || async move {
                    checks::build_docs_bundle(&client_dir, &bundle).await?;
                    Ok("documentation bundle built".to_string())
                })
                .with_timeout(self.config.job_timeout),
            );
        }

        (dag, collector)
    }

    /// Run the full DAG and assemble the structured report.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let started_at = Utc::now();
        let (dag, collector) = self.build_dag();
        let dag_report = dag.run().await?;
        let conformance = std::mem::take(&mut *collector.lock().unwrap());
        Ok(PipelineReport::from_dag(
            started_at,
            dag_report,
            conformance,
            None,
        ))
    }

    /// The scheduled trigger: restore fuzz state, drive the campaign, save
    /// state on every exit path, notify (once) on failure.
    pub async fn run_fuzz_campaign(&self) -> Result<CampaignReport, PipelineError> {
        let runner = CargoFuzzRunner::new(self.config.client_dir.clone());
        self.campaign_with_runner(runner).await
    }

    /// Campaign body, generic over the harness seam.
    pub async fn campaign_with_runner<R: HarnessRunner>(
        &self,
        runner: R,
    ) -> Result<CampaignReport, PipelineError> {
        let tag = self.config.fuzz.cache_tag.clone();
        let work_dir = self.config.cache_dir.join("work").join(&tag);
        let names = self.config.fuzz.targets.clone();
        let runs = self.config.fuzz.runs;

        let report = self
            .store
            .with_fuzz_state(&tag, &work_dir, move |dir| async move {
                let targets = names
                    .iter()
                    .map(|name| FuzzTarget::under(&dir, name.clone()))
                    .collect();
                FuzzCampaignDriver::new(runner, targets, runs)
                    .run_campaign()
                    .await
            })
            .await?;

        self.export_crash_artifacts(&report);

        if !report.passed {
            let class = report
                .failure_class()
                .unwrap_or(FailureClass::Infrastructure);
            self.sink
                .notify_failure(&FailureNotice {
                    run_id: Uuid::new_v4().to_string(),
                    failure_class: class.to_string(),
                    summary: report.to_string(),
                })
                .await;
        }
        Ok(report)
    }

    /// Copy crash-triggering inputs next to the other external artifacts.
    fn export_crash_artifacts(&self, report: &CampaignReport) {
        let crashes = report.crash_artifacts();
        if crashes.is_empty() {
            return;
        }
        let dest_dir = self.config.artifacts_dir.join("crashes");
        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            warn!(error = %e, "could not create crash artifact dir");
            return;
        }
        for artifact in crashes {
            let Some(name) = artifact.file_name() else {
                continue;
            };
            if let Err(e) = std::fs::copy(artifact, dest_dir.join(name)) {
                warn!(artifact = %artifact.display(), error = %e, "crash artifact export failed");
            }
        }
    }
}
