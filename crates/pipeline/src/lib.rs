//! Cross-Backend Protocol Conformance & Fuzz-Regression Pipeline
//!
//! This crate provides the orchestration core for validating the Kafka
//! client library against live broker clusters of two implementation
//! families, and for running coverage-guided fuzz campaigns whose state
//! accumulates across scheduled executions:
//!
//! - **Topology Provisioner**: containerized N-node clusters, one seed,
//!   torn down completely on any failure
//! - **Target Selector**: address lists deliberately ordered so the first
//!   entry is never the current controller — discovery is forced, not lucky
//! - **Interposition Gateway**: a protocol-unaware TCP relay in front of
//!   the topology
//! - **Conformance Executor**: behavioral and doc-example suites as two
//!   passes, all case results reported
//! - **Corpus & Artifact Cache**: dependency state (exact → branch →
//!   global → cold) and append-only fuzz state
//! - **Fuzz Campaign Driver**: strictly sequential bounded campaigns,
//!   crashes preserved and never averaged away
//! - **Notification Sink**: best-effort webhook, at most once per campaign
//!
//! # Architecture
//!
//! ```text
//!                ┌────────────────────────── job DAG ─────────────────────────┐
//!                │                                                            │
//!   fmt ──┐      │   ┌─ conformance-kafka ────────────────────────────┐       │
//! clippy ─┼──►   │   │ provision ► gateway ► select ► suites ► teardown│      │
//! deny  ──┘      │   └────────────────────────────────────────────────┘       │
//!                │   ┌─ conformance-redpanda ─────────────────────────┐       │
//! build-matrix ──┤   │ provision ► gateway ► select ► suites ► teardown│      │
//! (dep cache)    │   └────────────────────────────────────────────────┘       │
//!                │                                          fuzz-build, docs  │
//!                └───────────────────────► aggregate gate ◄───────────────────┘
//!
//!   scheduled:  fuzz-cache restore ► campaign (targets sequential)
//!               ► fuzz-cache save (always) ► notify (failure only, once)
//! ```
//!
//! The client library, the broker servers and the fuzz-target harness are
//! external collaborators, reached through their own executables.

pub mod cache;
pub mod checks;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod fuzz;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod selector;
pub mod topology;

// Re-export key types for convenience
pub use cache::{CacheStore, DependencyKey, EntryManifest, RestoreOutcome};

pub use checks::{POLICY_CHECKS, PolicyCheck, build_docs_bundle, run_matrix_build};

pub use config::{
    BackendVariant, ConfigError, FeatureSelection, FuzzConfig, PipelineConfig, ResourceLimits,
};

pub use dag::{Dag, DagReport, Job, JobReport, JobStatus};

pub use error::{FailureClass, PipelineError};

pub use executor::{
    CaseStatus, ConformanceExecutor, ConformanceReport, SuiteKind, SuiteReport,
};

pub use fuzz::{
    CampaignReport, CampaignResult, CargoFuzzRunner, FuzzCampaignDriver, FuzzTarget,
    HarnessOutcome, HarnessRunner, TargetStatus,
};

pub use gateway::InterpositionGateway;

pub use notify::{FailureNotice, NotificationSink};

pub use pipeline::{Pipeline, build_with_dependency_cache, conformance_round};

pub use report::PipelineReport;

pub use selector::{TargetSelector, TestTarget, UNREACHABLE_PLACEHOLDER};

pub use topology::{
    BrokerNode, ClusterPlan, ContainerRuntime, DockerRuntime, ExecOutput, ListenerSet, NodePlan,
    Topology, TopologyProvisioner,
};
