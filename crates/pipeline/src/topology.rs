//! Broker cluster provisioning.
//!
//! Stands up an N-node cluster of one backend variant in containers, waits
//! for every node to become ready, resolves the current controller, and
//! guarantees that a failed or cancelled provisioning attempt leaves no
//! partial topology reachable.
//!
//! The container engine sits behind the [`ContainerRuntime`] trait so the
//! planning, readiness and teardown logic is testable without docker.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackendVariant, PipelineConfig, ResourceLimits};
use crate::error::PipelineError;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Listener addresses of one broker node, as seen from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSet {
    /// Inter-broker listener.
    pub plain: SocketAddr,
    /// Listener handed to clients.
    pub external: SocketAddr,
    /// SASL-authenticated listener. Kafka variant only.
    pub sasl: Option<SocketAddr>,
}

/// One running broker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerNode {
    /// Ordinal node id, also the broker id inside the cluster.
    pub id: u32,
    /// Container name, used for exec probes and teardown.
    pub container: String,
    pub listeners: ListenerSet,
    /// Address the node advertises to clients.
    pub advertised: SocketAddr,
    /// Peers a joining node contacts first. Empty on the seed itself.
    pub seed_peers: Vec<SocketAddr>,
    pub is_seed: bool,
}

/// A live cluster for exactly one job invocation. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub backend: BackendVariant,
    pub nodes: Vec<BrokerNode>,
    /// Interposition gateway endpoint, when one fronts this topology.
    pub proxy: Option<SocketAddr>,
    /// Controller/leader node id resolved after the cluster settled.
    pub controller_id: u32,
}

impl Topology {
    /// The designated bootstrap/seed node.
    #[must_use]
    pub fn seed(&self) -> &BrokerNode {
        self.nodes
            .iter()
            .find(|n| n.is_seed)
            .expect("topology invariant: exactly one seed")
    }

    /// The current controller node.
    #[must_use]
    pub fn controller(&self) -> &BrokerNode {
        self.nodes
            .iter()
            .find(|n| n.id == self.controller_id)
            .expect("topology invariant: controller id names a node")
    }

    /// External addresses in node-id order.
    #[must_use]
    pub fn external_addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.listeners.external).collect()
    }

    /// Check the structural invariants: exactly one seed, a resolvable
    /// controller, and every non-seed node holding a seed-peer list.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let seeds = self.nodes.iter().filter(|n| n.is_seed).count();
        if seeds != 1 {
            return Err(PipelineError::infra(format!(
                "topology has {seeds} seed nodes, expected exactly 1"
            )));
        }
        if !self.nodes.iter().any(|n| n.id == self.controller_id) {
            return Err(PipelineError::infra(format!(
                "controller id {} names no node",
                self.controller_id
            )));
        }
        for node in &self.nodes {
            if !node.is_seed && node.seed_peers.is_empty() {
                return Err(PipelineError::infra(format!(
                    "node {} has no seed peers",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to launch one node, computed before anything runs.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub id: u32,
    pub container: String,
    pub image: String,
    /// Host ports published 1:1 into the container.
    pub ports: Vec<u16>,
    pub env: Vec<(String, String)>,
    /// Arguments after the image name.
    pub args: Vec<String>,
    /// Command exec'd inside the container to probe readiness.
    pub ready_cmd: Vec<String>,
    pub listeners: ListenerSet,
    /// Address the node advertises to clients.
    pub advertised: SocketAddr,
    pub seed_peers: Vec<SocketAddr>,
    pub is_seed: bool,
    pub limits: ResourceLimits,
}

/// The full cluster plan.
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    pub backend: BackendVariant,
    pub nodes: Vec<NodePlan>,
    /// Command exec'd inside the seed container to resolve the controller.
    pub controller_cmd: Vec<String>,
}

/// Output of an in-container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
}

/// Seam to the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, node: &NodePlan) -> AnyResult<()>;
    async fn exec(&self, container: &str, cmd: &[String]) -> AnyResult<ExecOutput>;
    async fn remove(&self, container: &str) -> AnyResult<()>;
}

/// Production runtime shelling out to the docker CLI.
#[derive(Debug, Default, Clone)]
pub struct DockerRuntime;

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, node: &NodePlan) -> AnyResult<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d", "--name", &node.container]);
        cmd.arg("--memory");
        cmd.arg(format!("{}m", node.limits.memory_mb));
        cmd.arg("--cpus");
        cmd.arg(node.limits.cpus.to_string());
        for port in &node.ports {
            cmd.arg("-p");
            cmd.arg(format!("{port}:{port}"));
        }
        for (key, value) in &node.env {
            cmd.arg("-e");
            cmd.arg(format!("{key}={value}"));
        }
        cmd.arg(&node.image);
        cmd.args(&node.args);

        let output = cmd
            .output()
            .await
            .with_context(|| format!("spawning docker run for {}", node.container))?;
        if !output.status.success() {
            anyhow::bail!(
                "docker run failed for {}: {}",
                node.container,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> AnyResult<ExecOutput> {
        let output = Command::new("docker")
            .arg("exec")
            .arg(container)
            .args(cmd)
            .output()
            .await
            .with_context(|| format!("spawning docker exec in {container}"))?;
        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn remove(&self, container: &str) -> AnyResult<()> {
        let output = Command::new("docker")
            .args(["rm", "-f", container])
            .output()
            .await
            .with_context(|| format!("spawning docker rm for {container}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "docker rm failed for {container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Provisions and tears down one cluster.
pub struct TopologyProvisioner<R> {
    runtime: R,
    backend: BackendVariant,
    node_count: usize,
    base_port: u16,
    limits: ResourceLimits,
    readiness_timeout: Duration,
    poll_interval: Duration,
}

impl<R: ContainerRuntime> TopologyProvisioner<R> {
    pub fn new(runtime: R, config: &PipelineConfig) -> Self {
        Self::for_backend(runtime, config, config.backend, config.base_port)
    }

    /// Variant-explicit constructor for concurrent backend jobs, which must
    /// use disjoint port ranges so each owns its topology exclusively.
    pub fn for_backend(
        runtime: R,
        config: &PipelineConfig,
        backend: BackendVariant,
        base_port: u16,
    ) -> Self {
        Self {
            runtime,
            backend,
            node_count: config.node_count,
            base_port,
            limits: config.limits,
            readiness_timeout: config.readiness_timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Override the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Compute the cluster plan. Pure; nothing runs.
    ///
    /// Node 0 is the seed. Ports are carved as three consecutive ranges of
    /// `node_count` each: plain, external, SASL (Kafka only).
    #[must_use]
    pub fn plan(&self) -> ClusterPlan {
        let count = self.node_count as u16;
        let seed_plain = SocketAddr::new(LOOPBACK, self.base_port);

        let nodes = (0..self.node_count as u32)
            .map(|id| {
                let plain_port = self.base_port + id as u16;
                let external_port = self.base_port + count + id as u16;
                let sasl_port = self
                    .backend
                    .supports_sasl()
                    .then(|| self.base_port + 2 * count + id as u16);

                let listeners = ListenerSet {
                    plain: SocketAddr::new(LOOPBACK, plain_port),
                    external: SocketAddr::new(LOOPBACK, external_port),
                    sasl: sasl_port.map(|p| SocketAddr::new(LOOPBACK, p)),
                };
                let is_seed = id == 0;
                let seed_peers = if is_seed { vec![] } else { vec![seed_plain] };
                let container = format!("bc-{}-{}-{}", self.backend, self.base_port, id);

                let mut ports = vec![plain_port, external_port];
                ports.extend(sasl_port);

                let (env, args, ready_cmd) = match self.backend {
                    BackendVariant::Kafka => kafka_node_setup(id, count, self.base_port, &listeners),
                    BackendVariant::Redpanda => {
                        redpanda_node_setup(id, &listeners, &seed_peers, self.limits)
                    }
                };

                NodePlan {
                    id,
                    container,
                    image: self.backend.image().to_string(),
                    ports,
                    env,
                    args,
                    ready_cmd,
                    advertised: listeners.external,
                    listeners,
                    seed_peers,
                    is_seed,
                    limits: self.limits,
                }
            })
            .collect();

        ClusterPlan {
            backend: self.backend,
            nodes,
            controller_cmd: controller_probe(self.backend, self.base_port),
        }
    }

    /// Launch the planned cluster and wait for it to settle.
    ///
    /// Any node failing to launch or become ready within the deadline tears
    /// down everything already running and reports an infrastructure
    /// failure; no partial topology is left reachable.
    pub async fn provision(&self) -> Result<Topology, PipelineError> {
        let plan = self.plan();
        info!(
            backend = %plan.backend,
            nodes = plan.nodes.len(),
            "provisioning topology"
        );

        for node in &plan.nodes {
            if let Err(e) = self.runtime.launch(node).await {
                warn!(node = node.id, error = %e, "node launch failed, tearing down");
                self.teardown_plan(&plan).await;
                return Err(PipelineError::infra(format!(
                    "node {} failed to launch: {e:#}",
                    node.id
                )));
            }
        }

        if let Err(e) = self.wait_ready(&plan).await {
            self.teardown_plan(&plan).await;
            return Err(e);
        }

        let controller_id = match self.resolve_controller(&plan).await {
            Ok(id) => id,
            Err(e) => {
                self.teardown_plan(&plan).await;
                return Err(e);
            }
        };

        let topology = Topology {
            backend: plan.backend,
            nodes: plan
                .nodes
                .iter()
                .map(|n| BrokerNode {
                    id: n.id,
                    container: n.container.clone(),
                    listeners: n.listeners.clone(),
                    advertised: n.advertised,
                    seed_peers: n.seed_peers.clone(),
                    is_seed: n.is_seed,
                })
                .collect(),
            proxy: None,
            controller_id,
        };
        topology.validate()?;
        info!(controller = controller_id, "topology ready");
        Ok(topology)
    }

    /// Poll every node until ready or the deadline passes.
    async fn wait_ready(&self, plan: &ClusterPlan) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.readiness_timeout;
        let mut pending: Vec<&NodePlan> = plan.nodes.iter().collect();

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for node in pending {
                let ready = self
                    .runtime
                    .exec(&node.container, &node.ready_cmd)
                    .await
                    .map(|out| out.success)
                    .unwrap_or(false);
                if ready {
                    debug!(node = node.id, "node ready");
                } else {
                    still_pending.push(node);
                }
            }
            pending = still_pending;

            if !pending.is_empty() {
                if Instant::now() >= deadline {
                    let ids: Vec<u32> = pending.iter().map(|n| n.id).collect();
                    return Err(PipelineError::infra(format!(
                        "nodes {ids:?} never became ready within {:?}",
                        self.readiness_timeout
                    )));
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Ask the settled cluster which node currently holds the controller role.
    async fn resolve_controller(&self, plan: &ClusterPlan) -> Result<u32, PipelineError> {
        let seed = &plan.nodes[0];
        let out = self
            .runtime
            .exec(&seed.container, &plan.controller_cmd)
            .await
            .map_err(|e| PipelineError::infra(format!("controller probe failed: {e:#}")))?;
        if !out.success {
            return Err(PipelineError::infra(format!(
                "controller probe exited nonzero: {}",
                out.stdout.trim()
            )));
        }
        parse_controller_id(plan.backend, &out.stdout).ok_or_else(|| {
            PipelineError::infra(format!(
                "controller probe output unparseable: {}",
                out.stdout.trim()
            ))
        })
    }

    /// Remove every planned container. Idempotent; also the cancellation path.
    pub async fn teardown_plan(&self, plan: &ClusterPlan) {
        for node in &plan.nodes {
            if let Err(e) = self.runtime.remove(&node.container).await {
                warn!(container = %node.container, error = %e, "teardown remove failed");
            }
        }
    }

    /// Remove the containers of a provisioned topology.
    pub async fn teardown(&self, topology: &Topology) {
        for node in &topology.nodes {
            if let Err(e) = self.runtime.remove(&node.container).await {
                warn!(container = %node.container, error = %e, "teardown remove failed");
            }
        }
    }
}

fn kafka_node_setup(
    id: u32,
    count: u16,
    base_port: u16,
    listeners: &ListenerSet,
) -> (Vec<(String, String)>, Vec<String>, Vec<String>) {
    // Combined broker+controller KRaft nodes; the quorum spans all nodes so
    // the cluster survives any single node, the seed included.
    let voters = (0..count)
        .map(|i| format!("{i}@127.0.0.1:{}", base_port + i))
        .collect::<Vec<_>>()
        .join(",");

    let mut listener_spec = format!(
        "PLAIN://0.0.0.0:{},EXTERNAL://0.0.0.0:{}",
        listeners.plain.port(),
        listeners.external.port()
    );
    let mut advertised_spec = format!(
        "PLAIN://127.0.0.1:{},EXTERNAL://127.0.0.1:{}",
        listeners.plain.port(),
        listeners.external.port()
    );
    let mut protocol_map =
        "PLAIN:PLAINTEXT,EXTERNAL:PLAINTEXT,CONTROLLER:PLAINTEXT".to_string();
    if let Some(sasl) = listeners.sasl {
        listener_spec.push_str(&format!(",SASL://0.0.0.0:{}", sasl.port()));
        advertised_spec.push_str(&format!(",SASL://127.0.0.1:{}", sasl.port()));
        protocol_map.push_str(",SASL:SASL_PLAINTEXT");
    }

    let env = vec![
        ("KAFKA_NODE_ID".to_string(), id.to_string()),
        (
            "KAFKA_PROCESS_ROLES".to_string(),
            "broker,controller".to_string(),
        ),
        ("KAFKA_CONTROLLER_QUORUM_VOTERS".to_string(), voters),
        (
            "KAFKA_CONTROLLER_LISTENER_NAMES".to_string(),
            "CONTROLLER".to_string(),
        ),
        (
            "KAFKA_INTER_BROKER_LISTENER_NAME".to_string(),
            "PLAIN".to_string(),
        ),
        ("KAFKA_LISTENERS".to_string(), listener_spec),
        ("KAFKA_ADVERTISED_LISTENERS".to_string(), advertised_spec),
        (
            "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP".to_string(),
            protocol_map,
        ),
        (
            "KAFKA_SASL_ENABLED_MECHANISMS".to_string(),
            "PLAIN,SCRAM-SHA-256,SCRAM-SHA-512".to_string(),
        ),
        (
            "KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR".to_string(),
            "1".to_string(),
        ),
    ];

    let ready_cmd = vec![
        "/opt/kafka/bin/kafka-broker-api-versions.sh".to_string(),
        "--bootstrap-server".to_string(),
        format!("127.0.0.1:{}", listeners.plain.port()),
    ];

    (env, Vec::new(), ready_cmd)
}

fn redpanda_node_setup(
    id: u32,
    listeners: &ListenerSet,
    seed_peers: &[SocketAddr],
    limits: ResourceLimits,
) -> (Vec<(String, String)>, Vec<String>, Vec<String>) {
    let mut args = vec![
        "redpanda".to_string(),
        "start".to_string(),
        "--node-id".to_string(),
        id.to_string(),
        "--kafka-addr".to_string(),
        format!(
            "PLAIN://0.0.0.0:{},EXTERNAL://0.0.0.0:{}",
            listeners.plain.port(),
            listeners.external.port()
        ),
        "--advertise-kafka-addr".to_string(),
        format!(
            "PLAIN://127.0.0.1:{},EXTERNAL://127.0.0.1:{}",
            listeners.plain.port(),
            listeners.external.port()
        ),
        "--smp".to_string(),
        "1".to_string(),
        "--memory".to_string(),
        format!("{}M", limits.memory_mb),
        "--overprovisioned".to_string(),
    ];
    for seed in seed_peers {
        args.push("--seeds".to_string());
        args.push(seed.to_string());
    }

    let ready_cmd = vec![
        "rpk".to_string(),
        "cluster".to_string(),
        "health".to_string(),
        "--exit-when-healthy".to_string(),
    ];

    (Vec::new(), args, ready_cmd)
}

fn controller_probe(backend: BackendVariant, base_port: u16) -> Vec<String> {
    match backend {
        BackendVariant::Kafka => vec![
            "/opt/kafka/bin/kafka-metadata-quorum.sh".to_string(),
            "--bootstrap-server".to_string(),
            format!("127.0.0.1:{base_port}"),
            "describe".to_string(),
            "--status".to_string(),
        ],
        BackendVariant::Redpanda => vec![
            "rpk".to_string(),
            "cluster".to_string(),
            "health".to_string(),
        ],
    }
}

/// Pull the controller/leader node id out of the probe output.
fn parse_controller_id(backend: BackendVariant, stdout: &str) -> Option<u32> {
    let marker = match backend {
        BackendVariant::Kafka => "LeaderId:",
        BackendVariant::Redpanda => "Controller ID:",
    };
    stdout
        .lines()
        .find_map(|line| line.split(marker).nth(1))
        .and_then(|rest| rest.trim().split_whitespace().next())
        .and_then(|tok| tok.parse().ok())
}
