//! Connection-target selection.
//!
//! The address list handed to the client suite is deliberately ordered so
//! its first entry is never the cluster's current controller. A client that
//! only ever talks to the first address it was given would pass trivially;
//! starting somewhere else forces real metadata discovery and redirection.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::topology::Topology;

/// Placeholder that resolves nowhere. Dialing it must fail fast, pushing the
/// client to the next entry in the list.
pub const UNREACHABLE_PLACEHOLDER: &str = "invalid:9092";

/// Connection parameters handed to one conformance job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTarget {
    /// Ordered bootstrap list. First entry is never the controller.
    pub bootstrap: Vec<String>,
    /// SASL-authenticated address, distinct from the plain entries.
    pub sasl: Option<String>,
    /// Gateway address, when traffic is interposed.
    pub proxy: Option<String>,
    /// Feature flags forwarded to the suite build.
    pub features: Vec<String>,
    /// Whether live-topology cases run at all.
    pub integration: bool,
}

impl TestTarget {
    /// The comma-joined form the client consumes.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.bootstrap.join(",")
    }
}

/// Computes [`TestTarget`]s from live topologies.
#[derive(Debug, Clone)]
pub struct TargetSelector {
    placeholder_first: bool,
    integration: bool,
}

impl TargetSelector {
    pub fn new(placeholder_first: bool, integration: bool) -> Self {
        Self {
            placeholder_first,
            integration,
        }
    }

    /// Build the target for a topology.
    ///
    /// The external addresses are rotated until a non-controller leads, then
    /// the unreachable placeholder is optionally prepended. Either way the
    /// first *resolvable* entry is not the controller, so the suite cannot
    /// succeed by luck of being handed the right node up front.
    pub fn select(&self, topology: &Topology) -> Result<TestTarget, PipelineError> {
        let controller_addr = topology.controller().listeners.external;
        let mut addrs: Vec<SocketAddr> = topology.external_addrs();
        if addrs.len() < 2 {
            return Err(PipelineError::infra(
                "cannot order a non-controller-first list with fewer than 2 nodes",
            ));
        }

        let lead = addrs
            .iter()
            .position(|a| *a != controller_addr)
            .expect("at least one non-controller node exists");
        addrs.rotate_left(lead);
        debug_assert_ne!(addrs[0], controller_addr);

        let mut bootstrap: Vec<String> = addrs.iter().map(SocketAddr::to_string).collect();
        if self.placeholder_first {
            bootstrap.insert(0, UNREACHABLE_PLACEHOLDER.to_string());
        }

        let sasl = topology
            .nodes
            .iter()
            .find(|n| !n.is_seed && n.id != topology.controller_id)
            .or_else(|| topology.nodes.iter().find(|n| n.id != topology.controller_id))
            .and_then(|n| n.listeners.sasl)
            .map(|a| a.to_string());

        debug!(
            controller = topology.controller_id,
            first = %bootstrap[0],
            "selected test target"
        );

        Ok(TestTarget {
            bootstrap,
            sasl,
            proxy: topology.proxy.map(|a| a.to_string()),
            features: Vec::new(),
            integration: self.integration,
        })
    }
}
