// src/node.rs

//! The engine's per-manifold bookkeeping and its public report view.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::manifold::{Manifold, Output};
use crate::worker::{Worker, WorkerError};

/// Lifecycle state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Manifold removed; the record is kept so the name counts as known.
    Uninstalled,
    /// No worker; eligible to start once inputs are started.
    Stopped,
    /// Start function in flight.
    Starting,
    /// Worker running and output published.
    Started,
    /// Stop requested, waiting for the worker (or start function) to finish.
    Stopping,
    /// Last attempt failed; eligible again after `retry_at`.
    Error,
}

impl NodeState {
    /// Whether a worker or start function may be live for this node.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeState::Starting | NodeState::Started | NodeState::Stopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Uninstalled => "uninstalled",
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Started => "started",
            NodeState::Stopping => "stopping",
            NodeState::Error => "error",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record for one installed manifold. Owned by the engine core.
pub(crate) struct Node {
    pub manifold: Manifold,
    pub state: NodeState,
    pub worker: Option<Arc<dyn Worker>>,
    /// Last value from the manifold's output function; only set while started.
    pub output: Option<Output>,
    pub last_error: Option<WorkerError>,
    /// Not eligible to start before this instant.
    pub retry_at: Option<Instant>,
    /// Set when an error must not be retried until the node is bounced or
    /// reinstalled.
    pub parked: bool,
    /// Consecutive failures since the last clean run.
    pub failures: u32,
    /// Incremented on every start attempt.
    pub generation: u64,
    /// Cancelled when the current attempt must stop.
    pub token: Option<CancellationToken>,
    /// Uninstall once the current worker has stopped.
    pub uninstall_pending: bool,
}

impl Node {
    pub fn new(manifold: Manifold) -> Self {
        Self {
            manifold,
            state: NodeState::Stopped,
            worker: None,
            output: None,
            last_error: None,
            retry_at: None,
            parked: false,
            failures: 0,
            generation: 0,
            token: None,
            uninstall_pending: false,
        }
    }

    /// Whether the stop of the current attempt was asked for by the engine.
    pub fn stop_requested(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Whether the node may be started at `now`, inputs permitting.
    pub fn eligible(&self, now: Instant) -> bool {
        let state_ok = match self.state {
            NodeState::Stopped => true,
            NodeState::Error => !self.parked,
            _ => false,
        };
        state_ok && self.retry_at.is_none_or(|at| at <= now)
    }

    pub fn status(&self, missing_inputs: Vec<String>, now: Instant) -> NodeStatus {
        NodeStatus {
            state: self.state,
            inputs: self.manifold.inputs().to_vec(),
            missing_inputs,
            last_error: self.last_error.clone(),
            retry_in: self
                .retry_at
                .filter(|at| *at > now && !self.parked)
                .map(|at| at - now),
            failures: self.failures,
            starts: self.generation,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("failures", &self.failures)
            .field("retry_at", &self.retry_at)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// Diagnostic view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub inputs: Vec<String>,
    /// Declared inputs that are not started right now.
    pub missing_inputs: Vec<String>,
    #[serde(serialize_with = "error_text")]
    pub last_error: Option<WorkerError>,
    /// Time left before a restart may be attempted.
    pub retry_in: Option<Duration>,
    pub failures: u32,
    /// Total start attempts.
    pub starts: u64,
}

/// Status of every node the engine knows about.
pub type Report = BTreeMap<String, NodeStatus>;

fn error_text<S: Serializer>(err: &Option<WorkerError>, serializer: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
