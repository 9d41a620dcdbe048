// src/engine/core.rs

//! Pure decision core of the dependency engine.
//!
//! [`EngineCore`] is the only thing that mutates node state. It is fed one
//! [`CoreEvent`] or API call at a time together with the current instant and
//! answers with a [`CoreStep`]: the commands the async shell must carry out
//! (run a start function, kill a worker, watch a worker) and whether the
//! engine is still running.
//!
//! The core never awaits and never spawns. That keeps every transition
//! serialised and lets tests drive it with hand-made instants and fake
//! workers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::context::OutputSnapshot;
use crate::engine::CoreEvent;
use crate::engine::event_handlers::{
    handle_output_changed, handle_start_returned, handle_worker_stopped,
};
use crate::errors::{EngineError, Result};
use crate::graph::{DepGraph, order_batch};
use crate::manifold::{Manifold, Manifolds};
use crate::node::{Node, NodeState, Report};
use crate::worker::{Worker, WorkerResult};

/// Work the async shell must perform after a core step.
pub enum CoreCommand {
    /// Run the manifold's start function with a fresh context.
    Start {
        name: String,
        generation: u64,
        manifold: Manifold,
        token: CancellationToken,
    },
    /// Wait for the worker to terminate and report back.
    Watch {
        name: String,
        generation: u64,
        worker: Arc<dyn Worker>,
    },
    /// Ask the worker to stop.
    Kill {
        name: String,
        worker: Arc<dyn Worker>,
    },
}

impl fmt::Debug for CoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreCommand::Start {
                name, generation, ..
            } => write!(f, "Start({name}#{generation})"),
            CoreCommand::Watch {
                name, generation, ..
            } => write!(f, "Watch({name}#{generation})"),
            CoreCommand::Kill { name, .. } => write!(f, "Kill({name})"),
        }
    }
}

/// Result of handling one event.
#[derive(Debug)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// `false` once every node has stopped after a shutdown.
    pub keep_running: bool,
}

/// Node table, dependency graph and published outputs of one engine.
pub struct EngineCore {
    pub(super) config: EngineConfig,
    pub(super) graph: DepGraph,
    pub(super) nodes: BTreeMap<String, Node>,
    pub(super) snapshot: OutputSnapshot,
    pub(super) stopping: bool,
    pub(super) fatal: Option<crate::worker::WorkerError>,
    finished: bool,
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("nodes", &self.nodes)
            .field("stopping", &self.stopping)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EngineCore {
    pub fn new(config: EngineConfig, snapshot: OutputSnapshot) -> Self {
        Self {
            config,
            graph: DepGraph::new(),
            nodes: BTreeMap::new(),
            snapshot,
            stopping: false,
            fatal: None,
            finished: false,
        }
    }

    pub fn snapshot(&self) -> &OutputSnapshot {
        &self.snapshot
    }

    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(|node| node.state)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Whether shutdown has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The engine's own terminal outcome: the first fatal error, if any.
    pub fn outcome(&self) -> WorkerResult {
        match &self.fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Install one manifold under `name`.
    pub fn install(&mut self, name: &str, manifold: Manifold, now: Instant) -> Result<CoreStep> {
        self.ensure_open()?;
        self.validate_install(name, manifold.inputs(), None)?;
        self.graph.check_insert(name, manifold.inputs())?;
        self.add(name, manifold);
        Ok(self.finish_step(Vec::new(), now))
    }

    /// Install a batch atomically: either every manifold is installed, in
    /// dependency order, or none is.
    pub fn install_all(&mut self, manifolds: Manifolds, now: Instant) -> Result<CoreStep> {
        self.ensure_open()?;

        let declared: BTreeMap<String, Vec<String>> = manifolds
            .iter()
            .map(|(name, manifold)| (name.clone(), manifold.inputs().to_vec()))
            .collect();

        for (name, inputs) in declared.iter() {
            self.validate_install(name, inputs, Some(&declared))?;
        }

        let mut candidate = self.graph.clone();
        for (name, inputs) in declared.iter() {
            candidate.insert(name, inputs);
        }
        candidate.topological_order()?;

        let mut manifolds = manifolds;
        for name in order_batch(&declared)? {
            if let Some(manifold) = manifolds.remove(&name) {
                self.add(&name, manifold);
            }
        }

        Ok(self.finish_step(Vec::new(), now))
    }

    /// Stop `name` (bouncing its dependents) and remove its manifold.
    pub fn uninstall(&mut self, name: &str, now: Instant) -> Result<CoreStep> {
        self.ensure_open()?;
        self.ensure_installed(name)?;

        let mut commands = Vec::new();
        self.graph.remove(name);
        self.request_stop(name, &mut commands);

        if let Some(node) = self.nodes.get_mut(name) {
            if node.state == NodeState::Stopping {
                node.uninstall_pending = true;
            } else {
                mark_uninstalled(node);
            }
        }
        info!(node = %name, "manifold uninstalled");

        Ok(self.finish_step(commands, now))
    }

    /// Force `name` to stop and start again, together with everything that
    /// depends on it. Also releases a node parked in `error`.
    pub fn bounce(&mut self, name: &str, now: Instant) -> Result<CoreStep> {
        self.ensure_open()?;
        self.ensure_installed(name)?;

        let mut commands = Vec::new();
        let state = self.state_of(name);
        match state {
            Some(NodeState::Started) | Some(NodeState::Starting) => {
                info!(node = %name, "bounce requested");
                self.request_stop(name, &mut commands);
            }
            Some(NodeState::Error) | Some(NodeState::Stopped) => {
                if let Some(node) = self.nodes.get_mut(name) {
                    node.state = NodeState::Stopped;
                    node.parked = false;
                    node.retry_at = None;
                }
            }
            _ => {}
        }

        Ok(self.finish_step(commands, now))
    }

    pub fn report(&self, now: Instant) -> Report {
        self.nodes
            .iter()
            .map(|(name, node)| {
                let missing = node
                    .manifold
                    .inputs()
                    .iter()
                    .filter(|input| !self.is_started(input))
                    .cloned()
                    .collect();
                (name.clone(), node.status(missing, now))
            })
            .collect()
    }

    /// The earliest future instant at which a waiting node becomes
    /// eligible to start.
    pub fn next_retry(&self, now: Instant) -> Option<Instant> {
        if self.stopping {
            return None;
        }

        self.nodes
            .values()
            .filter(|node| match node.state {
                NodeState::Stopped => true,
                NodeState::Error => !node.parked,
                _ => false,
            })
            .filter_map(|node| node.retry_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Feed one event into the core.
    pub fn step(&mut self, event: CoreEvent, now: Instant) -> CoreStep {
        debug!(?event, "engine core received event");

        match event {
            CoreEvent::StartReturned {
                name,
                generation,
                result,
            } => handle_start_returned(self, &name, generation, result, now),
            CoreEvent::WorkerStopped {
                name,
                generation,
                result,
            } => handle_worker_stopped(self, &name, generation, result, now),
            CoreEvent::OutputChanged { name, generation } => {
                handle_output_changed(self, &name, generation, now)
            }
            CoreEvent::Tick => self.finish_step(Vec::new(), now),
            CoreEvent::Stop => {
                if !self.stopping {
                    info!("engine stop requested");
                    self.stopping = true;
                }
                self.finish_step(Vec::new(), now)
            }
        }
    }

    /// Common tail of every step: start what can start, or keep shutting
    /// down.
    pub(super) fn finish_step(&mut self, mut commands: Vec<CoreCommand>, now: Instant) -> CoreStep {
        if self.stopping {
            self.advance_shutdown(&mut commands);
        } else {
            self.resolve(now, &mut commands);
        }

        CoreStep {
            commands,
            keep_running: !self.finished,
        }
    }

    pub(super) fn is_started(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .is_some_and(|node| node.state == NodeState::Started)
    }

    /// Stop `name` and, transitively, everything depending on it. The node's
    /// output is withdrawn before any dependent is signalled.
    pub(super) fn request_stop(&mut self, name: &str, commands: &mut Vec<CoreCommand>) {
        self.stop_one(name, commands);
        self.bounce_dependents(name, commands);
    }

    pub(super) fn bounce_dependents(&mut self, name: &str, commands: &mut Vec<CoreCommand>) {
        for dependent in self.graph.dependents_of(name) {
            self.request_stop(&dependent, commands);
        }
    }

    fn stop_one(&mut self, name: &str, commands: &mut Vec<CoreCommand>) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };

        match node.state {
            NodeState::Started => {
                self.snapshot.withdraw(name);
                node.output = None;
                if let Some(token) = &node.token {
                    token.cancel();
                }
                if let Some(worker) = &node.worker {
                    commands.push(CoreCommand::Kill {
                        name: name.to_string(),
                        worker: Arc::clone(worker),
                    });
                }
                node.state = NodeState::Stopping;
                info!(node = %name, generation = node.generation, "stopping worker");
            }
            NodeState::Starting => {
                if let Some(token) = &node.token {
                    token.cancel();
                }
                node.state = NodeState::Stopping;
                debug!(node = %name, generation = node.generation, "cancelling start in flight");
            }
            _ => {}
        }
    }

    /// Issue a start for every node that is eligible and whose inputs are all
    /// started.
    ///
    /// Several nodes may start in one pass. None of them can be an input of
    /// another: a ready node needs its inputs in `started`, and every node
    /// picked here is still `stopped` or `error` when the pass begins. So a
    /// start issued here never races one of its own inputs.
    fn resolve(&mut self, now: Instant, commands: &mut Vec<CoreCommand>) {
        if self.stopping {
            return;
        }

        let ready: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.eligible(now)
                    && node
                        .manifold
                        .inputs()
                        .iter()
                        .all(|input| self.is_started(input))
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in ready {
            let Some(node) = self.nodes.get_mut(&name) else {
                continue;
            };

            node.generation += 1;
            node.state = NodeState::Starting;
            node.retry_at = None;
            let token = CancellationToken::new();
            node.token = Some(token.clone());

            info!(
                node = %name,
                generation = node.generation,
                failures = node.failures,
                "starting manifold"
            );

            commands.push(CoreCommand::Start {
                name: name.clone(),
                generation: node.generation,
                manifold: node.manifold.clone(),
                token,
            });
        }
    }

    /// Stop nodes dependents-first: a node is asked to stop only once
    /// nothing that consumes it is still running.
    fn advance_shutdown(&mut self, commands: &mut Vec<CoreCommand>) {
        let active: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.state.is_active())
            .map(|(name, _)| name.clone())
            .collect();

        if active.is_empty() {
            if !self.finished {
                self.finished = true;
                info!(fatal = self.fatal.is_some(), "all nodes stopped; engine finished");
            }
            return;
        }

        for name in active {
            let consumed = self.nodes.iter().any(|(other, node)| {
                *other != name
                    && node.state.is_active()
                    && node.manifold.inputs().iter().any(|input| *input == name)
            });
            if !consumed {
                self.stop_one(&name, commands);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopping || self.finished {
            Err(EngineError::Stopped)
        } else {
            Ok(())
        }
    }

    fn ensure_installed(&self, name: &str) -> Result<()> {
        match self.nodes.get(name) {
            Some(node) if node.state != NodeState::Uninstalled && !node.uninstall_pending => Ok(()),
            _ => Err(EngineError::NotInstalled(name.to_string())),
        }
    }

    fn validate_install(
        &self,
        name: &str,
        inputs: &[String],
        batch: Option<&BTreeMap<String, Vec<String>>>,
    ) -> Result<()> {
        if self.ensure_installed(name).is_ok() {
            return Err(EngineError::AlreadyInstalled(name.to_string()));
        }

        for input in inputs {
            if input == name {
                return Err(EngineError::SelfDependency(name.to_string()));
            }
            let known = self.nodes.contains_key(input)
                || batch.is_some_and(|batch| batch.contains_key(input));
            if self.config.strict_inputs && !known {
                return Err(EngineError::UnknownInput {
                    name: name.to_string(),
                    input: input.clone(),
                });
            }
        }

        Ok(())
    }

    fn add(&mut self, name: &str, manifold: Manifold) {
        self.graph.insert(name, manifold.inputs());

        match self.nodes.get_mut(name) {
            Some(node) => {
                node.manifold = manifold;
                node.uninstall_pending = false;
                node.parked = false;
                node.failures = 0;
                node.retry_at = None;
                if node.state == NodeState::Uninstalled {
                    node.state = NodeState::Stopped;
                }
                info!(node = %name, state = %node.state, "manifold reinstalled");
            }
            None => {
                info!(node = %name, inputs = ?manifold.inputs(), "manifold installed");
                self.nodes.insert(name.to_string(), Node::new(manifold));
            }
        }
    }
}

/// Reset a node whose manifold is gone.
pub(super) fn mark_uninstalled(node: &mut Node) {
    node.state = NodeState::Uninstalled;
    node.worker = None;
    node.token = None;
    node.output = None;
    node.retry_at = None;
    node.parked = false;
    node.failures = 0;
    node.uninstall_pending = false;
}
