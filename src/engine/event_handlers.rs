// src/engine/event_handlers.rs

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::core::{CoreCommand, CoreStep, EngineCore, mark_uninstalled};
use crate::errors::EngineError;
use crate::manifold::{ErrorClass, outputs_match};
use crate::node::NodeState;
use crate::worker::{Bounce, Uninstall, Worker, WorkerError, WorkerResult};

/// A start function finished, successfully or not.
pub fn handle_start_returned(
    core: &mut EngineCore,
    name: &str,
    generation: u64,
    result: anyhow::Result<Arc<dyn Worker>>,
    now: Instant,
) -> CoreStep {
    let mut commands = Vec::new();

    let current = core
        .nodes
        .get(name)
        .is_some_and(|node| node.generation == generation && node.state.is_active());
    if !current {
        // A newer attempt owns the node; make sure the stray worker goes away.
        if let Ok(worker) = result {
            debug!(node = %name, generation, "killing worker from stale start");
            worker.kill();
        }
        return core.finish_step(commands, now);
    }

    let stopping = core
        .nodes
        .get(name)
        .is_some_and(|node| node.state == NodeState::Stopping);

    match result {
        Ok(worker) if stopping => {
            // Stop was requested mid-start: the worker still has to be
            // watched so the node reaches `stopped` only once it is gone.
            if let Some(node) = core.nodes.get_mut(name) {
                node.worker = Some(Arc::clone(&worker));
            }
            commands.push(CoreCommand::Kill {
                name: name.to_string(),
                worker: Arc::clone(&worker),
            });
            commands.push(CoreCommand::Watch {
                name: name.to_string(),
                generation,
                worker,
            });
        }
        Ok(worker) => {
            let Some(node) = core.nodes.get_mut(name) else {
                return core.finish_step(commands, now);
            };

            let output = node.manifold.output_of(worker.as_ref());
            core.snapshot.publish(name, output.clone());
            node.output = output;
            node.worker = Some(Arc::clone(&worker));
            node.state = NodeState::Started;
            info!(node = %name, generation, "manifold started");

            commands.push(CoreCommand::Watch {
                name: name.to_string(),
                generation,
                worker,
            });
        }
        Err(err) if stopping => {
            debug!(node = %name, generation, error = %format!("{err:#}"), "start cancelled");
            let pending_uninstall = core
                .nodes
                .get(name)
                .is_some_and(|node| node.uninstall_pending);
            if pending_uninstall {
                if let Some(node) = core.nodes.get_mut(name) {
                    mark_uninstalled(node);
                }
                info!(node = %name, generation, "start cancelled; manifold uninstalled");
            } else {
                finish_stop(core, name, None);
            }
        }
        Err(err) => record_start_failure(core, name, err, now),
    }

    core.finish_step(commands, now)
}

/// A watched worker terminated.
pub fn handle_worker_stopped(
    core: &mut EngineCore,
    name: &str,
    generation: u64,
    result: WorkerResult,
    now: Instant,
) -> CoreStep {
    let mut commands = Vec::new();

    let Some(node) = core.nodes.get(name) else {
        return core.finish_step(commands, now);
    };
    if node.generation != generation || !node.state.is_active() {
        debug!(node = %name, generation, "ignoring stale worker exit");
        return core.finish_step(commands, now);
    }

    let was_started = node.state == NodeState::Started;
    let requested = node.stop_requested();
    let pending_uninstall = node.uninstall_pending;

    if was_started {
        // Withdraw first so no dependent can read the dead output.
        core.snapshot.withdraw(name);
        if let Some(node) = core.nodes.get_mut(name) {
            node.output = None;
        }
        core.bounce_dependents(name, &mut commands);
    }

    if pending_uninstall {
        if let Some(node) = core.nodes.get_mut(name) {
            mark_uninstalled(node);
        }
        info!(node = %name, generation, "worker stopped; manifold uninstalled");
        return core.finish_step(commands, now);
    }

    match result {
        Ok(()) if requested => {
            info!(node = %name, generation, "worker stopped");
            finish_stop(core, name, None);
        }
        Ok(()) => clean_exit(core, name, now),
        Err(err) => {
            let class = core
                .nodes
                .get(name)
                .map(|node| node.manifold.classify(&err))
                .unwrap_or(ErrorClass::Restart);
            let sentinel = err.is::<Bounce>() || err.is::<Uninstall>();

            if requested && class != ErrorClass::Fatal && !sentinel {
                info!(node = %name, generation, error = %err, "worker stopped with error");
                finish_stop(core, name, Some(err));
            } else {
                apply_failure(core, name, err, now);
            }
        }
    }

    core.finish_step(commands, now)
}

/// A running worker asked for its output to be re-read.
pub fn handle_output_changed(
    core: &mut EngineCore,
    name: &str,
    generation: u64,
    now: Instant,
) -> CoreStep {
    let mut commands = Vec::new();

    let Some(node) = core.nodes.get_mut(name) else {
        return core.finish_step(commands, now);
    };
    if node.generation != generation || node.state != NodeState::Started {
        debug!(node = %name, generation, "ignoring output notice from stale worker");
        return core.finish_step(commands, now);
    }
    let Some(worker) = node.worker.clone() else {
        return core.finish_step(commands, now);
    };

    let fresh = node.manifold.output_of(worker.as_ref());
    if outputs_match(node.output.as_ref(), fresh.as_ref()) {
        debug!(node = %name, generation, "output unchanged");
        return core.finish_step(commands, now);
    }

    info!(node = %name, generation, "output changed; bouncing dependents");
    node.output = fresh.clone();
    core.snapshot.publish(name, fresh);
    core.bounce_dependents(name, &mut commands);

    core.finish_step(commands, now)
}

fn record_start_failure(core: &mut EngineCore, name: &str, err: anyhow::Error, now: Instant) {
    let engine_err = err.downcast_ref::<EngineError>();
    let missing = engine_err.is_some_and(EngineError::is_missing);
    let wiring = engine_err.is_some_and(EngineError::is_wiring);

    if missing {
        let delay = core.config.restart_delay;
        if let Some(node) = core.nodes.get_mut(name) {
            info!(
                node = %name,
                generation = node.generation,
                error = %format!("{err:#}"),
                "input not available yet; start deferred"
            );
            node.state = NodeState::Stopped;
            node.worker = None;
            node.retry_at = Some(now + delay);
        }
        return;
    }

    if wiring {
        if let Some(node) = core.nodes.get_mut(name) {
            error!(
                node = %name,
                generation = node.generation,
                error = %format!("{err:#}"),
                "manifold wiring error; parked until bounced or reinstalled"
            );
            node.state = NodeState::Error;
            node.worker = None;
            node.parked = true;
            node.retry_at = None;
            node.last_error = Some(WorkerError::from(err));
        }
        return;
    }

    apply_failure(core, name, WorkerError::from(err), now);
}

/// Route a failed attempt or worker according to sentinels and the
/// manifold's filter.
fn apply_failure(core: &mut EngineCore, name: &str, err: WorkerError, now: Instant) {
    if err.is::<Uninstall>() {
        info!(node = %name, "worker asked to be uninstalled");
        core.graph.remove(name);
        if let Some(node) = core.nodes.get_mut(name) {
            mark_uninstalled(node);
        }
        return;
    }

    if err.is::<Bounce>() {
        info!(node = %name, "worker asked to be bounced");
        finish_stop(core, name, None);
        return;
    }

    let class = core
        .nodes
        .get(name)
        .map(|node| node.manifold.classify(&err))
        .unwrap_or(ErrorClass::Restart);

    match class {
        ErrorClass::Ignore => {
            debug!(node = %name, error = %err, "error ignored by filter");
            clean_exit(core, name, now);
        }
        ErrorClass::Fatal => {
            error!(node = %name, error = %err, "fatal error; stopping engine");
            if let Some(node) = core.nodes.get_mut(name) {
                node.state = NodeState::Error;
                node.worker = None;
                node.parked = true;
                node.retry_at = None;
                node.last_error = Some(err.clone());
            }
            if core.fatal.is_none() {
                core.fatal = Some(err);
            }
            core.stopping = true;
        }
        ErrorClass::Restart => {
            let policy = core.config.backoff;
            let Some(node) = core.nodes.get_mut(name) else {
                return;
            };
            node.failures = node.failures.saturating_add(1);
            let delay = policy.delay(node.failures);
            node.state = NodeState::Error;
            node.worker = None;
            node.retry_at = Some(now + delay);
            warn!(
                node = %name,
                generation = node.generation,
                attempt = node.failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "manifold failed; retry scheduled"
            );
            node.last_error = Some(err);
        }
    }
}

/// Worker ran to completion on its own.
fn clean_exit(core: &mut EngineCore, name: &str, now: Instant) {
    let delay = core.config.restart_delay;
    if let Some(node) = core.nodes.get_mut(name) {
        info!(
            node = %name,
            generation = node.generation,
            delay_ms = delay.as_millis() as u64,
            "worker exited; restart scheduled"
        );
        node.state = NodeState::Stopped;
        node.worker = None;
        node.failures = 0;
        node.retry_at = Some(now + delay);
    }
}

/// Requested stop completed; the node may start again right away.
fn finish_stop(core: &mut EngineCore, name: &str, err: Option<WorkerError>) {
    if let Some(node) = core.nodes.get_mut(name) {
        node.state = NodeState::Stopped;
        node.worker = None;
        node.retry_at = None;
        if err.is_some() {
            node.last_error = err;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::EngineConfig;
    use crate::context::OutputSnapshot;
    use crate::engine::CoreEvent;
    use crate::manifold::Manifold;
    use crate::worker::BoxFuture;

    struct Gauge {
        value: Arc<AtomicUsize>,
    }

    impl Worker for Gauge {
        fn kill(&self) {}

        fn wait(&self) -> BoxFuture<'_, WorkerResult> {
            Box::pin(std::future::pending())
        }
    }

    fn core() -> EngineCore {
        EngineCore::new(
            EngineConfig {
                backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
                restart_delay: Duration::ZERO,
                strict_inputs: true,
            },
            OutputSnapshot::new(),
        )
    }

    fn gauge_manifold(inputs: &[&str]) -> Manifold {
        Manifold::builder()
            .inputs(inputs.iter().copied())
            .start(|_ctx| async {
                Ok(Gauge {
                    value: Arc::new(AtomicUsize::new(0)),
                })
            })
            .output_eq(|p: &Gauge| p.value.load(Ordering::SeqCst))
            .build()
            .unwrap()
    }

    fn start_with(core: &mut EngineCore, name: &str, worker: Arc<dyn Worker>, now: Instant) -> CoreStep {
        let generation = core.nodes[name].generation;
        core.step(
            CoreEvent::StartReturned {
                name: name.to_string(),
                generation,
                result: Ok(worker),
            },
            now,
        )
    }

    fn fail_start(core: &mut EngineCore, name: &str, err: anyhow::Error, now: Instant) -> CoreStep {
        let generation = core.nodes[name].generation;
        core.step(
            CoreEvent::StartReturned {
                name: name.to_string(),
                generation,
                result: Err(err),
            },
            now,
        )
    }

    #[test]
    fn output_notice_bounces_dependents_only_on_change() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();
        core.install("b", gauge_manifold(&["a"]), now).unwrap();

        let value = Arc::new(AtomicUsize::new(1));
        start_with(&mut core, "a", Arc::new(Gauge { value: value.clone() }), now);
        start_with(
            &mut core,
            "b",
            Arc::new(Gauge {
                value: Arc::new(AtomicUsize::new(0)),
            }),
            now,
        );
        let generation = core.nodes["a"].generation;

        let step = core.step(
            CoreEvent::OutputChanged {
                name: "a".into(),
                generation,
            },
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("b"), Some(NodeState::Started));

        value.store(2, Ordering::SeqCst);
        let step = core.step(
            CoreEvent::OutputChanged {
                name: "a".into(),
                generation,
            },
            now,
        );
        assert_eq!(format!("{:?}", step.commands), "[Kill(b)]");
        assert_eq!(core.state_of("a"), Some(NodeState::Started));
        assert_eq!(core.state_of("b"), Some(NodeState::Stopping));
        assert_eq!(core.snapshot().current()["a"].as_ref().unwrap().get::<usize>(), Some(2));
    }

    #[test]
    fn missing_input_defers_without_counting_a_failure() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();

        let step = fail_start(&mut core, "a", EngineError::Missing("x".into()).into(), now);
        // restart_delay is zero, so the node is immediately started again.
        assert_eq!(format!("{:?}", step.commands), "[Start(a#2)]");
        assert_eq!(core.nodes["a"].failures, 0);
        assert!(core.nodes["a"].last_error.is_none());
    }

    #[test]
    fn wiring_errors_park_until_bounced() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();

        let step = fail_start(
            &mut core,
            "a",
            EngineError::UndeclaredInput("ghost".into()).into(),
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("a"), Some(NodeState::Error));
        assert_eq!(core.next_retry(now), None);

        let later = core.step(CoreEvent::Tick, now + Duration::from_secs(3600));
        assert!(later.commands.is_empty());

        let step = core.bounce("a", now).unwrap();
        assert_eq!(format!("{:?}", step.commands), "[Start(a#2)]");
    }

    #[test]
    fn fatal_filter_stops_the_engine() {
        let now = Instant::now();
        let mut core = core();
        let fatal = Manifold::builder()
            .start(|_ctx| async {
                Ok(Gauge {
                    value: Arc::new(AtomicUsize::new(0)),
                })
            })
            .filter(|_| ErrorClass::Fatal)
            .build()
            .unwrap();
        core.install("f", fatal, now).unwrap();

        let step = fail_start(&mut core, "f", anyhow::anyhow!("no way"), now);
        assert!(!step.keep_running);
        assert!(core.is_stopping());
        let err = core.outcome().unwrap_err();
        assert_eq!(err.to_string(), "no way");
    }

    #[test]
    fn stale_start_results_are_killed() {
        struct Counting(Arc<AtomicUsize>);
        impl Worker for Counting {
            fn kill(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn wait(&self) -> BoxFuture<'_, WorkerResult> {
                Box::pin(std::future::pending())
            }
        }

        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();
        let kills = Arc::new(AtomicUsize::new(0));

        let step = core.step(
            CoreEvent::StartReturned {
                name: "a".into(),
                generation: 99,
                result: Ok(Arc::new(Counting(kills.clone()))),
            },
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(core.state_of("a"), Some(NodeState::Starting));
    }

    #[test]
    fn uninstall_sentinel_removes_the_node() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();
        start_with(
            &mut core,
            "a",
            Arc::new(Gauge {
                value: Arc::new(AtomicUsize::new(0)),
            }),
            now,
        );
        let generation = core.nodes["a"].generation;

        let step = core.step(
            CoreEvent::WorkerStopped {
                name: "a".into(),
                generation,
                result: Err(anyhow::Error::new(Uninstall).into()),
            },
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("a"), Some(NodeState::Uninstalled));
        assert!(!core.snapshot().contains("a"));
    }

    #[test]
    fn uninstall_during_a_failed_start_stays_uninstalled() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();
        core.install("b", gauge_manifold(&["a"]), now).unwrap();
        assert_eq!(core.state_of("a"), Some(NodeState::Starting));

        let step = core.uninstall("a", now).unwrap();
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("a"), Some(NodeState::Stopping));

        // The start function saw its cancellation and gave up.
        let step = fail_start(&mut core, "a", anyhow::anyhow!("cancelled"), now);
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("a"), Some(NodeState::Uninstalled));
        assert_eq!(core.state_of("b"), Some(NodeState::Stopped));
        assert!(!core.snapshot().contains("a"));
        assert!(matches!(
            core.uninstall("a", now),
            Err(EngineError::NotInstalled(n)) if n == "a"
        ));

        let step = core.install("a", gauge_manifold(&[]), now).unwrap();
        assert_eq!(format!("{:?}", step.commands), "[Start(a#2)]");
    }

    #[test]
    fn uninstall_during_a_successful_start_kills_the_late_worker() {
        let now = Instant::now();
        let mut core = core();
        core.install("a", gauge_manifold(&[]), now).unwrap();
        core.install("b", gauge_manifold(&["a"]), now).unwrap();
        core.uninstall("a", now).unwrap();

        let step = start_with(
            &mut core,
            "a",
            Arc::new(Gauge {
                value: Arc::new(AtomicUsize::new(0)),
            }),
            now,
        );
        assert_eq!(format!("{:?}", step.commands), "[Kill(a), Watch(a#1)]");
        assert_eq!(core.state_of("a"), Some(NodeState::Stopping));
        assert!(!core.snapshot().contains("a"));

        let step = core.step(
            CoreEvent::WorkerStopped {
                name: "a".into(),
                generation: 1,
                result: Ok(()),
            },
            now,
        );
        assert!(step.commands.is_empty());
        assert_eq!(core.state_of("a"), Some(NodeState::Uninstalled));
        assert_eq!(core.state_of("b"), Some(NodeState::Stopped));
    }
}
