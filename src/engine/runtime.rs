// src/engine/runtime.rs

use std::fmt;
use std::future::pending;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{Context, OutputSnapshot};
use crate::errors::{EngineError, Result};
use crate::worker::WorkerResult;

use super::core::EngineCore;
use super::{CoreCommand, CoreEvent, CoreStep, LoopEvent, Request};

/// What woke the loop up.
enum Wake {
    Stop,
    Event(LoopEvent),
    Closed,
    Tick,
}

/// Async shell around [`EngineCore`].
///
/// A single task owns the core and serialises everything through it:
/// API requests, start/stop notifications from spawned tasks, output
/// notices and the retry timer. The loop itself never awaits a start
/// function or a worker; those run on their own tasks and report back
/// through the queue.
pub struct Runtime {
    core: EngineCore,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    stop: CancellationToken,
    done: watch::Sender<Option<WorkerResult>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("stop", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub(crate) fn new(
        core: EngineCore,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
        events_rx: mpsc::UnboundedReceiver<LoopEvent>,
        stop: CancellationToken,
        done: watch::Sender<Option<WorkerResult>>,
    ) -> Self {
        Self {
            core,
            events_tx,
            events_rx,
            stop,
            done,
        }
    }

    /// Main event loop. Returns once every node has stopped after a
    /// shutdown, and publishes the engine's outcome to `done`.
    pub async fn run(mut self) {
        info!("dependency engine started");
        let mut stop_seen = false;

        loop {
            let retry_at = self.core.next_retry(Instant::now());

            let wake = tokio::select! {
                biased;

                _ = self.stop.cancelled(), if !stop_seen => Wake::Stop,
                event = self.events_rx.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::Closed,
                },
                _ = sleep_or_pending(retry_at) => Wake::Tick,
            };

            let now = Instant::now();
            let step = match wake {
                Wake::Stop => {
                    stop_seen = true;
                    self.core.step(CoreEvent::Stop, now)
                }
                Wake::Event(LoopEvent::Core(event)) => self.core.step(event, now),
                Wake::Event(LoopEvent::Request(request)) => match self.handle_request(request, now) {
                    Some(step) => step,
                    None => continue,
                },
                Wake::Tick => self.core.step(CoreEvent::Tick, now),
                Wake::Closed => {
                    // Unreachable while `events_tx` lives in self; a
                    // dropped engine is stopped through `stop` instead.
                    warn!("engine queue closed unexpectedly");
                    break;
                }
            };

            for command in step.commands {
                self.execute(command);
            }

            if !step.keep_running {
                break;
            }
        }

        self.events_rx.close();
        let outcome = self.core.outcome();
        match &outcome {
            Ok(()) => info!("dependency engine stopped"),
            Err(err) => info!(error = %err, "dependency engine stopped with fatal error"),
        }
        let _ = self.done.send(Some(outcome));
    }

    /// Run an API request through the core and answer it. Requests that do
    /// not change node state produce no step.
    fn handle_request(&mut self, request: Request, now: Instant) -> Option<CoreStep> {
        match request {
            Request::Install {
                name,
                manifold,
                reply,
            } => reply_with(reply, self.core.install(&name, manifold, now)),
            Request::InstallAll { manifolds, reply } => {
                reply_with(reply, self.core.install_all(manifolds, now))
            }
            Request::Uninstall { name, reply } => reply_with(reply, self.core.uninstall(&name, now)),
            Request::Bounce { name, reply } => reply_with(reply, self.core.bounce(&name, now)),
            Request::Report { reply } => {
                let report = if self.core.is_finished() {
                    Err(EngineError::Stopped)
                } else {
                    Ok(self.core.report(now))
                };
                let _ = reply.send(report);
                None
            }
        }
    }

    fn execute(&self, command: CoreCommand) {
        debug!(?command, "executing engine command");

        match command {
            CoreCommand::Start {
                name,
                generation,
                manifold,
                token,
            } => {
                let events = self.events_tx.clone();
                let context = Context::new(
                    name.clone(),
                    generation,
                    manifold.inputs(),
                    self.core.snapshot().clone(),
                    token,
                    events.clone(),
                );

                tokio::spawn(async move {
                    // Run the start function on its own task so a panic
                    // turns into an error instead of a lost event.
                    let result = match tokio::spawn(manifold.start(context)).await {
                        Ok(result) => result,
                        Err(join_err) => Err(anyhow::anyhow!(
                            "start function terminated abnormally: {join_err}"
                        )),
                    };
                    let _ = events.send(LoopEvent::Core(CoreEvent::StartReturned {
                        name,
                        generation,
                        result,
                    }));
                });
            }
            CoreCommand::Watch {
                name,
                generation,
                worker,
            } => {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = worker.wait().await;
                    let _ = events.send(LoopEvent::Core(CoreEvent::WorkerStopped {
                        name,
                        generation,
                        result,
                    }));
                });
            }
            CoreCommand::Kill { name, worker } => {
                debug!(node = %name, "killing worker");
                worker.kill();
            }
        }
    }
}

fn reply_with(reply: oneshot::Sender<Result<()>>, result: Result<CoreStep>) -> Option<CoreStep> {
    match result {
        Ok(step) => {
            let _ = reply.send(Ok(()));
            Some(step)
        }
        Err(err) => {
            let _ = reply.send(Err(err));
            None
        }
    }
}

async fn sleep_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}

/// Spawn the loop for a new engine. Returns the queue sender, the stop
/// token and the outcome receiver the handle needs.
pub(crate) fn spawn(
    config: EngineConfig,
) -> (
    mpsc::UnboundedSender<LoopEvent>,
    CancellationToken,
    watch::Receiver<Option<WorkerResult>>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel(None);
    let stop = CancellationToken::new();

    let core = EngineCore::new(config, OutputSnapshot::new());
    let runtime = Runtime::new(core, events_tx.clone(), events_rx, stop.clone(), done_tx);

    let handle = tokio::spawn(runtime.run());
    tokio::spawn(async move {
        if let Err(join_err) = handle.await {
            warn!(error = %join_err, "engine loop terminated abnormally");
        }
    });

    (events_tx, stop, done_rx)
}
