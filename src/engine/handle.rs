// src/engine/handle.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::manifold::{Manifold, Manifolds};
use crate::node::Report;
use crate::worker::{BoxFuture, Worker, WorkerResult, wait_outcome};

use super::{LoopEvent, Request, runtime};

/// Handle to a running dependency engine.
///
/// Cheap to clone; every clone talks to the same decision loop. The engine
/// is itself a [`Worker`]: `kill` starts a graceful shutdown (dependents
/// stop before their inputs) and `wait` resolves with the first fatal
/// error, if any, once every node has stopped. That lets an engine run as a
/// node inside another engine.
///
/// Dropping the last clone has the same effect as `kill`.
#[derive(Clone)]
pub struct Engine {
    events: mpsc::UnboundedSender<LoopEvent>,
    stop: CancellationToken,
    done: watch::Receiver<Option<WorkerResult>>,
    // Spawned tasks keep the queue open, so the loop cannot notice on its
    // own that every handle is gone.
    _last_handle: Arc<DropGuard>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("stopping", &self.stop.is_cancelled())
            .field("finished", &self.done.borrow().is_some())
            .finish()
    }
}

impl Engine {
    /// Spawn a new engine on the current tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        let (events, stop, done) = runtime::spawn(config);
        let last_handle = Arc::new(stop.clone().drop_guard());
        Self {
            events,
            stop,
            done,
            _last_handle: last_handle,
        }
    }

    /// Install `manifold` under `name`. It starts as soon as its inputs are
    /// started.
    pub async fn install(&self, name: impl Into<String>, manifold: Manifold) -> Result<()> {
        let name = name.into();
        self.request(|reply| Request::Install {
            name,
            manifold,
            reply,
        })
        .await?
    }

    /// Install a batch of manifolds atomically, in dependency order.
    pub async fn install_all(&self, manifolds: Manifolds) -> Result<()> {
        self.request(|reply| Request::InstallAll { manifolds, reply })
            .await?
    }

    /// Stop and remove the manifold installed under `name`. Its dependents
    /// are bounced and wait until it comes back.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| Request::Uninstall { name, reply })
            .await?
    }

    /// Restart `name` and everything downstream of it.
    pub async fn bounce(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| Request::Bounce { name, reply }).await?
    }

    /// Snapshot of every node's state.
    pub async fn report(&self) -> Result<Report> {
        self.request(|reply| Request::Report { reply }).await?
    }

    /// Shut down and wait for the outcome.
    pub async fn stop(&self) -> WorkerResult {
        self.kill();
        self.wait().await
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(LoopEvent::Request(make(reply)))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

impl Worker for Engine {
    fn kill(&self) {
        self.stop.cancel();
    }

    fn wait(&self) -> BoxFuture<'_, WorkerResult> {
        let mut done = self.done.clone();
        Box::pin(async move { wait_outcome(&mut done).await })
    }
}
