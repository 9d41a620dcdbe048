// src/worker.rs

//! The worker contract every supervised task satisfies.
//!
//! A [`Worker`] can be asked to stop ([`Worker::kill`]) and can be awaited
//! until it has terminated ([`Worker::wait`]). Nothing else is assumed, which
//! is what lets the engine supervise API connections, watchers and whole
//! nested engines the same way.
//!
//! [`TaskWorker`] is the stock implementation: a tokio task driven by a
//! [`CancellationToken`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Terminal outcome of a worker.
pub type WorkerResult = std::result::Result<(), WorkerError>;

/// Lets output functions recover the concrete worker type behind a
/// `dyn Worker`. Implemented for every `'static` type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A supervised, independently stoppable unit of work.
pub trait Worker: AsAny + Send + Sync + 'static {
    /// Ask the worker to stop. Idempotent; returns immediately.
    fn kill(&self);

    /// Resolve once the worker has terminated.
    ///
    /// May be awaited repeatedly and from several tasks at once; every
    /// caller observes the same outcome.
    fn wait(&self) -> BoxFuture<'_, WorkerResult>;
}

/// Downcast a worker to its concrete type.
pub fn downcast_worker<W: Worker>(worker: &dyn Worker) -> Option<&W> {
    AsAny::as_any(worker).downcast_ref::<W>()
}

/// A worker's completion error.
///
/// Shared behind an `Arc` so that one failure can be handed to every waiter,
/// recorded in the node table and still be downcast by error filters.
#[derive(Clone)]
pub struct WorkerError(Arc<anyhow::Error>);

impl WorkerError {
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Returned by a worker that wants to be restarted straight away.
///
/// The engine does not count this as a failure and applies no backoff.
#[derive(Debug, Clone, Copy, Error)]
#[error("restart requested by worker")]
pub struct Bounce;

/// Returned by a worker whose job is done for good: the engine uninstalls
/// its manifold instead of restarting it.
#[derive(Debug, Clone, Copy, Error)]
#[error("uninstall requested by worker")]
pub struct Uninstall;

/// A worker backed by a spawned tokio task.
///
/// The task receives a [`CancellationToken`]; [`Worker::kill`] cancels it and
/// the task is expected to return promptly afterwards. The task is never
/// aborted.
pub struct TaskWorker {
    token: CancellationToken,
    done: watch::Receiver<Option<WorkerResult>>,
}

impl TaskWorker {
    /// Spawn `f` on the current tokio runtime with a fresh token.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::spawn_with_token(CancellationToken::new(), f)
    }

    /// Spawn `f` with the given token, typically [`crate::Context::token`] so
    /// the worker also stops when the engine withdraws its dependencies.
    pub fn spawn_with_token<F, Fut>(token: CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(None);
        let handle = tokio::spawn(f(token.clone()));

        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(WorkerError::from(err)),
                Err(join_err) => Err(WorkerError::msg(format!(
                    "worker task terminated abnormally: {join_err}"
                ))),
            };
            debug!(ok = outcome.is_ok(), "task worker finished");
            let _ = done_tx.send(Some(outcome));
        });

        Self {
            token,
            done: done_rx,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the task has already terminated.
    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

impl fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWorker")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Worker for TaskWorker {
    fn kill(&self) {
        self.token.cancel();
    }

    fn wait(&self) -> BoxFuture<'_, WorkerResult> {
        let mut done = self.done.clone();
        Box::pin(async move { wait_outcome(&mut done).await })
    }
}

/// Wait until a published outcome appears in `done`.
pub(crate) async fn wait_outcome(done: &mut watch::Receiver<Option<WorkerResult>>) -> WorkerResult {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(WorkerError::msg(
            "worker went away without reporting an outcome",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kill_cancels_the_token_and_wait_returns_outcome() {
        let worker = TaskWorker::spawn(|token| async move {
            token.cancelled().await;
            Ok(())
        });

        assert!(!worker.is_finished());
        worker.kill();
        worker.kill();
        assert!(worker.wait().await.is_ok());
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_error() {
        let worker = TaskWorker::spawn(|_| async { Err(anyhow::anyhow!("boom")) });

        let first = worker.wait().await.unwrap_err();
        let second = worker.wait().await.unwrap_err();
        assert_eq!(first.to_string(), "boom");
        assert_eq!(second.to_string(), "boom");
    }

    #[tokio::test]
    async fn sentinel_errors_survive_downcasting() {
        let worker = TaskWorker::spawn(|_| async { Err(anyhow::Error::new(Bounce)) });
        let err = worker.wait().await.unwrap_err();
        assert!(err.is::<Bounce>());
        assert!(!err.is::<Uninstall>());
    }

    #[tokio::test]
    async fn panicking_task_reports_an_error() {
        let worker = TaskWorker::spawn(|_| async {
            if true {
                panic!("worker blew up");
            }
            Ok(())
        });
        let err = worker.wait().await.unwrap_err();
        assert!(err.to_string().contains("terminated abnormally"));
    }

    #[tokio::test]
    async fn downcast_worker_recovers_concrete_type() {
        let worker: Arc<dyn Worker> = Arc::new(TaskWorker::spawn(|_| async { Ok(()) }));
        assert!(downcast_worker::<TaskWorker>(worker.as_ref()).is_some());
    }
}
