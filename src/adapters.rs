// src/adapters.rs

//! Ready-made manifold shapes for common cases.

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::manifold::{Manifold, ManifoldBuilder};
use crate::worker::{BoxFuture, TaskWorker, Worker, WorkerResult};

/// A manifold with exactly one input whose start function only needs that
/// input's value.
///
/// The returned builder already has its input and start function set; add
/// an output or filter before building if needed.
pub fn input_manifold<T, F, Fut, W>(input: impl Into<String>, start: F) -> ManifoldBuilder
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<W>> + Send + 'static,
    W: Worker,
{
    let input = input.into();
    let start = Arc::new(start);

    Manifold::builder()
        .input(input.clone())
        .start(move |context: Context| {
            let input = input.clone();
            let start = Arc::clone(&start);
            async move {
                let value: T = context.get(&input)?;
                start(value, context).await
            }
        })
}

/// A worker that holds a value and runs until killed.
pub struct ValueWorker<T> {
    value: T,
    task: TaskWorker,
}

impl<T: Send + Sync + 'static> ValueWorker<T> {
    pub fn new(value: T, context: &Context) -> Self {
        let task = TaskWorker::spawn_with_token(context.token(), |token| async move {
            token.cancelled().await;
            Ok(())
        });
        Self { value, task }
    }

    /// Publish `value` while `task` runs; the worker ends when the task does.
    pub fn with_task(value: T, task: TaskWorker) -> Self {
        Self { value, task }
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T: Send + Sync + 'static> Worker for ValueWorker<T> {
    fn kill(&self) {
        self.task.kill();
    }

    fn wait(&self) -> BoxFuture<'_, WorkerResult> {
        self.task.wait()
    }
}

/// A manifold with no inputs that publishes `value` for as long as it runs.
pub fn value_manifold<T>(value: T) -> ManifoldBuilder
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Manifold::builder()
        .start(move |context: Context| {
            let value = value.clone();
            async move { Ok(ValueWorker::new(value, &context)) }
        })
        .output_eq(|worker: &ValueWorker<T>| worker.value().clone())
}
