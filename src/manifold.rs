// src/manifold.rs

//! Declarative description of one node in the dependency graph.
//!
//! A [`Manifold`] names the inputs a worker needs, knows how to start that
//! worker from a [`Context`], and optionally how to extract a value from the
//! running worker for dependents to consume. It is immutable once built;
//! the engine owns all mutable state about it.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::errors::{EngineError, Result};
use crate::worker::{BoxFuture, Worker, WorkerError, downcast_worker};

/// Builds a worker once every input resolves.
pub type StartFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>> + Send + Sync>;

/// Extracts the published value from a running worker.
pub type OutputFn = Arc<dyn Fn(&dyn Worker) -> Option<Output> + Send + Sync>;

/// Classifies a worker's completion error.
pub type FilterFn = Arc<dyn Fn(&WorkerError) -> ErrorClass + Send + Sync>;

/// A batch of named manifolds, as accepted by [`crate::Engine::install_all`].
pub type Manifolds = BTreeMap<String, Manifold>;

/// How the engine treats a worker's completion error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Record it, back off, restart the node.
    Restart,
    /// Treat as a clean exit.
    Ignore,
    /// Stop the whole engine and report this error from it.
    Fatal,
}

#[derive(Clone, Copy)]
enum Identity {
    /// Equal only when produced by the same worker instance.
    Worker(usize),
    /// Equal when the values compare equal.
    Value(fn(&dyn Any, &dyn Any) -> bool),
}

/// A value published by a started node.
#[derive(Clone)]
pub struct Output {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    identity: Identity,
}

impl Output {
    fn by_worker<T: Send + Sync + 'static>(value: T, worker: &dyn Worker) -> Self {
        let addr = worker as *const dyn Worker as *const () as usize;
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            identity: Identity::Worker(addr),
        }
    }

    fn by_value<T: PartialEq + Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
            identity: Identity::Value(values_equal::<T>),
        }
    }

    /// Clone the value out if it is a `T`.
    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        (*self.value).downcast_ref::<T>().cloned()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether dependents would observe any difference between `self` and
    /// `other`.
    pub fn same_as(&self, other: &Output) -> bool {
        match (self.identity, other.identity) {
            (Identity::Worker(a), Identity::Worker(b)) => a == b,
            (Identity::Value(eq), Identity::Value(_)) => eq(&*self.value, &*other.value),
            _ => false,
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

fn values_equal<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Compare two optional outputs the way dependents would.
pub(crate) fn outputs_match(old: Option<&Output>, new: Option<&Output>) -> bool {
    match (old, new) {
        (None, None) => true,
        (Some(old), Some(new)) => old.same_as(new),
        _ => false,
    }
}

/// Immutable descriptor of a supervised unit of work.
#[derive(Clone)]
pub struct Manifold {
    inputs: Vec<String>,
    start: StartFn,
    output: Option<OutputFn>,
    filter: Option<FilterFn>,
}

impl Manifold {
    pub fn builder() -> ManifoldBuilder {
        ManifoldBuilder::default()
    }

    /// Declared inputs, in declaration order, without duplicates.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub(crate) fn start(&self, context: Context) -> BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>> {
        (self.start)(context)
    }

    pub(crate) fn output_of(&self, worker: &dyn Worker) -> Option<Output> {
        self.output.as_ref().and_then(|output| output(worker))
    }

    pub(crate) fn classify(&self, err: &WorkerError) -> ErrorClass {
        match &self.filter {
            Some(filter) => filter(err),
            None => ErrorClass::Restart,
        }
    }
}

impl fmt::Debug for Manifold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifold")
            .field("inputs", &self.inputs)
            .field("output", &self.output.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Builder for [`Manifold`].
#[derive(Default)]
pub struct ManifoldBuilder {
    inputs: Vec<String>,
    start: Option<StartFn>,
    output: Option<OutputFn>,
    filter: Option<FilterFn>,
}

impl ManifoldBuilder {
    pub fn input(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.inputs.contains(&name) {
            self.inputs.push(name);
        }
        self
    }

    pub fn inputs<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, |builder, name| builder.input(name))
    }

    /// Set the factory the engine calls once all inputs are started.
    ///
    /// The returned future may take as long as it needs, but must resolve
    /// promptly once [`Context::cancelled`] fires.
    pub fn start<F, Fut, W>(mut self, start: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<W>> + Send + 'static,
        W: Worker,
    {
        self.start = Some(Arc::new(move |context| {
            let fut = start(context);
            Box::pin(async move {
                let worker = fut.await?;
                Ok::<_, anyhow::Error>(Arc::new(worker) as Arc<dyn Worker>)
            }) as BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>>
        }));
        self
    }

    /// Publish a value extracted from the running worker `W`.
    ///
    /// Values from the same worker instance are considered unchanged, so a
    /// refresh never bounces dependents.
    pub fn output<W, T, F>(mut self, extract: F) -> Self
    where
        W: Worker,
        T: Send + Sync + 'static,
        F: Fn(&W) -> T + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(move |worker: &dyn Worker| {
            let concrete = downcast_worker::<W>(worker)?;
            Some(Output::by_worker(extract(concrete), worker))
        }));
        self
    }

    /// Like [`ManifoldBuilder::output`], but compares published values with
    /// `PartialEq`: a refresh bounces dependents only if the value changed.
    pub fn output_eq<W, T, F>(mut self, extract: F) -> Self
    where
        W: Worker,
        T: PartialEq + Send + Sync + 'static,
        F: Fn(&W) -> T + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(move |worker: &dyn Worker| {
            let concrete = downcast_worker::<W>(worker)?;
            Some(Output::by_value(extract(concrete)))
        }));
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&WorkerError) -> ErrorClass + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> Result<Manifold> {
        let start = self.start.ok_or_else(|| {
            EngineError::Config("manifold has no start function".to_string())
        })?;

        Ok(Manifold {
            inputs: self.inputs,
            start,
            output: self.output,
            filter: self.filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TaskWorker;

    #[test]
    fn build_without_start_is_a_config_error() {
        let err = Manifold::builder().input("a").build().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn inputs_are_deduplicated_in_order() {
        let manifold = Manifold::builder()
            .inputs(["b", "a", "b"])
            .input("c")
            .start(|_ctx| async { Ok(TaskWorker::spawn(|_| async { Ok(()) })) })
            .build()
            .unwrap();
        assert_eq!(manifold.inputs(), ["b", "a", "c"]);
    }

    #[test]
    fn value_outputs_compare_by_value() {
        let one = Output::by_value(1_i64);
        let also_one = Output::by_value(1_i64);
        let two = Output::by_value(2_i64);

        assert!(one.same_as(&also_one));
        assert!(!one.same_as(&two));
        assert_eq!(two.get::<i64>(), Some(2));
        assert_eq!(two.get::<String>(), None);
    }

    #[test]
    fn default_filter_restarts() {
        let manifold = Manifold::builder()
            .start(|_ctx| async { Ok(TaskWorker::spawn(|_| async { Ok(()) })) })
            .build()
            .unwrap();
        let err = WorkerError::msg("boom");
        assert_eq!(manifold.classify(&err), ErrorClass::Restart);
    }

    #[test]
    fn missing_outputs_match_only_each_other() {
        let value = Output::by_value("x".to_string());
        assert!(outputs_match(None, None));
        assert!(!outputs_match(Some(&value), None));
        assert!(outputs_match(Some(&value), Some(&value.clone())));
    }
}
