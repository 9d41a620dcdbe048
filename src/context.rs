// src/context.rs

//! What a start function sees of the engine.
//!
//! A [`Context`] gives typed access to the outputs of the manifold's
//! declared inputs, plus the cancellation signal for this start attempt.
//! Lookups go through an [`OutputSnapshot`], never the engine's node table,
//! so a start function blocked on a dependency never stalls the decision
//! loop.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{CoreEvent, LoopEvent};
use crate::errors::{EngineError, Result};
use crate::manifold::Output;

type Published = HashMap<String, Option<Output>>;

/// Outputs of every currently started node.
///
/// Writers (only the decision loop) replace the whole map; readers clone an
/// `Arc` under a short read lock and then work lock-free.
#[derive(Clone, Default)]
pub struct OutputSnapshot {
    inner: Arc<RwLock<Arc<Published>>>,
}

impl OutputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current set of started nodes and their outputs.
    pub fn current(&self) -> Arc<Published> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current().contains_key(name)
    }

    /// Number of nodes currently published.
    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn publish(&self, name: &str, output: Option<Output>) {
        self.update(|map| {
            map.insert(name.to_string(), output);
        });
    }

    pub(crate) fn withdraw(&self, name: &str) {
        self.update(|map| {
            map.remove(name);
        });
    }

    fn update(&self, change: impl FnOnce(&mut Published)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Published::clone(&guard);
        change(&mut next);
        *guard = Arc::new(next);
    }
}

impl fmt::Debug for OutputSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current();
        let mut names: Vec<&String> = current.keys().collect();
        names.sort();
        f.debug_struct("OutputSnapshot")
            .field("started", &names)
            .finish()
    }
}

/// Per-attempt view handed to a manifold's start function.
#[derive(Clone)]
pub struct Context {
    name: String,
    generation: u64,
    inputs: Arc<[String]>,
    snapshot: OutputSnapshot,
    token: CancellationToken,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl Context {
    pub(crate) fn new(
        name: String,
        generation: u64,
        inputs: &[String],
        snapshot: OutputSnapshot,
        token: CancellationToken,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            name,
            generation,
            inputs: inputs.into(),
            snapshot,
            token,
            events,
        }
    }

    /// Name of the manifold being started.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start attempt number for this manifold, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fetch the output published by input `input`.
    ///
    /// Fails with [`EngineError::Missing`] if the input is not started right
    /// now; a start function should return that error as-is and let the
    /// engine start it again later.
    pub fn get<T>(&self, input: &str) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.inputs.iter().any(|declared| declared == input) {
            return Err(EngineError::UndeclaredInput(input.to_string()));
        }

        let current = self.snapshot.current();
        let published = current
            .get(input)
            .ok_or_else(|| EngineError::Missing(input.to_string()))?;

        let output = published.as_ref().ok_or_else(|| EngineError::TypeMismatch {
            name: input.to_string(),
            expected: type_name::<T>(),
            found: "no output",
        })?;

        output.get::<T>().ok_or_else(|| EngineError::TypeMismatch {
            name: input.to_string(),
            expected: type_name::<T>(),
            found: output.type_name(),
        })
    }

    /// Whether declared input `input` is started, regardless of what it
    /// publishes.
    pub fn is_available(&self, input: &str) -> bool {
        self.inputs.iter().any(|declared| declared == input) && self.snapshot.contains(input)
    }

    /// A token cancelled when this attempt must stop. Hand it to the worker.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the engine wants this attempt to stop: an input went
    /// away, the manifold was uninstalled or bounced, or the engine is
    /// shutting down.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A handle the started worker can keep to tell the engine its published
    /// output may have changed.
    pub fn notifier(&self) -> OutputNotifier {
        OutputNotifier {
            name: self.name.clone(),
            generation: self.generation,
            events: self.events.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("inputs", &self.inputs)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Lets a running worker ask the engine to re-read its output.
#[derive(Clone, Debug)]
pub struct OutputNotifier {
    name: String,
    generation: u64,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl OutputNotifier {
    /// Post an output-changed notice. Never blocks. Returns `false` once the
    /// engine has gone away.
    pub fn notify(&self) -> bool {
        self.events
            .send(LoopEvent::Core(CoreEvent::OutputChanged {
                name: self.name.clone(),
                generation: self.generation,
            }))
            .is_ok()
    }
}
