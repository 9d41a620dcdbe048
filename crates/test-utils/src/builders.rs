//! Manifold and config builders shared by the integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use depengine::{
    BackoffPolicy, Context, EngineConfig, EngineError, JitterPolicy, Manifold, ManifoldBuilder,
};

use crate::recording::{Recorder, RecordingWorker};

/// Engine tuning with short, deterministic delays.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(2),
            factor: 2.0,
            jitter: JitterPolicy::None,
        },
        restart_delay: Duration::ZERO,
        strict_inputs: true,
    }
}

/// Shared start counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builder for manifolds backed by [`RecordingWorker`].
///
/// The worker publishes `base` plus the sum of its inputs' `i64` outputs,
/// and records the input values it was started with.
pub struct RecordingManifold {
    inputs: Vec<String>,
    base: i64,
    recorder: Recorder,
    value_equality: bool,
}

impl RecordingManifold {
    pub fn new(recorder: &Recorder) -> Self {
        Self {
            inputs: Vec::new(),
            base: 0,
            recorder: recorder.clone(),
            value_equality: true,
        }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.inputs.push(name.to_string());
        self
    }

    pub fn inputs(mut self, names: &[&str]) -> Self {
        self.inputs.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn base(mut self, base: i64) -> Self {
        self.base = base;
        self
    }

    /// Compare published values by worker identity instead of `PartialEq`.
    pub fn identity_output(mut self) -> Self {
        self.value_equality = false;
        self
    }

    pub fn builder(self) -> ManifoldBuilder {
        let Self {
            inputs,
            base,
            recorder,
            value_equality,
        } = self;

        let declared = inputs.clone();
        let builder = Manifold::builder()
            .inputs(declared)
            .start(move |context: Context| {
                let inputs = inputs.clone();
                let recorder = recorder.clone();
                async move {
                    let mut seen = BTreeMap::new();
                    for input in inputs.iter() {
                        match context.get::<i64>(input) {
                            Ok(value) => {
                                seen.insert(input.clone(), value);
                            }
                            Err(err) => {
                                if matches!(err, EngineError::Missing(_)) {
                                    recorder.record_missing();
                                }
                                return Err(anyhow::Error::from(err));
                            }
                        }
                    }
                    let value = base + seen.values().sum::<i64>();
                    Ok::<_, anyhow::Error>(RecordingWorker::start(&context, &recorder, value, seen))
                }
            });

        if value_equality {
            builder.output_eq(|worker: &RecordingWorker| worker.value())
        } else {
            builder.output(|worker: &RecordingWorker| worker.value())
        }
    }

    pub fn build(self) -> Manifold {
        self.builder().build().expect("recording manifold has a start function")
    }
}

/// A manifold whose start function always fails with a transient error.
pub fn always_failing(inputs: &[&str], attempts: &Counter) -> Manifold {
    let attempts = attempts.clone();
    Manifold::builder()
        .inputs(inputs.iter().copied())
        .start(move |_context: Context| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.bump();
                Err::<RecordingWorker, _>(anyhow::anyhow!("attempt {n} failed"))
            }
        })
        .build()
        .expect("failing manifold has a start function")
}
