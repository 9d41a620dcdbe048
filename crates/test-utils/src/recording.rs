//! Workers that record what happens to them and can be steered from tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use depengine::{BoxFuture, Context, OutputNotifier, TaskWorker, Worker, WorkerResult};
use tokio::sync::mpsc;

/// One successful start, with the input values the start function saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRecord {
    pub name: String,
    pub generation: u64,
    pub inputs: BTreeMap<String, i64>,
}

/// Shared log of starts, stops and the live workers behind them.
#[derive(Clone, Default)]
pub struct Recorder {
    starts: Arc<Mutex<Vec<StartRecord>>>,
    stops: Arc<Mutex<Vec<String>>>,
    missing: Arc<AtomicUsize>,
    controls: Arc<Mutex<BTreeMap<String, WorkerControl>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    /// Starts of `name`, oldest first.
    pub fn starts_of(&self, name: &str) -> Vec<StartRecord> {
        self.starts()
            .into_iter()
            .filter(|record| record.name == name)
            .collect()
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.starts_of(name).len()
    }

    /// Names of workers that observed their stop, in order.
    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    /// How many start attempts found an input missing.
    pub fn missing_observations(&self) -> usize {
        self.missing.load(Ordering::SeqCst)
    }

    /// Control handle of the most recently started worker for `name`.
    pub fn control(&self, name: &str) -> Option<WorkerControl> {
        self.controls.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn record_missing(&self) {
        self.missing.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_start(&self, record: StartRecord, control: WorkerControl) {
        self.controls
            .lock()
            .unwrap()
            .insert(record.name.clone(), control);
        self.starts.lock().unwrap().push(record);
    }

    pub(crate) fn record_stop(&self, name: &str) {
        self.stops.lock().unwrap().push(name.to_string());
    }
}

/// Test-side handle on one running [`RecordingWorker`].
#[derive(Clone)]
pub struct WorkerControl {
    value: Arc<AtomicI64>,
    exit: mpsc::UnboundedSender<anyhow::Result<()>>,
    notifier: OutputNotifier,
}

impl WorkerControl {
    /// Make the worker terminate with `result`.
    pub fn exit(&self, result: anyhow::Result<()>) {
        let _ = self.exit.send(result);
    }

    /// Change the published value and tell the engine.
    pub fn set_value(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
        self.notifier.notify();
    }
}

/// A worker publishing an `i64` that runs until killed or told to exit.
pub struct RecordingWorker {
    value: Arc<AtomicI64>,
    task: TaskWorker,
}

impl RecordingWorker {
    pub fn start(
        context: &Context,
        recorder: &Recorder,
        value: i64,
        inputs: BTreeMap<String, i64>,
    ) -> Self {
        let name = context.name().to_string();
        let value = Arc::new(AtomicI64::new(value));
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

        let stop_recorder = recorder.clone();
        let stop_name = name.clone();
        let task = TaskWorker::spawn_with_token(context.token(), move |token| async move {
            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                Some(result) = exit_rx.recv() => result,
            };
            stop_recorder.record_stop(&stop_name);
            result
        });

        recorder.record_start(
            StartRecord {
                name,
                generation: context.generation(),
                inputs,
            },
            WorkerControl {
                value: Arc::clone(&value),
                exit: exit_tx,
                notifier: context.notifier(),
            },
        );

        Self { value, task }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl Worker for RecordingWorker {
    fn kill(&self) {
        self.task.kill();
    }

    fn wait(&self) -> BoxFuture<'_, WorkerResult> {
        self.task.wait()
    }
}
