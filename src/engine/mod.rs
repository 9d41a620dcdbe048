// src/engine/mod.rs

//! The dependency engine.
//!
//! - [`core`] holds the synchronous decision core: node table, state
//!   machine, bounce propagation, backoff. It consumes [`CoreEvent`]s plus an
//!   explicit `now` and answers with [`CoreCommand`]s.
//! - [`event_handlers`] contains the per-event transitions used by the core.
//! - [`runtime`] is the async shell: a single task that serialises every
//!   event through the core, runs start functions and watches workers.
//! - [`handle`] exposes [`Engine`], the public handle, which itself
//!   satisfies the [`crate::Worker`] contract.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::errors::Result;
use crate::manifold::{Manifold, Manifolds};
use crate::node::Report;
use crate::worker::{Worker, WorkerResult};

pub mod core;
pub mod event_handlers;
pub mod handle;
pub mod runtime;

pub use self::core::{CoreCommand, CoreStep, EngineCore};
pub use self::handle::Engine;

/// Things that happen to the engine, fed into [`EngineCore::step`].
pub enum CoreEvent {
    /// A start function returned.
    StartReturned {
        name: String,
        generation: u64,
        result: anyhow::Result<Arc<dyn Worker>>,
    },
    /// A started worker terminated.
    WorkerStopped {
        name: String,
        generation: u64,
        result: WorkerResult,
    },
    /// A running worker says its output may have changed.
    OutputChanged { name: String, generation: u64 },
    /// The earliest pending retry time has passed.
    Tick,
    /// Shut everything down.
    Stop,
}

impl fmt::Debug for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::StartReturned {
                name,
                generation,
                result,
            } => f
                .debug_struct("StartReturned")
                .field("name", name)
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            CoreEvent::WorkerStopped {
                name,
                generation,
                result,
            } => f
                .debug_struct("WorkerStopped")
                .field("name", name)
                .field("generation", generation)
                .field("result", result)
                .finish(),
            CoreEvent::OutputChanged { name, generation } => f
                .debug_struct("OutputChanged")
                .field("name", name)
                .field("generation", generation)
                .finish(),
            CoreEvent::Tick => f.write_str("Tick"),
            CoreEvent::Stop => f.write_str("Stop"),
        }
    }
}

/// Calls made through [`Engine`] that expect an answer.
pub(crate) enum Request {
    Install {
        name: String,
        manifold: Manifold,
        reply: oneshot::Sender<Result<()>>,
    },
    InstallAll {
        manifolds: Manifolds,
        reply: oneshot::Sender<Result<()>>,
    },
    Uninstall {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Bounce {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Report {
        reply: oneshot::Sender<Result<Report>>,
    },
}

/// Everything the decision loop's queue carries.
pub(crate) enum LoopEvent {
    Request(Request),
    Core(CoreEvent),
}
