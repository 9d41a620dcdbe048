// src/errors.rs

//! Crate-wide error type.
//!
//! [`EngineError`] covers everything the engine reports synchronously:
//! dependency lookups from inside start functions, install-time wiring
//! checks, and configuration loading. Errors produced by workers
//! themselves travel as [`crate::worker::WorkerError`] instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The named dependency is not currently started.
    #[error("dependency '{0}' not available")]
    Missing(String),

    /// The named dependency publishes something other than the requested type.
    #[error("dependency '{name}' publishes {found}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A start function asked for a name its manifold never declared.
    #[error("'{0}' is not a declared input of this manifold")]
    UndeclaredInput(String),

    #[error("manifold '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("manifold '{name}' has unknown input '{input}'")]
    UnknownInput { name: String, input: String },

    #[error("manifold '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("cycle detected in dependency graph involving '{0}'")]
    Cycle(String),

    #[error("manifold '{0}' is not installed")]
    NotInstalled(String),

    /// The engine's decision loop has exited.
    #[error("engine is stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    /// Whether this error means a dependency was merely unavailable, so the
    /// caller should give up quietly and wait to be restarted.
    pub fn is_missing(&self) -> bool {
        matches!(self, EngineError::Missing(_))
    }

    /// Whether this error reflects broken manifold wiring that retrying
    /// cannot fix.
    pub fn is_wiring(&self) -> bool {
        matches!(
            self,
            EngineError::TypeMismatch { .. } | EngineError::UndeclaredInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
