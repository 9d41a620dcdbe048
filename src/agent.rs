// src/agent.rs

//! Turns a validated config into a runnable set of manifolds.
//!
//! Every kind publishes an `i64`:
//! - `constant` publishes its configured value until stopped.
//! - `sum` publishes the sum of its inputs.
//! - `flaky` publishes its value, then fails after `fail_after`.
//! - `fatal` refuses to start with an error its filter marks fatal.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::adapters::ValueWorker;
use crate::config::{AgentKind, AgentSpec, ConfigFile};
use crate::context::Context;
use crate::errors::Result;
use crate::manifold::{ErrorClass, Manifold, Manifolds};
use crate::worker::TaskWorker;

/// Failure a `fatal` agent starts with.
#[derive(Debug, Error)]
#[error("agent '{0}' cannot run")]
pub struct AgentFatal(pub String);

/// Build one manifold per config entry.
pub fn build_agent(config: &ConfigFile) -> Result<Manifolds> {
    config
        .manifolds
        .iter()
        .map(|(name, spec)| Ok((name.clone(), build_manifold(name, spec)?)))
        .collect()
}

fn published(worker: &ValueWorker<i64>) -> i64 {
    *worker.value()
}

fn build_manifold(name: &str, spec: &AgentSpec) -> Result<Manifold> {
    let builder = Manifold::builder().inputs(spec.inputs.iter().cloned());

    match spec.kind.clone() {
        AgentKind::Constant { value } => builder
            .start(move |context: Context| async move { Ok(ValueWorker::new(value, &context)) })
            .output_eq(published)
            .build(),
        AgentKind::Sum => {
            let inputs = spec.inputs.clone();
            builder
                .start(move |context: Context| {
                    let inputs = inputs.clone();
                    async move {
                        let mut total: i64 = 0;
                        for input in inputs.iter() {
                            let value: i64 = context.get(input)?;
                            total = total.saturating_add(value);
                        }
                        debug!(node = %context.name(), total, "sum computed");
                        Ok::<_, anyhow::Error>(ValueWorker::new(total, &context))
                    }
                })
                .output_eq(published)
                .build()
        }
        AgentKind::Flaky { value, fail_after } => {
            let agent = name.to_string();
            builder
                .start(move |context: Context| {
                    let agent = agent.clone();
                    async move { Ok(flaky_worker(agent, value, fail_after, &context)) }
                })
                .output_eq(published)
                .build()
        }
        AgentKind::Fatal => {
            let agent = name.to_string();
            builder
                .start(move |_context: Context| {
                    let agent = agent.clone();
                    async move {
                        Err::<ValueWorker<i64>, _>(
                            anyhow::Error::new(AgentFatal(agent)).context("start refused"),
                        )
                    }
                })
                .filter(|err| {
                    if err.is::<AgentFatal>() {
                        ErrorClass::Fatal
                    } else {
                        ErrorClass::Restart
                    }
                })
                .build()
        }
    }
}

fn flaky_worker(agent: String, value: i64, fail_after: Duration, context: &Context) -> ValueWorker<i64> {
    let task = TaskWorker::spawn_with_token(context.token(), move |token| async move {
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            _ = tokio::time::sleep(fail_after) => {
                Err(anyhow::anyhow!("agent '{agent}' gave up after {fail_after:?}"))
            }
        }
    });
    ValueWorker::with_task(value, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfigFile;

    fn config(text: &str) -> ConfigFile {
        let raw: RawConfigFile = toml::from_str(text).unwrap();
        ConfigFile::try_from(raw).unwrap()
    }

    #[test]
    fn builds_one_manifold_per_entry() {
        let cfg = config(
            r#"
            [manifold.a]
            kind = "constant"
            value = 1

            [manifold.total]
            kind = "sum"
            inputs = ["a"]
            "#,
        );

        let manifolds = build_agent(&cfg).unwrap();
        assert_eq!(manifolds.len(), 2);
        assert_eq!(manifolds["total"].inputs(), ["a"]);
        assert!(manifolds["a"].has_output());
    }

    #[test]
    fn fatal_errors_are_found_through_context() {
        let err = crate::worker::WorkerError::from(
            anyhow::Error::new(AgentFatal("x".into())).context("start refused"),
        );
        assert!(err.is::<AgentFatal>());
    }
}
