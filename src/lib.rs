// src/lib.rs

//! A dependency engine for long-running workers.
//!
//! Workers are described by [`Manifold`]s that name their inputs. The
//! [`Engine`] starts a manifold once every input is running, hands it the
//! inputs' published outputs through a [`Context`], restarts it with backoff
//! when it fails, and stops it again (dependents first) whenever an input
//! goes away or changes.

pub mod adapters;
pub mod agent;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod manifold;
pub mod node;
pub mod worker;

use std::path::PathBuf;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub use crate::backoff::{BackoffPolicy, JitterPolicy};
pub use crate::config::EngineConfig;
pub use crate::context::{Context, OutputNotifier, OutputSnapshot};
pub use crate::engine::Engine;
pub use crate::errors::EngineError;
pub use crate::manifold::{ErrorClass, Manifold, ManifoldBuilder, Manifolds, Output};
pub use crate::node::{NodeState, NodeStatus, Report};
pub use crate::worker::{Bounce, BoxFuture, TaskWorker, Uninstall, Worker, WorkerError, WorkerResult};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_and_validate};

/// High-level entry point used by `main.rs`.
///
/// Loads the config, then either prints the install plan (`--dry-run`) or
/// runs the configured agent until Ctrl-C or a fatal error.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let manifolds = agent::build_agent(&cfg)?;
    let engine = Engine::new(cfg.engine);
    engine.install_all(manifolds).await?;
    info!(manifolds = cfg.manifolds.len(), "agent installed");

    // Ctrl-C -> graceful shutdown.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; stopping engine");
            engine.kill();
        });
    }

    // Periodic report until the engine is done.
    {
        let engine = engine.clone();
        let every = args.report_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.report().await {
                    Ok(report) => log_report(&report),
                    Err(_) => break,
                }
            }
        });
    }

    engine.wait().await?;
    Ok(())
}

fn log_report(report: &Report) {
    for (name, status) in report.iter() {
        info!(
            node = %name,
            state = %status.state,
            starts = status.starts,
            failures = status.failures,
            missing = ?status.missing_inputs,
            retry_in_ms = status.retry_in.map(|d| d.as_millis() as u64),
            last_error = status.last_error.as_ref().map(|e| e.to_string()),
            "node status"
        );
    }
}

/// Print manifolds in install order with their inputs and kinds.
fn print_dry_run(cfg: &ConfigFile) {
    println!("depengine dry-run");
    println!("  engine.strict_inputs = {}", cfg.engine.strict_inputs);
    println!("  engine.restart_delay = {:?}", cfg.engine.restart_delay);
    println!(
        "  engine.backoff = first {:?}, max {:?}, factor {}, jitter {:?}",
        cfg.engine.backoff.first,
        cfg.engine.backoff.max,
        cfg.engine.backoff.factor,
        cfg.engine.backoff.jitter
    );
    println!();

    println!("manifolds ({}), in install order:", cfg.order.len());
    for name in cfg.order.iter() {
        let Some(spec) = cfg.manifolds.get(name) else {
            continue;
        };
        println!("  - {name}: {:?}", spec.kind);
        if !spec.inputs.is_empty() {
            println!("      inputs: {:?}", spec.inputs);
        }
    }
}
