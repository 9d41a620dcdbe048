// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::model::{
    AgentKind, AgentSpec, BackoffSection, ConfigFile, EngineConfig, EngineSection,
    ManifoldConfig, ManifoldKind, RawConfigFile, parse_duration,
};
use crate::errors::{EngineError, Result};
use crate::graph::order_batch;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = EngineError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_manifolds(&raw)?;
        let engine = engine_config(&raw.engine)?;
        validate_inputs(&raw)?;
        let order = validate_dag(&raw)?;

        let mut manifolds = BTreeMap::new();
        for (name, manifold) in raw.manifold.iter() {
            manifolds.insert(name.clone(), agent_spec(name, manifold)?);
        }

        Ok(ConfigFile::new_unchecked(engine, manifolds, order))
    }
}

fn ensure_has_manifolds(cfg: &RawConfigFile) -> Result<()> {
    if cfg.manifold.is_empty() {
        return Err(EngineError::Config(
            "config must contain at least one [manifold.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn duration_field(field: &str, value: Option<&String>, default: Duration) -> Result<Duration> {
    match value {
        Some(text) => parse_duration(text)
            .map_err(|msg| EngineError::Config(format!("{field}: {msg}"))),
        None => Ok(default),
    }
}

fn engine_config(section: &EngineSection) -> Result<EngineConfig> {
    let defaults = EngineConfig::default();

    Ok(EngineConfig {
        backoff: backoff_policy(&section.backoff)?,
        restart_delay: duration_field(
            "[engine].restart_delay",
            section.restart_delay.as_ref(),
            defaults.restart_delay,
        )?,
        strict_inputs: section.strict_inputs.unwrap_or(defaults.strict_inputs),
    })
}

fn backoff_policy(section: &BackoffSection) -> Result<BackoffPolicy> {
    let defaults = BackoffPolicy::default();

    let policy = BackoffPolicy {
        first: duration_field("[engine.backoff].first", section.first.as_ref(), defaults.first)?,
        max: duration_field("[engine.backoff].max", section.max.as_ref(), defaults.max)?,
        factor: section.factor.unwrap_or(defaults.factor),
        jitter: section.jitter.unwrap_or(defaults.jitter),
    };

    if !policy.factor.is_finite() || policy.factor < 1.0 {
        return Err(EngineError::Config(format!(
            "[engine.backoff].factor must be >= 1.0 (got {})",
            policy.factor
        )));
    }
    if policy.first > policy.max {
        return Err(EngineError::Config(format!(
            "[engine.backoff].first ({:?}) must not exceed max ({:?})",
            policy.first, policy.max
        )));
    }

    Ok(policy)
}

fn validate_inputs(cfg: &RawConfigFile) -> Result<()> {
    for (name, manifold) in cfg.manifold.iter() {
        for input in manifold.inputs.iter() {
            if input == name {
                return Err(EngineError::SelfDependency(name.clone()));
            }
            if !cfg.manifold.contains_key(input) {
                return Err(EngineError::UnknownInput {
                    name: name.clone(),
                    input: input.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<Vec<String>> {
    let declared: BTreeMap<String, Vec<String>> = cfg
        .manifold
        .iter()
        .map(|(name, manifold)| (name.clone(), manifold.inputs.clone()))
        .collect();

    order_batch(&declared)
}

fn agent_spec(name: &str, cfg: &ManifoldConfig) -> Result<AgentSpec> {
    let kind = match cfg.kind {
        ManifoldKind::Constant => AgentKind::Constant {
            value: cfg.value.ok_or_else(|| {
                EngineError::Config(format!(
                    "manifold '{name}' of kind \"constant\" needs a `value`"
                ))
            })?,
        },
        ManifoldKind::Sum => {
            if cfg.inputs.is_empty() {
                return Err(EngineError::Config(format!(
                    "manifold '{name}' of kind \"sum\" needs at least one input"
                )));
            }
            AgentKind::Sum
        }
        ManifoldKind::Flaky => {
            let text = cfg.fail_after.as_ref().ok_or_else(|| {
                EngineError::Config(format!(
                    "manifold '{name}' of kind \"flaky\" needs `fail_after`"
                ))
            })?;
            AgentKind::Flaky {
                value: cfg.value.unwrap_or(0),
                fail_after: duration_field(
                    &format!("[manifold.{name}].fail_after"),
                    Some(text),
                    Duration::ZERO,
                )?,
            }
        }
        ManifoldKind::Fatal => AgentKind::Fatal,
    };

    Ok(AgentSpec {
        inputs: cfg.inputs.clone(),
        kind,
    })
}
