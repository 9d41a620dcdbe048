// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{BackoffPolicy, JitterPolicy};

/// Configuration file exactly as deserialized from TOML.
///
/// ```toml
/// [engine]
/// strict_inputs = true
/// restart_delay = "500ms"
///
/// [engine.backoff]
/// first = "100ms"
/// max = "30s"
/// factor = 2.0
/// jitter = "equal"
///
/// [manifold.api]
/// kind = "constant"
/// value = 1
///
/// [manifold.total]
/// kind = "sum"
/// inputs = ["api"]
/// ```
///
/// Use [`ConfigFile::try_from`] to validate it.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    /// All manifolds from `[manifold.<name>]`, keyed by name.
    #[serde(default)]
    pub manifold: BTreeMap<String, ManifoldConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineSection {
    /// Reject inputs naming manifolds that were never installed.
    #[serde(default)]
    pub strict_inputs: Option<bool>,

    /// Delay before restarting a worker that exited cleanly, e.g. `"500ms"`.
    #[serde(default)]
    pub restart_delay: Option<String>,

    #[serde(default)]
    pub backoff: BackoffSection,
}

/// `[engine.backoff]` section. Unset keys take [`BackoffPolicy::default`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackoffSection {
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub jitter: Option<JitterPolicy>,
}

/// Built-in worker kinds the `depengine` binary knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifoldKind {
    Constant,
    Sum,
    Flaky,
    Fatal,
}

/// `[manifold.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifoldConfig {
    pub kind: ManifoldKind,

    /// Names of the manifolds this one consumes.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Published value: required for `constant`, optional for `flaky`.
    #[serde(default)]
    pub value: Option<i64>,

    /// How long a `flaky` worker runs before failing, e.g. `"2s"`.
    #[serde(default)]
    pub fail_after: Option<String>,
}

/// Tuning of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub backoff: BackoffPolicy,
    /// Delay before restarting a worker that exited without error.
    pub restart_delay: Duration,
    pub strict_inputs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            restart_delay: Duration::from_millis(500),
            strict_inputs: true,
        }
    }
}

/// What a validated manifold entry runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentKind {
    Constant { value: i64 },
    Sum,
    Flaky { value: i64, fail_after: Duration },
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub inputs: Vec<String>,
    pub kind: AgentKind,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub manifolds: BTreeMap<String, AgentSpec>,
    /// Manifold names, inputs first.
    pub order: Vec<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineConfig,
        manifolds: BTreeMap<String, AgentSpec>,
        order: Vec<String>,
    ) -> Self {
        Self {
            engine,
            manifolds,
            order,
        }
    }
}

/// Parse durations like `"250ms"`, `"3s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(60 * 60))),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("0ms"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn deserializes_sections_with_defaults() {
        let raw: RawConfigFile = toml::from_str(
            r#"
            [manifold.api]
            kind = "constant"
            value = 3

            [manifold.total]
            kind = "sum"
            inputs = ["api"]
            "#,
        )
        .unwrap();

        assert!(raw.engine.strict_inputs.is_none());
        assert!(raw.engine.backoff.first.is_none());
        assert_eq!(raw.manifold["api"].kind, ManifoldKind::Constant);
        assert_eq!(raw.manifold["api"].value, Some(3));
        assert_eq!(raw.manifold["total"].inputs, ["api"]);
    }

    #[test]
    fn unknown_kind_fails_to_deserialize() {
        let res: Result<RawConfigFile, _> = toml::from_str(
            r#"
            [manifold.x]
            kind = "teleport"
            "#,
        );
        assert!(res.is_err());
    }
}
