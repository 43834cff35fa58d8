//! Configuration resolution for `testledger` (A1).
//!
//! Resolution order, highest precedence first: CLI flags (applied by the
//! caller after [`RunConfig::load`] returns), environment variables
//! (`TESTLEDGER_*`), an optional `testledger.toml` in the working directory,
//! then built-in defaults. Every field is optional at every layer; a value
//! missing everywhere falls back to the default baked into this module.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timing tunables for the coalescing writer, the IPC tailer, and the native
/// output parser. See DESIGN.md for why each default was chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub group_debounce_ms: u64,
    pub run_debounce_ms: u64,
    pub max_wait_ms: u64,
    pub drain_grace_ms: u64,
    pub native_poll_ms: u64,
    pub ipc_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            group_debounce_ms: 150,
            run_debounce_ms: 250,
            max_wait_ms: 750,
            drain_grace_ms: 2_000,
            native_poll_ms: 10,
            ipc_poll_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn group_debounce(&self) -> Duration {
        Duration::from_millis(self.group_debounce_ms)
    }

    pub fn run_debounce(&self) -> Duration {
        Duration::from_millis(self.run_debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn native_poll(&self) -> Duration {
        Duration::from_millis(self.native_poll_ms)
    }

    pub fn ipc_poll(&self) -> Duration {
        Duration::from_millis(self.ipc_poll_ms)
    }
}

/// Bounds applied to generated report paths (§4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportPathConfig {
    pub depth_cap: usize,
    pub component_cap: usize,
}

impl Default for ReportPathConfig {
    fn default() -> Self {
        Self {
            depth_cap: crate::identity::DEFAULT_DEPTH_CAP,
            component_cap: crate::identity::DEFAULT_COMPONENT_CAP,
        }
    }
}

/// The fully resolved configuration for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub timing: TimingConfig,
    pub report: ReportPathConfig,
}

/// A parse error in `testledger.toml`, a startup error per spec.md §7
/// category 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl RunConfig {
    /// Loads configuration from `<cwd>/testledger.toml` (if present) layered
    /// over environment variables and defaults. CLI flags are applied by the
    /// caller on top of the returned value.
    pub fn load(cwd: &Path) -> Result<Self> {
        let mut config = Self::default();

        let toml_path = cwd.join("testledger.toml");
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path).map_err(|source| ConfigError::Read {
                path: toml_path.display().to_string(),
                source,
            })?;
            config = toml::from_str(&content)
                .map_err(|source| ConfigError::Parse {
                    path: toml_path.display().to_string(),
                    source,
                })
                .with_context(|| format!("invalid configuration in {}", toml_path.display()))?;
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Applies `TESTLEDGER_*` environment overrides on top of whatever was
/// loaded from TOML (or the defaults, if there was no file).
fn apply_env_overrides(config: &mut RunConfig) {
    if let Some(v) = env_u64("TESTLEDGER_TIMING_GROUP_DEBOUNCE_MS") {
        config.timing.group_debounce_ms = v;
    }
    if let Some(v) = env_u64("TESTLEDGER_TIMING_RUN_DEBOUNCE_MS") {
        config.timing.run_debounce_ms = v;
    }
    if let Some(v) = env_u64("TESTLEDGER_TIMING_MAX_WAIT_MS") {
        config.timing.max_wait_ms = v;
    }
    if let Some(v) = env_u64("TESTLEDGER_TIMING_DRAIN_GRACE_MS") {
        config.timing.drain_grace_ms = v;
    }
    if let Some(v) = env_u64("TESTLEDGER_TIMING_NATIVE_POLL_MS") {
        config.timing.native_poll_ms = v;
    }
    if let Some(v) = env_u64("TESTLEDGER_TIMING_IPC_POLL_MS") {
        config.timing.ipc_poll_ms = v;
    }
    if let Some(v) = env_usize("TESTLEDGER_REPORT_DEPTH_CAP") {
        config.report.depth_cap = v;
    }
    if let Some(v) = env_usize("TESTLEDGER_REPORT_COMPONENT_CAP") {
        config.report.component_cap = v.clamp(100, 252);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = RunConfig::default();
        assert_eq!(config.timing.group_debounce_ms, 150);
        assert_eq!(config.timing.run_debounce_ms, 250);
        assert_eq!(config.timing.max_wait_ms, 750);
        assert_eq!(config.timing.drain_grace_ms, 2_000);
        assert_eq!(config.report.depth_cap, 20);
        assert_eq!(config.report.component_cap, 100);
    }

    #[test]
    fn loads_missing_file_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(dir.path()).unwrap();
        assert_eq!(config.timing.group_debounce_ms, 150);
    }

    #[test]
    fn loads_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("testledger.toml"),
            "[timing]\ngroup_debounce_ms = 42\n",
        )
        .unwrap();
        let config = RunConfig::load(dir.path()).unwrap();
        assert_eq!(config.timing.group_debounce_ms, 42);
        // Unset fields still fall back to defaults.
        assert_eq!(config.timing.run_debounce_ms, 250);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("testledger.toml"), "not valid toml {{{").unwrap();
        assert!(RunConfig::load(dir.path()).is_err());
    }
}
