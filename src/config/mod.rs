//! Service configuration.
//!
//! Loaded from a TOML file, then overridden by `DXGATE_*` environment
//! variables, then validated. Everything operators tune lives here so no
//! code change is needed to add a stage, move a limit or reweight.

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consts::{
    DEFAULT_BIND, DEFAULT_HISTORY_MAX_ENTRIES, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_STAGE_TIMEOUT,
    DEFAULT_STAGE_WEIGHT, default_db_path,
};
use crate::preprocess::{PreprocessConfig, TensorShape};
use crate::stage::{StageKind, StageRegistry, StageSettings, check_weight};

pub const ENV_BIND: &str = "DXGATE_BIND";
pub const ENV_MAX_UPLOAD_BYTES: &str = "DXGATE_MAX_UPLOAD_BYTES";
pub const ENV_STAGE_TIMEOUT_SECS: &str = "DXGATE_STAGE_TIMEOUT_SECS";
pub const ENV_HISTORY_PATH: &str = "DXGATE_HISTORY_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Timeout for stages that do not set their own.
    pub stage_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_upload_bytes: usize,
    /// Keep every validated upload here. Unset keeps nothing.
    pub persist_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            persist_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite path, `":memory:"` for ephemeral. Defaults to `~/.dxgate/history.db`.
    pub path: Option<String>,
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
        }
    }
}

/// One `[[stages]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    /// Shape to preprocess into. Defaults to the stage's expected shape.
    #[serde(default)]
    pub input_shape: Option<TensorShape>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub backend: StageKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub preprocess: PreprocessConfig,
    pub history: HistoryConfig,
    pub stages: Vec<StageConfig>,
    /// Directory relative checkpoint paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl ServiceConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse configuration")
    }

    /// Read a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&text)
            .with_context(|| format!("in {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DXGATE_*` overrides. `lookup` abstracts the environment for tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Some(raw) = lookup(ENV_MAX_UPLOAD_BYTES) {
            self.ingest.max_upload_bytes = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_UPLOAD_BYTES} is not a byte count: {raw}"))?;
        }
        if let Some(raw) = lookup(ENV_STAGE_TIMEOUT_SECS) {
            self.server.stage_timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_STAGE_TIMEOUT_SECS} is not a number: {raw}"))?;
        }
        if let Some(path) = lookup(ENV_HISTORY_PATH) {
            self.history.path = Some(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        ensure!(self.ingest.max_upload_bytes > 0, "ingest.max_upload_bytes must be > 0");
        ensure!(self.history.max_entries > 0, "history.max_entries must be > 0");
        self.preprocess.normalization.validate()?;
        timeout(self.server.stage_timeout_secs).context("server.stage_timeout_secs")?;

        ensure!(!self.stages.is_empty(), "no stages configured");
        let mut ids = BTreeSet::new();
        for stage in &self.stages {
            ensure!(!stage.id.trim().is_empty(), "stage id must not be empty");
            if !ids.insert(stage.id.as_str()) {
                bail!("duplicate stage id '{}'", stage.id);
            }
            if let Some(weight) = stage.weight {
                check_weight(&stage.id, weight).map_err(anyhow::Error::msg)?;
            }
            if let Some(secs) = stage.timeout_secs {
                timeout(secs).with_context(|| format!("stage '{}' timeout_secs", stage.id))?;
            }
            if let Some(shape) = stage.input_shape {
                check_shape(shape).with_context(|| format!("stage '{}' input_shape", stage.id))?;
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.server.bind))
    }

    pub fn history_path(&self) -> String {
        self.history
            .path
            .clone()
            .unwrap_or_else(|| default_db_path().to_string_lossy().into_owned())
    }

    /// Instantiate every configured stage and its run settings.
    pub fn build_registry(&self) -> Result<StageRegistry> {
        let default_timeout = timeout(self.server.stage_timeout_secs)?;
        let mut registry = StageRegistry::new();
        for config in &self.stages {
            let stage = config
                .backend
                .build(&config.id, &self.base_dir)
                .with_context(|| format!("failed to build stage '{}'", config.id))?;
            let settings = StageSettings {
                input_shape: config.input_shape.unwrap_or_else(|| stage.expected_shape()),
                weight: config.weight.unwrap_or(DEFAULT_STAGE_WEIGHT),
                timeout: match config.timeout_secs {
                    Some(secs) => timeout(secs)?,
                    None => default_timeout,
                },
                required: config.required,
            };
            registry.register(stage, settings)?;
        }
        Ok(registry)
    }
}

fn timeout(secs: f64) -> Result<Duration> {
    ensure!(secs.is_finite() && secs > 0.0, "timeout must be > 0 seconds, got {secs}");
    Duration::try_from_secs_f64(secs).with_context(|| format!("timeout {secs}s is out of range"))
}

fn check_shape(shape: TensorShape) -> Result<()> {
    ensure!(
        shape.height > 0 && shape.width > 0,
        "shape {shape} has a zero dimension"
    );
    ensure!(
        shape.channels == 1 || shape.channels == 3,
        "shape {shape} must have 1 or 3 channels"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TWO_STAGES: &str = r#"
        [server]
        bind = "0.0.0.0:9000"

        [ingest]
        max_upload_bytes = 2048

        [preprocess]
        filter = "nearest"
        mean = [0.5, 0.5, 0.5]

        [[stages]]
        id = "a"
        kind = "fixed"
        labels = [{ label = "x", confidence = 0.9 }]
        weight = 2
        required = true

        [[stages]]
        id = "b"
        kind = "fixed"
        labels = [{ label = "y", confidence = 0.4 }]
        expected_shape = { height = 32, width = 32, channels = 1 }
        timeout_secs = 0.5
    "#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_full_config() {
        let config = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.ingest.max_upload_bytes, 2048);
        assert_eq!(config.preprocess.normalization.mean, [0.5, 0.5, 0.5]);
        assert_eq!(config.preprocess.normalization.std, [1.0, 1.0, 1.0]);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].weight, Some(2.0));
        assert!(matches!(config.stages[1].backend, StageKind::Fixed(_)));
    }

    #[test]
    fn defaults_are_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.ingest.max_upload_bytes, 10_485_760);
        assert_eq!(config.server.stage_timeout_secs, 30.0);
        assert!(config.ingest.persist_dir.is_none());
    }

    #[test]
    fn builds_registry_with_settings() {
        let config = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        let registry = config.build_registry().unwrap();

        let a = registry.get("a").unwrap();
        assert_eq!(a.settings.weight, 2.0);
        assert!(a.settings.required);
        assert_eq!(a.settings.timeout, Duration::from_secs(30));
        assert_eq!(a.settings.input_shape, TensorShape::new(224, 224, 3));

        let b = registry.get("b").unwrap();
        assert_eq!(b.settings.timeout, Duration::from_millis(500));
        assert_eq!(b.settings.input_shape, TensorShape::new(32, 32, 1));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        config
            .apply_env_overrides(env(&[
                (ENV_BIND, "127.0.0.1:7000"),
                (ENV_MAX_UPLOAD_BYTES, "4096"),
                (ENV_STAGE_TIMEOUT_SECS, "5"),
                (ENV_HISTORY_PATH, ":memory:"),
            ]))
            .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7000");
        assert_eq!(config.ingest.max_upload_bytes, 4096);
        assert_eq!(config.server.stage_timeout_secs, 5.0);
        assert_eq!(config.history_path(), ":memory:");

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.get("a").unwrap().settings.timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_override_must_parse() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env_overrides(env(&[(ENV_MAX_UPLOAD_BYTES, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_UPLOAD_BYTES));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        assert!(ServiceConfig::default().validate().is_err(), "no stages");

        let mut dup = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        dup.stages[1].id = "a".into();
        assert!(dup.validate().is_err());

        let mut weight = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        weight.stages[0].weight = Some(-1.0);
        assert!(weight.validate().is_err());

        let mut timeout = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        timeout.stages[0].timeout_secs = Some(0.0);
        assert!(timeout.validate().is_err());

        let mut shape = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        shape.stages[0].input_shape = Some(TensorShape::new(8, 8, 4));
        assert!(shape.validate().is_err());

        let mut bind = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        bind.server.bind = "not an address".into();
        assert!(bind.validate().is_err());

        let mut upload = ServiceConfig::from_toml_str(TWO_STAGES).unwrap();
        upload.ingest.max_upload_bytes = 0;
        assert!(upload.validate().is_err());
    }

    #[test]
    fn unknown_stage_kind_fails_to_parse() {
        let err = ServiceConfig::from_toml_str(
            r#"
            [[stages]]
            id = "a"
            kind = "quantum"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse configuration"));
    }

    #[test]
    fn load_resolves_checkpoints_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("probe.json"),
            r#"{
                "labels": ["normal", "pneumonia"],
                "input_shape": { "height": 8, "width": 8, "channels": 1 },
                "grid": 2,
                "weights": [[0.1, 0.1, 0.1, 0.1], [-0.1, -0.1, -0.1, -0.1]],
                "bias": [0.0, 0.0]
            }"#,
        )
        .unwrap();
        let path = dir.path().join("dxgate.toml");
        std::fs::write(
            &path,
            r#"
            [history]
            path = ":memory:"

            [[stages]]
            id = "probe"
            kind = "linear"
            checkpoint = "probe.json"
            "#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        let registry = config.build_registry().unwrap();
        let probe = registry.get("probe").unwrap();
        assert_eq!(probe.stage.architecture(), "linear-probe");
        assert_eq!(probe.settings.input_shape, TensorShape::new(8, 8, 1));
    }
}
