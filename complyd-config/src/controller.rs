use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};

use complyd_core::config::ControllerConfig;

use crate::util::{non_blank, parse_var};
use crate::validation::validate_controller;

pub const ENV_CONFIG_PATH: &str = "COMPLYD_CONFIG_PATH";
pub const ENV_CONFIG_JSON: &str = "COMPLYD_CONFIG_JSON";
pub const ENV_NAMESPACE: &str = "COMPLYD_NAMESPACE";
pub const ENV_WORKERS: &str = "COMPLYD_WORKERS";
pub const ENV_SCANNER_IMAGE: &str = "COMPLYD_SCANNER_IMAGE";
pub const ENV_AGGREGATOR_IMAGE: &str = "COMPLYD_AGGREGATOR_IMAGE";
pub const ENV_RESULT_SERVER_IMAGE: &str = "COMPLYD_RESULT_SERVER_IMAGE";
pub const ENV_LOG_COLLECTOR_IMAGE: &str = "COMPLYD_LOG_COLLECTOR_IMAGE";
pub const ENV_CONTENT_IMAGE: &str = "COMPLYD_CONTENT_IMAGE";

const ENV_PREFIX: &str = "COMPLYD_";

/// Source that produced the controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Resolves [`ControllerConfig`] from the environment and well-known files.
///
/// Evaluation order:
/// 1) `$COMPLYD_CONFIG_PATH` (TOML or JSON file),
/// 2) `$COMPLYD_CONFIG_JSON` (inline JSON),
/// 3) `complyd.toml`, `complyd.json`, `config/complyd.toml`, `config/complyd.json`
///    relative to the working directory,
/// 4) defaults.
///
/// Image and namespace overrides from the environment are applied on top of
/// whichever source won.
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    vars: HashMap<String, String>,
    base_dir: PathBuf,
}

impl ControllerSettings {
    /// Captures the `COMPLYD_*` variables of the current process.
    pub fn from_env() -> Self {
        Self::from_vars(
            env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX)),
            PathBuf::from("."),
        )
    }

    pub fn from_vars<I, K, V>(vars: I, base_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            base_dir: base_dir.into(),
        }
    }

    /// Shorthand for `ControllerSettings::from_env().load()`.
    pub fn load_from_env() -> anyhow::Result<(ControllerConfig, ConfigSource)> {
        Self::from_env().load()
    }

    pub fn load(&self) -> anyhow::Result<(ControllerConfig, ConfigSource)> {
        let (mut config, source) = self.load_base()?;
        self.apply_overrides(&mut config);
        validate_controller(&config)
            .with_context(|| format!("controller config from {source:?} is not usable"))?;
        tracing::info!(source = ?source, namespace = %config.namespace, "loaded controller configuration");
        Ok((config, source))
    }

    fn load_base(&self) -> anyhow::Result<(ControllerConfig, ConfigSource)> {
        if let Some(path) = non_blank(&self.vars, ENV_CONFIG_PATH) {
            let path = PathBuf::from(path);
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = non_blank(&self.vars, ENV_CONFIG_JSON) {
            let parsed = parse_json(raw).context("failed to parse COMPLYD_CONFIG_JSON")?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((ControllerConfig::default(), ConfigSource::Default))
    }

    fn apply_overrides(&self, config: &mut ControllerConfig) {
        if let Some(namespace) = non_blank(&self.vars, ENV_NAMESPACE) {
            config.namespace = namespace.to_string();
        }
        if let Some(workers) = parse_var(&self.vars, ENV_WORKERS) {
            config.reconcile.workers = workers;
        }

        let images = &mut config.images;
        for (name, slot) in [
            (ENV_SCANNER_IMAGE, &mut images.scanner),
            (ENV_AGGREGATOR_IMAGE, &mut images.aggregator),
            (ENV_RESULT_SERVER_IMAGE, &mut images.result_server),
            (ENV_LOG_COLLECTOR_IMAGE, &mut images.log_collector),
            (ENV_CONTENT_IMAGE, &mut images.content),
        ] {
            if let Some(image) = non_blank(&self.vars, name) {
                *slot = image.to_string();
            }
        }
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "complyd.toml",
            "complyd.json",
            "config/complyd.toml",
            "config/complyd.json",
        ];

        CANDIDATES
            .iter()
            .map(|candidate| self.base_dir.join(candidate))
            .find(|path| path.exists())
    }
}

pub fn load_from_file(path: &Path) -> anyhow::Result<ControllerConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read controller config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid controller config {}", path.display()))
        }
        Some("toml") | Some("tml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid controller config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<ControllerConfig> {
    // Try TOML first, then JSON.
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse controller config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<ControllerConfig> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid controller config json: {err}"))
}
