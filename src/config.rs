use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::key;
use crate::queue::MAX_ACTIVE_APIS;
use crate::types::Catalog;

pub const CONFIG_FILE_NAME: &str = "prompt-runner.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PromptRunnerConfig {
    pub scheduler: SchedulerConfig,
    pub backend: BackendConfig,
    pub resume: ResumeConfig,
    pub catalog: CatalogConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_active: usize,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub submit_path: String,
    pub request_timeout_secs: u64,
}

/// Opt-in resume of pending runs across restarts.
///
/// Off by default: run status can't be fully reconstructed after a restart,
/// so resuming only re-submits what was pending (at-least-once).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    pub path: String,
    pub ttl_secs: u64,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub prompts: Vec<String>,
    pub profiles: Vec<String>,
    pub documents: Vec<String>,
    pub focused_document: Option<String>,
}

impl CatalogConfig {
    pub fn to_catalog(&self) -> Catalog {
        Catalog {
            prompts: self.prompts.clone(),
            profiles: self.profiles.clone(),
            documents: self.documents.clone(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active: MAX_ACTIVE_APIS,
            poll_interval_secs: 5,
            max_wait_secs: 30,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            submit_path: "/api/prompt-runs".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: ".prompt-runner/pending-runs.json".to_string(),
            ttl_secs: 300,
        }
    }
}

impl ResumeConfig {
    pub fn resolve_path(&self, config_base: &Path) -> PathBuf {
        config_base.join(&self.path)
    }
}

pub fn validate(config: &PromptRunnerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.scheduler.max_active < 1 {
        errors.push("scheduler.max_active must be >= 1".to_string());
    }

    if config.scheduler.poll_interval_secs < 1 {
        errors.push("scheduler.poll_interval_secs must be >= 1".to_string());
    }

    if config.scheduler.max_wait_secs < config.scheduler.poll_interval_secs {
        errors.push(format!(
            "scheduler.max_wait_secs ({}) must be >= scheduler.poll_interval_secs ({})",
            config.scheduler.max_wait_secs, config.scheduler.poll_interval_secs
        ));
    }

    if config.backend.request_timeout_secs > config.scheduler.max_wait_secs {
        errors.push(format!(
            "backend.request_timeout_secs ({}) must be <= scheduler.max_wait_secs ({})",
            config.backend.request_timeout_secs, config.scheduler.max_wait_secs
        ));
    }

    if !config.backend.base_url.starts_with("http://")
        && !config.backend.base_url.starts_with("https://")
    {
        errors.push(format!(
            "backend.base_url '{}' must start with http:// or https://",
            config.backend.base_url
        ));
    }

    if config.resume.enabled && config.resume.path.trim().is_empty() {
        errors.push("resume.path must be set when resume is enabled".to_string());
    }

    let catalog = &config.catalog;
    for (field, ids) in [
        ("prompt", &catalog.prompts),
        ("profile", &catalog.profiles),
        ("document", &catalog.documents),
    ] {
        for id in ids {
            if let Err(e) = key::validate_id(field, id) {
                errors.push(format!("catalog: {}", e));
            }
        }
    }

    if let Some(focused) = &catalog.focused_document {
        if !catalog.documents.contains(focused) {
            errors.push(format!(
                "catalog.focused_document '{}' is not in catalog.documents",
                focused
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load `prompt-runner.toml` from the project root, or defaults if it is missing.
pub fn load_config(project_root: &Path) -> Result<PromptRunnerConfig, String> {
    let config_path = project_root.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        return Ok(PromptRunnerConfig::default());
    }

    load_config_file(&config_path)
}

/// Load from an explicit path if given (it must exist), else from the project root.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<PromptRunnerConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_file(path)
        }
        None => load_config(project_root),
    }
}

fn load_config_file(config_path: &Path) -> Result<PromptRunnerConfig, String> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let config: PromptRunnerConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
