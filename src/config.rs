//! Client configuration.
//!
//! Loaded from a JSON file (camelCase keys, every field optional) with a
//! small set of environment overrides for field deployments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::HubError;

/// Overrides the company identifier passed to session creation.
pub const ENV_COMPANY: &str = "POS_HUB_COMPANY";
/// Extra directory searched before the default search paths.
pub const ENV_MODULE_DIR: &str = "POS_HUB_MODULE_DIR";

pub const DEFAULT_PRIMARY_MODULE: &str = "IntegrationHubCpp.dll";

/// Dependency order: each module must be resolvable before the ones after it.
pub const DEFAULT_MODULES: &[&str] = &[
    "libcrypto-3.dll",
    "libusb-1.0.dll",
    "zlib1.dll",
    DEFAULT_PRIMARY_MODULE,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Merchant identifier handed to `createCommunication`.
    pub company_name: String,
    pub native: NativeConfig,
    pub logging: LoggingConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            company_name: "CompanyName".into(),
            native: NativeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeConfig {
    /// Modules to load, in dependency order. Must include `primary_module`.
    pub modules: Vec<String>,
    pub primary_module: String,
    /// Empty means executable directory, then current working directory.
    pub search_paths: Vec<PathBuf>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            modules: DEFAULT_MODULES.iter().map(|m| m.to_string()).collect(),
            primary_module: DEFAULT_PRIMARY_MODULE.into(),
            search_paths: Vec::new(),
        }
    }
}

impl NativeConfig {
    /// Directories searched for every module, in order.
    pub fn resolved_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }

        let mut paths = Vec::with_capacity(2);
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            paths.push(dir);
        }
        if let Ok(cwd) = std::env::current_dir() {
            if !paths.contains(&cwd) {
                paths.push(cwd);
            }
        }
        paths
    }

    fn validate(&self) -> Result<(), HubError> {
        if self.modules.is_empty() {
            return Err(HubError::Config("native.modules must not be empty".into()));
        }
        if !self.modules.iter().any(|m| m == &self.primary_module) {
            return Err(HubError::Config(format!(
                "primary module '{}' is not listed in native.modules",
                self.primary_module
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Log directory; `None` uses the per-user data directory.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    pub filter: String,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "pos-hub".into(),
            filter: "info,pos_hub=debug".into(),
            max_files: crate::diagnostics::MAX_LOG_FILES,
        }
    }
}

impl HubConfig {
    /// Read a JSON config file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HubError::Config(format!("read {}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| HubError::Config(format!("parse {}: {e}", path.display())))?;

        let mut config = Self::from_value(&value)?;
        config.apply_env_overrides();
        config.native.validate()?;

        info!(
            path = %path.display(),
            company = %config.company_name,
            modules = config.native.modules.len(),
            "Hub configuration loaded"
        );
        Ok(config)
    }

    /// Build a config from an already-parsed JSON value (no env overrides).
    pub fn from_value(value: &Value) -> Result<Self, HubError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| HubError::Config(e.to_string()))?;
        config.native.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(company) = env_non_empty(ENV_COMPANY) {
            debug!(company = %company, "Company overridden from environment");
            self.company_name = company;
        }
        if let Some(dir) = env_non_empty(ENV_MODULE_DIR) {
            debug!(dir = %dir, "Module directory prepended from environment");
            let mut paths = self.native.resolved_search_paths();
            paths.insert(0, PathBuf::from(dir));
            self.native.search_paths = paths;
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
