use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::app::FetchOptions;
use crate::error::AtbError;

pub const CONFIG_FILE: &str = "kira-atb.json";

pub const DEFAULT_JOBS: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;
pub const DEFAULT_STRIP_COMPONENTS: usize = 1;
pub const DEFAULT_OUTPUT_DIR: &str = "assemblies";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_base_ms: Option<u64>,
    #[serde(default)]
    pub strip_components: Option<usize>,
    #[serde(default)]
    pub delete_archives: Option<bool>,
    #[serde(default)]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub jobs: Option<usize>,
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub strip_components: Option<usize>,
    pub delete_archives: bool,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub jobs: usize,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry_base: Duration,
    pub strip_components: usize,
    pub delete_archives: bool,
    pub output_dir: PathBuf,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            jobs: DEFAULT_JOBS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            strip_components: DEFAULT_STRIP_COMPONENTS,
            delete_archives: false,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl ResolvedConfig {
    pub fn apply(mut self, overrides: &ConfigOverrides) -> Result<Self, AtbError> {
        if let Some(jobs) = overrides.jobs {
            self.jobs = jobs;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(timeout_secs) = overrides.timeout_secs {
            self.timeout = Duration::from_secs(timeout_secs);
        }
        if let Some(strip_components) = overrides.strip_components {
            self.strip_components = strip_components;
        }
        if overrides.delete_archives {
            self.delete_archives = true;
        }
        if let Some(output_dir) = &overrides.output_dir {
            self.output_dir = output_dir.clone();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn fetch_options(&self, dry_run: bool) -> FetchOptions {
        FetchOptions {
            concurrency: self.jobs,
            max_attempts: self.max_attempts,
            strip_components: self.strip_components,
            delete_archives: self.delete_archives,
            dry_run,
        }
    }

    fn validate(&self) -> Result<(), AtbError> {
        if self.jobs == 0 {
            return Err(AtbError::InvalidConfig("jobs must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(AtbError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(AtbError::InvalidConfig(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AtbError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => match Self::discover() {
                Some(path) => path,
                None => return Ok(ResolvedConfig::default()),
            },
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AtbError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AtbError::ConfigParse(err.to_string()))?;
        tracing::debug!(path = %config_path.display(), "loaded config");

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AtbError> {
        let defaults = ResolvedConfig::default();
        let resolved = ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(defaults.schema_version),
            jobs: config.jobs.unwrap_or(defaults.jobs),
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry_base: config
                .retry_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base),
            strip_components: config.strip_components.unwrap_or(defaults.strip_components),
            delete_archives: config.delete_archives.unwrap_or(defaults.delete_archives),
            output_dir: config
                .output_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        };
        resolved.validate()?;
        Ok(resolved)
    }

    fn discover() -> Option<PathBuf> {
        let local = Path::new(CONFIG_FILE);
        if local.exists() {
            return Some(local.to_path_buf());
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("kira-atb").join("config.json"))
            .filter(|path| path.exists())
    }
}
