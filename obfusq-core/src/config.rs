//! ObfusQ configuration
//!
//! Defines the optional `obfusq.toml` file. Every field has a default, so an
//! empty or missing file yields a working setup that runs `lua src/cli.lua`.
//! Environment variables override the file; CLI flags override both.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::invoker::{ProcessInvoker, DEFAULT_CAPTURE_LIMIT};
use crate::pipeline::{Pipeline, PipelineConfig, DEFAULT_MAX_SOURCE_BYTES};
use crate::preset::{Preset, PresetSelection};

/// Default config file name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "obfusq.toml";

/// Top-level configuration (obfusq.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObfusqConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSection,

    /// External obfuscator settings
    #[serde(default)]
    pub obfuscator: ObfuscatorSection,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body / script, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_SOURCE_BYTES
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// `[obfuscator]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscatorSection {
    /// Program to run (default: "lua")
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Arguments placed before the per-request ones (default: ["src/cli.lua"])
    #[serde(default = "default_leading_args")]
    pub leading_args: Vec<String>,

    /// Seconds before a run is killed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cap for captured stdout/stderr and the output file, in bytes
    #[serde(default = "default_capture_limit_bytes")]
    pub capture_limit_bytes: usize,

    /// Preset used when a request does not name one (raw text profile)
    #[serde(default)]
    pub default_preset: Preset,

    /// Config file passed with `--config` instead of the default preset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,

    /// Directory for temp files (default: the system temp dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// Extension of temp files handed to the tool
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

fn default_executable() -> PathBuf {
    PathBuf::from("lua")
}

fn default_leading_args() -> Vec<String> {
    vec!["src/cli.lua".to_string()]
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_capture_limit_bytes() -> usize {
    DEFAULT_CAPTURE_LIMIT
}

fn default_file_extension() -> String {
    "lua".to_string()
}

impl Default for ObfuscatorSection {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            leading_args: default_leading_args(),
            timeout_secs: default_timeout_secs(),
            capture_limit_bytes: default_capture_limit_bytes(),
            default_preset: Preset::default(),
            config_file: None,
            temp_dir: None,
            file_extension: default_file_extension(),
        }
    }
}

impl ObfuscatorSection {
    /// Selection used when the client does not pick a preset
    pub fn default_selection(&self) -> PresetSelection {
        match &self.config_file {
            Some(path) => PresetSelection::ConfigFile(path.clone()),
            None => PresetSelection::Named(self.default_preset),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Invoker for the configured executable
    pub fn invoker(&self) -> ProcessInvoker {
        ProcessInvoker::new(&self.executable)
            .with_leading_args(self.leading_args.iter().map(OsString::from))
            .with_capture_limit(self.capture_limit_bytes)
    }
}

impl ObfusqConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every request fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.obfuscator.timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "obfuscator.timeout_secs",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Load `obfusq.toml` from `dir` if present, defaults otherwise
    pub fn find_and_load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(host) = lookup("OBFUSQ_HOST") {
            self.server.host = host;
        }
        if let Some(executable) = lookup("OBFUSCATOR_PATH") {
            self.obfuscator.executable = PathBuf::from(executable);
        }
        if let Some(script) = lookup("OBFUSCATOR_SCRIPT") {
            self.obfuscator.leading_args = if script.is_empty() { Vec::new() } else { vec![script] };
        }
        if let Some(secs) = lookup("OBFUSQ_TIMEOUT_SECS") {
            self.obfuscator.timeout_secs = parse_env("OBFUSQ_TIMEOUT_SECS", &secs)?;
        }
        if let Some(dir) = lookup("OBFUSQ_TEMP_DIR") {
            self.obfuscator.temp_dir = Some(PathBuf::from(dir));
        }
        self.validate()
    }

    /// Settings for the request pipeline
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            temp_dir: self
                .obfuscator
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            file_extension: self.obfuscator.file_extension.clone(),
            timeout: self.obfuscator.timeout(),
            max_source_bytes: self.server.max_payload_bytes,
            max_output_bytes: self.obfuscator.capture_limit_bytes,
        }
    }

    /// Pipeline backed by the configured executable
    pub fn build_pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(self.obfuscator.invoker()), self.pipeline_config())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}
