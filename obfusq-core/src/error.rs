//! Error types for obfuscation requests

use std::io;
use std::time::Duration;

use crate::invoker::Stream;

/// Why an obfuscation request failed
#[derive(Debug, thiserror::Error)]
pub enum ObfuscationError {
    #[error("No script provided")]
    EmptySource,

    #[error("Script exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid preset")]
    InvalidPreset(String),

    #[error("Failed to prepare input file")]
    WriteInput(#[source] io::Error),

    #[error("Failed to launch obfuscator: {0}")]
    Launch(String),

    #[error("Failed to collect obfuscator output: {0}")]
    Collect(String),

    #[error("Obfuscation timeout")]
    Timeout(Duration),

    #[error("{message}")]
    NonZeroExit {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Obfuscator {stream} exceeded the {limit} byte capture limit")]
    CaptureExceeded { stream: Stream, limit: usize },

    #[error("Output file not created")]
    MissingOutput,

    #[error("Failed to read obfuscated output")]
    ReadOutput(#[source] io::Error),
}

impl ObfuscationError {
    /// Caused by the caller's input rather than the server or the tool
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ObfuscationError::EmptySource
                | ObfuscationError::PayloadTooLarge { .. }
                | ObfuscationError::InvalidPreset(_)
        )
    }

    /// Build the error for a non-zero exit, preferring the tool's stderr
    pub fn non_zero_exit(exit_code: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else {
            match exit_code {
                Some(code) => format!("Obfuscator exited with status {}", code),
                None => "Obfuscator was terminated by a signal".to_string(),
            }
        };
        ObfuscationError::NonZeroExit { exit_code, message }
    }
}

/// Errors loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: &'static str },
}
