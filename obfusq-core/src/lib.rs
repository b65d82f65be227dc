//! ObfusQ Core Library
//!
//! This crate provides the request orchestration behind ObfusQ:
//! - Preset whitelist and argument building
//! - Per-request temp file pairs with guaranteed cleanup
//! - External obfuscator invocation with timeout and capped capture
//! - The obfuscation pipeline tying them together
//! - Configuration loading (obfusq.toml + environment)
//!
//! The obfuscation itself is done by an external command-line tool.

pub mod config;
pub mod error;
pub mod invoker;
pub mod pipeline;
pub mod preset;
pub mod temp_files;

// Re-export commonly used types
pub use config::{ObfuscatorSection, ObfusqConfig, ServerSection, CONFIG_FILE_NAME};
pub use error::{ConfigError, ObfuscationError};
pub use invoker::{InvocationOutcome, Invoker, ProcessInvoker, Stream, DEFAULT_CAPTURE_LIMIT};
pub use pipeline::{
    ObfuscationOutput, ObfuscationRequest, ObfuscationResult, Pipeline, PipelineConfig, Stage,
    DEFAULT_MAX_SOURCE_BYTES, DEFAULT_TIMEOUT,
};
pub use preset::{Preset, PresetSelection, UnknownPreset};
pub use temp_files::TempFilePair;
