//! Obfuscation request lifecycle
//!
//! One request moves through
//! `Received → Validating → Writing → Invoking → ReadingOutput → Responding`
//! and may drop into `Failed` from any step. Validation happens before any
//! file is touched; once a [`TempFilePair`] exists it is cleaned up exactly
//! once, whichever way the request ends.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ObfuscationError;
use crate::invoker::{InvocationOutcome, Invoker, DEFAULT_CAPTURE_LIMIT};
use crate::preset::{Preset, PresetSelection};
use crate::temp_files::TempFilePair;

/// Default timeout for one obfuscator run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum script size (10 MB)
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 10 * 1024 * 1024;

/// A script plus the configuration to obfuscate it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationRequest {
    pub source: String,
    pub selection: PresetSelection,
}

impl ObfuscationRequest {
    pub fn new(source: impl Into<String>, selection: impl Into<PresetSelection>) -> Self {
        Self {
            source: source.into(),
            selection: selection.into(),
        }
    }

    /// Build a request from client-supplied fields.
    ///
    /// Clients may only name a whitelisted [`Preset`]; config file paths are
    /// reserved for the operator.
    pub fn from_client(code: Option<String>, preset: Option<&str>) -> Result<Self, ObfuscationError> {
        let source = match code {
            Some(code) if !code.trim().is_empty() => code,
            _ => return Err(ObfuscationError::EmptySource),
        };

        let preset = preset.unwrap_or_default();
        let preset: Preset = preset
            .parse()
            .map_err(|_| ObfuscationError::InvalidPreset(preset.to_string()))?;

        Ok(Self::new(source, preset))
    }
}

/// Transformed script plus whatever the tool printed to stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObfuscationOutput {
    pub obfuscated: String,
    pub log: String,
}

/// Wire-friendly view of a finished request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObfuscationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscated: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ObfuscationResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            obfuscated: None,
            log: String::new(),
            error: Some(message.into()),
        }
    }
}

impl From<ObfuscationOutput> for ObfuscationResult {
    fn from(output: ObfuscationOutput) -> Self {
        Self {
            success: true,
            obfuscated: Some(output.obfuscated),
            log: output.log,
            error: None,
        }
    }
}

impl From<&ObfuscationError> for ObfuscationResult {
    fn from(err: &ObfuscationError) -> Self {
        Self::failure(err.to_string())
    }
}

/// Request lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validating,
    Writing,
    Invoking,
    ReadingOutput,
    Responding,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Validating => "validating",
            Stage::Writing => "writing",
            Stage::Invoking => "invoking",
            Stage::ReadingOutput => "reading_output",
            Stage::Responding => "responding",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the current stage and logs transitions
struct Progress {
    stage: Stage,
}

impl Progress {
    fn new() -> Self {
        tracing::debug!(stage = %Stage::Received, "Request received");
        Self {
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "Stage transition");
        self.stage = stage;
    }

    /// Move to the terminal `Failed` stage, returning the stage that failed
    fn fail(&mut self) -> Stage {
        let failed_at = self.stage;
        self.advance(Stage::Failed);
        failed_at
    }
}

/// Settings for running the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory for temp file pairs
    pub temp_dir: PathBuf,
    /// Extension for temp files, e.g. `lua`
    pub file_extension: String,
    /// Wall-clock limit for one obfuscator run
    pub timeout: Duration,
    /// Largest accepted script
    pub max_source_bytes: usize,
    /// Largest accepted output file
    pub max_output_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            file_extension: "lua".to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_output_bytes: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

/// Drives one request at a time through the external obfuscator.
/// Cheap to clone; clones share the invoker.
#[derive(Clone)]
pub struct Pipeline {
    invoker: Arc<dyn Invoker>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(invoker: Arc<dyn Invoker>, config: PipelineConfig) -> Self {
        Self { invoker, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a request end to end
    pub async fn run(&self, request: ObfuscationRequest) -> Result<ObfuscationOutput, ObfuscationError> {
        let span = tracing::info_span!(
            "obfuscate",
            id = %Uuid::new_v4().simple(),
            selection = %request.selection,
        );
        self.run_request(request).instrument(span).await
    }

    async fn run_request(&self, request: ObfuscationRequest) -> Result<ObfuscationOutput, ObfuscationError> {
        let mut progress = Progress::new();

        progress.advance(Stage::Validating);
        if let Err(e) = self.validate(&request) {
            let failed_at = progress.fail();
            tracing::info!(stage = %failed_at, "Rejected request: {}", e);
            return Err(e);
        }

        progress.advance(Stage::Writing);
        let mut files = TempFilePair::allocate(&self.config.temp_dir, &self.config.file_extension);
        let result = self.process(&files, &request, &mut progress).await;
        files.cleanup();

        match &result {
            Ok(output) => {
                progress.advance(Stage::Responding);
                tracing::info!(
                    "Obfuscated {} bytes into {} bytes",
                    request.source.len(),
                    output.obfuscated.len()
                );
            }
            Err(e) => {
                let failed_at = progress.fail();
                tracing::warn!(stage = %failed_at, "Obfuscation failed: {}", e);
            }
        }

        result
    }

    fn validate(&self, request: &ObfuscationRequest) -> Result<(), ObfuscationError> {
        if request.source.trim().is_empty() {
            return Err(ObfuscationError::EmptySource);
        }
        if request.source.len() > self.config.max_source_bytes {
            return Err(ObfuscationError::PayloadTooLarge {
                limit: self.config.max_source_bytes,
            });
        }
        Ok(())
    }

    async fn process(
        &self,
        files: &TempFilePair,
        request: &ObfuscationRequest,
        progress: &mut Progress,
    ) -> Result<ObfuscationOutput, ObfuscationError> {
        files.write_input(&request.source).await.map_err(|e| {
            tracing::error!("Failed to write {}: {}", files.input_path().display(), e);
            ObfuscationError::WriteInput(e)
        })?;

        progress.advance(Stage::Invoking);
        let mut args = request.selection.to_args();
        args.push("--out".into());
        args.push(files.output_path().into());
        args.push(files.input_path().into());

        let log = match self.invoker.run(args, self.config.timeout).await {
            InvocationOutcome::Completed {
                exit_code: Some(0),
                stdout,
                ..
            } => stdout,
            InvocationOutcome::Completed { exit_code, stderr, .. } => {
                return Err(ObfuscationError::non_zero_exit(exit_code, &stderr));
            }
            InvocationOutcome::TimedOut { after } => return Err(ObfuscationError::Timeout(after)),
            InvocationOutcome::LaunchFailed { reason } => return Err(ObfuscationError::Launch(reason)),
            InvocationOutcome::CaptureExceeded { stream, limit } => {
                return Err(ObfuscationError::CaptureExceeded { stream, limit });
            }
            InvocationOutcome::CollectFailed { reason } => return Err(ObfuscationError::Collect(reason)),
        };

        progress.advance(Stage::ReadingOutput);
        let exists = files
            .output_exists()
            .await
            .map_err(ObfuscationError::ReadOutput)?;
        if !exists {
            return Err(ObfuscationError::MissingOutput);
        }

        let obfuscated = files
            .read_output(self.config.max_output_bytes)
            .await
            .map_err(|e| {
                tracing::error!("Failed to read {}: {}", files.output_path().display(), e);
                ObfuscationError::ReadOutput(e)
            })?;

        Ok(ObfuscationOutput { obfuscated, log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::invoker::Stream;

    /// What the stub obfuscator does when called
    #[derive(Clone)]
    enum Behavior {
        /// Writes `-- obfuscated\n` + reversed input to the output path
        Reverse,
        /// Exits 0 without writing anything
        NoOutput,
        /// Exits with the given code and stderr
        Fail(i32, &'static str),
        /// Reports a timeout
        Timeout,
        /// Reports stdout overflowing the capture cap
        CaptureExceeded,
        /// Reports losing the output pipes mid-run
        CollectFailed,
    }

    /// Stub invoker that records every call
    struct RecordingInvoker {
        behavior: Behavior,
        calls: AtomicUsize,
        last_args: Mutex<Vec<OsString>>,
    }

    impl RecordingInvoker {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                last_args: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_args(&self) -> Vec<OsString> {
            self.last_args.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn run(&self, args: Vec<OsString>, timeout: Duration) -> InvocationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_args.lock().unwrap() = args.clone();

            let out_pos = args.iter().position(|a| a == "--out").unwrap();
            let output = Path::new(&args[out_pos + 1]);
            let input = Path::new(args.last().unwrap());

            match &self.behavior {
                Behavior::Reverse => {
                    let source = std::fs::read_to_string(input).unwrap();
                    let reversed: String = source.chars().rev().collect();
                    std::fs::write(output, format!("-- obfuscated\n{}", reversed)).unwrap();
                    InvocationOutcome::Completed {
                        exit_code: Some(0),
                        stdout: "done\n".to_string(),
                        stderr: String::new(),
                    }
                }
                Behavior::NoOutput => InvocationOutcome::Completed {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                },
                Behavior::Fail(code, stderr) => InvocationOutcome::Completed {
                    exit_code: Some(*code),
                    stdout: "partial\n".to_string(),
                    stderr: stderr.to_string(),
                },
                Behavior::Timeout => InvocationOutcome::TimedOut { after: timeout },
                Behavior::CaptureExceeded => InvocationOutcome::CaptureExceeded {
                    stream: Stream::Stdout,
                    limit: 16,
                },
                Behavior::CollectFailed => InvocationOutcome::CollectFailed {
                    reason: "broken pipe".to_string(),
                },
            }
        }
    }

    fn pipeline_in(dir: &Path, invoker: Arc<RecordingInvoker>) -> Pipeline {
        Pipeline::new(
            invoker,
            PipelineConfig {
                temp_dir: dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_success_returns_output_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = pipeline_in(dir.path(), invoker.clone());

        let output = pipeline
            .run(ObfuscationRequest::new("print('hi')", Preset::Minify))
            .await
            .unwrap();

        assert_eq!(output.obfuscated, "-- obfuscated\n)'ih'(tnirp");
        assert_ne!(output.obfuscated, "print('hi')");
        assert_eq!(output.log, "done\n");
        assert_eq!(invoker.calls(), 1);
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_argument_shape() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = pipeline_in(dir.path(), invoker.clone());

        pipeline
            .run(ObfuscationRequest::new("local a = 1", Preset::RobloxStrong))
            .await
            .unwrap();

        let args = invoker.last_args();
        assert_eq!(args.len(), 5);
        assert_eq!(args[0], "--preset");
        assert_eq!(args[1], "RobloxStrong");
        assert_eq!(args[2], "--out");
        let out = args[3].to_string_lossy().to_string();
        let input = args[4].to_string_lossy().to_string();
        assert!(out.contains("obfusq_output_"));
        assert!(input.contains("obfusq_input_"));
        // Same token in both names
        assert_eq!(
            out.replace("obfusq_output_", ""),
            input.replace("obfusq_input_", "")
        );
    }

    #[tokio::test]
    async fn test_config_file_selection() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = pipeline_in(dir.path(), invoker.clone());

        let selection = PresetSelection::ConfigFile(PathBuf::from("/srv/obfusq/custom.lua"));
        pipeline
            .run(ObfuscationRequest::new("local a = 1", selection))
            .await
            .unwrap();

        let args = invoker.last_args();
        assert_eq!(args[0], "--config");
        assert_eq!(args[1], "/srv/obfusq/custom.lua");
    }

    #[tokio::test]
    async fn test_empty_source_never_invokes() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = pipeline_in(dir.path(), invoker.clone());

        for source in ["", "   ", "\n\t\n"] {
            let err = pipeline
                .run(ObfuscationRequest::new(source, Preset::Minify))
                .await
                .unwrap_err();
            assert!(matches!(err, ObfuscationError::EmptySource));
            assert!(err.is_validation());
        }

        assert_eq!(invoker.calls(), 0);
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_oversized_source_rejected() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = Pipeline::new(
            invoker.clone(),
            PipelineConfig {
                temp_dir: dir.path().to_path_buf(),
                max_source_bytes: 8,
                ..Default::default()
            },
        );

        let err = pipeline
            .run(ObfuscationRequest::new("print('too long')", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::PayloadTooLarge { limit: 8 }));
        assert_eq!(invoker.calls(), 0);
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn test_from_client_validation() {
        let ok = ObfuscationRequest::from_client(Some("print(1)".into()), Some("RobloxLight")).unwrap();
        assert_eq!(ok.selection, PresetSelection::Named(Preset::RobloxLight));

        let missing_code = ObfuscationRequest::from_client(None, Some("Minify")).unwrap_err();
        assert!(matches!(missing_code, ObfuscationError::EmptySource));

        let empty_code = ObfuscationRequest::from_client(Some(String::new()), Some("Minify")).unwrap_err();
        assert!(matches!(empty_code, ObfuscationError::EmptySource));

        let missing_preset = ObfuscationRequest::from_client(Some("x".into()), None).unwrap_err();
        assert!(matches!(missing_preset, ObfuscationError::InvalidPreset(_)));

        let bad_preset =
            ObfuscationRequest::from_client(Some("x".into()), Some("/etc/obfusq.lua")).unwrap_err();
        assert!(matches!(bad_preset, ObfuscationError::InvalidPreset(ref p) if p == "/etc/obfusq.lua"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_stderr() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Fail(1, "lua: input:1: unexpected symbol\n"));
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("print(", Preset::Minify))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "lua: input:1: unexpected symbol");
        assert!(!err.is_validation());
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_without_stderr() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Fail(4, ""));
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("print(1)", Preset::Minify))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Obfuscator exited with status 4");
    }

    #[tokio::test]
    async fn test_zero_exit_without_output_is_error() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::NoOutput);
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("print(1)", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::MissingOutput));
        assert_eq!(err.to_string(), "Output file not created");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_timeout_cleans_up() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Timeout);
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("while true do end", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::Timeout(d) if d == DEFAULT_TIMEOUT));
        assert_eq!(err.to_string(), "Obfuscation timeout");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_capture_overflow_is_error() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::CaptureExceeded);
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("print(1)", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ObfuscationError::CaptureExceeded {
                stream: Stream::Stdout,
                limit: 16
            }
        ));
        assert!(!err.is_validation());
        assert_eq!(err.to_string(), "Obfuscator stdout exceeded the 16 byte capture limit");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_collect_failure_is_not_a_launch_failure() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::CollectFailed);
        let pipeline = pipeline_in(dir.path(), invoker);

        let err = pipeline
            .run(ObfuscationRequest::new("print(1)", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::Collect(_)));
        assert_eq!(err.to_string(), "Failed to collect obfuscator output: broken pipe");
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn test_progress_fail_is_terminal() {
        let mut progress = Progress::new();
        progress.advance(Stage::Validating);
        progress.advance(Stage::Invoking);

        assert_eq!(progress.fail(), Stage::Invoking);
        assert_eq!(progress.stage, Stage::Failed);
        assert_eq!(Stage::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn test_write_failure_skips_invocation() {
        let dir = TempDir::new().unwrap();
        let invoker = RecordingInvoker::new(Behavior::Reverse);
        let pipeline = pipeline_in(&dir.path().join("does-not-exist"), invoker.clone());

        let err = pipeline
            .run(ObfuscationRequest::new("print(1)", Preset::Minify))
            .await
            .unwrap_err();
        assert!(matches!(err, ObfuscationError::WriteInput(_)));
        assert_eq!(invoker.calls(), 0);
    }

    #[test]
    fn test_result_serialization() {
        let ok: ObfuscationResult = ObfuscationOutput {
            obfuscated: "x".to_string(),
            log: String::new(),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"success": true, "obfuscated": "x"})
        );

        let failed = ObfuscationResult::from(&ObfuscationError::MissingOutput);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"success": false, "error": "Output file not created"})
        );
    }
}
