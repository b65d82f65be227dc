//! Temporary file pairs
//!
//! The external obfuscator only speaks files: it reads the script from an
//! input path and writes its result to an output path. Each request gets
//! its own pair, named from a random UUID so concurrent requests never
//! share a path. The pair removes both files when cleaned up or dropped.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use uuid::Uuid;

const INPUT_PREFIX: &str = "obfusq_input_";
const OUTPUT_PREFIX: &str = "obfusq_output_";

/// Input/output paths owned by a single request
#[derive(Debug)]
pub struct TempFilePair {
    token: String,
    input_path: PathBuf,
    output_path: PathBuf,
    cleaned: bool,
}

impl TempFilePair {
    /// Allocate a fresh pair of paths in `dir`. No files are created yet.
    pub fn allocate(dir: &Path, extension: &str) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let extension = extension.trim_start_matches('.');
        let file_name = |prefix: &str| {
            if extension.is_empty() {
                format!("{}{}", prefix, token)
            } else {
                format!("{}{}.{}", prefix, token, extension)
            }
        };

        Self {
            input_path: dir.join(file_name(INPUT_PREFIX)),
            output_path: dir.join(file_name(OUTPUT_PREFIX)),
            token,
            cleaned: false,
        }
    }

    /// Random token shared by both file names
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Write the script verbatim to the input path
    pub async fn write_input(&self, text: &str) -> io::Result<()> {
        tokio::fs::write(&self.input_path, text).await
    }

    /// Whether the tool produced an output file
    pub async fn output_exists(&self) -> io::Result<bool> {
        tokio::fs::try_exists(&self.output_path).await
    }

    /// Read the output file as UTF-8 text, refusing anything over `limit` bytes
    pub async fn read_output(&self, limit: usize) -> io::Result<String> {
        let file = tokio::fs::File::open(&self.output_path).await?;
        let mut bytes = Vec::new();
        file.take((limit as u64).saturating_add(1)).read_to_end(&mut bytes).await?;

        if bytes.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("output exceeds {} bytes", limit),
            ));
        }

        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Remove both files. Missing files are fine; other failures are logged.
    ///
    /// Runs at most once per pair; `Drop` calls it too, so every exit path
    /// (early return, panic, cancelled future) releases the files.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        for path in [&self.input_path, &self.output_path] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::trace!("Removed temp file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }
    }

    /// Whether cleanup has already run
    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }
}

impl Drop for TempFilePair {
    fn drop(&mut self) {
        self.cleanup();
    }
}
