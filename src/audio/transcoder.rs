//! # Audio Transcoder
//!
//! Converts arbitrary input audio into the doorbell's fixed format by running
//! an external tool (ffmpeg) as a subprocess. The relay never decodes audio
//! itself.
//!
//! ## Temporary File Lifecycle:
//! 1. A uniquely named placeholder (`doorbell_XXXX.wav`) is created first
//! 2. The tool overwrites the placeholder in place
//! 3. On failure the placeholder is removed before the error is returned
//! 4. On success the caller receives a [`TranscodeJob`] and owns the file;
//!    dropping or discarding the job deletes it

use crate::audio::format::{TARGET_CHANNELS, TARGET_CODEC, TARGET_EXTENSION, TARGET_SAMPLE_RATE};
use crate::config::TranscoderConfig;
use crate::error::{IntercomError, IntercomResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, error, warn};

const TEMP_PREFIX: &str = "doorbell_";

/// Converts an input file into device-native audio.
///
/// Implemented by [`FfmpegTranscoder`] in production; the session
/// coordinator only depends on this trait.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn convert(&self, input: &Path) -> IntercomResult<TranscodeJob>;
}

/// One finished conversion.
///
/// The output file is deleted when the job is dropped. Call
/// [`TranscodeJob::discard`] to delete it eagerly and get a warning in the
/// logs if deletion fails.
#[derive(Debug)]
pub struct TranscodeJob {
    input: PathBuf,
    output: TempPath,
    exit_status: ExitStatus,
}

impl TranscodeJob {
    pub fn new(input: PathBuf, output: TempPath, exit_status: ExitStatus) -> Self {
        Self {
            input,
            output,
            exit_status,
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    /// Delete the converted file now.
    pub fn discard(self) {
        remove_temp_file(self.output);
    }
}

/// Remove a temporary file, logging instead of failing.
pub(crate) fn remove_temp_file(path: TempPath) {
    let file = path.to_path_buf();
    match path.close() {
        Ok(()) => debug!(path = %file.display(), "Removed temporary audio file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %file.display(),
            error = %err,
            "Failed to delete temporary file"
        ),
    }
}

/// Runs ffmpeg (or a compatible binary) with fixed output parameters.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    temp_dir: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self::new(&config.program, config.temp_dir())
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Command line for one conversion.
    ///
    /// - `-acodec pcm_mulaw`: G.711 µ-law
    /// - `-ar 8000`: 8kHz sample rate
    /// - `-ac 1`: mono
    /// - `-f wav`: WAV container
    /// - `-y`: overwrite the placeholder output file
    pub fn arguments(input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-acodec".into(),
            TARGET_CODEC.into(),
            "-ar".into(),
            TARGET_SAMPLE_RATE.to_string().into(),
            "-ac".into(),
            TARGET_CHANNELS.to_string().into(),
            "-f".into(),
            TARGET_EXTENSION.into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ]
    }

    fn allocate_output(&self) -> IntercomResult<TempPath> {
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{}", TARGET_EXTENSION))
            .tempfile_in(&self.temp_dir)?;
        Ok(file.into_temp_path())
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn convert(&self, input: &Path) -> IntercomResult<TranscodeJob> {
        let output = self.allocate_output()?;
        let args = Self::arguments(input, &output);

        debug!(
            program = %self.program.display(),
            input = %input.display(),
            output = %output.display(),
            "Running transcoder"
        );

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let finished = match result {
            Ok(finished) => finished,
            Err(err) => {
                error!(
                    program = %self.program.display(),
                    error = %err,
                    "Failed to start transcoder"
                );
                remove_temp_file(output);
                return Err(IntercomError::Io(err));
            }
        };

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr).trim().to_string();
            let diagnostics = if stderr.is_empty() {
                format!("transcoder exited with {}", finished.status)
            } else {
                stderr
            };
            error!(
                input = %input.display(),
                status = %finished.status,
                "ffmpeg conversion failed: {}",
                diagnostics
            );
            remove_temp_file(output);
            return Err(IntercomError::Conversion(diagnostics));
        }

        debug!(output = %output.display(), "Audio file converted");
        Ok(TranscodeJob::new(input.to_path_buf(), output, finished.status))
    }
}
