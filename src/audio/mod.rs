//! # Audio Preparation Module
//!
//! Everything that happens to an audio file before it is uploaded to the
//! doorbell middleware.
//!
//! ## Key Components:
//! - **Format**: The device's fixed wire format and a RIFF/WAVE header probe
//! - **Transcoder**: Runs the external conversion tool and owns the
//!   temporary output file
//!
//! ## Device Audio Format:
//! - **Encoding**: G.711 µ-law (8-bit)
//! - **Sample Rate**: 8kHz (8,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Container**: WAV
//!
//! Files that already carry the `.wav` extension skip conversion and are
//! uploaded unchanged.

pub mod format;
pub mod transcoder;

pub use transcoder::{AudioTranscoder, FfmpegTranscoder, TranscodeJob};
