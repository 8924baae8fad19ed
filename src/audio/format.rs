//! # Device Audio Format
//!
//! Constants describing what the doorbell accepts, plus a small RIFF/WAVE
//! header reader used to sanity-check files that bypass the transcoder.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Container extension the device accepts as-is.
pub const TARGET_EXTENSION: &str = "wav";

/// ffmpeg codec name for G.711 µ-law.
pub const TARGET_CODEC: &str = "pcm_mulaw";

pub const TARGET_SAMPLE_RATE: u32 = 8000;

pub const TARGET_CHANNELS: u16 = 1;

/// WAVE_FORMAT_MULAW from the RIFF registry.
pub const WAVE_FORMAT_MULAW: u16 = 0x0007;

/// Whether a file must go through the transcoder before upload.
///
/// Only the extension is checked (case-insensitive). Files without an
/// extension are always converted.
pub fn needs_transcoding(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => !ext.eq_ignore_ascii_case(TARGET_EXTENSION),
        None => true,
    }
}

/// Fields of a WAVE `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// True when the file is already 8 kHz mono µ-law.
    pub fn is_device_native(&self) -> bool {
        self.audio_format == WAVE_FORMAT_MULAW
            && self.channels == TARGET_CHANNELS
            && self.sample_rate == TARGET_SAMPLE_RATE
    }
}

/// Read the `fmt ` chunk of a RIFF/WAVE buffer.
///
/// ## Returns:
/// - **Some(format)**: The buffer starts with a well-formed RIFF/WAVE header
/// - **None**: Not a WAVE file, or the header is truncated
pub fn probe_wav(data: &[u8]) -> Option<WavFormat> {
    let mut cursor = Cursor::new(data);

    let mut tag = [0u8; 4];
    cursor.read_exact(&mut tag).ok()?;
    if &tag != b"RIFF" {
        return None;
    }
    let _riff_size = cursor.read_u32::<LittleEndian>().ok()?;
    cursor.read_exact(&mut tag).ok()?;
    if &tag != b"WAVE" {
        return None;
    }

    // Walk chunks until "fmt " shows up; LIST/JUNK chunks may precede it.
    loop {
        cursor.read_exact(&mut tag).ok()?;
        let chunk_size = cursor.read_u32::<LittleEndian>().ok()?;

        if &tag == b"fmt " {
            if chunk_size < 16 {
                return None;
            }
            let audio_format = cursor.read_u16::<LittleEndian>().ok()?;
            let channels = cursor.read_u16::<LittleEndian>().ok()?;
            let sample_rate = cursor.read_u32::<LittleEndian>().ok()?;
            let _byte_rate = cursor.read_u32::<LittleEndian>().ok()?;
            let _block_align = cursor.read_u16::<LittleEndian>().ok()?;
            let bits_per_sample = cursor.read_u16::<LittleEndian>().ok()?;

            return Some(WavFormat {
                audio_format,
                channels,
                sample_rate,
                bits_per_sample,
            });
        }

        // Chunks are padded to an even length.
        let skip = chunk_size as i64 + (chunk_size as i64 & 1);
        cursor.seek(SeekFrom::Current(skip)).ok()?;
        if cursor.position() as usize >= data.len() {
            return None;
        }
    }
}

#[cfg(test)]
pub(crate) fn wav_header(audio_format: u16, channels: u16, sample_rate: u32, bits: u16) -> Vec<u8> {
    let block_align = channels * bits / 8;
    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&36u32.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&audio_format.to_le_bytes());
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&0u32.to_le_bytes());
    header
}
