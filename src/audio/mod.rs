//! # Audio Processing Module
//!
//! Turns an uploaded audio file into what the Whisper encoder consumes.
//! This is the model runtime's side of the boundary: the HTTP layer hands
//! over a file path and never touches samples.
//!
//! ## Key Components:
//! - **Decoding**: any container/codec symphonia understands, mixed to mono
//!   and resampled to 16kHz (`decode.rs`)
//! - **Voice activity**: energy-based speech detection used to drop silence
//!   before decoding (`vad.rs`)
//! - **Mel filters**: filter bank for the log-mel spectrogram (`mel.rs`)
//!
//! ## Audio Format Produced:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono
//! - **Encoding**: 32-bit float in `[-1.0, 1.0]`

pub mod decode;
pub mod mel;
pub mod vad;

/// Sample rate Whisper models expect.
pub const SAMPLE_RATE: u32 = 16_000;

/// Convert a sample count at [`SAMPLE_RATE`] to seconds.
pub fn samples_to_seconds(samples: usize) -> f64 {
    samples as f64 / SAMPLE_RATE as f64
}
