//! # Transcription Module
//!
//! Speech-to-text for uploaded audio files, using Whisper models run by
//! Candle-rs.
//!
//! ## Key Components:
//! - **SpeechModel**: the seam between the HTTP layer and inference. Request
//!   handlers only see this trait, so tests can swap in a fake model.
//! - **WhisperEngine**: the production implementation (`engine.rs`)
//! - **Model loading**: identifier resolution, download and weights (`model.rs`)
//! - **Decoding**: windowed beam search producing segments lazily (`decoder.rs`)
//!
//! ## Segments are lazy
//! [`SpeechModel::transcribe`] returns immediately after the audio has been
//! decoded and the language settled. Each call to `next()` on
//! [`Transcription::segments`] decodes one more 30-second window. The
//! sequence is single-pass and finite; its order is the order of speech in
//! the file.

pub mod decoder;
pub mod device;
pub mod engine;
pub mod languages;
pub mod model;

use anyhow::Result;
use std::path::Path;

pub use engine::WhisperEngine;

/// Options for one transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    /// Language code such as `"ko"`; `None` detects it from the audio
    pub language: Option<String>,

    /// Text placed before the audio's own transcript to bias recognition
    pub initial_prompt: Option<String>,

    /// Beam-search width (1 is greedy decoding)
    pub beam_size: usize,

    /// Skip non-speech audio before decoding
    pub vad_filter: bool,

    /// Feed each window's text to the next window as prompt
    pub condition_on_previous_text: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            initial_prompt: None,
            beam_size: 5,
            vad_filter: false,
            condition_on_previous_text: true,
        }
    }
}

/// A contiguous span of recognised speech.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: usize,
    /// Start time in seconds, relative to the original audio
    pub start: f64,
    /// End time in seconds, relative to the original audio
    pub end: f64,
    /// Decoded text, including any leading space the tokenizer produced
    pub text: String,
    pub tokens: Vec<u32>,
    pub avg_logprob: f32,
    pub no_speech_prob: f32,
}

/// Summary known before any segment is decoded.
#[derive(Debug, Clone)]
pub struct TranscriptionInfo {
    /// Language the audio was decoded as (given or detected)
    pub language: String,
    /// Probability of `language`; 1.0 when it was given by the caller
    pub language_probability: f32,
    /// Duration of the whole audio file in seconds
    pub duration: f64,
    /// Duration of the audio left after voice-activity filtering
    pub duration_after_vad: f64,
}

/// Result of [`SpeechModel::transcribe`]: summary plus lazily decoded segments.
pub struct Transcription<'a> {
    pub info: TranscriptionInfo,
    pub segments: Box<dyn Iterator<Item = Result<Segment>> + 'a>,
}

impl<'a> Transcription<'a> {
    /// Drain the segments and join their text in emission order, with no
    /// separator, trimming the result.
    pub fn collect_text(self) -> Result<String> {
        let text = self
            .segments
            .map(|segment| segment.map(|s| s.text))
            .collect::<Result<String>>()?;
        Ok(text.trim().to_string())
    }
}

/// A loaded speech-recognition model.
///
/// Implementations are created once at startup and shared by all requests,
/// so they must be safe to call from several threads at once.
pub trait SpeechModel: Send + Sync {
    /// Identifier the model was loaded from.
    fn model_id(&self) -> &str;

    /// Transcribe the audio file at `audio_path`.
    ///
    /// Blocking: callers on an async runtime should run this on a blocking
    /// thread. The file only needs to exist until this call returns.
    fn transcribe<'a>(
        &'a self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcription<'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: usize, text: &str) -> Result<Segment> {
        Ok(Segment {
            id,
            start: id as f64,
            end: id as f64 + 1.0,
            text: text.to_string(),
            tokens: Vec::new(),
            avg_logprob: -0.1,
            no_speech_prob: 0.0,
        })
    }

    fn info() -> TranscriptionInfo {
        TranscriptionInfo {
            language: "en".to_string(),
            language_probability: 1.0,
            duration: 2.0,
            duration_after_vad: 2.0,
        }
    }

    #[test]
    fn test_collect_text_joins_in_order_and_trims() {
        let transcription = Transcription {
            info: info(),
            segments: Box::new(vec![segment(0, " Hello "), segment(1, "world ")].into_iter()),
        };
        assert_eq!(transcription.collect_text().unwrap(), "Hello world");
    }

    #[test]
    fn test_collect_text_without_segments_is_empty() {
        let transcription = Transcription {
            info: info(),
            segments: Box::new(std::iter::empty()),
        };
        assert_eq!(transcription.collect_text().unwrap(), "");
    }

    #[test]
    fn test_collect_text_propagates_segment_errors() {
        let transcription = Transcription {
            info: info(),
            segments: Box::new(
                vec![segment(0, "Hello"), Err(anyhow::anyhow!("decoder failed"))].into_iter(),
            ),
        };
        assert!(transcription.collect_text().is_err());
    }
}
