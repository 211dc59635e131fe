//! # Transcription Engine
//!
//! The production [`SpeechModel`]: a Whisper checkpoint loaded once at
//! startup and shared by every request.
//!
//! ## Key Responsibilities:
//! - **Loading**: resolve device, precision and model files, then load the
//!   weights off the async runtime
//! - **Preprocessing**: decode the file, optionally drop non-speech audio,
//!   compute the log-mel spectrogram
//! - **Language**: use the requested language or detect it
//! - **Decoding**: hand a lazy [`SegmentStream`] back to the caller
//!
//! ## Thread Safety:
//! Decoding mutates the model's attention caches, so the model sits behind a
//! `Mutex`. Concurrent requests are safe and take turns at the model; the
//! lock is held until the returned segments are drained or dropped.

use anyhow::{anyhow, Result};
use candle_core::Tensor;
use candle_transformers::models::whisper::{self as m, audio};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::decoder::{detect_language, SegmentStream, StreamSettings};
use super::device::{parse_compute_type, DevicePreference};
use super::languages;
use super::model::{LoadedModel, ModelSource};
use super::{SpeechModel, TranscribeOptions, Transcription, TranscriptionInfo};
use crate::audio::decode::decode_file;
use crate::audio::samples_to_seconds;
use crate::audio::vad::{collect_chunks, speech_chunks, SpeechTimeline, VadOptions};
use crate::config::AsrConfig;

/// Whisper speech model shared across requests.
pub struct WhisperEngine {
    /// Identifier the model was loaded from, as configured
    model_id: String,
    model: Mutex<LoadedModel>,
    vad_options: VadOptions,
}

impl WhisperEngine {
    /// Load the model described by `config`.
    ///
    /// Fails if the device is unavailable, the compute type is unsupported
    /// or the model files cannot be fetched or loaded.
    pub async fn load(config: &AsrConfig) -> Result<Self> {
        let device = config.device.parse::<DevicePreference>()?.create()?;
        let dtype = parse_compute_type(&config.compute_type, &device)?;

        let source = ModelSource::resolve(&config.model_id);
        info!("Loading Whisper model {} ({})...", config.model_id, source);
        let files = source.fetch().await?;

        let model =
            tokio::task::spawn_blocking(move || LoadedModel::load(&files, device, dtype)).await??;

        Ok(Self {
            model_id: config.model_id.clone(),
            model: Mutex::new(model),
            vad_options: VadOptions::default(),
        })
    }
}

/// Settle the decoding language before any audio is looked at.
///
/// Returns `Some(code)` when the language is fixed and `None` when it has
/// to be detected. English-only checkpoints always decode English.
fn settle_language(requested: Option<&str>, multilingual: bool) -> Result<Option<&'static str>> {
    if !multilingual {
        return Ok(Some("en"));
    }
    match requested.map(str::trim).filter(|l| !l.is_empty()) {
        Some(language) => languages::normalize(language)
            .map(Some)
            .ok_or_else(|| anyhow!("Unsupported language: {}", language)),
        None => Ok(None),
    }
}

impl SpeechModel for WhisperEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn transcribe<'a>(
        &'a self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcription<'a>> {
        let samples = decode_file(audio_path)?;
        let duration = samples_to_seconds(samples.len());

        let (samples, timeline) = if options.vad_filter {
            let chunks = speech_chunks(&samples, &self.vad_options);
            debug!("VAD kept {} speech chunks", chunks.len());
            (collect_chunks(&samples, &chunks), SpeechTimeline::from_chunks(&chunks))
        } else {
            let len = samples.len();
            (samples, SpeechTimeline::identity(len))
        };
        let duration_after_vad = samples_to_seconds(samples.len());

        let mut model = self.model.lock().unwrap_or_else(|poisoned| {
            warn!("Whisper model lock was poisoned; continuing");
            PoisonError::into_inner(poisoned)
        });

        let n_mels = model.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&model.config, samples.as_slice(), model.mel_filters.as_slice());
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &model.device)?
            .to_dtype(model.dtype)?;
        let content_frames = samples.len() / m::HOP_LENGTH;

        let (language, language_probability) =
            match settle_language(options.language.as_deref(), model.is_multilingual())? {
                Some(code) => (code, 1.0),
                None => {
                    let (code, probability) = detect_language(&mut model, &mel)?;
                    info!("Detected language '{}' with probability {:.2}", code, probability);
                    (code, probability)
                }
            };

        let task_tokens = if model.is_multilingual() {
            let language_token = model
                .special
                .language(language)
                .ok_or_else(|| anyhow!("Model has no token for language '{}'", language))?;
            vec![language_token, model.special.transcribe]
        } else {
            Vec::new()
        };

        let prompt_tokens = match options.initial_prompt.as_deref().map(str::trim) {
            Some(prompt) if !prompt.is_empty() => model
                .tokenizer
                .encode(format!(" {}", prompt), false)
                .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?
                .get_ids()
                .to_vec(),
            _ => Vec::new(),
        };

        info!(
            "Transcribing {:.2}s of audio ({:.2}s after VAD), language={}, beam_size={}",
            duration, duration_after_vad, language, options.beam_size
        );

        let settings = StreamSettings {
            task_tokens,
            prompt_tokens,
            beam_size: options.beam_size.max(1),
            condition_on_previous_text: options.condition_on_previous_text,
        };

        Ok(Transcription {
            info: TranscriptionInfo {
                language: language.to_string(),
                language_probability,
                duration,
                duration_after_vad,
            },
            segments: Box::new(SegmentStream::new(
                model,
                mel,
                content_frames,
                settings,
                timeline,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_language_is_used() {
        assert_eq!(settle_language(Some("ko"), true).unwrap(), Some("ko"));
        assert_eq!(settle_language(Some(" Korean "), true).unwrap(), Some("ko"));
    }

    #[test]
    fn test_missing_or_blank_language_is_detected() {
        assert_eq!(settle_language(None, true).unwrap(), None);
        assert_eq!(settle_language(Some("  "), true).unwrap(), None);
    }

    #[test]
    fn test_english_only_models_ignore_requested_language() {
        assert_eq!(settle_language(Some("ko"), false).unwrap(), Some("en"));
        assert_eq!(settle_language(None, false).unwrap(), Some("en"));
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        assert!(settle_language(Some("xx"), true).is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_device() {
        let mut config = crate::config::AppConfig::default().asr;
        config.device = "tpu".to_string();
        assert!(WhisperEngine::load(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_integer_compute_type() {
        let mut config = crate::config::AppConfig::default().asr;
        config.device = "cpu".to_string();
        config.compute_type = "int8".to_string();
        assert!(WhisperEngine::load(&config).await.is_err());
    }
}
