//! # Transcription API Handler
//!
//! `POST /v1/audio/transcriptions`, compatible with the OpenAI-style
//! transcription endpoint.
//!
//! ## Request:
//! Multipart form data with fields:
//! - `file` (required): the audio upload, any format the runtime can decode
//! - `model` (optional): echoed back in the response; does not select a model
//! - `language` (optional): overrides the configured default language
//! - `prompt` (optional): text that biases recognition
//! - `response_format` (optional, default `json`): `text` or anything else
//!
//! ## Response:
//! `response_format=text`:
//! ```json
//! { "text": "Hello world" }
//! ```
//! otherwise:
//! ```json
//! {
//!   "task": "transcribe",
//!   "language": "ko",
//!   "duration": 3.2,
//!   "text": "Hello world",
//!   "model": "openai/whisper-large-v3"
//! }
//! ```

use crate::error::{AppError, AppResult};
use crate::scratch::{suffix_for, ScratchFile};
use crate::state::AppState;
use crate::transcription::{TranscribeOptions, TranscriptionInfo};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use anyhow::Context;
use futures_util::stream::StreamExt;
use serde::Serialize;

/// Filename assumed when the upload does not declare one.
const DEFAULT_FILENAME: &str = "audio.wav";

#[derive(Debug, Serialize)]
struct TextResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct TranscriptionResponse {
    task: &'static str,
    language: String,
    duration: f64,
    text: String,
    model: String,
}

#[derive(Debug)]
struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

/// Fields of the multipart form. Empty text fields count as absent.
#[derive(Debug, Default)]
struct TranscriptionForm {
    file: Option<Upload>,
    model: Option<String>,
    language: Option<String>,
    prompt: Option<String>,
    response_format: Option<String>,
}

impl TranscriptionForm {
    async fn read(payload: &mut Multipart) -> AppResult<Self> {
        let mut form = Self::default();

        while let Some(item) = payload.next().await {
            let mut field: Field = item?;

            let content_disposition = field.content_disposition().ok_or_else(|| {
                AppError::BadRequest("Missing content disposition".to_string())
            })?;
            let field_name = content_disposition
                .get_name()
                .ok_or_else(|| AppError::BadRequest("Missing field name".to_string()))?
                .to_string();
            let filename = content_disposition.get_filename().map(|s| s.to_string());

            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                bytes.extend_from_slice(&chunk?);
            }

            match field_name.as_str() {
                "file" => form.file = Some(Upload { filename, bytes }),
                "model" => form.model = text_field(&field_name, bytes)?,
                "language" => form.language = text_field(&field_name, bytes)?,
                "prompt" => form.prompt = text_field(&field_name, bytes)?,
                "response_format" => form.response_format = text_field(&field_name, bytes)?,
                other => tracing::debug!("Ignoring unknown form field '{}'", other),
            }
        }

        Ok(form)
    }
}

fn text_field(name: &str, bytes: Vec<u8>) -> AppResult<Option<String>> {
    let value = String::from_utf8(bytes)
        .map_err(|_| AppError::BadRequest(format!("Field '{}' is not valid UTF-8", name)))?;
    Ok(Some(value).filter(|v| !v.trim().is_empty()))
}

/// Transcribe an uploaded audio file.
///
/// The model is checked before the body is read, so a not-ready server
/// answers 503 without touching the filesystem. The scratch file lives only
/// inside the blocking task and is removed when it ends, on success or error.
pub async fn create_transcription(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let model = state
        .model()
        .ok_or_else(|| AppError::ServiceUnavailable("Model not ready".to_string()))?;

    let form = TranscriptionForm::read(&mut payload).await?;
    let upload = form
        .file
        .ok_or_else(|| AppError::ValidationError("Missing required field: file".to_string()))?;

    let config = state.config.clone();
    let language = form.language.unwrap_or_else(|| config.asr.language.clone());
    let options = TranscribeOptions {
        language: Some(language).filter(|l| !l.trim().is_empty()),
        initial_prompt: form.prompt,
        beam_size: config.asr.beam_size,
        vad_filter: true,
        ..Default::default()
    };

    let suffix = suffix_for(Some(upload.filename.as_deref().unwrap_or(DEFAULT_FILENAME)));
    let scratch_dir = config.server.scratch_dir.clone();
    let observer = state.cleanup_observer();

    tracing::info!(
        filename = ?upload.filename,
        bytes = upload.bytes.len(),
        language = ?options.language,
        "Transcription requested"
    );
    let start_time = std::time::Instant::now();

    let (info, text): (TranscriptionInfo, String) = web::block(move || -> anyhow::Result<_> {
        let scratch = ScratchFile::create(scratch_dir.as_deref(), &suffix, &upload.bytes, observer)
            .context("writing upload to scratch file")?;
        let transcription = model.transcribe(scratch.path(), &options)?;
        let info = transcription.info.clone();
        let text = transcription.collect_text()?;
        Ok((info, text))
    })
    .await??;

    tracing::info!(
        "Transcribed {:.2}s of '{}' audio in {:.2}s",
        info.duration,
        info.language,
        start_time.elapsed().as_secs_f64()
    );

    if form.response_format.as_deref() == Some("text") {
        return Ok(HttpResponse::Ok().json(TextResponse { text }));
    }

    Ok(HttpResponse::Ok().json(TranscriptionResponse {
        task: "transcribe",
        language: info.language,
        duration: info.duration,
        text,
        model: form.model.unwrap_or_else(|| config.asr.model_id.clone()),
    }))
}
