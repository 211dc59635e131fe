//! # Whisper Model Loading
//!
//! Resolves a model identifier to files on disk and loads them with Candle-rs.
//!
//! ## Model Identifiers:
//! - **Short names**: `tiny`, `base`, `small`, `medium`, `large-v3`, `*.en`, ...
//!   map to the matching `openai/whisper-*` repository
//! - **Local directories**: a directory holding `config.json`,
//!   `tokenizer.json` and `model.safetensors` is loaded as-is
//! - **Anything else**: treated as a HuggingFace repository id
//!
//! ## Loading Process:
//! 1. Resolve the identifier
//! 2. Download model files from HuggingFace if not cached locally
//! 3. Load configuration, tokenizer and weights in the requested precision
//! 4. Build the mel filter bank and decoding tables for the model

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use super::decoder::{suppression_mask, SpecialTokens};
use super::device::device_label;
use crate::audio::mel;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Vocabulary size of multilingual checkpoints; English-only ones are smaller.
const MULTILINGUAL_VOCAB_SIZE: usize = 51865;

/// Short model names and their HuggingFace repositories.
const SHORT_NAMES: &[(&str, &str)] = &[
    ("tiny", "openai/whisper-tiny"),
    ("tiny.en", "openai/whisper-tiny.en"),
    ("base", "openai/whisper-base"),
    ("base.en", "openai/whisper-base.en"),
    ("small", "openai/whisper-small"),
    ("small.en", "openai/whisper-small.en"),
    ("medium", "openai/whisper-medium"),
    ("medium.en", "openai/whisper-medium.en"),
    ("large-v1", "openai/whisper-large"),
    ("large-v2", "openai/whisper-large-v2"),
    ("large-v3", "openai/whisper-large-v3"),
    ("large", "openai/whisper-large-v3"),
    ("large-v3-turbo", "openai/whisper-large-v3-turbo"),
    ("turbo", "openai/whisper-large-v3-turbo"),
    ("distil-large-v3", "distil-whisper/distil-large-v3"),
];

/// Where a model's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl ModelSource {
    /// Resolve a model identifier.
    pub fn resolve(model_id: &str) -> Self {
        let model_id = model_id.trim();
        let path = Path::new(model_id);
        if path.is_dir() {
            return ModelSource::Local(path.to_path_buf());
        }
        match SHORT_NAMES.iter().find(|(name, _)| *name == model_id) {
            Some((_, repo)) => ModelSource::Hub(repo.to_string()),
            None => ModelSource::Hub(model_id.to_string()),
        }
    }

    /// Locate (downloading if needed) the files this source provides.
    pub async fn fetch(&self) -> Result<ModelFiles> {
        match self {
            ModelSource::Local(dir) => ModelFiles::in_dir(dir),
            ModelSource::Hub(repo) => download(repo).await,
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
            ModelSource::Hub(repo) => write!(f, "hf://{}", repo),
        }
    }
}

/// Paths of the three files a Whisper checkpoint needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> Result<Self> {
        let files = Self {
            config: dir.join(CONFIG_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
            weights: dir.join(WEIGHTS_FILE),
        };
        for path in [&files.config, &files.tokenizer, &files.weights] {
            if !path.is_file() {
                return Err(anyhow!("Model file missing: {}", path.display()));
            }
        }
        Ok(files)
    }
}

async fn download(repo_id: &str) -> Result<ModelFiles> {
    use hf_hub::api::tokio::ApiBuilder;

    tracing::debug!("  HF_ENDPOINT: {:?}", std::env::var("HF_ENDPOINT"));
    tracing::debug!("  HF_TOKEN: {:?}", std::env::var("HF_TOKEN").map(|_| "***SET***"));

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }
    let api = builder
        .build()
        .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))?;

    tracing::info!("Fetching model files from {}", repo_id);
    let repo = api.model(repo_id.to_string());

    Ok(ModelFiles {
        config: fetch_file(&repo, repo_id, CONFIG_FILE).await?,
        tokenizer: fetch_file(&repo, repo_id, TOKENIZER_FILE).await?,
        weights: fetch_file(&repo, repo_id, WEIGHTS_FILE).await?,
    })
}

async fn fetch_file(repo: &hf_hub::api::tokio::ApiRepo, repo_id: &str, file: &str) -> Result<PathBuf> {
    let path = repo
        .get(file)
        .await
        .map_err(|e| anyhow!("Failed to download {} from {}: {}", file, repo_id, e))?;
    tracing::debug!("{} -> {:?}", file, path);
    Ok(path)
}

/// A loaded Whisper model with everything decoding needs.
pub struct LoadedModel {
    pub model: m::model::Whisper,
    pub config: Config,
    pub tokenizer: Tokenizer,
    pub special: SpecialTokens,
    /// Additive logit mask: 0 for allowed tokens, -inf for suppressed ones
    pub suppress: Vec<f32>,
    pub mel_filters: Vec<f32>,
    pub device: Device,
    pub dtype: DType,
}

impl LoadedModel {
    pub fn load(files: &ModelFiles, device: Device, dtype: DType) -> Result<Self> {
        let start_time = std::time::Instant::now();

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("opening {}", files.config.display()))?,
        )
        .context("parsing model config")?;
        tracing::debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let special = SpecialTokens::from_tokenizer(&tokenizer)?;
        let suppress = suppression_mask(config.vocab_size, &config.suppress_tokens, &special);
        let mel_filters = mel::filter_bank(config.num_mel_bins);

        tracing::info!(
            "Whisper model loaded on {} ({:?}) in {:.2}s",
            device_label(&device),
            dtype,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            special,
            suppress,
            mel_filters,
            device,
            dtype,
        })
    }

    /// Whether the checkpoint understands language and task tokens.
    pub fn is_multilingual(&self) -> bool {
        self.config.vocab_size >= MULTILINGUAL_VOCAB_SIZE
    }
}
