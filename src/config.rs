//! # Configuration Management
//!
//! Loads the process-wide configuration once at startup from:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `asr-server.{toml,yaml,json}` file in the working directory
//! - Environment variables (`ASR_MODEL_ID`, `ASR_DEVICE`, `ASR_COMPUTE_TYPE`,
//!   `ASR_LANGUAGE`, `ASR_BEAM_SIZE`, `ASR_SCRATCH_DIR`, `ASR_HOST`, `ASR_PORT`)
//!
//! Every variable carries the `ASR_` prefix. Bare `HOST` is exported by
//! some shells with the machine's hostname and must not move the listener.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values
//!
//! The resulting [`AppConfig`] is never mutated after startup; it is shared
//! with request handlers through `AppState`.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variables recognised at startup, paired with the config key
/// they override.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("ASR_MODEL_ID", "asr.model_id"),
    ("ASR_DEVICE", "asr.device"),
    ("ASR_COMPUTE_TYPE", "asr.compute_type"),
    ("ASR_LANGUAGE", "asr.language"),
    ("ASR_BEAM_SIZE", "asr.beam_size"),
    ("ASR_SCRATCH_DIR", "server.scratch_dir"),
    ("ASR_HOST", "server.host"),
    ("ASR_PORT", "server.port"),
];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub asr: AsrConfig,
}

/// HTTP listener and scratch storage settings.
///
/// ## Fields:
/// - `host`: address to bind (`0.0.0.0` accepts connections from anywhere)
/// - `port`: TCP port to listen on
/// - `scratch_dir`: where uploaded audio is staged while it is transcribed;
///   `None` means the OS temp directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

/// Speech recognition settings.
///
/// ## Fields:
/// - `model_id`: Hugging Face repo id, short Whisper size name (`large-v3`,
///   `small.en`, ...) or a local model directory
/// - `device`: `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N` or `auto`
/// - `compute_type`: numeric precision of the weights (`float16`, `float32`,
///   `bfloat16`, `default`)
/// - `language`: language used when a request does not name one; empty means
///   detect it from the audio
/// - `beam_size`: beam-search width used for every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub model_id: String,
    pub device: String,
    pub compute_type: String,
    pub language: String,
    pub beam_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                scratch_dir: None,
            },
            asr: AsrConfig {
                model_id: "openai/whisper-large-v3".to_string(),
                device: "cuda".to_string(),
                compute_type: "float16".to_string(),
                language: "ko".to_string(),
                beam_size: 1,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn load() -> AppResult<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load configuration, resolving environment variables through `lookup`.
    ///
    /// ## Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with `asr-server.*` (if it exists)
    /// 3. Override with each variable in [`ENV_OVERRIDES`] that `lookup` finds
    pub fn load_with<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("asr-server").required(false));

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Device and compute type are checked later, when the model is built,
    /// because whether they are usable depends on the machine.
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::ConfigError("Server port cannot be 0".to_string()));
        }

        if self.asr.model_id.trim().is_empty() {
            return Err(AppError::ConfigError("Model identifier cannot be empty".to_string()));
        }

        if self.asr.beam_size == 0 {
            return Err(AppError::ConfigError("Beam size must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(vars: &[(&str, &str)]) -> AppResult<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::load_with(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.asr.model_id, "openai/whisper-large-v3");
        assert_eq!(config.asr.device, "cuda");
        assert_eq!(config.asr.compute_type, "float16");
        assert_eq!(config.asr.language, "ko");
        assert_eq!(config.asr.beam_size, 1);
        assert_eq!(config.server.port, 8000);
        assert!(config.server.scratch_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_environment_uses_defaults() {
        let config = load_from(&[]).unwrap();
        assert_eq!(config.asr.model_id, "openai/whisper-large-v3");
        assert_eq!(config.asr.language, "ko");
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_environment_overrides() {
        let config = load_from(&[
            ("ASR_MODEL_ID", "small.en"),
            ("ASR_DEVICE", "cpu"),
            ("ASR_COMPUTE_TYPE", "float32"),
            ("ASR_LANGUAGE", "en"),
            ("ASR_BEAM_SIZE", "5"),
            ("ASR_SCRATCH_DIR", "/var/tmp/asr"),
            ("ASR_HOST", "127.0.0.1"),
            ("ASR_PORT", "9000"),
        ])
        .unwrap();

        assert_eq!(config.asr.model_id, "small.en");
        assert_eq!(config.asr.device, "cpu");
        assert_eq!(config.asr.compute_type, "float32");
        assert_eq!(config.asr.language, "en");
        assert_eq!(config.asr.beam_size, 5);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.scratch_dir, Some(PathBuf::from("/var/tmp/asr")));
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_unprefixed_host_and_port_are_ignored() {
        let config = load_from(&[("HOST", "workstation.local"), ("PORT", "1234")]).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_non_numeric_beam_size_is_rejected() {
        let err = load_from(&[("ASR_BEAM_SIZE", "wide")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.asr.beam_size = 0;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));

        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.asr.model_id = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
