//! # Application State
//!
//! State shared by every request handler through `web::Data<AppState>`.
//!
//! Everything here is created once in `main` and never mutated afterwards:
//! - the configuration (`Arc<AppConfig>`)
//! - the speech model handle (`Option<Arc<dyn SpeechModel>>`); `None` means
//!   the model is not ready and transcription requests get a 503
//! - an optional observer for scratch-file cleanup failures
//!
//! Handlers receive the model through this struct instead of a global, so
//! tests can inject a fake model or none at all.
//!
//! ## Sharing Pattern:
//! - **`web::Data<AppState>`**: actix wraps the state in its own `Arc`, and
//!   every worker thread gets a handle to it
//! - **`Arc<AppConfig>`**: read-only, so no lock is needed
//! - **`Arc<dyn SpeechModel>`**: the trait object hides which runtime is
//!   loaded; the model serialises its own mutable decoding state internally
//! - **`Clone`**: cloning the state only bumps reference counts, which is
//!   what `HttpServer::new` does once per worker
//!
//! ## Building State:
//! ```rust
//! let state = AppState::new(config)
//!     .with_model(Arc::new(engine))
//!     .with_cleanup_observer(Arc::new(|path, err| {
//!         eprintln!("could not remove {:?}: {}", path, err);
//!     }));
//! ```

use crate::config::AppConfig;
use crate::scratch::CleanupObserver;
use crate::transcription::SpeechModel;
use std::sync::Arc;

/// Shared, read-only state for request handlers.
///
/// ## Fields:
/// - `config`: startup configuration, public because handlers read it freely
/// - `model`: the speech model, reached through [`AppState::model`]
/// - `cleanup_observer`: told about scratch files that could not be removed
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    model: Option<Arc<dyn SpeechModel>>,
    cleanup_observer: Option<CleanupObserver>,
}

impl AppState {
    /// State with no model loaded yet.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            model: None,
            cleanup_observer: None,
        }
    }

    /// Attach the speech model. After this, transcription requests are
    /// served instead of answered with 503.
    pub fn with_model(mut self, model: Arc<dyn SpeechModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Install a hook that is called whenever a request's scratch file
    /// cannot be deleted.
    ///
    /// The hook runs on the blocking thread that handled the upload, after
    /// the failure has been logged. The client response is unaffected.
    pub fn with_cleanup_observer(mut self, observer: CleanupObserver) -> Self {
        self.cleanup_observer = Some(observer);
        self
    }

    /// The loaded model, or `None` if it is not ready.
    pub fn model(&self) -> Option<Arc<dyn SpeechModel>> {
        self.model.clone()
    }

    /// The installed cleanup hook, handed to each request's scratch file.
    pub fn cleanup_observer(&self) -> Option<CleanupObserver> {
        self.cleanup_observer.clone()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("model", &self.model.as_ref().map(|m| m.model_id().to_string()))
            .field("cleanup_observer", &self.cleanup_observer.is_some())
            .finish()
    }
}
