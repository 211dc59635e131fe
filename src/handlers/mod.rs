pub mod transcriptions;

pub use transcriptions::*;

use crate::health;
use actix_web::web;

/// Register every HTTP route on an app.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/v1/audio/transcriptions", web::post().to(create_transcription));
}
