use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Liveness check. Reports the configured model id; never touches the model.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "model": state.config.asr.model_id,
    }))
}
