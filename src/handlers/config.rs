use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the settings clients need to behave well.
///
/// Budgets, recognition defaults and the singing detector tuning. Secrets and
/// the upstream endpoint are never exposed.
pub async fn get_public_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "limits": {
                "max_session_duration_ms": config.limits.max_session_duration_ms,
                "idle_timeout_ms": config.limits.idle_timeout_ms,
                "max_bytes_per_session": config.limits.max_bytes_per_session,
                "max_frame_bytes": config.limits.max_frame_bytes
            },
            "audio": {
                "encoding": config.upstream.encoding,
                "sample_rate_hertz": config.upstream.sample_rate_hertz,
                "language_code": config.upstream.language_code,
                "alternative_language_codes": config.upstream.alternative_language_codes,
                "interim_results": config.upstream.interim_results
            },
            "detector": serde_json::to_value(&config.detector)?
        }
    })))
}
