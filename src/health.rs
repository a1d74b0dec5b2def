use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "call-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "provider": {
            "model": config.provider.model,
            "streaming": config.provider.stream
        },
        "calls": {
            "active": metrics.active_calls,
            "total": metrics.total_calls
        },
        "turns": {
            "started": metrics.turns_started,
            "completed": metrics.turns_completed,
            "failed": metrics.turns_failed,
            "abandoned": metrics.turns_abandoned
        }
    }))
}
