use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "<redacted>";

/// Effective configuration, with the upstream credential redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut config = serde_json::to_value(state.config())
        .map_err(|e| AppError::ConfigError(format!("Cannot serialize configuration: {}", e)))?;

    if let Some(key) = config.pointer_mut("/upstream/api_key") {
        let configured = key.as_str().map(|k| !k.is_empty()).unwrap_or(false);
        *key = json!(if configured { REDACTED } else { "" });
    }

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}
