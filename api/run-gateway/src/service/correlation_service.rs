use axum::http::HeaderMap;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// `req_<unix_millis>_<9 lowercase alphanumerics>`
pub fn generate_correlation_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("req_{}_{suffix}", Utc::now().timestamp_millis())
}

pub fn correlation_id_from(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(ToOwned::to_owned)
        .unwrap_or_else(generate_correlation_id)
}
