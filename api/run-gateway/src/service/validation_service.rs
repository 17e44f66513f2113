use crate::module::run::error::AppError;
use crate::module::run::schema::CreateRunRequest;
use axum::http::HeaderMap;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

const MAX_NAME_LEN: usize = 128;
const MAX_KEY_LEN: usize = 128;
const MAX_TAGS: usize = 32;
const MAX_TAG_KEY_LEN: usize = 64;
const MAX_TAG_VALUE_LEN: usize = 256;

/// Size check happens before any parsing so oversized bodies cost nothing.
pub fn parse_create_request(body: &[u8], max_body_bytes: usize) -> Result<CreateRunRequest, AppError> {
    if body.len() > max_body_bytes {
        return Err(AppError::payload_too_large(
            "PAYLOAD_TOO_LARGE",
            format!("request body is {} bytes; limit is {max_body_bytes}", body.len()),
        ));
    }
    let req = serde_json::from_slice::<CreateRunRequest>(body)
        .map_err(|e| AppError::bad_request("INVALID_REQUEST_BODY", format!("invalid JSON body: {e}")))?;
    validate_create_request(&req)?;
    Ok(req)
}

pub fn validate_create_request(req: &CreateRunRequest) -> Result<(), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("INVALID_NAME", "name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN || name.chars().any(char::is_control) {
        return Err(AppError::bad_request(
            "INVALID_NAME",
            format!("name must be at most {MAX_NAME_LEN} printable characters"),
        ));
    }
    if req.input.is_null() {
        return Err(AppError::bad_request("INVALID_REQUEST_BODY", "input is required"));
    }
    if let Some(token) = &req.client_token {
        if !is_valid_key(token) {
            return Err(AppError::bad_request(
                "INVALID_CLIENT_TOKEN",
                format!("client_token must be 1-{MAX_KEY_LEN} chars of [A-Za-z0-9_-]"),
            ));
        }
    }
    if let Some(tags) = &req.tags {
        if tags.len() > MAX_TAGS {
            return Err(AppError::bad_request(
                "INVALID_TAGS",
                format!("at most {MAX_TAGS} tags are allowed"),
            ));
        }
        for (key, value) in tags {
            let key_ok = !key.is_empty()
                && key.len() <= MAX_TAG_KEY_LEN
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !key_ok || value.chars().count() > MAX_TAG_VALUE_LEN {
                return Err(AppError::bad_request(
                    "INVALID_TAGS",
                    format!("tag {key:?} has an invalid key or an oversized value"),
                ));
            }
        }
    }
    Ok(())
}

/// `client_token` wins; otherwise the `idempotency-key` header is used.
pub fn resolve_idempotency_key(
    req: &CreateRunRequest,
    headers: &HeaderMap,
) -> Result<Option<String>, AppError> {
    if let Some(token) = &req.client_token {
        return Ok(Some(token.clone()));
    }
    let Some(raw) = headers.get(IDEMPOTENCY_HEADER) else {
        return Ok(None);
    };
    let key = raw
        .to_str()
        .map(str::trim)
        .ok()
        .filter(|k| is_valid_key(k))
        .ok_or_else(|| {
            AppError::bad_request(
                "INVALID_CLIENT_TOKEN",
                format!("{IDEMPOTENCY_HEADER} must be 1-{MAX_KEY_LEN} chars of [A-Za-z0-9_-]"),
            )
        })?;
    Ok(Some(key.to_string()))
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn oversized_body_is_rejected_before_parsing() {
        let err = parse_create_request(b"not json at all", 4).expect_err("too large");
        assert_eq!(err.code, "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn schema_errors_map_to_invalid_body() {
        let err = parse_create_request(br#"{"input": {}}"#, 1024).expect_err("missing name");
        assert_eq!(err.code, "INVALID_REQUEST_BODY");
    }

    #[test]
    fn client_token_charset_is_enforced() {
        let err = parse_create_request(br#"{"name":"a","input":{},"client_token":"a b"}"#, 1024)
            .expect_err("bad token");
        assert_eq!(err.code, "INVALID_CLIENT_TOKEN");
    }

    #[test]
    fn header_key_is_used_when_token_absent() {
        let req = parse_create_request(br#"{"name":"a","input":{}}"#, 1024).expect("parse");
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_HEADER, HeaderValue::from_static("retry-42"));
        assert_eq!(
            resolve_idempotency_key(&req, &headers).expect("key").as_deref(),
            Some("retry-42")
        );
    }
}
