use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rust_env: String,
    pub api_host: String,
    pub api_port: u16,
    pub redis_url: Option<String>,
    pub idempotency_ttl_seconds: i64,
    pub backend_timeout_ms: u64,
    pub idempotency_wait_ms: u64,
    pub rate_limit_window_seconds: i64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_fail_open: bool,
    pub default_concurrency_limit: u32,
    pub tenant_plan_limits: HashMap<String, u32>,
    pub max_body_bytes: usize,
    pub privacy_mode: bool,
    pub run_timeout_seconds: i64,
    pub run_retention_seconds: i64,
    pub janitor_interval_seconds: i64,
    pub replay_window: u64,
    pub replay_buffer_capacity: usize,
    pub max_connections_per_run: usize,
    pub stream_idle_timeout_seconds: i64,
    pub stream_keepalive_seconds: i64,
    pub judge_budget_ms: u64,
    pub judge_max_sentences: usize,
    pub judge_numeric_tolerance: f64,
    pub shield_block_threshold: f64,
    pub shield_approve_threshold: f64,
    pub internal_auth_enabled: bool,
    pub internal_auth_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        load_dotenv_layers();
        let config = Self {
            rust_env: read_var("RUST_ENV")?,
            api_host: read_var("API_HOST")?,
            api_port: read_var("API_PORT")?
                .parse::<u16>()
                .map_err(|e| format!("invalid API_PORT: {e}"))?,
            redis_url: env::var("REDIS_URL").ok(),
            idempotency_ttl_seconds: read_optional_i64("IDEMPOTENCY_TTL_SECONDS", 86_400)?,
            backend_timeout_ms: read_optional_u64("BACKEND_TIMEOUT_MS", 250)?,
            idempotency_wait_ms: read_optional_u64("IDEMPOTENCY_WAIT_MS", 5_000)?,
            rate_limit_window_seconds: read_optional_i64("RATE_LIMIT_WINDOW_SECONDS", 60)?,
            rate_limit_max_requests: read_optional_u64("RATE_LIMIT_MAX_REQUESTS", 60)? as u32,
            rate_limit_fail_open: read_optional_bool("RATE_LIMIT_FAIL_OPEN", true),
            default_concurrency_limit: read_optional_u64("DEFAULT_CONCURRENCY_LIMIT", 5)? as u32,
            tenant_plan_limits: parse_plan_limits(&read_optional_string(
                "TENANT_PLAN_LIMITS",
                "",
            ))?,
            max_body_bytes: read_optional_u64("MAX_BODY_BYTES", 64 * 1024)? as usize,
            privacy_mode: read_optional_bool("PRIVACY_MODE", false),
            run_timeout_seconds: read_optional_i64("RUN_TIMEOUT_SECONDS", 120)?,
            run_retention_seconds: read_optional_i64("RUN_RETENTION_SECONDS", 3600)?,
            janitor_interval_seconds: read_optional_i64("JANITOR_INTERVAL_SECONDS", 30)?,
            replay_window: read_optional_u64("REPLAY_WINDOW", 100)?,
            replay_buffer_capacity: read_optional_u64("REPLAY_BUFFER_CAPACITY", 1000)? as usize,
            max_connections_per_run: read_optional_u64("MAX_CONNECTIONS_PER_RUN", 16)? as usize,
            stream_idle_timeout_seconds: read_optional_i64("STREAM_IDLE_TIMEOUT_SECONDS", 300)?,
            stream_keepalive_seconds: read_optional_i64("STREAM_KEEPALIVE_SECONDS", 15)?,
            judge_budget_ms: read_optional_u64("JUDGE_BUDGET_MS", 300)?,
            judge_max_sentences: read_optional_u64("JUDGE_MAX_SENTENCES", 24)? as usize,
            judge_numeric_tolerance: read_optional_f64("JUDGE_NUMERIC_TOLERANCE", 0.05)?,
            shield_block_threshold: read_optional_f64("SHIELD_BLOCK_THRESHOLD", 0.2)?,
            shield_approve_threshold: read_optional_f64("SHIELD_APPROVE_THRESHOLD", 0.8)?,
            internal_auth_enabled: read_optional_bool("INTERNAL_AUTH_ENABLED", false),
            internal_auth_secret: env::var("INTERNAL_AUTH_SECRET").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.replay_buffer_capacity < self.replay_window as usize {
            return Err("REPLAY_BUFFER_CAPACITY must be >= REPLAY_WINDOW".to_string());
        }
        if !(0.0..=1.0).contains(&self.shield_block_threshold)
            || !(0.0..=1.0).contains(&self.shield_approve_threshold)
            || self.shield_block_threshold > self.shield_approve_threshold
        {
            return Err("shield thresholds must satisfy 0 <= block <= approve <= 1".to_string());
        }
        if self.rate_limit_window_seconds <= 0 {
            return Err("RATE_LIMIT_WINDOW_SECONDS must be positive".to_string());
        }
        if self.idempotency_ttl_seconds <= 0 {
            return Err("IDEMPOTENCY_TTL_SECONDS must be positive".to_string());
        }
        if self.idempotency_wait_ms < self.backend_timeout_ms {
            return Err("IDEMPOTENCY_WAIT_MS must be >= BACKEND_TIMEOUT_MS".to_string());
        }
        if self.max_connections_per_run == 0 {
            return Err("MAX_CONNECTIONS_PER_RUN must be positive".to_string());
        }
        Ok(())
    }

    pub fn concurrency_limit_for(&self, tenant_id: &str) -> u32 {
        self.tenant_plan_limits
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_concurrency_limit)
    }
}

/// Parses `tenant=limit,tenant=limit`.
pub fn parse_plan_limits(raw: &str) -> Result<HashMap<String, u32>, String> {
    let mut limits = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (tenant, limit) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid TENANT_PLAN_LIMITS entry: {entry}"))?;
        let tenant = tenant.trim();
        if tenant.is_empty() {
            return Err(format!("invalid TENANT_PLAN_LIMITS entry: {entry}"));
        }
        let limit = limit
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid TENANT_PLAN_LIMITS limit for {tenant}: {e}"))?;
        limits.insert(tenant.to_string(), limit);
    }
    Ok(limits)
}

fn read_var(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("missing required env var: {key}"))
}

fn read_optional_i64(key: &str, default: i64) -> Result<i64, String> {
    match env::var(key) {
        Ok(v) => v.parse::<i64>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn read_optional_u64(key: &str, default: u64) -> Result<u64, String> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn read_optional_f64(key: &str, default: f64) -> Result<f64, String> {
    match env::var(key) {
        Ok(v) => v.parse::<f64>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn read_optional_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn read_optional_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_dotenv_layers() {
    for path in [".env", "../.env", "../../.env"] {
        let _ = dotenvy::from_path_override(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_limits_parse_pairs_and_skip_blanks() {
        let limits = parse_plan_limits(" acme=10, ,beta=2").expect("parse");
        assert_eq!(limits.get("acme"), Some(&10));
        assert_eq!(limits.get("beta"), Some(&2));
        assert_eq!(limits.len(), 2);
    }

    #[test]
    fn plan_limits_reject_missing_separator() {
        let err = parse_plan_limits("acme10").expect_err("must reject");
        assert!(err.contains("invalid TENANT_PLAN_LIMITS entry"));
    }
}
