use crate::config::environment::AppConfig;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl RedisConfig {
    pub fn from_app(app: &AppConfig) -> Option<Self> {
        app.redis_url.as_ref().map(|url| Self {
            url: url.clone(),
            timeout_ms: app.backend_timeout_ms.max(1),
        })
    }
}
