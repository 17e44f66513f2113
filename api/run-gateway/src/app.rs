use crate::config::environment::AppConfig;
use crate::infra::InfraClients;
use crate::module::run::route::register_routes as register_run_routes;
use crate::module::stream::route::register_routes as register_stream_routes;
use crate::service::concurrency_service::ConcurrencyTracker;
use crate::service::connection_service::ConnectionManager;
use crate::service::detector_service::DetectorRegistry;
use crate::service::executor_service::{ScriptedTaskExecutor, TaskExecutor};
use crate::service::guard_event_service::GuardEventLog;
use crate::service::idempotency_service::IdempotencyStore;
use crate::service::judge_service::{Judge, JudgeConfig};
use crate::service::rate_limit_service::RateLimiter;
use crate::service::run_registry_service::RunRegistry;
use crate::service::sequencer_service::Sequencer;
use crate::service::shield_service::ShieldPolicy;
use crate::service::span_service::{RecordingMode, SpanRecorder};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub infra: Option<InfraClients>,
    pub runs: Arc<RunRegistry>,
    pub idempotency: Arc<IdempotencyStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub concurrency: Arc<ConcurrencyTracker>,
    pub spans: Arc<SpanRecorder>,
    pub detectors: Arc<DetectorRegistry>,
    pub judge: Arc<Judge>,
    pub shield: ShieldPolicy,
    pub sequencer: Arc<Sequencer>,
    pub guard: Arc<GuardEventLog>,
    pub connections: Arc<ConnectionManager>,
    pub executor: Arc<dyn TaskExecutor>,
}

impl AppState {
    pub fn new(config: AppConfig, infra: Option<InfraClients>) -> Self {
        Self::with_executor(config, infra, Arc::new(ScriptedTaskExecutor))
    }

    pub fn with_executor(
        config: AppConfig,
        infra: Option<InfraClients>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let sequencer = Arc::new(Sequencer::new(
            config.replay_buffer_capacity,
            config.replay_window,
        ));
        Self {
            runs: Arc::new(RunRegistry::default()),
            idempotency: Arc::new(IdempotencyStore::new(Duration::from_secs(
                config.idempotency_ttl_seconds.max(1) as u64,
            ))),
            rate_limiter: Arc::new(RateLimiter::new(
                Duration::from_secs(config.rate_limit_window_seconds.max(1) as u64),
                config.rate_limit_max_requests,
            )),
            concurrency: Arc::new(ConcurrencyTracker::default()),
            spans: Arc::new(SpanRecorder::new(RecordingMode::from_privacy_flag(
                config.privacy_mode,
            ))),
            detectors: Arc::new(DetectorRegistry::with_defaults()),
            judge: Arc::new(Judge::new(JudgeConfig {
                budget: Duration::from_millis(config.judge_budget_ms),
                max_sentences: config.judge_max_sentences,
                numeric_tolerance: config.judge_numeric_tolerance,
            })),
            shield: ShieldPolicy::new(config.shield_block_threshold, config.shield_approve_threshold),
            guard: Arc::new(GuardEventLog::new(Arc::clone(&sequencer), config.privacy_mode)),
            connections: Arc::new(ConnectionManager::new(config.max_connections_per_run as u32)),
            sequencer,
            executor,
            infra,
            config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-correlation-id"),
            HeaderName::from_static("retry-after"),
        ]);
    let body_limit = state.config.max_body_bytes;

    register_run_routes(state.clone())
        .merge(register_stream_routes(state))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
}
