pub mod concurrency_service;
pub mod connection_service;
pub mod correlation_service;
pub mod detector_service;
pub mod executor_service;
pub mod guard_event_service;
pub mod hash_service;
pub mod idempotency_service;
pub mod internal_auth_service;
pub mod janitor_service;
pub mod judge_service;
pub mod metrics_service;
pub mod precheck_service;
pub mod rate_limit_service;
pub mod redaction_service;
pub mod run_registry_service;
pub mod sequencer_service;
pub mod shield_service;
pub mod span_service;
pub mod text_service;
pub mod validation_service;
