use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static RUNS_ADMITTED: AtomicU64 = AtomicU64::new(0);
static RUNS_STARTED: AtomicU64 = AtomicU64::new(0);
static RUNS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static RUNS_FAILED: AtomicU64 = AtomicU64::new(0);
static RUNS_CANCELLED: AtomicU64 = AtomicU64::new(0);
static ACTIVE_RUNS: AtomicI64 = AtomicI64::new(0);

static IDEMPOTENCY_HITS: AtomicU64 = AtomicU64::new(0);
static IDEMPOTENCY_MISSES: AtomicU64 = AtomicU64::new(0);
static PRECHECK_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static RATE_LIMIT_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static RATE_LIMIT_FAIL_OPEN: AtomicU64 = AtomicU64::new(0);
static CONCURRENCY_DENIALS: AtomicU64 = AtomicU64::new(0);

static STREAM_OPENED: AtomicU64 = AtomicU64::new(0);
static STREAM_CLOSED: AtomicU64 = AtomicU64::new(0);
static STREAM_REJECTED: AtomicU64 = AtomicU64::new(0);
static STREAM_ACTIVE: AtomicI64 = AtomicI64::new(0);
static EVENTS_REPLAYED: AtomicU64 = AtomicU64::new(0);
static EVENTS_LIVE: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_DROPPED: AtomicU64 = AtomicU64::new(0);

static INJECTION_TRIGGERS: AtomicU64 = AtomicU64::new(0);
static HALLUCINATION_TRIGGERS: AtomicU64 = AtomicU64::new(0);
static PII_TRIGGERS: AtomicU64 = AtomicU64::new(0);

static VERDICTS: AtomicU64 = AtomicU64::new(0);
static JUDGE_FALLBACKS: AtomicU64 = AtomicU64::new(0);
static JUDGE_DURATION_COUNT: AtomicU64 = AtomicU64::new(0);
static JUDGE_DURATION_TOTAL_MS: AtomicU64 = AtomicU64::new(0);

static SHIELD_ALLOW: AtomicU64 = AtomicU64::new(0);
static SHIELD_REQUIRE_APPROVAL: AtomicU64 = AtomicU64::new(0);
static SHIELD_BLOCK: AtomicU64 = AtomicU64::new(0);

static LAST_ERROR_TS: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub runs_admitted: u64,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub active_runs: i64,
    pub idempotency_hits: u64,
    pub idempotency_misses: u64,
    pub precheck_rejections: u64,
    pub rate_limit_rejections: u64,
    pub rate_limit_fail_open: u64,
    pub concurrency_denials: u64,
    pub stream_connections_opened: u64,
    pub stream_connections_closed: u64,
    pub stream_connections_rejected: u64,
    pub stream_connections_active: i64,
    pub events_replayed: u64,
    pub events_live: u64,
    pub duplicates_dropped: u64,
    pub injection_triggers: u64,
    pub hallucination_triggers: u64,
    pub pii_triggers: u64,
    pub verdicts: u64,
    pub judge_fallbacks: u64,
    pub judge_duration_avg_ms: u64,
    pub shield_allow: u64,
    pub shield_require_approval: u64,
    pub shield_block: u64,
    pub last_error_ts: i64,
}

pub fn inc_runs_admitted() {
    RUNS_ADMITTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_runs_started() {
    RUNS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_runs_completed() {
    RUNS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_runs_failed() {
    RUNS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_runs_cancelled() {
    RUNS_CANCELLED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_active_runs() {
    ACTIVE_RUNS.fetch_add(1, Ordering::Relaxed);
}

pub fn dec_active_runs() {
    ACTIVE_RUNS.fetch_sub(1, Ordering::Relaxed);
}

pub fn inc_idempotency_hits() {
    IDEMPOTENCY_HITS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_idempotency_misses() {
    IDEMPOTENCY_MISSES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_precheck_rejections() {
    PRECHECK_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_rate_limit_rejections() {
    RATE_LIMIT_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_rate_limit_fail_open() {
    RATE_LIMIT_FAIL_OPEN.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_concurrency_denials() {
    CONCURRENCY_DENIALS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_stream_opened() {
    STREAM_OPENED.fetch_add(1, Ordering::Relaxed);
    STREAM_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn record_stream_closed() {
    STREAM_CLOSED.fetch_add(1, Ordering::Relaxed);
    STREAM_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

pub fn inc_stream_rejected() {
    STREAM_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn add_events_replayed(count: u64) {
    EVENTS_REPLAYED.fetch_add(count, Ordering::Relaxed);
}

pub fn inc_events_live() {
    EVENTS_LIVE.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_duplicates_dropped() {
    DUPLICATES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_injection_triggers() {
    INJECTION_TRIGGERS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_hallucination_triggers() {
    HALLUCINATION_TRIGGERS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_pii_triggers() {
    PII_TRIGGERS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_verdicts() {
    VERDICTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_judge_fallbacks() {
    JUDGE_FALLBACKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_judge_duration_ms(duration_ms: u64) {
    JUDGE_DURATION_COUNT.fetch_add(1, Ordering::Relaxed);
    JUDGE_DURATION_TOTAL_MS.fetch_add(duration_ms, Ordering::Relaxed);
}

pub fn inc_shield_allow() {
    SHIELD_ALLOW.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_shield_require_approval() {
    SHIELD_REQUIRE_APPROVAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_shield_block() {
    SHIELD_BLOCK.fetch_add(1, Ordering::Relaxed);
}

pub fn set_last_error_ts(ts: i64) {
    LAST_ERROR_TS.store(ts, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    let judge_count = JUDGE_DURATION_COUNT.load(Ordering::Relaxed);

    MetricsSnapshot {
        runs_admitted: RUNS_ADMITTED.load(Ordering::Relaxed),
        runs_started: RUNS_STARTED.load(Ordering::Relaxed),
        runs_completed: RUNS_COMPLETED.load(Ordering::Relaxed),
        runs_failed: RUNS_FAILED.load(Ordering::Relaxed),
        runs_cancelled: RUNS_CANCELLED.load(Ordering::Relaxed),
        active_runs: ACTIVE_RUNS.load(Ordering::Relaxed),
        idempotency_hits: IDEMPOTENCY_HITS.load(Ordering::Relaxed),
        idempotency_misses: IDEMPOTENCY_MISSES.load(Ordering::Relaxed),
        precheck_rejections: PRECHECK_REJECTIONS.load(Ordering::Relaxed),
        rate_limit_rejections: RATE_LIMIT_REJECTIONS.load(Ordering::Relaxed),
        rate_limit_fail_open: RATE_LIMIT_FAIL_OPEN.load(Ordering::Relaxed),
        concurrency_denials: CONCURRENCY_DENIALS.load(Ordering::Relaxed),
        stream_connections_opened: STREAM_OPENED.load(Ordering::Relaxed),
        stream_connections_closed: STREAM_CLOSED.load(Ordering::Relaxed),
        stream_connections_rejected: STREAM_REJECTED.load(Ordering::Relaxed),
        stream_connections_active: STREAM_ACTIVE.load(Ordering::Relaxed),
        events_replayed: EVENTS_REPLAYED.load(Ordering::Relaxed),
        events_live: EVENTS_LIVE.load(Ordering::Relaxed),
        duplicates_dropped: DUPLICATES_DROPPED.load(Ordering::Relaxed),
        injection_triggers: INJECTION_TRIGGERS.load(Ordering::Relaxed),
        hallucination_triggers: HALLUCINATION_TRIGGERS.load(Ordering::Relaxed),
        pii_triggers: PII_TRIGGERS.load(Ordering::Relaxed),
        verdicts: VERDICTS.load(Ordering::Relaxed),
        judge_fallbacks: JUDGE_FALLBACKS.load(Ordering::Relaxed),
        judge_duration_avg_ms: if judge_count > 0 {
            JUDGE_DURATION_TOTAL_MS.load(Ordering::Relaxed) / judge_count
        } else {
            0
        },
        shield_allow: SHIELD_ALLOW.load(Ordering::Relaxed),
        shield_require_approval: SHIELD_REQUIRE_APPROVAL.load(Ordering::Relaxed),
        shield_block: SHIELD_BLOCK.load(Ordering::Relaxed),
        last_error_ts: LAST_ERROR_TS.load(Ordering::Relaxed),
    }
}
