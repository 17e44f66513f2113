use crate::app::AppState;
use crate::service::idempotency_service;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Idempotency key freed by eviction, with the run it pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedKey {
    pub key: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub runs_evicted: usize,
    pub idempotency_purged: usize,
    pub rate_windows_purged: usize,
    pub evicted_keys: Vec<EvictedKey>,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.runs_evicted == 0 && self.idempotency_purged == 0 && self.rate_windows_purged == 0
    }
}

/// Evicts terminal runs past retention from every per-run store.
pub fn sweep(state: &AppState, now_ms: i64, now: Instant) -> SweepReport {
    let cutoff = now_ms - state.config.run_retention_seconds.saturating_mul(1000);
    let mut report = SweepReport::default();

    for record in state.runs.expired(cutoff) {
        state.runs.remove(&record.run_id);
        state.spans.evict(&record.run_id);
        state.guard.evict(&record.run_id);
        state.sequencer.evict_run(&record.run_id);
        if let Some(key) = record.idempotency_key {
            state.idempotency.forget(&key);
            report.evicted_keys.push(EvictedKey {
                key,
                run_id: record.run_id.clone(),
            });
        }
        debug!(run_id = %record.run_id, "run evicted");
        report.runs_evicted += 1;
    }

    report.idempotency_purged = state.idempotency.purge_expired(now);
    report.rate_windows_purged = state.rate_limiter.purge_idle(now);
    report
}

/// Remote keys of evicted runs would otherwise outlive their snapshots.
async fn release_remote_keys(state: &AppState, keys: &[EvictedKey]) {
    let Some(infra) = &state.infra else {
        return;
    };
    for evicted in keys {
        if let Err(e) =
            idempotency_service::release_stale_remote(infra, &evicted.key, &evicted.run_id).await
        {
            warn!(run_id = %evicted.run_id, reason = %e, "remote idempotency key not released");
        }
    }
}

pub async fn run_janitor(state: AppState) {
    let period = Duration::from_secs(state.config.janitor_interval_seconds.max(1) as u64);
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let report = sweep(&state, Utc::now().timestamp_millis(), Instant::now());
        release_remote_keys(&state, &report.evicted_keys).await;
        if !report.is_empty() {
            info!(
                runs_evicted = report.runs_evicted,
                idempotency_purged = report.idempotency_purged,
                rate_windows_purged = report.rate_windows_purged,
                "janitor sweep"
            );
        }
    }
}
