use crate::infra::{InfraClients, RATE_LIMIT_PREFIX};
use redis::Script;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Sliding-window log per caller. Check and record happen under one lock,
/// and a rejected request leaves its caller's window untouched.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    pub fn check_and_record(&self, caller_id: &str, now: Instant) -> Result<RateDecision, String> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| "rate limiter lock poisoned".to_string())?;
        let window = self.window;
        let hits = windows.entry(caller_id.to_string()).or_default();
        let in_window = hits
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count() as u32;

        if in_window >= self.max_requests {
            let oldest = hits
                .iter()
                .find(|t| now.saturating_duration_since(**t) < window)
                .copied()
                .unwrap_or(now);
            let retry_after = (oldest + window).saturating_duration_since(now);
            return Ok(RateDecision::Limited { retry_after });
        }

        while let Some(front) = hits.front() {
            if now.saturating_duration_since(*front) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }
        hits.push_back(now);
        Ok(RateDecision::Allowed {
            remaining: self.max_requests - in_window - 1,
        })
    }

    pub fn purge_idle(&self, now: Instant) -> usize {
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        let window = self.window;
        let before = windows.len();
        windows.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.saturating_duration_since(*last) < window)
        });
        before - windows.len()
    }
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])
    local window = tonumber(ARGV[2])
    local limit = tonumber(ARGV[3])
    redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
    local count = redis.call('ZCARD', key)
    if count >= limit then
        local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        return {0, tonumber(oldest[2]) + window - now}
    end
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, limit - count - 1}
"#;

pub async fn check_remote(
    infra: &InfraClients,
    caller_id: &str,
    window: Duration,
    max_requests: u32,
    now_ms: i64,
) -> Result<RateDecision, String> {
    let mut conn = infra.connection().await?;
    let script = Script::new(SLIDING_WINDOW_SCRIPT);
    let window_ms = window.as_millis() as i64;
    let result: Vec<i64> = infra
        .bounded(
            script
                .key(format!("{RATE_LIMIT_PREFIX}{caller_id}"))
                .arg(now_ms)
                .arg(window_ms)
                .arg(max_requests)
                .arg(format!("{now_ms}-{}", Uuid::new_v4().simple()))
                .invoke_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("rate limit script failed: {e}"))?;

    match result.as_slice() {
        [1, remaining] => Ok(RateDecision::Allowed {
            remaining: (*remaining).max(0) as u32,
        }),
        [0, retry_ms] => Ok(RateDecision::Limited {
            retry_after: Duration::from_millis((*retry_ms).max(0) as u64),
        }),
        _ => Err("rate limit script returned unexpected shape".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects_with_retry_hint() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();
        assert_eq!(
            limiter.check_and_record("caller", t0).expect("check"),
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter
                .check_and_record("caller", t0 + Duration::from_secs(1))
                .expect("check"),
            RateDecision::Allowed { remaining: 0 }
        );
        match limiter
            .check_and_record("caller", t0 + Duration::from_secs(4))
            .expect("check")
        {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected limited, got {other:?}"),
        }
    }

    #[test]
    fn rejection_does_not_consume_window_capacity() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 1);
        let t0 = Instant::now();
        limiter.check_and_record("c", t0).expect("check");
        for i in 1..5 {
            let decision = limiter
                .check_and_record("c", t0 + Duration::from_secs(i))
                .expect("check");
            assert!(matches!(decision, RateDecision::Limited { .. }));
        }
        assert!(matches!(
            limiter
                .check_and_record("c", t0 + Duration::from_secs(10))
                .expect("check"),
            RateDecision::Allowed { .. }
        ));
    }

    #[test]
    fn callers_are_isolated_and_idle_windows_purged() {
        let limiter = RateLimiter::new(Duration::from_secs(5), 1);
        let t0 = Instant::now();
        limiter.check_and_record("a", t0).expect("check");
        assert!(matches!(
            limiter.check_and_record("b", t0).expect("check"),
            RateDecision::Allowed { .. }
        ));
        assert_eq!(limiter.purge_idle(t0 + Duration::from_secs(6)), 2);
    }
}
