use crate::infra::{IDEMPOTENCY_PREFIX, InfraClients};
use crate::service::hash_service::sha256_hex;
use redis::Script;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const PENDING_MARKER: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Pending,
    Committed(String),
    Abandoned,
}

#[derive(Debug)]
enum EntryState {
    Pending(watch::Sender<ClaimOutcome>),
    Committed(String),
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    expires_at: Instant,
}

/// Key -> run id cache. A claim is a compare-and-set under one lock: the
/// first caller for a key becomes the creator, everyone else observes.
#[derive(Debug)]
pub struct IdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

#[derive(Debug)]
pub enum Claim {
    Creator(ClaimGuard),
    Existing(String),
    InFlight(watch::Receiver<ClaimOutcome>),
}

/// Held by the creator of a key. Dropping it without `commit` releases the
/// key and wakes observers so one of them can retry.
#[derive(Debug)]
pub struct ClaimGuard {
    store: Arc<IdempotencyStore>,
    key: String,
    committed: bool,
}

impl ClaimGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn commit(mut self, run_id: &str) -> Result<(), String> {
        self.store.commit(&self.key, run_id)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.store.abandon(&self.key);
        }
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn claim(self: &Arc<Self>, key: &str, now: Instant) -> Result<Claim, String> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| "idempotency store lock poisoned".to_string())?;

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(match &entry.state {
                    EntryState::Committed(run_id) => Claim::Existing(run_id.clone()),
                    EntryState::Pending(tx) => Claim::InFlight(tx.subscribe()),
                });
            }
        }

        let (tx, _rx) = watch::channel(ClaimOutcome::Pending);
        entries.insert(
            key.to_string(),
            Entry {
                state: EntryState::Pending(tx),
                expires_at: now + self.ttl,
            },
        );
        Ok(Claim::Creator(ClaimGuard {
            store: Arc::clone(self),
            key: key.to_string(),
            committed: false,
        }))
    }

    pub fn lookup(&self, key: &str, now: Instant) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(Entry {
                state: EntryState::Committed(run_id),
                expires_at,
            }) if *expires_at > now => Some(run_id.clone()),
            _ => None,
        }
    }

    /// Drops a committed key, used when the run it points at is evicted.
    pub fn forget(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if matches!(
                entries.get(key),
                Some(Entry {
                    state: EntryState::Committed(_),
                    ..
                })
            ) {
                entries.remove(key);
            }
        }
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.expires_at > now || matches!(entry.state, EntryState::Pending(_))
        });
        before - entries.len()
    }

    fn commit(&self, key: &str, run_id: &str) -> Result<(), String> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| "idempotency store lock poisoned".to_string())?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| format!("idempotency claim for {key} vanished before commit"))?;
        if let EntryState::Pending(tx) = &entry.state {
            tx.send_replace(ClaimOutcome::Committed(run_id.to_string()));
        }
        entry.state = EntryState::Committed(run_id.to_string());
        Ok(())
    }

    fn abandon(&self, key: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if let Some(Entry {
            state: EntryState::Pending(tx),
            ..
        }) = entries.get(key)
        {
            tx.send_replace(ClaimOutcome::Abandoned);
            entries.remove(key);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReservation {
    Reserved,
    InProgress,
    Existing(String),
}

/// Keys are hashed so caller-chosen tokens never shape the Redis keyspace.
fn remote_key(key: &str) -> String {
    format!("{IDEMPOTENCY_PREFIX}{}", sha256_hex(key))
}

pub async fn reserve_remote(
    infra: &InfraClients,
    key: &str,
    ttl_seconds: i64,
) -> Result<RemoteReservation, String> {
    let mut conn = infra.connection().await?;
    let redis_key = remote_key(key);
    let set: Option<String> = infra
        .bounded(
            redis::cmd("SET")
                .arg(&redis_key)
                .arg(PENDING_MARKER)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds.max(1))
                .query_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("idempotency reserve failed: {e}"))?;
    if set.is_some() {
        return Ok(RemoteReservation::Reserved);
    }

    let existing: Option<String> = infra
        .bounded(redis::cmd("GET").arg(&redis_key).query_async(&mut conn))
        .await?
        .map_err(|e| format!("idempotency lookup failed: {e}"))?;
    Ok(match existing {
        Some(value) if value != PENDING_MARKER => RemoteReservation::Existing(value),
        _ => RemoteReservation::InProgress,
    })
}

pub async fn commit_remote(
    infra: &InfraClients,
    key: &str,
    run_id: &str,
    ttl_seconds: i64,
) -> Result<(), String> {
    let mut conn = infra.connection().await?;
    let _: Option<String> = infra
        .bounded(
            redis::cmd("SET")
                .arg(remote_key(key))
                .arg(run_id)
                .arg("XX")
                .arg("EX")
                .arg(ttl_seconds.max(1))
                .query_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("idempotency commit failed: {e}"))?;
    Ok(())
}

pub async fn release_remote(infra: &InfraClients, key: &str) -> Result<(), String> {
    let mut conn = infra.connection().await?;
    let _: usize = infra
        .bounded(
            redis::cmd("DEL")
                .arg(remote_key(key))
                .query_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("idempotency release failed: {e}"))?;
    Ok(())
}

const RELEASE_IF_OWNED_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Deletes the remote key only while it still points at `run_id`, so a
/// concurrent creator's fresh reservation survives. Returns whether a key
/// was removed.
pub async fn release_stale_remote(
    infra: &InfraClients,
    key: &str,
    run_id: &str,
) -> Result<bool, String> {
    let mut conn = infra.connection().await?;
    let script = Script::new(RELEASE_IF_OWNED_SCRIPT);
    let removed: i64 = infra
        .bounded(
            script
                .key(remote_key(key))
                .arg(run_id)
                .invoke_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("idempotency stale release failed: {e}"))?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<IdempotencyStore> {
        Arc::new(IdempotencyStore::new(Duration::from_secs(60)))
    }

    #[test]
    fn first_claim_creates_and_commit_makes_key_existing() {
        let store = store();
        let now = Instant::now();
        let Claim::Creator(guard) = store.claim("abc123", now).expect("claim") else {
            panic!("first claim must create");
        };
        guard.commit("run-1").expect("commit");

        match store.claim("abc123", now).expect("claim") {
            Claim::Existing(run_id) => assert_eq!(run_id, "run-1"),
            other => panic!("expected existing, got {other:?}"),
        }
        assert_eq!(store.lookup("abc123", now).as_deref(), Some("run-1"));
    }

    #[test]
    fn dropped_guard_releases_key_and_notifies_observers() {
        let store = store();
        let now = Instant::now();
        let Claim::Creator(guard) = store.claim("k", now).expect("claim") else {
            panic!("first claim must create");
        };
        let Claim::InFlight(rx) = store.claim("k", now).expect("claim") else {
            panic!("second claim must observe");
        };
        drop(guard);
        assert_eq!(*rx.borrow(), ClaimOutcome::Abandoned);
        assert!(matches!(
            store.claim("k", now).expect("claim"),
            Claim::Creator(_)
        ));
    }

    #[test]
    fn expired_records_are_reclaimable_and_purged() {
        let store = Arc::new(IdempotencyStore::new(Duration::from_millis(10)));
        let now = Instant::now();
        let Claim::Creator(guard) = store.claim("k", now).expect("claim") else {
            panic!("first claim must create");
        };
        guard.commit("run-1").expect("commit");

        let later = now + Duration::from_millis(50);
        assert_eq!(store.lookup("k", later), None);
        assert_eq!(store.purge_expired(later), 1);
        assert!(matches!(
            store.claim("k", later).expect("claim"),
            Claim::Creator(_)
        ));
    }

    #[test]
    fn concurrent_claims_yield_exactly_one_creator() {
        let store = store();
        let now = Instant::now();
        let handles = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || match store.claim("shared", now).expect("claim") {
                    Claim::Creator(guard) => {
                        guard.commit("run-shared").expect("commit");
                        1
                    }
                    _ => 0,
                })
            })
            .collect::<Vec<_>>();
        let creators: i32 = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .sum();
        assert_eq!(creators, 1);
    }
}
