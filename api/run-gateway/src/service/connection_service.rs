use crate::service::metrics_service;
use crate::service::sequencer_service::StreamError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-run subscriber ceiling. Slots are released by dropping the guard,
/// so disconnect, timeout and run termination all free them the same way.
#[derive(Debug)]
pub struct ConnectionManager {
    max_per_run: u32,
    open: Mutex<HashMap<String, u32>>,
}

#[derive(Debug)]
pub struct ConnectionGuard {
    manager: Arc<ConnectionManager>,
    run_id: String,
}

impl ConnectionGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.release(&self.run_id);
    }
}

impl ConnectionManager {
    pub fn new(max_per_run: u32) -> Self {
        Self {
            max_per_run,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(self: &Arc<Self>, run_id: &str) -> Result<ConnectionGuard, StreamError> {
        let mut open = self.open.lock().map_err(|_| StreamError::Poisoned)?;
        let current = open.get(run_id).copied().unwrap_or(0);
        if current >= self.max_per_run {
            metrics_service::inc_stream_rejected();
            return Err(StreamError::Capacity {
                run_id: run_id.to_string(),
                limit: self.max_per_run,
            });
        }
        open.insert(run_id.to_string(), current + 1);
        metrics_service::record_stream_opened();
        Ok(ConnectionGuard {
            manager: Arc::clone(self),
            run_id: run_id.to_string(),
        })
    }

    pub fn open_connections(&self, run_id: &str) -> u32 {
        self.open
            .lock()
            .map(|m| m.get(run_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn release(&self, run_id: &str) {
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        if let Some(count) = open.get_mut(run_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(run_id);
            }
            metrics_service::record_stream_closed();
        }
    }
}
