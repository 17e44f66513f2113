use std::collections::HashMap;
use std::sync::Mutex;

/// Per-tenant in-flight run counters. Acquire compares against the ceiling
/// and increments in the same critical section.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    in_flight: Mutex<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Acquired { in_flight: u32 },
    Denied { in_flight: u32, limit: u32 },
}

impl ConcurrencyTracker {
    pub fn try_acquire(&self, tenant_id: &str, limit: u32) -> Result<SlotDecision, String> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| "concurrency tracker lock poisoned".to_string())?;
        let current = in_flight.get(tenant_id).copied().unwrap_or(0);
        if current >= limit {
            return Ok(SlotDecision::Denied {
                in_flight: current,
                limit,
            });
        }
        in_flight.insert(tenant_id.to_string(), current + 1);
        Ok(SlotDecision::Acquired {
            in_flight: current + 1,
        })
    }

    /// Never drops below zero; callers guard exactly-once release.
    pub fn release(&self, tenant_id: &str) -> u32 {
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return 0;
        };
        let remaining = match in_flight.get_mut(tenant_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            in_flight.remove(tenant_id);
        }
        remaining
    }

    pub fn in_flight(&self, tenant_id: &str) -> u32 {
        self.in_flight
            .lock()
            .map(|m| m.get(tenant_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
