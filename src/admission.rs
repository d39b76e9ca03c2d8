use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Classic token bucket: capacity in tokens, refill by wall-clock delta,
/// computed lazily on each check.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: i32) -> Self {
        let capacity = rate_per_minute.max(0) as f64;
        Self {
            capacity,
            refill_rate: capacity / 60.0,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-tenant admission state: rate buckets and a concurrency counter
/// mirroring the tenant's running jobs.
///
/// Both live in process memory. Buckets reset on restart; the counters are
/// rebuilt from the store at startup and maintained by the workers and the
/// reaper from then on.
pub struct Admission {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    running: Mutex<HashMap<String, u32>>,
}

impl Admission {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the concurrency counters from `COUNT(running) GROUP BY tenant`.
    pub fn rebuild_running(&self, counts: impl IntoIterator<Item = (String, i64)>) {
        let mut running = self.running.lock().unwrap();
        running.clear();
        for (tenant_id, count) in counts {
            running.insert(tenant_id, count.max(0) as u32);
        }
    }

    /// Take one token from the tenant's bucket, creating it at the
    /// tenant's configured rate on first sight.
    pub fn try_acquire_rate(&self, tenant_id: &str, rate_per_minute: i32) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| TokenBucket::new(rate_per_minute))
            .try_consume(Instant::now())
    }

    /// Submission-time gate: does the tenant have headroom for another
    /// running job? Does not reserve anything; reservations happen when a
    /// worker actually claims.
    pub fn has_capacity(&self, tenant_id: &str, max_concurrent: i32) -> bool {
        let running = self.running.lock().unwrap();
        let current = running.get(tenant_id).copied().unwrap_or(0);
        (current as i64) < (max_concurrent.max(0) as i64)
    }

    /// A worker claimed a job for this tenant.
    pub fn reserve(&self, tenant_id: &str) {
        let mut running = self.running.lock().unwrap();
        *running.entry(tenant_id.to_string()).or_insert(0) += 1;
    }

    /// A job left the running state (completed, retried, dead-lettered,
    /// or reclaimed).
    pub fn release(&self, tenant_id: &str) {
        let mut running = self.running.lock().unwrap();
        if let Some(count) = running.get_mut(tenant_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn running_count(&self, tenant_id: &str) -> u32 {
        self.running.lock().unwrap().get(tenant_id).copied().unwrap_or(0)
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}
