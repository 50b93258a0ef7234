use super::{Attribution, DetectionStage, RequestRecord, StageContext, StageResult};
use crate::config::RateLimitConfig;
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct IpState {
    count: u32,
    window_start: f64,
    last_seen: f64,
    previous_seen: Option<f64>,
    recent_paths: VecDeque<String>,
}

impl IpState {
    fn new(now: f64) -> Self {
        Self {
            count: 1,
            window_start: now,
            last_seen: now,
            previous_seen: None,
            recent_paths: VecDeque::new(),
        }
    }

    fn observe(&mut self, now: f64, window_secs: f64) {
        // Reset window if expired
        if now - self.window_start > window_secs {
            self.count = 1;
            self.window_start = now;
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.previous_seen = Some(self.last_seen);
        self.last_seen = now;
    }

    /// Oldest paths fall off once `limit` is reached.
    fn push_path(&mut self, path: &str, limit: usize) {
        if path.is_empty() || limit == 0 {
            return;
        }
        while self.recent_paths.len() >= limit {
            self.recent_paths.pop_front();
        }
        self.recent_paths.push_back(path.to_string());
    }
}

/// Read-only view of one IP's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct IpSnapshot {
    pub count: u32,
    pub window_start: f64,
    pub last_seen: f64,
    pub previous_seen: Option<f64>,
    /// Most recent paths, oldest first.
    pub recent_paths: Vec<String>,
}

impl IpSnapshot {
    /// Seconds between the last two requests from this IP.
    pub fn interval_secs(&self) -> Option<f64> {
        self.previous_seen.map(|prev| (self.last_seen - prev).max(0.0))
    }

    /// How many of the recent paths equal `path`.
    pub fn path_hits(&self, path: &str) -> usize {
        self.recent_paths.iter().filter(|p| *p == path).count()
    }
}

/// Bounded per-IP window counters.
///
/// Entries live in a strict LRU: every recorded request moves its IP to the
/// most-recently-used slot, and inserting past capacity evicts the entry that
/// has gone longest without a request. The whole read-modify-write of a
/// request (window reset or increment, LRU touch) runs under one lock, so two
/// racing requests from the same IP can never both reset the window.
///
/// Each entry also keeps the last `path_history` request paths of its IP.
pub struct IpStateStore {
    entries: Mutex<LruCache<String, IpState>>,
    window_secs: f64,
    threshold: u32,
    path_history: usize,
}

impl IpStateStore {
    pub fn new(window_secs: f64, threshold: u32, max_tracked: usize) -> Self {
        let capacity = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            window_secs,
            threshold,
            path_history: 0,
        }
    }

    /// Keep up to `limit` recent paths per IP. Zero keeps none.
    pub fn with_path_history(mut self, limit: usize) -> Self {
        self.path_history = limit;
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window_secs, config.ip_threshold, config.max_ip_track)
            .with_path_history(config.path_history)
    }

    /// Record one request and report whether the IP is over its threshold.
    pub fn record_and_check(&self, ip: &str, now: f64) -> bool {
        self.record(ip, "", now)
            .map_or(false, |count| count > self.threshold)
    }

    /// Record one request for `path` and return the IP's count in the
    /// current window. Empty IPs are not tracked; empty paths only count.
    pub fn record(&self, ip: &str, path: &str, now: f64) -> Option<u32> {
        if ip.is_empty() {
            return None;
        }

        let mut entries = self.entries.lock();
        if let Some(state) = entries.get_mut(ip) {
            state.observe(now, self.window_secs);
            state.push_path(path, self.path_history);
            return Some(state.count);
        }

        let mut state = IpState::new(now);
        state.push_path(path, self.path_history);
        if let Some((evicted, _)) = entries.push(ip.to_string(), state) {
            debug!("Evicted least recently used IP state: {}", evicted);
        }
        Some(1)
    }

    /// Current counters for `ip` without touching its LRU position.
    pub fn snapshot(&self, ip: &str) -> Option<IpSnapshot> {
        let entries = self.entries.lock();
        entries.peek(ip).map(|state| IpSnapshot {
            count: state.count,
            window_start: state.window_start,
            last_seen: state.last_seen,
            previous_seen: state.previous_seen,
            recent_paths: state.recent_paths.iter().cloned().collect(),
        })
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.entries.lock().contains(ip)
    }

    /// Drop entries whose window lapsed more than one full window ago.
    pub fn purge_expired(&self, now: f64) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, state)| now - state.window_start > self.window_secs * 2.0)
            .map(|(ip, _)| ip.clone())
            .collect();

        for ip in &stale {
            entries.pop(ip);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window_secs(&self) -> f64 {
        self.window_secs
    }
}

/// Stage 2: per-IP request rate.
pub struct RateLimitStage {
    store: Arc<IpStateStore>,
}

impl RateLimitStage {
    pub fn new(store: Arc<IpStateStore>) -> Self {
        Self { store }
    }
}

impl DetectionStage for RateLimitStage {
    fn evaluate(&self, request: &RequestRecord, ctx: &mut StageContext) -> StageResult {
        match self.store.record(&request.ip, &request.path, ctx.now) {
            Some(count) if count > self.store.threshold() => {
                warn!(
                    "Rate limit exceeded for {}: {} requests in {}s",
                    request.ip,
                    count,
                    self.store.window_secs()
                );
                StageResult::block(
                    Attribution::IpRate,
                    format!(
                        "Rate limit exceeded: {} requests in {}s",
                        count,
                        self.store.window_secs()
                    ),
                )
            }
            _ => StageResult::Pass,
        }
    }

    fn name(&self) -> &str {
        "IP Rate Limit"
    }
}
