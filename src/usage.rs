//! In-memory per-key usage accounting over a sliding window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard cap on timestamps retained per key.
pub const MAX_TIMESTAMPS_PER_KEY: usize = 10_000;

/// Per-key counts over the standard reporting windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WindowCounts {
    pub last_1m: u64,
    pub last_1h: u64,
    pub last_24h: u64,
}

/// Sliding-window usage tracker. One bounded timestamp deque per key,
/// all access under a single mutex.
pub struct UsageAccountant {
    window_secs: u64,
    usage: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl UsageAccountant {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn usage(&self) -> MutexGuard<'_, HashMap<String, VecDeque<u64>>> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one use of `key_id` at `now` (unix seconds), evicting entries
    /// that fell out of the window and trimming to the per-key cap.
    pub fn record(&self, key_id: &str, now: u64) {
        let mut usage = self.usage();
        let window = usage.entry(key_id.to_string()).or_default();
        window.push_back(now);
        evict(window, now, self.window_secs);
    }

    /// Counts per key over the 1m/1h/24h windows, one pass per key.
    /// Stale entries are evicted as a side effect.
    pub fn aggregate(&self, now: u64) -> HashMap<String, WindowCounts> {
        let cutoff_1m = now.saturating_sub(60);
        let cutoff_1h = now.saturating_sub(3600);
        let cutoff_24h = now.saturating_sub(86_400);

        let mut usage = self.usage();
        let mut out = HashMap::with_capacity(usage.len());
        for (key_id, window) in usage.iter_mut() {
            evict(window, now, self.window_secs);
            let mut counts = WindowCounts::default();
            for &ts in window.iter() {
                if ts >= cutoff_24h {
                    counts.last_24h += 1;
                    if ts >= cutoff_1h {
                        counts.last_1h += 1;
                        if ts >= cutoff_1m {
                            counts.last_1m += 1;
                        }
                    }
                }
            }
            out.insert(key_id.clone(), counts);
        }
        out
    }

    /// Drop tracking for a single key.
    pub fn forget(&self, key_id: &str) {
        self.usage().remove(key_id);
    }

    /// Drop tracking for keys no longer in the repository. Returns the
    /// number of windows removed.
    pub fn gc(&self, valid_ids: &HashSet<String>) -> usize {
        let mut usage = self.usage();
        let before = usage.len();
        usage.retain(|key_id, _| valid_ids.contains(key_id));
        before - usage.len()
    }

    #[cfg(test)]
    fn window_len(&self, key_id: &str) -> usize {
        self.usage().get(key_id).map_or(0, VecDeque::len)
    }
}

fn evict(window: &mut VecDeque<u64>, now: u64, window_secs: u64) {
    let cutoff = now.saturating_sub(window_secs);
    while window.front().is_some_and(|&ts| ts < cutoff) {
        window.pop_front();
    }
    while window.len() > MAX_TIMESTAMPS_PER_KEY {
        window.pop_front();
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
