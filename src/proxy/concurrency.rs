//! Per-source concurrency accounting (C7).
//!
//! One counter per configured source, bumped atomically when the load
//! balancer establishes an upstream connection and released when the
//! upstream activity ends. Priority is the number of free slots, which the
//! balancer uses to order sources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;

#[derive(Debug)]
struct SourceCounter {
    current: AtomicI32,
    max: i32,
}

/// In-memory per-source counters. The map is built once from configuration
/// and never mutated afterwards, so lookups are lock-free.
pub struct ConcurrencyManager {
    counters: HashMap<String, Arc<SourceCounter>>,
}

impl ConcurrencyManager {
    pub fn new(config: &Config) -> Self {
        let counters = config
            .sources
            .iter()
            .map(|(id, source)| {
                (
                    id.clone(),
                    Arc::new(SourceCounter {
                        current: AtomicI32::new(0),
                        max: source.max_concurrency.max(1),
                    }),
                )
            })
            .collect();
        Self { counters }
    }

    /// Configured cap for one source; never below 1, default 1 for sources
    /// that were not configured (defensive lookups only happen for decoded
    /// slugs that survived a config change).
    pub fn max(&self, source_id: &str) -> i32 {
        self.counters.get(source_id).map(|c| c.max).unwrap_or(1)
    }

    /// Currently held slots for one source.
    pub fn current(&self, source_id: &str) -> i32 {
        self.counters
            .get(source_id)
            .map(|c| c.current.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Free slots; the balancer probes sources with the highest priority
    /// first.
    pub fn priority(&self, source_id: &str) -> i32 {
        self.max(source_id) - self.current(source_id)
    }

    /// True when every slot of the source is in use.
    pub fn saturated(&self, source_id: &str) -> bool {
        self.current(source_id) >= self.max(source_id)
    }

    /// Take one slot and return the RAII release guard.
    pub fn acquire(&self, source_id: &str) -> ReleaseGuard {
        if let Some(counter) = self.counters.get(source_id) {
            let now = counter.current.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(
                "Source '{}' concurrency {}/{}",
                source_id,
                now,
                counter.max
            );
        }
        ReleaseGuard {
            counter: self.counters.get(source_id).cloned(),
            source_id: source_id.to_string(),
        }
    }
}

/// Releases one concurrency slot on drop. The decrement clamps at zero, so
/// a stray double-release can never underflow the counter.
#[derive(Debug)]
pub struct ReleaseGuard {
    counter: Option<Arc<SourceCounter>>,
    source_id: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(counter) = &self.counter {
            let prev = counter
                .current
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    if v > 0 {
                        Some(v - 1)
                    } else {
                        None
                    }
                });
            match prev {
                Ok(prev) => debug!(
                    "Source '{}' concurrency {}/{}",
                    self.source_id,
                    prev - 1,
                    counter.max
                ),
                Err(_) => debug!(
                    "Source '{}' release with counter already at zero",
                    self.source_id
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(caps: &[(&str, i32)]) -> Arc<ConcurrencyManager> {
        let mut vars: Vec<(String, String)> = caps
            .iter()
            .map(|(id, _)| (format!("M3U_URL_{}", id), format!("http://{}", id)))
            .collect();
        vars.extend(
            caps.iter()
                .map(|(id, max)| (format!("M3U_MAX_CONCURRENCY_{}", id), max.to_string())),
        );
        let config = Config::from_vars(vars).unwrap();
        Arc::new(ConcurrencyManager::new(&config))
    }

    #[test]
    fn priority_reflects_free_slots() {
        let cm = manager(&[("1", 3), ("2", 1)]);
        assert_eq!(cm.priority("1"), 3);
        assert_eq!(cm.priority("2"), 1);

        let _g1 = cm.acquire("1");
        let _g2 = cm.acquire("1");
        assert_eq!(cm.current("1"), 2);
        assert_eq!(cm.priority("1"), 1);
        assert!(!cm.saturated("1"));

        let _g3 = cm.acquire("1");
        assert!(cm.saturated("1"));
    }

    #[test]
    fn release_clamps_at_zero() {
        let cm = manager(&[("1", 2)]);
        {
            let _guard = cm.acquire("1");
            assert_eq!(cm.current("1"), 1);
        }
        assert_eq!(cm.current("1"), 0);

        // A guard for an unknown source is inert.
        drop(cm.acquire("nope"));
        assert_eq!(cm.current("1"), 0);
    }

    #[test]
    fn balanced_sequences_never_exceed_max() {
        let cm = manager(&[("1", 2)]);
        for _ in 0..10 {
            let a = cm.acquire("1");
            let b = cm.acquire("1");
            assert!(cm.current("1") <= cm.max("1"));
            drop(a);
            drop(b);
        }
        assert_eq!(cm.current("1"), 0);
    }

    #[test]
    fn caps_default_to_one() {
        let cm = manager(&[("1", 1)]);
        assert_eq!(cm.max("unknown"), 1);
        assert_eq!(cm.priority("unknown"), 1);
    }
}
