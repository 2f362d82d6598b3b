//! Lightweight backend instrumentation.
//!
//! Counters and scoped timers are recorded only when the `profiler` feature is
//! enabled. Without it every entry point compiles to a no-op and the guards are
//! zero-sized.

use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock, PoisonError};
#[cfg(feature = "profiler")]
use std::time::{Duration, Instant};

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum ProfilerKey {
    Backend(&'static str),
    Compile(&'static str),
    Cache(&'static str),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub calls: u64,
    pub total_ns: u128,
}

/// Snapshot of everything recorded since the last `reset` or `take_counters`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileCounters {
    pub backend: BTreeMap<&'static str, Counter>,
    pub compile: BTreeMap<&'static str, Counter>,
    pub cache: BTreeMap<&'static str, u64>,
}

impl ProfileCounters {
    pub fn cache_count(&self, name: &str) -> u64 {
        self.cache.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty() && self.compile.is_empty() && self.cache.is_empty()
    }
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Counter>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.total_ns = entry.total_ns.saturating_add(elapsed.as_nanos());
    }

    fn take(&self) -> HashMap<ProfilerKey, Counter> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *stats)
    }
}

/// Records the time between its creation and drop.
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
    #[cfg(feature = "profiler")]
    start: Instant,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey) -> Self {
        #[cfg(feature = "profiler")]
        {
            ScopeGuard {
                key,
                start: Instant::now(),
            }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        Profiler::instance().record(self.key, self.start.elapsed());
    }
}

#[inline(always)]
pub fn backend_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Backend(name))
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile(name))
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(ProfilerKey::Cache(name), Duration::ZERO);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[cfg(feature = "profiler")]
pub fn take_counters() -> Option<ProfileCounters> {
    let stats = Profiler::instance().take();
    if stats.is_empty() {
        return None;
    }
    let mut counters = ProfileCounters::default();
    for (key, counter) in stats {
        match key {
            ProfilerKey::Backend(name) => {
                counters.backend.insert(name, counter);
            }
            ProfilerKey::Compile(name) => {
                counters.compile.insert(name, counter);
            }
            ProfilerKey::Cache(name) => {
                counters.cache.insert(name, counter.calls);
            }
        }
    }
    Some(counters)
}

#[cfg(not(feature = "profiler"))]
pub fn take_counters() -> Option<ProfileCounters> {
    None
}

#[cfg(feature = "profiler")]
pub fn take_report_json() -> Option<String> {
    let counters = take_counters()?;
    serde_json::to_string_pretty(&counters).ok()
}

#[cfg(not(feature = "profiler"))]
pub fn take_report_json() -> Option<String> {
    None
}

#[cfg(feature = "profiler")]
pub fn reset() {
    let _ = Profiler::instance().take();
}

#[cfg(not(feature = "profiler"))]
pub fn reset() {}
