//! Memory pressure monitoring and tiered cache eviction.
//!
//! A sampler abstracts host-specific heap probing; the monitor classifies
//! samples into pressure levels; the cleaner responds by pruning usage
//! records and evicting cache tiers. Cleanup never runs re-entrantly.

use super::cache::CacheSet;
use super::usage::UsageTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    pub heap_used: u64,
    pub heap_total: u64,
    pub available: u64,
}

/// Host-specific heap probe.
pub trait PressureSampler: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Reads VmRSS from `/proc/self/status`. On hosts without procfs it reports
/// an empty sample, which classifies as no pressure.
pub struct ProcStatusSampler;

impl PressureSampler for ProcStatusSampler {
    fn sample(&self) -> MemorySample {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return MemorySample::default();
        };
        let mut sample = MemorySample::default();
        for line in status.lines() {
            let kb = |line: &str| -> u64 {
                line.split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };
            if line.starts_with("VmRSS:") {
                sample.heap_used = kb(line);
            } else if line.starts_with("VmSize:") {
                sample.heap_total = kb(line);
            }
        }
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if line.starts_with("MemAvailable:") {
                    sample.available = line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024;
                    break;
                }
            }
        }
        sample
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

pub struct MemoryMonitor {
    sampler: Arc<dyn PressureSampler>,
    cfg: crate::config::MemoryConfig,
    last_sample: Mutex<Option<MemorySample>>,
}

impl MemoryMonitor {
    pub fn new(sampler: Arc<dyn PressureSampler>, cfg: crate::config::MemoryConfig) -> Self {
        Self {
            sampler,
            cfg,
            last_sample: Mutex::new(None),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.sample_interval_secs.max(1))
    }

    pub fn classify(&self, sample: &MemorySample) -> PressureLevel {
        let budget = self.cfg.max_memory_mb.saturating_mul(1024 * 1024);
        if budget == 0 {
            return PressureLevel::Normal;
        }
        let ratio = sample.heap_used as f64 / budget as f64;
        if ratio >= self.cfg.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= self.cfg.high_threshold {
            PressureLevel::High
        } else if ratio >= self.cfg.moderate_threshold {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }

    /// Take a fresh sample and classify it.
    pub fn current_pressure(&self) -> (PressureLevel, MemorySample) {
        let sample = self.sampler.sample();
        *self.last_sample.lock().unwrap() = Some(sample);
        (self.classify(&sample), sample)
    }

    pub fn last_sample(&self) -> Option<MemorySample> {
        *self.last_sample.lock().unwrap()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub level: PressureLevel,
    pub cache_entries_evicted: usize,
    pub usage_records_pruned: usize,
    pub freed_memory_bytes: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// True when the pass was skipped because another one was running.
    pub skipped: bool,
}

pub struct MemoryCleaner {
    monitor: Arc<MemoryMonitor>,
    caches: Arc<CacheSet>,
    usage: Arc<UsageTracker>,
    busy: AtomicBool,
    history: Mutex<Vec<CleanupReport>>,
}

const HISTORY_CAP: usize = 32;

impl MemoryCleaner {
    pub fn new(
        monitor: Arc<MemoryMonitor>,
        caches: Arc<CacheSet>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            monitor,
            caches,
            usage,
            busy: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }
    }

    /// One monitor tick: sample, classify, clean.
    pub fn tick(&self) -> CleanupReport {
        let (level, _) = self.monitor.current_pressure();
        self.cleanup(level)
    }

    /// Run a cleanup pass for a pressure level. A concurrent second call is
    /// a no-op that reports `skipped`.
    pub fn cleanup(&self, level: PressureLevel) -> CleanupReport {
        if self.busy.swap(true, Ordering::AcqRel) {
            return CleanupReport {
                level,
                cache_entries_evicted: 0,
                usage_records_pruned: 0,
                freed_memory_bytes: 0,
                duration_ms: 0,
                timestamp: Utc::now(),
                skipped: true,
            };
        }
        let start = Instant::now();
        let before = self.monitor.last_sample().unwrap_or_default();

        let mut evicted = 0;
        let pruned = self.usage.clear_expired();
        evicted += self.caches.metadata.prune_expired();
        evicted += self.caches.content.prune_expired();
        evicted += self.caches.resources.prune_expired();

        match level {
            PressureLevel::Normal => {}
            PressureLevel::Moderate => {
                evicted += self.caches.content.evict_fraction(0.5);
                evicted += self.caches.resources.evict_fraction(0.3);
            }
            PressureLevel::High => {
                evicted += self.caches.content.evict_fraction(0.5);
                evicted += self.caches.resources.evict_fraction(0.8);
                self.usage.tighten_window(Duration::from_secs(24 * 60 * 60));
            }
            PressureLevel::Critical => {
                evicted += self.caches.metadata.evict_fraction(0.8);
                evicted += self.caches.content.evict_fraction(0.8);
                evicted += self.caches.resources.evict_fraction(0.8);
                self.usage.tighten_window(Duration::from_secs(12 * 60 * 60));
            }
        }

        let after = self.monitor.current_pressure().1;
        let freed = before.heap_used.saturating_sub(after.heap_used);
        let report = CleanupReport {
            level,
            cache_entries_evicted: evicted,
            usage_records_pruned: pruned,
            freed_memory_bytes: freed,
            duration_ms: start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            skipped: false,
        };
        if level > PressureLevel::Normal {
            info!(
                "memory cleanup at {:?}: {} cache entries, {} usage records",
                level, evicted, pruned
            );
        } else {
            debug!("memory cleanup pass: {} expired entries", evicted);
        }

        let mut history = self.history.lock().unwrap();
        history.push(report.clone());
        if history.len() > HISTORY_CAP {
            history.remove(0);
        }
        drop(history);

        self.busy.store(false, Ordering::Release);
        report
    }

    pub fn history(&self) -> Vec<CleanupReport> {
        self.history.lock().unwrap().clone()
    }

    /// Spawn the periodic monitor loop. The task runs until the returned
    /// handle is aborted.
    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cleaner = self;
        let interval = cleaner.monitor.sample_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cleaner = Arc::clone(&cleaner);
                let _ = tokio::task::spawn_blocking(move || cleaner.tick()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Scripted sampler for tests.
    struct FixedSampler {
        heap_used: AtomicU64,
    }

    impl FixedSampler {
        fn new(heap_used: u64) -> Self {
            Self {
                heap_used: AtomicU64::new(heap_used),
            }
        }
    }

    impl PressureSampler for FixedSampler {
        fn sample(&self) -> MemorySample {
            MemorySample {
                heap_used: self.heap_used.load(Ordering::Relaxed),
                heap_total: 1024 * 1024 * 1024,
                available: 1024 * 1024 * 1024,
            }
        }
    }

    fn mb(n: u64) -> u64 {
        n * 1024 * 1024
    }

    fn monitor_with(heap_used_mb: u64) -> Arc<MemoryMonitor> {
        let cfg = crate::config::MemoryConfig {
            max_memory_mb: 100,
            ..Default::default()
        };
        Arc::new(MemoryMonitor::new(
            Arc::new(FixedSampler::new(mb(heap_used_mb))),
            cfg,
        ))
    }

    fn populated_caches() -> Arc<CacheSet> {
        let caches = Arc::new(CacheSet::new(&crate::config::CacheConfig::default()));
        for i in 0..10 {
            caches.content.set(
                format!("c{i}"),
                Arc::new(super::super::content::parse_instructions("body")),
            );
            caches.resources.set(
                format!("r{i}"),
                Arc::new(super::super::resources::SkillResources::default()),
            );
        }
        caches
    }

    #[test]
    fn classification_thresholds() {
        let monitor = monitor_with(0);
        let level = |used_mb: u64| {
            monitor.classify(&MemorySample {
                heap_used: mb(used_mb),
                ..Default::default()
            })
        };
        assert_eq!(level(10), PressureLevel::Normal);
        assert_eq!(level(75), PressureLevel::Moderate);
        assert_eq!(level(90), PressureLevel::High);
        assert_eq!(level(99), PressureLevel::Critical);
    }

    #[test]
    fn high_pressure_evicts_content_and_resources_not_metadata() {
        let monitor = monitor_with(90);
        let caches = populated_caches();
        for i in 0..4 {
            caches.metadata.set(format!("m{i}"), test_metadata(i));
        }
        let usage = Arc::new(UsageTracker::with_default_window());
        let cleaner = MemoryCleaner::new(monitor, caches.clone(), usage);

        let content_before = caches.content.len();
        let resources_before = caches.resources.len();
        let report = cleaner.tick();
        assert_eq!(report.level, PressureLevel::High);
        assert!(!report.skipped);

        let content_ratio = 1.0 - caches.content.len() as f64 / content_before as f64;
        let resources_ratio = 1.0 - caches.resources.len() as f64 / resources_before as f64;
        assert!(content_ratio >= 0.4, "content only shrank {content_ratio}");
        assert!(
            resources_ratio >= 0.7,
            "resources only shrank {resources_ratio}"
        );
        assert_eq!(caches.metadata.len(), 4, "metadata tier must be untouched");
    }

    #[test]
    fn normal_pressure_only_prunes_expired() {
        let monitor = monitor_with(10);
        let caches = populated_caches();
        let usage = Arc::new(UsageTracker::with_default_window());
        let cleaner = MemoryCleaner::new(monitor, caches.clone(), usage);
        let report = cleaner.tick();
        assert_eq!(report.level, PressureLevel::Normal);
        assert_eq!(caches.content.len(), 10);
        assert_eq!(caches.resources.len(), 10);
    }

    #[test]
    fn critical_pressure_tightens_usage_retention() {
        let monitor = monitor_with(99);
        let caches = populated_caches();
        let usage = Arc::new(UsageTracker::with_default_window());
        let cleaner = MemoryCleaner::new(monitor, caches, usage.clone());
        cleaner.tick();
        assert_eq!(usage.window(), Duration::from_secs(12 * 60 * 60));
    }

    #[test]
    fn second_concurrent_cleanup_is_noop() {
        let monitor = monitor_with(90);
        let caches = populated_caches();
        let usage = Arc::new(UsageTracker::with_default_window());
        let cleaner = MemoryCleaner::new(monitor, caches, usage);
        // Simulate a pass in progress.
        cleaner.busy.store(true, Ordering::Release);
        let report = cleaner.cleanup(PressureLevel::High);
        assert!(report.skipped);
        assert_eq!(report.cache_entries_evicted, 0);
        cleaner.busy.store(false, Ordering::Release);
        let report = cleaner.cleanup(PressureLevel::High);
        assert!(!report.skipped);
    }

    fn test_metadata(i: usize) -> Arc<super::super::metadata::SkillMetadata> {
        use super::super::metadata::*;
        Arc::new(SkillMetadata {
            name: format!("m{i}"),
            display_name: format!("m{i}"),
            description: "d".to_string(),
            version: "0.1.0".to_string(),
            skill_type: "general".to_string(),
            protocol: None,
            domain: "general".to_string(),
            keywords: vec!["k".to_string()],
            tags: Vec::new(),
            capabilities: Vec::new(),
            triggers: None,
            input_schema: None,
            output_schema: None,
            security: SecurityPolicy::default(),
            resources: ResourceDecl {
                entry: "./scripts/execute.py".to_string(),
                ..Default::default()
            },
            cacheable: true,
            ttl: 3600,
            tools: Vec::new(),
            extra: serde_json::Map::new(),
            path: std::path::PathBuf::from("/tmp"),
            loaded_at: chrono::Utc::now(),
        })
    }
}
