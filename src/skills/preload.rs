//! Background cache warming driven by usage signals.
//!
//! Ranks skills by frequency, confidence and recency, then pre-loads the
//! top candidates whose content is not already cached — but only while
//! memory pressure allows it.

use super::loader::{LoadOptions, SkillsLoader};
use super::memory::{MemoryMonitor, PressureLevel};
use super::usage::UsageTracker;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreloadStats {
    pub passes: u64,
    pub warmed: u64,
    /// Requests that hit a cache entry this manager warmed.
    pub preload_hits: u64,
    /// Requests for skills this manager warmed that still missed cache.
    pub preload_misses: u64,
}

impl PreloadStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.preload_hits + self.preload_misses;
        if total == 0 {
            0.0
        } else {
            self.preload_hits as f64 / total as f64
        }
    }
}

pub struct PreloadManager {
    loader: Arc<SkillsLoader>,
    usage: Arc<UsageTracker>,
    monitor: Arc<MemoryMonitor>,
    cfg: crate::config::PreloadConfig,
    busy: AtomicBool,
    warmed: Mutex<HashSet<String>>,
    stats: Mutex<PreloadStats>,
}

impl PreloadManager {
    pub fn new(
        loader: Arc<SkillsLoader>,
        usage: Arc<UsageTracker>,
        monitor: Arc<MemoryMonitor>,
        cfg: crate::config::PreloadConfig,
    ) -> Self {
        Self {
            loader,
            usage,
            monitor,
            cfg,
            busy: AtomicBool::new(false),
            warmed: Mutex::new(HashSet::new()),
            stats: Mutex::new(PreloadStats::default()),
        }
    }

    /// Priority for one skill from its usage record.
    fn priority(&self, record: &super::usage::UsageRecord) -> f64 {
        let frequency = record.execution_count as f64;
        let age_secs = (Utc::now() - record.last_executed_at)
            .num_seconds()
            .max(0) as f64;
        let half_life = self.cfg.recency_half_life_secs.max(1) as f64;
        let recency = (-age_secs * std::f64::consts::LN_2 / half_life).exp();
        self.cfg.frequency_weight * frequency
            + self.cfg.confidence_weight * record.average_confidence
            + self.cfg.recency_weight * recency
    }

    /// One preload pass. Re-entry is a no-op; so is any pass under more
    /// than moderate pressure or with too little memory available.
    pub fn tick(&self) -> usize {
        if self.busy.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let warmed_count = self.run_pass();
        self.busy.store(false, Ordering::Release);
        warmed_count
    }

    fn run_pass(&self) -> usize {
        let (level, sample) = self.monitor.current_pressure();
        if level > PressureLevel::Moderate {
            debug!("preload skipped: pressure {:?}", level);
            return 0;
        }
        if sample.available < self.cfg.min_memory_mb * 1024 * 1024 {
            debug!("preload skipped: {} bytes available", sample.available);
            return 0;
        }

        let mut ranked: Vec<(f64, String)> = self
            .usage
            .all()
            .iter()
            .map(|r| (self.priority(r), r.skill_name.clone()))
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut warmed_now = 0;
        for (_, name) in ranked.into_iter().take(self.cfg.top_k) {
            if self.loader.is_content_cached(&name) {
                continue;
            }
            match self.loader.load_skill(
                &name,
                &LoadOptions {
                    include_content: true,
                    include_resources: false,
                    min_confidence: None,
                },
            ) {
                Ok(_) => {
                    warmed_now += 1;
                    self.warmed.lock().unwrap().insert(name.to_lowercase());
                }
                Err(e) => debug!("preload of '{}' failed: {}", name, e),
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.passes += 1;
        stats.warmed += warmed_now as u64;
        if warmed_now > 0 {
            info!("preloaded {} skills", warmed_now);
        }
        warmed_now
    }

    /// Called by the execution manager so the hit rate can tune future
    /// passes. Only requests for skills this manager warmed count.
    pub fn note_request(&self, skill_name: &str, cache_hit: bool) {
        let warmed = self.warmed.lock().unwrap();
        if !warmed.contains(&skill_name.to_lowercase()) {
            return;
        }
        drop(warmed);
        let mut stats = self.stats.lock().unwrap();
        if cache_hit {
            stats.preload_hits += 1;
        } else {
            stats.preload_misses += 1;
        }
    }

    pub fn stats(&self) -> PreloadStats {
        self.stats.lock().unwrap().clone()
    }

    /// Spawn the periodic preload loop.
    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let interval = std::time::Duration::from_secs(manager.cfg.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&manager);
                let _ = tokio::task::spawn_blocking(move || manager.tick()).await;
            }
        })
    }
}
