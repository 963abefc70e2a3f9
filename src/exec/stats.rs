//! Per-skill execution counters and optional phase timings.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkillStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub token_usage: u64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

/// Wall-clock spent in each execution phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub extraction: u64,
    pub dependency: u64,
    pub compilation: u64,
    pub security: u64,
    pub sandbox: u64,
}

pub struct ExecutionStats {
    per_skill: RwLock<HashMap<String, SkillStats>>,
    phases: RwLock<HashMap<String, PhaseTimings>>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self {
            per_skill: RwLock::new(HashMap::new()),
            phases: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        skill_name: &str,
        success: bool,
        duration_ms: u64,
        cache_hit: bool,
        token_usage: u64,
    ) {
        let mut per_skill = self.per_skill.write().unwrap();
        let stats = per_skill.entry(skill_name.to_lowercase()).or_default();
        stats.total += 1;
        if success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        stats.total_execution_time_ms += duration_ms;
        stats.average_execution_time_ms = stats.total_execution_time_ms as f64 / stats.total as f64;
        if cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
        stats.token_usage += token_usage;
        stats.last_execution_at = Some(Utc::now());
    }

    pub fn record_phases(&self, skill_name: &str, timings: PhaseTimings) {
        self.phases
            .write()
            .unwrap()
            .insert(skill_name.to_lowercase(), timings);
    }

    pub fn get(&self, skill_name: &str) -> Option<SkillStats> {
        self.per_skill
            .read()
            .unwrap()
            .get(&skill_name.to_lowercase())
            .cloned()
    }

    pub fn phases(&self, skill_name: &str) -> Option<PhaseTimings> {
        self.phases
            .read()
            .unwrap()
            .get(&skill_name.to_lowercase())
            .copied()
    }

    pub fn snapshot(&self) -> HashMap<String, SkillStats> {
        self.per_skill.read().unwrap().clone()
    }
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Profiler
// ---------------------------------------------------------------------------

/// Collects phase timings for one execution when enabled. Marking a phase
/// closes it and opens the next.
pub struct ProfilerRun {
    enabled: bool,
    started: Instant,
    timings: PhaseTimings,
}

impl ProfilerRun {
    pub fn start(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            timings: PhaseTimings::default(),
        }
    }

    fn lap(&mut self) -> u64 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.started = Instant::now();
        elapsed
    }

    pub fn mark_extraction(&mut self) {
        if self.enabled {
            self.timings.extraction = self.lap();
        }
    }

    pub fn mark_dependency(&mut self) {
        if self.enabled {
            self.timings.dependency = self.lap();
        }
    }

    pub fn mark_compilation(&mut self) {
        if self.enabled {
            self.timings.compilation = self.lap();
        }
    }

    pub fn mark_security(&mut self) {
        if self.enabled {
            self.timings.security = self.lap();
        }
    }

    pub fn mark_sandbox(&mut self) {
        if self.enabled {
            self.timings.sandbox = self.lap();
        }
    }

    pub fn finish(self) -> Option<PhaseTimings> {
        self.enabled.then_some(self.timings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_success_and_failure() {
        let stats = ExecutionStats::new();
        stats.record("dice", true, 100, false, 10);
        stats.record("dice", false, 300, true, 0);
        let s = stats.get("DICE").unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.successful, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.token_usage, 10);
        assert!((s.average_execution_time_ms - 200.0).abs() < f64::EPSILON);
        assert!(s.last_execution_at.is_some());
    }

    #[test]
    fn disabled_profiler_yields_nothing() {
        let mut run = ProfilerRun::start(false);
        run.mark_security();
        run.mark_sandbox();
        assert!(run.finish().is_none());
    }

    #[test]
    fn enabled_profiler_records_phases() {
        let mut run = ProfilerRun::start(true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        run.mark_security();
        run.mark_sandbox();
        let timings = run.finish().unwrap();
        assert!(timings.security >= 4);
    }

    #[test]
    fn unknown_skill_has_no_stats() {
        let stats = ExecutionStats::new();
        assert!(stats.get("nope").is_none());
        assert!(stats.phases("nope").is_none());
    }
}
