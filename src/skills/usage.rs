//! Rolling-window per-skill usage counters.
//!
//! One record per skill, updated after every execution and pruned against a
//! sliding window on read and on cleanup. Updates are serialized per skill;
//! cross-skill updates are independent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub skill_name: String,
    pub execution_count: u64,
    pub first_executed_at: DateTime<Utc>,
    pub last_executed_at: DateTime<Utc>,
    pub average_confidence: f64,
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub requires_resources: bool,
    pub execution_type: String,
}

/// One execution outcome as reported by the execution manager.
#[derive(Debug, Clone)]
pub struct RecordedExecution {
    pub duration_ms: u64,
    pub confidence: Option<f64>,
    pub cache_hit: bool,
    pub requires_resources: bool,
    pub execution_type: String,
}

pub struct UsageTracker {
    window: RwLock<Duration>,
    records: RwLock<HashMap<String, Arc<Mutex<UsageRecord>>>>,
}

impl UsageTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: RwLock::new(window),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Default 24-hour sliding window.
    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }

    pub fn window(&self) -> Duration {
        *self.window.read().unwrap()
    }

    /// Tighten (never widen) the retention window; used by the memory
    /// cleaner under pressure.
    pub fn tighten_window(&self, window: Duration) {
        let mut current = self.window.write().unwrap();
        if window < *current {
            *current = window;
        }
    }

    pub fn record_execution(&self, skill_name: &str, exec: RecordedExecution) {
        let key = skill_name.to_lowercase();
        let record = {
            let records = self.records.read().unwrap();
            records.get(&key).cloned()
        };
        let record = match record {
            Some(r) => r,
            None => {
                let mut records = self.records.write().unwrap();
                records
                    .entry(key)
                    .or_insert_with(|| {
                        let now = Utc::now();
                        Arc::new(Mutex::new(UsageRecord {
                            skill_name: skill_name.to_string(),
                            execution_count: 0,
                            first_executed_at: now,
                            last_executed_at: now,
                            average_confidence: 0.0,
                            total_execution_time_ms: 0,
                            average_execution_time_ms: 0.0,
                            cache_hits: 0,
                            cache_hit_rate: 0.0,
                            requires_resources: false,
                            execution_type: exec.execution_type.clone(),
                        }))
                    })
                    .clone()
            }
        };

        let mut r = record.lock().unwrap();
        r.execution_count += 1;
        r.last_executed_at = Utc::now();
        if let Some(confidence) = exec.confidence {
            // Incremental mean over executions that carried a confidence.
            let n = r.execution_count as f64;
            r.average_confidence += (confidence - r.average_confidence) / n;
        }
        r.total_execution_time_ms += exec.duration_ms;
        r.average_execution_time_ms =
            r.total_execution_time_ms as f64 / r.execution_count as f64;
        if exec.cache_hit {
            r.cache_hits += 1;
        }
        r.cache_hit_rate = r.cache_hits as f64 / r.execution_count as f64;
        r.requires_resources = r.requires_resources || exec.requires_resources;
        r.execution_type = exec.execution_type;
    }

    /// Get one record, pruning it first if it fell out of the window.
    pub fn get(&self, skill_name: &str) -> Option<UsageRecord> {
        let cutoff = self.cutoff();
        let key = skill_name.to_lowercase();
        let record = {
            let records = self.records.read().unwrap();
            records.get(&key).cloned()
        }?;
        let snapshot = record.lock().unwrap().clone();
        if snapshot.last_executed_at < cutoff {
            self.records.write().unwrap().remove(&key);
            return None;
        }
        Some(snapshot)
    }

    /// Snapshot of all live records; expired ones are dropped on the way.
    pub fn all(&self) -> Vec<UsageRecord> {
        let cutoff = self.cutoff();
        let mut expired = Vec::new();
        let mut live = Vec::new();
        {
            let records = self.records.read().unwrap();
            for (key, record) in records.iter() {
                let snapshot = record.lock().unwrap().clone();
                if snapshot.last_executed_at < cutoff {
                    expired.push(key.clone());
                } else {
                    live.push(snapshot);
                }
            }
        }
        if !expired.is_empty() {
            let mut records = self.records.write().unwrap();
            for key in expired {
                records.remove(&key);
            }
        }
        live.sort_by(|a, b| a.skill_name.cmp(&b.skill_name));
        live
    }

    /// Drop records older than the window. Returns the number removed.
    pub fn clear_expired(&self) -> usize {
        let cutoff = self.cutoff();
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, record| record.lock().unwrap().last_executed_at >= cutoff);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let window = *self.window.read().unwrap();
        Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::hours(24))
    }
}
