use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level runtime configuration, loaded from `skillbridge.toml`.
/// Every section defaults field by field so a partial file is always valid.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub skills: SkillsConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub sandbox: SandboxConfig,
    pub executor: ExecutorConfig,
    pub memory: MemoryConfig,
    pub preload: PreloadConfig,
    pub parser: ParserConfig,
    pub catalog: CatalogConfig,
    pub vars: VarsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SkillsConfig {
    /// Skill roots scanned in priority order; later roots override earlier
    /// ones on name collisions.
    pub roots: Vec<PathBuf>,
    /// Strict mode turns metadata warnings (token budget, missing helpers)
    /// into hard errors.
    pub strict: bool,
    /// Token budget for a skill's descriptor text.
    pub max_metadata_tokens: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            roots: vec![crate::paths::skills_dir()],
            strict: false,
            max_metadata_tokens: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub metadata_size: usize,
    pub metadata_ttl_secs: u64,
    pub content_size: usize,
    pub content_ttl_secs: u64,
    pub resources_size: usize,
    pub resources_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_size: 256,
            metadata_ttl_secs: 3600,
            content_size: 32,
            content_ttl_secs: 1800,
            resources_size: 16,
            resources_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub limit: usize,
    pub min_confidence: f64,
    pub keyword_weight: f64,
    pub description_weight: f64,
    pub domain_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            min_confidence: 0.15,
            keyword_weight: 0.6,
            description_weight: 0.3,
            domain_weight: 0.1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default wall-clock timeout when a skill declares none.
    pub timeout_ms: u64,
    /// Default memory cap when a skill declares none.
    pub memory_mb: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Capture cap per stream; overflow is truncated with a marker.
    pub capture_cap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            memory_mb: 128,
            kill_grace_ms: 500,
            capture_cap_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Total in-flight executions.
    pub max_inflight: usize,
    /// Requests waiting beyond this fail fast with `queue_full`.
    pub max_queue: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_inflight: 16,
            max_queue: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Budget the pressure ratio is computed against.
    pub max_memory_mb: u64,
    pub sample_interval_secs: u64,
    pub normal_threshold: f64,
    pub moderate_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            sample_interval_secs: 30,
            normal_threshold: 0.5,
            moderate_threshold: 0.7,
            high_threshold: 0.85,
            critical_threshold: 0.95,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PreloadConfig {
    pub top_k: usize,
    /// Preloading pauses when available memory drops below this.
    pub min_memory_mb: u64,
    pub interval_secs: u64,
    pub frequency_weight: f64,
    pub confidence_weight: f64,
    pub recency_weight: f64,
    /// Half-life for the recency decay, in seconds.
    pub recency_half_life_secs: u64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_memory_mb: 64,
            interval_secs: 60,
            frequency_weight: 0.5,
            confidence_weight: 0.3,
            recency_weight: 0.2,
            recency_half_life_secs: 3600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ParserConfig {
    pub open_sentinel: String,
    pub close_sentinel: String,
    /// Aggressively strip markdown chrome around payloads.
    pub aggressive_strip: bool,
    /// Strict mode rejects calls that fail the repair pass instead of
    /// skipping them.
    pub strict: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            open_sentinel: "<tool_call>".to_string(),
            close_sentinel: "</tool_call>".to_string(),
            aggressive_strip: true,
            strict: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CatalogConfig {
    /// Forces a disclosure phase instead of the adaptive choice.
    pub phase_override: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VarsConfig {
    pub cache_ttl_secs: u64,
}

impl Default for VarsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl RuntimeConfig {
    /// Load from `skillbridge.toml` in the current directory, falling back to
    /// defaults when the file is absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("skillbridge.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: RuntimeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(RuntimeConfig::default())
        }
    }
}
