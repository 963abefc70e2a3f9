//! Placeholder expansion over a priority-ordered provider chain.
//!
//! Placeholders look like `{{namespace}}` or `{{namespace:arg:arg}}`. Every
//! registered provider advertises a namespace and a priority; providers are
//! evaluated in ascending priority order and the first defined answer wins.
//! Results are cached per (placeholder, context fingerprint).

pub mod catalog;
pub mod providers;

use crate::skills::TtlCache;
use anyhow::Result;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One parsed placeholder occurrence.
#[derive(Debug, Clone)]
pub struct Placeholder {
    /// Full source text, braces included.
    pub raw: String,
    pub namespace: String,
    pub args: Vec<String>,
}

/// Per-message expansion context supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub channel: Option<String>,
    /// Scoped variables readable by scope-keyed providers.
    pub vars: HashMap<String, String>,
    /// Cooperative deadline; expansion past it leaves placeholders verbatim.
    pub deadline: Option<Instant>,
}

impl ExpansionContext {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Stable fingerprint of everything a provider may read, for result
    /// caching.
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.session_id.hash(&mut hasher);
        self.user_id.hash(&mut hasher);
        self.conversation_id.hash(&mut hasher);
        self.locale.hash(&mut hasher);
        self.timezone.hash(&mut hasher);
        self.channel.hash(&mut hasher);
        let mut vars: Vec<(&String, &String)> = self.vars.iter().collect();
        vars.sort();
        vars.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

pub trait VariableProvider: Send + Sync {
    fn namespace(&self) -> &str;
    /// 10–95; lower runs earlier.
    fn priority(&self) -> u8;
    /// `Ok(None)` falls through to the next matching provider. `Err` leaves
    /// the placeholder verbatim and stops the chain for it.
    fn expand(&self, placeholder: &Placeholder, ctx: &ExpansionContext) -> Result<Option<String>>;
    /// Whether results for this namespace may be cached. Time-like
    /// namespaces opt out.
    fn cacheable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExpansionReport {
    pub text: String,
    pub expanded: usize,
    /// Placeholders left untouched (no provider, provider error, deadline).
    pub left_verbatim: Vec<String>,
}

pub struct VariableEngine {
    providers: RwLock<Vec<Arc<dyn VariableProvider>>>,
    cache: TtlCache<(String, String), String>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z][A-Za-z0-9_]*)((?::[^{}:]+)*)\}\}").expect("placeholder regex")
    })
}

impl VariableEngine {
    pub fn new(cfg: &crate::config::VarsConfig) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            cache: TtlCache::new("vars", 512, Duration::from_secs(cfg.cache_ttl_secs)),
        }
    }

    /// Register a provider. A duplicate namespace at equal priority replaces
    /// the earlier registration with a warning.
    pub fn register(&self, provider: Arc<dyn VariableProvider>) {
        let mut providers = self.providers.write().unwrap();
        if let Some(existing) = providers
            .iter()
            .position(|p| p.namespace() == provider.namespace() && p.priority() == provider.priority())
        {
            warn!(
                "provider for '{}' at priority {} re-registered; later registration wins",
                provider.namespace(),
                provider.priority()
            );
            providers[existing] = provider;
        } else {
            providers.push(provider);
        }
        providers.sort_by_key(|p| p.priority());
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    /// Expand every placeholder in `text`. Always returns text; failures
    /// degrade to verbatim placeholders.
    pub fn expand_text(&self, text: &str, ctx: &ExpansionContext) -> ExpansionReport {
        let mut report = ExpansionReport::default();
        let fingerprint = ctx.fingerprint();
        let mut out = String::with_capacity(text.len());
        let mut last_end = 0;

        for captures in placeholder_regex().captures_iter(text) {
            let Some(whole) = captures.get(0) else { continue };
            out.push_str(&text[last_end..whole.start()]);
            last_end = whole.end();

            let placeholder = Placeholder {
                raw: whole.as_str().to_string(),
                namespace: captures[1].to_string(),
                args: captures
                    .get(2)
                    .map(|m| {
                        m.as_str()
                            .split(':')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            };

            if ctx.deadline_passed() {
                debug!("expansion deadline passed; leaving '{}' verbatim", placeholder.raw);
                report.left_verbatim.push(placeholder.raw.clone());
                out.push_str(&placeholder.raw);
                continue;
            }

            match self.expand_one(&placeholder, ctx, &fingerprint) {
                Some(value) => {
                    report.expanded += 1;
                    out.push_str(&value);
                }
                None => {
                    report.left_verbatim.push(placeholder.raw.clone());
                    out.push_str(&placeholder.raw);
                }
            }
        }
        out.push_str(&text[last_end..]);
        report.text = out;
        report
    }

    fn expand_one(
        &self,
        placeholder: &Placeholder,
        ctx: &ExpansionContext,
        fingerprint: &str,
    ) -> Option<String> {
        let cache_key = (placeholder.raw.clone(), fingerprint.to_string());
        if let Some(cached) = self.cache.get(&cache_key) {
            return Some(cached);
        }

        let providers = self.providers.read().unwrap();
        for provider in providers
            .iter()
            .filter(|p| p.namespace() == placeholder.namespace)
        {
            match provider.expand(placeholder, ctx) {
                Ok(Some(value)) => {
                    if provider.cacheable() {
                        self.cache.set(cache_key, value.clone());
                    }
                    return Some(value);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "provider_error expanding '{}' via '{}': {}",
                        placeholder.raw,
                        provider.namespace(),
                        e
                    );
                    return None;
                }
            }
        }
        None
    }
}
