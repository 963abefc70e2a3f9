//! Skill discovery and search.
//!
//! Scans one or more skill roots for directories carrying a descriptor,
//! keeps a case-insensitive name map, and answers relevance queries with a
//! weighted keyword/description/domain score optionally boosted by declared
//! triggers.

use super::metadata::{LoadedMetadata, MetadataLoader, SkillMetadata, SIDECAR_FILE, SKILL_FILE};
use anyhow::Result;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IndexedSkill {
    pub metadata: Arc<SkillMetadata>,
    pub path: PathBuf,
    pub description_tokens: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SkillMatch {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub min_confidence: Option<f64>,
    pub domain: Option<String>,
    pub required_keywords: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub total_skills: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct IndexInner {
    skills: HashMap<String, IndexedSkill>,
    last_indexed_at: Option<DateTime<Utc>>,
    generation: u64,
}

pub struct SkillIndex {
    loader: MetadataLoader,
    roots: Vec<PathBuf>,
    search: crate::config::SearchConfig,
    inner: RwLock<IndexInner>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SkillIndex {
    pub fn new(cfg: &crate::config::RuntimeConfig) -> Self {
        Self {
            loader: MetadataLoader::new(&cfg.skills),
            roots: cfg.skills.roots.clone(),
            search: cfg.search.clone(),
            inner: RwLock::new(IndexInner::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Monotonic counter bumped on every re-index; catalog rendering keys
    /// its cache on this.
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap().generation
    }

    /// Scan all roots and swap in the fresh name map atomically. Parse
    /// failures skip the offending skill, never the scan.
    pub fn index_all(&self) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let mut fresh: HashMap<String, IndexedSkill> = HashMap::new();

        for root in &self.roots {
            if !root.is_dir() {
                continue;
            }
            for dir in discover_skill_dirs(root) {
                match self.loader.load_dir(&dir) {
                    Ok(LoadedMetadata { metadata, warnings }) => {
                        report.warnings.extend(warnings);
                        let key = metadata.name.to_lowercase();
                        let description_tokens =
                            super::metadata::estimate_tokens(&metadata.description);
                        if let Some(existing) = fresh.get(&key) {
                            warn!(
                                "duplicate skill '{}': {:?} replaces {:?}",
                                metadata.name, dir, existing.path
                            );
                        }
                        fresh.insert(
                            key,
                            IndexedSkill {
                                metadata: Arc::new(metadata),
                                path: dir.clone(),
                                description_tokens,
                            },
                        );
                        report.indexed += 1;
                    }
                    Err(e) => {
                        warn!("skipping skill at {:?}: {}", dir, e);
                        report.skipped += 1;
                    }
                }
            }
        }

        let mut inner = self.inner.write().unwrap();
        inner.skills = fresh;
        inner.last_indexed_at = Some(Utc::now());
        inner.generation += 1;
        info!(
            "indexed {} skills ({} skipped) across {} roots",
            report.indexed,
            report.skipped,
            self.roots.len()
        );
        Ok(report)
    }

    /// Re-load a single skill from its known path, falling back to a full
    /// re-scan when the path is gone.
    pub fn reload_skill(&self, name: &str) -> Result<()> {
        let key = name.to_lowercase();
        let known_path = self
            .inner
            .read()
            .unwrap()
            .skills
            .get(&key)
            .map(|s| s.path.clone());

        match known_path {
            Some(path) if path.is_dir() => {
                let LoadedMetadata { metadata, .. } = self.loader.load_dir(&path)?;
                let description_tokens = super::metadata::estimate_tokens(&metadata.description);
                let mut inner = self.inner.write().unwrap();
                inner.skills.insert(
                    metadata.name.to_lowercase(),
                    IndexedSkill {
                        metadata: Arc::new(metadata),
                        path,
                        description_tokens,
                    },
                );
                inner.generation += 1;
                Ok(())
            }
            _ => {
                self.index_all()?;
                Ok(())
            }
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<IndexedSkill> {
        let found = self
            .inner
            .read()
            .unwrap()
            .skills
            .get(&name.to_lowercase())
            .cloned();
        match &found {
            Some(_) => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            None => self.cache_misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .skills
            .contains_key(&name.to_lowercase())
    }

    pub fn all(&self) -> Vec<IndexedSkill> {
        let inner = self.inner.read().unwrap();
        let mut list: Vec<IndexedSkill> = inner.skills.values().cloned().collect();
        list.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        list
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner
            .skills
            .values()
            .map(|s| s.metadata.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().unwrap();
        IndexStats {
            total_skills: inner.skills.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            last_indexed_at: inner.last_indexed_at,
        }
    }

    // -----------------------------------------------------------------------
    // Relevance search
    // -----------------------------------------------------------------------

    /// Rank skills against a free-text intent. Results below the confidence
    /// floor are dropped; ties break by name.
    pub fn find_relevant_skills(&self, intent: &str, opts: &SearchOptions) -> Vec<SkillMatch> {
        let normalized = normalize_text(intent);
        let tokens = tokenize(&normalized);
        if tokens.is_empty() {
            return Vec::new();
        }
        let limit = opts.limit.unwrap_or(self.search.limit);
        let min_confidence = opts.min_confidence.unwrap_or(self.search.min_confidence);

        let inner = self.inner.read().unwrap();
        let mut matches: Vec<SkillMatch> = Vec::new();

        'skills: for skill in inner.skills.values() {
            let m = &skill.metadata;

            if !opts.required_keywords.is_empty() {
                for required in &opts.required_keywords {
                    let required = required.to_lowercase();
                    if !m.keywords.iter().any(|k| k.to_lowercase() == required) {
                        continue 'skills;
                    }
                }
            }

            let confidence = self.score_skill(m, &normalized, &tokens, opts.domain.as_deref());
            if confidence >= min_confidence {
                matches.push(SkillMatch {
                    name: m.name.clone(),
                    confidence,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        matches.truncate(limit);
        matches
    }

    fn score_skill(
        &self,
        m: &SkillMetadata,
        normalized_intent: &str,
        tokens: &[String],
        domain: Option<&str>,
    ) -> f64 {
        let matched_keywords = m
            .keywords
            .iter()
            .filter(|k| tokens.contains(&k.to_lowercase()))
            .count();
        let keyword_score = matched_keywords as f64 / m.keywords.len() as f64;

        let description = normalize_text(&m.description);
        let matched_desc = tokens
            .iter()
            .filter(|t| description.contains(t.as_str()))
            .count();
        let description_score = matched_desc as f64 / tokens.len() as f64;

        let domain_score = match domain {
            Some(d) if d.eq_ignore_ascii_case(&m.domain) => 1.0,
            _ => 0.0,
        };

        let mut score = self.search.keyword_weight * keyword_score
            + self.search.description_weight * description_score
            + self.search.domain_weight * domain_score;

        if let Some(triggers) = &m.triggers {
            let trigger_score = trigger_score(triggers, normalized_intent);
            score = score.max(trigger_score);
            if let Some(priority) = triggers.priority {
                if priority > 0.0 {
                    score = (score + 0.1 * priority.min(1.0)).min(1.0);
                }
            }
        }
        score
    }

    // -----------------------------------------------------------------------
    // Trigger prefix matching
    // -----------------------------------------------------------------------

    /// Match a user message against declared trigger phrases as explicit
    /// invocation prefixes. Longest phrase wins. Returns the skill name and
    /// the remaining input.
    pub fn match_trigger(&self, input: &str) -> Option<(String, String)> {
        let inner = self.inner.read().unwrap();
        let mut prefixes: Vec<(&str, &str)> = Vec::new();
        for skill in inner.skills.values() {
            if let Some(triggers) = &skill.metadata.triggers {
                for phrase in &triggers.phrases {
                    let phrase = phrase.trim();
                    if !phrase.is_empty() {
                        prefixes.push((phrase, skill.metadata.name.as_str()));
                    }
                }
            }
        }
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        for (prefix, skill_name) in prefixes {
            if input.starts_with(prefix) {
                let remaining = input[prefix.len()..].trim_start().to_string();
                return Some((skill_name.to_string(), remaining));
            }
        }
        None
    }
}

fn trigger_score(triggers: &super::metadata::SkillTriggers, normalized_intent: &str) -> f64 {
    let mut best: f64 = 0.0;
    for intent in &triggers.intents {
        let intent = normalize_text(intent);
        if intent.is_empty() {
            continue;
        }
        if intent == normalized_intent {
            return 1.0;
        }
        if normalized_intent.contains(&intent) {
            best = best.max(0.9);
        }
    }
    for phrase in &triggers.phrases {
        let phrase = normalize_text(phrase);
        if phrase.is_empty() {
            continue;
        }
        if phrase == normalized_intent {
            return 1.0;
        }
        if normalized_intent.contains(&phrase) {
            best = best.max(0.7);
        }
    }
    best
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokenize(normalized: &str) -> Vec<String> {
    normalized.split_whitespace().map(str::to_string).collect()
}

/// Directories under `root` carrying a descriptor. Dotted directories are
/// skipped by the walker's hidden filter.
fn discover_skill_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path == root {
            continue;
        }
        if path.join(SKILL_FILE).is_file() || path.join(SIDECAR_FILE).is_file() {
            dirs.push(path.to_path_buf());
        }
    }
    dirs.sort();
    dirs
}
