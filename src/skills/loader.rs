//! The skill-loading façade.
//!
//! `load_skill` composes the index, the instruction loader and the resource
//! loader behind the three cache tiers, and hands back a protocol-neutral
//! handle. Callers that only know an approximate name can fall back to
//! relevance search via `min_confidence`.

use super::cache::CacheSet;
use super::content::{InstructionLoader, SkillContent};
use super::index::{SearchOptions, SkillIndex};
use super::metadata::{SkillMetadata, SkillToolDef, ToolParamDef, ToolReturnDef};
use super::resources::{ResourceLoader, SkillResources};
use crate::errors::{ErrorCode, ExecutionError};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub include_content: bool,
    pub include_resources: bool,
    /// When set, an unknown name falls back to relevance search and the
    /// best match at or above this confidence is loaded instead.
    pub min_confidence: Option<f64>,
}

/// Protocol-neutral handle for one loaded skill.
#[derive(Debug, Clone)]
pub struct SkillHandle {
    pub metadata: Arc<SkillMetadata>,
    pub content: Option<Arc<SkillContent>>,
    pub resources: Option<Arc<SkillResources>>,
    /// True when every consulted tier answered from cache.
    pub cache_hit: bool,
}

pub struct SkillsLoader {
    index: Arc<SkillIndex>,
    caches: Arc<CacheSet>,
    content_loader: InstructionLoader,
    resource_loader: ResourceLoader,
}

impl SkillsLoader {
    pub fn new(index: Arc<SkillIndex>, caches: Arc<CacheSet>) -> Self {
        let content_loader = InstructionLoader::new(caches.content.clone());
        let resource_loader = ResourceLoader::new(caches.resources.clone());
        Self {
            index,
            caches,
            content_loader,
            resource_loader,
        }
    }

    pub fn index(&self) -> &Arc<SkillIndex> {
        &self.index
    }

    pub fn is_content_cached(&self, name: &str) -> bool {
        self.caches.content.contains(&name.to_lowercase())
    }

    /// Load one skill by name.
    pub fn load_skill(&self, name: &str, opts: &LoadOptions) -> Result<SkillHandle> {
        let (metadata, metadata_hit) = self.resolve_metadata(name, opts)?;
        let mut cache_hit = metadata_hit;

        let content = if opts.include_content {
            let (content, hit) = self.content_loader.load(&metadata.name, &metadata.path)?;
            cache_hit = cache_hit && hit;
            Some(content)
        } else {
            None
        };

        let resources = if opts.include_resources {
            let (resources, hit) = self.resource_loader.load(&metadata.name, &metadata.path)?;
            cache_hit = cache_hit && hit;
            Some(resources)
        } else {
            None
        };

        Ok(SkillHandle {
            metadata,
            content,
            resources,
            cache_hit,
        })
    }

    fn resolve_metadata(
        &self,
        name: &str,
        opts: &LoadOptions,
    ) -> Result<(Arc<SkillMetadata>, bool)> {
        let key = name.to_lowercase();
        if let Some(metadata) = self.caches.metadata.get(&key) {
            return Ok((metadata, true));
        }

        if let Some(indexed) = self.index.get(name) {
            self.cache_metadata(&key, &indexed.metadata);
            return Ok((indexed.metadata, false));
        }

        // Unknown name: optionally fall back to relevance search.
        if let Some(min_confidence) = opts.min_confidence {
            let matches = self.index.find_relevant_skills(
                name,
                &SearchOptions {
                    limit: Some(1),
                    min_confidence: Some(min_confidence),
                    ..Default::default()
                },
            );
            if let Some(best) = matches.first() {
                debug!(
                    "resolved '{}' to skill '{}' at confidence {:.2}",
                    name, best.name, best.confidence
                );
                if let Some(indexed) = self.index.get(&best.name) {
                    self.cache_metadata(&best.name.to_lowercase(), &indexed.metadata);
                    return Ok((indexed.metadata, false));
                }
            }
        }

        Err(ExecutionError::new(
            ErrorCode::SkillNotFound,
            format!("unknown skill '{}'", name),
        )
        .into())
    }

    fn cache_metadata(&self, key: &str, metadata: &Arc<SkillMetadata>) {
        if metadata.cacheable {
            self.caches.metadata.set_with_ttl(
                key.to_string(),
                metadata.clone(),
                Duration::from_secs(metadata.ttl),
            );
        }
    }

    /// Best-effort protocol detection: the declared protocol wins, then the
    /// entry extension.
    pub fn detect_protocol(&self, name: &str) -> Result<String> {
        let handle = self.load_skill(name, &LoadOptions::default())?;
        let m = &handle.metadata;
        if let Some(protocol) = &m.protocol {
            return Ok(protocol.clone());
        }
        let ext = std::path::Path::new(&m.resources.entry)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        Ok(match ext {
            "py" => "python",
            "js" | "mjs" | "ts" => "node",
            "sh" | "bash" => "shell",
            "rb" => "ruby",
            "pl" => "perl",
            _ => "binary",
        }
        .to_string())
    }

    /// The declared tool surface, or a single synthesized default tool when
    /// the skill declares none.
    pub fn tool_definitions(&self, name: &str) -> Result<Vec<SkillToolDef>> {
        let handle = self.load_skill(name, &LoadOptions::default())?;
        let m = &handle.metadata;
        if !m.tools.is_empty() {
            return Ok(m.tools.clone());
        }
        Ok(vec![synthesize_default_tool(m)])
    }
}

/// Derive a one-tool surface from the metadata: the input schema's
/// properties become parameters, the output schema's type the return type.
fn synthesize_default_tool(m: &SkillMetadata) -> SkillToolDef {
    let mut parameters = std::collections::BTreeMap::new();
    if let Some(schema) = &m.input_schema {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (param, decl) in props {
                parameters.insert(
                    param.clone(),
                    ToolParamDef {
                        param_type: decl
                            .get("type")
                            .and_then(|t| t.as_str())
                            .unwrap_or("string")
                            .to_string(),
                        required: required.contains(&param.as_str()),
                        default: decl.get("default").cloned(),
                        description: decl
                            .get("description")
                            .and_then(|d| d.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        validation: None,
                    },
                );
            }
        }
    }
    SkillToolDef {
        name: m.name.clone(),
        description: m.description.clone(),
        parameters,
        returns: m.output_schema.as_ref().map(|schema| ToolReturnDef {
            return_type: schema
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("object")
                .to_string(),
            description: String::new(),
        }),
    }
}
