//! Tool-catalog rendering under three disclosure phases.
//!
//! The phase controls verbosity per tool: `metadata` is a one-liner,
//! `brief` adds parameter names and types, `full` adds descriptions,
//! validation, the return type and one example invocation. The default
//! phase adapts to how many skills are indexed. Output ordering is stable.

use crate::skills::metadata::{SkillToolDef, ToolParamDef};
use crate::skills::{SkillIndex, SkillsLoader};
use anyhow::Result;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisclosurePhase {
    Metadata,
    Brief,
    Full,
}

impl DisclosurePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisclosurePhase::Metadata => "metadata",
            DisclosurePhase::Brief => "brief",
            DisclosurePhase::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "metadata" => Some(DisclosurePhase::Metadata),
            "brief" => Some(DisclosurePhase::Brief),
            "full" => Some(DisclosurePhase::Full),
            _ => None,
        }
    }
}

/// Adaptive default: few skills get the full story, many get one-liners.
pub fn default_phase(skill_count: usize) -> DisclosurePhase {
    match skill_count {
        0..=3 => DisclosurePhase::Full,
        4..=8 => DisclosurePhase::Brief,
        _ => DisclosurePhase::Metadata,
    }
}

pub struct ToolDescriptionGenerator {
    index: Arc<SkillIndex>,
    loader: Arc<SkillsLoader>,
    phase_override: Option<DisclosurePhase>,
    example_sentinels: (String, String),
    /// Rendered catalog per (index generation, phase); re-indexing
    /// invalidates by key.
    cache: Mutex<HashMap<(u64, DisclosurePhase), String>>,
}

impl ToolDescriptionGenerator {
    pub fn new(
        index: Arc<SkillIndex>,
        loader: Arc<SkillsLoader>,
        cfg: &crate::config::RuntimeConfig,
    ) -> Self {
        Self {
            index,
            loader,
            phase_override: cfg
                .catalog
                .phase_override
                .as_deref()
                .and_then(DisclosurePhase::parse),
            example_sentinels: (
                cfg.parser.open_sentinel.clone(),
                cfg.parser.close_sentinel.clone(),
            ),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Phase resolution: explicit request > config override > adaptive.
    pub fn effective_phase(&self, requested: Option<DisclosurePhase>) -> DisclosurePhase {
        requested
            .or(self.phase_override)
            .unwrap_or_else(|| default_phase(self.index.len()))
    }

    /// Render the whole catalog, ordered by skill name.
    pub fn all_tools_description(&self, requested: Option<DisclosurePhase>) -> String {
        let phase = self.effective_phase(requested);
        let generation = self.index.generation();
        if let Some(cached) = self.cache.lock().unwrap().get(&(generation, phase)) {
            return cached.clone();
        }

        let mut out = String::new();
        for skill in self.index.all() {
            let tools = match self.loader.tool_definitions(&skill.metadata.name) {
                Ok(tools) => tools,
                Err(e) => {
                    debug!("skipping '{}' in catalog: {}", skill.metadata.name, e);
                    continue;
                }
            };
            for tool in &tools {
                out.push_str(&self.render_tool(tool, phase));
                out.push('\n');
            }
        }
        let out = out.trim_end().to_string();

        let mut cache = self.cache.lock().unwrap();
        // Old generations are dead weight once the index moved on.
        cache.retain(|(g, _), _| *g == generation);
        cache.insert((generation, phase), out.clone());
        out
    }

    /// Render one skill's tools at a phase.
    pub fn tool_description(&self, name: &str, phase: DisclosurePhase) -> Result<String> {
        let tools = self.loader.tool_definitions(name)?;
        let mut out = String::new();
        for tool in &tools {
            out.push_str(&self.render_tool(tool, phase));
            out.push('\n');
        }
        Ok(out.trim_end().to_string())
    }

    /// Per-tool text. Each phase extends the previous one, so `metadata`
    /// output is a prefix of `brief`, which is a prefix of `full`.
    fn render_tool(&self, tool: &SkillToolDef, phase: DisclosurePhase) -> String {
        let mut out = String::new();
        let description = tool.description.lines().next().unwrap_or_default().trim();
        let _ = writeln!(out, "- {}: {}", tool.name, description);
        if phase == DisclosurePhase::Metadata {
            return out;
        }

        if !tool.parameters.is_empty() {
            let brief: Vec<String> = tool
                .parameters
                .iter()
                .map(|(name, p)| {
                    if p.required {
                        format!("{} ({}, required)", name, p.param_type)
                    } else {
                        format!("{} ({})", name, p.param_type)
                    }
                })
                .collect();
            let _ = writeln!(out, "  parameters: {}", brief.join(", "));
        }
        if phase == DisclosurePhase::Brief {
            return out;
        }

        for (name, p) in &tool.parameters {
            let mut line = format!("  - {}", name);
            if !p.description.is_empty() {
                let _ = write!(line, ": {}", p.description);
            }
            if let Some(v) = &p.validation {
                let mut constraints = Vec::new();
                if let Some(min) = v.min {
                    constraints.push(format!("min {}", min));
                }
                if let Some(max) = v.max {
                    constraints.push(format!("max {}", max));
                }
                if let Some(pattern) = &v.pattern {
                    constraints.push(format!("pattern {}", pattern));
                }
                if let Some(allowed) = &v.enum_values {
                    let rendered: Vec<String> =
                        allowed.iter().map(|value| value.to_string()).collect();
                    constraints.push(format!("one of {}", rendered.join("|")));
                }
                if !constraints.is_empty() {
                    let _ = write!(line, " [{}]", constraints.join(", "));
                }
            }
            if let Some(default) = &p.default {
                let _ = write!(line, " (default {})", default);
            }
            let _ = writeln!(out, "{}", line);
        }
        if let Some(returns) = &tool.returns {
            if returns.description.is_empty() {
                let _ = writeln!(out, "  returns: {}", returns.return_type);
            } else {
                let _ = writeln!(
                    out,
                    "  returns: {} — {}",
                    returns.return_type, returns.description
                );
            }
        }
        let _ = writeln!(
            out,
            "  example: {}{}{}",
            self.example_sentinels.0,
            example_invocation(tool),
            self.example_sentinels.1
        );
        out
    }
}

fn example_invocation(tool: &SkillToolDef) -> String {
    let mut params = serde_json::Map::new();
    for (name, p) in &tool.parameters {
        if !p.required && p.default.is_none() {
            continue;
        }
        params.insert(name.clone(), example_value(p));
    }
    serde_json::json!({"tool": tool.name, "parameters": params}).to_string()
}

fn example_value(p: &ToolParamDef) -> serde_json::Value {
    if let Some(default) = &p.default {
        return default.clone();
    }
    if let Some(allowed) = p
        .validation
        .as_ref()
        .and_then(|v| v.enum_values.as_ref())
        .and_then(|vals| vals.first())
    {
        return allowed.clone();
    }
    match p.param_type.as_str() {
        "number" | "integer" => serde_json::json!(3),
        "boolean" => serde_json::json!(true),
        "array" => serde_json::json!([]),
        "object" => serde_json::json!({}),
        _ => serde_json::json!("example"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::CacheSet;
    use std::fs;
    use tempfile::TempDir;

    fn setup(skill_count: usize) -> (TempDir, ToolDescriptionGenerator) {
        let tmp = TempDir::new().unwrap();
        for i in 0..skill_count {
            let dir = tmp.path().join(format!("skill{i:02}"));
            fs::create_dir_all(dir.join("scripts")).unwrap();
            fs::write(dir.join("scripts/execute.py"), "print()\n").unwrap();
            fs::write(
                dir.join("SKILL.md"),
                format!(
                    "---\nname: skill{i:02}\ndescription: Does thing {i}\nkeywords: [k{i}]\ntools:\n  - name: tool{i:02}\n    description: Tool number {i}\n    parameters:\n      count:\n        type: number\n        required: true\n        description: How many\n        validation:\n          min: 1\n          max: 10\n    returns:\n      type: object\n      description: the result\n---\n\nDocs.\n"
                ),
            )
            .unwrap();
        }
        let mut cfg = crate::config::RuntimeConfig::default();
        cfg.skills.roots = vec![tmp.path().to_path_buf()];
        let index = Arc::new(SkillIndex::new(&cfg));
        index.index_all().unwrap();
        let caches = Arc::new(CacheSet::new(&cfg.cache));
        let loader = Arc::new(SkillsLoader::new(index.clone(), caches));
        let generator = ToolDescriptionGenerator::new(index, loader, &cfg);
        (tmp, generator)
    }

    #[test]
    fn adaptive_phase_by_skill_count() {
        assert_eq!(default_phase(2), DisclosurePhase::Full);
        assert_eq!(default_phase(3), DisclosurePhase::Full);
        assert_eq!(default_phase(4), DisclosurePhase::Brief);
        assert_eq!(default_phase(8), DisclosurePhase::Brief);
        assert_eq!(default_phase(9), DisclosurePhase::Metadata);
        assert_eq!(default_phase(40), DisclosurePhase::Metadata);
    }

    #[test]
    fn two_skills_default_to_full() {
        let (_tmp, generator) = setup(2);
        assert_eq!(generator.effective_phase(None), DisclosurePhase::Full);
        let text = generator.all_tools_description(None);
        assert!(text.contains("example:"));
        assert!(text.contains("returns: object"));
    }

    #[test]
    fn ten_skills_default_to_metadata() {
        let (_tmp, generator) = setup(10);
        assert_eq!(generator.effective_phase(None), DisclosurePhase::Metadata);
        let text = generator.all_tools_description(None);
        assert!(!text.contains("parameters:"));
        assert!(!text.contains("example:"));
    }

    #[test]
    fn explicit_phase_overrides_adaptive() {
        let (_tmp, generator) = setup(10);
        let text = generator.all_tools_description(Some(DisclosurePhase::Brief));
        assert!(text.contains("parameters: count (number, required)"));
        assert!(!text.contains("example:"));
    }

    #[test]
    fn phases_are_prefixes_of_each_other() {
        let (_tmp, generator) = setup(2);
        let metadata = generator
            .tool_description("skill00", DisclosurePhase::Metadata)
            .unwrap();
        let brief = generator
            .tool_description("skill00", DisclosurePhase::Brief)
            .unwrap();
        let full = generator
            .tool_description("skill00", DisclosurePhase::Full)
            .unwrap();
        assert!(brief.starts_with(&metadata));
        assert!(full.starts_with(&brief));
        assert!(full.len() > brief.len() && brief.len() > metadata.len());
    }

    #[test]
    fn output_ordering_is_stable() {
        let (_tmp, generator) = setup(5);
        let a = generator.all_tools_description(Some(DisclosurePhase::Metadata));
        let b = generator.all_tools_description(Some(DisclosurePhase::Metadata));
        assert_eq!(a, b);
        let first = a.lines().next().unwrap();
        assert!(first.starts_with("- tool00:"));
    }

    #[test]
    fn full_phase_renders_validation_and_example() {
        let (_tmp, generator) = setup(1);
        let text = generator
            .tool_description("skill00", DisclosurePhase::Full)
            .unwrap();
        assert!(text.contains("[min 1, max 10]"));
        assert!(text.contains("example: <tool_call>{\"tool\":\"tool00\""));
    }
}
