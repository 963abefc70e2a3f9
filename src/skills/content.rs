//! Skill documentation parsing.
//!
//! Reads `SKILL.md` once per cache lifetime, strips the front-matter, and
//! splits the body into named sections (level-2/3 headings) and fenced code
//! blocks.

use super::cache::TtlCache;
use super::metadata::{split_front_matter, SKILL_FILE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillContent {
    /// Documentation body with front-matter removed.
    pub raw: String,
    pub sections: Vec<ContentSection>,
    pub code_blocks: Vec<CodeBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSection {
    pub title: String,
    pub body: String,
    /// Heading depth: 2 or 3.
    pub level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

/// Parse documentation text into ordered sections and fenced code blocks.
pub fn parse_instructions(text: &str) -> SkillContent {
    let body = match split_front_matter(text) {
        Some((_, body)) => body,
        None => text,
    };
    let body = body.trim_start_matches('\n');

    let mut sections: Vec<ContentSection> = Vec::new();
    let mut code_blocks: Vec<CodeBlock> = Vec::new();

    let mut current_title: Option<(String, u8)> = None;
    let mut current_body = String::new();
    let mut fence: Option<CodeBlock> = None;

    let mut flush =
        |title: &mut Option<(String, u8)>, body: &mut String, out: &mut Vec<ContentSection>| {
            if let Some((t, level)) = title.take() {
                out.push(ContentSection {
                    title: t,
                    body: body.trim().to_string(),
                    level,
                });
            }
            body.clear();
        };

    for line in body.lines() {
        if let Some(block) = fence.as_mut() {
            if line.trim_start().starts_with("```") {
                if let Some(done) = fence.take() {
                    code_blocks.push(done);
                }
            } else {
                block.code.push_str(line);
                block.code.push('\n');
            }
            current_body.push_str(line);
            current_body.push('\n');
            continue;
        }

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            fence = Some(CodeBlock {
                language: trimmed.trim_start_matches('`').trim().to_string(),
                code: String::new(),
            });
            current_body.push_str(line);
            current_body.push('\n');
            continue;
        }

        let heading = if let Some(rest) = trimmed.strip_prefix("### ") {
            Some((rest.trim().to_string(), 3u8))
        } else if let Some(rest) = trimmed.strip_prefix("## ") {
            Some((rest.trim().to_string(), 2u8))
        } else {
            None
        };

        match heading {
            Some((title, level)) => {
                flush(&mut current_title, &mut current_body, &mut sections);
                current_title = Some((title, level));
            }
            None => {
                current_body.push_str(line);
                current_body.push('\n');
            }
        }
    }
    // An unterminated fence still counts as a block.
    if let Some(block) = fence.take() {
        code_blocks.push(block);
    }
    flush(&mut current_title, &mut current_body, &mut sections);

    SkillContent {
        raw: body.trim().to_string(),
        sections,
        code_blocks,
    }
}

/// Cached reader over `parse_instructions`.
pub struct InstructionLoader {
    cache: Arc<TtlCache<String, Arc<SkillContent>>>,
}

impl InstructionLoader {
    pub fn new(cache: Arc<TtlCache<String, Arc<SkillContent>>>) -> Self {
        Self { cache }
    }

    /// Load and parse the documentation for `name` from `skill_dir`,
    /// consulting the content cache first. The bool is the cache-hit flag.
    pub fn load(&self, name: &str, skill_dir: &Path) -> Result<(Arc<SkillContent>, bool)> {
        let key = name.to_lowercase();
        if let Some(content) = self.cache.get(&key) {
            return Ok((content, true));
        }
        let path = skill_dir.join(SKILL_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {:?}", path))?;
        let content = Arc::new(parse_instructions(&text));
        self.cache.set(key, content.clone());
        Ok((content, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\nname: x\ndescription: d\nkeywords: [a]\n---\n\nIntro text.\n\n## Usage\n\nCall the thing.\n\n```python\nprint(\"hi\")\n```\n\n### Advanced\n\nMore.\n\n## Notes\n\nFinal.\n";

    #[test]
    fn splits_sections_on_level_2_and_3_headings() {
        let content = parse_instructions(DOC);
        let titles: Vec<&str> = content.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Usage", "Advanced", "Notes"]);
        assert_eq!(content.sections[0].level, 2);
        assert_eq!(content.sections[1].level, 3);
        assert!(content.sections[0].body.contains("Call the thing."));
    }

    #[test]
    fn captures_fenced_code_with_language() {
        let content = parse_instructions(DOC);
        assert_eq!(content.code_blocks.len(), 1);
        assert_eq!(content.code_blocks[0].language, "python");
        assert_eq!(content.code_blocks[0].code.trim(), "print(\"hi\")");
    }

    #[test]
    fn front_matter_is_stripped() {
        let content = parse_instructions(DOC);
        assert!(!content.raw.contains("keywords"));
        assert!(content.raw.starts_with("Intro text."));
    }

    #[test]
    fn heading_inside_fence_is_not_a_section() {
        let doc = "## Real\n\n```md\n## Fake heading\n```\n";
        let content = parse_instructions(doc);
        assert_eq!(content.sections.len(), 1);
        assert_eq!(content.sections[0].title, "Real");
        assert_eq!(content.code_blocks.len(), 1);
        assert!(content.code_blocks[0].code.contains("Fake heading"));
    }

    #[test]
    fn document_without_front_matter_parses() {
        let content = parse_instructions("## Only\n\nbody\n");
        assert_eq!(content.sections.len(), 1);
        assert_eq!(content.raw, "## Only\n\nbody");
    }

    #[test]
    fn loader_caches_by_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SKILL_FILE), DOC).unwrap();
        let cache = Arc::new(TtlCache::new("content", 8, std::time::Duration::from_secs(60)));
        let loader = InstructionLoader::new(cache);
        let (_, hit) = loader.load("X", tmp.path()).unwrap();
        assert!(!hit);
        let (content, hit) = loader.load("x", tmp.path()).unwrap();
        assert!(hit);
        assert_eq!(content.sections.len(), 3);
    }
}
