//! Resource enumeration for a skill directory.
//!
//! Classifies files under `scripts/`, `references/` and `assets/` by fixed
//! extension sets and infers dependency hints from well-known directory
//! names. Asset bodies are never read.

use super::cache::TtlCache;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCRIPT_EXTS: &[&str] = &["sh", "bash", "py", "js", "mjs", "ts", "rb", "pl"];
const REFERENCE_EXTS: &[&str] = &["md", "txt", "rst", "html", "pdf"];

/// Directory names that imply an installed dependency tree.
const DEPENDENCY_DIRS: &[&str] = &["node_modules", ".venv", "venv", "vendor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Reference,
    Asset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFile {
    /// Path relative to the skill root.
    pub path: PathBuf,
    pub size: u64,
    pub mime: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillResources {
    pub scripts: Vec<ResourceFile>,
    pub references: Vec<ResourceFile>,
    pub assets: Vec<ResourceFile>,
    /// Symbolic hints like `"node_modules"`.
    pub dependency_hints: Vec<String>,
}

impl SkillResources {
    pub fn total_files(&self) -> usize {
        self.scripts.len() + self.references.len() + self.assets.len()
    }
}

fn classify(rel: &Path) -> ResourceKind {
    // The canonical directory wins over the extension.
    match rel.components().next().and_then(|c| c.as_os_str().to_str()) {
        Some("scripts") => return ResourceKind::Script,
        Some("references") => return ResourceKind::Reference,
        Some("assets") => return ResourceKind::Asset,
        _ => {}
    }
    let ext = rel
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if SCRIPT_EXTS.contains(&ext.as_str()) {
        ResourceKind::Script
    } else if REFERENCE_EXTS.contains(&ext.as_str()) {
        ResourceKind::Reference
    } else {
        ResourceKind::Asset
    }
}

/// Enumerate and classify the files under a skill directory.
pub fn scan_resources(dir: &Path) -> Result<SkillResources> {
    let mut out = SkillResources::default();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = match entry {
                Ok(v) => v,
                Err(_) => continue,
            };
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                if DEPENDENCY_DIRS.contains(&file_name) {
                    if !out.dependency_hints.contains(&file_name.to_string()) {
                        out.dependency_hints.push(file_name.to_string());
                    }
                    // Dependency trees are huge; the hint is enough.
                    continue;
                }
                if file_name.starts_with('.') {
                    continue;
                }
                stack.push(path);
                continue;
            }
            if file_name.starts_with('.')
                || file_name == super::metadata::SKILL_FILE
                || file_name == super::metadata::SIDECAR_FILE
            {
                continue;
            }
            let Ok(rel) = path.strip_prefix(dir) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let mime = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let file = ResourceFile {
                path: rel.to_path_buf(),
                size,
                mime,
                kind: classify(rel),
            };
            match file.kind {
                ResourceKind::Script => out.scripts.push(file),
                ResourceKind::Reference => out.references.push(file),
                ResourceKind::Asset => out.assets.push(file),
            }
        }
    }

    // Deterministic listing regardless of directory walk order.
    out.scripts.sort_by(|a, b| a.path.cmp(&b.path));
    out.references.sort_by(|a, b| a.path.cmp(&b.path));
    out.assets.sort_by(|a, b| a.path.cmp(&b.path));
    out.dependency_hints.sort();
    Ok(out)
}

/// Cached wrapper over `scan_resources`.
pub struct ResourceLoader {
    cache: Arc<TtlCache<String, Arc<SkillResources>>>,
}

impl ResourceLoader {
    pub fn new(cache: Arc<TtlCache<String, Arc<SkillResources>>>) -> Self {
        Self { cache }
    }

    /// The bool is the cache-hit flag.
    pub fn load(&self, name: &str, skill_dir: &Path) -> Result<(Arc<SkillResources>, bool)> {
        let key = name.to_lowercase();
        if let Some(resources) = self.cache.get(&key) {
            return Ok((resources, true));
        }
        let resources = Arc::new(scan_resources(skill_dir)?);
        self.cache.set(key, resources.clone());
        Ok((resources, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("scripts")).unwrap();
        fs::create_dir_all(tmp.path().join("references")).unwrap();
        fs::create_dir_all(tmp.path().join("assets")).unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/dep")).unwrap();
        fs::write(tmp.path().join("SKILL.md"), "---\n---\n").unwrap();
        fs::write(tmp.path().join("scripts/execute.py"), "print()\n").unwrap();
        fs::write(tmp.path().join("scripts/util.sh"), "true\n").unwrap();
        fs::write(tmp.path().join("references/guide.md"), "# Guide\n").unwrap();
        fs::write(tmp.path().join("assets/logo.png"), [0u8; 16]).unwrap();
        fs::write(tmp.path().join("node_modules/dep/index.js"), "x\n").unwrap();
        tmp
    }

    #[test]
    fn classifies_by_canonical_directory() {
        let tmp = fixture();
        let res = scan_resources(tmp.path()).unwrap();
        assert_eq!(res.scripts.len(), 2);
        assert_eq!(res.references.len(), 1);
        assert_eq!(res.assets.len(), 1);
        assert_eq!(res.scripts[0].path, PathBuf::from("scripts/execute.py"));
        assert_eq!(res.assets[0].mime, "image/png");
    }

    #[test]
    fn descriptor_files_are_not_resources() {
        let tmp = fixture();
        let res = scan_resources(tmp.path()).unwrap();
        assert!(res
            .references
            .iter()
            .all(|f| f.path.file_name().unwrap() != "SKILL.md"));
    }

    #[test]
    fn dependency_dirs_become_hints_not_listings() {
        let tmp = fixture();
        let res = scan_resources(tmp.path()).unwrap();
        assert_eq!(res.dependency_hints, vec!["node_modules".to_string()]);
        assert!(res
            .scripts
            .iter()
            .all(|f| !f.path.starts_with("node_modules")));
    }

    #[test]
    fn extension_fallback_outside_canonical_dirs() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("run.py"), "x\n").unwrap();
        fs::write(tmp.path().join("README.md"), "x\n").unwrap();
        fs::write(tmp.path().join("data.bin"), [1u8]).unwrap();
        let res = scan_resources(tmp.path()).unwrap();
        assert_eq!(res.scripts.len(), 1);
        assert_eq!(res.references.len(), 1);
        assert_eq!(res.assets.len(), 1);
    }

    #[test]
    fn loader_hits_cache_on_second_read() {
        let tmp = fixture();
        let cache = Arc::new(TtlCache::new(
            "resources",
            8,
            std::time::Duration::from_secs(60),
        ));
        let loader = ResourceLoader::new(cache);
        let (_, hit) = loader.load("s", tmp.path()).unwrap();
        assert!(!hit);
        let (_, hit) = loader.load("s", tmp.path()).unwrap();
        assert!(hit);
    }
}
