//! Skill descriptor parsing and validation.
//!
//! A skill directory declares itself either through YAML front-matter at the
//! top of `SKILL.md` (preferred) or through a `METADATA.yml` sidecar. The
//! loader applies defaults, validates invariants, normalizes resource paths
//! and the security policy, and checks the descriptor against the metadata
//! token budget.

use crate::errors::ErrorCode;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SKILL_FILE: &str = "SKILL.md";
pub const SIDECAR_FILE: &str = "METADATA.yml";

// ---------------------------------------------------------------------------
// Metadata model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub version: String,
    #[serde(rename = "type")]
    pub skill_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub domain: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<SkillTriggers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub security: SecurityPolicy,
    pub resources: ResourceDecl,
    pub cacheable: bool,
    /// Cache lifetime in seconds; always > 0.
    pub ttl: u64,
    #[serde(default)]
    pub tools: Vec<SkillToolDef>,
    /// Unknown front-matter fields, preserved but never dispatched on.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Absolute path of the skill directory.
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillTriggers {
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub phrases: Vec<String>,
    #[serde(default, alias = "eventTypes")]
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    None,
    Allowlist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilesystemPolicy {
    None,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub network: NetworkPolicy,
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    pub filesystem: FilesystemPolicy,
    /// Names of host environment variables forwarded to the subprocess.
    #[serde(default)]
    pub environment: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            memory_mb: 128,
            network: NetworkPolicy::None,
            network_allowlist: Vec::new(),
            filesystem: FilesystemPolicy::ReadOnly,
            environment: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Entry script, relative to the skill root (`./scripts/execute.py`).
    pub entry: String,
    #[serde(default)]
    pub helpers: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParamDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<ToolReturnDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParamDef {
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ParamValidation>,
}

fn default_param_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReturnDef {
    #[serde(rename = "type", default = "default_param_type")]
    pub return_type: String,
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Load errors
// ---------------------------------------------------------------------------

/// Metadata load failure with a stable code, downcastable through `anyhow`.
#[derive(Debug, Clone)]
pub struct MetadataError {
    pub code: ErrorCode,
    pub message: String,
}

impl MetadataError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidMetadata,
            message: message.into(),
        }
    }

    pub fn entry_missing(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::EntryMissing,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for MetadataError {}

// ---------------------------------------------------------------------------
// Raw front-matter shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawMetadata {
    name: String,
    #[serde(default, alias = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "type")]
    skill_type: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    triggers: Option<SkillTriggers>,
    #[serde(default)]
    input_schema: Option<serde_json::Value>,
    #[serde(default)]
    output_schema: Option<serde_json::Value>,
    #[serde(default, alias = "permissions")]
    security: Option<RawSecurity>,
    #[serde(default)]
    resources: Option<RawResources>,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
    #[serde(default = "default_ttl")]
    ttl: u64,
    #[serde(default)]
    tools: Vec<SkillToolDef>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn default_cacheable() -> bool {
    true
}

fn default_ttl() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
struct RawSecurity {
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    memory_mb: Option<u64>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    network_allowlist: Vec<String>,
    #[serde(default)]
    filesystem: Option<String>,
    #[serde(default)]
    environment: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawResources {
    #[serde(default)]
    entry: Option<String>,
    #[serde(default)]
    helpers: Vec<String>,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    assets: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoadedMetadata {
    pub metadata: SkillMetadata,
    pub warnings: Vec<String>,
}

pub struct MetadataLoader {
    strict: bool,
    max_metadata_tokens: usize,
}

impl MetadataLoader {
    pub fn new(cfg: &crate::config::SkillsConfig) -> Self {
        Self {
            strict: cfg.strict,
            max_metadata_tokens: cfg.max_metadata_tokens,
        }
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Load and validate the descriptor for one skill directory.
    pub fn load_dir(&self, dir: &Path) -> Result<LoadedMetadata> {
        let mut warnings = Vec::new();
        let raw = self.read_descriptor(dir)?;

        if raw.name.trim().is_empty() {
            return Err(MetadataError::invalid("skill name is empty").into());
        }
        if raw.description.trim().is_empty() {
            return Err(MetadataError::invalid(format!(
                "skill '{}' has no description",
                raw.name
            ))
            .into());
        }
        if raw.keywords.is_empty() {
            return Err(MetadataError::invalid(format!(
                "skill '{}' declares no keywords",
                raw.name
            ))
            .into());
        }
        if raw.ttl == 0 {
            return Err(
                MetadataError::invalid(format!("skill '{}' has ttl = 0", raw.name)).into(),
            );
        }

        let security = self.normalize_security(&raw, &mut warnings)?;
        let resources = self.normalize_resources(&raw, dir, &mut warnings)?;
        self.check_canonical_layout(dir, &resources, &mut warnings);
        self.check_resource_files(&raw.name, dir, &resources, &mut warnings)?;

        let description_tokens = estimate_tokens(&raw.description);
        if description_tokens > self.max_metadata_tokens {
            let msg = format!(
                "skill '{}' description is {} tokens (budget {})",
                raw.name, description_tokens, self.max_metadata_tokens
            );
            if self.strict {
                return Err(MetadataError::invalid(msg).into());
            }
            warnings.push(msg);
        }

        let display_name = raw
            .display_name
            .clone()
            .unwrap_or_else(|| raw.name.clone());
        let metadata = SkillMetadata {
            name: raw.name,
            display_name,
            description: raw.description,
            version: raw.version.unwrap_or_else(|| "0.1.0".to_string()),
            skill_type: raw.skill_type.unwrap_or_else(|| "general".to_string()),
            protocol: raw.protocol,
            domain: raw.domain.unwrap_or_else(|| "general".to_string()),
            keywords: raw.keywords,
            tags: raw.tags,
            capabilities: raw.capabilities,
            triggers: raw.triggers,
            input_schema: raw.input_schema,
            output_schema: raw.output_schema,
            security,
            resources,
            cacheable: raw.cacheable,
            ttl: raw.ttl,
            tools: raw.tools,
            extra: raw.extra,
            path: dir.to_path_buf(),
            loaded_at: Utc::now(),
        };

        for w in &warnings {
            warn!("{}", w);
        }

        Ok(LoadedMetadata { metadata, warnings })
    }

    /// Front-matter in SKILL.md wins; METADATA.yml is the fallback.
    fn read_descriptor(&self, dir: &Path) -> Result<RawMetadata> {
        let skill_md = dir.join(SKILL_FILE);
        if skill_md.is_file() {
            let text = std::fs::read_to_string(&skill_md)?;
            if let Some((front, _)) = split_front_matter(&text) {
                let raw: RawMetadata = serde_yml::from_str(front).map_err(|e| {
                    MetadataError::invalid(format!("bad front-matter in {:?}: {}", skill_md, e))
                })?;
                return Ok(raw);
            }
        }
        let sidecar = dir.join(SIDECAR_FILE);
        if sidecar.is_file() {
            let text = std::fs::read_to_string(&sidecar)?;
            let raw: RawMetadata = serde_yml::from_str(&text).map_err(|e| {
                MetadataError::invalid(format!("bad sidecar {:?}: {}", sidecar, e))
            })?;
            return Ok(raw);
        }
        Err(MetadataError::invalid(format!("no descriptor found in {:?}", dir)).into())
    }

    fn normalize_security(
        &self,
        raw: &RawMetadata,
        warnings: &mut Vec<String>,
    ) -> Result<SecurityPolicy> {
        let sec = raw.security.as_ref();
        let defaults = SecurityPolicy::default();

        let network_raw = sec.and_then(|s| s.network.as_deref()).unwrap_or("none");
        let allowlist: Vec<String> = sec.map(|s| s.network_allowlist.clone()).unwrap_or_default();
        let network = match network_raw {
            "none" => NetworkPolicy::None,
            "allowlist" => {
                if allowlist.is_empty() {
                    // Empty allowlist is ambiguous; resolve to no network.
                    warnings.push(format!(
                        "skill '{}': network allowlist is empty, treating as none",
                        raw.name
                    ));
                    NetworkPolicy::None
                } else {
                    NetworkPolicy::Allowlist
                }
            }
            other => {
                return Err(MetadataError::invalid(format!(
                    "skill '{}': unknown network policy '{}'",
                    raw.name, other
                ))
                .into())
            }
        };

        let fs_raw = sec.and_then(|s| s.filesystem.as_deref()).unwrap_or("read-only");
        let filesystem = match fs_raw {
            "none" => FilesystemPolicy::None,
            "read-only" | "readonly" | "read" => FilesystemPolicy::ReadOnly,
            "read-write" | "readwrite" | "write" => FilesystemPolicy::ReadWrite,
            other => {
                return Err(MetadataError::invalid(format!(
                    "skill '{}': unknown filesystem policy '{}'",
                    raw.name, other
                ))
                .into())
            }
        };

        Ok(SecurityPolicy {
            timeout_ms: sec.and_then(|s| s.timeout_ms).unwrap_or(defaults.timeout_ms),
            memory_mb: sec.and_then(|s| s.memory_mb).unwrap_or(defaults.memory_mb),
            network,
            network_allowlist: if network == NetworkPolicy::Allowlist {
                allowlist
            } else {
                Vec::new()
            },
            filesystem,
            environment: sec.map(|s| s.environment.clone()).unwrap_or_default(),
        })
    }

    fn normalize_resources(
        &self,
        raw: &RawMetadata,
        dir: &Path,
        _warnings: &mut [String],
    ) -> Result<ResourceDecl> {
        let res = raw.resources.as_ref();
        let entry = match res.and_then(|r| r.entry.as_deref()) {
            Some(e) => normalize_rel_path(&raw.name, e)?,
            None => match find_default_entry(dir) {
                Some(e) => e,
                None => {
                    return Err(MetadataError::entry_missing(format!(
                        "skill '{}' declares no entry and has no scripts/execute.*",
                        raw.name
                    ))
                    .into())
                }
            },
        };

        let normalize_all = |paths: &[String]| -> Result<Vec<String>> {
            paths
                .iter()
                .map(|p| normalize_rel_path(&raw.name, p))
                .collect()
        };

        Ok(ResourceDecl {
            entry,
            helpers: normalize_all(&res.map(|r| r.helpers.clone()).unwrap_or_default())?,
            references: normalize_all(&res.map(|r| r.references.clone()).unwrap_or_default())?,
            assets: normalize_all(&res.map(|r| r.assets.clone()).unwrap_or_default())?,
        })
    }

    fn check_canonical_layout(
        &self,
        dir: &Path,
        resources: &ResourceDecl,
        warnings: &mut Vec<String>,
    ) {
        let has_scripts = dir.join("scripts").is_dir();
        if !has_scripts || !resources.entry.starts_with("./scripts/") {
            warnings.push(format!(
                "skill at {:?} uses a non-canonical layout (entry {})",
                dir, resources.entry
            ));
        }
    }

    fn check_resource_files(
        &self,
        name: &str,
        dir: &Path,
        resources: &ResourceDecl,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        // Entry must exist; that invariant is load-bearing for the sandbox.
        let entry_path = dir.join(resources.entry.trim_start_matches("./"));
        if !entry_path.is_file() {
            return Err(MetadataError::entry_missing(format!(
                "skill '{}': entry {:?} does not exist",
                name, entry_path
            ))
            .into());
        }

        for (kind, list) in [
            ("helper", &resources.helpers),
            ("reference", &resources.references),
            ("asset", &resources.assets),
        ] {
            for rel in list {
                let path = dir.join(rel.trim_start_matches("./"));
                if !path.exists() {
                    let msg = format!("skill '{}': {} {:?} does not exist", name, kind, path);
                    if self.strict {
                        return Err(MetadataError::invalid(msg).into());
                    }
                    warnings.push(msg);
                }
            }
        }
        Ok(())
    }
}

/// Split a document into (front-matter YAML, body). Returns `None` when the
/// document does not open with a `---` fence.
pub fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    if !text.starts_with("---") {
        return None;
    }
    let mut parts = text.splitn(3, "---");
    parts.next()?;
    let front = parts.next()?;
    let body = parts.next()?;
    Some((front, body))
}

/// Normalize a skill-relative resource path to `./…` form, rejecting
/// anything that escapes the skill root.
pub fn normalize_rel_path(skill: &str, path: &str) -> Result<String> {
    let trimmed = path.trim().trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(MetadataError::invalid(format!("skill '{}': empty resource path", skill)).into());
    }
    if Path::new(trimmed).is_absolute()
        || trimmed
            .split(['/', '\\'])
            .any(|component| component == "..")
    {
        return Err(MetadataError::invalid(format!(
            "skill '{}': resource path '{}' escapes the skill root",
            skill, path
        ))
        .into());
    }
    Ok(format!("./{}", trimmed.replace('\\', "/")))
}

/// Locate the canonical default entry `scripts/execute.*`.
fn find_default_entry(dir: &Path) -> Option<String> {
    let scripts = dir.join("scripts");
    let entries = std::fs::read_dir(&scripts).ok()?;
    let mut candidates: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let file_name = e.file_name().to_string_lossy().to_string();
            let stem = Path::new(&file_name)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())?;
            (stem == "execute").then(|| format!("./scripts/{}", file_name))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Cheap token estimate used against the metadata budget (≈ 4 chars/token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_skill(dir: &Path, front_matter: &str) {
        fs::create_dir_all(dir.join("scripts")).unwrap();
        fs::write(dir.join("scripts/execute.py"), "print('{}')\n").unwrap();
        fs::write(
            dir.join(SKILL_FILE),
            format!("---\n{}\n---\n\n# Skill\n\nBody.\n", front_matter),
        )
        .unwrap();
    }

    fn loader() -> MetadataLoader {
        MetadataLoader::new(&crate::config::SkillsConfig::default())
    }

    #[test]
    fn loads_minimal_front_matter_with_defaults() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: dice\ndescription: Rolls a dice\nkeywords: [dice, random]",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        let m = &loaded.metadata;
        assert_eq!(m.name, "dice");
        assert_eq!(m.display_name, "dice");
        assert_eq!(m.version, "0.1.0");
        assert_eq!(m.domain, "general");
        assert!(m.cacheable);
        assert_eq!(m.ttl, 3600);
        assert_eq!(m.resources.entry, "./scripts/execute.py");
        assert_eq!(m.security.timeout_ms, 3000);
        assert_eq!(m.security.filesystem, FilesystemPolicy::ReadOnly);
    }

    #[test]
    fn sidecar_is_used_without_front_matter() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("scripts")).unwrap();
        fs::write(tmp.path().join("scripts/execute.sh"), "#!/bin/sh\n").unwrap();
        fs::write(tmp.path().join(SKILL_FILE), "# No front matter here\n").unwrap();
        fs::write(
            tmp.path().join(SIDECAR_FILE),
            "name: side\ndescription: Sidecar skill\nkeywords: [side]\n",
        )
        .unwrap();
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert_eq!(loaded.metadata.name, "side");
    }

    #[test]
    fn empty_keywords_rejected() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "name: x\ndescription: d\nkeywords: []");
        let err = loader().load_dir(tmp.path()).unwrap_err();
        let meta_err = err.downcast_ref::<MetadataError>().unwrap();
        assert_eq!(meta_err.code, ErrorCode::InvalidMetadata);
    }

    #[test]
    fn zero_ttl_rejected() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nttl: 0",
        );
        assert!(loader().load_dir(tmp.path()).is_err());
    }

    #[test]
    fn missing_entry_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nresources:\n  entry: scripts/missing.py",
        );
        let err = loader().load_dir(tmp.path()).unwrap_err();
        let meta_err = err.downcast_ref::<MetadataError>().unwrap();
        assert_eq!(meta_err.code, ErrorCode::EntryMissing);
    }

    #[test]
    fn missing_helper_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nresources:\n  entry: scripts/execute.py\n  helpers: [scripts/util.py]",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert!(loaded.warnings.iter().any(|w| w.contains("helper")));
    }

    #[test]
    fn path_escape_rejected() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nresources:\n  entry: ../outside.sh",
        );
        assert!(loader().load_dir(tmp.path()).is_err());
    }

    #[test]
    fn empty_allowlist_coerced_to_none() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nsecurity:\n  network: allowlist",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert_eq!(loaded.metadata.security.network, NetworkPolicy::None);
        assert!(loaded.warnings.iter().any(|w| w.contains("allowlist")));
    }

    #[test]
    fn filesystem_read_alias_coerced() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nsecurity:\n  filesystem: read",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert_eq!(
            loaded.metadata.security.filesystem,
            FilesystemPolicy::ReadOnly
        );
    }

    #[test]
    fn oversized_description_warns_then_errors_in_strict() {
        let tmp = TempDir::new().unwrap();
        let long = "word ".repeat(200);
        write_skill(
            tmp.path(),
            &format!("name: x\ndescription: {}\nkeywords: [a]", long.trim()),
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert!(loaded.warnings.iter().any(|w| w.contains("budget")));

        let strict = MetadataLoader {
            strict: true,
            max_metadata_tokens: 50,
        };
        assert!(strict.load_dir(tmp.path()).is_err());
    }

    #[test]
    fn serialize_roundtrip_is_stable() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: dice\ndisplayName: Dice Roller\ndescription: Rolls dice\nkeywords: [dice]\ntools:\n  - name: roll\n    description: Roll the dice\n    parameters:\n      sides:\n        type: number\n        required: true",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        let json = serde_json::to_string(&loaded.metadata).unwrap();
        let back: SkillMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, loaded.metadata.name);
        assert_eq!(back.display_name, "Dice Roller");
        assert_eq!(back.tools.len(), 1);
        assert_eq!(back.resources.entry, loaded.metadata.resources.entry);
    }

    #[test]
    fn unknown_fields_preserved_in_extra() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "name: x\ndescription: d\nkeywords: [a]\nauthor: someone",
        );
        let loaded = loader().load_dir(tmp.path()).unwrap();
        assert_eq!(
            loaded.metadata.extra.get("author").and_then(|v| v.as_str()),
            Some("someone")
        );
    }
}
