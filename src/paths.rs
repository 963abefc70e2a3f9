use std::path::PathBuf;
use std::sync::OnceLock;

static SKILLBRIDGE_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the Skillbridge home directory (`~/.skillbridge/`).
/// Supports `$SKILLBRIDGE_HOME` env override. Cached via `OnceLock`.
pub fn skillbridge_home() -> &'static PathBuf {
    SKILLBRIDGE_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("SKILLBRIDGE_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".skillbridge")
    })
}

/// `~/.skillbridge/skills/` — the default skills root.
pub fn skills_dir() -> PathBuf {
    skillbridge_home().join("skills")
}

/// `~/.skillbridge/logs/`
pub fn logs_dir() -> PathBuf {
    skillbridge_home().join("logs")
}
