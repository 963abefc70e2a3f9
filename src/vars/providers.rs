//! Built-in providers for the three recognized layers.
//!
//! Layer 1 (priority 10–30): system time/date. Layer 2 (40–60): environment
//! echo, scoped variables, static values. Layer 3 (70–95): agent personas,
//! the tool catalog, async results. Hosts register further providers (rag,
//! diary, …) through the same trait.

use super::catalog::{DisclosurePhase, ToolDescriptionGenerator};
use super::{ExpansionContext, Placeholder, VariableProvider};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// Layer 1 — system
// ---------------------------------------------------------------------------

pub struct TimeProvider;

impl VariableProvider for TimeProvider {
    fn namespace(&self) -> &str {
        "time"
    }
    fn priority(&self) -> u8 {
        10
    }
    fn expand(&self, _p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        Ok(Some(chrono::Local::now().format("%H:%M:%S").to_string()))
    }
    fn cacheable(&self) -> bool {
        false
    }
}

pub struct DateProvider;

impl VariableProvider for DateProvider {
    fn namespace(&self) -> &str {
        "date"
    }
    fn priority(&self) -> u8 {
        20
    }
    fn expand(&self, _p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        Ok(Some(chrono::Local::now().format("%Y-%m-%d").to_string()))
    }
    fn cacheable(&self) -> bool {
        false
    }
}

pub struct DateTimeProvider;

impl VariableProvider for DateTimeProvider {
    fn namespace(&self) -> &str {
        "datetime"
    }
    fn priority(&self) -> u8 {
        30
    }
    fn expand(&self, _p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        Ok(Some(
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        ))
    }
    fn cacheable(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Layer 2 — config-driven
// ---------------------------------------------------------------------------

/// `{{env:NAME}}` echoes a host environment variable. Unset names fall
/// through to the next provider.
pub struct EnvProvider;

impl VariableProvider for EnvProvider {
    fn namespace(&self) -> &str {
        "env"
    }
    fn priority(&self) -> u8 {
        40
    }
    fn expand(&self, p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        let Some(name) = p.args.first() else {
            return Ok(None);
        };
        Ok(std::env::var(name).ok())
    }
    fn cacheable(&self) -> bool {
        false
    }
}

/// Scope-keyed variables from the expansion context, e.g. `{{Var:topic}}`
/// reads `ctx.vars["Var:topic"]` then `ctx.vars["topic"]`.
pub struct ScopedVarProvider {
    scope: String,
    priority: u8,
}

impl ScopedVarProvider {
    pub fn new(scope: impl Into<String>, priority: u8) -> Self {
        Self {
            scope: scope.into(),
            priority,
        }
    }
}

impl VariableProvider for ScopedVarProvider {
    fn namespace(&self) -> &str {
        &self.scope
    }
    fn priority(&self) -> u8 {
        self.priority
    }
    fn expand(&self, p: &Placeholder, ctx: &ExpansionContext) -> Result<Option<String>> {
        let key = p.args.join(":");
        if key.is_empty() {
            return Ok(None);
        }
        let scoped = format!("{}:{}", self.scope, key);
        Ok(ctx
            .vars
            .get(&scoped)
            .or_else(|| ctx.vars.get(&key))
            .cloned())
    }
}

/// A fixed value for one namespace, e.g. `{{AppName}}`.
pub struct StaticProvider {
    namespace: String,
    value: String,
    priority: u8,
}

impl StaticProvider {
    pub fn new(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
            priority: 60,
        }
    }
}

impl VariableProvider for StaticProvider {
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn priority(&self) -> u8 {
        self.priority
    }
    fn expand(&self, _p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        Ok(Some(self.value.clone()))
    }
}

// ---------------------------------------------------------------------------
// Layer 3 — dynamic content
// ---------------------------------------------------------------------------

/// `{{agent:id}}` resolves a persona blurb registered by the host.
pub struct AgentProvider {
    personas: RwLock<HashMap<String, String>>,
}

impl AgentProvider {
    pub fn new() -> Self {
        Self {
            personas: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_persona(&self, id: impl Into<String>, text: impl Into<String>) {
        self.personas
            .write()
            .unwrap()
            .insert(id.into(), text.into());
    }
}

impl Default for AgentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableProvider for AgentProvider {
    fn namespace(&self) -> &str {
        "agent"
    }
    fn priority(&self) -> u8 {
        70
    }
    fn expand(&self, p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        let Some(id) = p.args.first() else {
            return Ok(None);
        };
        Ok(self.personas.read().unwrap().get(id).cloned())
    }
}

/// `{{ABPAllTools}}` and `{{ABPAllTools:phase}}` render the tool catalog.
pub struct ToolCatalogProvider {
    generator: Arc<ToolDescriptionGenerator>,
}

impl ToolCatalogProvider {
    pub const NAMESPACE: &'static str = "ABPAllTools";

    pub fn new(generator: Arc<ToolDescriptionGenerator>) -> Self {
        Self { generator }
    }
}

impl VariableProvider for ToolCatalogProvider {
    fn namespace(&self) -> &str {
        Self::NAMESPACE
    }
    fn priority(&self) -> u8 {
        90
    }
    fn expand(&self, p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        let phase = p.args.first().and_then(|arg| DisclosurePhase::parse(arg));
        Ok(Some(self.generator.all_tools_description(phase)))
    }
    // The generator keys its own cache on the index generation; caching
    // here would outlive re-indexing.
    fn cacheable(&self) -> bool {
        false
    }
}

/// `{{async:id}}` resolves results published by background work. Unknown
/// ids stay verbatim so a later pass can fill them in.
pub struct AsyncResultProvider {
    results: RwLock<HashMap<String, String>>,
}

impl AsyncResultProvider {
    pub fn new() -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
        }
    }

    pub fn publish(&self, id: impl Into<String>, value: impl Into<String>) {
        self.results.write().unwrap().insert(id.into(), value.into());
    }
}

impl Default for AsyncResultProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableProvider for AsyncResultProvider {
    fn namespace(&self) -> &str {
        "async"
    }
    fn priority(&self) -> u8 {
        95
    }
    fn expand(&self, p: &Placeholder, _ctx: &ExpansionContext) -> Result<Option<String>> {
        let Some(id) = p.args.first() else {
            return Ok(None);
        };
        Ok(self.results.read().unwrap().get(id).cloned())
    }
    fn cacheable(&self) -> bool {
        false
    }
}
