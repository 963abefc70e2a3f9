//! Skillbridge — an LLM tool-augmentation runtime.
//!
//! Given a chat completion that embeds tool-call markers in model output,
//! the runtime discovers *skills* (self-describing tool packages on disk),
//! renders compact tool-catalog prompts, recovers tool invocations from
//! streamed model text, executes the selected skill in an isolated
//! subprocess, and feeds results back into the conversation loop.
//!
//! Everything is an explicit value: construct a [`SkillRuntime`] from a
//! [`config::RuntimeConfig`] and thread it through your chat loop. LLM
//! transports, authentication and conversation routing live outside this
//! crate; the [`chat::ChatLoopAdapter`] is the only bridge they need.

pub mod chat;
pub mod config;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod skills;
pub mod vars;

pub use chat::{AuthDecision, AuthorizeFn, ChatLoopAdapter, ToolTurn};
pub use config::RuntimeConfig;
pub use errors::{ErrorCode, ExecutionError};
pub use exec::sandbox::SandboxExecutor;
pub use exec::stats::ExecutionStats;
pub use exec::{
    ExecutionRequest, ExecutionResponse, ExecutionResult, LifecycleEvent, RequestContext,
    ResultFormat, ResultStatus, SkillsExecutionManager,
};
pub use protocol::{ParseOutcome, ToolCall, ToolProtocolParser};
pub use skills::{
    CacheSet, MemoryCleaner, MemoryMonitor, PressureLevel, PressureSampler, ProcStatusSampler,
    SearchOptions, SkillHandle, SkillIndex, SkillMetadata, SkillsLoader, UsageTracker,
};
pub use vars::catalog::{DisclosurePhase, ToolDescriptionGenerator};
pub use vars::providers::{
    AgentProvider, AsyncResultProvider, DateProvider, DateTimeProvider, EnvProvider,
    ScopedVarProvider, StaticProvider, TimeProvider, ToolCatalogProvider,
};
pub use vars::{ExpansionContext, ExpansionReport, VariableEngine, VariableProvider};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// The composed runtime: one value owning every core service, constructed
/// once by the host.
pub struct SkillRuntime {
    pub config: RuntimeConfig,
    pub index: Arc<SkillIndex>,
    pub caches: Arc<CacheSet>,
    pub loader: Arc<SkillsLoader>,
    pub usage: Arc<UsageTracker>,
    pub stats: Arc<ExecutionStats>,
    pub monitor: Arc<MemoryMonitor>,
    pub cleaner: Arc<MemoryCleaner>,
    pub preload: Arc<skills::PreloadManager>,
    pub parser: Arc<ToolProtocolParser>,
    pub vars: Arc<VariableEngine>,
    pub catalog: Arc<ToolDescriptionGenerator>,
    pub manager: Arc<SkillsExecutionManager>,
    /// Host-facing handles for dynamic provider content.
    pub agent_provider: Arc<AgentProvider>,
    pub async_results: Arc<AsyncResultProvider>,
}

impl SkillRuntime {
    /// Build the runtime and run the initial skill scan. Skills that fail
    /// to load are skipped with a warning; only configuration faults abort.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_sampler(config, Arc::new(ProcStatusSampler))
    }

    pub fn with_sampler(
        config: RuntimeConfig,
        sampler: Arc<dyn PressureSampler>,
    ) -> Result<Self> {
        let index = Arc::new(SkillIndex::new(&config));
        let report = index.index_all()?;
        info!(
            "runtime starting with {} skills ({} skipped)",
            report.indexed, report.skipped
        );

        let caches = Arc::new(CacheSet::new(&config.cache));
        let loader = Arc::new(SkillsLoader::new(index.clone(), caches.clone()));
        let usage = Arc::new(UsageTracker::with_default_window());
        let stats = Arc::new(ExecutionStats::new());

        let monitor = Arc::new(MemoryMonitor::new(sampler, config.memory.clone()));
        let cleaner = Arc::new(MemoryCleaner::new(
            monitor.clone(),
            caches.clone(),
            usage.clone(),
        ));
        let preload = Arc::new(skills::PreloadManager::new(
            loader.clone(),
            usage.clone(),
            monitor.clone(),
            config.preload.clone(),
        ));

        let sandbox = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
        let manager = Arc::new(SkillsExecutionManager::new(
            loader.clone(),
            sandbox,
            usage.clone(),
            stats.clone(),
            &config.executor,
        ));
        manager.attach_preload(preload.clone());

        let catalog = Arc::new(ToolDescriptionGenerator::new(
            index.clone(),
            loader.clone(),
            &config,
        ));
        let parser = Arc::new(ToolProtocolParser::new(config.parser.clone()));

        let vars = Arc::new(VariableEngine::new(&config.vars));
        let agent_provider = Arc::new(AgentProvider::new());
        let async_results = Arc::new(AsyncResultProvider::new());
        vars.register(Arc::new(TimeProvider));
        vars.register(Arc::new(DateProvider));
        vars.register(Arc::new(DateTimeProvider));
        vars.register(Arc::new(EnvProvider));
        vars.register(Arc::new(ScopedVarProvider::new("Var", 50)));
        vars.register(Arc::new(ScopedVarProvider::new("Tar", 50)));
        vars.register(agent_provider.clone());
        vars.register(Arc::new(ToolCatalogProvider::new(catalog.clone())));
        vars.register(async_results.clone());

        Ok(Self {
            config,
            index,
            caches,
            loader,
            usage,
            stats,
            monitor,
            cleaner,
            preload,
            parser,
            vars,
            catalog,
            manager,
            agent_provider,
            async_results,
        })
    }

    /// Build a per-stream adapter around this runtime's parser and manager.
    pub fn chat_adapter(&self, authorize: AuthorizeFn) -> ChatLoopAdapter {
        ChatLoopAdapter::new(self.parser.clone(), self.manager.clone(), authorize)
    }

    /// Start the periodic memory-cleanup and preload loops. Abort the
    /// returned handles to stop them.
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.cleaner.clone().spawn_loop(),
            self.preload.clone().spawn_loop(),
        ]
    }
}
