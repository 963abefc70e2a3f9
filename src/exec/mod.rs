//! Skill execution: queueing, deduplication, sandbox dispatch and result
//! normalization.

pub mod sandbox;
pub mod stats;

use crate::errors::{ErrorCode, ExecutionError};
use crate::skills::loader::{LoadOptions, SkillsLoader};
use crate::skills::metadata::{
    FilesystemPolicy, NetworkPolicy, SkillMetadata, SkillToolDef, ToolParamDef,
};
use crate::skills::preload::PreloadManager;
use crate::skills::usage::{RecordedExecution, UsageTracker};
use chrono::{DateTime, Utc};
use sandbox::{SandboxCommand, SandboxExecutor, SandboxStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stats::{ExecutionStats, PhaseTimings, ProfilerRun};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Override that can only narrow the skill's declared policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPolicy>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub skill_name: String,
    pub parameters: Value,
    pub context: RequestContext,
    pub timeout: Option<Duration>,
    pub permissions_override: Option<PermissionsOverride>,
    /// Relevance confidence from search, fed to the usage tracker.
    pub confidence: Option<f64>,
}

impl ExecutionRequest {
    pub fn new(skill_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            skill_name: skill_name.into(),
            parameters,
            context: RequestContext::default(),
            timeout: None,
            permissions_override: None,
            confidence: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    Object,
    Text,
    Binary,
    Void,
    Primitive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    pub format: ResultFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub execution_time_ms: u64,
    pub memory_usage: Option<u64>,
    pub token_usage: Option<u64>,
    pub cache_hit: bool,
    pub execution_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_report: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiler_metrics: Option<PhaseTimings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub metadata: ResponseMetadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Executing {
        skill: String,
        request_id: String,
    },
    Success {
        skill: String,
        request_id: String,
        duration_ms: u64,
    },
    Error {
        skill: String,
        request_id: String,
        code: ErrorCode,
    },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct SkillsExecutionManager {
    loader: Arc<SkillsLoader>,
    sandbox: Arc<SandboxExecutor>,
    usage: Arc<UsageTracker>,
    stats: Arc<ExecutionStats>,
    preload: RwLock<Option<Arc<PreloadManager>>>,
    semaphore: Arc<Semaphore>,
    admitted: AtomicUsize,
    max_admitted: usize,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<ExecutionResponse>>>>,
    events: RwLock<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
    profiler_enabled: bool,
}

impl SkillsExecutionManager {
    pub fn new(
        loader: Arc<SkillsLoader>,
        sandbox: Arc<SandboxExecutor>,
        usage: Arc<UsageTracker>,
        stats: Arc<ExecutionStats>,
        cfg: &crate::config::ExecutorConfig,
    ) -> Self {
        Self {
            loader,
            sandbox,
            usage,
            stats,
            preload: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(cfg.max_inflight.max(1))),
            admitted: AtomicUsize::new(0),
            max_admitted: cfg.max_inflight.max(1) + cfg.max_queue,
            inflight: Mutex::new(HashMap::new()),
            events: RwLock::new(None),
            profiler_enabled: false,
        }
    }

    pub fn with_profiler(mut self, enabled: bool) -> Self {
        self.profiler_enabled = enabled;
        self
    }

    pub fn attach_preload(&self, preload: Arc<PreloadManager>) {
        *self.preload.write().unwrap() = Some(preload);
    }

    /// Lifecycle events flow out through this channel; nothing flows back.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.write().unwrap() = Some(tx);
        rx
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(tx) = self.events.read().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Execute one request. Errors come back inside the response; this
    /// function itself never fails.
    pub async fn execute(&self, req: ExecutionRequest) -> ExecutionResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let fingerprint = format!(
            "{}|{}",
            req.skill_name.to_lowercase(),
            canonical_json(&req.parameters)
        );

        // Identical concurrent requests share one subprocess: followers
        // wait on the leader's watch channel and get a copy.
        let notify_tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&fingerprint) {
                let rx = rx.clone();
                drop(inflight);
                return self.await_leader(rx, &req, started).await;
            }
            let (tx, rx) = watch::channel(None);
            inflight.insert(fingerprint.clone(), rx);
            tx
        };

        let response = self.execute_leader(&req, &request_id, started).await;

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&fingerprint);
        }
        let _ = notify_tx.send(Some(response.clone()));
        response
    }

    async fn await_leader(
        &self,
        mut rx: watch::Receiver<Option<ExecutionResponse>>,
        req: &ExecutionRequest,
        started: Instant,
    ) -> ExecutionResponse {
        loop {
            if let Some(response) = rx.borrow().clone() {
                let mut copy = response;
                copy.metadata.cache_hit = true;
                copy.metadata.timestamp = Utc::now();
                self.record_outcome(req, &copy, started, true);
                return copy;
            }
            if rx.changed().await.is_err() {
                let err = ExecutionError::new(
                    ErrorCode::RuntimeError,
                    "deduplicated execution was abandoned",
                );
                return self.error_response(err, started, true);
            }
        }
    }

    async fn execute_leader(
        &self,
        req: &ExecutionRequest,
        request_id: &str,
        started: Instant,
    ) -> ExecutionResponse {
        // Admission control: fail fast once the queue is full.
        let admitted = self.admitted.fetch_add(1, Ordering::AcqRel);
        if admitted >= self.max_admitted {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            let err = ExecutionError::new(
                ErrorCode::QueueFull,
                format!("execution queue is full ({} waiting)", admitted),
            );
            return self.error_response(err, started, false);
        }
        let response = self.execute_admitted(req, request_id, started).await;
        self.admitted.fetch_sub(1, Ordering::AcqRel);
        response
    }

    async fn execute_admitted(
        &self,
        req: &ExecutionRequest,
        request_id: &str,
        started: Instant,
    ) -> ExecutionResponse {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = ExecutionError::new(ErrorCode::RuntimeError, "executor shut down");
                return self.error_response(err, started, false);
            }
        };

        let mut profiler = ProfilerRun::start(self.profiler_enabled);

        // Resolve the skill.
        let handle = match self.loader.load_skill(&req.skill_name, &LoadOptions::default()) {
            Ok(handle) => handle,
            Err(e) => {
                let err = to_execution_error(e);
                self.emit(LifecycleEvent::Error {
                    skill: req.skill_name.clone(),
                    request_id: request_id.to_string(),
                    code: err.code,
                });
                return self.error_response(err, started, false);
            }
        };
        let metadata = handle.metadata.clone();
        profiler.mark_extraction();

        if let Some(preload) = self.preload.read().unwrap().as_ref() {
            preload.note_request(&metadata.name, handle.cache_hit);
        }

        // Validate parameters before anything touches the sandbox.
        if let Err(err) = validate_parameters(&metadata, &req.parameters, &self.loader) {
            self.emit(LifecycleEvent::Error {
                skill: metadata.name.clone(),
                request_id: request_id.to_string(),
                code: err.code,
            });
            return self.error_response(err, started, false);
        }
        profiler.mark_dependency();

        // Merge the override into the declared policy; narrowing only.
        let (timeout, memory_mb, network, network_allowlist, filesystem) =
            merge_permissions(&metadata, req, self.sandbox.default_timeout());
        profiler.mark_security();

        self.emit(LifecycleEvent::Executing {
            skill: metadata.name.clone(),
            request_id: request_id.to_string(),
        });

        let workspace = tempfile::TempDir::new().ok();
        let entry = metadata
            .path
            .join(metadata.resources.entry.trim_start_matches("./"));
        let command = SandboxCommand {
            skill_name: metadata.name.clone(),
            entry,
            parameters: req.parameters.clone(),
            env_whitelist: metadata.security.environment.clone(),
            timeout,
            memory_mb,
            network,
            network_allowlist,
            filesystem,
            use_stdin: wants_stdin(&metadata),
            workspace: workspace.as_ref().map(|ws| ws.path().to_path_buf()),
        };

        let sandbox = self.sandbox.clone();
        let outcome = tokio::task::spawn_blocking(move || sandbox.run(&command)).await;
        profiler.mark_sandbox();
        drop(workspace);
        drop(permit);

        let mut response = match outcome {
            Ok(Ok(outcome)) => self.normalize_outcome(&metadata, outcome, started),
            Ok(Err(err)) => self.error_response(err, started, false),
            Err(e) => self.error_response(
                ExecutionError::new(
                    ErrorCode::SandboxFailed,
                    format!("sandbox worker failed: {}", e),
                ),
                started,
                false,
            ),
        };
        response.metadata.cache_hit = handle.cache_hit;
        response.metadata.profiler_metrics = profiler.finish();
        if let Some(timings) = response.metadata.profiler_metrics {
            self.stats.record_phases(&metadata.name, timings);
        }

        self.record_outcome(req, &response, started, handle.cache_hit);
        match (response.success, response.error.as_ref()) {
            (true, _) => self.emit(LifecycleEvent::Success {
                skill: metadata.name.clone(),
                request_id: request_id.to_string(),
                duration_ms: response.metadata.execution_time_ms,
            }),
            (false, Some(err)) => self.emit(LifecycleEvent::Error {
                skill: metadata.name.clone(),
                request_id: request_id.to_string(),
                code: err.code,
            }),
            (false, None) => {}
        }
        response
    }

    fn normalize_outcome(
        &self,
        metadata: &SkillMetadata,
        outcome: sandbox::SandboxOutcome,
        started: Instant,
    ) -> ExecutionResponse {
        let mut warnings = outcome.warnings.clone();
        if outcome.stdout_truncated {
            warnings.push("stdout truncated at capture cap".to_string());
        }
        if outcome.stderr_truncated {
            warnings.push("stderr truncated at capture cap".to_string());
        }

        let response = match outcome.status {
            SandboxStatus::TimedOut => Err(ExecutionError::new(
                ErrorCode::Timeout,
                format!(
                    "skill '{}' exceeded its {}ms timeout",
                    metadata.name,
                    metadata.security.timeout_ms
                ),
            )),
            SandboxStatus::Oom => Err(ExecutionError::new(
                ErrorCode::Oom,
                format!(
                    "skill '{}' exceeded its {}MB memory cap",
                    metadata.name, metadata.security.memory_mb
                ),
            )),
            SandboxStatus::Killed => Err(ExecutionError::new(
                ErrorCode::RuntimeError,
                format!("skill '{}' was killed by a signal", metadata.name),
            )),
            SandboxStatus::Exited => match outcome.exit_code {
                Some(0) => Ok(classify_stdout(&outcome.stdout)),
                code => Err(ExecutionError::new(
                    ErrorCode::RuntimeError,
                    runtime_error_message(&metadata.name, code, &outcome.stderr),
                )
                .with_details(serde_json::json!({"exit_code": code}))),
            },
        };

        match response {
            Ok(result) => ExecutionResponse {
                success: true,
                result: Some(result),
                error: None,
                metadata: self.response_metadata(started, false),
                warnings,
            },
            Err(err) => {
                let mut response = self.error_response(err, started, false);
                response.warnings = warnings;
                response
            }
        }
    }

    fn response_metadata(&self, started: Instant, cache_hit: bool) -> ResponseMetadata {
        ResponseMetadata {
            execution_time_ms: (started.elapsed().as_millis() as u64).max(1),
            memory_usage: None,
            token_usage: None,
            cache_hit,
            execution_type: "sandbox".to_string(),
            timestamp: Utc::now(),
            security_report: None,
            profiler_metrics: None,
        }
    }

    fn error_response(
        &self,
        err: ExecutionError,
        started: Instant,
        cache_hit: bool,
    ) -> ExecutionResponse {
        warn!("execution failed: {}", err);
        ExecutionResponse {
            success: false,
            result: None,
            error: Some(err),
            metadata: self.response_metadata(started, cache_hit),
            warnings: Vec::new(),
        }
    }

    fn record_outcome(
        &self,
        req: &ExecutionRequest,
        response: &ExecutionResponse,
        started: Instant,
        cache_hit: bool,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.usage.record_execution(
            &req.skill_name,
            RecordedExecution {
                duration_ms,
                confidence: req.confidence,
                cache_hit,
                requires_resources: false,
                execution_type: "sandbox".to_string(),
            },
        );
        self.stats.record(
            &req.skill_name,
            response.success,
            duration_ms,
            cache_hit,
            response.metadata.token_usage.unwrap_or(0),
        );
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JSON with object keys sorted recursively, for request fingerprints.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

fn wants_stdin(metadata: &SkillMetadata) -> bool {
    metadata
        .extra
        .get("input")
        .and_then(|v| v.as_str())
        .map(|mode| mode == "stdin")
        .unwrap_or(false)
}

fn runtime_error_message(skill: &str, code: Option<i32>, stderr: &str) -> String {
    let tail: String = {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            return format!("skill '{}' exited with code {:?}", skill, code);
        }
        let chars: Vec<char> = trimmed.chars().collect();
        let start = chars.len().saturating_sub(500);
        chars[start..].iter().collect()
    };
    format!("skill '{}' exited with code {:?}: {}", skill, code, tail)
}

fn classify_stdout(stdout: &str) -> ExecutionResult {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return ExecutionResult {
            status: ResultStatus::Success,
            format: ResultFormat::Void,
            data: None,
            message: None,
        };
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => ExecutionResult {
            status: ResultStatus::Success,
            format: ResultFormat::Object,
            data: Some(value),
            message: None,
        },
        Ok(value) => ExecutionResult {
            status: ResultStatus::Success,
            format: ResultFormat::Primitive,
            data: Some(value),
            message: None,
        },
        Err(_) => ExecutionResult {
            status: ResultStatus::Success,
            format: ResultFormat::Text,
            data: Some(Value::String(trimmed.to_string())),
            message: None,
        },
    }
}

fn to_execution_error(e: anyhow::Error) -> ExecutionError {
    if let Some(exec_err) = e.downcast_ref::<ExecutionError>() {
        return exec_err.clone();
    }
    if let Some(meta_err) = e.downcast_ref::<crate::skills::metadata::MetadataError>() {
        return ExecutionError::new(meta_err.code, meta_err.message.clone());
    }
    ExecutionError::new(ErrorCode::RuntimeError, e.to_string())
}

fn merge_permissions(
    metadata: &SkillMetadata,
    req: &ExecutionRequest,
    default_timeout: Duration,
) -> (Duration, u64, NetworkPolicy, Vec<String>, FilesystemPolicy) {
    let declared = &metadata.security;
    let override_ = req.permissions_override.clone().unwrap_or_default();

    let mut timeout_ms = if declared.timeout_ms > 0 {
        declared.timeout_ms
    } else {
        default_timeout.as_millis() as u64
    };
    if let Some(limit) = override_.timeout_ms {
        timeout_ms = timeout_ms.min(limit);
    }
    if let Some(limit) = req.timeout {
        timeout_ms = timeout_ms.min(limit.as_millis() as u64);
    }

    let mut memory_mb = declared.memory_mb;
    if let Some(limit) = override_.memory_mb {
        memory_mb = memory_mb.min(limit);
    }

    // Network can only tighten: an override never turns `none` into
    // `allowlist`.
    let network = match (declared.network, override_.network) {
        (NetworkPolicy::None, _) => NetworkPolicy::None,
        (NetworkPolicy::Allowlist, Some(NetworkPolicy::None)) => NetworkPolicy::None,
        (NetworkPolicy::Allowlist, _) => NetworkPolicy::Allowlist,
    };
    let network_allowlist = if network == NetworkPolicy::Allowlist {
        declared.network_allowlist.clone()
    } else {
        Vec::new()
    };

    let filesystem = match override_.filesystem {
        Some(requested) => declared.filesystem.min(requested),
        None => declared.filesystem,
    };

    (
        Duration::from_millis(timeout_ms.max(1)),
        memory_mb,
        network,
        network_allowlist,
        filesystem,
    )
}

fn validate_parameters(
    metadata: &SkillMetadata,
    parameters: &Value,
    loader: &SkillsLoader,
) -> Result<(), ExecutionError> {
    let Some(params) = parameters.as_object() else {
        return Err(ExecutionError::new(
            ErrorCode::InvalidParameters,
            "parameters must be a JSON object",
        ));
    };

    let tools = loader
        .tool_definitions(&metadata.name)
        .unwrap_or_default();
    // With exactly one tool that declares parameters the schema is
    // authoritative; otherwise (several tools, or a synthesized surface
    // with no parameter list) only known names are checked.
    let strict = tools.len() == 1 && !tools[0].parameters.is_empty();
    let mut known: HashMap<&str, &ToolParamDef> = HashMap::new();
    for tool in &tools {
        for (name, def) in &tool.parameters {
            known.insert(name.as_str(), def);
        }
    }

    if strict {
        if let Some(tool) = tools.first() {
            for (name, def) in &tool.parameters {
                if def.required && !params.contains_key(name) && def.default.is_none() {
                    return Err(ExecutionError::new(
                        ErrorCode::InvalidParameters,
                        format!("missing required parameter '{}'", name),
                    ));
                }
            }
            for name in params.keys() {
                if !tool.parameters.contains_key(name) {
                    return Err(ExecutionError::new(
                        ErrorCode::InvalidParameters,
                        format!("unknown parameter '{}'", name),
                    ));
                }
            }
        }
    }

    for (name, value) in params {
        let Some(def) = known.get(name.as_str()) else {
            continue;
        };
        validate_one(name, value, def)?;
    }
    Ok(())
}

fn validate_one(name: &str, value: &Value, def: &ToolParamDef) -> Result<(), ExecutionError> {
    let invalid = |why: String| ExecutionError::new(ErrorCode::InvalidParameters, why);

    let type_ok = match def.param_type.as_str() {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if !type_ok {
        return Err(invalid(format!(
            "parameter '{}' must be a {}",
            name, def.param_type
        )));
    }

    let Some(validation) = &def.validation else {
        return Ok(());
    };
    if let Some(number) = value.as_f64() {
        if let Some(min) = validation.min {
            if number < min {
                return Err(invalid(format!("parameter '{}' below minimum {}", name, min)));
            }
        }
        if let Some(max) = validation.max {
            if number > max {
                return Err(invalid(format!("parameter '{}' above maximum {}", name, max)));
            }
        }
    }
    if let (Some(pattern), Some(text)) = (&validation.pattern, value.as_str()) {
        match regex::Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(text) {
                    return Err(invalid(format!(
                        "parameter '{}' does not match {}",
                        name, pattern
                    )));
                }
            }
            Err(_) => {
                info!("unparseable validation pattern '{}' ignored", pattern);
            }
        }
    }
    if let Some(allowed) = &validation.enum_values {
        if !allowed.contains(value) {
            return Err(invalid(format!("parameter '{}' not in allowed set", name)));
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::skills::{CacheSet, SkillIndex};
    use std::fs;
    use tempfile::TempDir;

    fn write_skill(root: &std::path::Path, name: &str, front_extra: &str, script: &str) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("scripts")).unwrap();
        fs::write(
            dir.join("scripts/execute.sh"),
            format!("#!/bin/sh\n{}\n", script),
        )
        .unwrap();
        fs::write(
            dir.join("SKILL.md"),
            format!(
                "---\nname: {name}\ndescription: Test skill {name}\nkeywords: [{name}]\n{front_extra}\n---\n\nDocs.\n"
            ),
        )
        .unwrap();
    }

    fn manager_for(root: &std::path::Path) -> SkillsExecutionManager {
        let mut cfg = crate::config::RuntimeConfig::default();
        cfg.skills.roots = vec![root.to_path_buf()];
        let index = Arc::new(SkillIndex::new(&cfg));
        index.index_all().unwrap();
        let caches = Arc::new(CacheSet::new(&cfg.cache));
        let loader = Arc::new(SkillsLoader::new(index, caches));
        SkillsExecutionManager::new(
            loader,
            Arc::new(SandboxExecutor::new(cfg.sandbox.clone())),
            Arc::new(UsageTracker::with_default_window()),
            Arc::new(ExecutionStats::new()),
            &cfg.executor,
        )
    }

    #[tokio::test]
    async fn json_stdout_becomes_object_result() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "dice", "", "echo '{\"value\": 4}'");
        let manager = manager_for(tmp.path());
        let response = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 6})))
            .await;
        assert!(response.success, "error: {:?}", response.error);
        let result = response.result.unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.format, ResultFormat::Object);
        assert_eq!(result.data.unwrap(), serde_json::json!({"value": 4}));
        assert!(!response.metadata.cache_hit);
        assert!(response.metadata.execution_time_ms > 0);
    }

    #[tokio::test]
    async fn text_stdout_becomes_text_result() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "greet", "", "echo hello world");
        let manager = manager_for(tmp.path());
        let response = manager
            .execute(ExecutionRequest::new("greet", serde_json::json!({})))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result.format, ResultFormat::Text);
        assert_eq!(result.data.unwrap(), serde_json::json!("hello world"));
    }

    #[tokio::test]
    async fn empty_stdout_is_void_and_scalar_is_primitive() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "quiet", "", "true");
        write_skill(tmp.path(), "scalar", "", "echo 42");
        let manager = manager_for(tmp.path());

        let response = manager
            .execute(ExecutionRequest::new("quiet", serde_json::json!({})))
            .await;
        assert_eq!(response.result.unwrap().format, ResultFormat::Void);

        let response = manager
            .execute(ExecutionRequest::new("scalar", serde_json::json!({})))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result.format, ResultFormat::Primitive);
        assert_eq!(result.data.unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn unknown_skill_is_skill_not_found() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "dice", "", "true");
        let manager = manager_for(tmp.path());
        let response = manager
            .execute(ExecutionRequest::new("nope", serde_json::json!({})))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::SkillNotFound);
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr_tail() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "bad", "", "echo 'database unreachable' >&2; exit 2");
        let manager = manager_for(tmp.path());
        let response = manager
            .execute(ExecutionRequest::new("bad", serde_json::json!({})))
            .await;
        assert!(!response.success);
        let err = response.error.unwrap();
        assert_eq!(err.code, ErrorCode::RuntimeError);
        assert!(err.message.contains("database unreachable"));
    }

    #[tokio::test]
    async fn timeout_is_enforced_with_grace() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "slow",
            "security:\n  timeout_ms: 1000",
            "sleep 5",
        );
        let manager = manager_for(tmp.path());
        let response = manager
            .execute(ExecutionRequest::new("slow", serde_json::json!({})))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::Timeout);
        let elapsed = response.metadata.execution_time_ms;
        assert!(
            (1000..=1600).contains(&elapsed),
            "execution_time {} out of range",
            elapsed
        );
    }

    #[tokio::test]
    async fn concurrent_identical_requests_deduplicate() {
        let tmp = TempDir::new().unwrap();
        // The marker file counts subprocess launches.
        let marker = tmp.path().join("launches");
        std::env::set_var("MARKER", &marker);
        write_skill(
            tmp.path(),
            "dice",
            "security:\n  environment: [MARKER]",
            "echo launch >> \"$MARKER\"; sleep 0.3; echo '{\"value\": 4}'",
        );
        let manager = Arc::new(manager_for(tmp.path()));

        let a = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 6})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 6})))
            .await;
        let a = a.await.unwrap();

        assert_eq!(
            a.result.as_ref().unwrap().data,
            b.result.as_ref().unwrap().data
        );
        assert!(b.metadata.cache_hit);
        let launches = fs::read_to_string(&marker).unwrap();
        assert_eq!(launches.lines().count(), 1, "exactly one subprocess");
    }

    #[tokio::test]
    async fn different_parameters_do_not_deduplicate() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "dice", "", "echo '{\"ok\": true}'");
        let manager = manager_for(tmp.path());
        let a = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 6})))
            .await;
        let b = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 20})))
            .await;
        assert!(a.success && b.success);
        assert!(!b.metadata.cache_hit);
    }

    #[tokio::test]
    async fn parameter_validation_rejects_bad_requests() {
        let tmp = TempDir::new().unwrap();
        write_skill(
            tmp.path(),
            "dice",
            "tools:\n  - name: dice\n    description: Roll\n    parameters:\n      sides:\n        type: number\n        required: true\n        validation:\n          min: 2\n          max: 100",
            "echo ok",
        );
        let manager = manager_for(tmp.path());

        let missing = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({})))
            .await;
        assert_eq!(missing.error.unwrap().code, ErrorCode::InvalidParameters);

        let wrong_type = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": "six"})))
            .await;
        assert_eq!(wrong_type.error.unwrap().code, ErrorCode::InvalidParameters);

        let out_of_range = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 1})))
            .await;
        assert_eq!(out_of_range.error.unwrap().code, ErrorCode::InvalidParameters);

        let unknown = manager
            .execute(ExecutionRequest::new(
                "dice",
                serde_json::json!({"sides": 6, "bogus": 1}),
            ))
            .await;
        assert_eq!(unknown.error.unwrap().code, ErrorCode::InvalidParameters);

        let ok = manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({"sides": 6})))
            .await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn queue_overflow_fails_fast() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "slowish", "", "sleep 1");
        let mut cfg = crate::config::RuntimeConfig::default();
        cfg.skills.roots = vec![tmp.path().to_path_buf()];
        cfg.executor.max_inflight = 1;
        cfg.executor.max_queue = 0;
        let index = Arc::new(SkillIndex::new(&cfg));
        index.index_all().unwrap();
        let caches = Arc::new(CacheSet::new(&cfg.cache));
        let loader = Arc::new(SkillsLoader::new(index, caches));
        let manager = Arc::new(SkillsExecutionManager::new(
            loader,
            Arc::new(SandboxExecutor::new(cfg.sandbox.clone())),
            Arc::new(UsageTracker::with_default_window()),
            Arc::new(ExecutionStats::new()),
            &cfg.executor,
        ));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(ExecutionRequest::new("slowish", serde_json::json!({"n": 1})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = manager
            .execute(ExecutionRequest::new("slowish", serde_json::json!({"n": 2})))
            .await;
        assert_eq!(second.error.unwrap().code, ErrorCode::QueueFull);
        assert!(first.await.unwrap().success);
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted_in_order() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "dice", "", "echo '{}'");
        let manager = manager_for(tmp.path());
        let mut events = manager.subscribe();
        manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({})))
            .await;
        let first = events.recv().await.unwrap();
        assert!(matches!(first, LifecycleEvent::Executing { .. }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, LifecycleEvent::Success { .. }));
    }

    #[tokio::test]
    async fn usage_and_stats_updated_after_execution() {
        let tmp = TempDir::new().unwrap();
        write_skill(tmp.path(), "dice", "", "echo '{}'");
        let mut cfg = crate::config::RuntimeConfig::default();
        cfg.skills.roots = vec![tmp.path().to_path_buf()];
        let index = Arc::new(SkillIndex::new(&cfg));
        index.index_all().unwrap();
        let caches = Arc::new(CacheSet::new(&cfg.cache));
        let loader = Arc::new(SkillsLoader::new(index, caches));
        let usage = Arc::new(UsageTracker::with_default_window());
        let stats = Arc::new(ExecutionStats::new());
        let manager = SkillsExecutionManager::new(
            loader,
            Arc::new(SandboxExecutor::new(cfg.sandbox.clone())),
            usage.clone(),
            stats.clone(),
            &cfg.executor,
        );
        manager
            .execute(ExecutionRequest::new("dice", serde_json::json!({})))
            .await;
        assert_eq!(usage.get("dice").unwrap().execution_count, 1);
        assert_eq!(stats.get("dice").unwrap().successful, 1);
    }

    #[test]
    fn canonical_json_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 2, "a": {"y": 1, "x": [1, 2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": [1, 2], "y": 1}, "b": 2}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        let c: Value = serde_json::from_str(r#"{"a": {"x": [2, 1], "y": 1}, "b": 2}"#).unwrap();
        assert_ne!(canonical_json(&a), canonical_json(&c));
    }

    #[test]
    fn permission_merge_only_narrows() {
        let mut metadata = minimal_metadata();
        metadata.security.timeout_ms = 5000;
        metadata.security.memory_mb = 256;
        metadata.security.network = NetworkPolicy::None;
        metadata.security.filesystem = FilesystemPolicy::ReadOnly;

        let mut req = ExecutionRequest::new("x", serde_json::json!({}));
        req.permissions_override = Some(PermissionsOverride {
            timeout_ms: Some(10_000),
            memory_mb: Some(64),
            network: Some(NetworkPolicy::Allowlist),
            filesystem: Some(FilesystemPolicy::ReadWrite),
        });

        let (timeout, memory, network, _, filesystem) =
            merge_permissions(&metadata, &req, Duration::from_millis(3000));
        // Wider asks are clamped to the declared policy.
        assert_eq!(timeout, Duration::from_millis(5000));
        assert_eq!(memory, 64);
        assert_eq!(network, NetworkPolicy::None);
        assert_eq!(filesystem, FilesystemPolicy::ReadOnly);
    }

    fn minimal_metadata() -> SkillMetadata {
        use crate::skills::metadata::*;
        SkillMetadata {
            name: "x".to_string(),
            display_name: "x".to_string(),
            description: "d".to_string(),
            version: "0.1.0".to_string(),
            skill_type: "general".to_string(),
            protocol: None,
            domain: "general".to_string(),
            keywords: vec!["x".to_string()],
            tags: Vec::new(),
            capabilities: Vec::new(),
            triggers: None,
            input_schema: None,
            output_schema: None,
            security: SecurityPolicy::default(),
            resources: ResourceDecl {
                entry: "./scripts/execute.sh".to_string(),
                ..Default::default()
            },
            cacheable: true,
            ttl: 3600,
            tools: Vec::new(),
            extra: serde_json::Map::new(),
            path: std::path::PathBuf::from("/tmp"),
            loaded_at: Utc::now(),
        }
    }
}
