//! Thin bridge between a streamed chat completion and the execution
//! manager: parse → authorize → execute → hand the result back.
//!
//! The adapter owns a rolling buffer and a cursor, nothing else — no skill
//! logic, no cache, no security policy. Authorization is an opaque
//! predicate supplied by the chat loop.

use crate::exec::{
    ExecutionRequest, ExecutionResponse, RequestContext, ResponseMetadata, SkillsExecutionManager,
};
use crate::errors::{ErrorCode, ExecutionError};
use crate::protocol::{ParseFallback, ToolCall, ToolProtocolParser};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub enum AuthDecision {
    Allow,
    Deny { reason: String },
}

pub type AuthorizeFn =
    Arc<dyn Fn(&str, &Value, &RequestContext) -> AuthDecision + Send + Sync>;

/// One completed tool round-trip, ready to inject into the conversation as
/// a tool-result turn.
#[derive(Debug)]
pub struct ToolTurn {
    pub call: ToolCall,
    pub response: ExecutionResponse,
}

pub struct ChatLoopAdapter {
    parser: Arc<ToolProtocolParser>,
    manager: Arc<SkillsExecutionManager>,
    authorize: AuthorizeFn,
    context: RequestContext,
    buffer: String,
    /// Byte offset of the last consumed call; spans at or before it were
    /// already executed.
    cursor: usize,
    saw_fallback: bool,
}

impl ChatLoopAdapter {
    pub fn new(
        parser: Arc<ToolProtocolParser>,
        manager: Arc<SkillsExecutionManager>,
        authorize: AuthorizeFn,
    ) -> Self {
        Self {
            parser,
            manager,
            authorize,
            context: RequestContext::default(),
            buffer: String::new(),
            cursor: 0,
            saw_fallback: false,
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Append a streamed chunk and execute any newly completed calls, in
    /// stream order.
    pub async fn on_chunk(&mut self, chunk: &str) -> Vec<ToolTurn> {
        self.buffer.push_str(chunk);
        self.drain().await
    }

    /// Final drain at end of stream. Anything that never completed stays
    /// plain assistant text.
    pub async fn on_end(&mut self) -> Vec<ToolTurn> {
        self.drain().await
    }

    /// The accumulated assistant text for this stream.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// True when some span had to be treated as plain text.
    pub fn saw_plain_text_fallback(&self) -> bool {
        self.saw_fallback
    }

    /// Prepare for the next stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.saw_fallback = false;
    }

    async fn drain(&mut self) -> Vec<ToolTurn> {
        let outcome = self.parser.parse(&self.buffer);
        if outcome.fallback == Some(ParseFallback::PlainText) {
            self.saw_fallback = true;
        }

        let mut turns = Vec::new();
        for call in outcome.tool_calls {
            // Calls ending at or before the cursor were already handled in
            // an earlier drain over the same buffer.
            if call.source_span.1 <= self.cursor {
                continue;
            }
            self.cursor = call.source_span.1;

            let response = match (self.authorize)(&call.tool, &call.parameters, &self.context) {
                AuthDecision::Allow => {
                    let request = ExecutionRequest {
                        skill_name: call.tool.clone(),
                        parameters: call.parameters.clone(),
                        context: self.context.clone(),
                        timeout: None,
                        permissions_override: None,
                        confidence: None,
                    };
                    self.manager.execute(request).await
                }
                AuthDecision::Deny { reason } => {
                    info!("tool call '{}' denied: {}", call.tool, reason);
                    denied_response(reason)
                }
            };
            turns.push(ToolTurn { call, response });
        }
        turns
    }
}

fn denied_response(reason: String) -> ExecutionResponse {
    ExecutionResponse {
        success: false,
        result: None,
        error: Some(ExecutionError::new(ErrorCode::PermissionDenied, reason)),
        metadata: ResponseMetadata {
            execution_time_ms: 1,
            memory_usage: None,
            token_usage: None,
            cache_hit: false,
            execution_type: "denied".to_string(),
            timestamp: Utc::now(),
            security_report: None,
            profiler_metrics: None,
        },
        warnings: Vec::new(),
    }
}
