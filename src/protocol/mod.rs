//! Recovery of structured tool calls from streamed model text.
//!
//! The parser looks for fixed open/close sentinels, repairs the JSON
//! payload between them, and validates the result. An unmatched opener at
//! the end of the buffer means the call is still arriving: the parser
//! returns what it has and the next chunk retries.

pub mod repair;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// One recovered tool invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub parameters: Value,
    /// Byte range of the call (sentinels included) in the original text, so
    /// the loop can splice results back in.
    pub source_span: (usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseFallback {
    PlainText,
}

/// Report for one parse attempt over a buffer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ParseOutcome {
    pub success: bool,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub fallback: Option<ParseFallback>,
}

impl ParseOutcome {
    fn empty() -> Self {
        Self {
            success: true,
            tool_calls: Vec::new(),
            error: None,
            fallback: None,
        }
    }
}

pub struct ToolProtocolParser {
    cfg: crate::config::ParserConfig,
}

impl ToolProtocolParser {
    pub fn new(cfg: crate::config::ParserConfig) -> Self {
        Self { cfg }
    }

    pub fn with_defaults() -> Self {
        Self::new(crate::config::ParserConfig::default())
    }

    pub fn open_sentinel(&self) -> &str {
        &self.cfg.open_sentinel
    }

    pub fn close_sentinel(&self) -> &str {
        &self.cfg.close_sentinel
    }

    /// Scan `text` for complete tool calls. Safe to call repeatedly on a
    /// growing buffer; spans always refer to the text as passed in.
    pub fn parse(&self, text: &str) -> ParseOutcome {
        if text.trim().is_empty() {
            return ParseOutcome::empty();
        }

        let open = &self.cfg.open_sentinel;
        let close = &self.cfg.close_sentinel;
        let mut outcome = ParseOutcome::empty();
        let mut pos = 0;

        while let Some(rel_open) = text[pos..].find(open.as_str()) {
            let open_start = pos + rel_open;
            let payload_start = open_start + open.len();
            let Some(rel_close) = text[payload_start..].find(close.as_str()) else {
                // Unmatched opener at end of stream: the call is still
                // arriving. Report what we have; the next chunk retries.
                debug!("open sentinel without close at byte {}", open_start);
                break;
            };
            let close_start = payload_start + rel_close;
            let close_end = close_start + close.len();
            let span = (open_start, close_end);
            pos = close_end;

            let payload = &text[payload_start..close_start];
            match self.decode_payload(payload) {
                Ok(mut call) => {
                    call.source_span = span;
                    outcome.tool_calls.push(call);
                }
                Err(reason) => {
                    if self.cfg.strict {
                        outcome.success = false;
                        outcome.error = Some(reason);
                        return outcome;
                    }
                    // Reject this call and keep scanning; the loop treats
                    // the span as plain assistant text.
                    warn!("rejecting malformed tool call: {}", reason);
                    outcome.fallback = Some(ParseFallback::PlainText);
                }
            }
        }

        outcome
    }

    fn decode_payload(&self, payload: &str) -> Result<ToolCall, String> {
        let payload = if self.cfg.aggressive_strip {
            repair::strip_chrome(payload)
        } else {
            payload
        };
        let value = repair::parse_with_repair(payload)
            .ok_or_else(|| "payload is not JSON after repair".to_string())?;
        let obj = value
            .as_object()
            .ok_or_else(|| "payload is not a JSON object".to_string())?;

        let tool = obj
            .get("tool")
            .or_else(|| obj.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing 'tool' string".to_string())?
            .to_string();

        let parameters = match obj.get("parameters").or_else(|| obj.get("args")) {
            Some(v) if v.is_object() => v.clone(),
            Some(_) => return Err("'parameters' is not an object".to_string()),
            None => Value::Object(serde_json::Map::new()),
        };

        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(ToolCall {
            id,
            tool,
            parameters,
            source_span: (0, 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> ToolProtocolParser {
        ToolProtocolParser::with_defaults()
    }

    #[test]
    fn empty_buffer_is_success_with_no_calls() {
        let outcome = parser().parse("");
        assert!(outcome.success);
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn single_complete_call() {
        let text = r#"Rolling now. <tool_call>{"tool": "dice", "parameters": {"sides": 6}}</tool_call> Done."#;
        let outcome = parser().parse(text);
        assert!(outcome.success);
        assert_eq!(outcome.tool_calls.len(), 1);
        let call = &outcome.tool_calls[0];
        assert_eq!(call.tool, "dice");
        assert_eq!(call.parameters, json!({"sides": 6}));
        let (start, end) = call.source_span;
        assert_eq!(&text[start..end], r#"<tool_call>{"tool": "dice", "parameters": {"sides": 6}}</tool_call>"#);
    }

    #[test]
    fn calls_preserve_stream_order() {
        let text = "<tool_call>{\"tool\": \"first\", \"parameters\": {}}</tool_call> then <tool_call>{\"tool\": \"second\", \"parameters\": {}}</tool_call>";
        let outcome = parser().parse(text);
        let names: Vec<&str> = outcome
            .tool_calls
            .iter()
            .map(|c| c.tool.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn truncated_call_waits_for_next_chunk() {
        let partial = r#"<tool_call>{"tool": "dice", "parameters": {"sides""#;
        let outcome = parser().parse(partial);
        assert!(outcome.success);
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.error.is_none());

        let complete = format!("{}: 6}}}}</tool_call>", partial);
        let outcome = parser().parse(&complete);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].parameters, json!({"sides": 6}));
    }

    #[test]
    fn payload_repair_recovers_sloppy_json() {
        let text = "<tool_call>{'tool': 'dice', 'parameters': {'sides': 6,}}</tool_call>";
        let outcome = parser().parse(text);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].parameters, json!({"sides": 6}));
    }

    #[test]
    fn fenced_payload_is_stripped() {
        let text = "<tool_call>```json\n{\"tool\": \"dice\", \"parameters\": {}}\n```</tool_call>";
        let outcome = parser().parse(text);
        assert_eq!(outcome.tool_calls.len(), 1);
    }

    #[test]
    fn unrecoverable_call_falls_back_to_plain_text() {
        let text = "<tool_call>this is prose, not json</tool_call> <tool_call>{\"tool\": \"ok\", \"parameters\": {}}</tool_call>";
        let outcome = parser().parse(text);
        assert!(outcome.success);
        assert_eq!(outcome.fallback, Some(ParseFallback::PlainText));
        // The good call after the bad one is still recovered.
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].tool, "ok");
    }

    #[test]
    fn strict_mode_reports_error() {
        let cfg = crate::config::ParserConfig {
            strict: true,
            ..Default::default()
        };
        let outcome = ToolProtocolParser::new(cfg)
            .parse("<tool_call>not json</tool_call>");
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn id_generated_when_absent_preserved_when_present() {
        let outcome = parser().parse(
            "<tool_call>{\"id\": \"call-7\", \"tool\": \"a\", \"parameters\": {}}</tool_call>",
        );
        assert_eq!(outcome.tool_calls[0].id, "call-7");

        let outcome = parser().parse("<tool_call>{\"tool\": \"a\", \"parameters\": {}}</tool_call>");
        assert!(!outcome.tool_calls[0].id.is_empty());
    }

    #[test]
    fn missing_parameters_default_to_empty_object() {
        let outcome = parser().parse("<tool_call>{\"tool\": \"a\"}</tool_call>");
        assert_eq!(outcome.tool_calls[0].parameters, json!({}));
    }

    #[test]
    fn non_object_parameters_rejected() {
        let outcome =
            parser().parse("<tool_call>{\"tool\": \"a\", \"parameters\": [1]}</tool_call>");
        assert!(outcome.tool_calls.is_empty());
        assert_eq!(outcome.fallback, Some(ParseFallback::PlainText));
    }

    #[test]
    fn custom_sentinels() {
        let cfg = crate::config::ParserConfig {
            open_sentinel: "[[call]]".to_string(),
            close_sentinel: "[[/call]]".to_string(),
            ..Default::default()
        };
        let outcome = ToolProtocolParser::new(cfg)
            .parse("[[call]]{\"tool\": \"a\", \"parameters\": {}}[[/call]]");
        assert_eq!(outcome.tool_calls.len(), 1);
    }
}
