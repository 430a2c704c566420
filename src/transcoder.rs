//! Chat-completions chunk stream -> frontend data stream protocol.
//!
//! Every emitted event is one line, `<tag>:<json>\n`:
//! `0` text delta, `9` tool call, `a` tool result, `e` finish, `3` error.

use crate::error::ChatError;
use crate::tools::{ToolError, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct ChunkUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(Option<String>),
    ToolCallAnnounce {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        name: String,
        args: Value,
        result: Value,
    },
    Finish {
        reason: FinishReason,
        usage: ChunkUsage,
    },
    Error(String),
}

impl StreamEvent {
    pub fn tag(&self) -> char {
        match self {
            StreamEvent::TextDelta(_) => '0',
            StreamEvent::ToolCallAnnounce { .. } => '9',
            StreamEvent::ToolResult { .. } => 'a',
            StreamEvent::Finish { .. } => 'e',
            StreamEvent::Error(_) => '3',
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::TextDelta(text) => json!(text),
            StreamEvent::ToolCallAnnounce { id, name, args } => json!({
                "toolCallId": id,
                "toolName": name,
                "args": args,
            }),
            StreamEvent::ToolResult {
                id,
                name,
                args,
                result,
            } => json!({
                "toolCallId": id,
                "toolName": name,
                "args": args,
                "result": result,
            }),
            StreamEvent::Finish { reason, usage } => json!({
                "finishReason": reason,
                "usage": {
                    "promptTokens": usage.prompt_tokens,
                    "completionTokens": usage.completion_tokens,
                },
                "isContinued": false,
            }),
            StreamEvent::Error(message) => json!(message),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}\n", self.tag(), self.payload())
    }
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Streaming,
    AwaitingToolArgs,
    Finished,
}

/// Per-request state machine. Feed chunks in arrival order; the returned
/// events are ready to encode and forward immediately.
pub struct Transcoder {
    tools: Arc<ToolRegistry>,
    pending: Vec<PendingToolCall>,
    processed_tool_calls: usize,
    state: TranscoderState,
}

impl Transcoder {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            pending: Vec::new(),
            processed_tool_calls: 0,
            state: TranscoderState::Streaming,
        }
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    pub fn pending(&self) -> &[PendingToolCall] {
        &self.pending
    }

    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<StreamEvent>, ChatError> {
        if self.state == TranscoderState::Finished {
            return Ok(Vec::new());
        }
        if let Some(err) = &chunk.error {
            return Err(ChatError::UpstreamStream(upstream_error_message(err)));
        }

        let mut events = Vec::new();
        for choice in &chunk.choices {
            match choice.finish_reason.as_deref() {
                Some("stop") => continue,
                Some("tool_calls") => {
                    events.extend(self.run_pending_tool_calls()?);
                    continue;
                }
                _ => {}
            }

            let delta = choice.delta.as_ref();
            match delta.and_then(|d| d.tool_calls.as_ref()) {
                Some(calls) if !calls.is_empty() => {
                    for call in calls {
                        self.accept_tool_fragment(call)?;
                    }
                }
                _ => {
                    let text = delta.and_then(|d| d.content.clone());
                    events.push(StreamEvent::TextDelta(text));
                }
            }
        }

        if chunk.choices.is_empty() {
            if let Some(usage) = chunk.usage {
                events.extend(self.finish(usage));
            }
        }
        Ok(events)
    }

    /// Terminal event for a stream that ended without reporting usage.
    pub fn finish_without_usage(&mut self) -> Option<StreamEvent> {
        self.finish(ChunkUsage::default())
    }

    fn finish(&mut self, usage: ChunkUsage) -> Option<StreamEvent> {
        if self.state == TranscoderState::Finished {
            return None;
        }
        self.state = TranscoderState::Finished;
        let reason = if self.processed_tool_calls > 0 || !self.pending.is_empty() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        Some(StreamEvent::Finish { reason, usage })
    }

    fn accept_tool_fragment(&mut self, call: &ToolCallDelta) -> Result<(), ChatError> {
        let function = call.function.clone().unwrap_or_default();
        let fragment = function.arguments.unwrap_or_default();
        match call.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                self.pending.push(PendingToolCall {
                    id: id.to_string(),
                    name: function.name.unwrap_or_default(),
                    arguments_text: fragment,
                });
            }
            None => {
                let current = self.pending.last_mut().ok_or_else(|| {
                    ChatError::UpstreamStream(
                        "tool call arguments arrived before any tool call id".to_string(),
                    )
                })?;
                current.arguments_text.push_str(&fragment);
            }
        }
        self.state = TranscoderState::AwaitingToolArgs;
        Ok(())
    }

    fn run_pending_tool_calls(&mut self) -> Result<Vec<StreamEvent>, ChatError> {
        let calls = std::mem::take(&mut self.pending);
        let mut parsed = Vec::with_capacity(calls.len());
        for call in calls {
            let args: Value = serde_json::from_str(&call.arguments_text).map_err(|err| {
                ToolError::InvalidArguments {
                    name: call.name.clone(),
                    reason: format!("call {} arguments are not JSON: {err}", call.id),
                }
            })?;
            parsed.push((call, args));
        }

        let mut events: Vec<StreamEvent> = parsed
            .iter()
            .map(|(call, args)| StreamEvent::ToolCallAnnounce {
                id: call.id.clone(),
                name: call.name.clone(),
                args: args.clone(),
            })
            .collect();
        for (call, args) in parsed {
            let result = self.tools.invoke(&call.name, &args)?;
            tracing::debug!(tool = %call.name, call_id = %call.id, "tool call completed");
            events.push(StreamEvent::ToolResult {
                id: call.id,
                name: call.name,
                args,
                result,
            });
            self.processed_tool_calls += 1;
        }
        self.state = TranscoderState::Streaming;
        Ok(events)
    }
}

fn upstream_error_message(err: &Value) -> String {
    err.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}
