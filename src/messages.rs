//! Frontend chat messages and their chat-completions rendering.

use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "experimental_attachments")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    /// Required on `tool` messages: the call this result answers.
    #[serde(default, alias = "tool_call_id")]
    pub tool_call_id: Option<String>,
}

impl ClientMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_invocations: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub content_type: Option<String>,
    pub url: String,
}

/// A tool call the frontend already rendered, replayed on the next turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result: Option<Value>,
}

fn last_user_message(messages: &[ClientMessage]) -> Result<&ClientMessage, ChatError> {
    let last = messages
        .last()
        .ok_or_else(|| ChatError::validation("No messages provided"))?;
    if last.role != Role::User {
        return Err(ChatError::validation("Latest message must be from user"));
    }
    Ok(last)
}

/// Converts the frontend list into chat-completions messages.
///
/// Role and content order are preserved one-to-one. Replayed tool invocations
/// become `tool_calls` on the carrying message, followed by one `tool` message
/// per invocation that has a result.
pub fn normalize(messages: &[ClientMessage]) -> Result<Vec<Value>, ChatError> {
    last_user_message(messages)?;

    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::Tool {
            let call_id = message
                .tool_call_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| ChatError::validation("Tool message requires toolCallId"))?;
            out.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": message.content,
            }));
            continue;
        }
        let mut content = vec![json!({ "type": "text", "text": message.content })];
        for attachment in &message.attachments {
            if let Some(part) = attachment_part(attachment) {
                content.push(part);
            }
        }

        let mut entry = Map::new();
        entry.insert(
            "role".to_string(),
            Value::String(message.role.as_str().to_string()),
        );
        entry.insert("content".to_string(), Value::Array(content));
        if !message.tool_invocations.is_empty() {
            let calls: Vec<Value> = message
                .tool_invocations
                .iter()
                .map(|inv| {
                    json!({
                        "id": inv.tool_call_id,
                        "type": "function",
                        "function": {
                            "name": inv.tool_name,
                            "arguments": inv.args.to_string(),
                        }
                    })
                })
                .collect();
            entry.insert("tool_calls".to_string(), Value::Array(calls));
        }
        out.push(Value::Object(entry));

        for inv in &message.tool_invocations {
            if let Some(result) = &inv.result {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": inv.tool_call_id,
                    "content": result.to_string(),
                }));
            }
        }
    }
    Ok(out)
}

fn attachment_part(attachment: &Attachment) -> Option<Value> {
    let content_type = attachment.content_type.as_deref().unwrap_or("");
    if content_type.starts_with("image") {
        Some(json!({ "type": "image_url", "image_url": { "url": attachment.url } }))
    } else if content_type.starts_with("text") {
        Some(json!({ "type": "text", "text": attachment.url }))
    } else {
        None
    }
}

/// The text forwarded to a session backend: an explicit `message` wins,
/// otherwise the list must end with a user message like in direct mode.
pub fn latest_user_text(messages: &[ClientMessage], explicit: &str) -> Result<String, ChatError> {
    if !explicit.trim().is_empty() {
        return Ok(explicit.to_string());
    }
    let last = last_user_message(messages)?;
    if last.content.trim().is_empty() {
        return Err(ChatError::validation("No message provided"));
    }
    Ok(last.content.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(pairs: &[(Role, &str)]) -> Vec<ClientMessage> {
        pairs
            .iter()
            .map(|(role, content)| ClientMessage::new(*role, *content))
            .collect()
    }

    #[test]
    fn normalize_preserves_order_and_count() {
        let input = msgs(&[
            (Role::System, "be brief"),
            (Role::User, "hi"),
            (Role::Assistant, "hello"),
            (Role::User, "weather?"),
        ]);
        let out = normalize(&input).unwrap();
        assert_eq!(out.len(), input.len());
        for (src, dst) in input.iter().zip(&out) {
            assert_eq!(dst["role"], src.role.as_str());
            assert_eq!(dst["content"][0]["text"], src.content.as_str());
            assert!(dst.get("tool_calls").is_none());
        }
    }

    #[test]
    fn normalize_rejects_empty_and_non_user_tail() {
        assert!(matches!(normalize(&[]), Err(ChatError::Validation(_))));
        let input = msgs(&[(Role::User, "hi"), (Role::Assistant, "hello")]);
        assert!(matches!(normalize(&input), Err(ChatError::Validation(_))));
    }

    #[test]
    fn normalize_expands_tool_invocations() {
        let input: Vec<ClientMessage> = serde_json::from_value(json!([
            { "role": "user", "content": "weather in nyc" },
            {
                "role": "assistant",
                "content": "",
                "toolInvocations": [{
                    "state": "result",
                    "toolCallId": "call_1",
                    "toolName": "get_current_weather",
                    "args": { "latitude": 40.7, "longitude": -74.0 },
                    "result": { "current": { "temperature_2m": 18.0 } }
                }]
            },
            { "role": "user", "content": "thanks" }
        ]))
        .unwrap();
        let out = normalize(&input).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            out[1]["tool_calls"][0]["function"]["name"],
            "get_current_weather"
        );
        let args: Value =
            serde_json::from_str(out[1]["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args["latitude"], json!(40.7));
        assert_eq!(out[2]["role"], "tool");
        assert_eq!(out[2]["tool_call_id"], "call_1");
        assert_eq!(out[3]["role"], "user");
    }

    #[test]
    fn tool_messages_need_a_call_id() {
        let missing: Vec<ClientMessage> = serde_json::from_value(json!([
            { "role": "tool", "content": "{\"ok\":true}" },
            { "role": "user", "content": "go on" }
        ]))
        .unwrap();
        assert!(matches!(normalize(&missing), Err(ChatError::Validation(_))));

        let answered: Vec<ClientMessage> = serde_json::from_value(json!([
            { "role": "tool", "toolCallId": "call_7", "content": "{\"ok\":true}" },
            { "role": "user", "content": "go on" }
        ]))
        .unwrap();
        let out = normalize(&answered).unwrap();
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[0]["tool_call_id"], "call_7");
        assert_eq!(out[0]["content"], "{\"ok\":true}");
    }

    #[test]
    fn normalize_adds_attachment_parts() {
        let input: Vec<ClientMessage> = serde_json::from_value(json!([{
            "role": "user",
            "content": "what is this",
            "experimental_attachments": [
                { "contentType": "image/png", "url": "data:image/png;base64,AAAA" },
                { "contentType": "application/pdf", "url": "ignored" }
            ]
        }]))
        .unwrap();
        let out = normalize(&input).unwrap();
        let content = out[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["type"], "image_url");
    }

    #[test]
    fn latest_user_text_prefers_explicit_message() {
        let input = msgs(&[(Role::User, "from list")]);
        assert_eq!(latest_user_text(&input, "explicit").unwrap(), "explicit");
        assert_eq!(latest_user_text(&input, "").unwrap(), "from list");
        assert!(latest_user_text(&[], "").is_err());
        let input = msgs(&[(Role::User, "hi"), (Role::Assistant, "hello")]);
        assert!(matches!(
            latest_user_text(&input, ""),
            Err(ChatError::Validation(_))
        ));
    }
}
