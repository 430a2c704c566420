//! Local tools the completion model may call during a direct-mode turn.

use serde_json::{Map, Value, json};
use std::collections::HashMap;

pub const WEATHER_TOOL: &str = "get_current_weather";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("no handler registered for tool `{0}`")]
    Unknown(String),
    #[error("tool `{name}` received invalid arguments: {reason}")]
    InvalidArguments { name: String, reason: String },
}

pub type ToolHandler = Box<dyn Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Fixed name -> handler table. Registration order is kept so the
/// definitions sent upstream are stable.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            ToolDefinition {
                name: WEATHER_TOOL.to_string(),
                description: "Get the current weather at a location".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "latitude": {
                            "type": "number",
                            "description": "The latitude of the location"
                        },
                        "longitude": {
                            "type": "number",
                            "description": "The longitude of the location"
                        }
                    },
                    "required": ["latitude", "longitude"]
                }),
            },
            Box::new(current_weather),
        );
        registry
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        let name = definition.name.clone();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(
            name,
            RegisteredTool {
                definition,
                handler,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs `name` with already-decoded arguments, which must be a JSON object.
    pub fn invoke(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        let args = args.as_object().ok_or_else(|| ToolError::InvalidArguments {
            name: name.to_string(),
            reason: "arguments must be a JSON object".to_string(),
        })?;
        metrics::counter!("chatbridge_tool_invocations_total", "tool" => name.to_string())
            .increment(1);
        (tool.handler)(args)
    }

    /// The `tools` array of a chat-completions request.
    pub fn completion_tools(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.definition.name,
                        "description": tool.definition.description,
                        "parameters": tool.definition.parameters,
                    }
                })
            })
            .collect()
    }
}

fn number_arg(args: &Map<String, Value>, tool: &str, key: &str) -> Result<f64, ToolError> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("`{key}` must be a number"),
        })
}

/// Deterministic stand-in for a forecast lookup, shaped like an Open-Meteo
/// `current` response.
fn current_weather(args: &Map<String, Value>) -> Result<Value, ToolError> {
    let latitude = number_arg(args, WEATHER_TOOL, "latitude")?;
    let longitude = number_arg(args, WEATHER_TOOL, "longitude")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(ToolError::InvalidArguments {
            name: WEATHER_TOOL.to_string(),
            reason: "coordinates out of range".to_string(),
        });
    }
    let temperature = 30.0 - latitude.abs() * 0.4 + (longitude.abs() % 5.0);
    let temperature = (temperature * 10.0).round() / 10.0;
    Ok(json!({
        "latitude": latitude,
        "longitude": longitude,
        "timezone": "GMT",
        "current_units": { "temperature_2m": "°C" },
        "current": { "temperature_2m": temperature },
    }))
}
