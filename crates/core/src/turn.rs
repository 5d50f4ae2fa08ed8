use serde::{Deserialize, Serialize};
use std::fmt;

/// The author of a single conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// The function part of a tool call: which capability to run and its JSON arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// A serialized JSON object, kept verbatim as the backend sent it.
    #[serde(rename = "arguments")]
    pub arguments_json: String,
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments_json: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments_json: arguments_json.into(),
            },
        }
    }
}

/// One role-tagged entry in the conversation log.
///
/// The serialized shape is the chat-completion message shape, so persisted
/// histories can be handed to a chat model without translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    /// An assistant turn that carries tool calls and no text.
    pub fn tool_request(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// The answer to the tool call identified by `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// A capability declaration advertised to the backend in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: function_kind(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Everything pushed to the backend when a connection opens.
///
/// `voice_name` doubles as the persistence scope of the conversation history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice_id: String,
    pub voice_name: String,
    pub allow_recording: bool,
    pub tool_declarations: Vec<ToolSchema>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(Role::Tool.to_string(), "tool");
    }

    #[test]
    fn test_tool_request_serializes_null_content() {
        let turn = Turn::tool_request(vec![ToolCall::function("c1", "get_weather", "{}")]);
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "c1",
                    "type": "function",
                    "function": { "name": "get_weather", "arguments": "{}" }
                }]
            })
        );
    }

    #[test]
    fn test_tool_result_shape() {
        let value = serde_json::to_value(Turn::tool_result("c1", "{\"ok\":true}")).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "c1");
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let turn: Turn = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(turn, Turn::user("hi"));
        assert!(!turn.has_tool_calls());
    }

    #[test]
    fn test_tool_call_kind_defaults_to_function() {
        let call: ToolCall =
            serde_json::from_str(r#"{"id":"x","function":{"name":"n","arguments":"{}"}}"#)
                .unwrap();
        assert_eq!(call.kind, "function");
    }
}
