//! Tool Dispatcher
//!
//! Resolves a backend-requested tool call against the registry of known
//! capabilities, runs it and normalizes every outcome into a plain JSON value.
//! Failures never escape as errors: an unknown name, unparsable arguments or
//! a failing capability all come back as `{"error": "<message>"}`.

use crate::turn::{ToolCall, ToolSchema};
use anyhow::Result;
use async_trait::async_trait;
use rmcp::{
    ServerHandler, ServiceExt,
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Why a tool call produced an error result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown function")]
    UnknownFunction,
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// The result value reported back to the backend.
    pub fn into_value(self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Anything that can run the tool calls of a session.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Declarations advertised to the backend.
    fn declarations(&self) -> Vec<ToolSchema>;

    /// Runs `call` to completion. Never fails; errors are encoded in the value.
    async fn dispatch(&self, call: &ToolCall) -> Value;
}

/// Parses a tool call's argument string into a JSON object.
pub fn parse_arguments(arguments_json: &str) -> Result<Map<String, Value>, ToolError> {
    Ok(serde_json::from_str(arguments_json)?)
}

/// Dispatches tool calls to an in-process MCP server.
///
/// The server runs on its own task behind a duplex pipe. Its tool list is read
/// once at start-up and serves as the static registry.
pub struct McpToolDispatcher {
    client: RunningService<RoleClient, ()>,
    registry: HashMap<String, ToolSchema>,
    server_handle: JoinHandle<()>,
}

impl McpToolDispatcher {
    /// Starts `service` and connects a client to it.
    pub async fn start<S: ServerHandler>(service: S) -> Result<Self> {
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        let server_handle = tokio::spawn(async move {
            match service.serve(server_transport).await {
                Ok(running) => {
                    let _ = running.waiting().await;
                }
                Err(e) => warn!(error = %e, "Capability server failed to start"),
            }
        });

        let client = ().serve(client_transport).await?;
        let mut registry = HashMap::new();
        for tool in client.list_all_tools().await? {
            let schema = ToolSchema::function(
                tool.name.to_string(),
                tool.description.map(|d| d.to_string()).unwrap_or_default(),
                serde_json::to_value(&*tool.input_schema)?,
            );
            registry.insert(schema.name.clone(), schema);
        }
        info!(tools = ?registry.keys().collect::<Vec<_>>(), "Tool registry ready");

        Ok(Self {
            client,
            registry,
            server_handle,
        })
    }

    async fn try_dispatch(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let name = &call.function.name;
        if !self.registry.contains_key(name) {
            return Err(ToolError::UnknownFunction);
        }
        let arguments = parse_arguments(&call.function.arguments_json)?;

        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.clone().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|content| match content.raw {
                RawContent::Text(text_content) => Some(text_content.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error == Some(true) {
            return Err(ToolError::Failed(text));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl ToolDispatch for McpToolDispatcher {
    fn declarations(&self) -> Vec<ToolSchema> {
        let mut declarations: Vec<ToolSchema> = self.registry.values().cloned().collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    async fn dispatch(&self, call: &ToolCall) -> Value {
        info!(call_id = %call.id, name = %call.function.name, "Dispatching tool call");
        match self.try_dispatch(call).await {
            Ok(value) => value,
            Err(e) => {
                warn!(call_id = %call.id, name = %call.function.name, error = %e, "Tool call failed");
                e.into_value()
            }
        }
    }
}

impl Drop for McpToolDispatcher {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CapabilityEndpoints, CapabilityService};
    use rmcp::{
        handler::server::{router::tool::ToolRouter, tool::Parameters},
        model::{ServerCapabilities, ServerInfo},
        tool, tool_handler, tool_router,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema, Debug)]
    struct EchoArgs {
        text: String,
    }

    struct EchoService {
        tool_router: ToolRouter<Self>,
    }

    #[tool_handler]
    impl ServerHandler for EchoService {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    #[tool_router]
    impl EchoService {
        fn new() -> Self {
            Self {
                tool_router: Self::tool_router(),
            }
        }

        #[tool(description = "Echo the text back as JSON.")]
        async fn echo(&self, args: Parameters<EchoArgs>) -> Result<String, String> {
            Ok(json!({ "echo": args.0.text }).to_string())
        }

        #[tool(description = "Always fails.")]
        async fn explode(&self) -> Result<String, String> {
            Err("kaboom".to_string())
        }
    }

    #[test]
    fn test_tool_error_values() {
        assert_eq!(
            ToolError::UnknownFunction.into_value(),
            json!({ "error": "unknown function" })
        );
        assert_eq!(
            ToolError::Failed("boom".into()).into_value(),
            json!({ "error": "boom" })
        );
    }

    #[test]
    fn test_parse_arguments_requires_an_object() {
        assert!(parse_arguments(r#"{"a":1}"#).is_ok());
        assert!(matches!(
            parse_arguments("[1, 2]"),
            Err(ToolError::InvalidArguments(_))
        ));
        assert!(parse_arguments("{oops").is_err());
    }

    #[tokio::test]
    async fn test_registry_lists_declared_tools() {
        let dispatcher = McpToolDispatcher::start(EchoService::new()).await.unwrap();
        let names: Vec<String> = dispatcher
            .declarations()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["echo".to_string(), "explode".to_string()]);
        assert!(dispatcher.declarations().iter().all(|d| d.kind == "function"));
    }

    #[tokio::test]
    async fn test_dispatch_success_returns_parsed_json() {
        let dispatcher = McpToolDispatcher::start(EchoService::new()).await.unwrap();
        let result = dispatcher
            .dispatch(&ToolCall::function("c1", "echo", r#"{"text":"hello"}"#))
            .await;
        assert_eq!(result, json!({ "echo": "hello" }));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_function() {
        let dispatcher = McpToolDispatcher::start(EchoService::new()).await.unwrap();
        let result = dispatcher
            .dispatch(&ToolCall::function("c1", "launch_rocket", "{}"))
            .await;
        assert_eq!(result, json!({ "error": "unknown function" }));
    }

    #[tokio::test]
    async fn test_dispatch_malformed_arguments() {
        let dispatcher = McpToolDispatcher::start(EchoService::new()).await.unwrap();
        let result = dispatcher
            .dispatch(&ToolCall::function("c1", "echo", "{\"text\":"))
            .await;
        let message = result["error"].as_str().unwrap();
        assert!(message.starts_with("invalid arguments"), "{message}");
    }

    #[tokio::test]
    async fn test_dispatch_capability_failure_is_normalized() {
        let dispatcher = McpToolDispatcher::start(EchoService::new()).await.unwrap();
        let result = dispatcher
            .dispatch(&ToolCall::function("c1", "explode", "{}"))
            .await;
        assert_eq!(result, json!({ "error": "kaboom" }));
    }

    #[tokio::test]
    async fn test_dispatch_downstream_network_failure_is_normalized() {
        let endpoints = CapabilityEndpoints {
            geocoding_url: "http://127.0.0.1:9/v1/search".to_string(),
            forecast_url: "http://127.0.0.1:9/v1/forecast".to_string(),
            news_url: None,
        };
        let service = CapabilityService::new(reqwest::Client::new(), endpoints);
        let dispatcher = McpToolDispatcher::start(service).await.unwrap();

        let result = dispatcher
            .dispatch(&ToolCall::function(
                "c1",
                "get_weather",
                r#"{"location":"Paris"}"#,
            ))
            .await;
        let message = result["error"].as_str().unwrap();
        assert!(message.contains("Geocoding failed"), "{message}");
    }
}
