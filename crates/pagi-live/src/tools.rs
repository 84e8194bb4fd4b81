//! Tool registry: name → async handler, with typed arguments validated at the
//! dispatch boundary.
//!
//! Handlers are external collaborators (document generation, search, file
//! analysis...). The session only needs their name, a schema to advertise at
//! setup, and a way to call them.

use crate::error::ToolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Tool call requested by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Correlates the response with this request.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of a tool call, correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub outcome: Result<Value, ToolError>,
}

impl ToolCallResponse {
    pub fn ok(request_id: impl Into<String>, name: impl Into<String>, output: Value) -> Self {
        Self {
            id: request_id.into(),
            name: name.into(),
            outcome: Ok(output),
        }
    }

    pub fn error(request_id: impl Into<String>, name: impl Into<String>, err: ToolError) -> Self {
        Self {
            id: request_id.into(),
            name: name.into(),
            outcome: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Wire payload: `{"output": ...}` or `{"error": "..."}`.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            Ok(output) => serde_json::json!({ "output": output }),
            Err(err) => serde_json::json!({ "error": err.to_string() }),
        }
    }
}

/// Declaration advertised to the agent at setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Untyped tool handler.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Unique tool identifier
    fn name(&self) -> &str;

    /// Human-readable description shown to the agent
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Run the tool. May take seconds to minutes.
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Tool with a defined argument and result schema.
#[async_trait::async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Args: DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> Value;

    async fn run(&self, args: Self::Args) -> Result<Self::Output, ToolError>;
}

/// Adapts a [`TypedTool`] to [`ToolHandler`]; bad arguments never reach `run`.
pub struct Typed<T>(pub T);

#[async_trait::async_trait]
impl<T: TypedTool> ToolHandler for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn parameters(&self) -> Value {
        self.0.parameters()
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: T::Args =
            serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
                tool: self.0.name().to_string(),
                reason: e.to_string(),
            })?;
        let output = self.0.run(args).await?;
        serde_json::to_value(output)
            .map_err(|e| ToolError::Failed(format!("unserializable tool output: {}", e)))
    }
}

/// Name → handler mapping supplied by the caller.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A handler with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        if let Some(pos) = self.tools.iter().position(|t| t.name() == tool.name()) {
            warn!(tool = tool.name(), "replacing registered tool");
            self.tools[pos] = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn register_typed<T: TypedTool>(&mut self, tool: T) {
        self.register(Arc::new(Typed(tool)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }
}
