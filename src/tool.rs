//! Tool descriptors and invokers
//!
//! A tool is a descriptor (name, description, argument schema, backend kind,
//! optional deadline) paired with an invoker. Invokers are Tower services from
//! a JSON argument object to a JSON result object, so local functions, hosted
//! API clients and discovered actions all look the same to the
//! [`ToolRegistry`](crate::tool_registry::ToolRegistry).

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::BoxError;

use crate::model::ToolSchema;

/// Boxed invoker: JSON arguments in, JSON payload out.
pub type ToolInvoker = BoxCloneService<Value, Value, BoxError>;

/// Backend a tool is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// In-process function.
    #[default]
    Function,
    /// Remote action hosted behind an API.
    HostedApi,
    /// Action found through a discovery protocol at runtime.
    Discovered,
}

/// Declared capability of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema the argument payload must satisfy.
    pub parameters: Value,
    pub kind: ToolKind,
    /// Per-tool deadline; the registry default applies when unset.
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object" }),
            kind: ToolKind::Function,
            timeout: None,
        }
    }

    pub fn parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Model-facing view of this tool.
    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// A registrable tool: descriptor plus invoker.
#[derive(Clone)]
pub struct ToolDef {
    pub descriptor: ToolDescriptor,
    pub invoker: ToolInvoker,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ToolDef {
    pub fn new(descriptor: ToolDescriptor, invoker: ToolInvoker) -> Self {
        Self {
            descriptor,
            invoker,
        }
    }

    /// Tool from an async handler over raw JSON arguments.
    pub fn from_fn<H, Fut>(descriptor: ToolDescriptor, handler: H) -> Self
    where
        H: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self::new(descriptor, invoker_fn(handler))
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Wraps an async JSON handler as a [`ToolInvoker`].
pub fn invoker_fn<H, Fut>(handler: H) -> ToolInvoker
where
    H: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let svc = tower::service_fn(move |args: Value| {
        let handler = handler.clone();
        let fut: BoxFuture<'static, Result<Value, BoxError>> = Box::pin(async move { (handler)(args).await });
        fut
    });
    BoxCloneService::new(svc)
}

/// DX sugar: create a tool from a typed handler.
/// - `A` is the input args struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn tool_typed<A, H, Fut, R>(name: &str, description: &str, handler: H) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let parameters =
        serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    let handler = Arc::new(handler);
    let invoker = invoker_fn(move |raw: Value| {
        let h = handler.clone();
        async move {
            let args: A = serde_json::from_value(raw)?;
            let out: R = (h.as_ref())(args).await?;
            Ok(serde_json::to_value(out)?)
        }
    });
    ToolDef::new(
        ToolDescriptor::new(name, description).parameters(parameters),
        invoker,
    )
}
