//! The catalog of callable tools.
//!
//! Local tools are declared with [`ToolSpec::builder`]; remote transports
//! publish theirs through [`ToolSpec::remote`]. Both end up in the same
//! [`ToolRegistry`] and are invoked the same way.

use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::errors::{RegistryError, ToolError};
use crate::models::tool::Tool;

fn tool_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").ok())
        .as_ref()
}

/// Names every supported backend accepts
pub fn is_valid_tool_name(name: &str) -> bool {
    tool_name_pattern().is_some_and(|pattern| pattern.is_match(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// No declared type, any value is accepted
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }

    fn from_schema(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("string") => ParamType::String,
            Some("integer") => ParamType::Integer,
            Some("number") => ParamType::Number,
            Some("boolean") => ParamType::Boolean,
            Some("array") => ParamType::Array,
            Some("object") => ParamType::Object,
            _ => ParamType::Any,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    fn to_schema(&self) -> Value {
        let mut property = Map::new();
        if self.kind != ParamType::Any {
            property.insert("type".into(), json!(self.kind.as_str()));
        }
        if !self.description.is_empty() {
            property.insert("description".into(), json!(self.description));
        }
        if let Some(default) = &self.default {
            property.insert("default".into(), default.clone());
        }
        Value::Object(property)
    }
}

/// The body of a tool.
///
/// Handlers receive arguments already decoded and checked against the
/// declared parameters.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.0)(arguments).await
    }
}

/// Runs a synchronous body on the blocking pool
struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> ToolHandler for BlockingHandler<F>
where
    F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let body = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || body(arguments))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("blocking tool task failed: {e}")))?
    }
}

/// Where a tool's handler runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Local,
    Remote { connection: String },
}

#[derive(Clone)]
pub struct ToolSpec {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
    input_schema: Value,
    source: ToolSource,
    /// Whether arguments not named in `params` are passed through
    accepts_extra: bool,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    pub fn builder<S: Into<String>>(name: S) -> ToolSpecBuilder {
        ToolSpecBuilder {
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
            accepts_extra: false,
            handler: None,
        }
    }

    /// Wrap a tool published by a remote connection.
    ///
    /// The schema is taken as given; parameters are read from its
    /// `properties` and `required` entries so arguments can be checked
    /// before they cross the transport.
    pub fn remote<N, D, C>(
        name: N,
        description: D,
        input_schema: Value,
        connection: C,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self, RegistryError>
    where
        N: Into<String>,
        D: Into<String>,
        C: Into<String>,
    {
        let name = name.into();
        if !is_valid_tool_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        let input_schema = if input_schema.is_object() {
            input_schema
        } else {
            json!({"type": "object", "properties": {}})
        };
        Ok(Self {
            params: params_from_schema(&input_schema),
            name,
            description: description.into(),
            input_schema,
            source: ToolSource::Remote {
                connection: connection.into(),
            },
            accepts_extra: true,
            handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn source(&self) -> &ToolSource {
        &self.source
    }

    /// The entry advertised to models
    pub fn to_tool(&self) -> Tool {
        Tool::new(&self.name, &self.description, self.input_schema.clone())
    }

    /// Decode a raw argument payload against the declared parameters.
    ///
    /// An empty payload is an empty object. Missing optional arguments take
    /// their declared default.
    pub fn decode_arguments(&self, raw: &str) -> Result<Value, ToolError> {
        let value: Value = if raw.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(raw).map_err(|e| {
                ToolError::InvalidArguments(format!("could not parse arguments as JSON: {e}"))
            })?
        };

        let Value::Object(mut arguments) = value else {
            return Err(ToolError::InvalidArguments(
                "arguments must be a JSON object".to_string(),
            ));
        };

        if !self.accepts_extra {
            if let Some(unexpected) = arguments
                .keys()
                .find(|key| !self.params.iter().any(|p| &p.name == *key))
            {
                return Err(ToolError::InvalidArguments(format!(
                    "unexpected argument '{unexpected}'"
                )));
            }
        }

        for param in &self.params {
            let present = arguments.get(&param.name).filter(|value| !value.is_null());
            match present {
                Some(value) if !param.kind.matches(value) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "argument '{}' must be of type {}",
                        param.name, param.kind
                    )));
                }
                Some(_) => {}
                None if param.required => {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required argument '{}'",
                        param.name
                    )));
                }
                None => {
                    if let Some(default) = &param.default {
                        arguments.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(Value::Object(arguments))
    }

    pub async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        self.handler.call(arguments).await
    }
}

fn params_from_schema(schema: &Value) -> Vec<ParamSpec> {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, property)| ParamSpec {
                    name: name.clone(),
                    kind: ParamType::from_schema(property.get("type")),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    required: required.contains(&name.as_str()),
                    default: property.get("default").cloned(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct ToolSpecBuilder {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
    accepts_extra: bool,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolSpecBuilder {
    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a required parameter
    pub fn param<N, D>(mut self, name: N, kind: ParamType, description: D) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            default: None,
        });
        self
    }

    /// Declare an optional parameter, filled with `default` when absent
    pub fn optional_param<N, D>(
        mut self,
        name: N,
        kind: ParamType,
        description: D,
        default: Option<Value>,
    ) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
            default,
        });
        self
    }

    /// Pass arguments not declared as parameters through to the handler
    pub fn accept_extra_arguments(mut self) -> Self {
        self.accepts_extra = true;
        self
    }

    pub fn handler<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(FnHandler(body)));
        self
    }

    /// Use a synchronous body, run off the async executor
    pub fn blocking_handler<F>(mut self, body: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(BlockingHandler(Arc::new(body))));
        self
    }

    pub fn handler_arc(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ToolSpec, RegistryError> {
        if !is_valid_tool_name(&self.name) {
            return Err(RegistryError::InvalidName(self.name));
        }
        let handler = self
            .handler
            .ok_or_else(|| RegistryError::MissingHandler(self.name.clone()))?;

        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.to_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        let input_schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });

        Ok(ToolSpec {
            name: self.name,
            description: self.description,
            params: self.params,
            input_schema,
            source: ToolSource::Local,
            accepts_extra: self.accepts_extra,
            handler,
        })
    }
}

/// A consistent, ordered view of the registry taken at one point in time
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    tools: IndexMap<String, ToolSpec>,
}

impl RegistrySnapshot {
    pub fn lookup(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// The catalog advertised to models for one round
    pub fn catalog(&self) -> Vec<Tool> {
        self.tools.values().map(ToolSpec::to_tool).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Shared, insertion-ordered tool catalog.
///
/// Cloning shares the underlying catalog. Snapshot order only changes when
/// tools are added or removed.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<IndexMap<String, ToolSpec>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A name already in use is rejected and the existing tool kept.
    pub fn register(&self, spec: ToolSpec) -> Result<(), RegistryError> {
        if !is_valid_tool_name(spec.name()) {
            return Err(RegistryError::InvalidName(spec.name().to_string()));
        }
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(spec.name()) {
            warn!(tool = spec.name(), source = ?spec.source(), "rejecting duplicate tool name");
            return Err(RegistryError::DuplicateName(spec.name().to_string()));
        }
        debug!(tool = spec.name(), source = ?spec.source(), "registered tool");
        tools.insert(spec.name().to_string(), spec);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<ToolSpec> {
        let removed = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(name);
        if removed.is_some() {
            debug!(tool = name, "unregistered tool");
        }
        removed
    }

    /// Remove every tool published by a remote connection, returning their names
    pub fn unregister_source(&self, connection: &str) -> Vec<String> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        tools.retain(|name, spec| match spec.source() {
            ToolSource::Remote { connection: c } if c == connection => {
                removed.push(name.clone());
                false
            }
            _ => true,
        });
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names published by a remote connection, in catalog order
    pub fn names_from(&self, connection: &str) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|spec| {
                matches!(spec.source(), ToolSource::Remote { connection: c } if c == connection)
            })
            .map(|spec| spec.name().to_string())
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            tools: self
                .tools
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
