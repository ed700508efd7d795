use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    Read,
    Write,
}

impl ToolAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub description: String,
}

impl ArgSpec {
    pub fn required(name: impl Into<String>, kind: ArgKind, description: impl Into<String>) -> Self {
        Self { name: name.into(), kind, required: true, description: description.into() }
    }

    pub fn optional(name: impl Into<String>, kind: ArgKind, description: impl Into<String>) -> Self {
        Self { name: name.into(), kind, required: false, description: description.into() }
    }
}

/// Violations are machine-readable so the plan validator can surface a
/// precise rejection reason without echoing raw internals to the user.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("required argument `{name}` is missing")]
    MissingRequired { name: String },
    #[error("argument `{name}` must be a {expected}")]
    WrongType { name: String, expected: &'static str },
    #[error("argument `{name}` must not be null")]
    NullRequired { name: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSchema {
    pub args: Vec<ArgSpec>,
}

impl ArgSchema {
    pub fn new(args: Vec<ArgSpec>) -> Self {
        Self { args }
    }

    pub fn empty() -> Self {
        Self { args: Vec::new() }
    }

    /// Structural conformance only. Unknown fields are ignored; argument
    /// meaning remains each tool's own responsibility.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), SchemaViolation> {
        for spec in &self.args {
            match args.get(&spec.name) {
                None if spec.required => {
                    return Err(SchemaViolation::MissingRequired { name: spec.name.clone() });
                }
                None => {}
                Some(Value::Null) if spec.required => {
                    return Err(SchemaViolation::NullRequired { name: spec.name.clone() });
                }
                Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(SchemaViolation::WrongType {
                        name: spec.name.clone(),
                        expected: spec.kind.as_str(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn render(&self) -> String {
        if self.args.is_empty() {
            return "args: (none)".to_string();
        }

        let parts = self
            .args
            .iter()
            .map(|spec| {
                let requirement = if spec.required { "required" } else { "optional" };
                if spec.description.is_empty() {
                    format!("{}:{} ({requirement})", spec.name, spec.kind.as_str())
                } else {
                    format!(
                        "{}:{} ({requirement}) - {}",
                        spec.name,
                        spec.kind.as_str(),
                        spec.description
                    )
                }
            })
            .collect::<Vec<_>>();

        format!("args: {}", parts.join("; "))
    }
}

/// Per-dispatch context handed to executors alongside the validated args.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub request_id: String,
    pub session_id: String,
    pub channel: String,
    pub user_id: Option<String>,
    pub confirmed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
    /// A fatal failure aborts the remaining calls in the same plan.
    pub fatal: bool,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: false }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: true }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext)
        -> Result<Value, ToolFailure>;
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: ArgSchema,
    pub access: ToolAccess,
    pub executor: Arc<dyn ToolExecutor>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ArgSchema,
        access: ToolAccess,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), schema, access, executor }
    }

    pub fn is_write(&self) -> bool {
        self.access.requires_confirmation()
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("access", &self.access)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool `{name}` is already registered")]
    DuplicateTool { name: String },
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },
}

/// Closed allowlist of callable capabilities. Built once at startup,
/// read-only afterwards; dispatch is a lookup by name, never reflection
/// over arbitrary callables.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool { name: descriptor.name });
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor, RegistryError> {
        self.tools.get(name).ok_or_else(|| RegistryError::UnknownTool { name: name.to_string() })
    }

    pub fn schema_for(&self, name: &str) -> Result<&ArgSchema, RegistryError> {
        self.lookup(name).map(|descriptor| &descriptor.schema)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Text catalog handed to the planner. Argument specs are rendered from
    /// the enforceable schemas so the model never sees parameters that
    /// validation would not accept.
    pub fn catalog(&self) -> String {
        let mut output = String::new();
        for descriptor in self.tools.values() {
            let confirm_note =
                if descriptor.is_write() { " (requires_confirmation)" } else { "" };
            let _ = writeln!(
                output,
                "- {} ({}){confirm_note}: {}\n  {}",
                descriptor.name,
                descriptor.access.as_str(),
                descriptor.description,
                descriptor.schema.render(),
            );
        }
        output.trim_end().to_string()
    }
}
