//! Tool descriptors: one callable unit per API operation.

use std::sync::Arc;

use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Where an operation parameter is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
    FormData,
}

impl ParameterLocation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            "body" => Some(Self::Body),
            "formData" => Some(Self::FormData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameter {
    pub name: String,
    pub location: ParameterLocation,
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the parameter value.
    pub schema: Value,
}

/// A tool derived from one operation of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub operation_id: Option<String>,
    /// Upper-case HTTP method.
    pub method: String,
    /// Path template as written in the document, e.g. `/pets/{petId}`.
    pub path: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ToolDescriptor {
    /// JSON Schema object describing this tool's arguments.
    pub fn input_schema(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut schema = match &param.schema {
                Value::Object(obj) => obj.clone(),
                _ => Map::new(),
            };
            if let Some(desc) = &param.description {
                schema
                    .entry("description")
                    .or_insert_with(|| Value::String(desc.clone()));
            }
            properties.insert(param.name.clone(), Value::Object(schema));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert("properties".to_string(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".to_string(), Value::Array(required));
        }
        schema
    }

    /// Convert to the MCP tool definition the generated server advertises.
    pub fn to_mcp_tool(&self) -> Tool {
        let description = self
            .summary
            .clone()
            .unwrap_or_else(|| format!("Calls {} {}", self.method, self.path));
        Tool {
            name: self.name.clone().into(),
            title: None,
            description: Some(description.into()),
            input_schema: Arc::new(self.input_schema()),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}
