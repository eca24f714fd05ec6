//! Operation-to-tool mapping.
//!
//! [`ToolExtractor`] is the collaborator seam; [`OpenApiToolExtractor`] is the
//! default mapping for OpenAPI 3 and Swagger 2 documents. It works on the
//! raw JSON tree rather than a typed model so both dialects share one walker.
//! Only local `$ref`s (`#/...`) are followed.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::FoundryError;
use crate::spec::tool::{ParameterLocation, ToolDescriptor, ToolParameter};

/// HTTP methods recognized on a path item, in extraction order.
const METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Upper bound on `$ref` hops before a chain is treated as a cycle.
const MAX_REF_DEPTH: usize = 32;

/// Maximum length of a generated tool name.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Maps a parsed document to tool descriptors.
pub trait ToolExtractor: Send + Sync {
    fn extract(&self, spec: &Value, base_url: &str) -> crate::Result<Vec<ToolDescriptor>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenApiToolExtractor;

fn fail(message: impl Into<String>) -> FoundryError {
    FoundryError::ToolExtractionFailed(message.into())
}

impl ToolExtractor for OpenApiToolExtractor {
    fn extract(&self, spec: &Value, _base_url: &str) -> crate::Result<Vec<ToolDescriptor>> {
        let paths = spec
            .get("paths")
            .ok_or_else(|| fail("document has no 'paths' object"))?
            .as_object()
            .ok_or_else(|| fail("'paths' must be an object"))?;

        let mut sorted: Vec<(&String, &Value)> = paths.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut tools = Vec::new();
        let mut tool_names: HashSet<String> = HashSet::new();

        for (path, item) in sorted {
            let item = resolve_ref(spec, item)?
                .as_object()
                .ok_or_else(|| fail(format!("path item '{}' must be an object", path)))?;

            let shared = parse_parameters(spec, item.get("parameters"), path)?;

            for method in METHODS {
                let Some(operation) = item.get(method) else {
                    continue;
                };
                let operation = operation.as_object().ok_or_else(|| {
                    fail(format!(
                        "operation {} {} must be an object",
                        method.to_uppercase(),
                        path
                    ))
                })?;
                let tool = build_tool(spec, path, method, operation, &shared, &mut tool_names)?;
                tools.push(tool);
            }
        }

        tracing::debug!(tool_count = tools.len(), "tools extracted from specification");
        Ok(tools)
    }
}

fn build_tool(
    spec: &Value,
    path: &str,
    method: &str,
    operation: &Map<String, Value>,
    shared: &[ToolParameter],
    tool_names: &mut HashSet<String>,
) -> crate::Result<ToolDescriptor> {
    let operation_id = operation
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let base_name = operation_id
        .clone()
        .unwrap_or_else(|| canonical_tool_name(method, path));
    let name = reserve_unique_tool_name(tool_names, &base_name);

    let own = parse_parameters(spec, operation.get("parameters"), path)?;
    let mut parameters = merge_parameters(shared, own);

    if let Some(body) = operation.get("requestBody") {
        parameters.push(request_body_parameter(spec, body, path)?);
    }

    let summary = operation
        .get("summary")
        .or_else(|| operation.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ToolDescriptor {
        name,
        operation_id,
        method: method.to_uppercase(),
        path: path.to_string(),
        summary,
        parameters,
        enabled: true,
    })
}

/// Follow local `$ref`s until a concrete value is reached.
fn resolve_ref<'a>(spec: &'a Value, value: &'a Value) -> crate::Result<&'a Value> {
    let mut current = value;
    for _ in 0..MAX_REF_DEPTH {
        let Some(reference) = current.get("$ref").and_then(Value::as_str) else {
            return Ok(current);
        };
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| fail(format!("external $ref '{}' is not supported", reference)))?;
        current = spec
            .pointer(pointer)
            .ok_or_else(|| fail(format!("unresolvable $ref '{}'", reference)))?;
    }
    Err(fail("$ref chain too deep or cyclic"))
}

fn parse_parameters(
    spec: &Value,
    raw: Option<&Value>,
    path: &str,
) -> crate::Result<Vec<ToolParameter>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let list = raw
        .as_array()
        .ok_or_else(|| fail(format!("parameters of '{}' must be an array", path)))?;

    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let param = resolve_ref(spec, entry)?
            .as_object()
            .ok_or_else(|| fail(format!("parameter of '{}' must be an object", path)))?;
        let name = param
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| fail(format!("parameter of '{}' has no name", path)))?;
        let location_raw = param
            .get("in")
            .and_then(Value::as_str)
            .ok_or_else(|| fail(format!("parameter '{}' of '{}' has no 'in'", name, path)))?;
        let location = ParameterLocation::parse(location_raw).ok_or_else(|| {
            fail(format!(
                "parameter '{}' of '{}' has unknown location '{}'",
                name, path, location_raw
            ))
        })?;

        // Path parameters are always required, whatever the document says.
        let required = location == ParameterLocation::Path
            || param.get("required").and_then(Value::as_bool).unwrap_or(false);

        out.push(ToolParameter {
            name: name.to_string(),
            location,
            required,
            description: param
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            schema: parameter_schema(spec, param)?,
        });
    }
    Ok(out)
}

/// OpenAPI 3 keeps the schema under `schema`; Swagger 2 inlines it for
/// non-body parameters.
fn parameter_schema(spec: &Value, param: &Map<String, Value>) -> crate::Result<Value> {
    if let Some(schema) = param.get("schema") {
        return Ok(resolve_ref(spec, schema)?.clone());
    }
    let mut schema = Map::new();
    for key in ["type", "format", "items", "enum", "default", "minimum", "maximum"] {
        if let Some(v) = param.get(key) {
            schema.insert(key.to_string(), v.clone());
        }
    }
    if schema.is_empty() {
        schema.insert("type".to_string(), json!("string"));
    }
    Ok(Value::Object(schema))
}

/// Operation-level parameters override path-level ones with the same name
/// and location.
fn merge_parameters(shared: &[ToolParameter], own: Vec<ToolParameter>) -> Vec<ToolParameter> {
    let mut merged: Vec<ToolParameter> = shared
        .iter()
        .filter(|s| {
            !own.iter()
                .any(|o| o.name == s.name && o.location == s.location)
        })
        .cloned()
        .collect();
    merged.extend(own);
    merged
}

fn request_body_parameter(spec: &Value, body: &Value, path: &str) -> crate::Result<ToolParameter> {
    let body = resolve_ref(spec, body)?
        .as_object()
        .ok_or_else(|| fail(format!("requestBody of '{}' must be an object", path)))?;

    let content = body.get("content").and_then(Value::as_object);
    let media = content.and_then(|c| {
        c.get("application/json")
            .or_else(|| c.values().next())
            .and_then(Value::as_object)
    });
    let schema = match media.and_then(|m| m.get("schema")) {
        Some(s) => resolve_ref(spec, s)?.clone(),
        None => json!({"type": "object"}),
    };

    Ok(ToolParameter {
        name: "body".to_string(),
        location: ParameterLocation::Body,
        required: body.get("required").and_then(Value::as_bool).unwrap_or(false),
        description: body
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        schema,
    })
}

/// Generate a tool name from method and path, e.g. `get_pets_petId`.
pub fn canonical_tool_name(method: &str, path: &str) -> String {
    static PATH_PARAM: OnceLock<Regex> = OnceLock::new();
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();

    let path_param = PATH_PARAM.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("valid regex"));
    let non_alnum = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-zA-Z0-9]+").expect("valid regex"));

    let raw = format!("{}_{}", method.to_lowercase(), path);
    let with_params = path_param.replace_all(&raw, "_$1");
    let collapsed = non_alnum.replace_all(&with_params, "_");
    let mut name = collapsed.trim_matches('_').to_string();
    if name.len() > MAX_TOOL_NAME_LEN {
        // Names are ASCII after the replacement above.
        name.truncate(MAX_TOOL_NAME_LEN);
    }
    name
}

fn reserve_unique_tool_name(tool_names: &mut HashSet<String>, base: &str) -> String {
    if tool_names.insert(base.to_string()) {
        return base.to_string();
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_{counter}");
        if tool_names.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}
