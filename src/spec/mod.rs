//! Spec processing: parse an uploaded OpenAPI/Swagger document, resolve the
//! upstream base URL, and extract tool descriptors.
//!
//! [`SpecProcessor::resolve`] is a pure function of its inputs: it touches
//! neither the filesystem nor the port pool, so a rejected upload leaves no
//! trace.

pub mod extract;
pub mod tool;

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::error::FoundryError;
use crate::spec::extract::{OpenApiToolExtractor, ToolExtractor};
use crate::spec::tool::ToolDescriptor;

/// Output of a successful [`SpecProcessor::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub document: Value,
    pub base_url: String,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Clone)]
pub struct SpecProcessor {
    extractor: Arc<dyn ToolExtractor>,
}

impl Default for SpecProcessor {
    fn default() -> Self {
        Self::new(Arc::new(OpenApiToolExtractor))
    }
}

impl SpecProcessor {
    pub fn new(extractor: Arc<dyn ToolExtractor>) -> Self {
        Self { extractor }
    }

    /// Parse, resolve the base URL, and extract tools, in that order.
    ///
    /// Fails with `InvalidSpecification`, `MissingBaseUrl` or
    /// `ToolExtractionFailed` respectively.
    pub fn resolve(
        &self,
        raw: &[u8],
        declared_base_url: Option<&str>,
    ) -> crate::Result<ResolvedSpec> {
        let document = parse_document(raw)?;
        let base_url = resolve_base_url(&document, declared_base_url)?;
        let tools = self
            .extractor
            .extract(&document, &base_url)
            .map_err(|e| match e {
                FoundryError::ToolExtractionFailed(_) => e,
                other => FoundryError::ToolExtractionFailed(other.to_string()),
            })?;
        Ok(ResolvedSpec {
            document,
            base_url,
            tools,
        })
    }
}

/// Parse as JSON, falling back to YAML. The result must be a mapping.
pub fn parse_document(raw: &[u8]) -> crate::Result<Value> {
    let document = match serde_json::from_slice::<Value>(raw) {
        Ok(v) => v,
        Err(json_err) => serde_yaml::from_slice::<Value>(raw).map_err(|yaml_err| {
            FoundryError::InvalidSpecification(format!(
                "not JSON ({}) and not YAML ({})",
                json_err, yaml_err
            ))
        })?,
    };
    if !document.is_object() {
        return Err(FoundryError::InvalidSpecification(
            "document root must be a mapping".to_string(),
        ));
    }
    Ok(document)
}

/// Pick the base URL: declared, else OpenAPI 3 `servers[0]`, else Swagger 2
/// `schemes[0]://host basePath`.
pub fn resolve_base_url(document: &Value, declared: Option<&str>) -> crate::Result<String> {
    if let Some(declared) = declared.map(str::trim).filter(|d| !d.is_empty()) {
        return normalize_base_url(declared).ok_or_else(|| {
            tracing::warn!(base_url = %declared, "declared base URL is not an absolute http(s) URL");
            FoundryError::MissingBaseUrl
        });
    }

    if let Some(server) = document.pointer("/servers/0") {
        if let Some(raw) = server.get("url").and_then(Value::as_str) {
            let expanded = substitute_server_variables(raw, server.get("variables"));
            return normalize_base_url(&expanded).ok_or(FoundryError::MissingBaseUrl);
        }
    }

    if let Some(host) = document
        .get("host")
        .and_then(Value::as_str)
        .filter(|h| !h.trim().is_empty())
    {
        let scheme = document
            .pointer("/schemes/0")
            .and_then(Value::as_str)
            .unwrap_or("https");
        let base_path = document
            .get("basePath")
            .and_then(Value::as_str)
            .unwrap_or("");
        let candidate = format!("{}://{}{}", scheme, host.trim(), base_path);
        return normalize_base_url(&candidate).ok_or(FoundryError::MissingBaseUrl);
    }

    Err(FoundryError::MissingBaseUrl)
}

/// Replace `{name}` with `variables.name.default`.
fn substitute_server_variables(url: &str, variables: Option<&Value>) -> String {
    let Some(vars) = variables.and_then(Value::as_object) else {
        return url.to_string();
    };
    let mut out = url.to_string();
    for (name, var) in vars {
        if let Some(default) = var.get("default").and_then(Value::as_str) {
            out = out.replace(&format!("{{{}}}", name), default);
        }
    }
    out
}

fn normalize_base_url(candidate: &str) -> Option<String> {
    let parsed = Url::parse(candidate).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(candidate.trim_end_matches('/').to_string())
}
