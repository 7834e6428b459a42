//! Minimal template rendering for image-provided config files.
//!
//! Images ship template files plus a metadata description of when each
//! one applies. The language is variable substitution over a fixed
//! context (`{{ instance.name }}`, `{{ config.user.meta-data }}`,
//! `{{ config_get("key", "default") }}`, ...). Template files are loaded
//! through a chrooted lookup that rejects any path escaping the
//! instance's templates directory.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::devices::Devices;
use crate::instance::ConfigMap;
use crate::{Error, Result};

/// Image metadata, the subset the driver consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateSpec>,
}

/// One template rule from the image metadata, keyed by its guest path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateSpec {
    /// Template file name, resolved inside the templates directory.
    pub template: String,
    /// Triggers this template applies on ("start", "create", ...).
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Variables available to a template.
pub struct TemplateContext<'a> {
    pub trigger: &'a str,
    pub path: &'a str,
    pub instance: &'a BTreeMap<String, String>,
    pub config: &'a ConfigMap,
    pub devices: &'a Devices,
    pub properties: &'a BTreeMap<String, String>,
}

/// Load a template file, confined to `templates_dir`.
pub fn load_template(templates_dir: &Path, name: &str) -> Result<String> {
    let resolved = resolve_chrooted(templates_dir, name)?;
    std::fs::read_to_string(&resolved)
        .map_err(|e| Error::context(format!("Failed to read template file {name:?}: {e}")))
}

/// Resolve `name` inside `root`, rejecting absolute paths and any parent
/// traversal.
fn resolve_chrooted(root: &Path, name: &str) -> Result<PathBuf> {
    let requested = Path::new(name);

    let mut resolved = root.to_path_buf();
    for component in requested.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::context(format!(
                    "Template path {name:?} escapes the templates directory"
                )))
            }
        }
    }

    Ok(resolved)
}

/// Render a template source against the context.
pub fn render(source: &str, ctx: &TemplateContext<'_>) -> String {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after = &rest[open + 2..];

        match after.find("}}") {
            Some(close) => {
                let expr = after[..close].trim();
                output.push_str(&eval(expr, ctx));
                rest = &after[close + 2..];
            }
            None => {
                // Unterminated tag, emit verbatim.
                output.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    output.push_str(rest);
    output
}

fn eval(expr: &str, ctx: &TemplateContext<'_>) -> String {
    if expr == "trigger" {
        return ctx.trigger.to_string();
    }
    if expr == "path" {
        return ctx.path.to_string();
    }

    if let Some(key) = expr.strip_prefix("instance.") {
        return ctx.instance.get(key).cloned().unwrap_or_default();
    }
    if let Some(key) = expr.strip_prefix("properties.") {
        return ctx.properties.get(key).cloned().unwrap_or_default();
    }
    if let Some(key) = expr.strip_prefix("config.") {
        return ctx.config.get(key).cloned().unwrap_or_default();
    }
    if let Some(rest) = expr.strip_prefix("devices.") {
        if let Some((device, key)) = rest.split_once('.') {
            return ctx
                .devices
                .get(device)
                .and_then(|d| d.get(key))
                .cloned()
                .unwrap_or_default();
        }
        return String::new();
    }

    if let Some(args) = expr
        .strip_prefix("config_get(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return config_get(args, ctx);
    }

    // Unknown expression renders empty, matching a missing key.
    String::new()
}

/// `config_get("key", "default")`: the config value with trailing
/// CR/LF trimmed, or the default when the key is unset.
fn config_get(args: &str, ctx: &TemplateContext<'_>) -> String {
    let mut parts = args.splitn(2, ',');
    let key = parts.next().map(unquote).unwrap_or_default();
    let default = parts.next().map(unquote).unwrap_or_default();

    match ctx.config.get(&key) {
        Some(value) => value.trim_end_matches(['\r', '\n']).to_string(),
        None => default,
    }
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
        .to_string()
}
