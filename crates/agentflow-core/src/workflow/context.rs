//! Instance data context helpers: dotted-path lookup, merging and
//! `${key}` placeholder rendering.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// The mutable working context of a workflow instance.
pub type DataMap = serde_json::Map<String, Value>;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static placeholder regex"))
}

/// Look up a dotted path (`user.profile.age`, `tags.0`) in the data context.
pub fn lookup<'a>(data: &'a DataMap, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Merge an object result into `data`; keys overwrite. Non-object results
/// are not merged.
pub fn merge_result(data: &mut DataMap, result: &Value) {
    if let Value::Object(map) = result {
        for (k, v) in map {
            data.insert(k.clone(), v.clone());
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render `${key}` placeholders, failing on the first missing key.
pub fn render_strict(template: &str, data: &DataMap) -> Result<String, String> {
    let mut missing = None;
    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures| {
        let key = caps[1].trim();
        match lookup(data, key) {
            Some(v) => render_scalar(v),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(key),
        None => Ok(rendered.into_owned()),
    }
}

/// Resolve placeholders inside a parameter value.
///
/// A string that is exactly one placeholder takes the referenced value with
/// its type intact; embedded placeholders are rendered as text. Unknown keys
/// are left as written.
pub fn resolve_value(value: &Value, data: &DataMap) -> Value {
    match value {
        Value::String(s) => {
            let re = placeholder_re();
            if let Some(caps) = re.captures(s) {
                if caps[0].len() == s.len() {
                    if let Some(v) = lookup(data, caps[1].trim()) {
                        return v.clone();
                    }
                }
            }
            let rendered = re.replace_all(s, |caps: &regex::Captures| {
                lookup(data, caps[1].trim())
                    .map(render_scalar)
                    .unwrap_or_else(|| caps[0].to_string())
            });
            Value::String(rendered.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}
