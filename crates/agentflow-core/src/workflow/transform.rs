//! Transform steps: pure operations over a snapshot of the data context.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;
use crate::workflow::context::{lookup, render_strict, DataMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Set `key` to a literal value
    Set { key: String, value: Value },
    /// Copy the value at a dotted path to `to`
    Copy { from: String, to: String },
    /// Move a top-level key
    Rename { from: String, to: String },
    /// Remove a top-level key (absent keys are ignored)
    Remove { key: String },
    /// Render a `${key}` template into `key`
    Format { key: String, template: String },
}

/// Apply `ops` in order to a copy of `data` and return the new context.
pub fn apply(ops: &[TransformOp], data: &DataMap) -> Result<DataMap, WorkflowError> {
    let mut out = data.clone();
    for op in ops {
        match op {
            TransformOp::Set { key, value } => {
                out.insert(key.clone(), value.clone());
            }
            TransformOp::Copy { from, to } => {
                let value = lookup(&out, from)
                    .cloned()
                    .ok_or_else(|| WorkflowError::TransformFailed(format!("copy: '{}' not found", from)))?;
                out.insert(to.clone(), value);
            }
            TransformOp::Rename { from, to } => {
                let value = out
                    .remove(from)
                    .ok_or_else(|| WorkflowError::TransformFailed(format!("rename: '{}' not found", from)))?;
                out.insert(to.clone(), value);
            }
            TransformOp::Remove { key } => {
                out.remove(key);
            }
            TransformOp::Format { key, template } => {
                let rendered = render_strict(template, &out).map_err(|missing| {
                    WorkflowError::TransformFailed(format!(
                        "format '{}': '{}' not found",
                        key, missing
                    ))
                })?;
                out.insert(key.clone(), Value::String(rendered));
            }
        }
    }
    Ok(out)
}
