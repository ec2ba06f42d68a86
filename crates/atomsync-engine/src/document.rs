//! Generic document operations: RFC 6902 application and reference scans.
//!
//! Nothing here knows the shape of any particular atom.

use atomsync_common::{AtomKey, AtomKind, Error, Result};
use serde_json::{Map, Value};

/// Apply a JSON patch to `base`, or to an empty object when `base` is
/// `None`. A failure is reported as [`Error::MalformedPatch`] for the atom.
pub fn apply_patch(base: Option<Value>, operations: &Value, key: &AtomKey) -> Result<Value> {
    let malformed = |message: String| Error::MalformedPatch {
        kind: key.kind.to_string(),
        id: key.id.clone(),
        message,
    };
    let patch: json_patch::Patch =
        serde_json::from_value(operations.clone()).map_err(|e| malformed(e.to_string()))?;
    let mut document = base.unwrap_or_else(|| Value::Object(Map::new()));
    json_patch::patch(&mut document, &patch.0).map_err(|e| malformed(e.to_string()))?;
    Ok(document)
}

/// An embedded `{kind, id[, checksum]}` object naming another atom
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub key: AtomKey,
    pub checksum: Option<String>,
}

/// Recognize a reference object
pub fn as_reference(value: &Value) -> Option<Reference> {
    let object = value.as_object()?;
    let kind: AtomKind = object.get("kind")?.as_str()?.parse().ok()?;
    let id = object.get("id")?.as_str()?;
    let checksum = object
        .get("checksum")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Reference {
        key: AtomKey::new(kind, id),
        checksum,
    })
}

/// Every reference below the root, in document order. The root itself is
/// never a reference and references are not searched for nested ones.
pub fn references(document: &Value) -> Vec<Reference> {
    fn walk(value: &Value, out: &mut Vec<Reference>) {
        match value {
            Value::Array(items) => items.iter().for_each(|item| visit(item, out)),
            Value::Object(fields) => fields.values().for_each(|field| visit(field, out)),
            _ => {}
        }
    }
    fn visit(value: &Value, out: &mut Vec<Reference>) {
        match as_reference(value) {
            Some(reference) => out.push(reference),
            None => walk(value, out),
        }
    }
    let mut out = Vec::new();
    walk(document, &mut out);
    out
}

/// Replace every reference below the root with `resolve(reference)`.
/// Array items that resolve to `None` are dropped; object fields become
/// `null`.
pub fn expand_references(
    document: &mut Value,
    resolve: &mut impl FnMut(&Reference) -> Option<Value>,
) {
    match document {
        Value::Array(items) => {
            let mut expanded = Vec::with_capacity(items.len());
            for mut item in items.drain(..) {
                if let Some(reference) = as_reference(&item) {
                    if let Some(resolved) = resolve(&reference) {
                        expanded.push(resolved);
                    }
                } else {
                    expand_references(&mut item, resolve);
                    expanded.push(item);
                }
            }
            *items = expanded;
        }
        Value::Object(fields) => {
            for field in fields.values_mut() {
                if let Some(reference) = as_reference(field) {
                    *field = resolve(&reference).unwrap_or(Value::Null);
                } else {
                    expand_references(field, resolve);
                }
            }
        }
        _ => {}
    }
}
