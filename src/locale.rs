//! Locale file I/O: nested JSON objects of strings, flattened to dot-path
//! keys (`nav.home.title`).

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Flattened locale: dot-path key → string value.
pub type FlatLocale = BTreeMap<String, String>;

/// Flatten a JSON document. Only string leaves are kept; numbers, booleans,
/// arrays and nulls are not translatable and are dropped.
pub fn flatten(value: &Value) -> FlatLocale {
    let mut flat = FlatLocale::new();
    flatten_into(value, String::new(), &mut flat);
    flat
}

fn flatten_into(value: &Value, prefix: String, flat: &mut FlatLocale) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, path, flat);
            }
        }
        Value::String(text) if !prefix.is_empty() => {
            flat.insert(prefix, text.clone());
        }
        _ => {}
    }
}

/// Rebuild nested objects from dot-path keys.
///
/// Fails when one key is both a string and a parent of another key
/// (`a` and `a.b`).
pub fn unflatten(flat: &FlatLocale) -> Result<Value> {
    let mut root = Map::new();

    for (key, text) in flat {
        let mut parts = key.split('.').peekable();
        let mut node = &mut root;

        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                if matches!(node.get(part), Some(Value::Object(_))) {
                    bail!("Key '{}' is both a string and an object", key);
                }
                node.insert(part.to_string(), Value::String(text.clone()));
                break;
            }

            let child = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            node = match child {
                Value::Object(map) => map,
                _ => bail!("Key '{}' is both a string and an object", key),
            };
        }
    }

    Ok(Value::Object(root))
}

/// Read and flatten a locale file that must exist.
pub fn read_locale(path: &Path) -> Result<FlatLocale> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read locale file {}", path.display()))?;
    parse_locale(&contents).with_context(|| format!("Invalid locale file {}", path.display()))
}

/// Read a target locale file. A missing file is `None`; an empty file is an
/// empty locale.
pub fn read_target_locale(path: &Path) -> Result<Option<FlatLocale>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_locale(&contents)
            .map(Some)
            .with_context(|| format!("Invalid locale file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read locale file {}", path.display())),
    }
}

fn parse_locale(contents: &str) -> Result<FlatLocale> {
    if contents.trim().is_empty() {
        return Ok(FlatLocale::new());
    }

    let value: Value = serde_json::from_str(contents).context("Failed to parse JSON")?;
    if !value.is_object() {
        bail!("Locale root must be a JSON object");
    }
    Ok(flatten(&value))
}

/// Write a flattened locale as pretty-printed nested JSON, creating parent
/// directories.
pub fn write_locale(path: &Path, flat: &FlatLocale) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut json =
        serde_json::to_string_pretty(&unflatten(flat)?).context("Failed to serialize locale")?;
    json.push('\n');
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write locale file {}", path.display()))
}
