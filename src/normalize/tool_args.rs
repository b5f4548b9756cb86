//! Canonical argument names for tool executors.

use serde_json::{Map, Value};

const FILE_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit",
    "replace",
    "read",
    "write",
    "multi_edit",
];
const FILE_KEYS: &[&str] = &["path", "file", "filename", "filePath", "file_name"];

const DIR_TOOLS: &[&str] = &[
    "list_directory",
    "ls",
    "glob",
    "grep",
    "search_file_content",
];
const DIR_KEYS: &[&str] = &[
    "path",
    "directory",
    "dir",
    "folder",
    "directory_path",
    "dirPath",
];
/// Directory tools whose executor requires `dir_path`.
const DIR_REQUIRED: &[&str] = &["list_directory", "ls"];

/// Path-like keys whose values may carry a leading `@`.
const PATH_KEYS: &[&str] = &["file_path", "dir_path", "absolute_path", "paths"];

/// Rename backend-specific argument spellings for `tool_name`.
pub fn normalize_tool_args(tool_name: &str, args: Value) -> Value {
    let mut map = match args {
        Value::Object(map) => map,
        other => return other,
    };
    let name = tool_name.to_ascii_lowercase();

    if FILE_TOOLS.contains(&name.as_str()) {
        rename_first(&mut map, FILE_KEYS, "file_path");
    } else if DIR_TOOLS.contains(&name.as_str()) {
        rename_first(&mut map, DIR_KEYS, "dir_path");
        if DIR_REQUIRED.contains(&name.as_str()) && !map.contains_key("dir_path") {
            map.insert("dir_path".to_string(), Value::String(".".to_string()));
        }
    }

    for key in PATH_KEYS {
        if let Some(value) = map.get_mut(*key) {
            strip_at_marker(value);
        }
    }

    Value::Object(map)
}

fn rename_first(map: &mut Map<String, Value>, aliases: &[&str], canonical: &str) {
    if map.contains_key(canonical) {
        return;
    }
    for alias in aliases {
        if let Some(value) = map.remove(*alias) {
            map.insert(canonical.to_string(), value);
            return;
        }
    }
}

fn strip_at_marker(value: &mut Value) {
    match value {
        Value::String(text) => {
            if let Some(rest) = text.strip_prefix('@') {
                *text = rest.to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_at_marker),
        _ => {}
    }
}
