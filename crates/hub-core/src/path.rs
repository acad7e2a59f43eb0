//! JSON path extraction and enumeration
//!
//! Paths look like `cpu.usage`, `$.items[0].name` or `data.0.temp`. A numeric
//! segment after a `.` is an array index only when the node it is applied to
//! is an array; on an object it is an ordinary key.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::{MAX_ENUM_DEPTH, MAX_NAME_LEN, MAX_SAMPLE_LEN};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains an empty segment")]
    EmptySegment,

    #[error("unclosed '[' in path")]
    UnclosedBracket,

    #[error("invalid array index: {0}")]
    InvalidIndex(String),

    #[error("unexpected character after ']': {0}")]
    UnexpectedChar(char),
}

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a path expression into segments
///
/// An empty path or a lone `$` addresses the root.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let mut rest = path.trim();
    if let Some(r) = rest.strip_prefix('$') {
        rest = r;
    }
    let rest = rest.strip_prefix('.').unwrap_or(rest);

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut after_bracket = false;
    let mut trailing_dot = false;
    let mut chars = rest.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !after_bracket {
                    return Err(PathError::EmptySegment);
                }
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                after_bracket = false;
                trailing_dot = true;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut idx = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => idx.push(d),
                        None => return Err(PathError::UnclosedBracket),
                    }
                }
                let n = idx
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| PathError::InvalidIndex(idx.clone()))?;
                segments.push(PathSegment::Index(n));
                after_bracket = true;
                trailing_dot = false;
            }
            other => {
                if after_bracket {
                    return Err(PathError::UnexpectedChar(other));
                }
                current.push(other);
                trailing_dot = false;
            }
        }
    }

    if trailing_dot {
        return Err(PathError::EmptySegment);
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    Ok(segments)
}

/// Check that a path parses
pub fn validate(path: &str) -> Result<(), PathError> {
    parse_path(path).map(|_| ())
}

/// Walk parsed segments from `root`
pub fn extract_segments<'a>(root: &'a Json, segments: &[PathSegment]) -> Option<&'a Json> {
    let mut node = root;
    for segment in segments {
        node = match (segment, node) {
            (PathSegment::Index(i), Json::Array(items)) => items.get(*i)?,
            (PathSegment::Key(k), Json::Object(map)) => map.get(k)?,
            (PathSegment::Key(k), Json::Array(items)) => {
                let i = k.parse::<usize>().ok()?;
                items.get(i)?
            }
            _ => return None,
        };
    }
    Some(node)
}

/// Extract the sub-tree at `path`, unchanged
///
/// Returns `None` when the path does not resolve or does not parse.
pub fn extract<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let segments = parse_path(path).ok()?;
    extract_segments(root, &segments)
}

/// Variable name used when a bare `json_path` is upgraded to a mapping
pub fn auto_var_name(source_id: &str, path: &str) -> String {
    let path = path.trim();
    let path = path.strip_prefix("$.").unwrap_or(path);
    let mut name: String = format!("{}.{}", source_id, path)
        .chars()
        .map(|c| if c == '[' || c == ']' { '_' } else { c })
        .collect();
    crate::value::truncate_str(&mut name, MAX_NAME_LEN - 1);
    name
}

/// One record produced by the path enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip)]
    pub depth: usize,
}

fn json_kind(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn sample_of(v: &Json) -> Option<String> {
    let raw = match v {
        Json::Null => "null".to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => s.clone(),
        Json::Array(_) | Json::Object(_) => return None,
    };
    if raw.chars().count() > MAX_SAMPLE_LEN {
        let cut: String = raw.chars().take(MAX_SAMPLE_LEN - 3).collect();
        Some(format!("{}...", cut))
    } else {
        Some(raw)
    }
}

/// Enumerate every path below `root`, up to depth 5
///
/// Arrays report their length and only element `[0]` is descended. Object
/// keys that a path cannot spell (containing `.`, `[` or `]`, empty, or
/// padded with whitespace) are skipped along with their subtrees.
pub fn enumerate(root: &Json) -> Vec<PathEntry> {
    enumerate_from(root, "", 1)
}

/// Enumerate below `root` as if it sat at `prefix` with children at `start_depth`
pub fn enumerate_from(root: &Json, prefix: &str, start_depth: usize) -> Vec<PathEntry> {
    let mut out = Vec::new();
    walk(root, prefix, start_depth, &mut out);
    out
}

fn walk(node: &Json, prefix: &str, depth: usize, out: &mut Vec<PathEntry>) {
    if depth > MAX_ENUM_DEPTH {
        return;
    }
    match node {
        Json::Object(map) => {
            for (key, child) in map {
                if !addressable(key, prefix.is_empty()) {
                    continue;
                }
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                visit(child, path, depth, out);
            }
        }
        Json::Array(items) => {
            if let Some(first) = items.first() {
                visit(first, format!("{}[0]", prefix), depth, out);
            }
        }
        _ => {}
    }
}

/// Whether `key` survives being written into a path and parsed back
fn addressable(key: &str, leading: bool) -> bool {
    !key.is_empty()
        && key.trim() == key
        && !key.contains(['.', '[', ']'])
        && !(leading && key.starts_with('$'))
}

fn visit(child: &Json, path: String, depth: usize, out: &mut Vec<PathEntry>) {
    out.push(PathEntry {
        path: path.clone(),
        kind: json_kind(child).to_string(),
        sample: sample_of(child),
        length: child.as_array().map(|a| a.len()),
        depth,
    });
    walk(child, &path, depth + 1, out);
}
