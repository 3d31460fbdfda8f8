//! Frontmatter-prefixed text documents: a `---`-delimited header of
//! `key: value` pairs followed by a body. This is a deliberately narrow
//! subset of YAML, not a general parser: scalars, flat arrays of scalars,
//! and two-space-indented nested maps are representable, plus the two
//! synthetic keys `$id` and `$type` every emitted document carries. That
//! is all the sync engine needs and it keeps round-tripping exact.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

const DELIMITER: &str = "---";
const INDENT_WIDTH: usize = 2;

/// Render a record into a frontmatter document: `$id`/`$type` plus `data`'s
/// keys as the header, `content` as the body.
///
/// `data` must be a JSON object. A `serde_json::Value` tree has no
/// backreferences, so it cannot contain a cycle; the emitter does not need a
/// runtime cycle check to satisfy the "refuse on cycles" design note.
pub fn emit(namespace: &str, id: &str, record_type: &str, data: &Value, content: &str) -> Result<String> {
    let map = data
        .as_object()
        .ok_or_else(|| Error::FrontmatterParse("data must be a JSON object".to_string()))?;

    // BTreeMap sorts keys, making output byte-stable across emits of the
    // same logical data (needed for content-hash comparisons downstream).
    // '$' sorts before alphanumerics, so the synthetic keys land first.
    let mut sorted: BTreeMap<String, Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    sorted.insert("$id".to_string(), Value::String(format!("{namespace}/{id}")));
    sorted.insert("$type".to_string(), Value::String(record_type.to_string()));

    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    for (key, value) in &sorted {
        emit_entry(key, value, 0, &mut out)?;
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(content);
    Ok(out)
}

fn emit_entry(key: &str, value: &Value, indent: usize, out: &mut String) -> Result<()> {
    let pad = " ".repeat(indent);
    match value {
        Value::Object(map) => {
            out.push_str(&pad);
            out.push_str(key);
            out.push(':');
            out.push('\n');
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            for (child_key, child_value) in sorted {
                emit_entry(child_key, child_value, indent + INDENT_WIDTH, out)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            out.push_str(&pad);
            out.push_str(key);
            out.push_str(": [");
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(emit_scalar(item)?);
            }
            out.push_str(&parts.join(", "));
            out.push_str("]\n");
            Ok(())
        }
        scalar => {
            out.push_str(&pad);
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&emit_scalar(scalar)?);
            out.push('\n');
            Ok(())
        }
    }
}

fn emit_scalar(value: &Value) -> Result<String> {
    match value {
        Value::String(s) if needs_quoting(s) => Ok(quote_string(s)),
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        other => Err(Error::FrontmatterParse(format!(
            "unsupported frontmatter scalar: {other}"
        ))),
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.starts_with(['"', '\'', '[', '{'])
        || s.contains(':')
        || s.contains('#')
        || s.contains('\n')
        || matches!(s, "true" | "false" | "null")
        || s.parse::<f64>().is_ok()
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn unquote_string(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parsed frontmatter document: `$type` separated out, the remaining header
/// keys as `data`, and the body following the closing delimiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub record_type: String,
    pub data: Value,
    pub content: String,
}

/// Parse a frontmatter document back into its type, data map, and body.
pub fn parse(document: &str) -> Result<ParsedDocument> {
    let lines: Vec<&str> = document.lines().collect();

    let first = lines
        .first()
        .ok_or_else(|| Error::FrontmatterParse("empty document".to_string()))?;
    if first.trim_end() != DELIMITER {
        return Err(Error::FrontmatterParse(
            "document does not start with frontmatter delimiter".to_string(),
        ));
    }

    let close = lines[1..]
        .iter()
        .position(|l| l.trim_end() == DELIMITER)
        .ok_or_else(|| Error::FrontmatterParse("frontmatter header never closed".to_string()))?
        + 1;

    let header_lines = &lines[1..close];
    let mut pos = 0usize;
    let mut map = parse_block(header_lines, &mut pos, 0)?;
    if pos != header_lines.len() {
        return Err(Error::FrontmatterParse(format!(
            "unexpected indentation at line {:?}",
            header_lines[pos]
        )));
    }

    let record_type = match map.remove("$type") {
        Some(Value::String(t)) => t,
        Some(_) => {
            return Err(Error::FrontmatterParse("$type must be a string".to_string()));
        }
        None => {
            return Err(Error::FrontmatterParse("missing $type in frontmatter".to_string()));
        }
    };
    map.remove("$id");

    let body_lines = &lines[(close + 1).min(lines.len())..];
    let content = body_lines.join("\n");

    Ok(ParsedDocument {
        record_type,
        data: Value::Object(map),
        content,
    })
}

/// Recursively parse a run of `key: value` lines at a fixed indentation
/// level. Lines at a shallower indent end the current block (the caller's
/// `pos` is left pointing at the line that ended it); a line indented deeper
/// than expected with no intervening nested-map header is malformed.
fn parse_block(
    lines: &[&str],
    pos: &mut usize,
    indent: usize,
) -> Result<serde_json::Map<String, Value>> {
    let mut map = serde_json::Map::new();

    while *pos < lines.len() {
        let line = lines[*pos];
        if line.trim().is_empty() {
            *pos += 1;
            continue;
        }

        let cur_indent = line.len() - line.trim_start_matches(' ').len();
        if cur_indent < indent {
            break;
        }
        if cur_indent > indent {
            return Err(Error::FrontmatterParse(format!(
                "unexpected indentation at line {line:?}"
            )));
        }

        let content = &line[cur_indent..];
        let (key, rest) = content
            .split_once(':')
            .ok_or_else(|| Error::FrontmatterParse(format!("malformed frontmatter line: {line:?}")))?;
        let key = key.trim().to_string();
        let rest = rest.trim();
        *pos += 1;

        if rest.is_empty() {
            let child = parse_block(lines, pos, indent + INDENT_WIDTH)?;
            map.insert(key, Value::Object(child));
        } else if let Some(array) = parse_array(rest) {
            map.insert(key, array);
        } else {
            map.insert(key, parse_scalar(rest));
        }
    }

    Ok(map)
}

fn parse_array(raw: &str) -> Option<Value> {
    let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Value::Array(vec![]));
    }
    let items = inner.split(", ").map(|s| parse_scalar(s.trim())).collect();
    Some(Value::Array(items))
}

fn parse_scalar(raw: &str) -> Value {
    if raw == "null" {
        return Value::Null;
    }
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2 {
        return Value::String(unquote_string(raw));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
