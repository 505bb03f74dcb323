//! Field paths into JSON resource state.
//!
//! Paths use dotted field names, positional indices and key selectors:
//! `tasks[0].name`, `tasks[task_key='ingest'].timeout`.

use serde_json::Value;
use std::fmt;

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field.
    Field(String),
    /// Positional array index.
    Index(usize),
    /// Array element selected by the value of one of its fields.
    Key {
        /// Field holding the element key.
        field: String,
        /// Expected key value.
        value: String,
    },
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parses a path, returning `None` when it is malformed.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let mut segments = Vec::new();
        let mut chars = input.chars().peekable();
        let mut field = String::new();
        let mut expect_field = true;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if field.is_empty() {
                        return None;
                    }
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                    expect_field = true;
                }
                '[' => {
                    if !field.is_empty() {
                        segments.push(Segment::Field(std::mem::take(&mut field)));
                    } else if segments.is_empty() {
                        return None;
                    }
                    let mut inner = String::new();
                    let mut quoted = false;
                    loop {
                        let next = chars.next()?;
                        match next {
                            '\'' => quoted = !quoted,
                            ']' if !quoted => break,
                            _ => {}
                        }
                        inner.push(next);
                    }
                    segments.push(parse_selector(&inner)?);
                    expect_field = false;
                    if let Some(&'.') = chars.peek() {
                        chars.next();
                        expect_field = true;
                    }
                }
                _ => field.push(c),
            }
        }

        if field.is_empty() {
            if expect_field {
                return None;
            }
        } else {
            segments.push(Segment::Field(field));
        }

        Some(Self { segments })
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Looks up the value at this path.
    #[must_use]
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => current.as_object()?.get(name)?,
                Segment::Index(i) => current.as_array()?.get(*i)?,
                Segment::Key { field, value } => current
                    .as_array()?
                    .iter()
                    .find(|item| {
                        item.get(field).and_then(key_text).as_deref() == Some(value.as_str())
                    })?,
            };
        }
        Some(current)
    }

    /// Returns the path with every selector replaced by `[*]`.
    #[must_use]
    pub fn pattern(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(name);
                }
                Segment::Index(_) | Segment::Key { .. } => out.push_str("[*]"),
            }
        }
        out
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Field(name) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(name)?;
                }
                Segment::Index(idx) => write!(f, "[{idx}]")?,
                Segment::Key { field, value } => write!(f, "[{field}='{value}']")?,
            }
        }
        Ok(())
    }
}

/// Replaces every bracketed selector in a rendered path with `[*]`.
#[must_use]
pub fn normalize_pattern(path: &str) -> String {
    FieldPath::parse(path).map_or_else(|| path.to_string(), |p| p.pattern())
}

/// Renders a scalar JSON value as a slice key.
#[must_use]
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_selector(inner: &str) -> Option<Segment> {
    if let Ok(idx) = inner.parse::<usize>() {
        return Some(Segment::Index(idx));
    }
    let (field, value) = inner.split_once('=')?;
    let value = value.strip_prefix('\'')?.strip_suffix('\'')?;
    if field.is_empty() {
        return None;
    }
    Some(Segment::Key {
        field: field.to_string(),
        value: value.to_string(),
    })
}
