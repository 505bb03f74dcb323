//! Cross-resource reference placeholders.
//!
//! A reference has the form `${resources.<group>.<name>.<field-path>}` and
//! names a field of another resource in the same deployment.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use crate::error::{ResolveError, Result};
use crate::planner::FieldPath;

// Matches anything that looks like a resource reference; the inner text is
// validated separately so malformed references are reported, not ignored.
#[allow(clippy::expect_used)]
static REFERENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{resources\.([^}]*)\}").expect("reference pattern is valid")
});

/// A parsed resource reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    text: String,
    group: String,
    name: String,
    field: String,
}

impl Reference {
    /// Parses a string that is exactly one reference.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidReference`] if the text is not a
    /// well-formed reference.
    pub fn parse(text: &str) -> Result<Self> {
        let inner = REFERENCE_REGEX
            .captures(text)
            .filter(|c| c.get(0).is_some_and(|m| m.as_str() == text))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str());
        inner
            .and_then(|inner| Self::from_inner(text, inner))
            .ok_or_else(|| {
                ResolveError::InvalidReference {
                    reference: text.to_string(),
                }
                .into()
            })
    }

    fn from_inner(text: &str, inner: &str) -> Option<Self> {
        let mut parts = inner.splitn(3, '.');
        let group = parts.next().filter(|s| is_identifier(s))?;
        let name = parts.next().filter(|s| is_identifier(s))?;
        let field = parts.next()?;
        FieldPath::parse(field)?;
        Some(Self {
            text: text.to_string(),
            group: group.to_string(),
            name: name.to_string(),
            field: field.to_string(),
        })
    }

    /// Returns the full reference text, e.g. `${resources.jobs.foo.id}`.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the resource group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the referenced field path.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns the key of the referenced resource.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Collects every distinct reference in a value, in text order.
///
/// # Errors
///
/// Returns an error if any reference is malformed.
pub fn find_references(value: &Value) -> Result<Vec<Reference>> {
    let mut found = BTreeSet::new();
    collect(value, &mut found)?;
    Ok(found.into_iter().collect())
}

fn collect(value: &Value, found: &mut BTreeSet<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            for m in REFERENCE_REGEX.find_iter(s) {
                found.insert(Reference::parse(m.as_str())?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Returns true if any string in the value still contains a reference.
#[must_use]
pub fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => REFERENCE_REGEX.is_match(s),
        Value::Array(items) => items.iter().any(contains_reference),
        Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

/// Replaces resolved references in a value.
///
/// A string that is exactly one resolved reference becomes the resolved
/// value with its own type. References embedded in a longer string are
/// replaced by the text of the value. References missing from `resolved`
/// are left in place.
///
/// # Errors
///
/// Returns [`ResolveError::NotEmbeddable`] when an object or array would
/// have to be embedded in a string.
pub fn substitute(value: &Value, resolved: &BTreeMap<String, Value>) -> Result<Value> {
    Ok(match value {
        Value::String(s) => substitute_str(s, resolved)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, resolved))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, resolved)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

fn substitute_str(s: &str, resolved: &BTreeMap<String, Value>) -> Result<Value> {
    if let Some(value) = resolved.get(s) {
        return Ok(value.clone());
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for m in REFERENCE_REGEX.find_iter(s) {
        let Some(value) = resolved.get(m.as_str()) else {
            continue;
        };
        out.push_str(&s[last..m.start()]);
        match value {
            Value::String(text) => out.push_str(text),
            Value::Array(_) | Value::Object(_) => {
                return Err(ResolveError::NotEmbeddable {
                    reference: m.as_str().to_string(),
                }
                .into());
            }
            scalar => out.push_str(&scalar.to_string()),
        }
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelError;
    use serde_json::json;

    #[test]
    fn test_parse() {
        let r = Reference::parse("${resources.jobs.foo.tasks[0].name}").unwrap();
        assert_eq!(r.group(), "jobs");
        assert_eq!(r.name(), "foo");
        assert_eq!(r.field(), "tasks[0].name");
        assert_eq!(r.target(), "jobs.foo");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in [
            "${resources.jobs}",
            "${resources.jobs.foo}",
            "${resources.jobs..id}",
            "${resources.jobs.foo.}",
            "prefix ${resources.jobs.foo.id}",
            "${vars.x}",
        ] {
            let err = Reference::parse(text).unwrap_err();
            assert!(
                matches!(err, KeelError::Resolve(ResolveError::InvalidReference { .. })),
                "{text}"
            );
        }
    }

    #[test]
    fn test_find_references() {
        let value = json!({
            "name": "x",
            "upstream": "${resources.jobs.b.id}",
            "tasks": [{"notebook": "/Users/${resources.pipelines.p.name}/run"}],
            "again": "${resources.jobs.b.id}",
        });
        let found = find_references(&value).unwrap();
        let texts: Vec<_> = found.iter().map(Reference::text).collect();
        assert_eq!(
            texts,
            vec!["${resources.jobs.b.id}", "${resources.pipelines.p.name}"]
        );
        assert!(contains_reference(&value));
        assert!(!contains_reference(&json!({"a": [1, "b"]})));
    }

    #[test]
    fn test_find_references_rejects_malformed() {
        let err = find_references(&json!({"a": "${resources.jobs}"})).unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::InvalidReference { .. })));
    }

    #[test]
    fn test_substitute_pure_reference_keeps_type() {
        let resolved = BTreeMap::from([
            (String::from("${resources.jobs.a.id}"), json!(42)),
            (String::from("${resources.jobs.a.tags}"), json!(["x"])),
        ]);
        let value = json!({"job_id": "${resources.jobs.a.id}", "tags": "${resources.jobs.a.tags}"});
        assert_eq!(
            substitute(&value, &resolved).unwrap(),
            json!({"job_id": 42, "tags": ["x"]})
        );
    }

    #[test]
    fn test_substitute_embedded() {
        let resolved = BTreeMap::from([
            (String::from("${resources.jobs.a.id}"), json!(42)),
            (String::from("${resources.jobs.a.name}"), json!("nightly")),
        ]);
        let value = json!("job ${resources.jobs.a.name} (#${resources.jobs.a.id}) ${resources.jobs.b.id}");
        assert_eq!(
            substitute(&value, &resolved).unwrap(),
            json!("job nightly (#42) ${resources.jobs.b.id}")
        );
    }

    #[test]
    fn test_substitute_rejects_embedded_object() {
        let resolved =
            BTreeMap::from([(String::from("${resources.jobs.a.spec}"), json!({"k": 1}))]);
        let err = substitute(&json!("spec: ${resources.jobs.a.spec}"), &resolved).unwrap_err();
        assert!(matches!(err, KeelError::Resolve(ResolveError::NotEmbeddable { .. })));
    }
}
