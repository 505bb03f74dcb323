//! Configuration validation.
//!
//! Field-level rules are declared with `validator` derives on the
//! configuration types; this module runs them and adds the cross-field checks (adapter coverage,
//! trigger tables, key charset) that a derive cannot express.

use crate::error::{ConfigError, KeelError, Result};
use std::collections::BTreeMap;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{AdapterConfig, DeployConfig};
use crate::planner::ActionType;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(KeelError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            collect_derive_errors("", &errors, &mut result);
        }
        if !is_valid_name(&config.project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.project.name
                ),
            );
        }

        Self::validate_adapters(&config.adapters, &mut result);
        Self::validate_resources(config, &mut result);
        result
    }

    /// Validates adapter definitions.
    fn validate_adapters(
        adapters: &BTreeMap<String, AdapterConfig>,
        result: &mut ValidationResult,
    ) {
        for (group, adapter) in adapters {
            let prefix = format!("adapters.{group}");

            if !is_valid_key_part(group) {
                result.error(&prefix, format!("Invalid resource group name '{group}'"));
            }
            if !adapter.path.starts_with('/') {
                result.error(
                    format!("{prefix}.path"),
                    format!("Collection path must start with '/': {}", adapter.path),
                );
            }
            if adapter.id_field.is_empty() {
                result.error(format!("{prefix}.id_field"), "ID field cannot be empty");
            }

            for (table, triggers) in [
                ("triggers", &adapter.triggers),
                ("remote_triggers", &adapter.remote_triggers),
            ] {
                for (field, action) in triggers {
                    let path = format!("{prefix}.{table}.{field}");
                    if action.is_structural() {
                        result.error(
                            path,
                            format!(
                                "Action '{action}' is assigned by the engine and cannot be a trigger"
                            ),
                        );
                    } else if *action == ActionType::UpdateWithId && !adapter.update_with_id {
                        result.error(path, "update_with_id triggers require update_with_id: true");
                    }
                }
            }

            if let Some(ready) = &adapter.ready {
                if ready.interval_secs == 0 {
                    result.error(
                        format!("{prefix}.ready.interval_secs"),
                        "Poll interval must be at least 1 second",
                    );
                }
                if ready.timeout_secs < ready.interval_secs {
                    result.warnings.push(format!(
                        "{prefix}.ready: timeout is shorter than the poll interval"
                    ));
                }
            }
        }
    }

    /// Validates resource names and adapter coverage.
    fn validate_resources(config: &DeployConfig, result: &mut ValidationResult) {
        if config.resources.values().all(BTreeMap::is_empty) {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
        }

        for (group, items) in &config.resources {
            if !config.adapters.contains_key(group) {
                result.error(
                    format!("resources.{group}"),
                    format!("No adapter is defined for resource group '{group}'"),
                );
            }
            for (name, value) in items {
                let field = format!("resources.{group}.{name}");
                if !is_valid_key_part(name) {
                    result.error(&field, format!("Invalid resource name '{name}'"));
                }
                if !value.is_object() {
                    result.error(field, "Resource configuration must be a mapping");
                }
            }
        }

        for group in config.adapters.keys() {
            if !config.resources.contains_key(group) {
                debug!("Adapter {group} has no configured resources");
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Flattens nested derive errors into dotted field paths.
fn collect_derive_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in entries {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(
                            || format!("failed '{}' check", error.code),
                            ToString::to_string,
                        );
                    result.error(&path, message);
                }
            }
            ValidationErrorsKind::Struct(inner) => collect_derive_errors(&path, inner, result),
            ValidationErrorsKind::List(items) => {
                for (i, inner) in items {
                    collect_derive_errors(&format!("{path}[{i}]"), inner, result);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }
    !name.ends_with('-') && !name.contains("--")
}

/// Resource groups and names: letters, digits, `_` and `-`. No dots.
fn is_valid_key_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
