//! Dataset config parser
//!
//! Parses `dataset.yaml` into [`DatasetConfig`]. Two layouts are accepted:
//!
//! ```yaml
//! nc: 3
//! names: [person, car, bicycle]
//! train: images/train
//! ```
//!
//! ```yaml
//! names:
//!   0: person
//!   1: car
//! val: images/val
//! ```
//!
//! Pure function of the document text.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("config is not valid YAML: {0}")]
    Syntax(String),

    #[error("config is missing required field '{field}'")]
    MissingField { field: String },

    #[error("config field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("config declares nc={declared} but lists {names} class names")]
    ClassCountMismatch { declared: u64, names: usize },
}

impl ConfigValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValidationError::Syntax(_) => "syntax",
            ConfigValidationError::MissingField { .. } => "missing_field",
            ConfigValidationError::InvalidField { .. } => "invalid_field",
            ConfigValidationError::ClassCountMismatch { .. } => "class_count_mismatch",
        }
    }

    /// Offending field, if the error names one
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigValidationError::MissingField { field }
            | ConfigValidationError::InvalidField { field, .. } => Some(field),
            ConfigValidationError::ClassCountMismatch { .. } => Some("nc"),
            ConfigValidationError::Syntax(_) => None,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigValidationError {
    ConfigValidationError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Path layout hints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathLayout {
    pub root: Option<String>,
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

/// Validated dataset config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetConfig {
    /// Index is the class id
    class_names: Vec<String>,
    pub paths: PathLayout,
}

impl DatasetConfig {
    pub fn class_count(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn class_name(&self, class_id: u32) -> Option<&str> {
        self.class_names.get(class_id as usize).map(String::as_str)
    }
}

/// Parse and validate a config document
pub fn parse_config(text: &str) -> Result<DatasetConfig, ConfigValidationError> {
    let document: Value =
        serde_yaml::from_str(text).map_err(|e| ConfigValidationError::Syntax(e.to_string()))?;
    let Value::Mapping(root) = document else {
        return Err(ConfigValidationError::Syntax(
            "top level must be a mapping".to_string(),
        ));
    };

    let declared = declared_count(&root)?;
    let class_names = class_names(&root)?;

    if let Some(declared) = declared {
        if declared != class_names.len() as u64 {
            return Err(ConfigValidationError::ClassCountMismatch {
                declared,
                names: class_names.len(),
            });
        }
    }

    let paths = PathLayout {
        root: optional_path(&root, "path")?,
        train: path_list(&root, "train")?,
        val: path_list(&root, "val")?,
        test: path_list(&root, "test")?,
    };
    if paths.train.is_empty() && paths.val.is_empty() {
        return Err(ConfigValidationError::MissingField {
            field: "train".to_string(),
        });
    }

    Ok(DatasetConfig { class_names, paths })
}

fn field<'a>(root: &'a Mapping, name: &str) -> Option<&'a Value> {
    root.get(name).filter(|value| !value.is_null())
}

fn declared_count(root: &Mapping) -> Result<Option<u64>, ConfigValidationError> {
    let Some(value) = field(root, "nc") else {
        return Ok(None);
    };
    match value.as_u64() {
        Some(0) => Err(invalid("nc", "must be a positive integer")),
        Some(n) => Ok(Some(n)),
        None => Err(invalid("nc", "must be a positive integer")),
    }
}

fn class_names(root: &Mapping) -> Result<Vec<String>, ConfigValidationError> {
    let value = field(root, "names").ok_or_else(|| ConfigValidationError::MissingField {
        field: "names".to_string(),
    })?;

    let names = match value {
        Value::Sequence(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| class_name(item, index as u64))
            .collect::<Result<Vec<_>, _>>()?,
        Value::Mapping(entries) => {
            let mut by_id = BTreeMap::new();
            for (key, item) in entries {
                let id = key
                    .as_u64()
                    .or_else(|| key.as_str().and_then(|s| s.trim().parse().ok()))
                    .ok_or_else(|| invalid("names", "class ids must be non-negative integers"))?;
                if by_id.insert(id, class_name(item, id)?).is_some() {
                    return Err(invalid("names", format!("class id {} is listed twice", id)));
                }
            }
            for (expected, id) in by_id.keys().enumerate() {
                if *id != expected as u64 {
                    return Err(invalid(
                        "names",
                        format!("class ids must run 0..{} without gaps", by_id.len()),
                    ));
                }
            }
            by_id.into_values().collect()
        }
        _ => return Err(invalid("names", "must be a list or an id-to-name mapping")),
    };

    if names.is_empty() {
        return Err(invalid("names", "must declare at least one class"));
    }
    Ok(names)
}

fn class_name(value: &Value, id: u64) -> Result<String, ConfigValidationError> {
    let name = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    };
    if name.is_empty() {
        return Err(invalid("names", format!("class {} has an empty name", id)));
    }
    Ok(name)
}

fn check_relative(field_name: &str, path: &str) -> Result<String, ConfigValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(invalid(field_name, "path is empty"));
    }
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || unified.as_bytes().get(1) == Some(&b':') || unified.contains("://") {
        return Err(invalid(field_name, format!("'{}' must be a relative path", trimmed)));
    }
    if unified.split('/').any(|part| part == "..") {
        return Err(invalid(field_name, format!("'{}' must not contain '..'", trimmed)));
    }
    Ok(unified)
}

fn optional_path(root: &Mapping, name: &str) -> Result<Option<String>, ConfigValidationError> {
    match field(root, name) {
        None => Ok(None),
        Some(Value::String(path)) => check_relative(name, path).map(Some),
        Some(_) => Err(invalid(name, "must be a string")),
    }
}

fn path_list(root: &Mapping, name: &str) -> Result<Vec<String>, ConfigValidationError> {
    match field(root, name) {
        None => Ok(Vec::new()),
        Some(Value::String(path)) => Ok(vec![check_relative(name, path)?]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(path) => check_relative(name, path),
                _ => Err(invalid(name, "entries must be strings")),
            })
            .collect(),
        Some(_) => Err(invalid(name, "must be a path or a list of paths")),
    }
}
