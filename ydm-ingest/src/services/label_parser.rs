//! YOLO label parser
//!
//! One annotation per non-empty line:
//!
//! ```text
//! <class_id> <center_x> <center_y> <width> <height>
//! ```
//!
//! Coordinates are normalized to `[0, 1]`. One bad line rejects the whole
//! file; no annotations from it are kept.

use thiserror::Error;
use ydm_common::models::{Annotation, BoundingBox};

use super::config_parser::DatasetConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LabelParseError {
    #[error("{file}:{line}: {reason}")]
    MalformedLine {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("{file}:{line}: {field} = {value} is outside [0, 1]")]
    OutOfRange {
        file: String,
        line: usize,
        field: &'static str,
        value: f64,
    },

    #[error("{file}:{line}: class id {class_id} is not below class count {class_count}")]
    ClassIdOutOfBounds {
        file: String,
        line: usize,
        class_id: u64,
        class_count: usize,
    },
}

impl LabelParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            LabelParseError::MalformedLine { .. } => "malformed_line",
            LabelParseError::OutOfRange { .. } => "out_of_range",
            LabelParseError::ClassIdOutOfBounds { .. } => "class_id_out_of_bounds",
        }
    }

    pub fn file(&self) -> &str {
        match self {
            LabelParseError::MalformedLine { file, .. }
            | LabelParseError::OutOfRange { file, .. }
            | LabelParseError::ClassIdOutOfBounds { file, .. } => file,
        }
    }

    /// 1-based line number
    pub fn line(&self) -> usize {
        match self {
            LabelParseError::MalformedLine { line, .. }
            | LabelParseError::OutOfRange { line, .. }
            | LabelParseError::ClassIdOutOfBounds { line, .. } => *line,
        }
    }
}

const COORDINATE_FIELDS: [&str; 4] = ["center_x", "center_y", "width", "height"];

/// Parse a label file's text against the dataset's classes
pub fn parse_labels(
    file: &str,
    text: &str,
    config: &DatasetConfig,
) -> Result<Vec<Annotation>, LabelParseError> {
    let mut annotations = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let malformed = |reason: String| LabelParseError::MalformedLine {
            file: file.to_string(),
            line,
            reason,
        };

        if tokens.len() != 5 {
            return Err(malformed(format!("expected 5 fields, found {}", tokens.len())));
        }

        let class_id: u64 = tokens[0]
            .parse()
            .map_err(|_| malformed(format!("class id '{}' is not a non-negative integer", tokens[0])))?;
        if class_id >= config.class_count() as u64 {
            return Err(LabelParseError::ClassIdOutOfBounds {
                file: file.to_string(),
                line,
                class_id,
                class_count: config.class_count(),
            });
        }

        let mut coords = [0.0f64; 4];
        for (slot, (token, name)) in coords
            .iter_mut()
            .zip(tokens[1..].iter().zip(COORDINATE_FIELDS))
        {
            *slot = unit_value(file, line, name, token, &malformed)?;
        }

        // class_id < class_count, which fits in u32 for any realistic config
        let class_id = class_id as u32;
        annotations.push(Annotation {
            class_id,
            class_name: config.class_name(class_id).unwrap_or_default().to_string(),
            bbox: BoundingBox {
                center_x: coords[0],
                center_y: coords[1],
                width: coords[2],
                height: coords[3],
            },
        });
    }

    Ok(annotations)
}

fn unit_value(
    file: &str,
    line: usize,
    field: &'static str,
    token: &str,
    malformed: &dyn Fn(String) -> LabelParseError,
) -> Result<f64, LabelParseError> {
    let value: f64 = token
        .parse()
        .map_err(|_| malformed(format!("{} '{}' is not a number", field, token)))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(LabelParseError::OutOfRange {
            file: file.to_string(),
            line,
            field,
            value,
        });
    }
    Ok(value)
}
