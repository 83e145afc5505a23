//! Task schema normalizer.
//!
//! Task descriptor documents arrive in two field-naming dialects for the
//! same semantics: the canonical one (`input_file` / `output_directory` /
//! `segmentation_type` / `segmentation_prompts` / `label_prompt`) and an
//! older one (`input` / `output` / `mode` / `point_coordinates` + `label`).
//! Both fold into one canonical [`Task`] through the alias tables below
//! before any scheduling logic sees them.
//!
//! Validation short-circuits on the first failing rule, in order: input
//! file, mode, point prompts, organ list. The normalizer reads the
//! document and probes the input file for readability; it never mutates
//! the filesystem.

use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::Clock;
use crate::domain::{LabelRef, PointPrompt, SegMode, Task, TaskId, Voxel};

type Obj = Map<String, Value>;

/// Field-alias tables, canonical name first.
const INPUT_FIELDS: &[&str] = &["input_file", "input"];
const OUTPUT_FIELDS: &[&str] = &["output_directory", "output"];
const MODE_FIELDS: &[&str] = &["segmentation_type", "mode"];
const POINT_SHORTHAND_FIELDS: &[&str] = &["point_coordinates", "point_coordinate"];
const ORGAN_FIELDS: &[&str] = &["label_prompt", "labels"];
const PROMPT_LABEL_FIELDS: &[&str] = &["target_output_label", "label"];

/// Why a document was rejected; names the first missing/invalid field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task document is malformed: {0}")]
    Malformed(String),

    #[error("input file missing or unreadable: {0}")]
    MissingInput(String),

    #[error("unrecognized segmentation mode: {0}")]
    UnknownMode(String),

    #[error("bad point prompt: {0}")]
    BadPrompt(String),

    #[error("organ list is empty or has no resolvable label")]
    EmptyOrganList,
}

/// Normalize a raw task descriptor into a canonical [`Task`].
pub fn normalize(raw: &[u8], clock: &dyn Clock) -> Result<Task, ValidationError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    normalize_value(&value, clock)
}

/// Normalize an already-parsed document.
pub fn normalize_value(doc: &Value, clock: &dyn Clock) -> Result<Task, ValidationError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("top level is not an object".to_string()))?;

    // Rule 1: the input scan must exist and be readable.
    let input = field(obj, INPUT_FIELDS)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingInput("no input file field".to_string()))?;
    let input_path = PathBuf::from(input);
    if std::fs::File::open(&input_path).is_err() {
        return Err(ValidationError::MissingInput(format!(
            "{input} does not exist or cannot be opened"
        )));
    }

    // Rule 2: mode, explicit or inferred from document shape.
    let mode_value = field(obj, MODE_FIELDS);
    let mode = match mode_value {
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "full" | "all" => SegMode::Full,
            "point" => SegMode::Point,
            "specific" => SegMode::OrganList,
            _ => return Err(ValidationError::UnknownMode(s.clone())),
        },
        // Alternate dialect: a list-valued mode IS the organ list.
        Some(Value::Array(_)) => SegMode::OrganList,
        Some(other) => {
            return Err(ValidationError::UnknownMode(other.to_string()));
        }
        None => infer_mode(obj),
    };

    // Rule 3: point mode needs well-formed prompts.
    let prompts = if mode == SegMode::Point {
        parse_prompts(obj)?
    } else {
        Vec::new()
    };

    // Rule 4: organ-list mode needs at least one resolvable label.
    let organ_labels = if mode == SegMode::OrganList {
        let source = field(obj, ORGAN_FIELDS)
            .or(mode_value)
            .ok_or(ValidationError::EmptyOrganList)?;
        let list = source.as_array().ok_or(ValidationError::EmptyOrganList)?;
        let labels: Vec<LabelRef> = list.iter().filter_map(parse_label).collect();
        if labels.is_empty() {
            return Err(ValidationError::EmptyOrganList);
        }
        labels
    } else {
        Vec::new()
    };

    let output = field(obj, OUTPUT_FIELDS)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::Malformed("missing output directory field".to_string()))?;

    let task_id = match obj.get("task_id") {
        Some(Value::String(s)) if !s.is_empty() => TaskId::new(s.clone()),
        Some(Value::Number(n)) => TaskId::new(n.to_string()),
        _ => TaskId::generate(clock),
    };

    Ok(Task {
        task_id,
        input_path,
        output_directory: PathBuf::from(output),
        mode,
        prompts,
        organ_labels,
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        attempt_count: obj.get("attempt_count").and_then(Value::as_u64).unwrap_or(0) as u32,
    })
}

fn field<'a>(obj: &'a Obj, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|key| obj.get(*key))
}

/// Historical default is full segmentation; point data or a label list in
/// the document overrides it.
fn infer_mode(obj: &Obj) -> SegMode {
    if obj.contains_key("segmentation_prompts") || field(obj, POINT_SHORTHAND_FIELDS).is_some() {
        SegMode::Point
    } else if field(obj, ORGAN_FIELDS).is_some() {
        SegMode::OrganList
    } else {
        SegMode::Full
    }
}

fn parse_prompts(obj: &Obj) -> Result<Vec<PointPrompt>, ValidationError> {
    if let Some(value) = obj.get("segmentation_prompts") {
        let list = value.as_array().ok_or_else(|| {
            ValidationError::BadPrompt("segmentation_prompts must be a list".to_string())
        })?;
        if list.is_empty() {
            return Err(ValidationError::BadPrompt(
                "segmentation_prompts must not be empty".to_string(),
            ));
        }
        return list
            .iter()
            .enumerate()
            .map(|(i, spec)| parse_prompt_spec(i, spec))
            .collect();
    }

    if let Some(points) = field(obj, POINT_SHORTHAND_FIELDS) {
        // Single-prompt shorthand: point_coordinates + label.
        let positive_points = parse_voxels(points)
            .map_err(|m| ValidationError::BadPrompt(format!("point_coordinates: {m}")))?;
        let label = obj
            .get("label")
            .ok_or_else(|| {
                ValidationError::BadPrompt(
                    "label is required alongside point_coordinates".to_string(),
                )
            })
            .and_then(|v| {
                parse_label(v).ok_or_else(|| {
                    ValidationError::BadPrompt(format!("unresolvable label: {v}"))
                })
            })?;
        return Ok(vec![PointPrompt {
            label,
            positive_points,
            negative_points: Vec::new(),
        }]);
    }

    Err(ValidationError::BadPrompt(
        "point mode requires segmentation_prompts or point_coordinates".to_string(),
    ))
}

fn parse_prompt_spec(index: usize, spec: &Value) -> Result<PointPrompt, ValidationError> {
    let obj = spec.as_object().ok_or_else(|| {
        ValidationError::BadPrompt(format!("prompt {index} must be an object"))
    })?;

    let label = field(obj, PROMPT_LABEL_FIELDS)
        .ok_or_else(|| {
            ValidationError::BadPrompt(format!("prompt {index}: missing target_output_label"))
        })
        .and_then(|v| {
            parse_label(v).ok_or_else(|| {
                ValidationError::BadPrompt(format!("prompt {index}: unresolvable label {v}"))
            })
        })?;

    let positive_points = match obj.get("positive_points") {
        None => Vec::new(),
        Some(v) => parse_point_list(v)
            .map_err(|m| ValidationError::BadPrompt(format!("prompt {index}: {m}")))?,
    };
    let negative_points = match obj.get("negative_points") {
        None => Vec::new(),
        Some(v) => parse_point_list(v)
            .map_err(|m| ValidationError::BadPrompt(format!("prompt {index}: {m}")))?,
    };

    let prompt = PointPrompt {
        label,
        positive_points,
        negative_points,
    };
    if prompt.point_count() == 0 {
        return Err(ValidationError::BadPrompt(format!(
            "prompt {index}: at least one positive or negative point is required"
        )));
    }
    Ok(prompt)
}

fn parse_label(value: &Value) -> Option<LabelRef> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()).map(LabelRef::Id),
        Value::String(s) if !s.trim().is_empty() => Some(LabelRef::Name(s.trim().to_string())),
        _ => None,
    }
}

/// Accepts a bare `[x, y, z]` triple or a list of triples.
fn parse_voxels(value: &Value) -> Result<Vec<Voxel>, String> {
    let list = value.as_array().ok_or("expected a coordinate list")?;
    if list.iter().all(Value::is_number) {
        return Ok(vec![parse_voxel(value)?]);
    }
    list.iter().map(parse_voxel).collect()
}

fn parse_point_list(value: &Value) -> Result<Vec<Voxel>, String> {
    value
        .as_array()
        .ok_or("points must be a list")?
        .iter()
        .map(parse_voxel)
        .collect()
}

fn parse_voxel(value: &Value) -> Result<Voxel, String> {
    let triple = value.as_array().ok_or("each point must be a list of 3 integers")?;
    if triple.len() != 3 {
        return Err(format!("each point must have 3 coordinates, got {}", triple.len()));
    }
    let mut voxel = [0i64; 3];
    for (slot, coord) in voxel.iter_mut().zip(triple) {
        *slot = as_integer(coord).ok_or_else(|| format!("coordinate {coord} is not an integer"))?;
    }
    Ok(voxel)
}

/// Voxel coordinates are integers; tolerate the float spelling (`175.0`)
/// that older task creators emitted.
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 { Some(f as i64) } else { None }
}
