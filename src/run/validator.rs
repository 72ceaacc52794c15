//! Run Request Validation
//!
//! Checks a raw submission before any workspace is allocated:
//! - `workflow_params`, `workflow_type`, `workflow_type_version` and
//!   `workflow_url` are required
//! - the three `workflow_*` descriptors must be strings
//! - `workflow_params`, `tags` and `workflow_engine_parameters` must be objects
//!
//! Form-encoded submissions deliver every field as a string, so string
//! values holding JSON objects are decoded first.

use log::{debug, error};
use serde_json::Value;

use super::model::{JsonMap, RunRequest};
use crate::error::WesError;

const REQUIRED_FIELDS: &[&str] = &[
    "workflow_params",
    "workflow_type",
    "workflow_type_version",
    "workflow_url",
];

const STRING_FIELDS: &[&str] = &["workflow_type", "workflow_type_version", "workflow_url"];

const OBJECT_FIELDS: &[&str] = &["workflow_params", "workflow_engine_parameters", "tags"];

/// Validation error types for user-facing messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NotAnObject,
    MissingField(&'static str),
    NotAString(&'static str),
    NotAnObjectField(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "Request body is not a JSON object"),
            Self::MissingField(field) => {
                write!(f, "Required parameter '{}' not in request body", field)
            }
            Self::NotAString(field) => write!(f, "Parameter '{}' is not of string type", field),
            Self::NotAnObjectField(field) => write!(
                f,
                "Parameter '{}' is not of dictionary type. Invalid JSON?",
                field
            ),
        }
    }
}

/// Decodes string fields that carry JSON objects.
fn decode_nested(mut body: JsonMap) -> JsonMap {
    for field in OBJECT_FIELDS {
        if let Some(Value::String(raw)) = body.get(*field) {
            if let Ok(decoded @ Value::Object(_)) = serde_json::from_str::<Value>(raw) {
                debug!("Decoded JSON string in field '{}'", field);
                body.insert(field.to_string(), decoded);
            }
        }
    }
    body
}

/// Collects every problem with a request body.
pub fn check_request(body: &JsonMap) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for field in REQUIRED_FIELDS {
        if !body.contains_key(*field) {
            errors.push(ValidationError::MissingField(field));
        }
    }

    for field in STRING_FIELDS {
        if let Some(value) = body.get(*field) {
            if !value.is_string() {
                errors.push(ValidationError::NotAString(field));
            }
        }
    }

    for field in OBJECT_FIELDS {
        if let Some(value) = body.get(*field) {
            if !value.is_object() {
                errors.push(ValidationError::NotAnObjectField(field));
            }
        }
    }

    errors
}

/// Validates a raw submission and converts it into a [`RunRequest`].
///
/// All problems are logged; the returned error names them all.
pub fn validate_request(body: Value) -> Result<RunRequest, WesError> {
    let Value::Object(body) = body else {
        error!("{}", ValidationError::NotAnObject);
        return Err(WesError::InvalidRequest(ValidationError::NotAnObject.to_string()));
    };

    let body = decode_nested(body);
    let errors = check_request(&body);

    if !errors.is_empty() {
        for err in &errors {
            error!("{}", err);
        }
        error!("POST request does not conform to schema");

        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(WesError::InvalidRequest(message));
    }

    serde_json::from_value(Value::Object(body))
        .map_err(|e| WesError::InvalidRequest(e.to_string()))
}
