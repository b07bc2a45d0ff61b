//! The `validate_schema` helper.
//!
//! Schemas are JSON documents resolved through the template file system.
//! Each distinct schema used during a render is recorded once in the
//! conversion's [`SchemaLog`]; a value that does not match fails the render.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jsonschema::Validator;
use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};
use serde_json::Value as JsonValue;

use crate::formats::json::view::JsonNode;
use crate::runtime::helpers::{required_arg, HelperFn};
use crate::template::TemplateFileSystem;
use crate::trace::{SchemaLog, SchemaValidation};

pub const VALIDATE_SCHEMA: &str = "validate_schema";

pub struct SchemaValidator {
    file_system: TemplateFileSystem,
    log: SchemaLog,
    compiled: Mutex<HashMap<String, Arc<Validator>>>,
}

impl SchemaValidator {
    pub fn new(file_system: TemplateFileSystem, log: SchemaLog) -> Self {
        Self {
            file_system,
            log,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    fn validator(&self, name: &str) -> Result<Arc<Validator>, Error> {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(validator) = compiled.get(name) {
            return Ok(validator.clone());
        }

        let template = self.file_system.read(name).ok_or_else(|| {
            Error::new(
                ErrorKind::TemplateNotFound,
                format!("{VALIDATE_SCHEMA}: schema '{name}' was not found"),
            )
        })?;
        let schema: JsonValue = serde_json::from_str(template.source()).map_err(|e| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("{VALIDATE_SCHEMA}: schema '{name}' is not valid JSON: {e}"),
            )
        })?;
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("{VALIDATE_SCHEMA}: schema '{name}' is invalid: {e}"),
            )
        })?;

        let validator = Arc::new(validator);
        compiled.insert(name.to_string(), validator.clone());
        Ok(validator)
    }
}

/// JSON instance for a template value. Strings are always validated as
/// strings, whatever their content.
fn instance_of(value: &Value) -> Result<JsonValue, Error> {
    if let Some(node) = value.downcast_object_ref::<JsonNode>() {
        return Ok(node.to_json());
    }
    if let Some(text) = value.as_str() {
        return Ok(JsonValue::String(text.to_string()));
    }
    serde_json::to_value(value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("{VALIDATE_SCHEMA}: value is not representable as JSON: {e}"),
        )
    })
}

impl HelperFn for SchemaValidator {
    fn call(&self, _state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
        let value = args.first().cloned().unwrap_or(Value::UNDEFINED);
        let schema = required_arg(args, 1, VALIDATE_SCHEMA, "schema")?;

        let validator = self.validator(&schema)?;
        let instance = instance_of(&value)?;
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| e.to_string())
            .collect();
        let valid = errors.is_empty();
        tracing::debug!(schema = %schema, valid, "validated value against schema");

        self.log.record(SchemaValidation {
            schema: schema.clone(),
            valid,
            errors: errors.clone(),
        });
        if !valid {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!(
                    "{VALIDATE_SCHEMA}: value does not match schema '{schema}': {}",
                    errors.join("; ")
                ),
            ));
        }
        Ok(value)
    }
}
