//! Diagnostics collected during a conversion.
//!
//! The caller creates a [`TraceInfo`] for the format it converts and passes
//! it by `&mut`; the processor fills it in after rendering. A trace of the
//! wrong variant is left untouched.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::formats::InputFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum TraceInfo {
    Hl7v2(Hl7v2TraceInfo),
    Json(JsonTraceInfo),
}

impl TraceInfo {
    pub fn hl7v2() -> Self {
        TraceInfo::Hl7v2(Hl7v2TraceInfo::default())
    }

    pub fn json() -> Self {
        TraceInfo::Json(JsonTraceInfo::default())
    }

    /// Empty trace of the variant matching `format`.
    pub fn for_format(format: InputFormat) -> Self {
        match format {
            InputFormat::Hl7v2 => Self::hl7v2(),
            InputFormat::Json => Self::json(),
        }
    }

    pub fn format(&self) -> InputFormat {
        match self {
            TraceInfo::Hl7v2(_) => InputFormat::Hl7v2,
            TraceInfo::Json(_) => InputFormat::Json,
        }
    }

    pub fn as_hl7v2(&self) -> Option<&Hl7v2TraceInfo> {
        match self {
            TraceInfo::Hl7v2(info) => Some(info),
            TraceInfo::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonTraceInfo> {
        match self {
            TraceInfo::Json(info) => Some(info),
            TraceInfo::Hl7v2(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hl7v2TraceInfo {
    /// Segments the templates never read, in message order.
    pub unused_segments: Vec<UnusedSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnusedSegment {
    #[serde(rename = "type")]
    pub segment_type: String,
    /// 0-based position of the segment in the message.
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonTraceInfo {
    /// One entry per distinct schema evaluated during rendering.
    pub validate_schemas: Vec<SchemaValidation>,
}

/// Outcome of validating template output against one schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaValidation {
    pub schema: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Per-conversion log of schema validations, shared with the helper that
/// performs them.
#[derive(Debug, Clone, Default)]
pub struct SchemaLog {
    entries: Arc<Mutex<Vec<SchemaValidation>>>,
}

impl SchemaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outcome. A schema already in the log keeps its entry unless
    /// the new outcome is a failure and the recorded one is not.
    pub fn record(&self, outcome: SchemaValidation) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|e| e.schema == outcome.schema) {
            Some(existing) if existing.valid && !outcome.valid => *existing = outcome,
            Some(_) => {}
            None => entries.push(outcome),
        }
    }

    pub fn entries(&self) -> Vec<SchemaValidation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First failed validation, if any.
    pub fn failure(&self) -> Option<SchemaValidation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| !e.valid)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
