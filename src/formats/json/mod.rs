//! JSON input.
//!
//! The payload is parsed with `serde_json` and exposed to templates as `msg`.
//! JSON conversions honour the configured render deadline and may validate
//! values with `validate_schema`.

use std::sync::Arc;

use minijinja::value::Value;
use serde_json::Value as JsonValue;

use crate::error::ConvertError;
use crate::formats::InputFormat;
use crate::runtime::context::ConversionContext;
use crate::runtime::guard::ExecutionGuard;
use crate::runtime::helpers::HelperRegistry;
use crate::runtime::processor::DataFormat;
use crate::settings::ProcessorSettings;
use crate::template::TemplateProvider;
use crate::trace::TraceInfo;

pub mod schema;
pub mod view;

pub use schema::{SchemaValidator, VALIDATE_SCHEMA};
pub use view::{json_value, JsonNode};

/// Parse a JSON payload. Empty or whitespace-only input is rejected.
pub fn parse_json(raw: &str) -> Result<JsonValue, ConvertError> {
    if raw.trim().is_empty() {
        return Err(ConvertError::parse(InputFormat::Json, "input is empty"));
    }
    serde_json::from_str(raw).map_err(|e| ConvertError::parse(InputFormat::Json, e.to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl DataFormat for JsonFormat {
    type Parsed = JsonValue;

    const FORMAT: InputFormat = InputFormat::Json;
    const DATA_KEY: &'static str = "msg";

    fn parse(&self, raw: &str) -> Result<JsonValue, ConvertError> {
        parse_json(raw)
    }

    fn execution_guard(&self, settings: &ProcessorSettings) -> ExecutionGuard {
        ExecutionGuard::new(settings.timeout(), settings.max_iterations)
    }

    fn data_view(&self, parsed: &Arc<JsonValue>, guard: &Arc<ExecutionGuard>) -> Value {
        json_value(parsed, "", guard)
    }

    fn enrich_context(
        &self,
        ctx: &mut ConversionContext,
        _provider: &dyn TemplateProvider,
        _settings: &ProcessorSettings,
    ) -> Result<(), ConvertError> {
        let validator = SchemaValidator::new(ctx.file_system().clone(), ctx.schema_log().clone());
        let mut helpers = HelperRegistry::new();
        helpers.register(VALIDATE_SCHEMA, validator);
        ctx.register_helpers(&helpers);
        Ok(())
    }

    fn extract_trace(&self, _parsed: &JsonValue, ctx: &ConversionContext, trace: &mut TraceInfo) {
        match trace {
            TraceInfo::Json(info) => info.validate_schemas = ctx.schema_log().entries(),
            TraceInfo::Hl7v2(_) => {
                tracing::debug!("trace is not a JSON trace; leaving it untouched");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_rejects_empty_and_malformed() {
        assert!(matches!(
            parse_json("  "),
            Err(ConvertError::Parse { format: InputFormat::Json, .. })
        ));
        assert!(matches!(
            parse_json("{\"a\": "),
            Err(ConvertError::Parse { format: InputFormat::Json, .. })
        ));
        assert_eq!(parse_json("[1]").unwrap(), serde_json::json!([1]));
    }

    #[test]
    fn test_guard_carries_deadline() {
        let settings = ProcessorSettings::new().with_timeout_ms(50).with_max_iterations(9);
        let guard = JsonFormat.execution_guard(&settings);
        assert_eq!(guard.timeout(), Some(std::time::Duration::from_millis(50)));
        assert_eq!(guard.max_iterations(), 9);
    }
}
