//! HL7v2 input.
//!
//! Messages are parsed into [`Hl7v2Data`] and exposed to templates as
//! `hl7v2Data`. Segment reads are tracked so the trace can report the
//! segments no template used.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::Value;
use serde::Deserialize;

use crate::error::ConvertError;
use crate::formats::InputFormat;
use crate::runtime::context::ConversionContext;
use crate::runtime::guard::ExecutionGuard;
use crate::runtime::processor::DataFormat;
use crate::settings::ProcessorSettings;
use crate::template::TemplateProvider;
use crate::trace::{TraceInfo, UnusedSegment};

pub mod helpers;
pub mod message;
pub mod view;

pub use helpers::CODE_MAPPING_KEY;
pub use message::{Encoding, Field, Hl7v2Data, Repetition, Segment};
pub use view::MessageView;

/// Template holding the code-system mapping table.
pub const CODE_SYSTEM_TEMPLATE: &str = "CodeSystem/CodeSystem";

/// system → code → property → value.
pub type CodeSystemMapping = BTreeMap<String, BTreeMap<String, BTreeMap<String, Option<String>>>>;

#[derive(Deserialize)]
#[serde(untagged)]
enum MappingDocument {
    Wrapped { mapping: CodeSystemMapping },
    Bare(CodeSystemMapping),
}

/// Parse a code-system mapping table. The table may be the whole document or
/// sit under a top-level `mapping` key.
pub fn parse_code_system_mapping(source: &str) -> Result<CodeSystemMapping, ConvertError> {
    let document: MappingDocument = serde_json::from_str(source).map_err(|e| {
        ConvertError::Context(format!(
            "code system mapping '{CODE_SYSTEM_TEMPLATE}' is malformed: {e}"
        ))
    })?;
    Ok(match document {
        MappingDocument::Wrapped { mapping } => mapping,
        MappingDocument::Bare(mapping) => mapping,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Hl7v2Format;

impl DataFormat for Hl7v2Format {
    type Parsed = Hl7v2Data;

    const FORMAT: InputFormat = InputFormat::Hl7v2;
    const DATA_KEY: &'static str = "hl7v2Data";

    fn parse(&self, raw: &str) -> Result<Hl7v2Data, ConvertError> {
        Hl7v2Data::parse(raw)
    }

    fn data_view(&self, parsed: &Arc<Hl7v2Data>, guard: &Arc<ExecutionGuard>) -> Value {
        Value::from_object(MessageView::new(parsed.clone(), guard.clone()))
    }

    fn enrich_context(
        &self,
        ctx: &mut ConversionContext,
        provider: &dyn TemplateProvider,
        _settings: &ProcessorSettings,
    ) -> Result<(), ConvertError> {
        match provider.get_template(CODE_SYSTEM_TEMPLATE) {
            Some(template) => {
                let mapping = parse_code_system_mapping(template.source())?;
                if mapping.is_empty() {
                    tracing::warn!(
                        template = CODE_SYSTEM_TEMPLATE,
                        "code system mapping is empty; skipping"
                    );
                } else {
                    tracing::debug!(systems = mapping.len(), "loaded code system mapping");
                    ctx.insert(CODE_MAPPING_KEY, Value::from_serialize(&mapping));
                }
            }
            None => tracing::debug!("no code system mapping template"),
        }
        ctx.register_helpers(&helpers::registry());
        Ok(())
    }

    fn extract_trace(&self, parsed: &Hl7v2Data, _ctx: &ConversionContext, trace: &mut TraceInfo) {
        match trace {
            TraceInfo::Hl7v2(info) => {
                info.unused_segments = parsed
                    .unused_segments()
                    .map(|segment| UnusedSegment {
                        segment_type: segment.id().to_string(),
                        line: segment.line(),
                    })
                    .collect();
            }
            TraceInfo::Json(_) => {
                tracing::debug!("trace is not an HL7v2 trace; leaving it untouched");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_accepts_wrapped_and_bare_tables() {
        let wrapped = r#"{"mapping": {"CodeSystem/Gender": {"F": {"code": "female"}}}}"#;
        let bare = r#"{"CodeSystem/Gender": {"F": {"code": "female"}}}"#;
        assert_eq!(
            parse_code_system_mapping(wrapped).unwrap(),
            parse_code_system_mapping(bare).unwrap()
        );
    }

    #[test]
    fn test_mapping_allows_null_properties() {
        let mapping =
            parse_code_system_mapping(r#"{"S": {"__default__": {"code": null}}}"#).unwrap();
        assert_eq!(mapping["S"]["__default__"]["code"], None);
    }

    #[test]
    fn test_malformed_mapping_is_context_error() {
        assert!(matches!(
            parse_code_system_mapping("[1, 2]"),
            Err(ConvertError::Context(_))
        ));
        assert!(matches!(
            parse_code_system_mapping("{\"S\": 3}"),
            Err(ConvertError::Context(_))
        ));
    }
}
