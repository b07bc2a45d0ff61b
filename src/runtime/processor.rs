//! The conversion pipeline.
//!
//! [`Processor`] drives every conversion through the same steps: resolve the
//! root template, parse the input, build a [`ConversionContext`], render, then
//! fill in the caller's trace. What differs between input formats lives behind
//! the [`DataFormat`] trait.

use std::fmt;
use std::sync::Arc;

use minijinja::value::Value;

use crate::error::ConvertError;
use crate::formats::hl7v2::Hl7v2Format;
use crate::formats::json::JsonFormat;
use crate::formats::InputFormat;
use crate::runtime::context::ConversionContext;
use crate::runtime::guard::ExecutionGuard;
use crate::runtime::helpers::{HelperFn, HelperRegistry};
use crate::settings::ProcessorSettings;
use crate::telemetry::{
    track_duration, NoopTelemetry, TelemetrySink, INPUT_DESERIALIZATION_DURATION,
    TEMPLATE_RENDER_DURATION,
};
use crate::template::{Template, TemplateProvider};
use crate::trace::TraceInfo;

/// Format-specific steps of the pipeline.
pub trait DataFormat: Send + Sync {
    /// The parsed form of one input.
    type Parsed: Send + Sync + 'static;

    const FORMAT: InputFormat;

    /// Variable name the parsed data is bound to in templates.
    const DATA_KEY: &'static str;

    fn parse(&self, raw: &str) -> Result<Self::Parsed, ConvertError>;

    /// Limits for one conversion. Only the iteration cap applies by default.
    fn execution_guard(&self, settings: &ProcessorSettings) -> ExecutionGuard {
        ExecutionGuard::new(None, settings.max_iterations)
    }

    /// The value templates see under [`DATA_KEY`](Self::DATA_KEY).
    fn data_view(&self, parsed: &Arc<Self::Parsed>, guard: &Arc<ExecutionGuard>) -> Value;

    /// Add format-specific variables and helpers.
    fn enrich_context(
        &self,
        ctx: &mut ConversionContext,
        provider: &dyn TemplateProvider,
        settings: &ProcessorSettings,
    ) -> Result<(), ConvertError>;

    /// Fill in `trace` after rendering. A trace of another format is left as is.
    fn extract_trace(&self, parsed: &Self::Parsed, ctx: &ConversionContext, trace: &mut TraceInfo);
}

/// Converts inputs of one format by rendering them through templates.
///
/// Processors hold no per-conversion state and can be shared across threads.
pub struct Processor<F: DataFormat> {
    format: F,
    settings: ProcessorSettings,
    telemetry: Arc<dyn TelemetrySink>,
    helpers: HelperRegistry,
}

pub type Hl7v2Processor = Processor<Hl7v2Format>;
pub type JsonProcessor = Processor<JsonFormat>;

impl<F: DataFormat + Default> Processor<F> {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self::with_format(F::default(), settings)
    }
}

impl<F: DataFormat + Default> Default for Processor<F> {
    fn default() -> Self {
        Self::new(ProcessorSettings::default())
    }
}

impl<F: DataFormat> Processor<F> {
    pub fn with_format(format: F, settings: ProcessorSettings) -> Self {
        Self {
            format,
            settings,
            telemetry: Arc::new(NoopTelemetry),
            helpers: HelperRegistry::new(),
        }
    }

    /// Send phase durations to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Register a helper installed into every conversion after the built-in
    /// ones, replacing a built-in of the same name.
    pub fn register_helper(&mut self, name: impl Into<String>, helper: impl HelperFn + 'static) {
        self.helpers.register(name, helper);
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn format(&self) -> InputFormat {
        F::FORMAT
    }

    /// Convert `raw` by rendering the template `root_template`.
    ///
    /// # Arguments
    /// * `raw` - Input text in this processor's format
    /// * `root_template` - Name of the template to render
    /// * `provider` - Source of the root template, includes and lookup tables
    /// * `trace` - Filled in with diagnostics when the conversion succeeds
    ///
    /// # Example
    /// ```
    /// use fhir_converter::{Hl7v2Processor, MemoryTemplateProvider, ProcessorSettings, TraceInfo};
    ///
    /// let provider = MemoryTemplateProvider::new()
    ///     .with_template("ADT_A01", "{{ hl7v2Data.PID[5][1] }}");
    /// let processor = Hl7v2Processor::new(ProcessorSettings::default());
    /// let mut trace = TraceInfo::hl7v2();
    ///
    /// let out = processor
    ///     .convert("MSH|^~\\&|A\rPID|1||42||Doe^Jane", "ADT_A01", &provider, Some(&mut trace))
    ///     .unwrap();
    /// assert_eq!(out, "Doe");
    /// assert_eq!(trace.as_hl7v2().unwrap().unused_segments.len(), 1);
    /// ```
    pub fn convert(
        &self,
        raw: &str,
        root_template: &str,
        provider: &dyn TemplateProvider,
        trace: Option<&mut TraceInfo>,
    ) -> Result<String, ConvertError> {
        let template = self.resolve(root_template, provider)?;
        let parsed = {
            let _timer = track_duration(self.telemetry.as_ref(), INPUT_DESERIALIZATION_DURATION);
            self.format.parse(raw)?
        };
        tracing::debug!(format = %F::FORMAT, template = root_template, "parsed input");
        self.render_parsed(&template, Arc::new(parsed), provider, trace)
    }

    fn resolve(
        &self,
        name: &str,
        provider: &dyn TemplateProvider,
    ) -> Result<Template, ConvertError> {
        provider
            .get_template(name)
            .ok_or_else(|| ConvertError::TemplateResolution(name.to_string()))
    }

    /// Build the context for `parsed`, render `template` and fill in the trace.
    fn render_parsed(
        &self,
        template: &Template,
        parsed: Arc<F::Parsed>,
        provider: &dyn TemplateProvider,
        trace: Option<&mut TraceInfo>,
    ) -> Result<String, ConvertError> {
        let guard = Arc::new(self.format.execution_guard(&self.settings));
        let mut ctx = ConversionContext::new(provider, guard.clone());
        ctx.insert(F::DATA_KEY, self.format.data_view(&parsed, &guard));
        ctx.register_helpers(&HelperRegistry::common());
        self.format.enrich_context(&mut ctx, provider, &self.settings)?;
        ctx.register_helpers(&self.helpers);

        let rendered = {
            let _timer = track_duration(self.telemetry.as_ref(), TEMPLATE_RENDER_DURATION);
            ctx.add_template(template.name(), template.source())
                .and_then(|()| ctx.render(template.name()))
        };
        let output = rendered.map_err(|cause| {
            tracing::debug!(template = template.name(), error = %cause, "render failed");
            ConvertError::Render {
                template: template.name().to_string(),
                cause,
            }
        })?;

        if let Some(trace) = trace {
            self.format.extract_trace(&parsed, &ctx, trace);
        }
        tracing::debug!(
            template = template.name(),
            iterations = guard.iterations(),
            "rendered template"
        );
        Ok(output)
    }
}

impl JsonProcessor {
    /// Convert an already parsed JSON document. Produces the same output as
    /// [`convert`](Processor::convert) on the document's text.
    pub fn convert_value(
        &self,
        value: &serde_json::Value,
        root_template: &str,
        provider: &dyn TemplateProvider,
        trace: Option<&mut TraceInfo>,
    ) -> Result<String, ConvertError> {
        let template = self.resolve(root_template, provider)?;
        self.render_parsed(&template, Arc::new(value.clone()), provider, trace)
    }
}

impl<F: DataFormat> fmt::Debug for Processor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("format", &F::FORMAT)
            .field("settings", &self.settings)
            .field("helpers", &self.helpers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::telemetry::RecordingTelemetry;
    use crate::template::MemoryTemplateProvider;
    use minijinja::State;

    const ADT: &str = "MSH|^~\\&|SRC|FAC\rPID|1||123||Doe^Jane";

    #[test]
    fn test_missing_root_fails_before_parsing() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let processor = Hl7v2Processor::default().with_telemetry(telemetry.clone());
        let err = processor
            .convert("not hl7", "Missing", &MemoryTemplateProvider::new(), None)
            .unwrap_err();
        assert!(matches!(err, ConvertError::TemplateResolution(name) if name == "Missing"));
        assert!(telemetry.records().is_empty());
    }

    #[test]
    fn test_parse_failure_records_deserialization_only() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let processor = Hl7v2Processor::default().with_telemetry(telemetry.clone());
        let provider = MemoryTemplateProvider::new().with_template("Root", "x");
        let err = processor.convert("PID|1", "Root", &provider, None).unwrap_err();
        assert_eq!(err.phase(), "parse");
        assert_eq!(telemetry.metrics(), vec![INPUT_DESERIALIZATION_DURATION]);
    }

    #[test]
    fn test_success_records_both_phases() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let processor = Hl7v2Processor::default().with_telemetry(telemetry.clone());
        let provider =
            MemoryTemplateProvider::new().with_template("Root", "{{ hl7v2Data.PID[3] }}");
        assert_eq!(processor.convert(ADT, "Root", &provider, None).unwrap(), "123");
        assert_eq!(
            telemetry.metrics(),
            vec![INPUT_DESERIALIZATION_DURATION, TEMPLATE_RENDER_DURATION]
        );
    }

    #[test]
    fn test_custom_helper_overrides_builtin() {
        let mut processor = Hl7v2Processor::default();
        processor.register_helper("generate_uuid", |_: &State, _: &[Value]| {
            Ok(Value::from("fixed"))
        });
        let provider = MemoryTemplateProvider::new()
            .with_template("Root", "{{ hl7v2Data.PID[3] | generate_uuid }}");
        assert_eq!(processor.convert(ADT, "Root", &provider, None).unwrap(), "fixed");
    }

    #[test]
    fn test_render_error_names_template() {
        let processor = JsonProcessor::default();
        let provider = MemoryTemplateProvider::new().with_template("Root", "{{ nope() }}");
        let err = processor.convert("{}", "Root", &provider, None).unwrap_err();
        match err {
            ConvertError::Render { template, cause } => {
                assert_eq!(template, "Root");
                assert!(matches!(cause, RenderError::Engine(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_trace_not_filled_on_failure() {
        let processor = Hl7v2Processor::default();
        let provider = MemoryTemplateProvider::new()
            .with_template("Root", "{{ hl7v2Data.PID[3] }}{{ nope() }}");
        let mut trace = TraceInfo::hl7v2();
        assert!(processor.convert(ADT, "Root", &provider, Some(&mut trace)).is_err());
        assert_eq!(trace, TraceInfo::hl7v2());
    }

    #[test]
    fn test_processor_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Hl7v2Processor>();
        assert_send_sync::<JsonProcessor>();
    }
}
