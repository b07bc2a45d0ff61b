//! # fhir-converter: Template-Driven Clinical Data Conversion
//!
//! fhir-converter turns structured clinical records (HL7v2 messages and JSON
//! payloads) into a target clinical format by rendering them through
//! [minijinja](https://docs.rs/minijinja) templates.
//!
//! ## Features
//!
//! - **One pipeline per format**: [`Hl7v2Processor`] and [`JsonProcessor`] share
//!   parse → context build → render → trace
//! - **Pluggable templates**: in-memory or directory-backed [`TemplateProvider`]s,
//!   with includes resolved by name
//! - **Execution limits**: per-conversion render deadline and loop-iteration cap
//! - **Diagnostics**: unused HL7v2 segments and JSON schema validation results
//!   reported through [`TraceInfo`]
//! - **Telemetry**: parse and render durations reported to a [`TelemetrySink`]
//!
//! ## Example: HL7v2 to JSON
//!
//! ```
//! use fhir_converter::{Hl7v2Processor, MemoryTemplateProvider, ProcessorSettings, TraceInfo};
//!
//! let provider = MemoryTemplateProvider::new().with_template(
//!     "ADT_A01",
//!     r#"{"resourceType": "Patient", "id": "{{ hl7v2Data.PID[3][1] }}"}"#,
//! );
//! let processor = Hl7v2Processor::new(ProcessorSettings::default());
//! let mut trace = TraceInfo::hl7v2();
//!
//! let patient = processor
//!     .convert("MSH|^~\\&|LAB\rPID|1||12345", "ADT_A01", &provider, Some(&mut trace))
//!     .unwrap();
//! assert_eq!(patient, r#"{"resourceType": "Patient", "id": "12345"}"#);
//!
//! let unused = &trace.as_hl7v2().unwrap().unused_segments;
//! assert_eq!(unused[0].segment_type, "MSH");
//! ```
//!
//! ## Example: JSON with a deadline
//!
//! ```
//! use fhir_converter::{JsonProcessor, MemoryTemplateProvider, ProcessorSettings};
//!
//! let provider = MemoryTemplateProvider::new()
//!     .with_template("Root", "{{ msg.name.family }}");
//! let processor = JsonProcessor::new(ProcessorSettings::new().with_timeout_ms(5_000));
//!
//! let out = processor
//!     .convert(r#"{"name": {"family": "Doe"}}"#, "Root", &provider, None)
//!     .unwrap();
//! assert_eq!(out, "Doe");
//! ```

pub mod error;
pub mod formats;
pub mod runtime;
pub mod settings;
pub mod telemetry;
pub mod template;
pub mod trace;

// Re-export key types
pub use error::{ConvertError, RenderError};
pub use formats::hl7v2::{Hl7v2Data, Hl7v2Format};
pub use formats::json::JsonFormat;
pub use formats::InputFormat;
pub use runtime::{
    ConversionContext, DataFormat, ExecutionGuard, HelperRegistry, Hl7v2Processor, JsonProcessor,
    Processor,
};
pub use settings::{ConfigError, ProcessorSettings};
pub use telemetry::{track_duration, NoopTelemetry, ScopedTimer, TelemetrySink, TracingTelemetry};
pub use template::{
    DirectoryTemplateProvider, MemoryTemplateProvider, Template, TemplateFileSystem,
    TemplateProvider,
};
pub use trace::{Hl7v2TraceInfo, JsonTraceInfo, SchemaValidation, TraceInfo, UnusedSegment};
