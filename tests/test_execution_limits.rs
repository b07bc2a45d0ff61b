//! Tests for render deadlines and iteration caps, including include expansion

use std::time::{Duration, Instant};

use fhir_converter::{
    ConvertError, Hl7v2Processor, JsonProcessor, MemoryTemplateProvider, ProcessorSettings,
    RenderError, TraceInfo,
};

const SLOW: &str = "{% for i in range(100000) %}{% for j in range(100000) %}{{ j }}{% endfor %}{% endfor %}";

#[test]
fn test_json_timeout_interrupts_slow_template() {
    let provider = MemoryTemplateProvider::new().with_template("Slow", SLOW);
    let processor = JsonProcessor::new(
        ProcessorSettings::new()
            .with_timeout_ms(1)
            .with_max_iterations(0),
    );
    let mut trace = TraceInfo::json();

    let started = Instant::now();
    let err = processor
        .convert("{}", "Slow", &provider, Some(&mut trace))
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(30));

    match err {
        ConvertError::Render { template, cause } => {
            assert_eq!(template, "Slow");
            assert!(matches!(cause, RenderError::Timeout { limit_ms: 1 }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(trace, TraceInfo::json());
}

#[test]
fn test_json_timeout_stops_data_iteration() {
    let items: Vec<u32> = (0..2000).collect();
    let input = serde_json::json!({ "items": items }).to_string();
    let provider = MemoryTemplateProvider::new().with_template(
        "Slow",
        "{% for a in msg.items %}{% for b in msg.items %}{{ a }}{{ b }}{% endfor %}{% endfor %}",
    );
    let processor = JsonProcessor::new(
        ProcessorSettings::new()
            .with_timeout_ms(1)
            .with_max_iterations(0),
    );
    let err = processor.convert(&input, "Slow", &provider, None).unwrap_err();
    assert!(err.render_cause().is_some_and(RenderError::is_timeout));
}

#[test]
fn test_json_fast_template_meets_deadline() {
    let provider = MemoryTemplateProvider::new().with_template("Fast", "{{ msg.a }}");
    let processor = JsonProcessor::new(ProcessorSettings::new().with_timeout_ms(10_000));
    assert_eq!(
        processor.convert(r#"{"a": 1}"#, "Fast", &provider, None).unwrap(),
        "1"
    );
}

#[test]
fn test_iteration_limit_applies_to_hl7v2() {
    let provider = MemoryTemplateProvider::new().with_template("Slow", SLOW);
    let processor = Hl7v2Processor::new(ProcessorSettings::new().with_max_iterations(1_000));
    let err = processor
        .convert("MSH|^~\\&|A", "Slow", &provider, None)
        .unwrap_err();
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::IterationLimit { limit: 1_000 })
    ));
}

#[test]
fn test_iteration_limit_counts_segment_loops() {
    let raw = "MSH|^~\\&|A\rOBX|1\rOBX|2\rOBX|3\rOBX|4";
    let provider = MemoryTemplateProvider::new().with_template(
        "Root",
        "{% for s in hl7v2Data.segments %}{{ s.id }}{% endfor %}",
    );

    let roomy = Hl7v2Processor::new(ProcessorSettings::new().with_max_iterations(5));
    assert_eq!(
        roomy.convert(raw, "Root", &provider, None).unwrap(),
        "MSHOBXOBXOBXOBX"
    );

    let tight = Hl7v2Processor::new(ProcessorSettings::new().with_max_iterations(4));
    let err = tight.convert(raw, "Root", &provider, None).unwrap_err();
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::IterationLimit { limit: 4 })
    ));
}

#[test]
fn test_hl7v2_ignores_timeout_setting() {
    let provider = MemoryTemplateProvider::new().with_template(
        "Root",
        "{% for i in range(20000) %}{% endfor %}{{ hl7v2Data.MSH[3] }}",
    );
    let processor = Hl7v2Processor::new(
        ProcessorSettings::new()
            .with_timeout_ms(1)
            .with_max_iterations(0),
    );
    assert_eq!(
        processor.convert("MSH|^~\\&|A", "Root", &provider, None).unwrap(),
        "A"
    );
}

/// Templates `L0`..`L17`, each including the next level twice.
fn include_fan_out() -> MemoryTemplateProvider {
    let mut provider = MemoryTemplateProvider::new().with_template("L18", "x");
    for level in 0..18 {
        let next = format!("L{}", level + 1);
        provider.insert(
            format!("L{level}"),
            format!("{{% include '{next}' %}}{{% include '{next}' %}}"),
        );
    }
    provider
}

#[test]
fn test_json_timeout_stops_include_fan_out() {
    let provider = include_fan_out();
    let processor = JsonProcessor::new(
        ProcessorSettings::new()
            .with_timeout_ms(1)
            .with_max_iterations(0),
    );

    let started = Instant::now();
    let err = processor.convert("{}", "L0", &provider, None).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::Timeout { limit_ms: 1 })
    ));
}

#[test]
fn test_iteration_limit_bounds_include_fan_out() {
    let provider = include_fan_out();
    let processor = JsonProcessor::new(ProcessorSettings::new().with_max_iterations(10));
    let err = processor.convert("{}", "L0", &provider, None).unwrap_err();
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::IterationLimit { limit: 10 })
    ));
}

#[test]
fn test_iteration_limit_stops_self_include() {
    let provider = MemoryTemplateProvider::new().with_template("Self", "a{% include 'Self' %}");

    let json = JsonProcessor::new(ProcessorSettings::new().with_max_iterations(10));
    let err = json.convert("{}", "Self", &provider, None).unwrap_err();
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::IterationLimit { limit: 10 })
    ));

    let hl7v2 = Hl7v2Processor::new(ProcessorSettings::new().with_max_iterations(10));
    let err = hl7v2
        .convert("MSH|^~\\&|A", "Self", &provider, None)
        .unwrap_err();
    assert!(matches!(
        err.render_cause(),
        Some(RenderError::IterationLimit { limit: 10 })
    ));
}

#[test]
fn test_includes_within_limit_render() {
    let provider = MemoryTemplateProvider::new()
        .with_template("Name", "{{ msg.name }}")
        .with_template("Root", "{% include 'Name' %}-{% include 'Name' %}");
    let processor = JsonProcessor::new(ProcessorSettings::new().with_max_iterations(2));
    assert_eq!(
        processor
            .convert(r#"{"name": "Doe"}"#, "Root", &provider, None)
            .unwrap(),
        "Doe-Doe"
    );
}
