//! Duration telemetry for conversion phases.
//!
//! A [`ScopedTimer`] records the elapsed time into a [`TelemetrySink`] when it
//! is dropped, so a phase is measured on every exit path, errors included.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Time spent turning raw input into the parsed model.
pub const INPUT_DESERIALIZATION_DURATION: &str = "InputDeserializationDuration";

/// Time spent rendering the root template.
pub const TEMPLATE_RENDER_DURATION: &str = "TemplateRenderDuration";

/// Destination of duration metrics.
pub trait TelemetrySink: Send + Sync {
    fn record_duration(&self, metric: &str, elapsed: Duration);
}

/// Discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_duration(&self, _metric: &str, _elapsed: Duration) {}
}

/// Emits each metric as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_duration(&self, metric: &str, elapsed: Duration) {
        tracing::info!(
            metric,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "conversion phase finished"
        );
    }
}

/// Keeps every metric in memory, in recording order.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    records: Mutex<Vec<(String, Duration)>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, Duration)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the recorded metrics, in order.
    pub fn metrics(&self) -> Vec<String> {
        self.records().into_iter().map(|(name, _)| name).collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record_duration(&self, metric: &str, elapsed: Duration) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((metric.to_string(), elapsed));
    }
}

/// Records the time between its creation and its drop.
#[must_use = "the duration is recorded when the timer is dropped"]
pub struct ScopedTimer<'a> {
    sink: &'a dyn TelemetrySink,
    metric: &'static str,
    started: Instant,
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.sink.record_duration(self.metric, self.started.elapsed());
    }
}

impl fmt::Debug for ScopedTimer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedTimer")
            .field("metric", &self.metric)
            .field("started", &self.started)
            .finish()
    }
}

/// Start timing `metric`.
///
/// # Example
///
/// ```
/// use fhir_converter::telemetry::{track_duration, RecordingTelemetry};
///
/// let sink = RecordingTelemetry::new();
/// {
///     let _timer = track_duration(&sink, "TemplateRenderDuration");
/// }
/// assert_eq!(sink.metrics(), vec!["TemplateRenderDuration"]);
/// ```
pub fn track_duration<'a>(sink: &'a dyn TelemetrySink, metric: &'static str) -> ScopedTimer<'a> {
    ScopedTimer {
        sink,
        metric,
        started: Instant::now(),
    }
}
