//! Error types for the conversion pipeline.
//!
//! Every failure a caller can observe is a [`ConvertError`], with one variant
//! per pipeline phase so the caller can tell whether parsing, template
//! resolution, context construction or rendering failed.

use thiserror::Error;

use crate::formats::InputFormat;

/// Failure of a single conversion call.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The raw input does not conform to the declared format.
    #[error("failed to parse {format} input: {message}")]
    Parse {
        format: InputFormat,
        message: String,
    },

    /// The root template is unknown to the template provider.
    #[error("template '{0}' was not found")]
    TemplateResolution(String),

    /// The rendering context could not be assembled.
    #[error("failed to build conversion context: {0}")]
    Context(String),

    /// Rendering started but did not complete.
    #[error("failed to render template '{template}': {cause}")]
    Render {
        template: String,
        #[source]
        cause: RenderError,
    },
}

impl ConvertError {
    pub(crate) fn parse(format: InputFormat, message: impl Into<String>) -> Self {
        ConvertError::Parse {
            format,
            message: message.into(),
        }
    }

    /// Name of the pipeline phase that failed.
    pub fn phase(&self) -> &'static str {
        match self {
            ConvertError::Parse { .. } => "parse",
            ConvertError::TemplateResolution(_) => "template-resolution",
            ConvertError::Context(_) => "context-build",
            ConvertError::Render { .. } => "render",
        }
    }

    /// The render cause, if rendering is what failed.
    pub fn render_cause(&self) -> Option<&RenderError> {
        match self {
            ConvertError::Render { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Why rendering stopped.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering did not finish within {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("rendering exceeded the limit of {limit} loop iterations")]
    IterationLimit { limit: u64 },

    #[error("value rejected by schema '{schema}': {}", .errors.join("; "))]
    SchemaValidation { schema: String, errors: Vec<String> },

    /// Syntax errors, failing helpers, missing includes and other engine errors.
    #[error(transparent)]
    Engine(#[from] minijinja::Error),
}

impl RenderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RenderError::Timeout { .. })
    }
}
