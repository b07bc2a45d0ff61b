//! Input formats understood by the converter.
//!
//! Each format module provides a parser for its raw text, the view of the
//! parsed data handed to templates, and a [`DataFormat`](crate::runtime::DataFormat)
//! implementation tying them into the conversion pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod hl7v2;
pub mod json;

/// Declared format of a raw input payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Hl7v2,
    Json,
}

impl InputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Hl7v2 => "hl7v2",
            InputFormat::Json => "json",
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hl7v2" | "hl7" => Ok(InputFormat::Hl7v2),
            "json" => Ok(InputFormat::Json),
            other => Err(format!("unknown input format '{other}'")),
        }
    }
}
