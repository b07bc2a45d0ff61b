//! Format-agnostic conversion runtime.
//!
//! This module provides the pipeline shared by every input format: the
//! per-conversion context, execution limits, template helpers and the
//! generic [`Processor`].

pub mod context;
pub mod guard;
pub mod helpers;
pub mod processor;
pub mod values;

// Re-export key types
pub use context::ConversionContext;
pub use guard::{ExecutionGuard, GuardedIter, Interruption};
pub use helpers::{HelperFn, HelperRegistry};
pub use processor::{DataFormat, Hl7v2Processor, JsonProcessor, Processor};
pub use values::{GuardedList, GuardedRange, OrderedMap};
