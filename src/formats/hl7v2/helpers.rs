//! Template helpers specific to HL7v2 conversions.

use std::sync::Arc;

use minijinja::value::{Value, ValueKind};
use minijinja::{Error, ErrorKind, State};

use crate::formats::hl7v2::view::{MessageView, SegmentView};
use crate::runtime::helpers::{arg_text, required_arg, HelperRegistry};
use crate::runtime::values::OrderedMap;

/// Context key holding the code-system mapping table.
pub const CODE_MAPPING_KEY: &str = "CodeMapping";

/// Mapping entry used when a code has no row of its own.
pub const DEFAULT_CODE: &str = "__default__";

pub fn registry() -> HelperRegistry {
    let mut registry = HelperRegistry::new();
    registry.register("get_first_segments", get_first_segments);
    registry.register("get_segment_lists", get_segment_lists);
    registry.register("get_related_segment_list", get_related_segment_list);
    registry.register("has_segments", has_segments);
    registry.register("get_property", get_property);
    registry
}

fn message_arg(args: &[Value], helper: &str) -> Result<Arc<MessageView>, Error> {
    args.first()
        .and_then(|v| v.downcast_object::<MessageView>())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("{helper}: first argument must be the HL7v2 message"),
            )
        })
}

/// Segment ids from a `|`-separated list, e.g. `"PID|PV1"`.
fn segment_ids(list: &str) -> impl Iterator<Item = &str> {
    list.split('|').map(str::trim).filter(|id| !id.is_empty())
}

fn get_first_segments(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let message = message_arg(args, "get_first_segments")?;
    let ids = required_arg(args, 1, "get_first_segments", "segment_ids")?;

    let mut out = OrderedMap::new();
    for id in segment_ids(&ids) {
        if let Some(&first) = message.data().positions(id).first() {
            if let Some(segment) = message.used_segment(first) {
                out.insert(id, segment);
            }
        }
    }
    Ok(out.into_value())
}

fn get_segment_lists(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let message = message_arg(args, "get_segment_lists")?;
    let ids = required_arg(args, 1, "get_segment_lists", "segment_ids")?;

    let mut out = OrderedMap::new();
    for id in segment_ids(&ids) {
        let positions = message.data().positions(id);
        if !positions.is_empty() {
            out.insert(id, message.segment_list(positions, true));
        }
    }
    Ok(out.into_value())
}

/// Segments of a given id that follow `parent`, up to the next segment with
/// the parent's id.
fn get_related_segment_list(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let message = message_arg(args, "get_related_segment_list")?;
    let parent = args
        .get(1)
        .and_then(|v| v.downcast_object::<SegmentView>())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                "get_related_segment_list: second argument must be a segment",
            )
        })?;
    let child_id = required_arg(args, 2, "get_related_segment_list", "segment_id")?;

    let data = message.data();
    let parent_id = data
        .segment(parent.index())
        .map(|s| s.id().to_string())
        .unwrap_or_default();
    let positions: Vec<usize> = data
        .segments()
        .iter()
        .enumerate()
        .skip(parent.index() + 1)
        .take_while(|(_, s)| s.id() != parent_id)
        .filter(|(_, s)| s.id() == child_id)
        .map(|(i, _)| i)
        .collect();
    Ok(message.segment_list(&positions, true))
}

fn has_segments(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let message = message_arg(args, "has_segments")?;
    let ids = required_arg(args, 1, "has_segments", "segment_ids")?;
    let mut ids = segment_ids(&ids).peekable();
    if ids.peek().is_none() {
        return Ok(Value::from(false));
    }
    Ok(Value::from(ids.all(|id| message.data().has_segment(id))))
}

/// Translate a code through the `CodeMapping` table.
fn get_property(state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let Some(code) = arg_text(args, 0).filter(|c| !c.is_empty()) else {
        return Ok(Value::from(()));
    };
    let system = required_arg(args, 1, "get_property", "code_system")?;
    let property = arg_text(args, 2).unwrap_or_else(|| "code".to_string());

    let translated = state
        .lookup(CODE_MAPPING_KEY)
        .and_then(|mapping| entry(&mapping, &system))
        .and_then(|table| entry(&table, &code).or_else(|| entry(&table, DEFAULT_CODE)))
        .and_then(|row| entry(&row, &property));
    if let Some(value) = translated {
        return Ok(value);
    }

    Ok(match property.as_str() {
        "code" | "display" => Value::from(code),
        _ => Value::from(()),
    })
}

/// Child of a mapping node; missing, undefined and null all read as absent.
fn entry(node: &Value, key: &str) -> Option<Value> {
    if node.kind() != ValueKind::Map {
        return None;
    }
    node.get_attr(key)
        .ok()
        .filter(|v| !v.is_undefined() && !v.is_none())
}
