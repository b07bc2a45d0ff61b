//! Template-facing view of a parsed HL7v2 message.
//!
//! Reading a segment by id (`hl7v2Data.PID`) or reading any of its fields
//! (`segment[5]`) marks the segment as used.

use std::fmt;
use std::sync::Arc;

use minijinja::value::{Enumerator, Object, Value};

use crate::formats::hl7v2::message::{Field, Hl7v2Data, Repetition, Segment};
use crate::runtime::guard::ExecutionGuard;
use crate::runtime::values::GuardedList;

/// Key-based position lookup: accepts integers and numeric strings.
fn position_of(key: &Value) -> Option<usize> {
    if let Some(n) = key.as_i64() {
        return usize::try_from(n).ok();
    }
    key.as_str()?.parse().ok()
}

/// The whole message, bound to the template's data key.
#[derive(Debug)]
pub struct MessageView {
    data: Arc<Hl7v2Data>,
    guard: Arc<ExecutionGuard>,
}

impl MessageView {
    pub fn new(data: Arc<Hl7v2Data>, guard: Arc<ExecutionGuard>) -> Self {
        Self { data, guard }
    }

    pub fn data(&self) -> &Arc<Hl7v2Data> {
        &self.data
    }

    /// View of the segment at `index`, marking it used.
    pub fn used_segment(&self, index: usize) -> Option<Value> {
        self.data.segment(index)?.mark_accessed();
        Some(self.segment(index))
    }

    /// View of the segment at `index` without marking it.
    pub fn segment(&self, index: usize) -> Value {
        Value::from_object(SegmentView {
            data: self.data.clone(),
            index,
        })
    }

    /// Guarded list of segment views at the given positions.
    pub fn segment_list(&self, positions: &[usize], mark: bool) -> Value {
        let items = positions
            .iter()
            .filter_map(|&i| {
                if mark {
                    self.used_segment(i)
                } else {
                    Some(self.segment(i))
                }
            })
            .collect();
        GuardedList::new(items, self.guard.clone()).into_value()
    }
}

impl Object for MessageView {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "segments" => {
                let all: Vec<usize> = (0..self.data.segments().len()).collect();
                Some(self.segment_list(&all, false))
            }
            "meta" => Some(Value::from(
                self.data.meta().into_iter().map(Value::from).collect::<Vec<_>>(),
            )),
            id => {
                let first = *self.data.positions(id).first()?;
                self.used_segment(first)
            }
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["segments", "meta"])
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        write!(f, "{}", self.data)
    }
}

#[derive(Debug)]
pub struct SegmentView {
    data: Arc<Hl7v2Data>,
    index: usize,
}

impl SegmentView {
    pub fn index(&self) -> usize {
        self.index
    }

    fn segment(&self) -> Option<&Segment> {
        self.data.segment(self.index)
    }

    fn field_value(&self, position: usize) -> Option<Value> {
        let segment = self.segment()?;
        segment.mark_accessed();
        segment.field(position)?;
        Some(Value::from_object(FieldView {
            data: self.data.clone(),
            segment: self.index,
            position,
        }))
    }
}

impl Object for SegmentView {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str() {
            Some("id") => self.segment().map(|s| Value::from(s.id())),
            Some("line") => self.segment().map(|s| Value::from(s.line())),
            Some("value") => {
                let segment = self.segment()?;
                segment.mark_accessed();
                Some(Value::from(segment.raw()))
            }
            _ => self.field_value(position_of(key)?),
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["id", "line", "value"])
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        if let Some(segment) = self.segment() {
            segment.mark_accessed();
            f.write_str(segment.raw())?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FieldView {
    data: Arc<Hl7v2Data>,
    segment: usize,
    position: usize,
}

impl FieldView {
    fn field(&self) -> Option<&Field> {
        self.data.segment(self.segment)?.field(self.position)
    }
}

impl Object for FieldView {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let field = self.field()?;
        match key.as_str() {
            Some("value") => Some(Value::from(field.raw.as_str())),
            Some("repeats") => Some(Value::from(
                field
                    .repeats
                    .iter()
                    .map(|r| Value::from_object(RepetitionView(r.clone())))
                    .collect::<Vec<_>>(),
            )),
            _ => {
                let component = field.first_repeat()?.component(position_of(key)?)?;
                Some(Value::from(component))
            }
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["value", "repeats"])
    }

    fn is_true(self: &Arc<Self>) -> bool {
        self.field().is_some_and(|f| !f.is_empty())
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        if let Some(field) = self.field() {
            f.write_str(&field.raw)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RepetitionView(Repetition);

impl Object for RepetitionView {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str() {
            Some("value") => Some(Value::from(self.0.raw.as_str())),
            Some("components") => Some(Value::from(
                self.0
                    .components
                    .iter()
                    .map(|c| Value::from(c.as_str()))
                    .collect::<Vec<_>>(),
            )),
            _ => self.0.component(position_of(key)?).map(Value::from),
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["value", "components"])
    }

    fn is_true(self: &Arc<Self>) -> bool {
        !self.0.raw.is_empty()
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        f.write_str(&self.0.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::{context, Environment};

    const MSG: &str = "MSH|^~\\&|SRC|FAC\rPID|1||123^^^MRN~456^^^SSN||Doe^Jane\rOBX|1|ST\rOBX|2|NM";

    fn render(template: &str) -> (String, Arc<Hl7v2Data>) {
        let data = Arc::new(Hl7v2Data::parse(MSG).unwrap());
        let view = MessageView::new(data.clone(), Arc::new(ExecutionGuard::unbounded()));
        let env = Environment::new();
        let out = env
            .render_str(template, context! { hl7v2Data => Value::from_object(view) })
            .unwrap();
        (out, data)
    }

    fn unused(data: &Hl7v2Data) -> Vec<(String, usize)> {
        data.unused_segments()
            .map(|s| (s.id().to_string(), s.line()))
            .collect()
    }

    #[test]
    fn test_field_and_component_access() {
        let (out, _) =
            render("{{ hl7v2Data.PID[5][1] }},{{ hl7v2Data.PID[5][2] }}|{{ hl7v2Data.PID[5] }}");
        assert_eq!(out, "Doe,Jane|Doe^Jane");
    }

    #[test]
    fn test_repeats() {
        let (out, _) = render(
            "{% for r in hl7v2Data.PID[3].repeats %}{{ r[1] }}/{{ r[4] }};{% endfor %}",
        );
        assert_eq!(out, "123/MRN;456/SSN;");
    }

    #[test]
    fn test_lookup_by_id_marks_segment() {
        let (_, data) = render("{{ hl7v2Data.PID.id }}");
        assert_eq!(
            unused(&data),
            vec![("MSH".into(), 0), ("OBX".into(), 2), ("OBX".into(), 3)]
        );
    }

    #[test]
    fn test_iterating_segments_marks_only_read_ones() {
        let (out, data) = render(
            "{% for s in hl7v2Data.segments %}{% if s.id == 'OBX' %}{{ s[2] }}{% endif %}{% endfor %}",
        );
        assert_eq!(out, "STNM");
        assert_eq!(unused(&data), vec![("MSH".into(), 0), ("PID".into(), 1)]);
    }

    #[test]
    fn test_meta_does_not_mark() {
        let (out, data) = render("{{ hl7v2Data.meta | join(',') }}");
        assert_eq!(out, "MSH,PID,OBX,OBX");
        assert_eq!(unused(&data).len(), 4);
    }

    #[test]
    fn test_empty_field_is_falsy() {
        let (out, _) = render("{% if hl7v2Data.PID[2] %}yes{% else %}no{% endif %}");
        assert_eq!(out, "no");
    }

    #[test]
    fn test_missing_segment_is_undefined() {
        let (out, data) = render("{% if hl7v2Data.PV1 is undefined %}none{% endif %}");
        assert_eq!(out, "none");
        assert_eq!(unused(&data).len(), 4);
    }
}
