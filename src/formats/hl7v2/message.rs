//! HL7v2 message model and parser.
//!
//! Parses pipe-delimited HL7v2 text into segments, fields, repetitions and
//! components. Each segment carries an access flag that the template view
//! sets when the segment is read during rendering; the flags drive the
//! unused-segment trace.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;

use crate::error::ConvertError;
use crate::formats::InputFormat;

/// Delimiters declared in `MSH-1` and `MSH-2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Encoding {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Encoding {
    fn from_header(header: &str) -> Result<Self, String> {
        let mut chars = header.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| "MSH segment is missing its field separator".to_string())?;
        if field.is_ascii_alphanumeric() || field.is_whitespace() {
            return Err(format!("'{field}' is not a valid field separator"));
        }
        let declared: Vec<char> = chars.take_while(|&c| c != field).collect();
        if declared.len() < 4 {
            return Err(format!(
                "MSH-2 must declare four encoding characters, found {}",
                declared.len()
            ));
        }
        Ok(Self {
            field,
            component: declared[0],
            repetition: declared[1],
            escape: declared[2],
            subcomponent: declared[3],
        })
    }

    /// Decode `\F\`, `\S\`, `\T\`, `\R\` and `\E\` escape sequences.
    pub fn unescape(&self, raw: &str) -> String {
        if !raw.contains(self.escape) {
            return raw.to_string();
        }
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find(self.escape) {
            out.push_str(&rest[..start]);
            let after = &rest[start + self.escape.len_utf8()..];
            match after.find(self.escape) {
                Some(end) => {
                    let code = &after[..end];
                    match code {
                        "F" => out.push(self.field),
                        "S" => out.push(self.component),
                        "T" => out.push(self.subcomponent),
                        "R" => out.push(self.repetition),
                        "E" => out.push(self.escape),
                        _ => {
                            out.push(self.escape);
                            out.push_str(code);
                            out.push(self.escape);
                        }
                    }
                    rest = &after[end + self.escape.len_utf8()..];
                }
                None => {
                    out.push(self.escape);
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// One repetition of a field, split into decoded components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repetition {
    pub raw: String,
    pub components: Vec<String>,
}

impl Repetition {
    /// Component by 1-based HL7 position.
    pub fn component(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.components.get(i))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub raw: String,
    pub repeats: Vec<Repetition>,
}

impl Field {
    /// A field taken verbatim, without splitting (segment ids, `MSH-1`, `MSH-2`).
    fn literal(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            repeats: vec![Repetition {
                raw: raw.to_string(),
                components: vec![raw.to_string()],
            }],
        }
    }

    fn parse(raw: &str, encoding: &Encoding) -> Self {
        let repeats = raw
            .split(encoding.repetition)
            .map(|rep| Repetition {
                raw: rep.to_string(),
                components: rep
                    .split(encoding.component)
                    .map(|c| encoding.unescape(c))
                    .collect(),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            repeats,
        }
    }

    pub fn first_repeat(&self) -> Option<&Repetition> {
        self.repeats.first()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// A segment. `fields[0]` is the segment id, so HL7 field `n` is `fields[n]`.
#[derive(Debug)]
pub struct Segment {
    id: String,
    line: usize,
    raw: String,
    fields: Vec<Field>,
    accessed: AtomicBool,
}

impl Segment {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position of the segment in the message, starting at 0.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn field(&self, position: usize) -> Option<&Field> {
        self.fields.get(position)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len().saturating_sub(1)
    }

    pub fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    pub fn is_accessed(&self) -> bool {
        self.accessed.load(Ordering::Relaxed)
    }
}

/// A parsed HL7v2 message.
#[derive(Debug)]
pub struct Hl7v2Data {
    encoding: Encoding,
    segments: Vec<Segment>,
    by_id: IndexMap<String, Vec<usize>>,
}

impl Hl7v2Data {
    /// Parse raw HL7v2 text.
    ///
    /// Segments may be separated by `\r`, `\n` or `\r\n`; blank lines are
    /// ignored. The message must open with an `MSH` segment declaring its
    /// delimiters.
    pub fn parse(raw: &str) -> Result<Self, ConvertError> {
        let fail = |msg: String| ConvertError::parse(InputFormat::Hl7v2, msg);

        let mut lines = raw
            .split(['\r', '\n'])
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .peekable();

        let header = lines.peek().ok_or_else(|| fail("input is empty".to_string()))?;
        if !header.starts_with("MSH") {
            let found: String = header.chars().take(3).collect();
            return Err(fail(format!(
                "message must start with an MSH segment, found '{found}'"
            )));
        }
        let encoding = Encoding::from_header(header).map_err(fail)?;

        let mut segments = Vec::new();
        let mut by_id: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (line, text) in lines.enumerate() {
            let segment = parse_segment(text, line, &encoding).map_err(fail)?;
            by_id.entry(segment.id.clone()).or_default().push(line);
            segments.push(segment);
        }

        Ok(Self {
            encoding,
            segments,
            by_id,
        })
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    /// Segment ids in message order.
    pub fn meta(&self) -> Vec<&str> {
        self.segments.iter().map(Segment::id).collect()
    }

    /// Positions of every segment with the given id.
    pub fn positions(&self, id: &str) -> &[usize] {
        self.by_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_segment(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Segments never read during rendering, in message order.
    pub fn unused_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.is_accessed())
    }
}

impl fmt::Display for Hl7v2Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("\r")?;
            }
            f.write_str(segment.raw())?;
        }
        Ok(())
    }
}

fn parse_segment(text: &str, line: usize, encoding: &Encoding) -> Result<Segment, String> {
    let id: String = text.chars().take(3).collect();
    let valid_id = id.len() == 3
        && id.starts_with(|c: char| c.is_ascii_uppercase())
        && id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    let delimited = match text[id.len()..].chars().next() {
        None => true,
        Some(c) => c == encoding.field,
    };
    if !valid_id || !delimited {
        return Err(format!("line {}: '{}' is not a valid segment", line + 1, text));
    }

    let mut parts = text.split(encoding.field);
    parts.next();
    let mut fields = vec![Field::literal(&id)];
    if id == "MSH" {
        // MSH-1 is the separator itself and MSH-2 is taken verbatim.
        fields.push(Field::literal(&encoding.field.to_string()));
        fields.push(Field::literal(parts.next().unwrap_or_default()));
    }
    fields.extend(parts.map(|raw| Field::parse(raw, encoding)));

    Ok(Segment {
        id,
        line,
        raw: text.to_string(),
        fields,
        accessed: AtomicBool::new(false),
    })
}
