//! Helper registry for functions and filters callable from templates.
//!
//! Helpers are registered by name and installed into each conversion's
//! template environment, both as a filter (`value | name(args)`) and as a
//! function (`name(value, args)`). Every call first polls the conversion's
//! [`ExecutionGuard`], so a timed-out render cannot keep running helpers.

use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, NaiveTime};
use indexmap::IndexMap;
use minijinja::value::{Rest, Value};
use minijinja::{Environment, Error, ErrorKind, State};
use regex::Regex;
use uuid::Uuid;

use crate::runtime::guard::ExecutionGuard;

/// A function callable from templates.
///
/// Helpers must only touch state owned by the current conversion.
pub trait HelperFn: Send + Sync {
    fn call(&self, state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error>;
}

impl<F> HelperFn for F
where
    F: Fn(&State<'_, '_>, &[Value]) -> Result<Value, Error> + Send + Sync,
{
    fn call(&self, state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
        self(state, args)
    }
}

/// Registry of template helpers.
#[derive(Clone, Default)]
pub struct HelperRegistry {
    helpers: IndexMap<String, Arc<dyn HelperFn>>,
}

impl HelperRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the helpers every format gets.
    pub fn common() -> Self {
        let mut registry = Self::new();
        registry.register("generate_uuid", generate_uuid);
        registry.register("format_as_date_time", format_as_date_time);
        registry.register("add_hyphens_date", add_hyphens_date);
        registry.register("escape_special_chars", escape_special_chars);
        registry.register("unescape_special_chars", unescape_special_chars);
        registry.register("match", match_pattern);
        registry
    }

    /// Register a helper, replacing any helper with the same name.
    ///
    /// # Example
    ///
    /// ```
    /// use fhir_converter::runtime::HelperRegistry;
    /// use minijinja::{State, Value};
    ///
    /// let mut registry = HelperRegistry::new();
    /// registry.register("shout", |_: &State, args: &[Value]| {
    ///     Ok(Value::from(args[0].to_string().to_uppercase()))
    /// });
    /// assert!(registry.has_helper("shout"));
    /// ```
    pub fn register(&mut self, name: impl Into<String>, helper: impl HelperFn + 'static) {
        self.helpers.insert(name.into(), Arc::new(helper));
    }

    pub fn has_helper(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Registered helper names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.helpers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub(crate) fn install(&self, env: &mut Environment<'static>, guard: &Arc<ExecutionGuard>) {
        for (name, helper) in &self.helpers {
            let as_filter = GuardedHelper {
                helper: helper.clone(),
                guard: guard.clone(),
            };
            let as_function = as_filter.clone();
            env.add_filter(name.clone(), move |state: &State, args: Rest<Value>| {
                as_filter.invoke(state, &args)
            });
            env.add_function(name.clone(), move |state: &State, args: Rest<Value>| {
                as_function.invoke(state, &args)
            });
        }
    }
}

impl fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("helpers", &self.names())
            .finish()
    }
}

#[derive(Clone)]
struct GuardedHelper {
    helper: Arc<dyn HelperFn>,
    guard: Arc<ExecutionGuard>,
}

impl GuardedHelper {
    fn invoke(&self, state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
        self.guard.check()?;
        self.helper.call(state, args)
    }
}

/// Text of a positional argument; `None` when missing, undefined or none.
pub fn arg_text(args: &[Value], index: usize) -> Option<String> {
    let value = args.get(index)?;
    if value.is_undefined() || value.is_none() {
        return None;
    }
    Some(value.to_string())
}

/// Like [`arg_text`] but fails the render when the argument is absent.
pub fn required_arg(
    args: &[Value],
    index: usize,
    helper: &str,
    name: &str,
) -> Result<String, Error> {
    arg_text(args, index).ok_or_else(|| {
        Error::new(
            ErrorKind::MissingArgument,
            format!("{helper}: missing argument '{name}'"),
        )
    })
}

fn generate_uuid(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    Ok(match arg_text(args, 0) {
        Some(text) if !text.trim().is_empty() => {
            Value::from(Uuid::new_v5(&Uuid::NAMESPACE_OID, text.as_bytes()).to_string())
        }
        _ => Value::from(()),
    })
}

static HL7_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})(\d{2})?(\d{2})?(?:(\d{2})(\d{2})?(\d{2})?(\.\d{1,4})?)?([+-]\d{4})?$",
    )
    .expect("timestamp pattern is valid")
});

/// Convert an HL7 `DTM` value to ISO-8601, keeping its precision.
pub fn hl7_to_iso_date_time(input: &str) -> Result<String, String> {
    let caps = HL7_TIMESTAMP
        .captures(input.trim())
        .ok_or_else(|| format!("'{input}' is not an HL7 date/time"))?;
    let number = |i: usize| caps.get(i).map(|m| m.as_str().parse::<u32>().unwrap_or(0));

    let year = caps[1].to_string();
    let Some(month) = number(2) else {
        return Ok(year);
    };
    let Some(day) = number(3) else {
        if !(1..=12).contains(&month) {
            return Err(format!("'{input}' has an invalid month"));
        }
        return Ok(format!("{year}-{month:02}"));
    };
    NaiveDate::from_ymd_opt(year.parse().unwrap_or(0), month, day)
        .ok_or_else(|| format!("'{input}' is not a valid calendar date"))?;
    let date = format!("{year}-{month:02}-{day:02}");

    let Some(hour) = number(4) else {
        return Ok(date);
    };
    let minute = number(5).unwrap_or(0);
    let second = number(6).unwrap_or(0);
    NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| format!("'{input}' has an invalid time of day"))?;
    let fraction = caps.get(7).map(|m| m.as_str()).unwrap_or("");
    let offset = caps
        .get(8)
        .map(|m| {
            let o = m.as_str();
            format!("{}:{}", &o[..3], &o[3..])
        })
        .unwrap_or_default();

    Ok(format!("{date}T{hour:02}:{minute:02}:{second:02}{fraction}{offset}"))
}

fn format_as_date_time(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    match arg_text(args, 0).filter(|s| !s.trim().is_empty()) {
        Some(text) => hl7_to_iso_date_time(&text)
            .map(Value::from)
            .map_err(|msg| Error::new(ErrorKind::InvalidOperation, msg)),
        None => Ok(Value::from(())),
    }
}

fn add_hyphens_date(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let Some(text) = arg_text(args, 0).filter(|s| !s.trim().is_empty()) else {
        return Ok(Value::from(()));
    };
    let date_part: String = text.trim().chars().take(8).collect();
    hl7_to_iso_date_time(&date_part)
        .map(Value::from)
        .map_err(|msg| Error::new(ErrorKind::InvalidOperation, msg))
}

fn escape_special_chars(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    Ok(match arg_text(args, 0) {
        Some(text) => Value::from(text.replace('\\', "\\\\").replace('"', "\\\"")),
        None => Value::from(()),
    })
}

fn unescape_special_chars(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let Some(text) = arg_text(args, 0) else {
        return Ok(Value::from(()));
    };
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('\\' | '"')) => out.push(next),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    Ok(Value::from(out))
}

fn match_pattern(_state: &State<'_, '_>, args: &[Value]) -> Result<Value, Error> {
    let pattern = required_arg(args, 1, "match", "pattern")?;
    let Some(text) = arg_text(args, 0) else {
        return Ok(Value::from(Vec::<Value>::new()));
    };
    let regex = Regex::new(&pattern).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("match: invalid pattern '{pattern}': {e}"),
        )
    })?;
    let matches: Vec<Value> = regex
        .find_iter(&text)
        .map(|m| Value::from(m.as_str()))
        .collect();
    Ok(Value::from(matches))
}
