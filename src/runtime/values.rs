//! Generic template objects shared by every input format.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use minijinja::value::{Enumerator, Object, ObjectRepr, Value};

use crate::runtime::guard::{ExecutionGuard, GuardedIter};

/// Insertion-ordered map exposed to templates.
#[derive(Debug, Clone, Default)]
pub struct OrderedMap {
    entries: IndexMap<String, Value>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn into_value(self) -> Value {
        Value::from_object(self)
    }
}

impl Object for OrderedMap {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        self.entries.get(key.as_str()?).cloned()
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.entries.keys().map(|k| Value::from(k.as_str())).collect())
    }

    fn enumerator_len(self: &Arc<Self>) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Sequence whose iteration is charged against the conversion's guard.
#[derive(Debug)]
pub struct GuardedList {
    items: Vec<Value>,
    guard: Arc<ExecutionGuard>,
}

impl GuardedList {
    pub fn new(items: Vec<Value>, guard: Arc<ExecutionGuard>) -> Self {
        Self { items, guard }
    }

    pub fn into_value(self) -> Value {
        Value::from_object(self)
    }
}

impl Object for GuardedList {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Seq
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let index = usize::try_from(key.as_i64()?).ok()?;
        self.items.get(index).cloned()
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Iter(Box::new(GuardedIter::new(
            self.items.clone().into_iter(),
            self.guard.clone(),
        )))
    }

    fn enumerator_len(self: &Arc<Self>) -> Option<usize> {
        Some(self.items.len())
    }
}

/// Lazy integer range, the guard-aware replacement for the engine's `range`.
#[derive(Debug)]
pub struct GuardedRange {
    start: i64,
    stop: i64,
    step: i64,
    guard: Arc<ExecutionGuard>,
}

impl GuardedRange {
    pub fn new(start: i64, stop: i64, step: i64, guard: Arc<ExecutionGuard>) -> Self {
        Self {
            start,
            stop,
            step,
            guard,
        }
    }

    /// Number of values produced. Computed in `i128` so extreme bounds
    /// cannot overflow; always fits in `u64`.
    fn len(&self) -> u64 {
        let (start, stop) = (i128::from(self.start), i128::from(self.stop));
        let span = if self.step > 0 {
            stop - start
        } else {
            start - stop
        };
        if span <= 0 {
            return 0;
        }
        let step = i128::from(self.step.unsigned_abs());
        ((span + step - 1) / step) as u64
    }

    fn nth_value(&self, i: u64) -> Value {
        // Stays within [start, stop) for every i < len.
        let value = i128::from(self.start) + i128::from(i) * i128::from(self.step);
        Value::from(value as i64)
    }
}

impl Object for GuardedRange {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Iterable
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let range = self.clone();
        let values = (0..self.len()).map(move |i| range.nth_value(i));
        Enumerator::Iter(Box::new(GuardedIter::new(values, self.guard.clone())))
    }

    fn enumerator_len(self: &Arc<Self>) -> Option<usize> {
        usize::try_from(self.len()).ok()
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        write!(f, "range({}, {}, {})", self.start, self.stop, self.step)
    }
}
