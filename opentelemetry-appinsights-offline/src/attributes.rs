//! Process-wide attribute bags.
//!
//! Two bags exist: *global* attributes are stamped onto every exported span,
//! *usage* attributes onto command-level (root) spans only. Writers replace
//! the snapshot atomically under a lock; readers clone an `Arc` and never
//! observe a torn update.

use once_cell::sync::Lazy;
use opentelemetry::{Array, KeyValue, Value};
use std::sync::{Arc, RwLock};

type Bag = RwLock<Arc<Vec<KeyValue>>>;

static GLOBAL: Lazy<Bag> = Lazy::new(|| RwLock::new(Arc::new(Vec::new())));
static USAGE: Lazy<Bag> = Lazy::new(|| RwLock::new(Arc::new(Vec::new())));

/// Set attributes applied to every exported span. Existing keys are
/// overwritten.
pub fn set_global_attributes(attributes: impl IntoIterator<Item = KeyValue>) {
    set(&GLOBAL, attributes);
}

/// Set attributes applied to command-level (root) spans. Existing keys are
/// overwritten.
pub fn set_usage_attributes(attributes: impl IntoIterator<Item = KeyValue>) {
    set(&USAGE, attributes);
}

/// Append to a global array-valued attribute.
///
/// When the existing value is an array of the same element kind the values
/// are concatenated; any other combination replaces the old value.
pub fn append_global_attribute(attribute: KeyValue) {
    append(&GLOBAL, attribute);
}

/// Append to a usage array-valued attribute; same semantics as
/// [`append_global_attribute`].
pub fn append_usage_attribute(attribute: KeyValue) {
    append(&USAGE, attribute);
}

pub(crate) fn global_snapshot() -> Arc<Vec<KeyValue>> {
    GLOBAL.read().expect("attribute bag lock poisoned").clone()
}

pub(crate) fn usage_snapshot() -> Arc<Vec<KeyValue>> {
    USAGE.read().expect("attribute bag lock poisoned").clone()
}

fn set(bag: &Bag, attributes: impl IntoIterator<Item = KeyValue>) {
    let mut guard = bag.write().expect("attribute bag lock poisoned");
    let mut next = guard.as_ref().clone();
    for attribute in attributes {
        match next.iter_mut().find(|kv| kv.key == attribute.key) {
            Some(existing) => existing.value = attribute.value,
            None => next.push(attribute),
        }
    }
    *guard = Arc::new(next);
}

fn append(bag: &Bag, attribute: KeyValue) {
    let mut guard = bag.write().expect("attribute bag lock poisoned");
    let mut next = guard.as_ref().clone();
    match next.iter_mut().find(|kv| kv.key == attribute.key) {
        Some(existing) => existing.value = merged_value(&existing.value, attribute.value),
        None => next.push(attribute),
    }
    *guard = Arc::new(next);
}

fn merged_value(existing: &Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Array(Array::Bool(left)), Value::Array(Array::Bool(right))) => {
            Value::Array(Array::Bool(concat(left, right)))
        }
        (Value::Array(Array::I64(left)), Value::Array(Array::I64(right))) => {
            Value::Array(Array::I64(concat(left, right)))
        }
        (Value::Array(Array::F64(left)), Value::Array(Array::F64(right))) => {
            Value::Array(Array::F64(concat(left, right)))
        }
        (Value::Array(Array::String(left)), Value::Array(Array::String(right))) => {
            Value::Array(Array::String(concat(left, right)))
        }
        (_, incoming) => incoming,
    }
}

fn concat<T: Clone>(left: &[T], right: Vec<T>) -> Vec<T> {
    let mut merged = left.to_vec();
    merged.extend(right);
    merged
}
