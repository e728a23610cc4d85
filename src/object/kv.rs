//! `KeyValue`, `KeyValueArray`, `KeyValueArrays`.
//!
//! `KeyValueArray` is ordered and allows duplicate keys, unlike `Dict`,
//! which is why it exists as a separate type rather than reusing `Dict`:
//! named-argument carriers (`NamedArgs`) and `Pairs`-style iteration both
//! need duplicate-tolerant, order-preserving key/value sequences.

use super::Value;

#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: Value,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: Value, value: Value) -> Self {
        Self { key, value }
    }
}
