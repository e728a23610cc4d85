//! `Array`: an ordered, mutable sequence of [`Value`].

use std::cell::RefCell;
use std::rc::Rc;

use super::Value;
use crate::error::RuntimeError;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// Resolve a script integer index (may be negative, Python/Ruby-style,
/// counting from the end) to a 0-based offset, or raise `IndexOutOfBounds`.
pub fn resolve_index(index: i64, length: usize) -> Result<usize, RuntimeError> {
    let len = length as i64;
    let resolved = if index < 0 { index + len } else { index };
    if resolved < 0 || resolved >= len {
        return Err(RuntimeError::IndexOutOfBounds { index, length });
    }
    Ok(resolved as usize)
}

impl Value {
    /// `IndexGet(vm, key)` for the variants that support it.
    pub fn index_get(&self, key: &Value) -> Result<Value, RuntimeError> {
        match self {
            Value::Array(arr) => {
                let idx = as_index(key)?;
                let arr = arr.borrow();
                let i = resolve_index(idx, arr.len())?;
                Ok(arr[i].clone())
            }
            Value::Dict(dict) => {
                let k = as_dict_key(key)?;
                dict.borrow()
                    .get(&k)
                    .cloned()
                    .ok_or(RuntimeError::InvalidIndex { key: k })
            }
            Value::SyncDict(dict) => {
                let k = as_dict_key(key)?;
                let guard = dict.read().expect("SyncDict lock poisoned");
                guard.get(&k).cloned().ok_or(RuntimeError::InvalidIndex { key: k })
            }
            Value::KeyValueArray(arr) => {
                let idx = as_index(key)?;
                let arr = arr.borrow();
                let i = resolve_index(idx, arr.len())?;
                Ok(Value::KeyValue(Box::new(arr[i].clone())))
            }
            Value::Str(s) | Value::RawStr(s) => {
                let idx = as_index(key)?;
                let chars: Vec<char> = s.chars().collect();
                let i = resolve_index(idx, chars.len())?;
                Ok(Value::Char(chars[i]))
            }
            other => Err(RuntimeError::NotIterable {
                type_name: other.type_name(),
            }),
        }
    }

    /// `IndexSet(vm, key, value)`.
    pub fn index_set(&self, key: &Value, value: Value) -> Result<(), RuntimeError> {
        match self {
            Value::Array(arr) => {
                let idx = as_index(key)?;
                let mut arr = arr.borrow_mut();
                let len = arr.len();
                let i = resolve_index(idx, len)?;
                arr[i] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                let k = as_dict_key(key)?;
                dict.borrow_mut().insert(k, value);
                Ok(())
            }
            Value::SyncDict(dict) => {
                let k = as_dict_key(key)?;
                let mut guard = dict.write().expect("SyncDict lock poisoned");
                guard.insert(k, value);
                Ok(())
            }
            other => Err(RuntimeError::NotIterable {
                type_name: other.type_name(),
            }),
        }
    }

    /// `IndexDelete`.
    pub fn index_delete(&self, key: &Value) -> Result<(), RuntimeError> {
        match self {
            Value::Array(arr) => {
                let idx = as_index(key)?;
                let mut arr = arr.borrow_mut();
                let len = arr.len();
                let i = resolve_index(idx, len)?;
                arr.remove(i);
                Ok(())
            }
            Value::Dict(dict) => {
                let k = as_dict_key(key)?;
                dict.borrow_mut().remove(&k);
                Ok(())
            }
            Value::SyncDict(dict) => {
                let k = as_dict_key(key)?;
                let mut guard = dict.write().expect("SyncDict lock poisoned");
                guard.remove(&k);
                Ok(())
            }
            other => Err(RuntimeError::NotIterable {
                type_name: other.type_name(),
            }),
        }
    }

    /// `Copy`: a required shallow copy.
    pub fn shallow_copy(&self) -> Value {
        match self {
            Value::Array(arr) => Value::array(arr.borrow().clone()),
            Value::Dict(dict) => Value::Dict(Rc::new(RefCell::new(dict.borrow().clone()))),
            other => other.clone(),
        }
    }

    /// `DeepCopy`: recursive, idempotent on immutable primitives.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(arr) => {
                Value::array(arr.borrow().iter().map(|v| v.deep_copy()).collect())
            }
            Value::Dict(dict) => Value::Dict(Rc::new(RefCell::new(
                dict.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ))),
            Value::KeyValue(kv) => Value::KeyValue(Box::new(super::kv::KeyValue {
                key: kv.key.deep_copy(),
                value: kv.value.deep_copy(),
            })),
            Value::KeyValueArray(arr) => Value::KeyValueArray(Rc::new(RefCell::new(
                arr.borrow()
                    .iter()
                    .map(|kv| super::kv::KeyValue {
                        key: kv.key.deep_copy(),
                        value: kv.value.deep_copy(),
                    })
                    .collect(),
            ))),
            other => other.clone(),
        }
    }

    /// `ValuesGetter`.
    pub fn values(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr.borrow().clone()),
            Value::Dict(dict) => Some(dict.borrow().values().cloned().collect()),
            Value::KeyValueArray(arr) => Some(arr.borrow().iter().map(|kv| kv.value.clone()).collect()),
            _ => None,
        }
    }

    /// `KeysGetter`.
    pub fn keys(&self) -> Option<Vec<Value>> {
        match self {
            Value::Dict(dict) => Some(dict.borrow().keys().map(|k| Value::str(k.clone())).collect()),
            Value::KeyValueArray(arr) => Some(arr.borrow().iter().map(|kv| kv.key.clone()).collect()),
            _ => None,
        }
    }

    /// `ItemsGetter`.
    pub fn items(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(dict) => Some(
                dict.borrow()
                    .iter()
                    .map(|(k, v)| (Value::str(k.clone()), v.clone()))
                    .collect(),
            ),
            Value::KeyValueArray(arr) => {
                Some(arr.borrow().iter().map(|kv| (kv.key.clone(), kv.value.clone())).collect())
            }
            _ => None,
        }
    }
}

fn as_index(key: &Value) -> Result<i64, RuntimeError> {
    match key {
        Value::Int(i) => Ok(*i),
        Value::Uint(u) => Ok(*u as i64),
        other => Err(RuntimeError::IndexTypeError {
            expected: "Int".to_string(),
            actual: other.type_name(),
        }),
    }
}

fn as_dict_key(key: &Value) -> Result<String, RuntimeError> {
    match key {
        Value::Str(s) | Value::RawStr(s) => Ok(s.to_string()),
        other => Err(RuntimeError::IndexTypeError {
            expected: "Str".to_string(),
            actual: other.type_name(),
        }),
    }
}
