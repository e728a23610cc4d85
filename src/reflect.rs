//! The reflection bridge: wraps host-native values as script objects.
//!
//! Four shapes cover the embedding surface: a struct-like host value
//! (`ReflectStruct`), a host map (`ReflectMap`), a host slice or fixed-size
//! array (`ReflectSlice`/`ReflectArray`), and a host function
//! (`ReflectFunc`). A `Converter` table, keyed by the host type's stable
//! Rust type name, supplies field access, iteration, and display for
//! whichever shape an embedder registers.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::object::{NativeClosure, PrinterOptions, Value};

/// The reserved index key that proxies to a `ReflectStruct`'s methods
/// (§4.3: "methods exposed via an index-getter proxy on a reserved key").
/// Indexing a reflected value with this key yields a `ReflectMap`-shaped
/// proxy; indexing *that* by method name yields a bound callable.
pub const RESERVED_METHODS_KEY: &str = "__methods__";

/// What callers actually touch: field/element access plus a display hook.
/// An embedder implements this once per host type and registers it with
/// a [`Converter`].
pub trait ReflectAccess {
    fn type_name(&self) -> &'static str;

    fn shape(&self) -> ReflectShape;

    /// Field or key lookup for `ReflectStruct`/`ReflectMap`.
    fn field(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set_field(&self, _name: &str, _value: Value) -> Result<(), RuntimeError> {
        Err(RuntimeError::TypeError(format!(
            "{} does not support field assignment",
            self.type_name()
        )))
    }

    /// Element access for `ReflectSlice`/`ReflectArray`.
    fn element(&self, _index: usize) -> Option<Value> {
        None
    }

    fn len(&self) -> Option<usize> {
        None
    }

    /// `ReflectSlice::Insert(pos, values...)` (§4.3). Negative positions
    /// count from the end: `-1` inserts before the last element, `-k`
    /// for `k` greater than the current length raises `InvalidIndex`.
    /// `ReflectArray` (fixed length) and every other shape refuse this by
    /// returning `NotCallable`-flavored errors through the default here.
    fn insert(&self, _pos: i64, _values: Vec<Value>) -> Result<(), RuntimeError> {
        Err(RuntimeError::TypeError(format!(
            "{} does not support Insert",
            self.type_name()
        )))
    }

    /// Every field/element name or index, in a stable order, used for
    /// `ValuesGetter`/`KeysGetter`/`ItemsGetter` and iteration.
    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn display(&self, options: &PrinterOptions) -> String;

    /// Invokes a `ReflectFunc`-shaped value. Structs/maps/slices ignore
    /// this.
    fn call(&self, _args: Vec<Value>) -> Result<Value, RuntimeError> {
        Err(RuntimeError::NotCallable {
            type_name: self.type_name().to_string(),
        })
    }

    /// Every method name reachable through the `RESERVED_METHODS_KEY`
    /// proxy, in the same declared-order convention as `field_names`.
    fn method_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invokes a named method with `args`, as reached through the
    /// `RESERVED_METHODS_KEY` proxy. The default rejects every name, the
    /// same way the default `call` rejects a non-`ReflectFunc` shape.
    fn call_method(&self, name: &str, _args: Vec<Value>) -> Result<Value, RuntimeError> {
        Err(RuntimeError::NotCallable {
            type_name: format!("{}.{name}", self.type_name()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectShape {
    Struct,
    Map,
    Slice,
    Array,
    Func,
}

impl fmt::Display for ReflectShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReflectShape::Struct => "ReflectStruct",
            ReflectShape::Map => "ReflectMap",
            ReflectShape::Slice => "ReflectSlice",
            ReflectShape::Array => "ReflectArray",
            ReflectShape::Func => "ReflectFunc",
        };
        write!(f, "{s}")
    }
}

/// The boxed host value carried by `Value::Reflect`.
pub struct ReflectValue {
    access: Rc<dyn ReflectAccess>,
}

impl fmt::Debug for ReflectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReflectValue")
            .field("type_name", &self.access.type_name())
            .field("shape", &self.access.shape())
            .finish()
    }
}

impl ReflectValue {
    pub fn new(access: Rc<dyn ReflectAccess>) -> Self {
        Self { access }
    }

    pub fn type_name(&self) -> &'static str {
        self.access.type_name()
    }

    pub fn shape(&self) -> ReflectShape {
        self.access.shape()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.access.field(name)
    }

    pub fn set_field(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.access.set_field(name, value)
    }

    pub fn element(&self, index: usize) -> Option<Value> {
        self.access.element(index)
    }

    pub fn len(&self) -> Option<usize> {
        self.access.len()
    }

    /// Resolves `pos`'s negative-index semantics (§4.3) against the
    /// current length, then delegates to the shape's `insert`. Positive
    /// positions are bounded by length (an insert at `len` appends); `-1`
    /// inserts before the last element; `-k` for `k` greater than
    /// `length` raises `InvalidIndex`.
    pub fn insert(&self, pos: i64, values: Vec<Value>) -> Result<(), RuntimeError> {
        let len = self.access.len().unwrap_or(0) as i64;
        let resolved = if pos < 0 { len + pos } else { pos };
        if resolved < 0 || resolved > len {
            return Err(RuntimeError::InvalidIndex {
                key: pos.to_string(),
            });
        }
        self.access.insert(resolved, values)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.access.field_names()
    }

    pub fn to_display_string(&self, options: &PrinterOptions) -> String {
        self.access.display(options)
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value, RuntimeError> {
        self.access.call(args)
    }

    /// Builds the `ReflectMap`-shaped value reached by indexing with
    /// `RESERVED_METHODS_KEY`: indexing *it* by method name binds the
    /// receiver into a zero-argument-capture native closure.
    pub fn method_proxy(&self) -> Value {
        Value::Reflect(Rc::new(ReflectValue::new(Rc::new(MethodProxy {
            access: self.access.clone(),
        }))))
    }
}

/// The proxy object `RESERVED_METHODS_KEY` resolves to. Carries no state
/// of its own beyond the receiver it was built from; `field` is the only
/// capability that matters, binding a method name to a callable.
struct MethodProxy {
    access: Rc<dyn ReflectAccess>,
}

impl ReflectAccess for MethodProxy {
    fn type_name(&self) -> &'static str {
        self.access.type_name()
    }

    fn shape(&self) -> ReflectShape {
        ReflectShape::Map
    }

    fn field(&self, name: &str) -> Option<Value> {
        if !self.access.method_names().iter().any(|m| m == name) {
            return None;
        }
        let access = self.access.clone();
        let name = name.to_string();
        Some(Value::Function(Rc::new(NativeClosure {
            name: name.clone(),
            func: Rc::new(move |_vm, call| access.call_method(&name, call.args.flatten())),
        })))
    }

    fn field_names(&self) -> Vec<String> {
        self.access.method_names()
    }

    fn display(&self, _options: &PrinterOptions) -> String {
        format!("{}.{}", self.access.type_name(), RESERVED_METHODS_KEY)
    }
}

/// A registry of converter functions, keyed by host type name, turning
/// a boxed reflect access implementation into a `Value::Reflect`. The VM
/// holds one of these; embedders register converters during setup.
#[derive(Default)]
pub struct ConverterTable {
    converters: std::collections::HashMap<&'static str, Rc<dyn ReflectAccess>>,
}

impl ConverterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, access: Rc<dyn ReflectAccess>) {
        self.converters.insert(access.type_name(), access);
    }

    pub fn get(&self, type_name: &str) -> Option<Rc<dyn ReflectAccess>> {
        self.converters.get(type_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Point {
        x: i64,
        y: i64,
    }

    impl ReflectAccess for Point {
        fn type_name(&self) -> &'static str {
            "Point"
        }

        fn shape(&self) -> ReflectShape {
            ReflectShape::Struct
        }

        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "x" => Some(Value::Int(self.x)),
                "y" => Some(Value::Int(self.y)),
                _ => None,
            }
        }

        fn field_names(&self) -> Vec<String> {
            vec!["x".to_string(), "y".to_string()]
        }

        /// Honors `zeros` (§4.3/§6.4): a zero `y` is omitted unless the
        /// caller asked for it explicitly.
        fn display(&self, options: &PrinterOptions) -> String {
            if self.y == 0 && !options.zeros {
                format!("Point{{x: {}}}", self.x)
            } else {
                format!("Point{{x: {}, y: {}}}", self.x, self.y)
            }
        }
    }

    #[test]
    fn struct_field_access_round_trips() {
        let value = ReflectValue::new(Rc::new(Point { x: 1, y: 2 }));
        assert!(value.field("x").unwrap().equals(&Value::Int(1)));
        assert!(value.field("z").is_none());
    }

    #[test]
    fn display_uses_access_impl() {
        let value = ReflectValue::new(Rc::new(Point { x: 1, y: 2 }));
        assert_eq!(value.to_display_string(&PrinterOptions::default()), "Point{x: 1, y: 2}");
    }

    /// Proves the `PrinterOptions` a caller passes to `Value::Reflect`'s
    /// display actually reaches `ReflectAccess::display`, end to end
    /// through `Value::to_display_string_with_options` — not just the
    /// default every call site used before.
    #[test]
    fn caller_supplied_printer_options_reach_reflected_display() {
        let point = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(Point { x: 5, y: 0 }))));

        assert_eq!(point.to_display_string(), "Point{x: 5}");

        let with_zeros = PrinterOptions {
            zeros: true,
            ..PrinterOptions::default()
        };
        assert_eq!(point.to_display_string_with_options(&with_zeros), "Point{x: 5, y: 0}");
    }

    struct Slice {
        items: RefCell<Vec<i64>>,
    }

    impl ReflectAccess for Slice {
        fn type_name(&self) -> &'static str {
            "Slice"
        }

        fn shape(&self) -> ReflectShape {
            ReflectShape::Slice
        }

        fn element(&self, index: usize) -> Option<Value> {
            self.items.borrow().get(index).map(|i| Value::Int(*i))
        }

        fn len(&self) -> Option<usize> {
            Some(self.items.borrow().len())
        }

        fn display(&self, _options: &PrinterOptions) -> String {
            format!("{:?}", self.items.borrow())
        }

        fn insert(&self, pos: i64, values: Vec<Value>) -> Result<(), RuntimeError> {
            let mut items = self.items.borrow_mut();
            let ints: Vec<i64> = values
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) => i,
                    other => panic!("test slice only holds Int, got {other:?}"),
                })
                .collect();
            items.splice(pos as usize..pos as usize, ints);
            Ok(())
        }
    }

    #[test]
    fn insert_before_last_with_negative_one() {
        let value = ReflectValue::new(Rc::new(Slice {
            items: RefCell::new(vec![1, 2, 3]),
        }));
        value.insert(-1, vec![Value::Int(99)]).unwrap();
        assert!(value.element(2).unwrap().equals(&Value::Int(99)));
        assert!(value.element(3).unwrap().equals(&Value::Int(3)));
    }

    #[test]
    fn insert_past_length_is_invalid_index() {
        let value = ReflectValue::new(Rc::new(Slice {
            items: RefCell::new(vec![1, 2, 3]),
        }));
        let err = value.insert(-5, vec![Value::Int(1)]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidIndex { .. }));
    }

    struct Greeter;

    impl ReflectAccess for Greeter {
        fn type_name(&self) -> &'static str {
            "Greeter"
        }

        fn shape(&self) -> ReflectShape {
            ReflectShape::Struct
        }

        fn display(&self, _options: &PrinterOptions) -> String {
            "Greeter".to_string()
        }

        fn method_names(&self) -> Vec<String> {
            vec!["greet".to_string()]
        }

        fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
            match name {
                "greet" => {
                    let who = match args.first() {
                        Some(Value::Str(s)) | Some(Value::RawStr(s)) => s.to_string(),
                        _ => "world".to_string(),
                    };
                    Ok(Value::str(format!("hello, {who}")))
                }
                _ => Err(RuntimeError::NotCallable {
                    type_name: format!("Greeter.{name}"),
                }),
            }
        }
    }

    #[test]
    fn method_proxy_exposes_registered_methods_only() {
        let value = ReflectValue::new(Rc::new(Greeter));
        let proxy = match value.method_proxy() {
            Value::Reflect(r) => r,
            other => panic!("expected a reflect proxy, got {other:?}"),
        };
        assert_eq!(proxy.field_names(), vec!["greet".to_string()]);
        assert!(proxy.field("missing").is_none());
        assert!(matches!(proxy.field("greet"), Some(Value::Function(_))));
    }

    #[test]
    fn insert_at_length_appends() {
        let value = ReflectValue::new(Rc::new(Slice {
            items: RefCell::new(vec![1, 2]),
        }));
        value.insert(2, vec![Value::Int(3)]).unwrap();
        assert!(value.element(2).unwrap().equals(&Value::Int(3)));
    }
}
