//! The object model: every runtime value is a [`Value`].
//!
//! [`Value`] is a closed enum rather than a `dyn Object` trait object. A
//! capability-query design, where the VM probes an object for the methods
//! it happens to implement, becomes here a set of inherent methods that
//! return `Option`/`Result` depending on whether the receiving variant
//! implements that capability: [`Value::index_get`] returns
//! `Err(RuntimeError::NotIterable { .. })` for variants with no index
//! capability, instead of the VM probing for a method at runtime. The two
//! genuinely open-ended capabilities, reflected native values and
//! first-class iterators, use `Rc<RefCell<dyn Trait>>` internally because
//! their shape is supplied by the embedder or by an adapter chain built at
//! runtime, not known to this enum.

pub mod array;
pub mod callable;
pub mod dict;
pub mod error_value;
pub mod kv;
pub mod ops;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use crate::error::RuntimeError;
use crate::iter::IteratorObject;
use crate::reflect::ReflectValue;

pub use array::ArrayRef;
pub use callable::{
    BuiltinFunction, CallerObjectWithMethods, ClosureInstance, NativeClosure, NativeFn, YieldCallRecord,
};
pub use dict::{DictRef, SyncDictRef};
pub use error_value::ErrorValue;
pub use kv::KeyValue;
use crate::types::Type;

/// Arbitrary-precision decimal, backing the `Decimal` primitive.
///
/// Grounded on the teacher's use of `astro-float` for its arbitrary
/// precision `BigFloat` primitive; reused here for `Decimal` (see
/// DESIGN.md).
pub type Decimal = astro_float::BigFloat;

/// Precision used when widening an `Int`/`Uint`/`Float` operand to
/// `Decimal` for a cross-type `equals` comparison. Matches
/// `ops::DECIMAL_PRECISION` (see DESIGN.md); kept as a separate constant
/// since `ops`'s is private to that module.
const DECIMAL_EQ_PRECISION: usize = 256;

/// Script-level boolean-like singleton distinct from `Bool`: a two-valued
/// `Yes`/`No` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Flag {
    Yes,
    No,
}

impl Flag {
    pub fn is_truthy(self) -> bool {
        matches!(self, Flag::Yes)
    }
}

/// The token set routed to `BinaryOp`/`UnaryOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// Printer options dict: `zeros`, `indent`, `sortKeys`, `anonymous`, `raw`.
/// Threaded through `Representer` uniformly for both reflected native
/// values and script composites.
#[derive(Debug, Clone, Default)]
pub struct PrinterOptions {
    pub zeros: bool,
    pub indent: Option<String>,
    pub sort_keys: SortKeys,
    pub anonymous: bool,
    pub raw: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKeys {
    #[default]
    None,
    Ascending,
    Descending,
}

impl PrinterOptions {
    /// `ParseNamedArgs`: every key is optional. `zeros`/`anonymous`/`raw`
    /// are truthiness-tested like any other named-arg flag; `indent`
    /// accepts either a string indent unit or a truthy flag (defaulting
    /// the unit to two spaces); `sortKeys` is `0`/`1`/`2` (none/ascending/
    /// descending), matching §6.4.
    pub fn from_named_args(named: &crate::args::NamedArgs) -> Result<Self, RuntimeError> {
        let zeros = named.get("zeros").is_some_and(|v| !v.is_falsy());
        let anonymous = named.get("anonymous").is_some_and(|v| !v.is_falsy());
        let raw = named.get("raw").is_some_and(|v| !v.is_falsy());
        let indent = match named.get("indent") {
            None => None,
            Some(Value::Str(s)) | Some(Value::RawStr(s)) => Some(s.to_string()),
            Some(v) if v.is_falsy() => None,
            Some(_) => Some("  ".to_string()),
        };
        let sort_keys = match named.get("sortKeys") {
            None | Some(Value::Int(0)) => SortKeys::None,
            Some(Value::Int(1)) => SortKeys::Ascending,
            Some(Value::Int(2)) => SortKeys::Descending,
            Some(other) => {
                return Err(RuntimeError::ArgumentTypeError {
                    position: 0,
                    expected: "0, 1, or 2".to_string(),
                    actual: other.type_name(),
                })
            }
        };
        Ok(Self { zeros, indent, sort_keys, anonymous, raw })
    }
}

/// The runtime value type. See module docs for why this is a closed enum
/// rather than a `dyn Object`.
#[derive(Debug, Clone)]
pub enum Value {
    // --- Primitives ---
    Nil,
    Bool(bool),
    Flag(Flag),
    Int(i64),
    Uint(u64),
    Float(f64),
    Decimal(Rc<Decimal>),
    Char(char),
    Str(Rc<str>),
    RawStr(Rc<str>),
    Bytes(Rc<[u8]>),
    Buffer(Rc<RefCell<Vec<u8>>>),
    Error(Rc<ErrorValue>),

    // --- Composites ---
    Array(ArrayRef),
    Dict(DictRef),
    SyncDict(SyncDictRef),
    KeyValue(Box<KeyValue>),
    KeyValueArray(Rc<RefCell<Vec<KeyValue>>>),
    KeyValueArrays(Rc<RefCell<Vec<Vec<KeyValue>>>>),

    // --- Callables ---
    BuiltinFunction(Rc<BuiltinFunction>),
    CompiledFunction(Rc<ClosureInstance>),
    Function(Rc<NativeClosure>),
    CallerObjectWithMethods(Rc<CallerObjectWithMethods>),
    Type(Rc<Type>),

    // --- Iteration & reflection bridges (C3, C4) ---
    Iterator(Rc<RefCell<dyn IteratorObject>>),
    Reflect(Rc<ReflectValue>),

    /// The piped-invoke iterator adapter's skip signal (§4.4): a callable
    /// passed to `pipe`/`map_invoke` returns this to mean "no entry this
    /// step", distinct from returning a legitimate `Nil`. Never produced
    /// by any other instruction; scripts obtain it only via the
    /// `skip()` built-in.
    IterSkip,

    /// A pointer to a local/free slot (`GetLocalPtr`/`GetFreePtr`), carried
    /// across the operand stack so `Closure` can capture it. Never visible
    /// to script code or to dispatch: the VM always dereferences it before
    /// handing a value to anything outside the dispatch loop.
    Cell(Rc<RefCell<Value>>),

    /// A tail-continuation signal (§4.6 point 4): a native function
    /// returns this instead of calling back into the VM itself, so the
    /// dispatch loop can perform the next call without growing the host
    /// stack. `NativeFn`'s signature has no other channel for "call this
    /// instead", since it must still return a plain `Value`.
    YieldCall(Box<YieldCallRecord>),
}

/// Simplified type tag, used for dispatch-tree keys and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ValueKind {
    Nil,
    Bool,
    Flag,
    Int,
    Uint,
    Float,
    Decimal,
    Char,
    Str,
    RawStr,
    Bytes,
    Buffer,
    Error,
    Array,
    Dict,
    SyncDict,
    KeyValue,
    KeyValueArray,
    KeyValueArrays,
    Function,
    Type,
    Iterator,
    Reflect(&'static str),
    IterSkip,
    Cell,
    YieldCall,
    Named(String),
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Nil => write!(f, "Nil"),
            ValueKind::Bool => write!(f, "Bool"),
            ValueKind::Flag => write!(f, "Flag"),
            ValueKind::Int => write!(f, "Int"),
            ValueKind::Uint => write!(f, "Uint"),
            ValueKind::Float => write!(f, "Float"),
            ValueKind::Decimal => write!(f, "Decimal"),
            ValueKind::Char => write!(f, "Char"),
            ValueKind::Str => write!(f, "Str"),
            ValueKind::RawStr => write!(f, "RawStr"),
            ValueKind::Bytes => write!(f, "Bytes"),
            ValueKind::Buffer => write!(f, "Buffer"),
            ValueKind::Error => write!(f, "Error"),
            ValueKind::Array => write!(f, "Array"),
            ValueKind::Dict => write!(f, "Dict"),
            ValueKind::SyncDict => write!(f, "SyncDict"),
            ValueKind::KeyValue => write!(f, "KeyValue"),
            ValueKind::KeyValueArray => write!(f, "KeyValueArray"),
            ValueKind::KeyValueArrays => write!(f, "KeyValueArrays"),
            ValueKind::Function => write!(f, "Function"),
            ValueKind::Type => write!(f, "Type"),
            ValueKind::Iterator => write!(f, "Iterator"),
            ValueKind::Reflect(name) => write!(f, "{name}"),
            ValueKind::IterSkip => write!(f, "IterSkip"),
            ValueKind::Cell => write!(f, "Cell"),
            ValueKind::YieldCall => write!(f, "YieldCall"),
            ValueKind::Named(name) => write!(f, "{name}"),
        }
    }
}

/// `Dict`/`SyncDict` iteration order is otherwise unspecified (it's a
/// `HashMap`); `sortKeys` is the only thing that makes printed key order
/// deterministic.
fn sorted_entries<'a>(
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
    sort_keys: SortKeys,
) -> Vec<(&'a String, &'a Value)> {
    let mut entries: Vec<_> = entries.collect();
    match sort_keys {
        SortKeys::None => {}
        SortKeys::Ascending => entries.sort_by(|a, b| a.0.cmp(b.0)),
        SortKeys::Descending => entries.sort_by(|a, b| b.0.cmp(a.0)),
    }
    entries
}

fn render_dict(entries: Vec<(&String, &Value)>, options: &PrinterOptions, depth: usize) -> String {
    let items: Vec<String> = entries
        .into_iter()
        .map(|(k, v)| format!("{}: {}", k, v.represent_at(options, depth + 1)))
        .collect();
    join_bracketed(&items, options, depth, "{", "}")
}

/// Joins already-rendered items inside `open`/`close`, either on one line
/// (`indent` unset) or one item per line indented by `depth + 1` copies of
/// the indent unit, closing bracket indented back to `depth` (`indent`
/// set, §6.4).
fn join_bracketed(items: &[String], options: &PrinterOptions, depth: usize, open: &str, close: &str) -> String {
    if items.is_empty() {
        return format!("{open}{close}");
    }
    match &options.indent {
        None => format!("{open}{}{close}", items.join(", ")),
        Some(unit) => {
            let inner_pad = unit.repeat(depth + 1);
            let outer_pad = unit.repeat(depth);
            let body: Vec<String> = items.iter().map(|item| format!("{inner_pad}{item}")).collect();
            format!("{open}\n{}\n{outer_pad}{close}", body.join(",\n"))
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn dict(entries: Vec<(String, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    pub fn sync_dict(entries: Vec<(String, Value)>) -> Value {
        Value::SyncDict(Arc::new(RwLock::new(entries.into_iter().collect())))
    }

    /// The simplified type tag used for dispatch and error messages.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Flag(_) => ValueKind::Flag,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Float(_) => ValueKind::Float,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Char(_) => ValueKind::Char,
            Value::Str(_) => ValueKind::Str,
            Value::RawStr(_) => ValueKind::RawStr,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Buffer(_) => ValueKind::Buffer,
            Value::Error(_) => ValueKind::Error,
            Value::Array(_) => ValueKind::Array,
            Value::Dict(_) => ValueKind::Dict,
            Value::SyncDict(_) => ValueKind::SyncDict,
            Value::KeyValue(_) => ValueKind::KeyValue,
            Value::KeyValueArray(_) => ValueKind::KeyValueArray,
            Value::KeyValueArrays(_) => ValueKind::KeyValueArrays,
            Value::BuiltinFunction(_)
            | Value::CompiledFunction(_)
            | Value::Function(_)
            | Value::CallerObjectWithMethods(_) => ValueKind::Function,
            Value::Type(_) => ValueKind::Type,
            Value::Iterator(_) => ValueKind::Iterator,
            Value::Reflect(r) => ValueKind::Reflect(r.type_name()),
            Value::IterSkip => ValueKind::IterSkip,
            Value::Cell(_) => ValueKind::Cell,
            Value::YieldCall(_) => ValueKind::YieldCall,
        }
    }

    /// `ToString()` with the default printer options (no indent, unsorted
    /// keys, zero fields omitted).
    pub fn to_display_string(&self) -> String {
        self.to_display_string_with_options(&PrinterOptions::default())
    }

    /// `ToString()`, honoring a caller-supplied printer-options dict
    /// (§4.3/§6.4): `indent` pretty-prints composites across lines,
    /// `sortKeys` orders `Dict`/`SyncDict` keys before printing, `raw`
    /// controls whether nested strings are quoted. `zeros`/`anonymous`
    /// only affect reflected values and are passed straight through to
    /// `ReflectAccess::display`.
    pub fn to_display_string_with_options(&self, options: &PrinterOptions) -> String {
        self.render(options, 0)
    }

    /// `Representer`: a quoted debug form, used when a value appears
    /// nested inside another value's display (e.g. a string inside an
    /// array prints with quotes, the array itself does not), with the
    /// default printer options.
    pub fn represent(&self) -> String {
        self.represent_with_options(&PrinterOptions::default())
    }

    /// `Representer`, honoring a caller-supplied printer-options dict.
    /// `raw` (§6.4) suppresses the quoting a nested `Str` would otherwise
    /// get, the same way a `RawStr` literal prints unquoted.
    pub fn represent_with_options(&self, options: &PrinterOptions) -> String {
        self.represent_at(options, 0)
    }

    fn represent_at(&self, options: &PrinterOptions, depth: usize) -> String {
        match self {
            Value::Str(s) if options.raw => s.to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::Char(c) => format!("{c:?}"),
            other => other.render(options, depth),
        }
    }

    fn render(&self, options: &PrinterOptions, depth: usize) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Flag(Flag::Yes) => "yes".to_string(),
            Value::Flag(Flag::No) => "no".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Uint(u) => u.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Char(c) => c.to_string(),
            Value::Str(s) | Value::RawStr(s) => s.to_string(),
            Value::Bytes(b) => format!("{b:?}"),
            Value::Buffer(b) => format!("{:?}", b.borrow()),
            Value::Error(e) => e.to_display_string(),
            Value::Array(a) => {
                let items: Vec<String> = a
                    .borrow()
                    .iter()
                    .map(|v| v.represent_at(options, depth + 1))
                    .collect();
                join_bracketed(&items, options, depth, "[", "]")
            }
            Value::Dict(d) => {
                let guard = d.borrow();
                render_dict(sorted_entries(guard.iter(), options.sort_keys), options, depth)
            }
            Value::SyncDict(d) => {
                let guard = d.read().expect("SyncDict lock poisoned");
                render_dict(sorted_entries(guard.iter(), options.sort_keys), options, depth)
            }
            Value::KeyValue(kv) => format!(
                "{}: {}",
                kv.key.represent_at(options, depth),
                kv.value.represent_at(options, depth)
            ),
            Value::KeyValueArray(arr) => {
                let items: Vec<String> = arr
                    .borrow()
                    .iter()
                    .map(|kv| {
                        format!(
                            "{}: {}",
                            kv.key.represent_at(options, depth + 1),
                            kv.value.represent_at(options, depth + 1)
                        )
                    })
                    .collect();
                join_bracketed(&items, options, depth, "[", "]")
            }
            Value::KeyValueArrays(arrs) => {
                let items: Vec<String> = arrs
                    .borrow()
                    .iter()
                    .map(|arr| {
                        let inner: Vec<String> = arr
                            .iter()
                            .map(|kv| {
                                format!(
                                    "{}: {}",
                                    kv.key.represent_at(options, depth + 2),
                                    kv.value.represent_at(options, depth + 2)
                                )
                            })
                            .collect();
                        join_bracketed(&inner, options, depth + 1, "[", "]")
                    })
                    .collect();
                join_bracketed(&items, options, depth, "[", "]")
            }
            Value::BuiltinFunction(b) => format!("<builtin {}>", b.name),
            Value::CompiledFunction(c) => format!("<function {}>", c.proto.name),
            Value::Function(f) => format!("<function {}>", f.name),
            Value::CallerObjectWithMethods(c) => format!("<function {}>", c.name),
            Value::Type(t) => format!("<type {}>", t.name),
            Value::Iterator(_) => "<iterator>".to_string(),
            Value::Reflect(r) => r.to_display_string(options),
            Value::IterSkip => "<skip>".to_string(),
            Value::Cell(c) => c.borrow().render(options, depth),
            Value::YieldCall(_) => "<yield-call>".to_string(),
        }
    }

    /// `IsFalsy()`.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Bool(b) => !b,
            Value::Flag(flag) => !flag.is_truthy(),
            Value::Int(i) => *i == 0,
            Value::Uint(u) => *u == 0,
            Value::Float(x) => *x == 0.0,
            Value::Str(s) | Value::RawStr(s) => s.is_empty(),
            Value::Array(a) => a.borrow().is_empty(),
            Value::Dict(d) => d.borrow().is_empty(),
            _ => false,
        }
    }

    /// `Equal(other)`: distinct types compare unequal unless a
    /// type overrides with an explicit cross-type rule. The only
    /// cross-type rule this engine defines is numeric-tower equality
    /// between `Int`/`Uint`/`Float`, matching ordinary script-language
    /// expectations (`1 == 1.0`).
    pub fn equals(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Flag(a), Flag(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Uint(a), Uint(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Uint(a), Float(b)) | (Float(b), Uint(a)) => (*a as f64) == *b,
            (Int(a), Uint(b)) | (Uint(b), Int(a)) => *a >= 0 && (*a as u64) == *b,
            (Decimal(a), Decimal(b)) => matches!(a.cmp(b), Some(0)),
            (Decimal(a), Int(b)) | (Int(b), Decimal(a)) => {
                matches!(a.cmp(&Decimal::from_f64(*b as f64, DECIMAL_EQ_PRECISION)), Some(0))
            }
            (Decimal(a), Uint(b)) | (Uint(b), Decimal(a)) => {
                matches!(a.cmp(&Decimal::from_f64(*b as f64, DECIMAL_EQ_PRECISION)), Some(0))
            }
            (Decimal(a), Float(b)) | (Float(b), Decimal(a)) => {
                matches!(a.cmp(&Decimal::from_f64(*b, DECIMAL_EQ_PRECISION)), Some(0))
            }
            (Char(a), Char(b)) => a == b,
            (Str(a), Str(b)) | (RawStr(a), RawStr(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Error(a), Error(b)) => Rc::ptr_eq(a, b),
            (Array(a), Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Dict(a), Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|v2| v.equals(v2)))
            }
            (KeyValue(a), KeyValue(b)) => a.key.equals(&b.key) && a.value.equals(&b.value),
            (IterSkip, IterSkip) => true,
            _ => false,
        }
    }

    pub fn type_name(&self) -> String {
        self.kind().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_falsy() {
        assert!(Value::Nil.is_falsy());
        assert!(!Value::Int(1).is_falsy());
        assert!(Value::Int(0).is_falsy());
    }

    #[test]
    fn cross_type_equality_is_false_except_numeric_tower() {
        assert!(!Value::Int(1).equals(&Value::Str("1".into())));
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Uint(2).equals(&Value::Int(2)));
    }

    #[test]
    fn decimal_equality_and_numeric_tower_cross_type() {
        let a = Value::Decimal(Rc::new(Decimal::from_f64(1.5, DECIMAL_EQ_PRECISION)));
        let b = Value::Decimal(Rc::new(Decimal::from_f64(1.5, DECIMAL_EQ_PRECISION)));
        assert!(a.equals(&b));
        assert!(a.equals(&Value::Float(1.5)));
        assert!(Value::Int(2).equals(&Value::Decimal(Rc::new(Decimal::from_f64(2.0, DECIMAL_EQ_PRECISION)))));
    }

    #[test]
    fn array_equality_is_structural() {
        let a = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::array(vec![Value::Int(1), Value::Int(2)]);
        assert!(a.equals(&b));
    }

    #[test]
    fn display_quotes_nested_strings_but_not_top_level() {
        let s = Value::str("hi");
        assert_eq!(s.to_display_string(), "hi");
        let arr = Value::array(vec![s]);
        assert_eq!(arr.to_display_string(), "[\"hi\"]");
    }

    #[test]
    fn sort_keys_orders_dict_entries_for_printing() {
        let dict = Value::dict(vec![
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Int(1)),
        ]);
        let ascending = PrinterOptions {
            sort_keys: SortKeys::Ascending,
            ..PrinterOptions::default()
        };
        assert_eq!(dict.to_display_string_with_options(&ascending), "{a: 1, b: 2}");

        let descending = PrinterOptions {
            sort_keys: SortKeys::Descending,
            ..PrinterOptions::default()
        };
        assert_eq!(dict.to_display_string_with_options(&descending), "{b: 2, a: 1}");
    }

    #[test]
    fn indent_pretty_prints_nested_arrays() {
        let arr = Value::array(vec![Value::Int(1), Value::array(vec![Value::Int(2)])]);
        let options = PrinterOptions {
            indent: Some("  ".to_string()),
            ..PrinterOptions::default()
        };
        assert_eq!(
            arr.to_display_string_with_options(&options),
            "[\n  1,\n  [\n    2\n  ]\n]"
        );
    }

    #[test]
    fn raw_suppresses_quoting_of_nested_strings() {
        let arr = Value::array(vec![Value::str("hi")]);
        let raw = PrinterOptions {
            raw: true,
            ..PrinterOptions::default()
        };
        assert_eq!(arr.to_display_string_with_options(&raw), "[hi]");
    }

    #[test]
    fn from_named_args_parses_the_printer_options_dict() {
        let mut named = crate::args::NamedArgs::new();
        named.insert("zeros", Value::Bool(true));
        named.insert("indent", Value::str("  "));
        named.insert("sortKeys", Value::Int(2));
        named.insert("raw", Value::Bool(true));

        let options = PrinterOptions::from_named_args(&named).unwrap();
        assert!(options.zeros);
        assert_eq!(options.indent.as_deref(), Some("  "));
        assert_eq!(options.sort_keys, SortKeys::Descending);
        assert!(options.raw);
        assert!(!options.anonymous);
    }

    #[test]
    fn from_named_args_rejects_an_out_of_range_sort_keys() {
        let mut named = crate::args::NamedArgs::new();
        named.insert("sortKeys", Value::Int(3));
        let err = PrinterOptions::from_named_args(&named).unwrap_err();
        assert!(matches!(err, RuntimeError::ArgumentTypeError { .. }));
    }
}
