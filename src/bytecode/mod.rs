//! The bytecode format (§4.5, §6.1): instruction encoding, the constants
//! pool, compiled-function metadata, and the module table the VM
//! consumes.
//!
//! Rather than a packed byte stream with a per-position fixed-width
//! operand table, instructions are a flat `Vec<Instr>` -- the idiomatic
//! Rust shape for "fixed-opcode / variable-length-operand records" is an
//! enum, the same choice the teacher's own intermediate representation
//! makes (`vm::instr::Instr`). Branch operands are therefore absolute
//! indices into this vector rather than absolute byte offsets; this is a
//! representational substitution only; see DESIGN.md for why it does not
//! change observable semantics.

pub mod builder;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::object::{BinOp, Flag, UnOp, Value, ValueKind};
use crate::span::Span;

/// One instruction. Variants are grouped to mirror §4.5's opcode table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Instr {
    // --- Constants ---
    Constant(u32),
    Null,
    True,
    False,
    Yes,
    No,

    // --- Locals / frees / globals ---
    DefineLocal(u32),
    GetLocal(u32),
    SetLocal(u32),
    GetLocalPtr(u32),
    GetFree(u32),
    GetFreePtr(u32),
    GetGlobal(u32),
    SetGlobal(u32),

    // --- Composites ---
    /// `n` = number of values on the stack to collect into the array.
    Array(u32),
    /// `n` = number of key+value pairs on the stack (so `2n` values).
    Map(u32),

    // --- Arithmetic / logic ---
    BinaryOp(BinOp),
    Unary(UnOp),
    Equal,
    NotEqual,

    // --- Control ---
    Jump(u32),
    JumpFalsy(u32),
    JumpNil(u32),
    JumpNotNil(u32),
    /// Pops if truthy (logical `&&` short-circuit).
    AndJump(u32),
    /// Pops if falsy (logical `||` short-circuit).
    OrJump(u32),

    // --- Calls ---
    Call { n_args: u32, n_var_args: u32 },
    Return(bool),
    /// Reserved call-record reflection opcodes (§4.5): no end-to-end
    /// scenario or other section of the spec defines behavior for these
    /// beyond what `Call`/argument binding already cover, so this VM
    /// treats them as no-ops (see DESIGN.md Open Question log).
    Callee,
    Args,
    NamedArgs,

    // --- Indexing ---
    GetIndex(u32),
    SliceIndex,

    // --- Closures ---
    Closure { const_idx: u32, n_free: u32 },

    // --- Iteration ---
    IterInit,
    IterNext,
    IterNextElse { entry: u32, els: u32 },
    IterKey,
    IterValue,

    // --- Exceptions ---
    SetupTry { catch: u32, finally: u32 },
    SetupCatch,
    SetupFinally,
    Throw(bool),

    // --- Modules ---
    LoadModule { const_idx: u32, module_idx: u32 },
    StoreModule(u32),

    // --- I/O ---
    StdIn,
    StdOut,
    StdErr,
    GetBuiltin(u32),

    // --- Stack ---
    Pop,
}

/// A positional parameter's binding metadata (§3.4, §4.7): its name, the
/// accept-type set (`empty` = no assertion, matching the `[type1|type2|
/// ...]` serialized form of §6.1), and whether it is the trailing
/// variadic parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub accepted: Vec<ValueKind>,
    pub variadic: bool,
}

/// A named parameter's binding metadata. Defaults are not stored here --
/// per §4.7 they are compiled into the function's own prologue
/// (`JumpNotNil` + constant load + `SetLocal`), so this crate never
/// evaluates a default expression itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedParamInfo {
    pub name: String,
    pub variadic: bool,
}

/// Bytecode body plus parameter metadata and the source map (§3.4).
/// Immutable once constructed; `object::callable::ClosureInstance` binds
/// free-variable cells to one of these to produce a callable runtime
/// value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub instructions: Vec<Instr>,
    pub num_locals: usize,
    pub params: Vec<ParamInfo>,
    pub named_params: Vec<NamedParamInfo>,
    pub num_free: usize,
    pub source_map: Vec<Option<Span>>,
}

impl CompiledFunction {
    pub fn span_at(&self, ip: usize) -> Option<Span> {
        self.source_map.get(ip).copied().flatten()
    }
}

/// One entry of the constants pool (§3.5): either a plain `Value` (a
/// literal, a default expression's value, a global's name as a `Str`)
/// or a nested `CompiledFunction` referenced by `Closure`/`GetBuiltin`-
/// adjacent instructions that build callables.
#[derive(Debug, Clone)]
pub enum Constant {
    Value(Value),
    Function(Rc<CompiledFunction>),
}

/// Indexable by opcode operand (`Constant idx`, `Closure cidx`, ...).
#[derive(Debug, Clone, Default)]
pub struct Constants {
    pool: Vec<Constant>,
}

/// The literal subset of `Value` a compiled constants pool ever actually
/// holds (§6.1). A compiler only ever emits literals, default-argument
/// values, and name strings into the pool -- never a closure, iterator,
/// or reflect bridge, since those are built by instructions at run time,
/// not stored ready-made. `Decimal`/`Buffer`/the object-graph types carry
/// no serializable representation here and are rejected rather than
/// silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LiteralValue {
    Nil,
    Bool(bool),
    Flag(Flag),
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<LiteralValue>),
    Dict(Vec<(String, LiteralValue)>),
}

impl LiteralValue {
    fn try_from_value(value: &Value) -> Result<LiteralValue, BytecodeSerError> {
        Ok(match value {
            Value::Nil => LiteralValue::Nil,
            Value::Bool(b) => LiteralValue::Bool(*b),
            Value::Flag(f) => LiteralValue::Flag(*f),
            Value::Int(n) => LiteralValue::Int(*n),
            Value::Uint(n) => LiteralValue::Uint(*n),
            Value::Float(n) => LiteralValue::Float(*n),
            Value::Char(c) => LiteralValue::Char(*c),
            Value::Str(s) | Value::RawStr(s) => LiteralValue::Str(s.to_string()),
            Value::Bytes(b) => LiteralValue::Bytes(b.to_vec()),
            Value::Array(arr) => {
                let items = arr
                    .borrow()
                    .iter()
                    .map(LiteralValue::try_from_value)
                    .collect::<Result<_, _>>()?;
                LiteralValue::Array(items)
            }
            Value::Dict(dict) => {
                let mut pairs = dict
                    .borrow()
                    .iter()
                    .map(|(k, v)| LiteralValue::try_from_value(v).map(|lv| (k.clone(), lv)))
                    .collect::<Result<Vec<_>, _>>()?;
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                LiteralValue::Dict(pairs)
            }
            other => {
                return Err(BytecodeSerError::NonLiteralConstant {
                    type_name: other.type_name(),
                })
            }
        })
    }

    fn into_value(self) -> Value {
        match self {
            LiteralValue::Nil => Value::Nil,
            LiteralValue::Bool(b) => Value::Bool(b),
            LiteralValue::Flag(f) => Value::Flag(f),
            LiteralValue::Int(n) => Value::Int(n),
            LiteralValue::Uint(n) => Value::Uint(n),
            LiteralValue::Float(n) => Value::Float(n),
            LiteralValue::Char(c) => Value::Char(c),
            LiteralValue::Str(s) => Value::str(s),
            LiteralValue::Bytes(b) => Value::Bytes(Rc::from(b.into_boxed_slice())),
            LiteralValue::Array(items) => {
                let values: Vec<Value> = items.into_iter().map(LiteralValue::into_value).collect();
                Value::Array(Rc::new(RefCell::new(values)))
            }
            LiteralValue::Dict(pairs) => {
                let map: HashMap<String, Value> =
                    pairs.into_iter().map(|(k, v)| (k, v.into_value())).collect();
                Value::Dict(Rc::new(RefCell::new(map)))
            }
        }
    }
}

/// What can go wrong turning a `Bytecode` into, or back out of, one of
/// its wire encodings.
#[derive(Debug)]
pub enum BytecodeSerError {
    NonLiteralConstant { type_name: String },
    Bincode(bincode::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for BytecodeSerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeSerError::NonLiteralConstant { type_name } => write!(
                f,
                "constant pool holds a {type_name}, which has no serializable representation"
            ),
            BytecodeSerError::Bincode(e) => write!(f, "{e}"),
            BytecodeSerError::Json(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BytecodeSerError {}

impl From<bincode::Error> for BytecodeSerError {
    fn from(e: bincode::Error) -> Self {
        BytecodeSerError::Bincode(e)
    }
}

impl From<serde_json::Error> for BytecodeSerError {
    fn from(e: serde_json::Error) -> Self {
        BytecodeSerError::Json(e)
    }
}

/// On the wire a `Constant` is a literal-or-function tag; in memory it's
/// a plain `Value` for the literal case, so this round-trips through
/// `LiteralValue` rather than deriving `Serialize` on `Constant` itself.
impl Serialize for Constant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Constant::Value(v) => {
                let literal = LiteralValue::try_from_value(v).map_err(S::Error::custom)?;
                serializer.serialize_newtype_variant("Constant", 0, "Value", &literal)
            }
            Constant::Function(f) => {
                serializer.serialize_newtype_variant("Constant", 1, "Function", f.as_ref())
            }
        }
    }
}

impl<'de> Deserialize<'de> for Constant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        enum Repr {
            Value(LiteralValue),
            Function(CompiledFunction),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Value(lit) => Constant::Value(lit.into_value()),
            Repr::Function(f) => Constant::Function(Rc::new(f)),
        })
    }
}

impl Serialize for Constants {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.pool.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Constants {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Constants {
            pool: Vec::deserialize(deserializer)?,
        })
    }
}

impl Constants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_value(&mut self, value: Value) -> u32 {
        self.pool.push(Constant::Value(value));
        (self.pool.len() - 1) as u32
    }

    pub fn push_function(&mut self, func: Rc<CompiledFunction>) -> u32 {
        self.pool.push(Constant::Function(func));
        (self.pool.len() - 1) as u32
    }

    pub fn get(&self, idx: u32) -> Option<&Constant> {
        self.pool.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// One source file kept for diagnostics (§6.1): its text and the byte
/// offset each line begins at, so a `Span`'s byte range can be sliced
/// back into `line:col` plus a context window (§6.3).
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub source: String,
    line_offsets: Vec<usize>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let mut line_offsets = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_offsets.push(i + 1);
            }
        }
        Self {
            name: name.into(),
            source,
            line_offsets,
        }
    }

    /// Returns the `(start, end)` zero-indexed lines to print for
    /// `span`, expanded by `up`/`down` lines and clamped to the file.
    pub fn context_lines(&self, span: Span, up: usize, down: usize) -> Vec<&str> {
        let start_line = span.start_line.saturating_sub(1);
        let lo = start_line.saturating_sub(up);
        let hi = (span.end_line.saturating_sub(1) + down).min(self.line_offsets.len().saturating_sub(1));
        let lines: Vec<&str> = self.source.lines().collect();
        lines
            .get(lo..=hi.min(lines.len().saturating_sub(1)))
            .unwrap_or(&[])
            .to_vec()
    }
}

/// Keyed file-ID -> source text, for position recovery across the whole
/// program (a `CompiledFunction`'s source map stores spans, not file
/// IDs directly, so multi-file programs key file text by the function
/// owning each span -- out of scope here since the compiler is external;
/// this engine supports the common single/known-file embedding case and
/// lets embedders register one `SourceFile` per logical unit).
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    files: Vec<SourceFile>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, file: SourceFile) -> u32 {
        self.files.push(file);
        (self.files.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<&SourceFile> {
        self.files.get(id as usize)
    }
}

/// The serializable artifact (§6.1): constants, the main compiled
/// function, and the module table. `modules` lives on `Bytecode` itself,
/// not on `Vm` (§5 "Module cache: per-Bytecode"), cached behind a
/// `RefCell` so multiple `Vm`s sharing one `Rc<Bytecode>` observe each
/// other's first-load writes; the embedder is responsible for
/// serializing concurrent first loads across VMs sharing one `Bytecode`,
/// per §5.
#[derive(Debug)]
pub struct Bytecode {
    pub constants: Constants,
    pub main_function: Rc<CompiledFunction>,
    modules: RefCell<Vec<Option<Value>>>,
}

impl Bytecode {
    pub fn new(constants: Constants, main_function: Rc<CompiledFunction>, num_modules: usize) -> Self {
        Self {
            constants,
            main_function,
            modules: RefCell::new(vec![None; num_modules]),
        }
    }

    pub fn num_modules(&self) -> usize {
        self.modules.borrow().len()
    }

    pub fn module_slot(&self, idx: usize) -> Option<Value> {
        self.modules.borrow().get(idx).cloned().flatten()
    }

    /// Caches `value` into slot `idx`, exactly once per slot -- later
    /// writes to an already-filled slot are refused so the module-once
    /// invariant (§8 invariant 3) holds even if a caller races a
    /// `LoadModule`/`StoreModule` pair.
    pub fn store_module(&self, idx: usize, value: Value) {
        let mut modules = self.modules.borrow_mut();
        if let Some(slot) = modules.get_mut(idx) {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }

    /// Encodes the artifact with `bincode`: constants, the main function,
    /// and the module table's *length* only -- the cache itself is
    /// runtime state (§5) and comes back empty, as a fresh load would.
    pub fn to_bincode(&self) -> Result<Vec<u8>, BytecodeSerError> {
        Ok(bincode::serialize(&BytecodeWire::from(self))?)
    }

    pub fn from_bincode(bytes: &[u8]) -> Result<Bytecode, BytecodeSerError> {
        let wire: BytecodeWire = bincode::deserialize(bytes)?;
        Ok(wire.into())
    }

    /// Same artifact, as human-readable JSON -- useful for diffing
    /// compiled output across compiler versions.
    pub fn to_json(&self) -> Result<String, BytecodeSerError> {
        Ok(serde_json::to_string(&BytecodeWire::from(self))?)
    }

    pub fn from_json(text: &str) -> Result<Bytecode, BytecodeSerError> {
        let wire: BytecodeWire = serde_json::from_str(text)?;
        Ok(wire.into())
    }
}

#[derive(Serialize, Deserialize)]
struct BytecodeWire {
    constants: Constants,
    main_function: CompiledFunction,
    num_modules: usize,
}

impl From<&Bytecode> for BytecodeWire {
    fn from(bytecode: &Bytecode) -> Self {
        BytecodeWire {
            constants: bytecode.constants.clone(),
            main_function: (*bytecode.main_function).clone(),
            num_modules: bytecode.num_modules(),
        }
    }
}

impl From<BytecodeWire> for Bytecode {
    fn from(wire: BytecodeWire) -> Self {
        Bytecode::new(wire.constants, Rc::new(wire.main_function), wire.num_modules)
    }
}
