//! The VM core (§4.6): frames, the instruction dispatch loop, calls,
//! closures, exceptions, module loading, and the embedding surface
//! (`Vm::run`/`RunOpts`/`Vm::run_compiled_function`/`Setup`/
//! `Vm::call_builtin`).
//!
//! The dispatch loop is flat, not recursive: a `Call` instruction pushes
//! a new [`frame::Frame`] and lets the same `while` loop in [`Vm::drive`]
//! pick up the callee's instructions, rather than this module calling
//! itself. Only re-entrant calls initiated from *outside* the loop --
//! [`Vm::call_value`], used by native builtins and iterator adapters --
//! recurse through a nested `drive()` invocation, since there is no
//! enclosing loop for them to rejoin (§9 "flat dispatch loop").

mod frame;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::rc::Rc;

pub use frame::{Defer, Frame, Handler};

use crate::args::{bind_arguments, Args, Call, NamedArgs};
use crate::builtins::{BuiltinId, BuiltinRegistry};
use crate::bytecode::{Bytecode, CompiledFunction, Constant, Instr};
use crate::error::{FrameTrace, RuntimeError, SetupError, SpannedError};
use crate::iter::{IteratorObject, PairsIterator, SliceIterator, StateIterator};
use crate::object::{
    BuiltinFunction, ClosureInstance, ErrorValue, KeyValue, PrinterOptions, Value, ValueKind,
};
use crate::reflect::{self, ConverterTable, ReflectAccess, ReflectShape, ReflectValue};
use crate::types::TypeRegistry;

const MAX_STACK: usize = 64 * 1024;
const MAX_FRAMES: usize = 4 * 1024;

/// Script global variables, keyed by name. An embedder can supply its own
/// implementation (backed by a database, a config layer, whatever) via
/// `RunOpts::globals`/`Setup`; [`MapGlobals`] is the in-memory default.
pub trait Globals {
    fn get(&self, name: &str) -> Option<Value>;
    fn set(&mut self, name: &str, value: Value);
}

/// The default `Globals`: a plain name -> `Value` map, Nil for anything
/// unset (§4.6 "GetGlobal of an unbound name yields Nil, not an error").
#[derive(Default)]
pub struct MapGlobals {
    map: HashMap<String, Value>,
}

impl Globals for MapGlobals {
    fn get(&self, name: &str) -> Option<Value> {
        self.map.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: Value) {
        self.map.insert(name.to_string(), value);
    }
}

/// Wraps one of the VM's three standard streams as a `ReflectFunc`-shaped
/// value: calling it writes (for `StdOut`/`StdErr`) or reads to EOF (for
/// `StdIn`). This is how the fixed `Value` enum, which has no dedicated
/// "stream" variant, exposes I/O to script code (§4.6 "standard I/O
/// trio") -- through the reflect bridge rather than a new primitive.
enum IoStream {
    In(Rc<RefCell<dyn std::io::Read>>),
    Out(Rc<RefCell<dyn std::io::Write>>),
}

impl ReflectAccess for IoStream {
    fn type_name(&self) -> &'static str {
        "Stream"
    }

    fn shape(&self) -> ReflectShape {
        ReflectShape::Func
    }

    fn display(&self, _options: &PrinterOptions) -> String {
        "<stream>".to_string()
    }

    fn call(&self, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match self {
            IoStream::Out(w) => {
                let text = args.first().map(Value::to_display_string).unwrap_or_default();
                w.borrow_mut()
                    .write_all(text.as_bytes())
                    .map_err(|e| RuntimeError::TypeError(e.to_string()))?;
                Ok(Value::Nil)
            }
            IoStream::In(r) => {
                use std::io::Read;
                let mut buf = String::new();
                r.borrow_mut()
                    .read_to_string(&mut buf)
                    .map_err(|e| RuntimeError::TypeError(e.to_string()))?;
                Ok(Value::str(buf))
            }
        }
    }
}

/// Host-construction-time bundle for [`Vm::new`]: the type lattice, the
/// builtin registry, and the reflect converter table. Separate from
/// [`RunOpts`], which configures a single `Run` rather than the `Vm`
/// itself.
pub struct Setup {
    pub types: TypeRegistry,
    pub builtins: BuiltinRegistry,
    pub converters: ConverterTable,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            types: TypeRegistry::new(),
            builtins: BuiltinRegistry::new(),
            converters: ConverterTable::new(),
        }
    }
}

/// Per-`Run` configuration (§6.2): the top-level positional/named
/// arguments, and optional overrides for globals, the standard streams,
/// and a cancellation callback. Anything left `None` keeps the `Vm`'s
/// current value, so a second `Run` on the same `Vm` without overrides
/// reuses whatever the previous one left behind.
#[derive(Default)]
pub struct RunOpts {
    args: Vec<Value>,
    named: NamedArgs,
    globals: Option<Box<dyn Globals>>,
    stdin: Option<Rc<RefCell<dyn std::io::Read>>>,
    stdout: Option<Rc<RefCell<dyn std::io::Write>>>,
    stderr: Option<Rc<RefCell<dyn std::io::Write>>>,
    cancellation: Option<Rc<dyn Fn() -> bool>>,
}

impl RunOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn named(mut self, named: NamedArgs) -> Self {
        self.named = named;
        self
    }

    pub fn globals(mut self, globals: Box<dyn Globals>) -> Self {
        self.globals = Some(globals);
        self
    }

    pub fn stdin(mut self, stdin: Rc<RefCell<dyn std::io::Read>>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout(mut self, stdout: Rc<RefCell<dyn std::io::Write>>) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn stderr(mut self, stderr: Rc<RefCell<dyn std::io::Write>>) -> Self {
        self.stderr = Some(stderr);
        self
    }

    pub fn cancellation(mut self, cancellation: Rc<dyn Fn() -> bool>) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Everything that can escape `Vm::run`/`Vm::run_compiled_function`: a
/// host-level setup mistake (never catchable by script `catch`) or a
/// runtime error that unwound past the top frame, decorated with its
/// stack trace.
#[derive(Debug)]
pub enum RunError {
    Setup(SetupError),
    Runtime(SpannedError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Setup(e) => write!(f, "{e}"),
            RunError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<SetupError> for RunError {
    fn from(e: SetupError) -> Self {
        RunError::Setup(e)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Tags a `RuntimeError` for display when it is converted into a
/// script-visible `Value::Error` (every non-`UserThrown` variant has no
/// `Value` of its own to carry, since it originates inside the VM, not
/// from a script `throw`).
fn runtime_error_kind(err: &RuntimeError) -> &'static str {
    match err {
        RuntimeError::WrongNumberArguments { .. } => "WrongNumberArguments",
        RuntimeError::ArgumentTypeError { .. } => "ArgumentTypeError",
        RuntimeError::IndexOutOfBounds { .. } => "IndexOutOfBounds",
        RuntimeError::InvalidIndex { .. } => "InvalidIndex",
        RuntimeError::IndexTypeError { .. } => "IndexTypeError",
        RuntimeError::OperandTypeError { .. } => "OperandTypeError",
        RuntimeError::MethodDuplication { .. } => "MethodDuplication",
        RuntimeError::NotInitializable { .. } => "NotInitializable",
        RuntimeError::NotCallable { .. } => "NotCallable",
        RuntimeError::NotIterable { .. } => "NotIterable",
        RuntimeError::TypeError(_) => "TypeError",
        RuntimeError::StackOverflow => "StackOverflow",
        RuntimeError::Interrupted => "Interrupted",
        RuntimeError::UserThrown(_) => "UserThrown",
    }
}

fn error_to_value(err: &RuntimeError) -> Value {
    match err {
        RuntimeError::UserThrown(v) => v.clone(),
        other => Value::Error(Rc::new(ErrorValue::new(runtime_error_kind(other), other.to_string()))),
    }
}

/// A jump instruction's literal target, for the back-edge cancellation
/// check (§5): any jump whose target is `<=` its own instruction index
/// is a loop back-edge.
fn jump_target(instr: &Instr) -> Option<u32> {
    match instr {
        Instr::Jump(t)
        | Instr::JumpFalsy(t)
        | Instr::JumpNil(t)
        | Instr::JumpNotNil(t)
        | Instr::AndJump(t)
        | Instr::OrJump(t) => Some(*t),
        Instr::IterNextElse { entry, els } => Some((*entry).min(*els)),
        _ => None,
    }
}

/// The virtual machine. Owns the operand stack, the call-frame stack,
/// and every piece of host-configurable state (types, builtins,
/// converters, globals, the standard streams, cancellation).
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    pub types: TypeRegistry,
    pub builtins: BuiltinRegistry,
    pub converters: ConverterTable,
    globals: Box<dyn Globals>,
    stdin: Rc<RefCell<dyn std::io::Read>>,
    stdout: Rc<RefCell<dyn std::io::Write>>,
    stderr: Rc<RefCell<dyn std::io::Write>>,
    cancellation: Option<Rc<dyn Fn() -> bool>>,
    running: bool,
    /// Call-site (instruction pointer) -> resolved-method cache for
    /// multiple dispatch (§2 supplement). Keyed by the argument-type
    /// vector too, since one call site can see different argument types
    /// across calls. Only entries resolved with `safe = true` (an actual
    /// dispatch-tree hit, not a default fallback) are cached.
    dispatch_cache: RefCell<HashMap<(usize, Vec<ValueKind>), Value>>,
    /// Pointer-identity-keyed side table backing both `IterInit`'s
    /// in-loop stepping and script-level state-iterator field access
    /// through [`Vm::index_get`] (§4.4 "state-iterator object"); a
    /// `Value::Iterator` carries only the adapter chain, not its
    /// `started` flag, so this table is where that flag actually lives.
    iter_states: RefCell<HashMap<String, StateIterator>>,
    /// The most recently thrown value, consulted by `Throw(false)`
    /// (re-throw) and by a `finally` block's implicit re-raise.
    last_thrown: Option<Value>,
    /// Set when `unwind` jumps into a `finally` clause because of
    /// cancellation rather than a script throw; `SetupFinally` checks
    /// this and re-raises `Interrupted` once the `finally` block
    /// completes, so `finally` runs but cancellation is never silently
    /// absorbed by a sibling `catch` (§5).
    pending_interrupt: bool,
    /// Accumulated innermost-first while an error unwinds with no
    /// handler; consumed by `Vm::run`/`Vm::run_compiled_function` to
    /// build the escaping `SpannedError`'s trace, and cleared whenever a
    /// handler actually catches the error.
    pending_trace: Vec<FrameTrace>,
    bytecode: Option<Rc<Bytecode>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("frames", &self.frames.len())
            .field("stack", &self.stack.len())
            .field("running", &self.running)
            .finish()
    }
}

impl Vm {
    pub fn new(bytecode: Rc<Bytecode>, setup: Setup) -> Self {
        Self::bare(Some(bytecode), setup)
    }

    /// A `Vm` with no loaded bytecode: for unit tests (and iterator/
    /// builtin adapters' own tests) that only need `call_value` against
    /// hand-built callables, never a full `Run`.
    pub fn for_tests() -> Self {
        Self::bare(None, Setup::default())
    }

    fn bare(bytecode: Option<Rc<Bytecode>>, setup: Setup) -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            types: setup.types,
            builtins: setup.builtins,
            converters: setup.converters,
            globals: Box::new(MapGlobals::default()),
            stdin: Rc::new(RefCell::new(std::io::stdin())),
            stdout: Rc::new(RefCell::new(std::io::stdout())),
            stderr: Rc::new(RefCell::new(std::io::stderr())),
            cancellation: None,
            running: false,
            dispatch_cache: RefCell::new(HashMap::new()),
            iter_states: RefCell::new(HashMap::new()),
            last_thrown: None,
            pending_interrupt: false,
            pending_trace: Vec::new(),
            bytecode,
        }
    }

    /// Clears the dispatch cache. Mutating a live dispatch tree (a
    /// builtin or type gaining an overload via `AddCallMethod` while the
    /// `Vm` keeps running) invalidates entries this cache has no way to
    /// detect on its own; native code doing that should call this
    /// afterward (see DESIGN.md).
    pub fn invalidate_dispatch_cache(&self) {
        self.dispatch_cache.borrow_mut().clear();
    }

    /// Registers a native cleanup callback on the currently executing
    /// frame, run (in reverse registration order) on every exit path --
    /// normal return, uncaught-exception unwind, or otherwise (§3.6).
    /// There is no bytecode instruction for this: the compiler (out of
    /// scope) is expected to lower a `defer` statement into a call to a
    /// builtin that in turn calls this.
    pub fn defer_native(&mut self, f: impl FnOnce(&mut Vm) + 'static) {
        if let Some(frame) = self.frames.last_mut() {
            frame.defers.push(Defer::Native(Box::new(f)));
        }
    }

    /// Registers a script callable as a cleanup callback, invoked with
    /// no arguments through `Vm::call_value` on frame exit.
    pub fn defer_script(&mut self, callable: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.defers.push(Defer::Script(callable));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|f| f())
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= MAX_STACK {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow: VM invariant violated")
    }

    fn bytecode(&self) -> &Bytecode {
        self.bytecode.as_deref().expect("instruction requires bytecode loaded via Vm::new")
    }

    fn bytecode_constant(&self, idx: u32) -> Result<Constant, RuntimeError> {
        self.bytecode()
            .constants
            .get(idx)
            .cloned()
            .ok_or_else(|| RuntimeError::TypeError(format!("no such constant {idx}")))
    }

    fn constant_name(&self, idx: u32) -> Result<String, RuntimeError> {
        match self.bytecode_constant(idx)? {
            Constant::Value(Value::Str(s)) | Constant::Value(Value::RawStr(s)) => Ok(s.to_string()),
            _ => Err(RuntimeError::TypeError(format!("constant {idx} is not a global name"))),
        }
    }

    fn stream_value(&self, kind: &str) -> Value {
        let access: Rc<dyn ReflectAccess> = match kind {
            "in" => Rc::new(IoStream::In(self.stdin.clone())),
            "out" => Rc::new(IoStream::Out(self.stdout.clone())),
            _ => Rc::new(IoStream::Out(self.stderr.clone())),
        };
        Value::Reflect(Rc::new(ReflectValue::new(access)))
    }

    // --- indexing -------------------------------------------------------

    /// `IndexGet` for values the closed `Value::index_get` doesn't cover
    /// (iterators and reflected values) plus delegation to it for
    /// everything else -- the VM-level wrapper named in DESIGN.md's
    /// Open Question log.
    pub fn index_get(&mut self, target: &Value, key: &Value) -> Result<Value, RuntimeError> {
        match target {
            Value::Iterator(it) => {
                let name = match key {
                    Value::Str(s) | Value::RawStr(s) => s.to_string(),
                    other => {
                        return Err(RuntimeError::IndexTypeError {
                            expected: "Str".to_string(),
                            actual: other.type_name(),
                        })
                    }
                };
                let pkey = format!("{:p}", Rc::as_ptr(it));
                let mut entry = self
                    .iter_states
                    .borrow_mut()
                    .remove(&pkey)
                    .unwrap_or_else(|| StateIterator::new(it.clone()));
                let result = entry.field(&name, self);
                self.iter_states.borrow_mut().insert(pkey, entry);
                result
            }
            Value::Reflect(r) => match key {
                Value::Str(s) | Value::RawStr(s) if s.as_str() == reflect::RESERVED_METHODS_KEY => {
                    Ok(r.method_proxy())
                }
                Value::Str(s) | Value::RawStr(s) => {
                    r.field(s).ok_or_else(|| RuntimeError::InvalidIndex { key: s.to_string() })
                }
                Value::Int(i) => {
                    let len = r.len().unwrap_or(0);
                    r.element(*i as usize)
                        .ok_or(RuntimeError::IndexOutOfBounds { index: *i, length: len })
                }
                other => Err(RuntimeError::IndexTypeError {
                    expected: "Str|Int".to_string(),
                    actual: other.type_name(),
                }),
            },
            other => other.index_get(key),
        }
    }

    fn slice_index(&self, target: &Value, start: &Value, end: &Value) -> Result<Value, RuntimeError> {
        fn bound(v: &Value, default: i64) -> Result<i64, RuntimeError> {
            match v {
                Value::Nil => Ok(default),
                Value::Int(i) => Ok(*i),
                Value::Uint(u) => Ok(*u as i64),
                other => Err(RuntimeError::IndexTypeError {
                    expected: "Int".to_string(),
                    actual: other.type_name(),
                }),
            }
        }
        match target {
            Value::Array(arr) => {
                let arr = arr.borrow();
                let len = arr.len() as i64;
                let s = bound(start, 0)?.clamp(0, len);
                let e = bound(end, len)?.clamp(s, len);
                Ok(Value::array(arr[s as usize..e as usize].to_vec()))
            }
            Value::Str(s) | Value::RawStr(s) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let a = bound(start, 0)?.clamp(0, len);
                let b = bound(end, len)?.clamp(a, len);
                Ok(Value::str(chars[a as usize..b as usize].iter().collect::<String>()))
            }
            other => Err(RuntimeError::NotIterable { type_name: other.type_name() }),
        }
    }

    // --- iteration --------------------------------------------------------

    fn make_iterator(&self, target: &Value) -> Result<Rc<RefCell<dyn IteratorObject>>, RuntimeError> {
        match target {
            Value::Iterator(it) => Ok(it.clone()),
            Value::Array(arr) => {
                let snapshot = arr.borrow().clone();
                let len = snapshot.len();
                let read: Rc<dyn Fn(usize) -> Value> = Rc::new(move |i| snapshot[i].clone());
                Ok(Rc::new(RefCell::new(SliceIterator::new(len, read))))
            }
            Value::Dict(dict) => {
                let pairs: Vec<(Value, Value)> =
                    dict.borrow().iter().map(|(k, v)| (Value::str(k.clone()), v.clone())).collect();
                Ok(Rc::new(RefCell::new(PairsIterator::new(pairs))))
            }
            Value::SyncDict(dict) => {
                let guard = dict.read().expect("SyncDict lock poisoned");
                let pairs: Vec<(Value, Value)> =
                    guard.iter().map(|(k, v)| (Value::str(k.clone()), v.clone())).collect();
                Ok(Rc::new(RefCell::new(PairsIterator::new(pairs))))
            }
            Value::KeyValueArray(arr) => {
                let pairs: Vec<(Value, Value)> =
                    arr.borrow().iter().map(|kv| (kv.key.clone(), kv.value.clone())).collect();
                Ok(Rc::new(RefCell::new(PairsIterator::new(pairs))))
            }
            Value::Reflect(r) => match r.shape() {
                ReflectShape::Slice | ReflectShape::Array => {
                    let len = r.len().unwrap_or(0);
                    let r2 = r.clone();
                    let read: Rc<dyn Fn(usize) -> Value> = Rc::new(move |i| r2.element(i).unwrap_or(Value::Nil));
                    Ok(Rc::new(RefCell::new(SliceIterator::new(len, read))))
                }
                ReflectShape::Struct | ReflectShape::Map => {
                    let pairs: Vec<(Value, Value)> = r
                        .field_names()
                        .into_iter()
                        .map(|n| {
                            let v = r.field(&n).unwrap_or(Value::Nil);
                            (Value::str(n), v)
                        })
                        .collect();
                    Ok(Rc::new(RefCell::new(PairsIterator::new(pairs))))
                }
                ReflectShape::Func => Err(RuntimeError::NotIterable { type_name: "ReflectFunc".to_string() }),
            },
            other => Err(RuntimeError::NotIterable { type_name: other.type_name() }),
        }
    }

    /// Builds an iterator honoring the `sorted`/`reversed` iterator
    /// options (§4.4, §6.4) for keyed sources (`Dict`/`SyncDict`/a
    /// reflected struct or map) -- the only sources whose natural order
    /// is otherwise unspecified (§9). Other targets have no ordering
    /// ambiguity to resolve and fall back to the unordered path
    /// (`Array`'s order is definitionally its index order, `Range`'s own
    /// `reversed` is parsed separately by `RangeIterator::from_named_args`).
    /// Exposed for an embedder's `items`/`pairs`-style builtin (§1, built-in
    /// content is out of scope) to call when a script passes an options
    /// dict; `IterInit` itself always takes the unordered path since the
    /// bytecode format has no operand slot for these options.
    pub fn make_iterator_with_options(
        &self,
        target: &Value,
        sorted: bool,
        reversed: bool,
    ) -> Result<Rc<RefCell<dyn IteratorObject>>, RuntimeError> {
        let pairs: Option<Vec<(Value, Value)>> = match target {
            Value::Dict(dict) => Some(
                dict.borrow()
                    .iter()
                    .map(|(k, v)| (Value::str(k.clone()), v.clone()))
                    .collect(),
            ),
            Value::SyncDict(dict) => {
                let guard = dict.read().expect("SyncDict lock poisoned");
                Some(guard.iter().map(|(k, v)| (Value::str(k.clone()), v.clone())).collect())
            }
            Value::Reflect(r) if matches!(r.shape(), ReflectShape::Struct | ReflectShape::Map) => Some(
                r.field_names()
                    .into_iter()
                    .map(|n| {
                        let v = r.field(&n).unwrap_or(Value::Nil);
                        (Value::str(n), v)
                    })
                    .collect(),
            ),
            _ => None,
        };
        let Some(mut pairs) = pairs else {
            return self.make_iterator(target);
        };
        if sorted {
            pairs.sort_by(|(k1, _), (k2, _)| k1.to_display_string().cmp(&k2.to_display_string()));
        }
        if reversed {
            pairs.reverse();
        }
        Ok(Rc::new(RefCell::new(PairsIterator::new(pairs))))
    }

    fn iter_key_for(&self, target: &Value) -> Result<String, RuntimeError> {
        match target {
            Value::Iterator(it) => Ok(format!("{:p}", Rc::as_ptr(it))),
            other => Err(RuntimeError::NotIterable { type_name: other.type_name() }),
        }
    }

    fn iter_field_top(&mut self, field: &str) -> Result<Value, RuntimeError> {
        let target = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| RuntimeError::TypeError("iterator instruction on an empty stack".to_string()))?;
        let key = self.iter_key_for(&target)?;
        let it = match &target {
            Value::Iterator(it) => it.clone(),
            _ => unreachable!("iter_key_for already rejected non-iterators"),
        };
        let mut entry = self.iter_states.borrow_mut().remove(&key).unwrap_or_else(|| StateIterator::new(it));
        let result = entry.field(field, self);
        self.iter_states.borrow_mut().insert(key, entry);
        result
    }

    fn iter_step_top(&mut self, field: &str) -> Result<bool, RuntimeError> {
        match self.iter_field_top(field)? {
            Value::Bool(b) => Ok(b),
            _ => Ok(false),
        }
    }

    // --- calls --------------------------------------------------------

    fn take_call_args(&mut self, n_args: u32, n_var_args: u32) -> Call {
        let mut spread_groups: Vec<Vec<Value>> = Vec::with_capacity(n_var_args as usize);
        for _ in 0..n_var_args {
            let v = self.pop();
            match v {
                Value::Array(a) => spread_groups.push(a.borrow().clone()),
                other => spread_groups.push(vec![other]),
            }
        }
        spread_groups.reverse();
        let mut fixed = Vec::with_capacity(n_args as usize);
        for _ in 0..n_args {
            fixed.push(self.pop());
        }
        fixed.reverse();
        let mut args = Args::new();
        args.push_group(fixed);
        for group in spread_groups {
            args.push_group(group);
        }
        Call::new(args, NamedArgs::new(), false)
    }

    /// Resolves `callee` against `call`'s argument types for the
    /// call-site-cached dispatch kinds (`CallerObjectWithMethods`,
    /// `Type`, dispatch-bearing `BuiltinFunction`), else delegates to
    /// [`Vm::resolve_callee`] uncached.
    fn cached_or_resolve(&self, ip: usize, callee: &Value, call: &Call) -> Result<(Value, bool), RuntimeError> {
        let cacheable = matches!(
            callee,
            Value::CallerObjectWithMethods(_) | Value::Type(_) | Value::BuiltinFunction(_)
        );
        if !cacheable {
            return self.resolve_callee(callee, call);
        }
        let types = call.args.types();
        let key = (ip, types);
        if let Some(cached) = self.dispatch_cache.borrow().get(&key) {
            return Ok((cached.clone(), true));
        }
        let (resolved, safe) = self.resolve_callee(callee, call)?;
        if safe {
            self.dispatch_cache.borrow_mut().insert(key, resolved.clone());
        }
        Ok((resolved, safe))
    }

    /// Multiple-dispatch resolution (§4.2): looks the call's positional
    /// argument types up in the callee's dispatch tree (if it has one),
    /// falling back to the callee's default method/constructor. Returns
    /// `(resolved_callable, safe)`, where `safe` means the dispatch tree
    /// already validated argument types for this path (so the callee
    /// should skip re-checking them).
    fn resolve_callee(&self, callee: &Value, call: &Call) -> Result<(Value, bool), RuntimeError> {
        match callee {
            Value::CallerObjectWithMethods(c) => {
                let types = call.args.types();
                if let Some(method) = c.dispatch.borrow().resolve(&types) {
                    return Ok((method, true));
                }
                match c.default.borrow().clone() {
                    Some(default) => Ok((default, false)),
                    None => Err(RuntimeError::NotInitializable { name: c.name.clone() }),
                }
            }
            Value::Type(ty) => {
                if !ty.dispatch.borrow().is_empty() {
                    let types = call.args.types();
                    if let Some(method) = ty.dispatch.borrow().resolve(&types) {
                        return Ok((method, true));
                    }
                }
                Ok((callee.clone(), false))
            }
            Value::BuiltinFunction(b) => {
                if let Some(dispatch) = &b.dispatch {
                    let types = call.args.types();
                    if let Some(method) = dispatch.resolve(&types) {
                        return Ok((method, true));
                    }
                }
                Ok((callee.clone(), false))
            }
            _ => Ok((callee.clone(), false)),
        }
    }

    /// Invokes a fully resolved callable exactly once -- no dispatch, no
    /// yield-call trampolining. Used by both `call_value` (which loops
    /// this for the trampoline) and `dispatch_call_inline` (which jumps
    /// directly into a `CompiledFunction`'s frame rather than recursing).
    fn invoke_once(&mut self, callee: Value, call: Call) -> Result<Value, RuntimeError> {
        match callee {
            Value::BuiltinFunction(b) => (b.func)(self, call),
            Value::Function(f) => (f.func)(self, call),
            Value::CompiledFunction(closure) => self.call_compiled(closure, call),
            Value::Type(ty) => {
                let ctor = ty
                    .constructor
                    .borrow()
                    .clone()
                    .ok_or_else(|| RuntimeError::NotInitializable { name: ty.name.clone() })?;
                ctor(self, call)
            }
            Value::Reflect(r) => {
                let args = self.convert_reflect_args(call.args.flatten())?;
                r.call(args)
            }
            other => Err(RuntimeError::NotCallable { type_name: other.type_name() }),
        }
    }

    /// Checks each positional argument of a `ReflectFunc` call against the
    /// registered converter table (§4.3: "positional arguments are
    /// converted one-by-one using a registered converter table"). A
    /// `Value::Reflect` argument must have a converter registered for its
    /// host type name; anything else (plain script values) passes through
    /// untouched.
    fn convert_reflect_args(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        for arg in &args {
            if let Value::Reflect(r) = arg {
                if self.converters.get(r.type_name()).is_none() {
                    return Err(SetupError::NoConverter {
                        type_name: r.type_name().to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(args)
    }

    /// The general re-entrant call path (§4.6 point 4): resolves,
    /// invokes, and follows the yield-call trampoline until a plain
    /// `Value` comes back. Used by native code (builtins, iterator
    /// adapters, embedders) that needs to call back into the VM; a
    /// `CompiledFunction` callee recurses through a nested `drive()`
    /// here, since there is no enclosing dispatch loop to rejoin.
    pub fn call_value(&mut self, mut callee: Value, mut call: Call) -> Result<Value, RuntimeError> {
        loop {
            let (resolved, safe) = self.resolve_callee(&callee, &call)?;
            call.safe_args = call.safe_args || safe;
            match self.invoke_once(resolved, call)? {
                Value::YieldCall(record) => {
                    callee = record.callee;
                    call = record.call;
                }
                other => return Ok(other),
            }
        }
    }

    /// Binds arguments and runs a `ClosureInstance` to completion via a
    /// nested `drive()` call -- the re-entrant (recursing) counterpart to
    /// the in-loop frame push `dispatch_call_inline` does for `Call`
    /// instructions.
    fn call_compiled(&mut self, closure: Rc<ClosureInstance>, call: Call) -> Result<Value, RuntimeError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        let locals = bind_arguments(&closure.proto, &call)?;
        let target_depth = self.frames.len();
        let base = self.stack.len();
        self.frames.push(Frame::new(closure.proto.clone(), locals, closure.free.clone(), base));
        self.drive(target_depth)
    }

    /// Handles a `Call` instruction in place: resolves the callee
    /// (trampolining through any `YieldCall`s for native/builtin/
    /// constructor callees, which cannot push frames), then either
    /// pushes the resulting `CompiledFunction`'s frame directly (flat,
    /// no Rust recursion -- `drive`'s own loop will execute it) or
    /// pushes a plain `Value` result for anything else.
    fn dispatch_call_inline(&mut self, ip: usize, mut callee: Value, mut call: Call) -> Result<(), RuntimeError> {
        loop {
            let (resolved, safe) = self.cached_or_resolve(ip, &callee, &call)?;
            call.safe_args = call.safe_args || safe;
            match resolved {
                Value::CompiledFunction(closure) => {
                    if self.frames.len() >= MAX_FRAMES {
                        return Err(RuntimeError::StackOverflow);
                    }
                    let locals = bind_arguments(&closure.proto, &call)?;
                    let base = self.stack.len();
                    self.frames.push(Frame::new(closure.proto.clone(), locals, closure.free.clone(), base));
                    return Ok(());
                }
                Value::BuiltinFunction(b) => match (b.func)(self, call)? {
                    Value::YieldCall(record) => {
                        callee = record.callee;
                        call = record.call;
                    }
                    other => return self.push(other),
                },
                Value::Function(f) => match (f.func)(self, call)? {
                    Value::YieldCall(record) => {
                        callee = record.callee;
                        call = record.call;
                    }
                    other => return self.push(other),
                },
                Value::Type(ty) => {
                    let ctor = ty
                        .constructor
                        .borrow()
                        .clone()
                        .ok_or_else(|| RuntimeError::NotInitializable { name: ty.name.clone() })?;
                    match ctor(self, call)? {
                        Value::YieldCall(record) => {
                            callee = record.callee;
                            call = record.call;
                        }
                        other => return self.push(other),
                    }
                }
                Value::Reflect(r) => {
                    let args = self.convert_reflect_args(call.args.flatten())?;
                    return self.push(r.call(args)?);
                }
                other => return Err(RuntimeError::NotCallable { type_name: other.type_name() }),
            }
        }
    }

    // --- frame exit / exceptions ----------------------------------------

    /// Pops the active frame, running its registered defers in reverse
    /// order (§3.6). Used on both normal `Return` and on the
    /// uncaught-exception path through `unwind`, so "every registered
    /// callback runs exactly once" holds regardless of how the frame
    /// exits. A failing defer is logged and otherwise ignored -- it
    /// must never mask whatever value or error is already propagating.
    fn pop_and_run_defers(&mut self) -> Frame {
        let mut frame = self.frames.pop().expect("pop_and_run_defers: no active frame");
        while let Some(defer) = frame.defers.pop() {
            let outcome = match defer {
                Defer::Native(f) => {
                    f(self);
                    Ok(Value::Nil)
                }
                Defer::Script(callable) => self.call_value(callable, Call::positional(Vec::new())),
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "deferred callback raised; ignoring to preserve the frame's exit value");
            }
        }
        frame
    }

    /// Walks the frame stack from the top looking for a handler that
    /// applies to `err`, per §4.6's `Throw` algorithm: a catch clause
    /// not yet entered, else a finally clause not yet entered, else pop
    /// the frame (running its defers) and keep looking in the caller.
    /// Stops and returns `Err` once frames are unwound down to
    /// `target_depth` with nothing found.
    ///
    /// Cancellation (`RuntimeError::Interrupted`) never enters a
    /// `catch` -- only `finally` -- so a script can't swallow a
    /// cancellation signal meant to terminate it (§5); see
    /// `pending_interrupt` and `Instr::SetupFinally`.
    fn unwind(&mut self, err: RuntimeError, target_depth: usize) -> Result<(), RuntimeError> {
        let interrupt = matches!(err, RuntimeError::Interrupted);
        let thrown_value = error_to_value(&err);
        self.last_thrown = Some(thrown_value.clone());
        loop {
            if self.frames.len() <= target_depth {
                return Err(err);
            }
            let handled = {
                let frame = self.frames.last_mut().expect("unwind: frame present");
                let mut target = None;
                if let Some(h) = frame.handlers.last_mut() {
                    if !interrupt {
                        if let Some(catch_ip) = h.catch_ip.filter(|_| !h.catch_entered) {
                            h.catch_entered = true;
                            target = Some((catch_ip, h.stack_depth));
                        }
                    }
                    if target.is_none() {
                        if let Some(finally_ip) = h.finally_ip.filter(|_| !h.finally_entered) {
                            target = Some((finally_ip, h.stack_depth));
                        }
                    }
                }
                target
            };
            if let Some((target_ip, stack_depth)) = handled {
                self.stack.truncate(stack_depth);
                self.stack.push(thrown_value);
                self.frames.last_mut().expect("unwind: frame present").ip = target_ip;
                if interrupt {
                    self.pending_interrupt = true;
                } else {
                    self.pending_trace.clear();
                }
                return Ok(());
            }
            let frame = self.pop_and_run_defers();
            self.pending_trace.push(FrameTrace {
                function_name: frame.func.name.clone(),
                span: frame.func.span_at(frame.ip.saturating_sub(1)),
            });
        }
    }

    // --- single-instruction execution ------------------------------------

    fn step(&mut self, instr: Instr, ip: usize) -> Result<(), RuntimeError> {
        match instr {
            Instr::Constant(idx) => match self.bytecode_constant(idx)? {
                Constant::Value(v) => self.push(v),
                Constant::Function(_) => {
                    Err(RuntimeError::TypeError(format!("constant {idx} is a function, not a value")))
                }
            },
            Instr::Null => self.push(Value::Nil),
            Instr::True => self.push(Value::Bool(true)),
            Instr::False => self.push(Value::Bool(false)),
            Instr::Yes => self.push(Value::Flag(crate::object::Flag::Yes)),
            Instr::No => self.push(Value::Flag(crate::object::Flag::No)),

            Instr::DefineLocal(i) => {
                let v = self.pop();
                self.frames.last_mut().expect("frame present").locals[i as usize] =
                    Rc::new(RefCell::new(v));
                Ok(())
            }
            Instr::GetLocal(i) => {
                let v = self.frames.last().expect("frame present").locals[i as usize].borrow().clone();
                self.push(v)
            }
            Instr::SetLocal(i) => {
                let v = self.pop();
                *self.frames.last().expect("frame present").locals[i as usize].borrow_mut() = v;
                Ok(())
            }
            Instr::GetLocalPtr(i) => {
                let cell = self.frames.last().expect("frame present").locals[i as usize].clone();
                self.push(Value::Cell(cell))
            }
            Instr::GetFree(i) => {
                let v = self.frames.last().expect("frame present").free[i as usize].borrow().clone();
                self.push(v)
            }
            Instr::GetFreePtr(i) => {
                let cell = self.frames.last().expect("frame present").free[i as usize].clone();
                self.push(Value::Cell(cell))
            }
            Instr::GetGlobal(cidx) => {
                let name = self.constant_name(cidx)?;
                let v = self.globals.get(&name).unwrap_or(Value::Nil);
                self.push(v)
            }
            Instr::SetGlobal(cidx) => {
                let name = self.constant_name(cidx)?;
                let v = self.pop();
                self.globals.set(&name, v);
                Ok(())
            }

            Instr::Array(n) => {
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.pop());
                }
                items.reverse();
                self.push(Value::array(items))
            }
            Instr::Map(n) => {
                let mut pairs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let v = self.pop();
                    let k = self.pop();
                    pairs.push((k.to_display_string(), v));
                }
                pairs.reverse();
                self.push(Value::dict(pairs))
            }

            Instr::BinaryOp(op) => {
                let r = self.pop();
                let l = self.pop();
                let result = l.binary_op(op, &r)?;
                self.push(result)
            }
            Instr::Unary(op) => {
                let v = self.pop();
                let result = v.unary_op(op)?;
                self.push(result)
            }
            Instr::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.equals(&b)))
            }
            Instr::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!a.equals(&b)))
            }

            Instr::Jump(t) => {
                self.frames.last_mut().expect("frame present").ip = t as usize;
                Ok(())
            }
            Instr::JumpFalsy(t) => {
                let v = self.pop();
                if v.is_falsy() {
                    self.frames.last_mut().expect("frame present").ip = t as usize;
                }
                Ok(())
            }
            Instr::JumpNil(t) => {
                if matches!(self.stack.last(), Some(Value::Nil)) {
                    self.frames.last_mut().expect("frame present").ip = t as usize;
                }
                Ok(())
            }
            Instr::JumpNotNil(t) => {
                if !matches!(self.stack.last(), Some(Value::Nil)) {
                    self.frames.last_mut().expect("frame present").ip = t as usize;
                }
                Ok(())
            }
            Instr::AndJump(t) => {
                let truthy = !self.stack.last().expect("AndJump: operand present").is_falsy();
                if truthy {
                    self.pop();
                } else {
                    self.frames.last_mut().expect("frame present").ip = t as usize;
                }
                Ok(())
            }
            Instr::OrJump(t) => {
                let falsy = self.stack.last().expect("OrJump: operand present").is_falsy();
                if falsy {
                    self.pop();
                } else {
                    self.frames.last_mut().expect("frame present").ip = t as usize;
                }
                Ok(())
            }

            Instr::Call { n_args, n_var_args } => {
                let call = self.take_call_args(n_args, n_var_args);
                let callee = self.pop();
                self.dispatch_call_inline(ip, callee, call)
            }
            Instr::Return(has_value) => {
                let value = if has_value { self.pop() } else { Value::Nil };
                self.pop_and_run_defers();
                self.push(value)
            }
            Instr::Callee | Instr::Args | Instr::NamedArgs => Ok(()),

            Instr::GetIndex(n) => {
                let mut keys = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    keys.push(self.pop());
                }
                keys.reverse();
                let mut acc = self.pop();
                for key in keys {
                    acc = self.index_get(&acc, &key)?;
                }
                self.push(acc)
            }
            Instr::SliceIndex => {
                let end = self.pop();
                let start = self.pop();
                let target = self.pop();
                let result = self.slice_index(&target, &start, &end)?;
                self.push(result)
            }

            Instr::Closure { const_idx, n_free } => {
                let mut cells = Vec::with_capacity(n_free as usize);
                for _ in 0..n_free {
                    let v = self.pop();
                    let cell = match v {
                        Value::Cell(c) => c,
                        other => Rc::new(RefCell::new(other)),
                    };
                    cells.push(cell);
                }
                cells.reverse();
                let proto = match self.bytecode_constant(const_idx)? {
                    Constant::Function(f) => f,
                    Constant::Value(_) => {
                        return Err(RuntimeError::TypeError(format!(
                            "closure const_idx {const_idx} does not reference a function"
                        )))
                    }
                };
                self.push(Value::CompiledFunction(Rc::new(ClosureInstance { proto, free: cells })))
            }

            Instr::IterInit => {
                let target = self.pop();
                let it = self.make_iterator(&target)?;
                let key = format!("{:p}", Rc::as_ptr(&it));
                self.iter_states.borrow_mut().insert(key, StateIterator::new(it.clone()));
                self.push(Value::Iterator(it))
            }
            Instr::IterNext => {
                let has = self.iter_step_top("next")?;
                self.push(Value::Bool(has))
            }
            Instr::IterNextElse { entry, els } => {
                let has = self.iter_step_top("next")?;
                if has {
                    self.frames.last_mut().expect("frame present").ip = entry as usize;
                } else {
                    self.pop();
                    self.frames.last_mut().expect("frame present").ip = els as usize;
                }
                Ok(())
            }
            Instr::IterKey => {
                let v = self.iter_field_top("k")?;
                self.push(v)
            }
            Instr::IterValue => {
                let v = self.iter_field_top("v")?;
                self.push(v)
            }

            Instr::SetupTry { catch, finally } => {
                let catch_ip = if catch == u32::MAX { None } else { Some(catch as usize) };
                let finally_ip = if finally == u32::MAX { None } else { Some(finally as usize) };
                let stack_depth = self.stack.len();
                self.frames.last_mut().expect("frame present").handlers.push(Handler {
                    catch_ip,
                    finally_ip,
                    stack_depth,
                    catch_entered: false,
                    finally_entered: false,
                });
                Ok(())
            }
            Instr::SetupCatch => {
                if let Some(h) = self.frames.last_mut().expect("frame present").handlers.last_mut() {
                    h.catch_entered = true;
                }
                Ok(())
            }
            Instr::SetupFinally => {
                let handler = self.frames.last_mut().expect("frame present").handlers.pop();
                if let Some(mut h) = handler {
                    h.finally_entered = true;
                }
                if std::mem::take(&mut self.pending_interrupt) {
                    return Err(RuntimeError::Interrupted);
                }
                Ok(())
            }
            Instr::Throw(has_value) => {
                let value = if has_value { self.pop() } else { self.last_thrown.clone().unwrap_or(Value::Nil) };
                self.last_thrown = Some(value.clone());
                Err(RuntimeError::UserThrown(value))
            }

            Instr::LoadModule { const_idx, module_idx } => {
                let idx = module_idx as usize;
                match self.bytecode().module_slot(idx) {
                    Some(cached) => {
                        self.push(cached)?;
                        self.push(Value::Bool(false))
                    }
                    None => {
                        match self.bytecode_constant(const_idx)? {
                            Constant::Function(f) => {
                                self.push(Value::CompiledFunction(Rc::new(ClosureInstance {
                                    proto: f,
                                    free: Vec::new(),
                                })))?;
                            }
                            Constant::Value(v) => self.push(v)?,
                        }
                        self.push(Value::Bool(true))
                    }
                }
            }
            Instr::StoreModule(idx) => {
                let value = self.pop();
                self.bytecode().store_module(idx as usize, value);
                Ok(())
            }

            Instr::StdIn => {
                let v = self.stream_value("in");
                self.push(v)
            }
            Instr::StdOut => {
                let v = self.stream_value("out");
                self.push(v)
            }
            Instr::StdErr => {
                let v = self.stream_value("err");
                self.push(v)
            }
            Instr::GetBuiltin(id) => {
                let b = self
                    .builtins
                    .get(id)
                    .ok_or_else(|| RuntimeError::TypeError(format!("no such builtin {id}")))?;
                self.push(Value::BuiltinFunction(b))
            }

            Instr::Pop => {
                self.pop();
                Ok(())
            }
        }
    }

    /// The flat dispatch loop (§4.6, §9 "flat dispatch loop"): runs
    /// instructions until the frame stack unwinds back down to
    /// `target_depth`, returning the value left on the operand stack by
    /// whichever frame closed that boundary (a `Return`, an implicit
    /// fallthrough-Nil, or an uncaught exception's last handler).
    pub(crate) fn drive(&mut self, target_depth: usize) -> Result<Value, RuntimeError> {
        while self.frames.len() > target_depth {
            let ip = self.frames.last().expect("drive: frame present").ip;
            let maybe_instr = self.frames.last().expect("drive: frame present").func.instructions.get(ip).cloned();
            let instr = match maybe_instr {
                Some(instr) => instr,
                None => {
                    self.pop_and_run_defers();
                    self.push(Value::Nil)?;
                    continue;
                }
            };
            self.frames.last_mut().expect("drive: frame present").ip += 1;

            if let Some(target) = jump_target(&instr) {
                if (target as usize) <= ip && self.is_cancelled() {
                    self.unwind(RuntimeError::Interrupted, target_depth)?;
                    continue;
                }
            }

            if let Err(err) = self.step(instr, ip) {
                self.unwind(err, target_depth)?;
            }
        }
        Ok(self.stack.pop().expect("drive: return value present at frame boundary"))
    }

    // --- embedding surface ------------------------------------------------

    fn apply_opts(&mut self, opts: RunOpts) -> (Vec<Value>, NamedArgs) {
        if let Some(g) = opts.globals {
            self.globals = g;
        }
        if let Some(s) = opts.stdin {
            self.stdin = s;
        }
        if let Some(s) = opts.stdout {
            self.stdout = s;
        }
        if let Some(s) = opts.stderr {
            self.stderr = s;
        }
        self.cancellation = opts.cancellation;
        (opts.args, opts.named)
    }

    /// Binds `args`/`named` against `func`, pushes its frame, and drives
    /// it to completion, converting a panic that escapes the dispatch
    /// loop into a `RunError::Runtime` rather than unwinding past the
    /// embedder (§7 "panics become runtime errors").
    fn execute_top_level(&mut self, func: Rc<CompiledFunction>, args: Vec<Value>, named: NamedArgs) -> Result<Value, RunError> {
        let call = Call::new(Args::positional(args), named, false);
        let locals = bind_arguments(&func, &call).map_err(|e| RunError::Runtime(SpannedError::without_trace(e)))?;
        self.frames.push(Frame::new(func, locals, Vec::new(), 0));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.drive(0)));
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let trace = std::mem::take(&mut self.pending_trace);
                self.frames.clear();
                self.stack.clear();
                Err(RunError::Runtime(SpannedError::new(err, trace)))
            }
            Err(panic) => {
                self.frames.clear();
                self.stack.clear();
                let message = panic_message(&*panic);
                tracing::error!(message = %message, "panic escaped Run");
                Err(RunError::Runtime(SpannedError::without_trace(RuntimeError::TypeError(format!(
                    "internal error: {message}"
                )))))
            }
        }
    }

    /// Runs the loaded `Bytecode`'s main function (§6.2 `Run`). Only one
    /// `Run`/`run_compiled_function` may be active on a `Vm` at a time
    /// (§5) -- a second call while one is in progress gets
    /// `RunError::Setup(SetupError::AlreadyRunning)` rather than
    /// silently queuing.
    pub fn run(&mut self, opts: RunOpts) -> Result<Value, RunError> {
        if self.running {
            return Err(RunError::Setup(SetupError::AlreadyRunning));
        }
        self.running = true;
        let bytecode = match self.bytecode.clone() {
            Some(b) => b,
            None => {
                self.running = false;
                return Err(RunError::Runtime(SpannedError::without_trace(RuntimeError::TypeError(
                    "Vm::run requires bytecode loaded via Vm::new".to_string(),
                ))));
            }
        };
        let (args, named) = self.apply_opts(opts);
        let span = tracing::info_span!("run", function = %bytecode.main_function.name);
        let _enter = span.enter();
        let result = self.execute_top_level(bytecode.main_function.clone(), args, named);
        self.running = false;
        result
    }

    /// Runs a single already-compiled function directly, bypassing
    /// `Bytecode`'s main-function/module machinery (§6.2
    /// `RunCompiledFunction`) -- e.g. re-invoking a callback value an
    /// earlier `Run` handed back to the embedder.
    pub fn run_compiled_function(&mut self, func: Rc<CompiledFunction>, opts: RunOpts) -> Result<Value, RunError> {
        if self.running {
            return Err(RunError::Setup(SetupError::AlreadyRunning));
        }
        self.running = true;
        let (args, named) = self.apply_opts(opts);
        let span = tracing::info_span!("run_compiled_function", function = %func.name);
        let _enter = span.enter();
        let result = self.execute_top_level(func, args, named);
        self.running = false;
        result
    }

    /// Invokes a registered builtin by ID directly (§6.2
    /// `CallBuiltin`), e.g. for an embedder exercising a builtin without
    /// a full script around it.
    pub fn call_builtin(&mut self, id: BuiltinId, call: Call) -> Result<Value, RuntimeError> {
        let b = self
            .builtins
            .get(id)
            .ok_or_else(|| RuntimeError::TypeError(format!("no such builtin id {id}")))?;
        self.call_value(Value::BuiltinFunction(b), call)
    }
}

#[allow(dead_code)]
fn assert_builtin_function_shape(_b: &BuiltinFunction) {}
#[allow(dead_code)]
fn assert_key_value_shape(_k: &KeyValue) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::{BytecodeBuilder, FunctionBuilder};
    use crate::bytecode::{NamedParamInfo, ParamInfo};
    use crate::object::{BinOp, NativeClosure};

    fn vm_with(bytecode: Bytecode) -> Vm {
        Vm::new(Rc::new(bytecode), Setup::default())
    }

    /// S1 (§8): a loop accumulator, `sum := 0; i := 0; while i < 5 { sum
    /// += i; i += 1 }; return sum`, compiled by hand, returns `Int(10)`.
    #[test]
    fn loop_accumulator_reaches_expected_total() {
        let mut bc = BytecodeBuilder::new(crate::bytecode::Constants::new());
        let zero = bc.constants.push_value(Value::Int(0));
        let one = bc.constants.push_value(Value::Int(1));
        let five = bc.constants.push_value(Value::Int(5));

        let mut main = FunctionBuilder::new("main").locals(2);
        main.emit(Instr::Constant(zero)); // sum = 0
        main.emit(Instr::DefineLocal(0));
        main.emit(Instr::Constant(zero)); // i = 0
        main.emit(Instr::DefineLocal(1));
        let loop_start = main.next_index();
        main.emit(Instr::GetLocal(1));
        main.emit(Instr::Constant(five));
        main.emit(Instr::BinaryOp(BinOp::Lt));
        let jump_falsy_idx = main.next_index();
        main.emit(Instr::JumpFalsy(0)); // patched below
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::GetLocal(1));
        main.emit(Instr::BinaryOp(BinOp::Add));
        main.emit(Instr::SetLocal(0));
        main.emit(Instr::GetLocal(1));
        main.emit(Instr::Constant(one));
        main.emit(Instr::BinaryOp(BinOp::Add));
        main.emit(Instr::SetLocal(1));
        main.emit(Instr::Jump(loop_start));
        let after_loop = main.next_index();
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::Return(true));

        let mut func = main.build();
        func.instructions[jump_falsy_idx as usize] = Instr::JumpFalsy(after_loop);

        let bytecode = bc.finish(Rc::new(func));
        let mut vm = vm_with(bytecode);
        let result = vm.run(RunOpts::new()).unwrap();
        assert!(result.equals(&Value::Int(10)));
    }

    /// S2: `try { throw "bad" } catch e { return e }` returns `Str("bad")`.
    #[test]
    fn try_catch_returns_thrown_value() {
        let mut constants = crate::bytecode::Constants::new();
        let bad = constants.push_value(Value::str("bad"));

        let mut main = FunctionBuilder::new("main").locals(1);
        let setup_try_idx = main.next_index();
        main.emit(Instr::SetupTry { catch: 0, finally: u32::MAX }); // patched below
        main.emit(Instr::Constant(bad));
        main.emit(Instr::Throw(true));
        let catch_ip = main.next_index();
        main.emit(Instr::SetupCatch);
        main.emit(Instr::SetLocal(0));
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::Return(true));

        let mut func = main.build();
        func.instructions[setup_try_idx as usize] = Instr::SetupTry { catch: catch_ip, finally: u32::MAX };

        let bytecode = BytecodeBuilder::new(constants).finish(Rc::new(func));
        let mut vm = vm_with(bytecode);
        let result = vm.run(RunOpts::new()).unwrap();
        assert_eq!(result.to_display_string(), "bad");
    }

    /// S3: `function f(a, *rest) { return [a, rest] }; return f(1, 2, 3)`
    /// returns `[1, [2, 3]]`.
    #[test]
    fn variadic_function_collects_rest_into_array() {
        let mut constants = crate::bytecode::Constants::new();

        let mut callee = FunctionBuilder::new("f")
            .locals(2)
            .param(ParamInfo { name: "a".to_string(), accepted: Vec::new(), variadic: false })
            .param(ParamInfo { name: "rest".to_string(), accepted: Vec::new(), variadic: true });
        callee.emit(Instr::GetLocal(0));
        callee.emit(Instr::GetLocal(1));
        callee.emit(Instr::Array(2));
        callee.emit(Instr::Return(true));
        let callee_idx = constants.push_function(callee.build_rc());

        let mut main = FunctionBuilder::new("main").locals(0);
        main.emit(Instr::Closure { const_idx: callee_idx, n_free: 0 });
        main.emit(Instr::Constant(constants.push_value(Value::Int(1))));
        main.emit(Instr::Constant(constants.push_value(Value::Int(2))));
        main.emit(Instr::Constant(constants.push_value(Value::Int(3))));
        main.emit(Instr::Call { n_args: 3, n_var_args: 0 });
        main.emit(Instr::Return(true));

        let bytecode = BytecodeBuilder::new(constants).finish(main.build_rc());
        let mut vm = vm_with(bytecode);
        let result = vm.run(RunOpts::new()).unwrap();
        match result {
            Value::Array(a) => {
                let a = a.borrow();
                assert!(a[0].equals(&Value::Int(1)));
                match &a[1] {
                    Value::Array(rest) => {
                        assert!(rest.borrow()[0].equals(&Value::Int(2)));
                        assert!(rest.borrow()[1].equals(&Value::Int(3)));
                    }
                    other => panic!("expected array, got {other:?}"),
                }
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    /// S4: nil-safe chaining -- `var a; return a?.b.c` on a `Nil` `a`
    /// returns `Nil` without raising.
    #[test]
    fn nil_safe_chaining_short_circuits_without_raising() {
        let mut main = FunctionBuilder::new("main").locals(1);
        main.emit(Instr::Null);
        main.emit(Instr::DefineLocal(0));
        main.emit(Instr::GetLocal(0));
        let end = 0; // patched below
        let jump_idx = main.next_index();
        main.emit(Instr::JumpNil(end));
        main.emit(Instr::Constant(0)); // never reached
        let func_end = main.next_index();
        main.emit(Instr::Return(true));

        let mut func = main.build();
        func.instructions[jump_idx as usize] = Instr::JumpNil(func_end);

        let bytecode = BytecodeBuilder::new(crate::bytecode::Constants::new()).finish(Rc::new(func));
        let mut vm = vm_with(bytecode);
        let result = vm.run(RunOpts::new()).unwrap();
        assert!(matches!(result, Value::Nil));
    }

    /// S6: multi-return destructuring -- `function pair() { return [10,
    /// 20] }; x, y := pair(); return y` returns `Int(20)`.
    #[test]
    fn multi_return_destructuring_binds_second_value() {
        let mut constants = crate::bytecode::Constants::new();
        let ten = constants.push_value(Value::Int(10));
        let twenty = constants.push_value(Value::Int(20));

        let mut pair = FunctionBuilder::new("pair").locals(0);
        pair.emit(Instr::Constant(ten));
        pair.emit(Instr::Constant(twenty));
        pair.emit(Instr::Array(2));
        pair.emit(Instr::Return(true));
        let pair_idx = constants.push_function(pair.build_rc());

        let mut main = FunctionBuilder::new("main").locals(3);
        main.emit(Instr::Closure { const_idx: pair_idx, n_free: 0 });
        main.emit(Instr::Call { n_args: 0, n_var_args: 0 });
        main.emit(Instr::DefineLocal(0)); // hidden array local
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::Constant(0));
        main.emit(Instr::GetIndex(1));
        main.emit(Instr::DefineLocal(1)); // x
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::Constant(constants.push_value(Value::Int(1))));
        main.emit(Instr::GetIndex(1));
        main.emit(Instr::DefineLocal(2)); // y
        main.emit(Instr::GetLocal(2));
        main.emit(Instr::Return(true));

        let bytecode = BytecodeBuilder::new(constants).finish(main.build_rc());
        let mut vm = vm_with(bytecode);
        let result = vm.run(RunOpts::new()).unwrap();
        assert!(result.equals(&Value::Int(20)));
    }

    /// S7: dict iteration visits each of two pairs exactly once.
    #[test]
    fn dict_iteration_visits_each_pair_once() {
        let mut vm = Vm::for_tests();
        let dict = Value::dict(vec![("a".to_string(), Value::Int(1)), ("b".to_string(), Value::Int(2))]);
        let it = vm.make_iterator(&dict).unwrap();
        let mut seen = 0;
        let mut has = crate::iter::vm_iter_init(it.clone(), &mut vm).unwrap();
        while has {
            seen += 1;
            has = crate::iter::vm_iter_next(it.clone(), &mut vm).unwrap();
        }
        assert_eq!(seen, 2);
    }

    /// S8: multiple dispatch -- `f0()` then `f0(i int)` register
    /// distinct overloads; `f0(5)` dispatches to the typed one, `f0()`
    /// to the zero-arg one; re-registering `f0(i int)` without override
    /// raises `MethodDuplication`.
    #[test]
    fn multiple_dispatch_resolves_by_arity_and_rejects_duplicates() {
        let f = Rc::new(CallerObjectWithMethodsHarness::new());
        let zero_arg = Value::Function(Rc::new(NativeClosure {
            name: "f0/0".to_string(),
            func: Rc::new(|_vm, _call| Ok(Value::str("zero"))),
        }));
        let one_arg = Value::Function(Rc::new(NativeClosure {
            name: "f0/1".to_string(),
            func: Rc::new(|_vm, _call| Ok(Value::str("one"))),
        }));
        f.dispatch.borrow_mut().add(&[], zero_arg, false).unwrap();
        f.dispatch.borrow_mut().add(&[vec![ValueKind::Int]], one_arg.clone(), false).unwrap();

        let mut vm = Vm::for_tests();
        let callee = Value::CallerObjectWithMethods(f.clone());
        let got_zero = vm.call_value(callee.clone(), Call::positional(Vec::new())).unwrap();
        assert_eq!(got_zero.to_display_string(), "zero");
        let got_one = vm.call_value(callee, Call::positional(vec![Value::Int(5)])).unwrap();
        assert_eq!(got_one.to_display_string(), "one");

        let err = f.dispatch.borrow_mut().add(&[vec![ValueKind::Int]], one_arg, false).unwrap_err();
        assert!(matches!(err, RuntimeError::MethodDuplication { .. }));
    }

    type CallerObjectWithMethodsHarness = crate::object::CallerObjectWithMethods;

    #[test]
    fn cancellation_is_observed_only_at_back_edges() {
        let mut main = FunctionBuilder::new("main").locals(1);
        main.emit(Instr::Constant(0));
        main.emit(Instr::DefineLocal(0));
        let loop_start = main.next_index();
        main.emit(Instr::GetLocal(0));
        main.emit(Instr::Return(true));
        let _ = loop_start;

        let mut constants = crate::bytecode::Constants::new();
        constants.push_value(Value::Int(1));
        let bytecode = BytecodeBuilder::new(constants).finish(main.build_rc());
        let mut vm = vm_with(bytecode);
        let cancelled = Rc::new(std::cell::Cell::new(true));
        let cancelled_for_closure = cancelled.clone();
        let result = vm
            .run(RunOpts::new().cancellation(Rc::new(move || cancelled_for_closure.get())))
            .unwrap();
        // No back-edge executes in this straight-line function, so cancellation
        // is never observed and the run completes normally.
        assert!(result.equals(&Value::Int(1)));
    }

    #[test]
    fn named_parameter_default_prologue_pattern_binds_when_absent() {
        let mut params_func = FunctionBuilder::new("f")
            .locals(1)
            .named_param(NamedParamInfo { name: "opt".to_string(), variadic: false });
        params_func.emit(Instr::GetLocal(0));
        params_func.emit(Instr::JumpNotNil(0)); // patched below
        let set_default = params_func.next_index();
        params_func.emit(Instr::Constant(0));
        params_func.emit(Instr::SetLocal(0));
        let after = params_func.next_index();
        params_func.emit(Instr::GetLocal(0));
        params_func.emit(Instr::Return(true));

        let mut func = params_func.build();
        func.instructions[1] = Instr::JumpNotNil(after);
        let _ = set_default;

        let mut constants = crate::bytecode::Constants::new();
        constants.push_value(Value::Int(42));
        let bytecode = BytecodeBuilder::new(constants).finish(Rc::new(func.clone()));
        let mut vm = vm_with(bytecode);
        let result = vm.run_compiled_function(Rc::new(func), RunOpts::new()).unwrap();
        assert!(result.equals(&Value::Int(42)));
    }

    struct HostBox(i64);

    impl ReflectAccess for HostBox {
        fn type_name(&self) -> &'static str {
            "HostBox"
        }

        fn shape(&self) -> ReflectShape {
            ReflectShape::Struct
        }

        fn display(&self, _options: &PrinterOptions) -> String {
            format!("HostBox({})", self.0)
        }
    }

    struct Doubler;

    impl ReflectAccess for Doubler {
        fn type_name(&self) -> &'static str {
            "Doubler"
        }

        fn shape(&self) -> ReflectShape {
            ReflectShape::Func
        }

        fn display(&self, _options: &PrinterOptions) -> String {
            "<doubler>".to_string()
        }

        fn call(&self, args: Vec<Value>) -> Result<Value, RuntimeError> {
            match args.first() {
                Some(Value::Reflect(_)) => Ok(Value::Int(1)),
                _ => Err(RuntimeError::TypeError("expected HostBox".to_string())),
            }
        }
    }

    /// §4.3: a `ReflectFunc`'s positional arguments are checked against
    /// the converter table one by one; a `Value::Reflect` argument whose
    /// host type has no registered converter is rejected before the host
    /// function ever sees it.
    #[test]
    fn reflect_func_call_rejects_unregistered_host_argument() {
        let mut vm = Vm::for_tests();
        let doubler = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(Doubler))));
        let arg = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(HostBox(21)))));
        let err = vm.call_value(doubler, Call::positional(vec![arg])).unwrap_err();
        match err {
            RuntimeError::TypeError(msg) => assert!(msg.contains("HostBox")),
            other => panic!("expected a TypeError naming the unconverted type, got {other:?}"),
        }
    }

    #[test]
    fn reflect_func_call_succeeds_once_the_argument_type_is_registered() {
        let mut setup = Setup::default();
        setup.converters.register(Rc::new(HostBox(0)));
        let mut vm = Vm::bare(None, setup);
        let doubler = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(Doubler))));
        let arg = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(HostBox(21)))));
        let result = vm.call_value(doubler, Call::positional(vec![arg])).unwrap();
        assert!(result.equals(&Value::Int(1)));
    }
}
