//! The `Callable` capability's concrete shapes.
//!
//! A native function is represented as `NativeFn`, taking `&mut Vm`
//! explicitly rather than embedding a VM pointer inside the call record
//! itself; an explicit `&mut Vm` parameter is the idiomatic Rust
//! equivalent of a call record that carries a VM handle (see DESIGN.md).

use std::rc::Rc;

use crate::args::Call;
use crate::bytecode::CompiledFunction;
use crate::dispatch::DispatchTree;
use crate::error::RuntimeError;
use crate::object::Value;
use crate::vm::Vm;

pub type NativeFn = Rc<dyn Fn(&mut Vm, Call) -> Result<Value, RuntimeError>>;

/// Wraps a host function. May itself carry a dispatch tree, letting
/// script code add overloads via `AddCallMethod` without touching the
/// registered default.
pub struct BuiltinFunction {
    pub name: String,
    pub func: NativeFn,
    pub dispatch: Option<DispatchTree>,
}

impl std::fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinFunction").field("name", &self.name).finish()
    }
}

impl BuiltinFunction {
    pub fn new(name: impl Into<String>, func: NativeFn) -> Self {
        Self {
            name: name.into(),
            func,
            dispatch: None,
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchTree) -> Self {
        self.dispatch = Some(dispatch);
        self
    }
}

/// Bytecode body plus parameter metadata, bound to the free-variable
/// cells captured by the `Closure` instruction. The immutable
/// bytecode/metadata itself lives in [`CompiledFunction`] (constants-pool
/// side); this struct is the runtime closure instance produced once free
/// variables are bound.
pub struct ClosureInstance {
    pub proto: Rc<CompiledFunction>,
    pub free: Vec<Rc<std::cell::RefCell<Value>>>,
}

impl std::fmt::Debug for ClosureInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureInstance")
            .field("proto", &self.proto.name)
            .field("free_slots", &self.free.len())
            .finish()
    }
}

/// A native closure: a host function value created at runtime (e.g. a
/// partial application), as opposed to `BuiltinFunction`'s process-wide
/// registered callables.
pub struct NativeClosure {
    pub name: String,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeClosure").field("name", &self.name).finish()
    }
}

/// A callable backed purely by a dispatch tree, neither a
/// `BuiltinFunction` nor a `Type`: an overload set built up at script
/// level by repeated `function f(...)` definitions sharing one name.
///
/// `default` is the method invoked when dispatch resolution fails (§4.2:
/// "return the callable's default method (if any)") -- the first
/// registered overload with no type assertions, by convention.
pub struct CallerObjectWithMethods {
    pub name: String,
    pub dispatch: std::cell::RefCell<DispatchTree>,
    pub default: std::cell::RefCell<Option<Value>>,
}

impl std::fmt::Debug for CallerObjectWithMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerObjectWithMethods").field("name", &self.name).finish()
    }
}

impl CallerObjectWithMethods {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatch: std::cell::RefCell::new(DispatchTree::new()),
            default: std::cell::RefCell::new(None),
        }
    }
}

/// The tail-continuation record a `NativeFn` returns (wrapped in
/// `Value::YieldCall`) to hand off to another callable without growing
/// the host call stack (§4.6 point 4, §9 "yield-call trampoline").
#[derive(Debug, Clone)]
pub struct YieldCallRecord {
    pub callee: Value,
    pub call: Call,
}

impl YieldCallRecord {
    pub fn new(callee: Value, call: Call) -> Self {
        Self { callee, call }
    }
}
