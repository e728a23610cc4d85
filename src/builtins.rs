//! The built-in surface (§4.8): the callable registry `GetBuiltin`
//! indexes into, bridging the engine to externally-registered functions.
//!
//! The built-in library's *content* is out of scope (§1) -- this module
//! is the registry mechanics only: registering a `BuiltinFunction` under
//! a stable ID, looking it up by ID for `GetBuiltin`, and letting script
//! code extend a built-in's dispatch tree via `AddCallMethod` the way
//! §4.8 describes.

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::object::{BuiltinFunction, NativeFn, Value, ValueKind};

/// A stable index into the built-in array, assigned at registration
/// time (the fixed enumeration §4.8 refers to). Embedders register
/// built-ins in a known order during `Setup` and compiled bytecode
/// references them by this ID, so the ID space is per-`BuiltinRegistry`
/// instance, not a single process-wide enum.
pub type BuiltinId = u32;

/// Array indexed by `BuiltinId`; also resolves a built-in by name for
/// embedders that register by name and let the compiler (out of scope)
/// assign IDs.
#[derive(Default)]
pub struct BuiltinRegistry {
    builtins: Vec<Rc<BuiltinFunction>>,
    by_name: std::collections::HashMap<String, BuiltinId>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: NativeFn) -> BuiltinId {
        let name = name.into();
        let id = self.builtins.len() as BuiltinId;
        self.builtins.push(Rc::new(BuiltinFunction::new(name.clone(), func)));
        self.by_name.insert(name, id);
        id
    }

    pub fn get(&self, id: BuiltinId) -> Option<Rc<BuiltinFunction>> {
        self.builtins.get(id as usize).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Rc<BuiltinFunction>> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn id_of(&self, name: &str) -> Option<BuiltinId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.builtins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty()
    }

    /// `AddCallMethod`: installs `method` on built-in `id`'s dispatch
    /// tree for `types_list`. Since `BuiltinFunction` is shared behind an
    /// `Rc` once registered, mutating its dispatch tree in place would
    /// require interior mutability this crate doesn't give
    /// `BuiltinFunction`; instead this replaces the registry slot with a
    /// fresh `BuiltinFunction` carrying the extended tree, leaving
    /// already-cloned `Rc<BuiltinFunction>` handles (e.g. a closure that
    /// captured the old one) pointing at the pre-extension snapshot --
    /// acceptable because built-ins are looked up by ID/name on every
    /// `GetBuiltin`, never cached long-term by script code.
    pub fn add_call_method(
        &mut self,
        id: BuiltinId,
        types_list: &[Vec<ValueKind>],
        method: Value,
        override_existing: bool,
    ) -> Result<(), RuntimeError> {
        let current = self
            .builtins
            .get(id as usize)
            .ok_or_else(|| RuntimeError::TypeError(format!("no such builtin id {id}")))?
            .clone();
        let mut dispatch = current.dispatch.clone().unwrap_or_default();
        dispatch.add(types_list, method, override_existing)?;
        let replacement = Rc::new(BuiltinFunction {
            name: current.name.clone(),
            func: current.func.clone(),
            dispatch: Some(dispatch),
        });
        self.builtins[id as usize] = replacement;
        Ok(())
    }
}
