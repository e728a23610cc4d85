//! Script-visible types and the registry that maps values to them.
//!
//! `Type` is the runtime representation produced by declaring a type at
//! script level, or by registering a reflected host type; `TypeRegistry`
//! owns the set of known types and resolves a `Value` to its `Type`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::dispatch::DispatchTree;
use crate::error::RuntimeError;
use crate::object::{NativeFn, Value, ValueKind};

/// Names of the primitive types every `TypeRegistry` preregisters,
/// parented to `Any`. A `Lazy` static rather than an inline array literal
/// in `TypeRegistry::new`, matching the teacher's own static-registry
/// pattern for fixed name tables (`stdlib_loader.rs`/`base_loader.rs`).
static PRIMITIVE_TYPE_NAMES: Lazy<[&str; 22]> = Lazy::new(|| {
    [
        "Nil",
        "Bool",
        "Flag",
        "Int",
        "Uint",
        "Float",
        "Decimal",
        "Char",
        "Str",
        "RawStr",
        "Bytes",
        "Buffer",
        "Error",
        "Array",
        "Dict",
        "SyncDict",
        "KeyValue",
        "KeyValueArray",
        "KeyValueArrays",
        "Function",
        "Type",
        "Iterator",
    ]
});

/// A script type: a name, an optional parent forming a single-inheritance
/// lattice rooted at `Any`, an optional constructor, a dispatch tree of
/// methods attached to the type, and a bag of static slots.
pub struct Type {
    pub name: String,
    pub parent: Option<Rc<Type>>,
    pub constructor: RefCell<Option<NativeFn>>,
    pub dispatch: RefCell<DispatchTree>,
    pub slots: RefCell<HashMap<String, Value>>,
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Type")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| &p.name))
            .finish()
    }
}

impl Type {
    pub fn new(name: impl Into<String>, parent: Option<Rc<Type>>) -> Rc<Type> {
        Rc::new(Type {
            name: name.into(),
            parent,
            constructor: RefCell::new(None),
            dispatch: RefCell::new(DispatchTree::new()),
            slots: RefCell::new(HashMap::new()),
        })
    }

    /// Walks the parent chain; every type is a subtype of itself and of
    /// every ancestor up to (and including) `Any`.
    pub fn is_subtype_of(self: &Rc<Type>, other: &Rc<Type>) -> bool {
        let mut current = Some(self.clone());
        while let Some(t) = current {
            if Rc::ptr_eq(&t, other) {
                return true;
            }
            current = t.parent.clone();
        }
        false
    }

    pub fn get_slot(&self, name: &str) -> Option<Value> {
        self.slots.borrow().get(name).cloned()
    }

    pub fn set_slot(&self, name: impl Into<String>, value: Value) {
        self.slots.borrow_mut().insert(name.into(), value);
    }
}

/// Owns every known `Type`, keyed by name, plus a reverse map from
/// reflected host type names (`ValueKind::Reflect`) to the script `Type`
/// an embedder registered for them.
pub struct TypeRegistry {
    by_name: RefCell<HashMap<String, Rc<Type>>>,
    reflect_by_host_name: RefCell<HashMap<&'static str, Rc<Type>>>,
    any: Rc<Type>,
}

impl TypeRegistry {
    /// Builds a registry with the primitive type lattice already
    /// registered, all parented to `Any`.
    pub fn new() -> Self {
        let any = Type::new("Any", None);
        let registry = TypeRegistry {
            by_name: RefCell::new(HashMap::new()),
            reflect_by_host_name: RefCell::new(HashMap::new()),
            any: any.clone(),
        };
        registry.by_name.borrow_mut().insert("Any".to_string(), any);
        for name in PRIMITIVE_TYPE_NAMES.iter() {
            registry.register(*name, None).expect("unique primitive name");
        }
        registry
    }

    /// Registers a new type. `parent_name` defaults to `Any` when `None`.
    /// Errors if a type with this name already exists.
    pub fn register(
        &self,
        name: impl Into<String>,
        parent_name: Option<&str>,
    ) -> Result<Rc<Type>, RuntimeError> {
        let name = name.into();
        if self.by_name.borrow().contains_key(&name) {
            return Err(RuntimeError::TypeError(format!(
                "type {name} is already registered"
            )));
        }
        let parent = match parent_name {
            Some(p) => Some(self.get(p).ok_or_else(|| {
                RuntimeError::TypeError(format!("unknown parent type {p}"))
            })?),
            None if name == "Any" => None,
            None => Some(self.any.clone()),
        };
        let ty = Type::new(name.clone(), parent);
        self.by_name.borrow_mut().insert(name, ty.clone());
        Ok(ty)
    }

    /// Associates a reflected host type (identified by its stable Rust
    /// type name) with a script `Type`, so values reflected from that
    /// host type resolve to it for dispatch purposes.
    pub fn register_reflect(&self, host_name: &'static str, ty: Rc<Type>) {
        self.reflect_by_host_name.borrow_mut().insert(host_name, ty);
    }

    pub fn get(&self, name: &str) -> Option<Rc<Type>> {
        self.by_name.borrow().get(name).cloned()
    }

    pub fn any(&self) -> Rc<Type> {
        self.any.clone()
    }

    /// Resolves a value's runtime type, falling back to `Any` for
    /// reflected host types with no registered mapping.
    pub fn type_of(&self, value: &Value) -> Rc<Type> {
        match value.kind() {
            ValueKind::Reflect(host_name) => self
                .reflect_by_host_name
                .borrow()
                .get(host_name)
                .cloned()
                .unwrap_or_else(|| self.any.clone()),
            ValueKind::Named(name) => self.get(&name).unwrap_or_else(|| self.any.clone()),
            kind => self.get(&kind.to_string()).unwrap_or_else(|| self.any.clone()),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
