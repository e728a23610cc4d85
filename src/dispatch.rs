//! The multiple-dispatch tree.
//!
//! A trie over positional argument-type vectors with a catch-all (`nil`)
//! child at each level. `add` mutates the tree; `resolve` stays
//! read-mostly on the hot path, walking borrowed references and cloning
//! only the single matching `Value` it returns.

use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::object::{Value, ValueKind};

#[derive(Default, Clone)]
struct Node {
    children: HashMap<ValueKind, Node>,
    any: Option<Box<Node>>,
    leaf: Option<LeafEntry>,
}

#[derive(Clone)]
struct LeafEntry {
    signature: Vec<ValueKind>,
    method: Value,
}

/// Per-callable trie indexing positional-argument type vectors to concrete
/// method implementations.
#[derive(Default, Clone)]
pub struct DispatchTree {
    root: Node,
}

impl DispatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under every concrete signature expanded from
    /// `types_list`.
    ///
    /// `types_list[i]` is the set of types permitted at position `i`; an
    /// empty inner vec at a position means "any type" (the nil edge).
    /// Every concrete combination (the Cartesian product across
    /// positions) is registered with the same method. This is how a
    /// variadic-typed position ("Int or Float here") expands into
    /// multiple concrete dispatch paths. `override_existing` controls
    /// whether re-registering an already-populated signature replaces it
    /// or raises `MethodDuplication`.
    pub fn add(
        &mut self,
        types_list: &[Vec<ValueKind>],
        method: Value,
        override_existing: bool,
    ) -> Result<(), RuntimeError> {
        let paths = expand_paths(types_list);
        for path in paths {
            self.add_path(&path, method.clone(), override_existing)?;
        }
        Ok(())
    }

    fn add_path(
        &mut self,
        path: &[Option<ValueKind>],
        method: Value,
        override_existing: bool,
    ) -> Result<(), RuntimeError> {
        let mut node = &mut self.root;
        for key in path {
            node = match key {
                Some(kind) => node.children.entry(kind.clone()).or_default(),
                None => node.any.get_or_insert_with(Box::default),
            };
        }
        if node.leaf.is_some() && !override_existing {
            let signature: Vec<ValueKind> = path
                .iter()
                .map(|k| k.clone().unwrap_or(ValueKind::Named("Any".to_string())))
                .collect();
            return Err(RuntimeError::MethodDuplication {
                name: "<method>".to_string(),
                signature: signature.iter().map(|k| k.to_string()).collect(),
            });
        }
        let signature: Vec<ValueKind> = path
            .iter()
            .map(|k| k.clone().unwrap_or(ValueKind::Named("Any".to_string())))
            .collect();
        node.leaf = Some(LeafEntry { signature, method });
        Ok(())
    }

    /// Exact type first at each level, falling back to the `nil` (any)
    /// edge; returns the leaf's registered method if every level
    /// resolved, else `None`.
    pub fn resolve(&self, arg_types: &[ValueKind]) -> Option<Value> {
        let mut node = &self.root;
        for kind in arg_types {
            node = match node.children.get(kind) {
                Some(next) => next,
                None => node.any.as_deref()?,
            };
        }
        node.leaf.as_ref().map(|leaf| leaf.method.clone())
    }

    /// A traversal sorted by type name so error messages are
    /// deterministic.
    pub fn sorted_signatures(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        collect_signatures(&self.root, &mut out);
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.leaf.is_none() && self.root.children.is_empty() && self.root.any.is_none()
    }
}

fn collect_signatures(node: &Node, out: &mut Vec<Vec<String>>) {
    if let Some(leaf) = &node.leaf {
        out.push(leaf.signature.iter().map(|k| k.to_string()).collect());
    }
    for child in node.children.values() {
        collect_signatures(child, out);
    }
    if let Some(any) = &node.any {
        collect_signatures(any, out);
    }
}

fn expand_paths(types_list: &[Vec<ValueKind>]) -> Vec<Vec<Option<ValueKind>>> {
    let mut paths: Vec<Vec<Option<ValueKind>>> = vec![Vec::new()];
    for position in types_list {
        let options: Vec<Option<ValueKind>> = if position.is_empty() {
            vec![None]
        } else {
            position.iter().cloned().map(Some).collect()
        };
        let mut next = Vec::with_capacity(paths.len() * options.len());
        for path in &paths {
            for opt in &options {
                let mut extended = path.clone();
                extended.push(opt.clone());
                next.push(extended);
            }
        }
        paths = next;
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn dummy(name: &str) -> Value {
        Value::Function(Rc::new(crate::object::NativeClosure {
            name: name.to_string(),
            func: Rc::new(|_, _| Ok(Value::Nil)),
        }))
    }

    #[test]
    fn exact_match_wins_over_any() {
        let mut tree = DispatchTree::new();
        tree.add(&[vec![ValueKind::Int]], dummy("int"), false).unwrap();
        tree.add(&[vec![]], dummy("any"), false).unwrap();
        let resolved = tree.resolve(&[ValueKind::Int]).unwrap();
        assert_eq!(resolved.to_display_string(), "<function int>");
        let resolved_any = tree.resolve(&[ValueKind::Str]).unwrap();
        assert_eq!(resolved_any.to_display_string(), "<function any>");
    }

    #[test]
    fn duplicate_signature_without_override_errors() {
        let mut tree = DispatchTree::new();
        tree.add(&[vec![ValueKind::Int]], dummy("a"), false).unwrap();
        let err = tree.add(&[vec![ValueKind::Int]], dummy("b"), false).unwrap_err();
        assert!(matches!(err, RuntimeError::MethodDuplication { .. }));
    }

    #[test]
    fn override_replaces_existing_leaf() {
        let mut tree = DispatchTree::new();
        tree.add(&[vec![ValueKind::Int]], dummy("a"), false).unwrap();
        tree.add(&[vec![ValueKind::Int]], dummy("b"), true).unwrap();
        let resolved = tree.resolve(&[ValueKind::Int]).unwrap();
        assert_eq!(resolved.to_display_string(), "<function b>");
    }

    #[test]
    fn no_match_returns_none() {
        let mut tree = DispatchTree::new();
        tree.add(&[vec![ValueKind::Int]], dummy("a"), false).unwrap();
        assert!(tree.resolve(&[ValueKind::Str]).is_none());
    }

    #[test]
    fn variadic_position_expands_to_every_concrete_path() {
        let mut tree = DispatchTree::new();
        tree.add(
            &[vec![ValueKind::Int, ValueKind::Float]],
            dummy("numeric"),
            false,
        )
        .unwrap();
        assert!(tree.resolve(&[ValueKind::Int]).is_some());
        assert!(tree.resolve(&[ValueKind::Float]).is_some());
        assert!(tree.resolve(&[ValueKind::Str]).is_none());
    }
}
