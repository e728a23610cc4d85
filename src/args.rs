//! The invocation contract (§3.1, §4.7): `Args`, `NamedArgs`, the `Call`
//! record, and positional/named argument binding.

use crate::bytecode::{CompiledFunction, ParamInfo};
use crate::error::RuntimeError;
use crate::object::{KeyValue, Value, ValueKind};

/// A sequence of value groups rather than a flat `Vec<Value>`: a plain
/// call pushes one group holding every positional argument, while a
/// spread call (`f(*xs)`, `Call nArgs nVarArgs`) appends the spread
/// array as its own group. `len()` is the sum of every group's length,
/// matching §3.1's "length is the sum of nested lengths" -- so `f(a, b,
/// *[c, d])` and `f(a, b, c, d)` bind identically (§8 invariant 7)
/// without this type ever materializing the flattened vector unless
/// something actually asks for it.
#[derive(Debug, Clone, Default)]
pub struct Args {
    groups: Vec<Vec<Value>>,
}

impl Args {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    /// A single ungrouped positional call -- `f(a, b, c)`.
    pub fn positional(values: Vec<Value>) -> Self {
        Self { groups: vec![values] }
    }

    pub fn push_group(&mut self, group: Vec<Value>) {
        if !group.is_empty() || self.groups.is_empty() {
            self.groups.push(group);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.groups.iter().flatten()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.iter().nth(index)
    }

    pub fn flatten(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    pub fn types(&self) -> Vec<ValueKind> {
        self.iter().map(Value::kind).collect()
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Args::positional(iter.into_iter().collect())
    }
}

/// Paired key/value arrays (§3.1) -- an ordered, duplicate-free list of
/// `(name, value)` pairs supplied as named arguments.
#[derive(Debug, Clone, Default)]
pub struct NamedArgs {
    pairs: Vec<(String, Value)>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.pairs.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.pairs.iter()
    }
}

/// The tuple passed to every callable: positional `Args`, `NamedArgs`,
/// and the "already type-validated" flag (`SafeArgs`) the dispatch tree
/// sets when it resolved this call against a concrete signature, so
/// per-parameter type assertions (§4.7) are skipped on the callee side.
///
/// The VM pointer the spec's Call record otherwise carries is instead
/// passed as an explicit `&mut Vm` parameter to every `NativeFn` (see
/// `object::callable` and DESIGN.md) -- the idiomatic Rust shape for "a
/// call record with a VM handle" is a borrow, not a stashed pointer.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub args: Args,
    pub named: NamedArgs,
    pub safe_args: bool,
}

impl Call {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            args: Args::positional(values),
            named: NamedArgs::new(),
            safe_args: false,
        }
    }

    pub fn new(args: Args, named: NamedArgs, safe_args: bool) -> Self {
        Self {
            args,
            named,
            safe_args,
        }
    }
}

/// The outcome of binding a `Call` against a `CompiledFunction`'s
/// parameter metadata: a vector ready to seed the callee's locals slots
/// 0..params.len()+named_params.len(). Defaults for unbound named
/// parameters are *not* filled in here -- per §4.7 they are compiled
/// into the callee's own prologue (`JumpNotNil` + constant + `SetLocal`),
/// so this function only needs to decide "bound" vs "left Nil for the
/// prologue to fill in".
pub fn bind_arguments(
    proto: &CompiledFunction,
    call: &Call,
) -> Result<Vec<Value>, RuntimeError> {
    let mut locals = vec![Value::Nil; proto.num_locals];
    bind_positional(&proto.params, &call.args, call.safe_args, &mut locals)?;
    bind_named(proto.params.len(), &proto.named_params, &call.named, &mut locals)?;
    Ok(locals)
}

fn bind_positional(
    params: &[ParamInfo],
    args: &Args,
    safe_args: bool,
    locals: &mut [Value],
) -> Result<(), RuntimeError> {
    let has_variadic = params.last().is_some_and(|p| p.variadic);
    let fixed_count = if has_variadic {
        params.len() - 1
    } else {
        params.len()
    };
    let total = args.len();

    if !has_variadic && total > fixed_count {
        return Err(RuntimeError::WrongNumberArguments {
            want: crate::error::Arity::Exact(fixed_count),
            got: total,
        });
    }
    if total < fixed_count {
        return Err(RuntimeError::WrongNumberArguments {
            want: if has_variadic {
                crate::error::Arity::AtLeast(fixed_count)
            } else {
                crate::error::Arity::Exact(fixed_count)
            },
            got: total,
        });
    }

    for (i, param) in params.iter().take(fixed_count).enumerate() {
        let value = args.get(i).cloned().unwrap_or(Value::Nil);
        if !safe_args {
            check_type(param, &value, i + 1)?;
        }
        locals[i] = value;
    }

    if has_variadic {
        let rest: Vec<Value> = args.iter().skip(fixed_count).cloned().collect();
        locals[fixed_count] = Value::array(rest);
    }

    Ok(())
}

fn check_type(param: &ParamInfo, value: &Value, position: usize) -> Result<(), RuntimeError> {
    if param.accepted.is_empty() {
        return Ok(());
    }
    let kind = value.kind();
    if param.accepted.iter().any(|k| *k == kind) {
        return Ok(());
    }
    let expected = param
        .accepted
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join("|");
    Err(RuntimeError::ArgumentTypeError {
        position,
        expected,
        actual: kind.to_string(),
    })
}

/// Named parameters occupy the locals slots immediately following the
/// positional parameters (slots `params.len() .. params.len() +
/// named_params.len()`), with any remaining declared locals after
/// that -- the compiler (out of scope) allocates `num_locals`
/// consistently with this layout.
fn bind_named(
    num_positional_params: usize,
    named_params: &[crate::bytecode::NamedParamInfo],
    named: &NamedArgs,
    locals: &mut [Value],
) -> Result<(), RuntimeError> {
    if named_params.is_empty() {
        return if named.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::TypeError(format!(
                "unexpected named argument(s): {}",
                named.names().collect::<Vec<_>>().join(", ")
            )))
        };
    }

    let named_start = num_positional_params;
    let has_variadic_named = named_params.iter().any(|p| p.variadic);

    for (slot, param) in named_params.iter().enumerate() {
        if param.variadic {
            continue;
        }
        if let Some(v) = named.get(&param.name) {
            locals[named_start + slot] = v.clone();
        }
    }

    let surplus: Vec<(String, Value)> = named
        .iter()
        .filter(|(name, _)| !named_params.iter().any(|p| !p.variadic && &p.name == name))
        .cloned()
        .collect();

    if !surplus.is_empty() {
        if has_variadic_named {
            let slot = named_params
                .iter()
                .position(|p| p.variadic)
                .expect("has_variadic_named implies a variadic entry exists");
            locals[named_start + slot] = Value::KeyValueArray(std::rc::Rc::new(std::cell::RefCell::new(
                surplus
                    .into_iter()
                    .map(|(k, v)| KeyValue::new(Value::str(k), v))
                    .collect(),
            )));
        } else {
            return Err(RuntimeError::TypeError(format!(
                "unexpected named argument(s): {}",
                surplus
                    .iter()
                    .map(|(k, _)| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CompiledFunction, NamedParamInfo};

    fn proto(params: Vec<ParamInfo>, named: Vec<NamedParamInfo>, num_locals: usize) -> CompiledFunction {
        CompiledFunction {
            name: "f".to_string(),
            instructions: Vec::new(),
            num_locals,
            params,
            named_params: named,
            num_free: 0,
            source_map: Vec::new(),
        }
    }

    fn plain_param(name: &str) -> ParamInfo {
        ParamInfo {
            name: name.to_string(),
            accepted: Vec::new(),
            variadic: false,
        }
    }

    #[test]
    fn args_len_sums_spread_groups() {
        let mut args = Args::new();
        args.push_group(vec![Value::Int(1), Value::Int(2)]);
        args.push_group(vec![Value::Int(3)]);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn spread_call_equals_flat_call() {
        let p = proto(vec![plain_param("a"), plain_param("b"), plain_param("c")], vec![], 3);
        let flat = Call::positional(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let mut spread_args = Args::new();
        spread_args.push_group(vec![Value::Int(1)]);
        spread_args.push_group(vec![Value::Int(2), Value::Int(3)]);
        let spread = Call::new(spread_args, NamedArgs::new(), false);

        let a = bind_arguments(&p, &flat).unwrap();
        let b = bind_arguments(&p, &spread).unwrap();
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.equals(y)));
    }

    #[test]
    fn surplus_positional_without_variadic_errors() {
        let p = proto(vec![plain_param("a")], vec![], 1);
        let call = Call::positional(vec![Value::Int(1), Value::Int(2)]);
        let err = bind_arguments(&p, &call).unwrap_err();
        assert!(matches!(err, RuntimeError::WrongNumberArguments { .. }));
    }

    #[test]
    fn variadic_positional_collects_into_array() {
        let mut params = vec![plain_param("a")];
        params.push(ParamInfo {
            name: "rest".to_string(),
            accepted: Vec::new(),
            variadic: true,
        });
        let p = proto(params, vec![], 2);
        let call = Call::positional(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let locals = bind_arguments(&p, &call).unwrap();
        match &locals[1] {
            Value::Array(a) => assert_eq!(a.borrow().len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn type_assertion_rejects_wrong_type_unless_safe_args() {
        let p = proto(
            vec![ParamInfo {
                name: "n".to_string(),
                accepted: vec![ValueKind::Int],
                variadic: false,
            }],
            vec![],
            1,
        );
        let call = Call::positional(vec![Value::str("nope")]);
        let err = bind_arguments(&p, &call).unwrap_err();
        assert!(matches!(err, RuntimeError::ArgumentTypeError { position: 1, .. }));

        let safe_call = Call::new(Args::positional(vec![Value::str("nope")]), NamedArgs::new(), true);
        assert!(bind_arguments(&p, &safe_call).is_ok());
    }

    #[test]
    fn unbound_named_parameter_is_left_nil_for_prologue_default() {
        let p = proto(
            vec![],
            vec![NamedParamInfo {
                name: "opt".to_string(),
                variadic: false,
            }],
            1,
        );
        let call = Call::new(Args::new(), NamedArgs::new(), false);
        let locals = bind_arguments(&p, &call).unwrap();
        assert!(matches!(locals[0], Value::Nil));
    }

    #[test]
    fn surplus_named_without_variadic_named_errors() {
        let p = proto(vec![], vec![], 0);
        let mut named = NamedArgs::new();
        named.insert("x", Value::Int(1));
        let call = Call::new(Args::new(), named, false);
        assert!(bind_arguments(&p, &call).is_err());
    }
}
