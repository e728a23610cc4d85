//! End-to-end tests assembled through `gadvm::bytecode::builder`, the
//! same hand-assembly path a downstream compiler would drive `Vm` through.
//! Unlike the in-crate unit tests (which exercise single instructions or
//! single modules), these build whole programs and run them through the
//! public `Vm::run`/`RunOpts` surface only.

use std::cell::RefCell;
use std::rc::Rc;

use gadvm::bytecode::builder::{BytecodeBuilder, FunctionBuilder};
use gadvm::bytecode::{Constants, Instr};
use gadvm::object::{BinOp, Flag, PrinterOptions, Value};
use gadvm::reflect::{self, ReflectAccess, ReflectShape, ReflectValue};
use gadvm::vm::{Globals, MapGlobals, RunError, RunOpts, Setup, Vm};

fn run(constants: Constants, main: FunctionBuilder, setup: Setup, opts: RunOpts) -> Result<Value, RunError> {
    let bytecode = BytecodeBuilder::new(constants).finish(main.build_rc());
    let mut vm = Vm::new(Rc::new(bytecode), setup);
    vm.run(opts)
}

#[test]
fn registered_builtin_doubles_its_argument() {
    let mut setup = Setup::default();
    setup.builtins.register(
        "double",
        Rc::new(|_vm, call| {
            let n = match call.args.get(0) {
                Some(Value::Int(n)) => *n,
                _ => return Err(gadvm::RuntimeError::TypeError("expected Int".to_string())),
            };
            Ok(Value::Int(n * 2))
        }),
    );
    let id = setup.builtins.id_of("double").unwrap();

    let mut constants = Constants::new();
    let arg = constants.push_value(Value::Int(21));
    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::GetBuiltin(id));
    main.emit(Instr::Constant(arg));
    main.emit(Instr::Call { n_args: 1, n_var_args: 0 });
    main.emit(Instr::Return(true));

    let result = run(constants, main, setup, RunOpts::new()).unwrap();
    assert!(result.equals(&Value::Int(42)));
}

/// Exercises the `StdOut`/`Call` wiring: `Value::Reflect` callees must
/// actually reach `ReflectAccess::call`, not just resolve to a value.
#[test]
fn stdout_stream_is_callable_and_writes_through() {
    let mut constants = Constants::new();
    let text = constants.push_value(Value::str("hello"));
    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::StdOut);
    main.emit(Instr::Constant(text));
    main.emit(Instr::Call { n_args: 1, n_var_args: 0 });
    main.emit(Instr::Pop);
    main.emit(Instr::Return(false));

    let captured: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let opts = RunOpts::new().stdout(captured.clone());
    run(constants, main, Setup::default(), opts).unwrap();

    assert_eq!(&*captured.borrow(), b"hello");
}

#[test]
fn global_variable_round_trips_through_set_and_get() {
    let mut constants = Constants::new();
    let name = constants.push_value(Value::str("counter"));
    let value = constants.push_value(Value::Int(7));

    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(value));
    main.emit(Instr::SetGlobal(name));
    main.emit(Instr::GetGlobal(name));
    main.emit(Instr::Return(true));

    let result = run(constants, main, Setup::default(), RunOpts::new()).unwrap();
    assert!(result.equals(&Value::Int(7)));
}

#[test]
fn globals_seeded_through_run_opts_are_visible_to_get_global() {
    let mut globals = MapGlobals::default();
    globals.set("seeded", Value::str("preset"));

    let mut constants = Constants::new();
    let name = constants.push_value(Value::str("seeded"));
    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::GetGlobal(name));
    main.emit(Instr::Return(true));

    let opts = RunOpts::new().globals(Box::new(globals));
    let result = run(constants, main, Setup::default(), opts).unwrap();
    assert_eq!(result.to_display_string(), "preset");
}

/// A host-native point, reflected in the way an embedder would register
/// one: field access by name through the same `GetIndex` path scripts use
/// for arrays and dicts.
struct HostPoint {
    x: i64,
    y: i64,
}

impl ReflectAccess for HostPoint {
    fn type_name(&self) -> &'static str {
        "HostPoint"
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

    fn display(&self, _options: &PrinterOptions) -> String {
        format!("HostPoint{{x: {}, y: {}}}", self.x, self.y)
    }

    fn method_names(&self) -> Vec<String> {
        vec!["taxicab_length".to_string()]
    }

    fn call_method(&self, name: &str, _args: Vec<Value>) -> Result<Value, gadvm::RuntimeError> {
        match name {
            "taxicab_length" => Ok(Value::Int(self.x.abs() + self.y.abs())),
            _ => Err(gadvm::RuntimeError::NotCallable {
                type_name: format!("HostPoint.{name}"),
            }),
        }
    }
}

#[test]
fn reflected_struct_field_is_reachable_through_get_index() {
    let point = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(HostPoint { x: 3, y: 4 }))));

    let mut constants = Constants::new();
    let point_idx = constants.push_value(point);
    let field_idx = constants.push_value(Value::str("y"));

    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(point_idx));
    main.emit(Instr::Constant(field_idx));
    main.emit(Instr::GetIndex(1));
    main.emit(Instr::Return(true));

    let result = run(constants, main, Setup::default(), RunOpts::new()).unwrap();
    assert!(result.equals(&Value::Int(4)));
}

#[test]
fn reflected_struct_method_is_reachable_through_the_reserved_methods_key() {
    let point = Value::Reflect(Rc::new(ReflectValue::new(Rc::new(HostPoint { x: -3, y: 4 }))));

    let mut constants = Constants::new();
    let point_idx = constants.push_value(point);
    let methods_key = constants.push_value(Value::str(gadvm::reflect::RESERVED_METHODS_KEY));
    let method_name = constants.push_value(Value::str("taxicab_length"));

    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(point_idx));
    main.emit(Instr::Constant(methods_key));
    main.emit(Instr::Constant(method_name));
    main.emit(Instr::GetIndex(2));
    main.emit(Instr::Call { n_args: 0, n_var_args: 0 });
    main.emit(Instr::Return(true));

    let result = run(constants, main, Setup::default(), RunOpts::new()).unwrap();
    assert!(result.equals(&Value::Int(7)));
}

#[test]
fn uncaught_throw_surfaces_as_run_error_with_populated_trace() {
    let mut constants = Constants::new();
    let message = constants.push_value(Value::str("boom"));

    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(message));
    main.emit(Instr::Throw(true));

    let result = run(constants, main, Setup::default(), RunOpts::new());
    match result {
        Err(RunError::Runtime(spanned)) => {
            assert_eq!(spanned.error.to_string(), "boom");
            assert_eq!(spanned.trace.len(), 1);
            assert_eq!(spanned.trace[0].function_name, "main");
        }
        other => panic!("expected RunError::Runtime, got {other:?}"),
    }
}

#[test]
fn flag_values_compare_distinctly_from_bool() {
    let constants = Constants::new();
    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Yes);
    main.emit(Instr::Return(true));

    let result = run(constants, main, Setup::default(), RunOpts::new()).unwrap();
    assert!(result.equals(&Value::Flag(Flag::Yes)));
    assert!(!result.equals(&Value::Bool(true)));
}

#[test]
fn arithmetic_promotes_int_and_float_per_numeric_tower() {
    let mut constants = Constants::new();
    let one = constants.push_value(Value::Int(1));
    let half = constants.push_value(Value::Float(0.5));

    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(one));
    main.emit(Instr::Constant(half));
    main.emit(Instr::BinaryOp(BinOp::Add));
    main.emit(Instr::Return(true));

    let result = run(constants, main, Setup::default(), RunOpts::new()).unwrap();
    assert!(matches!(result, Value::Float(f) if (f - 1.5).abs() < f64::EPSILON));
}

#[test]
fn reflect_converter_table_resolves_registered_host_type() {
    let mut converters = reflect::ConverterTable::new();
    converters.register(Rc::new(HostPoint { x: 1, y: 2 }));
    assert!(converters.get("HostPoint").is_some());
    assert!(converters.get("Unregistered").is_none());
}
