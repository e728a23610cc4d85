//! Round-trips a compiled artifact through `bincode` on disk, the way an
//! embedder that caches a compiled program between runs would use it.

use std::io::{Read as _, Write as _};
use std::rc::Rc;

use gadvm::bytecode::builder::{BytecodeBuilder, FunctionBuilder};
use gadvm::bytecode::{Bytecode, Constants, Instr};
use gadvm::object::Value;
use gadvm::vm::{RunOpts, Setup, Vm};

fn sample_bytecode() -> Bytecode {
    let mut constants = Constants::new();
    let greeting = constants.push_value(Value::str("hello from disk"));
    let mut main = FunctionBuilder::new("main").locals(0);
    main.emit(Instr::Constant(greeting));
    main.emit(Instr::Return(true));
    BytecodeBuilder::new(constants).finish(main.build_rc())
}

#[test]
fn artifact_survives_a_bincode_round_trip_through_a_file() {
    let bytecode = sample_bytecode();
    let bytes = bytecode.to_bincode().unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();

    let mut read_back = Vec::new();
    std::fs::File::open(file.path()).unwrap().read_to_end(&mut read_back).unwrap();

    let restored = Bytecode::from_bincode(&read_back).unwrap();
    let mut vm = Vm::new(Rc::new(restored), Setup::default());
    let result = vm.run(RunOpts::new()).unwrap();
    assert_eq!(result.to_display_string(), "hello from disk");
}

#[test]
fn artifact_json_encoding_is_human_readable_and_round_trips() {
    let bytecode = sample_bytecode();
    let json = bytecode.to_json().unwrap();
    assert!(json.contains("hello from disk"));

    let restored = Bytecode::from_json(&json).unwrap();
    let mut vm = Vm::new(Rc::new(restored), Setup::default());
    let result = vm.run(RunOpts::new()).unwrap();
    assert_eq!(result.to_display_string(), "hello from disk");
}
