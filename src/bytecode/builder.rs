//! A small hand-assembly helper for building `CompiledFunction`s without
//! a parser/compiler (out of scope, §1). Exercised by this crate's own
//! tests and exported (not `#[cfg(test)]`-gated) so integration tests in
//! `tests/` can assemble end-to-end scripts the same way.

use std::rc::Rc;

use super::{CompiledFunction, Constants, NamedParamInfo, ParamInfo};
use crate::bytecode::Instr;
use crate::span::Span;

/// Builds one `CompiledFunction` body, tracking jump-target fixups by
/// label so tests can write straight-line instruction lists and resolve
/// branch targets afterward instead of hand-counting instruction
/// indices.
///
/// Construction (`new`/`locals`/`param`/`named_param`/`free`) is a
/// consuming builder chain; `emit` takes `&mut self` so callers can push
/// one instruction per statement -- the natural shape for hand-assembling
/// a straight-line instruction list where later emits need to reference
/// jump targets computed from earlier ones (`next_index`).
#[derive(Default)]
pub struct FunctionBuilder {
    name: String,
    instructions: Vec<Instr>,
    num_locals: usize,
    params: Vec<ParamInfo>,
    named_params: Vec<NamedParamInfo>,
    num_free: usize,
    /// Parallel to `instructions`; only populated at indices reached
    /// through `emit_spanned`, so a `FunctionBuilder` that never calls it
    /// produces the same empty `source_map` `build()` always used to.
    spans: Vec<Option<Span>>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn locals(mut self, n: usize) -> Self {
        self.num_locals = n;
        self
    }

    pub fn param(mut self, info: ParamInfo) -> Self {
        self.params.push(info);
        self
    }

    pub fn named_param(mut self, info: NamedParamInfo) -> Self {
        self.named_params.push(info);
        self
    }

    pub fn free(mut self, n: usize) -> Self {
        self.num_free = n;
        self
    }

    /// The index the next pushed instruction will occupy; use this to
    /// compute jump targets before emitting forward branches.
    pub fn next_index(&self) -> u32 {
        self.instructions.len() as u32
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.instructions.push(instr);
        self.spans.push(None);
        self
    }

    /// Like `emit`, but also records `span` as this instruction's source
    /// position for `CompiledFunction::span_at` (§6.1's source map),
    /// letting tests exercise `SpannedError`'s humanized trace (§6.3)
    /// without a real compiler.
    pub fn emit_spanned(&mut self, instr: Instr, span: Span) -> &mut Self {
        self.instructions.push(instr);
        self.spans.push(Some(span));
        self
    }

    pub fn build(self) -> CompiledFunction {
        CompiledFunction {
            name: self.name,
            instructions: self.instructions,
            num_locals: self.num_locals,
            params: self.params,
            named_params: self.named_params,
            num_free: self.num_free,
            source_map: self.spans,
        }
    }

    pub fn build_rc(self) -> Rc<CompiledFunction> {
        Rc::new(self.build())
    }
}

/// Builds a `Bytecode` artifact around one `main_function`, with access
/// to a shared `Constants` pool so tests can push literals/nested
/// functions before assembling instructions that reference them by
/// index.
pub struct BytecodeBuilder {
    pub constants: Constants,
    num_modules: usize,
}

impl BytecodeBuilder {
    pub fn new(constants: Constants) -> Self {
        Self {
            constants,
            num_modules: 0,
        }
    }

    pub fn modules(mut self, n: usize) -> Self {
        self.num_modules = n;
        self
    }

    pub fn finish(self, main_function: Rc<CompiledFunction>) -> super::Bytecode {
        super::Bytecode::new(self.constants, main_function, self.num_modules)
    }
}
