//! `gadvm`: an embeddable bytecode virtual machine for a dynamically
//! typed, garbage-collected scripting language with first-class
//! functions, closures, reflected native values, structured exception
//! handling, iterators, and multiple dispatch.
//!
//! This crate is the execution engine only (see `SPEC_FULL.md` §0): the
//! source parser/AST, the compiler that lowers a grammar into [`bytecode::Instr`],
//! the built-in function library's content, and the REPL/CLI tooling are
//! external collaborators. An embedder constructs a [`bytecode::Bytecode`]
//! artifact (by hand, via [`bytecode::builder`], or from its own
//! compiler), registers native callables and reflect converters through
//! [`vm::Setup`], and drives it with [`vm::Vm::run`].
//!
//! Module layout mirrors the component table in `SPEC_FULL.md` §0:
//!
//! - [`object`] (C1): the `Value` enum and its capability methods.
//! - [`types`] (C2): `Type`, `TypeRegistry`, type lattice.
//! - [`dispatch`] (C2): the multiple-dispatch trie.
//! - [`reflect`] (C3): the native-value bridge.
//! - [`iter`] (C4): the iterator state machine and adapters.
//! - [`bytecode`] (C5): instruction encoding, constants, compiled
//!   functions, the module table, the serializable artifact.
//! - [`vm`] (C6): `Vm`, frames, the dispatch loop, the embedding surface.
//! - [`args`] (C7): `Args`, `NamedArgs`, `Call`, argument binding.
//! - [`builtins`] (C8): the built-in callable registry.
//! - [`error`]: runtime error kinds and the stack-trace humanizer.

pub mod args;
pub mod builtins;
pub mod bytecode;
pub mod dispatch;
pub mod error;
pub mod iter;
pub mod object;
pub mod reflect;
pub mod span;
pub mod types;
pub mod vm;

pub use args::{Args, Call, NamedArgs};
pub use error::{RuntimeError, SpannedError};
pub use object::Value;
pub use vm::{RunError, RunOpts, Setup, Vm};
