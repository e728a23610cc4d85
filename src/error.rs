//! Runtime error kinds and the stack-trace wrapper the VM boundary
//! produces from them when an error escapes a run unhandled.
//!
//! Follows the teacher's hand-rolled pattern for the core VM error type: a
//! plain enum with a manual `Display`/`std::error::Error` impl rather than
//! `thiserror`, so every error carries exactly the structured data its
//! message needs without an intermediate format-string pass.

use crate::bytecode::SourceFile;
use crate::object::Value;
use crate::span::Span;

/// What a call site expected, for `WrongNumberArguments`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Script-visible runtime errors.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    WrongNumberArguments { want: Arity, got: usize },
    ArgumentTypeError {
        position: usize,
        expected: String,
        actual: String,
    },
    IndexOutOfBounds { index: i64, length: usize },
    InvalidIndex { key: String },
    IndexTypeError { expected: String, actual: String },
    OperandTypeError {
        op: String,
        left: String,
        right: String,
    },
    MethodDuplication { name: String, signature: Vec<String> },
    NotInitializable { name: String },
    NotCallable { type_name: String },
    NotIterable { type_name: String },
    TypeError(String),
    StackOverflow,
    Interrupted,
    /// Any script `Object`, wrapped with a stack-trace decoration on first throw.
    UserThrown(Value),
}

impl RuntimeError {
    /// Ordinal string for an argument position: 1 -> "1st", 2 -> "2nd", ...
    pub fn ordinal(position: usize) -> String {
        let suffix = match (position % 100, position % 10) {
            (11..=13, _) => "th",
            (_, 1) => "st",
            (_, 2) => "nd",
            (_, 3) => "rd",
            _ => "th",
        };
        format!("{position}{suffix}")
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::WrongNumberArguments { want, got } => {
                write!(f, "wrong number of arguments: want {want}, got {got}")
            }
            RuntimeError::ArgumentTypeError {
                position,
                expected,
                actual,
            } => write!(
                f,
                "invalid type for {} argument: expected {expected}, got {actual}",
                RuntimeError::ordinal(*position)
            ),
            RuntimeError::IndexOutOfBounds { index, length } => write!(
                f,
                "index out of bounds: index {index}, length {length}"
            ),
            RuntimeError::InvalidIndex { key } => write!(f, "invalid index: {key}"),
            RuntimeError::IndexTypeError { expected, actual } => write!(
                f,
                "invalid index type: expected {expected}, got {actual}"
            ),
            RuntimeError::OperandTypeError { op, left, right } => write!(
                f,
                "unsupported operand types for {op}: {left} and {right}"
            ),
            RuntimeError::MethodDuplication { name, signature } => write!(
                f,
                "method {name}({}) is already registered",
                signature.join(", ")
            ),
            RuntimeError::NotInitializable { name } => {
                write!(f, "{name} is not initializable for these arguments")
            }
            RuntimeError::NotCallable { type_name } => {
                write!(f, "{type_name} is not callable")
            }
            RuntimeError::NotIterable { type_name } => {
                write!(f, "{type_name} is not iterable")
            }
            RuntimeError::TypeError(msg) => write!(f, "type error: {msg}"),
            RuntimeError::StackOverflow => write!(f, "stack overflow"),
            RuntimeError::Interrupted => write!(f, "interrupted"),
            RuntimeError::UserThrown(v) => write!(f, "{}", v.to_display_string()),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// One entry of a humanized stack trace: the active frame's function
/// name plus, when the source map has an entry for the faulting
/// instruction, its source location.
#[derive(Debug, Clone)]
pub struct FrameTrace {
    pub function_name: String,
    pub span: Option<Span>,
}

/// A `RuntimeError` decorated with the call-stack trace captured when it
/// escaped `Vm::run`/`Vm::run_compiled_function` unhandled.
///
/// Frames are ordered innermost-first, matching the order the VM unwound
/// them in.
#[derive(Debug, Clone)]
pub struct SpannedError {
    pub error: RuntimeError,
    pub trace: Vec<FrameTrace>,
}

impl SpannedError {
    pub fn new(error: RuntimeError, trace: Vec<FrameTrace>) -> Self {
        Self { error, trace }
    }

    pub fn without_trace(error: RuntimeError) -> Self {
        Self { error, trace: Vec::new() }
    }

    /// Renders the trace the way `Display` does, but with source context
    /// (§6.3) interleaved under each frame that has a span: `context` lines
    /// above and below for every frame, widened to `context + 1` lines
    /// below the innermost frame so the faulting line itself reads clearly
    /// even when it's the last line `Display` alone would show.
    pub fn render_with_source(&self, file: &SourceFile, context: usize) -> String {
        use std::fmt::Write;
        let mut out = format!("{}\n", self.error);
        for (i, frame) in self.trace.iter().enumerate() {
            match &frame.span {
                Some(span) => {
                    let _ = writeln!(
                        out,
                        "  at {} ({}:{})",
                        frame.function_name, span.start_line, span.start_column
                    );
                    let down = if i == 0 { context + 1 } else { context };
                    for line in file.context_lines(*span, context, down) {
                        let _ = writeln!(out, "    {line}");
                    }
                }
                None => {
                    let _ = writeln!(out, "  at {}", frame.function_name);
                }
            }
        }
        out
    }
}

impl std::fmt::Display for SpannedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.error)?;
        for frame in &self.trace {
            match &frame.span {
                Some(span) => writeln!(
                    f,
                    "  at {} ({}:{})",
                    frame.function_name, span.start_line, span.start_column
                )?,
                None => writeln!(f, "  at {}", frame.function_name)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for SpannedError {}

/// Host-level misuse of the embedding surface, distinct from
/// `RuntimeError` because these can never be caught by a script `catch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// `Run`/`RunCompiledFunction` called while another `Run` is already
    /// in progress on the same `Vm`.
    AlreadyRunning,
    /// A converter was requested for a host type with none registered and
    /// no opaque fallback permitted.
    NoConverter { type_name: String },
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::AlreadyRunning => write!(f, "Vm::run called while already running"),
            SetupError::NoConverter { type_name } => {
                write!(f, "no converter registered for host type {type_name}")
            }
        }
    }
}

impl std::error::Error for SetupError {}

/// A `SetupError` raised while converting a `ReflectFunc` call's
/// positional arguments (§4.3) surfaces through the same `RuntimeError`
/// channel every other call-time failure does, carrying its message.
impl From<SetupError> for RuntimeError {
    fn from(err: SetupError) -> Self {
        RuntimeError::TypeError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_formats_small_numbers() {
        assert_eq!(RuntimeError::ordinal(1), "1st");
        assert_eq!(RuntimeError::ordinal(2), "2nd");
        assert_eq!(RuntimeError::ordinal(3), "3rd");
        assert_eq!(RuntimeError::ordinal(4), "4th");
    }

    #[test]
    fn ordinal_handles_teens() {
        assert_eq!(RuntimeError::ordinal(11), "11th");
        assert_eq!(RuntimeError::ordinal(12), "12th");
        assert_eq!(RuntimeError::ordinal(13), "13th");
    }

    #[test]
    fn spanned_error_display_without_trace() {
        let err = SpannedError::without_trace(RuntimeError::StackOverflow);
        assert_eq!(format!("{err}"), "stack overflow\n");
    }

    #[test]
    fn spanned_error_display_with_trace() {
        let trace = vec![FrameTrace {
            function_name: "f".to_string(),
            span: Some(Span::new(0, 1, 3, 3, 5, 6)),
        }];
        let err = SpannedError::new(RuntimeError::StackOverflow, trace);
        let rendered = format!("{err}");
        assert!(rendered.contains("at f (3:5)"));
    }

    #[test]
    fn render_with_source_includes_context_lines() {
        let file = SourceFile::new("m.gad", "let a = 1\nlet b = 2\nboom()\nlet d = 4\n");
        let trace = vec![FrameTrace {
            function_name: "f".to_string(),
            span: Some(Span::new(20, 26, 3, 3, 1, 6)),
        }];
        let err = SpannedError::new(RuntimeError::StackOverflow, trace);
        let rendered = err.render_with_source(&file, 1);
        assert!(rendered.contains("at f (3:1)"));
        assert!(rendered.contains("let b = 2"));
        assert!(rendered.contains("boom()"));
        assert!(rendered.contains("let d = 4"));
    }
}
