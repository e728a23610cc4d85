//! Source positions, carried through the bytecode's source map for
//! humanized stack traces.

use serde::{Deserialize, Serialize};

/// A source code span with byte offsets and 1-indexed line/column positions.
///
/// The compiler (out of scope for this crate) is expected to populate one of
/// these per emitted instruction; the VM never constructs a `Span` itself,
/// only threads it through for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub start_column: usize,
    pub end_column: usize,
}

impl Span {
    pub fn new(
        start: usize,
        end: usize,
        start_line: usize,
        end_line: usize,
        start_column: usize,
        end_column: usize,
    ) -> Self {
        Self {
            start,
            end,
            start_line,
            end_line,
            start_column,
            end_column,
        }
    }

    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}
