//! # Parser
//!
//! Lexer and parser for a Ruby-like language, producing a tagged-tuple
//! syntax tree ([`Sexp`]).
//!
//! ## Architecture
//!
//! ```text
//!  source text
//!      │
//!      ▼
//!  ┌────────┐   tokens on demand   ┌────────┐   statements, definitions
//!  │ Lexer  │ ───────────────────▶ │ Parser │ ─────────┐
//!  └────────┘  (one-token pushback) └────────┘          │ expressions
//!                                       ▲               ▼
//!                                       │         ┌───────────┐
//!                                       └─────────│ shunting  │
//!                                  structural     └───────────┘
//!                                  keywords as values
//! ```
//!
//! Interpolated strings carry the source of each `#{...}` segment; the
//! parser hands those to a nested parser that shares node ids and the
//! visible local variables, with spans pointing back into the file.
//!
//! ```rust
//! let program = parser::parse("puts 1 + 2").unwrap();
//! assert_eq!(
//!     program.body.to_string(),
//!     "[:do, [:call, :puts, [:args, [:callm, 1, :\"+\", [:args, 2], nil]], nil]]"
//! );
//! ```

pub mod lexer;
pub mod operators;
pub mod parser;
pub mod quoted;
pub mod sexp;
mod shunting;
pub mod span;
pub mod token;

pub use lexer::{LexError, Lexer};
pub use parser::{ParseError, Parser, Program, StackDump};
pub use sexp::{Node, NodeId, NodeIds, Sexp, Tag};
pub use span::{Pos, Span};
pub use token::{Keyword, StrPart, Token, TokenKind};

/// Parse a whole source text.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    Parser::new(source).parse()
}

/// Parse `source`, reporting `file` for `__FILE__`.
pub fn parse_file(source: &str, file: &str) -> Result<Program, ParseError> {
    Parser::new(source).with_file(file).parse()
}
