/// Compiler diagnostics.
///
/// Every failure in the pipeline ends up as a [`CompileError`] tagged with
/// the phase that raised it. Errors are fatal: the first one aborts the
/// compilation and nothing is written.
use parser::{LexError, ParseError, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Transform,
    Emit,
    Io,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lex => "lex",
            Phase::Parse => "parse",
            Phase::Transform => "transform",
            Phase::Emit => "emit",
            Phase::Io => "io",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub phase: Phase,
    pub message: String,
    pub span: Option<Span>,
    /// Extra lines printed after the headline (the parser's stack dump).
    pub detail: Option<String>,
}

impl CompileError {
    pub fn new(phase: Phase, message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            phase,
            message: message.into(),
            span,
            detail: None,
        }
    }

    pub fn transform(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::new(Phase::Transform, message, span)
    }

    pub fn emit(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::new(Phase::Emit, message, span)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(Phase::Io, message, None)
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{} error at {}: {}", self.phase.as_str(), span, self.message)?,
            None => write!(f, "{} error: {}", self.phase.as_str(), self.message)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        Self::new(Phase::Lex, e.message, Some(e.span))
    }
}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        let detail = e.stack.as_ref().map(|dump| {
            format!(
                "\n  op: {} (priority {})\n  vstack: [{}]\n  rightv: {}",
                dump.operator,
                dump.priority,
                dump.vstack.join(", "),
                dump.rightv.as_deref().unwrap_or("nil")
            )
        });
        Self {
            phase: if e.lexical { Phase::Lex } else { Phase::Parse },
            message: e.message,
            span: Some(e.span),
            detail,
        }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use parser::{Pos, StackDump};

    fn span(line: usize, column: usize) -> Span {
        Span::point(Pos::new(0, line, column))
    }

    #[test]
    fn display_names_phase_and_position() {
        let e = CompileError::transform("uninitialized constant Foo", Some(span(3, 7)));
        assert_eq!(e.to_string(), "transform error at 3:7: uninitialized constant Foo");
    }

    #[test]
    fn display_without_span() {
        let e = CompileError::io("no such file");
        assert_eq!(e.to_string(), "io error: no such file");
    }

    #[test]
    fn parse_error_keeps_stack_dump() {
        let pe = ParseError::new("Missing value in expression", span(3, 7)).with_stack(StackDump {
            operator: "+".into(),
            priority: 75,
            vstack: vec!["[:callm, :a, :b]".into()],
            rightv: None,
        });
        let e = CompileError::from(pe);
        assert_eq!(
            e.to_string(),
            "parse error at 3:7: Missing value in expression\n  op: + (priority 75)\n  vstack: [[:callm, :a, :b]]\n  rightv: nil"
        );
    }

    #[test]
    fn lex_error_phase() {
        let e = CompileError::from(LexError::new("unterminated string", span(1, 1)));
        assert_eq!(e.phase, Phase::Lex);
        assert!(e.to_string().starts_with("lex error at 1:1"));
    }

    #[test]
    fn lexer_failure_inside_parser_keeps_lex_phase() {
        let pe = ParseError::from(LexError::new("unterminated literal", span(1, 5)));
        let e = CompileError::from(pe);
        assert_eq!(e.phase, Phase::Lex);
        assert_eq!(e.to_string(), "lex error at 1:5: unterminated literal");
    }
}
