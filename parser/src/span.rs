/// Source positions.
///
/// Tokens, AST nodes and every diagnostic carry a [`Span`] so errors can be
/// reported as `line:column` no matter which pass raised them.

/// A single position in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pos {
    /// Byte offset from the start of the input (0-based).
    pub offset: usize,
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based, in bytes).
    pub column: usize,
}

impl Pos {
    pub const fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    pub const fn origin() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A contiguous region of source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub const fn new(start: Pos, end: Pos) -> Self {
        Self { start, end }
    }

    /// Zero-width span at `pos`.
    pub const fn point(pos: Pos) -> Self {
        Self {
            start: pos,
            end: pos,
        }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        let start = if self.start.offset <= other.start.offset {
            self.start
        } else {
            other.start
        };
        let end = if self.end.offset >= other.end.offset {
            self.end
        } else {
            other.end
        };
        Span { start, end }
    }

    /// Shift a span produced by a nested lexer (interpolated code) so it
    /// points into the enclosing source.
    pub fn relocate(self, base: Pos) -> Span {
        let shift = |p: Pos| {
            if p.line == 1 {
                Pos::new(base.offset + p.offset, base.line, base.column + p.column - 1)
            } else {
                Pos::new(base.offset + p.offset, base.line + p.line - 1, p.column)
            }
        };
        Span::new(shift(self.start), shift(self.end))
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_covers_both() {
        let a = Span::new(Pos::new(4, 1, 5), Pos::new(6, 1, 7));
        let b = Span::new(Pos::new(0, 1, 1), Pos::new(2, 1, 3));
        let m = a.merge(b);
        assert_eq!(m.start.offset, 0);
        assert_eq!(m.end.offset, 6);
    }

    #[test]
    fn relocate_first_line_keeps_column_offset() {
        let inner = Span::point(Pos::new(2, 1, 3));
        let moved = inner.relocate(Pos::new(10, 4, 8));
        assert_eq!(moved.start, Pos::new(12, 4, 10));
    }

    #[test]
    fn relocate_later_line_keeps_inner_column() {
        let inner = Span::point(Pos::new(5, 2, 2));
        let moved = inner.relocate(Pos::new(10, 4, 8));
        assert_eq!(moved.start, Pos::new(15, 5, 2));
    }

    #[test]
    fn display_is_line_colon_column() {
        let s = Span::point(Pos::new(0, 3, 9));
        assert_eq!(s.to_string(), "3:9");
    }
}
