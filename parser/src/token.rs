/// Tokens produced by the lexer.
use crate::span::{Pos, Span};

/// Reserved words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Alias,
    And,
    Begin,
    Break,
    Case,
    Class,
    Def,
    Defined,
    Do,
    Else,
    Elsif,
    End,
    Ensure,
    False,
    For,
    If,
    In,
    Module,
    Next,
    Nil,
    Not,
    Or,
    Redo,
    Rescue,
    Retry,
    Return,
    SelfKw,
    Super,
    Then,
    True,
    Undef,
    Unless,
    Until,
    When,
    While,
    Yield,
    File,
    Line,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("alias", Keyword::Alias),
    ("and", Keyword::And),
    ("begin", Keyword::Begin),
    ("break", Keyword::Break),
    ("case", Keyword::Case),
    ("class", Keyword::Class),
    ("def", Keyword::Def),
    ("defined?", Keyword::Defined),
    ("do", Keyword::Do),
    ("else", Keyword::Else),
    ("elsif", Keyword::Elsif),
    ("end", Keyword::End),
    ("ensure", Keyword::Ensure),
    ("false", Keyword::False),
    ("for", Keyword::For),
    ("if", Keyword::If),
    ("in", Keyword::In),
    ("module", Keyword::Module),
    ("next", Keyword::Next),
    ("nil", Keyword::Nil),
    ("not", Keyword::Not),
    ("or", Keyword::Or),
    ("redo", Keyword::Redo),
    ("rescue", Keyword::Rescue),
    ("retry", Keyword::Retry),
    ("return", Keyword::Return),
    ("self", Keyword::SelfKw),
    ("super", Keyword::Super),
    ("then", Keyword::Then),
    ("true", Keyword::True),
    ("undef", Keyword::Undef),
    ("unless", Keyword::Unless),
    ("until", Keyword::Until),
    ("when", Keyword::When),
    ("while", Keyword::While),
    ("yield", Keyword::Yield),
    ("__FILE__", Keyword::File),
    ("__LINE__", Keyword::Line),
];

impl Keyword {
    pub fn lookup(word: &str) -> Option<Keyword> {
        KEYWORDS.iter().find(|(w, _)| *w == word).map(|(_, k)| *k)
    }

    pub fn as_str(self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, k)| *k == self)
            .map(|(w, _)| *w)
            .unwrap_or("?")
    }

    /// Keywords that close a statement list.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Keyword::End
                | Keyword::Else
                | Keyword::Elsif
                | Keyword::When
                | Keyword::In
                | Keyword::Rescue
                | Keyword::Ensure
                | Keyword::Then
                | Keyword::Do
        )
    }
}

/// Operators and punctuation, longest first so the lexer can match greedily.
pub const PUNCTUATION: &[&str] = &[
    "**=", "<=>", "===", "...", "<<=", ">>=", "&&=", "||=", "&.", "**", "==", "!=", ">=", "<=",
    "&&", "||", "<<", ">>", "=~", "!~", "+=", "-=", "*=", "/=", "%=", "|=", "&=", "^=", "::",
    "..", "=>", "->", "+", "-", "*", "/", "%", "=", "<", ">", "!", "&", "|", "^", "~", "?",
    ":", ",", ".", ";", "(", ")", "[", "]", "{", "}",
];

/// A piece of an interpolated string or heredoc.
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(Vec<u8>),
    /// Source text of a `#{...}` segment (or `#@ivar` / `#$global`),
    /// positioned where the code starts in the enclosing file.
    Code { source: String, pos: Pos },
}

/// The kind of a lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Local variable or method name, including a trailing `?` or `!`.
    Ident(String),
    /// Capitalised name.
    Const(String),
    /// `@name`
    IVar(String),
    /// `@@name`
    CVar(String),
    /// `$name`
    GVar(String),
    Keyword(Keyword),
    /// `name:` used as a hash key or keyword argument.
    Label(String),

    Integer(i64),
    /// Integer literal too large for 64 bits, as decimal digits with an
    /// optional leading `-`.
    BigInteger(String),
    /// Float literal text.
    Float(String),
    /// String without interpolation. Escapes can produce arbitrary bytes.
    Str(Vec<u8>),
    /// String with at least one interpolated segment.
    Interp(Vec<StrPart>),
    Symbol(String),
    /// `%w[...]`
    Words(Vec<String>),
    /// `%i[...]`
    Symbols(Vec<String>),
    Regex { source: String, flags: String },

    Punct(&'static str),
    Newline,
    Eof,
}

impl TokenKind {
    /// Human-readable name of the token kind (for error messages).
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::Ident(_) => "identifier",
            TokenKind::Const(_) => "constant",
            TokenKind::IVar(_) => "instance variable",
            TokenKind::CVar(_) => "class variable",
            TokenKind::GVar(_) => "global variable",
            TokenKind::Keyword(k) => k.as_str(),
            TokenKind::Label(_) => "label",
            TokenKind::Integer(_) | TokenKind::BigInteger(_) => "integer",
            TokenKind::Float(_) => "float",
            TokenKind::Str(_) | TokenKind::Interp(_) => "string",
            TokenKind::Symbol(_) => "symbol",
            TokenKind::Words(_) | TokenKind::Symbols(_) => "word list",
            TokenKind::Regex { .. } => "regex",
            TokenKind::Punct(p) => *p,
            TokenKind::Newline => "newline",
            TokenKind::Eof => "end of input",
        }
    }

    /// Whether a token of this kind can be the last token of an
    /// expression. Decides `/` (regex or division), `?x`, `%w` and the
    /// like.
    pub fn ends_expression(&self) -> bool {
        match self {
            TokenKind::Ident(_)
            | TokenKind::Const(_)
            | TokenKind::IVar(_)
            | TokenKind::CVar(_)
            | TokenKind::GVar(_)
            | TokenKind::Integer(_)
            | TokenKind::BigInteger(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::Interp(_)
            | TokenKind::Symbol(_)
            | TokenKind::Words(_)
            | TokenKind::Symbols(_)
            | TokenKind::Regex { .. } => true,
            TokenKind::Punct(p) => matches!(*p, ")" | "]" | "}"),
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::End
                    | Keyword::SelfKw
                    | Keyword::Nil
                    | Keyword::True
                    | Keyword::False
                    | Keyword::File
                    | Keyword::Line
            ),
            _ => false,
        }
    }

    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, TokenKind::Punct(q) if *q == p)
    }

    pub fn is_keyword(&self, k: Keyword) -> bool {
        matches!(self, TokenKind::Keyword(q) if *q == k)
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Ident(s) | TokenKind::Const(s) => write!(f, "{s}"),
            TokenKind::IVar(s) | TokenKind::CVar(s) | TokenKind::GVar(s) => write!(f, "{s}"),
            TokenKind::Keyword(k) => write!(f, "{}", k.as_str()),
            TokenKind::Label(s) => write!(f, "{s}:"),
            TokenKind::Integer(n) => write!(f, "{n}"),
            TokenKind::BigInteger(s) | TokenKind::Float(s) => write!(f, "{s}"),
            TokenKind::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            TokenKind::Interp(parts) => write!(f, "\"<{} parts>\"", parts.len()),
            TokenKind::Symbol(s) => write!(f, ":{s}"),
            TokenKind::Words(w) => write!(f, "%w[{}]", w.join(" ")),
            TokenKind::Symbols(w) => write!(f, "%i[{}]", w.join(" ")),
            TokenKind::Regex { source, flags } => write!(f, "/{source}/{flags}"),
            TokenKind::Punct(p) => write!(f, "{p}"),
            TokenKind::Newline => write!(f, "\\n"),
            TokenKind::Eof => write!(f, "<eof>"),
        }
    }
}

/// A token together with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Whitespace (not a newline) came right before this token.
    pub space_before: bool,
    /// Whitespace or a line end follows this token.
    pub space_after: bool,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, space_before: bool) -> Self {
        Self {
            kind,
            span,
            space_before,
            space_after: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup_round_trips() {
        for (word, kw) in KEYWORDS {
            assert_eq!(Keyword::lookup(word), Some(*kw));
            assert_eq!(kw.as_str(), *word);
        }
        assert_eq!(Keyword::lookup("lambda"), None);
    }

    #[test]
    fn punctuation_is_longest_first() {
        for (i, p) in PUNCTUATION.iter().enumerate() {
            for q in &PUNCTUATION[i + 1..] {
                assert!(
                    !(q.len() > p.len() && q.starts_with(p)),
                    "{q} must come before {p}"
                );
            }
        }
    }

    #[test]
    fn expression_enders() {
        assert!(TokenKind::Ident("x".into()).ends_expression());
        assert!(TokenKind::Punct(")").ends_expression());
        assert!(TokenKind::Keyword(Keyword::End).ends_expression());
        assert!(!TokenKind::Punct("=").ends_expression());
        assert!(!TokenKind::Punct("(").ends_expression());
        assert!(!TokenKind::Keyword(Keyword::If).ends_expression());
        assert!(!TokenKind::Newline.ends_expression());
    }
}
