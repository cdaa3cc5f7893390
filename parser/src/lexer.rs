/// Lexer for the Ruby-like source language.
///
/// The [`Lexer`] turns source text into [`Token`]s on demand. It is
/// restartable: the parser may push one token back with
/// [`Lexer::push_back`] and read it again.
///
/// # Context sensitivity
///
/// Several characters mean different things depending on whether the
/// previous token could end an expression:
///
/// | Text     | After a value (`x`, `)`, `end`) | Elsewhere                |
/// |----------|---------------------------------|--------------------------|
/// | `/`      | division                        | regex literal            |
/// | `?x`     | ternary `?`                     | character literal        |
/// | `%w[..]` | modulo                          | percent literal          |
/// | `<<ID`   | shift                           | heredoc                  |
/// | `-1`     | minus, then `1`                 | negative integer literal |
///
/// An identifier followed by a space and an unspaced literal (`puts /x/`,
/// `p ?a`) counts as a command call, so the literal reading wins.
///
/// # Heredocs
///
/// The body of `<<ID`, `<<-ID` and `<<~ID` starts on the line after the
/// opener. The lexer reads the body immediately, keeps lexing the rest of
/// the opener line, and skips over the body when it reaches that line's
/// newline.
use std::io::Read;

use crate::quoted;
use crate::span::{Pos, Span};
use crate::token::{Keyword, PUNCTUATION, Token, TokenKind};

/// Operator names accepted after `def` and `:`.
const OPERATOR_NAMES: &[&str] = &[
    "[]=", "[]", "<=>", "===", "==", "=~", "!=", "!~", "**", "+@", "-@", "<<", ">>", "<=", ">=",
    "+", "-", "*", "/", "%", "<", ">", "!", "&", "|", "^", "~",
];

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl LexError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl std::error::Error for LexError {}

/// What the previous token tells us about the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    /// Start of input or of a statement.
    Start,
    /// A bare identifier: ends an expression, but may also be a command
    /// call awaiting arguments.
    Ident,
    /// `.` or `&.`: the next word is a method name, never a keyword.
    Dot,
    /// `def`: the next token may be an operator method name.
    Def,
    /// Any other token that can end an expression.
    Value,
    /// Binary operator, `,`, opening bracket, `and`/`or`/`not`: a
    /// following newline does not end the statement.
    Continues,
    Other,
}

fn classify(kind: &TokenKind) -> Prev {
    match kind {
        TokenKind::Ident(_) => Prev::Ident,
        TokenKind::Punct(".") | TokenKind::Punct("&.") => Prev::Dot,
        TokenKind::Keyword(Keyword::Def) => Prev::Def,
        TokenKind::Newline | TokenKind::Punct(";") => Prev::Start,
        TokenKind::Keyword(Keyword::And | Keyword::Or | Keyword::Not) => Prev::Continues,
        k if k.ends_expression() => Prev::Value,
        TokenKind::Punct(_) => Prev::Continues,
        _ => Prev::Other,
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn is_space(b: Option<u8>) -> bool {
    matches!(b, None | Some(b' ' | b'\t' | b'\n' | b'\r'))
}

fn closing_delimiter(open: u8) -> u8 {
    match open {
        b'(' => b')',
        b'[' => b']',
        b'{' => b'}',
        b'<' => b'>',
        other => other,
    }
}

pub struct Lexer {
    src: Vec<u8>,
    pos: Pos,
    prev: Prev,
    /// Span of the most recently lexed token, the one `prev` describes.
    last_lexed: Span,
    pushed: Option<Token>,
    /// Where lexing continues once the current line's newline is reached,
    /// set after a heredoc body has been read.
    heredoc_resume: Option<Pos>,
    emitted_eof: bool,
    /// Where this source sits inside an enclosing file, for interpolated
    /// code lexed on its own.
    origin: Option<Pos>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            src: source.as_bytes().to_vec(),
            pos: Pos::origin(),
            prev: Prev::Start,
            last_lexed: Span::default(),
            pushed: None,
            heredoc_resume: None,
            emitted_eof: false,
            origin: None,
        }
    }

    /// Lex `source` as if it started at `origin` in some enclosing file.
    pub fn with_origin(source: &str, origin: Pos) -> Self {
        Self {
            origin: Some(origin),
            ..Self::new(source)
        }
    }

    pub fn from_str(source: &str) -> Self {
        Self::new(source)
    }

    /// Read the whole of `reader` and lex it.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut source = String::new();
        reader.read_to_string(&mut source)?;
        Ok(Self::new(&source))
    }

    pub fn pos(&self) -> Pos {
        self.pos
    }

    /// Return `token` so the next call to [`Lexer::next_token`] yields it
    /// again. One token of lookahead is all the parser ever reverses.
    pub fn push_back(&mut self, token: Token) {
        debug_assert!(self.pushed.is_none(), "second token pushed back");
        self.pushed = Some(token);
    }

    pub fn peek_token(&mut self) -> Result<&Token, LexError> {
        let tok = match self.pushed.take() {
            Some(tok) => tok,
            None => self.lex_next()?,
        };
        Ok(self.pushed.insert(tok))
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        match self.pushed.take() {
            Some(tok) => Ok(tok),
            None => self.lex_next(),
        }
    }

    /// The identifier lexed last at `span` is a local variable: it ends
    /// an expression, so `a /2` divides and `a <<x` shifts.
    pub fn mark_local(&mut self, span: Span) {
        if self.prev == Prev::Ident && self.last_lexed == span {
            self.prev = Prev::Value;
        }
    }

    fn lex_next(&mut self) -> Result<Token, LexError> {
        let tok = self.located()?;
        self.prev = classify(&tok.kind);
        self.last_lexed = tok.span;
        Ok(tok)
    }

    fn located(&mut self) -> Result<Token, LexError> {
        let Some(origin) = self.origin else {
            return self.lex();
        };
        match self.lex() {
            Ok(mut tok) => {
                tok.span = tok.span.relocate(origin);
                Ok(tok)
            }
            Err(e) => Err(LexError::new(e.message, e.span.relocate(origin))),
        }
    }

    // ── Byte cursor ───────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos.offset).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos.offset + n).copied()
    }

    fn rest(&self) -> &[u8] {
        &self.src[self.pos.offset.min(self.src.len())..]
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos.offset += 1;
        if b == b'\n' {
            self.pos.line += 1;
            self.pos.column = 1;
        } else {
            self.pos.column += 1;
        }
        Some(b)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    /// Consume a newline, skipping a heredoc body read from the line it
    /// ends.
    fn bump_newline(&mut self) {
        self.bump();
        if let Some(resume) = self.heredoc_resume.take() {
            self.pos = resume;
        }
    }

    fn value_ended(&self) -> bool {
        matches!(self.prev, Prev::Ident | Prev::Value)
    }

    /// Command-call position: `puts /re/`, `p ?a`, `foo <<~EOS`.
    fn command_arg(&self, space_before: bool) -> bool {
        self.prev == Prev::Ident && space_before && !is_space(self.peek_at(1))
    }

    fn error<T>(&self, message: impl Into<String>, start: Pos) -> Result<T, LexError> {
        Err(LexError::new(message, Span::new(start, self.pos)))
    }

    // ── Whitespace, comments, newlines ────────────────────────

    /// Whether the next non-blank, non-comment line starts with `.name`
    /// or `&.`, continuing a method chain.
    fn continues_chain(&self) -> bool {
        let mut i = self.pos.offset;
        let src = &self.src;
        while i < src.len() {
            match src[i] {
                b' ' | b'\t' | b'\r' | b'\n' => i += 1,
                b'#' => {
                    while i < src.len() && src[i] != b'\n' {
                        i += 1;
                    }
                }
                b'.' => return src.get(i + 1) != Some(&b'.'),
                b'&' => return src.get(i + 1) == Some(&b'.'),
                _ => return false,
            }
        }
        false
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        loop {
            while let Some(b) = self.peek() {
                self.bump();
                if b == b'\n' {
                    break;
                }
            }
            if self.peek().is_none() {
                return self.error("unterminated =begin comment", start);
            }
            if self.rest().starts_with(b"=end") {
                while !matches!(self.peek(), None | Some(b'\n')) {
                    self.bump();
                }
                return Ok(());
            }
        }
    }

    fn lex(&mut self) -> Result<Token, LexError> {
        let mut space_before = false;
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r') => {
                    self.bump();
                    space_before = true;
                }
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                    self.bump();
                    self.bump_newline();
                    space_before = true;
                }
                Some(b'#') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                Some(b'=') if self.pos.column == 1 && self.rest().starts_with(b"=begin") => {
                    self.skip_block_comment()?;
                }
                Some(b'_')
                    if self.pos.column == 1
                        && self.rest().starts_with(b"__END__")
                        && is_space(self.peek_at(7)) =>
                {
                    self.pos = Pos::new(self.src.len(), self.pos.line, self.pos.column);
                }
                Some(b'\n') => {
                    let start = self.pos;
                    self.bump_newline();
                    if matches!(self.prev, Prev::Start | Prev::Continues) || self.continues_chain()
                    {
                        space_before = true;
                        continue;
                    }
                    return Ok(Token::new(
                        TokenKind::Newline,
                        Span::new(start, self.pos),
                        space_before,
                    ));
                }
                _ => break,
            }
        }

        let start = self.pos;
        let Some(b) = self.peek() else {
            self.emitted_eof = true;
            return Ok(Token::new(TokenKind::Eof, Span::point(start), space_before));
        };

        let kind = match b {
            _ if self.prev == Prev::Def && !is_ident_byte(b) && b != b'(' => {
                match self.operator_name() {
                    Some(name) => TokenKind::Ident(name),
                    None => self.punctuation(start)?,
                }
            }
            b'0'..=b'9' => self.number(false, start)?,
            b'-' | b'+'
                if matches!(self.peek_at(1), Some(b'0'..=b'9')) && !self.value_ended() =>
            {
                self.bump();
                self.number(b == b'-', start)?
            }
            b'@' => self.instance_or_class_var(start)?,
            b'$' => self.global_var(start)?,
            b'"' => {
                self.bump();
                let (raw, body) = self.scan_delimited(b'"', b'"', true, start)?;
                self.double_quoted(&raw, body)?
            }
            b'\'' => {
                self.bump();
                let (raw, _) = self.scan_delimited(b'\'', b'\'', false, start)?;
                TokenKind::Str(quoted::unescape_single(&raw, b'\''))
            }
            b'`' => return self.error("command literals are not supported", start),
            b':' => self.colon(space_before, start)?,
            b'?' => match self.char_literal(space_before) {
                Some(kind) => kind,
                None => self.punctuation(start)?,
            },
            b'%' => match self.percent_literal(space_before, start)? {
                Some(kind) => kind,
                None => self.punctuation(start)?,
            },
            b'/' if !self.value_ended()
                || (self.command_arg(space_before) && self.peek_at(1) != Some(b'=')) =>
            {
                self.regex(start)?
            }
            b'<' if self.heredoc_start(space_before) => self.heredoc(start)?,
            b if is_ident_byte(b) => self.word(),
            _ => self.punctuation(start)?,
        };
        let mut tok = Token::new(kind, Span::new(start, self.pos), space_before);
        tok.space_after = is_space(self.peek());
        Ok(tok)
    }

    // ── Words ─────────────────────────────────────────────────

    fn operator_name(&mut self) -> Option<String> {
        let rest = self.rest();
        let name = OPERATOR_NAMES.iter().find(|op| rest.starts_with(op.as_bytes()))?;
        self.bump_n(name.len());
        Some((*name).to_string())
    }

    fn read_ident_bytes(&mut self) -> String {
        let begin = self.pos.offset;
        while matches!(self.peek(), Some(b) if is_ident_byte(b)) {
            self.bump();
        }
        String::from_utf8_lossy(&self.src[begin..self.pos.offset]).into_owned()
    }

    fn word(&mut self) -> TokenKind {
        let mut name = self.read_ident_bytes();
        let is_const = name.as_bytes()[0].is_ascii_uppercase();
        if !is_const
            && matches!(self.peek(), Some(b'?' | b'!'))
            && self.peek_at(1) != Some(b'=')
        {
            if let Some(b) = self.bump() {
                name.push(char::from(b));
            }
        }

        if self.peek() == Some(b':')
            && self.peek_at(1) != Some(b':')
            && self.prev != Prev::Dot
            && self.prev != Prev::Def
        {
            self.bump();
            return TokenKind::Label(name);
        }
        if self.prev == Prev::Dot {
            return if is_const {
                TokenKind::Const(name)
            } else {
                TokenKind::Ident(name)
            };
        }
        if let Some(kw) = Keyword::lookup(&name) {
            return TokenKind::Keyword(kw);
        }
        if is_const {
            TokenKind::Const(name)
        } else {
            TokenKind::Ident(name)
        }
    }

    fn instance_or_class_var(&mut self, start: Pos) -> Result<TokenKind, LexError> {
        self.bump();
        let class_var = self.peek() == Some(b'@');
        if class_var {
            self.bump();
        }
        if !matches!(self.peek(), Some(b) if is_ident_byte(b) && !b.is_ascii_digit()) {
            return self.error("'@' without a variable name", start);
        }
        let name = self.read_ident_bytes();
        Ok(if class_var {
            TokenKind::CVar(format!("@@{name}"))
        } else {
            TokenKind::IVar(format!("@{name}"))
        })
    }

    fn global_var(&mut self, start: Pos) -> Result<TokenKind, LexError> {
        self.bump();
        match self.peek() {
            Some(b) if is_ident_byte(b) => {
                let name = self.read_ident_bytes();
                Ok(TokenKind::GVar(format!("${name}")))
            }
            Some(
                b @ (b'!' | b'@' | b'&' | b'~' | b'=' | b'/' | b'\\' | b',' | b';' | b'.' | b'<'
                | b'>' | b'*' | b'$' | b'?' | b':' | b'"' | b'\''),
            ) => {
                self.bump();
                Ok(TokenKind::GVar(format!("${}", char::from(b))))
            }
            _ => self.error("'$' without a variable name", start),
        }
    }

    // ── Numbers ───────────────────────────────────────────────

    fn number(&mut self, negative: bool, start: Pos) -> Result<TokenKind, LexError> {
        let mut radix = 10;
        if self.peek() == Some(b'0') {
            match self.peek_at(1) {
                Some(b'x' | b'X') => radix = 16,
                Some(b'b' | b'B') => radix = 2,
                Some(b'o' | b'O') => radix = 8,
                Some(b'd' | b'D') => radix = 10,
                Some(b'0'..=b'9' | b'_') => {
                    radix = 8;
                    self.bump();
                }
                _ => {}
            }
            if matches!(self.peek_at(1), Some(b'x' | b'X' | b'b' | b'B' | b'o' | b'O' | b'd' | b'D'))
            {
                self.bump_n(2);
            }
        }

        let mut digits = self.digit_run(radix);
        if digits.is_empty() && radix != 10 && radix != 8 {
            return self.error("numeric literal without digits", start);
        }
        if digits.is_empty() {
            digits.push('0');
        }
        if matches!(self.peek(), Some(b'0'..=b'9')) {
            return self.error(format!("invalid digit for base {radix} literal"), start);
        }

        let sign = if negative { "-" } else { "" };
        if radix == 10 {
            let mut float = false;
            if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
                self.bump();
                digits.push('.');
                digits.push_str(&self.digit_run(10));
                float = true;
            }
            if matches!(self.peek(), Some(b'e' | b'E'))
                && (matches!(self.peek_at(1), Some(b'0'..=b'9'))
                    || (matches!(self.peek_at(1), Some(b'+' | b'-'))
                        && matches!(self.peek_at(2), Some(b'0'..=b'9'))))
            {
                self.bump();
                digits.push('e');
                if let Some(s @ (b'+' | b'-')) = self.peek() {
                    self.bump();
                    digits.push(char::from(s));
                }
                digits.push_str(&self.digit_run(10));
                float = true;
            }
            if float {
                return Ok(TokenKind::Float(format!("{sign}{digits}")));
            }
        }

        match i64::from_str_radix(&format!("{sign}{digits}"), radix) {
            Ok(n) => Ok(TokenKind::Integer(n)),
            Err(_) => Ok(TokenKind::BigInteger(radix_to_decimal(&digits, radix, negative))),
        }
    }

    /// Digits valid in `radix`, with single underscores between them.
    fn digit_run(&mut self, radix: u32) -> String {
        let mut out = String::new();
        loop {
            match self.peek() {
                Some(b) if char::from(b).is_digit(radix) => {
                    out.push(char::from(b));
                    self.bump();
                }
                Some(b'_')
                    if !out.is_empty()
                        && matches!(self.peek_at(1), Some(d) if char::from(d).is_digit(radix)) =>
                {
                    self.bump();
                }
                _ => return out,
            }
        }
    }

    // ── Quoted literals ───────────────────────────────────────

    /// Read up to the closing delimiter and return the raw body with the
    /// position where it starts. The opening delimiter is already consumed.
    fn scan_delimited(
        &mut self,
        open: u8,
        close: u8,
        interpolates: bool,
        start: Pos,
    ) -> Result<(String, Pos), LexError> {
        let body = self.pos;
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => return self.error("unterminated literal", start),
                Some(b'\\') => {
                    self.bump();
                    if self.bump().is_none() {
                        return self.error("unterminated literal", start);
                    }
                }
                Some(b'#') if interpolates && self.peek_at(1) == Some(b'{') => {
                    let Some(end) = quoted::matching_brace(&self.src, self.pos.offset + 2) else {
                        return self.error("unterminated interpolation", start);
                    };
                    let n = end + 1 - self.pos.offset;
                    self.bump_n(n);
                }
                Some(c) if c == close && depth == 0 => {
                    let raw =
                        String::from_utf8_lossy(&self.src[body.offset..self.pos.offset]).into_owned();
                    self.bump();
                    return Ok((raw, body));
                }
                Some(c) if c == close => {
                    depth -= 1;
                    self.bump();
                }
                Some(c) if c == open && open != close => {
                    depth += 1;
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn double_quoted(&self, raw: &str, body: Pos) -> Result<TokenKind, LexError> {
        let parts = quoted::interpolate(raw, body)
            .map_err(|e| LexError::new(e.message, Span::point(e.pos)))?;
        Ok(match quoted::plain(&parts) {
            Some(bytes) => TokenKind::Str(bytes),
            None => TokenKind::Interp(parts),
        })
    }

    fn colon(&mut self, space_before: bool, start: Pos) -> Result<TokenKind, LexError> {
        match self.peek_at(1) {
            Some(b':') => {
                self.bump_n(2);
                Ok(TokenKind::Punct("::"))
            }
            Some(q @ (b'"' | b'\'')) if !self.value_ended() || space_before => {
                self.bump_n(2);
                let (raw, body) = self.scan_delimited(q, q, q == b'"', start)?;
                let bytes = if q == b'"' {
                    match self.double_quoted(&raw, body)? {
                        TokenKind::Str(bytes) => bytes,
                        _ => return self.error("interpolated symbols are not supported", start),
                    }
                } else {
                    quoted::unescape_single(&raw, q)
                };
                Ok(TokenKind::Symbol(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Some(b) if (!self.value_ended() || space_before) && !is_space(Some(b)) => {
                self.bump();
                match self.symbol_name() {
                    Some(name) => Ok(TokenKind::Symbol(name)),
                    None => {
                        // Not a symbol after all: a lone `:`.
                        Ok(TokenKind::Punct(":"))
                    }
                }
            }
            _ => self.punctuation(start),
        }
    }

    fn symbol_name(&mut self) -> Option<String> {
        match self.peek()? {
            b'@' | b'$' => {
                let begin = self.pos.offset;
                self.bump();
                if self.peek() == Some(b'@') {
                    self.bump();
                }
                let name = self.read_ident_bytes();
                if name.is_empty() {
                    return None;
                }
                Some(String::from_utf8_lossy(&self.src[begin..self.pos.offset]).into_owned())
            }
            b if is_ident_byte(b) && !b.is_ascii_digit() => {
                let mut name = self.read_ident_bytes();
                match self.peek() {
                    Some(c @ (b'?' | b'!')) if self.peek_at(1) != Some(b'=') => {
                        self.bump();
                        name.push(char::from(c));
                    }
                    Some(b'=') if !matches!(self.peek_at(1), Some(b'=' | b'~' | b'>')) => {
                        self.bump();
                        name.push('=');
                    }
                    _ => {}
                }
                Some(name)
            }
            _ => self.operator_name(),
        }
    }

    fn char_literal(&mut self, space_before: bool) -> Option<TokenKind> {
        let next = self.peek_at(1);
        if is_space(next) || (self.value_ended() && !self.command_arg(space_before)) {
            return None;
        }
        let begin = self.pos.offset + 1;
        let (bytes, end) = if next == Some(b'\\') {
            quoted::decode_escape(&self.src, begin + 1).ok()?
        } else {
            let len = match next? {
                0xf0..=0xff => 4,
                0xe0..=0xef => 3,
                0xc0..=0xdf => 2,
                _ => 1,
            };
            let end = (begin + len).min(self.src.len());
            (self.src[begin..end].to_vec(), end)
        };
        if matches!(self.src.get(end), Some(&b) if is_ident_byte(b)) {
            return None;
        }
        let n = end - self.pos.offset;
        self.bump_n(n);
        Some(TokenKind::Str(bytes))
    }

    fn percent_literal(
        &mut self,
        space_before: bool,
        start: Pos,
    ) -> Result<Option<TokenKind>, LexError> {
        if self.value_ended() && !self.command_arg(space_before) {
            return Ok(None);
        }
        let is_delim = |b: Option<u8>| matches!(b, Some(b'(' | b'[' | b'{' | b'<' | b'|' | b'!' | b'/' | b'^'));
        let (letter, open) = match self.peek_at(1) {
            Some(c @ (b'w' | b'W' | b'i' | b'I' | b'q' | b'Q' | b's' | b'r'))
                if is_delim(self.peek_at(2)) =>
            {
                (c, self.peek_at(2))
            }
            b if is_delim(b) && b != Some(b'/') => (b'Q', b),
            _ => return Ok(None),
        };
        let Some(open) = open else {
            return Ok(None);
        };
        let close = closing_delimiter(open);
        self.bump_n(if letter == b'Q' && self.peek_at(1) == Some(open) { 2 } else { 3 });
        let interpolates = matches!(letter, b'Q' | b'W' | b'I');
        let (raw, body) = self.scan_delimited(open, close, interpolates, start)?;
        let kind = match letter {
            b'q' => TokenKind::Str(quoted::unescape_single(&raw, close)),
            b'Q' => self.double_quoted(&raw, body)?,
            b'w' | b'W' => TokenKind::Words(raw.split_whitespace().map(str::to_string).collect()),
            b'i' | b'I' => {
                TokenKind::Symbols(raw.split_whitespace().map(str::to_string).collect())
            }
            b's' => TokenKind::Symbol(raw),
            _ => TokenKind::Regex {
                source: raw,
                flags: self.regex_flags(),
            },
        };
        Ok(Some(kind))
    }

    fn regex(&mut self, start: Pos) -> Result<TokenKind, LexError> {
        self.bump();
        let begin = self.pos.offset;
        let mut in_class = false;
        let mut source = String::new();
        loop {
            match self.peek() {
                None => return self.error("unterminated regex", start),
                Some(b'\\') => {
                    self.bump();
                    match self.bump() {
                        Some(b'/') => source.push('/'),
                        Some(b) => {
                            source.push('\\');
                            source.push(char::from(b));
                        }
                        None => return self.error("unterminated regex", start),
                    }
                    continue;
                }
                Some(b'[') => in_class = true,
                Some(b']') => in_class = false,
                Some(b'/') if !in_class => break,
                _ => {}
            }
            self.bump();
            if let Some(&b) = self.src.get(self.pos.offset - 1) {
                if b >= 0x80 {
                    // Multi-byte characters are copied whole below.
                    continue;
                }
                source.push(char::from(b));
            }
        }
        if self.src[begin..self.pos.offset].iter().any(|&b| b >= 0x80) {
            source = String::from_utf8_lossy(&self.src[begin..self.pos.offset]).replace("\\/", "/");
        }
        self.bump();
        Ok(TokenKind::Regex {
            source,
            flags: self.regex_flags(),
        })
    }

    fn regex_flags(&mut self) -> String {
        let mut flags = String::new();
        while let Some(b @ (b'i' | b'm' | b'x' | b'o' | b'u' | b'n' | b's' | b'e')) = self.peek() {
            flags.push(char::from(b));
            self.bump();
        }
        flags
    }

    // ── Heredocs ──────────────────────────────────────────────

    fn heredoc_start(&self, space_before: bool) -> bool {
        if self.peek_at(1) != Some(b'<') {
            return false;
        }
        if self.value_ended() && !(self.prev == Prev::Ident && space_before) {
            return false;
        }
        let mut i = 2;
        if matches!(self.peek_at(i), Some(b'~' | b'-')) {
            i += 1;
        }
        matches!(self.peek_at(i), Some(b) if b == b'"' || b == b'\'' || b == b'_' || b.is_ascii_alphabetic())
    }

    fn heredoc(&mut self, start: Pos) -> Result<TokenKind, LexError> {
        self.bump_n(2);
        let squiggly = self.peek() == Some(b'~');
        let indented_end = squiggly || self.peek() == Some(b'-');
        if indented_end {
            self.bump();
        }
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => {
                self.bump();
                Some(q)
            }
            _ => None,
        };
        let id = match quote {
            Some(q) => {
                let begin = self.pos.offset;
                while !matches!(self.peek(), None | Some(b'\n')) && self.peek() != Some(q) {
                    self.bump();
                }
                if self.peek() != Some(q) {
                    return self.error("unterminated heredoc identifier", start);
                }
                let id = String::from_utf8_lossy(&self.src[begin..self.pos.offset]).into_owned();
                self.bump();
                id
            }
            None => self.read_ident_bytes(),
        };

        let body_start = match self.heredoc_resume {
            Some(resume) => resume,
            None => {
                let Some(nl) = self.src[self.pos.offset..].iter().position(|&b| b == b'\n') else {
                    return self.error(format!("unterminated heredoc {id}"), start);
                };
                Pos::new(self.pos.offset + nl + 1, self.pos.line + 1, 1)
            }
        };

        let mut line_start = body_start.offset;
        let mut line_no = body_start.line;
        let (body_end, resume) = loop {
            if line_start >= self.src.len() {
                return self.error(format!("unterminated heredoc {id}"), start);
            }
            let line_end = self.src[line_start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(self.src.len(), |n| line_start + n);
            let line = String::from_utf8_lossy(&self.src[line_start..line_end]);
            let line = line.trim_end_matches('\r');
            let matches_id = if indented_end {
                line.trim_start() == id
            } else {
                line == id
            };
            if matches_id {
                let next = (line_end + 1).min(self.src.len());
                break (line_start, Pos::new(next, line_no + 1, 1));
            }
            line_start = line_end + 1;
            line_no += 1;
        };

        let raw = String::from_utf8_lossy(&self.src[body_start.offset..body_end]).into_owned();
        self.heredoc_resume = Some(resume);

        let raw = if squiggly {
            quoted::strip_common_indent(&raw)
        } else {
            raw
        };
        if quote == Some(b'\'') {
            return Ok(TokenKind::Str(raw.into_bytes()));
        }
        self.double_quoted(&raw, body_start)
    }

    // ── Operators ─────────────────────────────────────────────

    fn punctuation(&mut self, start: Pos) -> Result<TokenKind, LexError> {
        let rest = self.rest();
        match PUNCTUATION.iter().find(|p| rest.starts_with(p.as_bytes())) {
            Some(&p) => {
                self.bump_n(p.len());
                Ok(TokenKind::Punct(p))
            }
            None => {
                let ch = rest.first().map_or('?', |&b| char::from(b));
                self.bump();
                self.error(format!("unexpected character {ch:?}"), start)
            }
        }
    }
}

/// Convert digits in `radix` to decimal text.
fn radix_to_decimal(digits: &str, radix: u32, negative: bool) -> String {
    const BASE: u64 = 1_000_000_000;
    // Little-endian base 10^9 limbs.
    let mut limbs: Vec<u64> = vec![0];
    for d in digits.chars().filter_map(|c| c.to_digit(radix)) {
        let mut carry = u64::from(d);
        for limb in limbs.iter_mut() {
            let v = *limb * u64::from(radix) + carry;
            *limb = v % BASE;
            carry = v / BASE;
        }
        while carry > 0 {
            limbs.push(carry % BASE);
            carry /= BASE;
        }
    }
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    let mut iter = limbs.iter().rev();
    if let Some(top) = iter.next() {
        out.push_str(&top.to_string());
    }
    for limb in iter {
        out.push_str(&format!("{limb:09}"));
    }
    out
}

impl Iterator for Lexer {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted_eof && self.pushed.is_none() {
            return None;
        }
        match self.next_token() {
            Ok(tok) => Some(Ok(tok)),
            Err(err) => {
                self.emitted_eof = true;
                Some(Err(err))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StrPart;

    fn tokens(src: &str) -> Vec<Token> {
        Lexer::from_str(src).map(|t| t.unwrap()).collect()
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokens(src).into_iter().map(|t| t.kind).collect()
    }

    fn ident(s: &str) -> TokenKind {
        TokenKind::Ident(s.to_string())
    }

    fn str_tok(s: &str) -> TokenKind {
        TokenKind::Str(s.as_bytes().to_vec())
    }

    fn lex_err(src: &str) -> LexError {
        Lexer::from_str(src)
            .find_map(|t| t.err())
            .expect("expected a lex error")
    }

    // ── Numbers ───────────────────────────────────────────────

    #[test]
    fn lex_integers() {
        assert_eq!(kinds("42"), vec![TokenKind::Integer(42), TokenKind::Eof]);
        assert_eq!(kinds("1_000"), vec![TokenKind::Integer(1000), TokenKind::Eof]);
        assert_eq!(kinds("0xff"), vec![TokenKind::Integer(255), TokenKind::Eof]);
        assert_eq!(kinds("0b101"), vec![TokenKind::Integer(5), TokenKind::Eof]);
        assert_eq!(kinds("017"), vec![TokenKind::Integer(15), TokenKind::Eof]);
    }

    #[test]
    fn lex_negative_literal_only_in_value_position() {
        assert_eq!(
            kinds("x = -7"),
            vec![ident("x"), TokenKind::Punct("="), TokenKind::Integer(-7), TokenKind::Eof]
        );
        assert_eq!(
            kinds("x -7"),
            vec![ident("x"), TokenKind::Punct("-"), TokenKind::Integer(7), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_big_integer() {
        assert_eq!(
            kinds("123456789012345678901234567890"),
            vec![
                TokenKind::BigInteger("123456789012345678901234567890".into()),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("0xffffffffffffffffff"),
            vec![TokenKind::BigInteger("4722366482869645213695".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_floats_and_ranges() {
        assert_eq!(kinds("1.5"), vec![TokenKind::Float("1.5".into()), TokenKind::Eof]);
        assert_eq!(kinds("2e10"), vec![TokenKind::Float("2e10".into()), TokenKind::Eof]);
        assert_eq!(
            kinds("1..2"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Punct(".."),
                TokenKind::Integer(2),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("3.times"),
            vec![TokenKind::Integer(3), TokenKind::Punct("."), ident("times"), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_bad_octal_digit() {
        assert!(lex_err("09").message.contains("invalid digit"));
    }

    // ── Words ─────────────────────────────────────────────────

    #[test]
    fn lex_identifiers_keywords_constants() {
        assert_eq!(
            kinds("def empty? Foo @a @@b $c"),
            vec![
                TokenKind::Keyword(Keyword::Def),
                ident("empty?"),
                TokenKind::Const("Foo".into()),
                TokenKind::IVar("@a".into()),
                TokenKind::CVar("@@b".into()),
                TokenKind::GVar("$c".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_keyword_after_dot_is_a_method_name() {
        assert_eq!(
            kinds("x.class"),
            vec![ident("x"), TokenKind::Punct("."), ident("class"), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_bang_before_equals_is_an_operator() {
        assert_eq!(
            kinds("a!=b"),
            vec![ident("a"), TokenKind::Punct("!="), ident("b"), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_labels() {
        assert_eq!(
            kinds("{a: 1}"),
            vec![
                TokenKind::Punct("{"),
                TokenKind::Label("a".into()),
                TokenKind::Integer(1),
                TokenKind::Punct("}"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_operator_method_name_after_def() {
        assert_eq!(
            kinds("def []=(k, v)")[1],
            ident("[]=")
        );
        assert_eq!(kinds("def /(o)")[1], ident("/"));
        assert_eq!(kinds("def -@")[1], ident("-@"));
    }

    // ── Symbols ───────────────────────────────────────────────

    #[test]
    fn lex_symbols() {
        assert_eq!(
            kinds(":foo :bar? :x= :[]= :+@ :<=> :@iv :\"a b\""),
            vec![
                TokenKind::Symbol("foo".into()),
                TokenKind::Symbol("bar?".into()),
                TokenKind::Symbol("x=".into()),
                TokenKind::Symbol("[]=".into()),
                TokenKind::Symbol("+@".into()),
                TokenKind::Symbol("<=>".into()),
                TokenKind::Symbol("@iv".into()),
                TokenKind::Symbol("a b".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_hash_rocket_after_symbol() {
        assert_eq!(
            kinds(":a=>1"),
            vec![
                TokenKind::Symbol("a".into()),
                TokenKind::Punct("=>"),
                TokenKind::Integer(1),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_ternary_colon_and_scope() {
        assert_eq!(
            kinds("a ? b : c"),
            vec![
                ident("a"),
                TokenKind::Punct("?"),
                ident("b"),
                TokenKind::Punct(":"),
                ident("c"),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("A::B"),
            vec![
                TokenKind::Const("A".into()),
                TokenKind::Punct("::"),
                TokenKind::Const("B".into()),
                TokenKind::Eof
            ]
        );
    }

    // ── Strings ───────────────────────────────────────────────

    #[test]
    fn lex_double_quoted_escapes() {
        assert_eq!(kinds(r#""a\tb\n""#), vec![str_tok("a\tb\n"), TokenKind::Eof]);
        assert_eq!(
            kinds(r#""\M-a\C-a\M-\C-a""#),
            vec![TokenKind::Str(vec![0xe1, 0x01, 0x81]), TokenKind::Eof]
        );
        assert_eq!(kinds(r#""\q""#), vec![str_tok("q"), TokenKind::Eof]);
    }

    #[test]
    fn lex_single_quoted_keeps_escapes() {
        assert_eq!(kinds(r"'a\nb\'c'"), vec![str_tok("a\\nb'c"), TokenKind::Eof]);
    }

    #[test]
    fn lex_interpolation() {
        let ks = kinds(r#""x=#{x + "}"}!""#);
        match &ks[0] {
            TokenKind::Interp(parts) => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[1], StrPart::Code { source, .. } if source == "x + \"}\""));
            }
            other => panic!("expected interpolation, got {other:?}"),
        }
    }

    #[test]
    fn lex_escaped_interpolation_is_literal() {
        assert_eq!(kinds(r#""\#{x}""#), vec![str_tok("#{x}"), TokenKind::Eof]);
    }

    #[test]
    fn lex_char_literals() {
        assert_eq!(
            kinds("x = ?a"),
            vec![ident("x"), TokenKind::Punct("="), str_tok("a"), TokenKind::Eof]
        );
        assert_eq!(
            kinds("c == ?\\n"),
            vec![ident("c"), TokenKind::Punct("=="), str_tok("\n"), TokenKind::Eof]
        );
        assert_eq!(kinds("?\\M-a")[0], TokenKind::Str(vec![0xe1]));
    }

    #[test]
    fn lex_percent_literals() {
        assert_eq!(
            kinds("%w[a b  c]"),
            vec![
                TokenKind::Words(vec!["a".into(), "b".into(), "c".into()]),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("%q(it's (nested))"), vec![str_tok("it's (nested)"), TokenKind::Eof]);
        assert_eq!(kinds("%i{a b}")[0], TokenKind::Symbols(vec!["a".into(), "b".into()]));
        assert_eq!(
            kinds("x % 3"),
            vec![ident("x"), TokenKind::Punct("%"), TokenKind::Integer(3), TokenKind::Eof]
        );
    }

    #[test]
    fn lex_unterminated_string() {
        let err = lex_err("\"abc");
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.span.start.column, 1);
    }

    // ── Regex vs division ─────────────────────────────────────

    #[test]
    fn slash_after_value_is_division() {
        assert_eq!(
            kinds("a / b / c"),
            vec![
                ident("a"),
                TokenKind::Punct("/"),
                ident("b"),
                TokenKind::Punct("/"),
                ident("c"),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("(x)/2"),
            vec![
                TokenKind::Punct("("),
                ident("x"),
                TokenKind::Punct(")"),
                TokenKind::Punct("/"),
                TokenKind::Integer(2),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn slash_in_operand_position_is_regex() {
        let regex = |s: &str, f: &str| TokenKind::Regex {
            source: s.into(),
            flags: f.into(),
        };
        assert_eq!(
            kinds("x = /ab+c/i"),
            vec![ident("x"), TokenKind::Punct("="), regex("ab+c", "i"), TokenKind::Eof]
        );
        assert_eq!(
            kinds("foo(/a\\/b/)"),
            vec![
                ident("foo"),
                TokenKind::Punct("("),
                regex("a/b", ""),
                TokenKind::Punct(")"),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("puts /x/")[1], regex("x", ""));
        assert_eq!(kinds("if /[/]/")[1], regex("[/]", ""));
    }

    #[test]
    fn slash_after_known_local_is_division() {
        let mut lx = Lexer::from_str("a /2");
        let a = lx.next_token().unwrap();
        lx.mark_local(a.span);
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Punct("/"));
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Integer(2));

        // Unmarked, the same text is a command call with a regex.
        assert!(lex_err("a /2").message.contains("unterminated regex"));
    }

    #[test]
    fn shift_after_known_local_is_not_heredoc() {
        let mut lx = Lexer::from_str("a <<b");
        let a = lx.next_token().unwrap();
        lx.mark_local(a.span);
        assert_eq!(lx.next_token().unwrap().kind, TokenKind::Punct("<<"));
        assert_eq!(lx.next_token().unwrap().kind, ident("b"));
    }

    #[test]
    fn marking_a_stale_identifier_is_ignored() {
        let mut lx = Lexer::from_str("a b /x/");
        let a = lx.next_token().unwrap();
        let _b = lx.next_token().unwrap();
        lx.mark_local(a.span);
        assert!(matches!(lx.next_token().unwrap().kind, TokenKind::Regex { .. }));
    }

    #[test]
    fn unterminated_regex() {
        assert!(lex_err("x = /abc").message.contains("unterminated regex"));
    }

    // ── Heredocs ──────────────────────────────────────────────

    #[test]
    fn heredoc_plain() {
        let src = "x = <<EOS\nhello\n  world\nEOS\ny";
        assert_eq!(
            kinds(src),
            vec![
                ident("x"),
                TokenKind::Punct("="),
                str_tok("hello\n  world\n"),
                TokenKind::Newline,
                ident("y"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn heredoc_rest_of_line_still_lexes() {
        let src = "foo(<<~A, 1)\n  body\n  A\nbar";
        assert_eq!(
            kinds(src),
            vec![
                ident("foo"),
                TokenKind::Punct("("),
                str_tok("body\n"),
                TokenKind::Punct(","),
                TokenKind::Integer(1),
                TokenKind::Punct(")"),
                TokenKind::Newline,
                ident("bar"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn heredoc_squiggly_strips_before_escapes() {
        let src = "s = <<~EOS\n    a\\tb\n      c\n    EOS\n";
        assert_eq!(kinds(src)[2], str_tok("a\tb\n  c\n"));
    }

    #[test]
    fn heredoc_single_quoted_is_raw() {
        let src = "s = <<~'EOS'\n  a\\n#{x}\n  EOS\n";
        assert_eq!(kinds(src)[2], str_tok("a\\n#{x}\n"));
    }

    #[test]
    fn heredoc_line_continuation_joins_lines() {
        let src = "s = <<-EOS\none \\\ntwo\n  EOS\n";
        assert_eq!(kinds(src)[2], str_tok("one two\n"));
    }

    #[test]
    fn heredoc_interpolates() {
        let src = "s = <<EOS\nv=#{v}\nEOS\n";
        assert!(matches!(kinds(src)[2], TokenKind::Interp(_)));
    }

    #[test]
    fn two_heredocs_on_one_line() {
        let src = "f(<<A, <<B)\na\nA\nb\nB\nz";
        let ks = kinds(src);
        assert_eq!(ks[2], str_tok("a\n"));
        assert_eq!(ks[4], str_tok("b\n"));
        assert_eq!(ks[7], ident("z"));
    }

    #[test]
    fn unterminated_heredoc() {
        assert!(lex_err("x = <<EOS\nabc\n").message.contains("unterminated heredoc"));
    }

    #[test]
    fn shift_is_not_a_heredoc() {
        assert_eq!(
            kinds("a << B"),
            vec![ident("a"), TokenKind::Punct("<<"), TokenKind::Const("B".into()), TokenKind::Eof]
        );
    }

    // ── Newlines and comments ─────────────────────────────────

    #[test]
    fn newlines_collapse_and_follow_operators() {
        assert_eq!(
            kinds("a +\n\n b\n\nc"),
            vec![
                ident("a"),
                TokenKind::Punct("+"),
                ident("b"),
                TokenKind::Newline,
                ident("c"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn leading_dot_continues_chain() {
        assert_eq!(
            kinds("list\n  # comment\n  .map\n  &.size"),
            vec![
                ident("list"),
                TokenKind::Punct("."),
                ident("map"),
                TokenKind::Punct("&."),
                ident("size"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("a # note\n=begin\nignored\n=end\nb"),
            vec![ident("a"), TokenKind::Newline, ident("b"), TokenKind::Eof]
        );
    }

    #[test]
    fn space_before_is_recorded() {
        let toks = tokens("foo -1");
        assert!(toks[1].space_before);
        assert!(!toks[2].space_before);
    }

    // ── Push-back ─────────────────────────────────────────────

    #[test]
    fn push_back_replays_token() {
        let mut lx = Lexer::from_str("a b");
        let a = lx.next_token().unwrap();
        lx.push_back(a.clone());
        assert_eq!(lx.next_token().unwrap(), a);
        assert_eq!(lx.next_token().unwrap().kind, ident("b"));
    }

    #[test]
    fn peek_then_push_back_keeps_one_token() {
        let mut lx = Lexer::from_str("a b");
        assert_eq!(lx.peek_token().unwrap().kind, ident("a"));
        let a = lx.next_token().unwrap();
        assert_eq!(a.kind, ident("a"));
        lx.push_back(a);
        assert_eq!(lx.peek_token().unwrap().kind, ident("a"));
        lx.next_token().unwrap();
        assert_eq!(lx.next_token().unwrap().kind, ident("b"));
    }

    #[test]
    #[should_panic(expected = "second token pushed back")]
    #[cfg(debug_assertions)]
    fn push_back_holds_a_single_token() {
        let mut lx = Lexer::from_str("a b");
        let a = lx.next_token().unwrap();
        let b = lx.next_token().unwrap();
        lx.push_back(b);
        lx.push_back(a);
    }

    #[test]
    fn spans_track_lines() {
        let toks = tokens("a\n  bb");
        assert_eq!(toks[2].span.start.line, 2);
        assert_eq!(toks[2].span.start.column, 3);
    }

    // ── Escape round trip ─────────────────────────────────────

    #[test]
    fn escaped_literal_relexes_identically() {
        for src in [r#""a\tb""#, r#""\M-\C-x\e\0""#, r#""q\"\\ #x""#, r#""é\x7f""#] {
            let TokenKind::Str(bytes) = kinds(src).remove(0) else {
                panic!("expected string for {src}");
            };
            let again = format!("\"{}\"", quoted::escape_bytes(&bytes));
            assert_eq!(kinds(&again)[0], TokenKind::Str(bytes), "round trip of {src}");
        }
    }
}
