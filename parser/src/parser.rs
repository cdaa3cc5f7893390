/// Statement-level parser.
///
/// Statement lists, definitions, control structures, blocks and
/// parameter lists are parsed by recursive descent here. Expressions go
/// through the operator-precedence engine in [`crate::shunting`], which
/// calls back into this module whenever it meets a structural keyword in
/// value position. That is what lets `(if c; 1; end) + 2` or
/// `x = case y ... end` parse like any other value.
use std::collections::HashSet;

use crate::lexer::{LexError, Lexer};
use crate::sexp::{NodeIds, Sexp, Tag};
use crate::span::{Pos, Span};
use crate::token::{Keyword, StrPart, Token, TokenKind};

// ═══════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════

/// State of the expression engine when it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDump {
    pub operator: String,
    pub priority: u8,
    pub vstack: Vec<String>,
    pub rightv: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    pub stack: Option<StackDump>,
    /// Raised by the lexer while the parser was pulling tokens.
    pub lexical: bool,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            stack: None,
            lexical: false,
        }
    }

    pub fn with_stack(mut self, stack: StackDump) -> Self {
        self.stack = Some(stack);
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = if self.lexical { "lex" } else { "parse" };
        write!(f, "{phase} error at {}: {}", self.span, self.message)?;
        if let Some(dump) = &self.stack {
            write!(f, "\n  op: {} (priority {})", dump.operator, dump.priority)?;
            write!(f, "\n  vstack: [{}]", dump.vstack.join(", "))?;
            write!(f, "\n  rightv: {}", dump.rightv.as_deref().unwrap_or("nil"))?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            lexical: true,
            ..ParseError::new(e.message, e.span)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Parser state
// ═══════════════════════════════════════════════════════════════════

/// A parsed compilation unit: the tree plus the id source that later
/// passes keep drawing from.
#[derive(Debug)]
pub struct Program {
    pub body: Sexp,
    pub ids: NodeIds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Top,
    Class,
    Def,
    Block,
}

/// Local variables known at a point in the source. Blocks see their
/// enclosing scope; `def`, `class` and `module` start afresh.
#[derive(Debug)]
struct LocalScope {
    kind: ScopeKind,
    vars: HashSet<String>,
}

impl LocalScope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            vars: HashSet::new(),
        }
    }
}

/// Predicate on the lookahead token that ends a statement list.
pub(crate) type Stop = fn(&TokenKind) -> bool;

fn stop_eof(k: &TokenKind) -> bool {
    matches!(k, TokenKind::Eof)
}

fn stop_end(k: &TokenKind) -> bool {
    k.is_keyword(Keyword::End)
}

fn stop_if_branch(k: &TokenKind) -> bool {
    matches!(
        k,
        TokenKind::Keyword(Keyword::End | Keyword::Else | Keyword::Elsif)
    )
}

fn stop_when(k: &TokenKind) -> bool {
    matches!(
        k,
        TokenKind::Keyword(Keyword::When | Keyword::In | Keyword::Else | Keyword::End)
    )
}

fn stop_begin(k: &TokenKind) -> bool {
    matches!(
        k,
        TokenKind::Keyword(Keyword::Rescue | Keyword::Else | Keyword::Ensure | Keyword::End)
    )
}

pub(crate) fn stop_paren(k: &TokenKind) -> bool {
    k.is_punct(")")
}

pub(crate) fn stop_brace(k: &TokenKind) -> bool {
    k.is_punct("}")
}

fn stop_lambda_params(k: &TokenKind) -> bool {
    k.is_punct("{") || k.is_keyword(Keyword::Do)
}

fn stop_line(k: &TokenKind) -> bool {
    matches!(k, TokenKind::Newline | TokenKind::Punct(";") | TokenKind::Punct("="))
}

/// Names that can be assigned to.
fn is_assignable(name: &str) -> bool {
    !matches!(name, "self" | "nil" | "true" | "false")
}

fn is_local_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_' || !c.is_ascii())
        && !name.ends_with(['?', '!'])
}

pub struct Parser {
    pub(crate) lexer: Lexer,
    pub(crate) ids: NodeIds,
    scopes: Vec<LocalScope>,
    file: String,
    pub(crate) last_span: Span,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Self::from_lexer(Lexer::new(source), NodeIds::new())
    }

    pub fn from_lexer(lexer: Lexer, ids: NodeIds) -> Self {
        Self {
            lexer,
            ids,
            scopes: vec![LocalScope::new(ScopeKind::Top)],
            file: "-".to_string(),
            last_span: Span::default(),
        }
    }

    /// Name reported by `__FILE__`.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    /// Parse the whole input into a `Do` node.
    pub fn parse(mut self) -> Result<Program, ParseError> {
        let start = self.lexer.pos();
        let stmts = self.statements(stop_eof)?;
        let eof = self.next()?;
        let body = self.ids.node(Tag::Do, Span::new(start, eof.span.end), stmts);
        log::trace!("parsed {} top-level statements", body.children().len());
        Ok(Program {
            body,
            ids: self.ids,
        })
    }

    // ── Tokens ────────────────────────────────────────────────

    pub(crate) fn next(&mut self) -> Result<Token, ParseError> {
        let tok = self.lexer.next_token()?;
        if let TokenKind::Ident(name) = &tok.kind {
            if self.is_local(name) {
                self.lexer.mark_local(tok.span);
            }
        }
        self.last_span = tok.span;
        Ok(tok)
    }

    pub(crate) fn peek(&mut self) -> Result<&Token, ParseError> {
        Ok(self.lexer.peek_token()?)
    }

    pub(crate) fn push_back(&mut self, tok: Token) {
        self.lexer.push_back(tok);
    }

    pub(crate) fn at_punct(&mut self, p: &str) -> Result<bool, ParseError> {
        Ok(self.peek()?.kind.is_punct(p))
    }

    pub(crate) fn at_keyword(&mut self, k: Keyword) -> Result<bool, ParseError> {
        Ok(self.peek()?.kind.is_keyword(k))
    }

    /// `(` with nothing between it and the previous token.
    pub(crate) fn at_tight_paren(&mut self) -> Result<bool, ParseError> {
        let tok = self.peek()?;
        Ok(tok.kind.is_punct("(") && !tok.space_before)
    }

    pub(crate) fn accept_punct(&mut self, p: &str) -> Result<bool, ParseError> {
        if self.at_punct(p)? {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn accept_keyword(&mut self, k: Keyword) -> Result<bool, ParseError> {
        if self.at_keyword(k)? {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn expect_punct(&mut self, p: &str) -> Result<Span, ParseError> {
        let tok = self.next()?;
        if tok.kind.is_punct(p) {
            Ok(tok.span)
        } else {
            Err(self.unexpected(&tok, &format!("'{p}'")))
        }
    }

    pub(crate) fn expect_keyword(&mut self, k: Keyword) -> Result<Span, ParseError> {
        let tok = self.next()?;
        if tok.kind.is_keyword(k) {
            Ok(tok.span)
        } else {
            Err(self.unexpected(&tok, &format!("'{}'", k.as_str())))
        }
    }

    pub(crate) fn unexpected(&self, tok: &Token, wanted: &str) -> ParseError {
        let found = match &tok.kind {
            TokenKind::Eof | TokenKind::Newline => tok.kind.name().to_string(),
            other => format!("'{other}'"),
        };
        ParseError::new(format!("expected {wanted}, found {found}"), tok.span)
    }

    pub(crate) fn skip_newlines(&mut self) -> Result<(), ParseError> {
        while matches!(self.peek()?.kind, TokenKind::Newline) {
            self.next()?;
        }
        Ok(())
    }

    fn skip_terms(&mut self) -> Result<(), ParseError> {
        while matches!(self.peek()?.kind, TokenKind::Newline | TokenKind::Punct(";")) {
            self.next()?;
        }
        Ok(())
    }

    // ── Nodes ─────────────────────────────────────────────────

    pub(crate) fn node(&mut self, tag: Tag, span: Span, children: Vec<Sexp>) -> Sexp {
        self.ids.node(tag, span, children)
    }

    /// Span from `start` to the last token consumed.
    pub(crate) fn since(&self, start: Span) -> Span {
        start.merge(self.last_span)
    }

    /// A statement list as a single value.
    fn body(&mut self, mut stmts: Vec<Sexp>, span: Span) -> Sexp {
        match stmts.len() {
            0 => Sexp::Nil,
            1 => stmts.pop().unwrap_or(Sexp::Nil),
            _ => self.node(Tag::Do, span, stmts),
        }
    }

    // ── Locals ────────────────────────────────────────────────

    fn push_scope(&mut self, kind: ScopeKind) {
        self.scopes.push(LocalScope::new(kind));
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub(crate) fn declare(&mut self, name: &str) {
        if !is_local_name(name) {
            return;
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.vars.insert(name.to_string());
        }
    }

    pub(crate) fn is_local(&self, name: &str) -> bool {
        for scope in self.scopes.iter().rev() {
            if scope.vars.contains(name) {
                return true;
            }
            if scope.kind != ScopeKind::Block {
                return false;
            }
        }
        false
    }

    /// Directly inside a `class` or `module` body (not a method or block).
    pub(crate) fn in_class_body(&self) -> bool {
        matches!(self.scopes.last(), Some(s) if s.kind == ScopeKind::Class)
    }

    /// Check `e` is something that can be assigned to, declaring locals.
    /// A bare `x` not yet known as a local parses as a call; it becomes
    /// the variable here.
    pub(crate) fn target(&mut self, e: Sexp) -> Result<Sexp, ParseError> {
        let span = e.span().unwrap_or(self.last_span);
        match e {
            Sexp::Name(name) if is_assignable(&name) => {
                self.declare(&name);
                Ok(Sexp::Name(name))
            }
            Sexp::Node(node) => match node.tag {
                Tag::Call if node.child(1).children().is_empty() && node.child(2).is_nil() => {
                    match node.child(0).as_name() {
                        Some(name) => {
                            let name = name.to_string();
                            self.declare(&name);
                            Ok(Sexp::Name(name))
                        }
                        None => Err(ParseError::new("cannot assign to this expression", span)),
                    }
                }
                Tag::Callm | Tag::SafeCallm
                    if node.child(3).is_nil()
                        && (node.child(2).children().is_empty()
                            || node.child(1).as_name() == Some("[]")) =>
                {
                    Ok(Sexp::Node(node))
                }
                Tag::Colon2 | Tag::Colon3 => Ok(Sexp::Node(node)),
                Tag::SafeChain => {
                    let inner = self.target(node.child(0).clone())?;
                    Ok(node.rebuild(vec![inner]))
                }
                Tag::Splat => {
                    let inner = self.target(node.child(0).clone())?;
                    Ok(node.rebuild(vec![inner]))
                }
                _ => Err(ParseError::new("cannot assign to this expression", span)),
            },
            Sexp::Name(name) => Err(ParseError::new(format!("cannot assign to {name}"), span)),
            _ => Err(ParseError::new("cannot assign to a literal", span)),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════

    pub(crate) fn statements(&mut self, stop: Stop) -> Result<Vec<Sexp>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_terms()?;
            let kind = &self.peek()?.kind;
            if stop(kind) || matches!(kind, TokenKind::Eof) {
                break;
            }
            stmts.push(self.statement()?);
            let tok = self.next()?;
            match &tok.kind {
                TokenKind::Newline | TokenKind::Punct(";") => {}
                k if stop(k) || matches!(k, TokenKind::Eof) => {
                    self.push_back(tok);
                    break;
                }
                _ => return Err(self.unexpected(&tok, "end of statement")),
            }
        }
        Ok(stmts)
    }

    /// An expression with any trailing modifiers.
    pub(crate) fn statement(&mut self) -> Result<Sexp, ParseError> {
        let start = self.peek()?.span;
        let mut stmt = self.expression_statement()?;
        loop {
            let tok = self.next()?;
            let kw = match &tok.kind {
                TokenKind::Keyword(
                    kw @ (Keyword::If
                    | Keyword::Unless
                    | Keyword::While
                    | Keyword::Until
                    | Keyword::Rescue),
                ) => *kw,
                _ => {
                    self.push_back(tok);
                    break;
                }
            };
            let rhs = self.expr()?;
            let span = self.since(start);
            stmt = match kw {
                Keyword::If => self.node(Tag::If, span, vec![rhs, stmt, Sexp::Nil]),
                Keyword::Unless => self.node(Tag::If, span, vec![rhs, Sexp::Nil, stmt]),
                Keyword::While | Keyword::Until => {
                    let cond = if kw == Keyword::Until {
                        self.node(Tag::Not, span, vec![rhs])
                    } else {
                        rhs
                    };
                    let tag = if stmt.is(Tag::Begin) {
                        Tag::DoWhile
                    } else {
                        Tag::While
                    };
                    self.node(tag, span, vec![cond, stmt])
                }
                _ => {
                    let classes = self.node(Tag::Array, tok.span, vec![]);
                    let clause = self.node(Tag::Rescue, tok.span, vec![classes, Sexp::Nil, rhs]);
                    self.node(Tag::Begin, span, vec![stmt, clause, Sexp::Nil, Sexp::Nil])
                }
            };
        }
        Ok(stmt)
    }

    /// An expression, or a multiple assignment `a, b = 1, 2`.
    fn expression_statement(&mut self) -> Result<Sexp, ParseError> {
        let start = self.peek()?.span;
        let first = self.expr()?;
        if !self.at_punct(",")? {
            return Ok(first);
        }

        // `x = 1, 2` assigns an array.
        if first.is(Tag::Assign) {
            let Some(node) = first.into_node() else {
                return Err(ParseError::new("malformed assignment", start));
            };
            let mut items = vec![node.child(1).clone()];
            while self.accept_punct(",")? {
                items.push(self.expr()?);
            }
            let array = self.node(Tag::Array, self.since(start), items);
            return Ok(node.rebuild(vec![node.child(0).clone(), array]));
        }

        let mut targets = vec![self.target(first)?];
        let assign_only = crate::shunting::Ctx {
            stop_at_assign: true,
            ..Default::default()
        };
        while self.accept_punct(",")? {
            if self.at_punct("=")? {
                break;
            }
            targets.push(self.masgn_target(assign_only)?);
        }
        self.expect_punct("=")?;
        let mut values = vec![self.expr()?];
        while self.accept_punct(",")? {
            values.push(self.expr()?);
        }
        let span = self.since(start);
        let rhs = if values.len() == 1 && !values[0].is(Tag::Splat) {
            values.pop().unwrap_or(Sexp::Nil)
        } else {
            self.node(Tag::Array, span, values)
        };
        let lhs = self.node(Tag::Array, span, targets);
        Ok(self.node(Tag::MAsgn, span, vec![lhs, rhs]))
    }

    /// One target after the first: a name, `*rest`, or a nested group
    /// `(b, c)`.
    fn masgn_target(&mut self, ctx: crate::shunting::Ctx) -> Result<Sexp, ParseError> {
        let start = self.peek()?.span;
        if !self.accept_punct("(")? {
            let t = self.expr_with(ctx)?;
            return self.target(t);
        }
        let mut items = vec![self.masgn_target(ctx)?];
        while self.accept_punct(",")? {
            items.push(self.masgn_target(ctx)?);
        }
        self.expect_punct(")")?;
        Ok(self.node(Tag::Destruct, self.since(start), items))
    }

    // ═══════════════════════════════════════════════════════════════
    // Control structures
    // ═══════════════════════════════════════════════════════════════

    /// Condition of `if`/`while`/`when`, with its optional `then`.
    fn condition(&mut self) -> Result<Sexp, ParseError> {
        let cond = self.expr_with(crate::shunting::Ctx::no_do())?;
        self.accept_keyword(Keyword::Then)?;
        Ok(cond)
    }

    pub(crate) fn if_expression(&mut self, start: Span, unless: bool) -> Result<Sexp, ParseError> {
        let cond = self.condition()?;
        let stmts = self.statements(stop_if_branch)?;
        let then_body = self.body(stmts, start);
        let tok = self.next()?;
        let else_body = match tok.kind {
            TokenKind::Keyword(Keyword::Elsif) if !unless => self.if_expression(tok.span, false)?,
            TokenKind::Keyword(Keyword::Else) => {
                let stmts = self.statements(stop_end)?;
                self.expect_keyword(Keyword::End)?;
                self.body(stmts, tok.span)
            }
            TokenKind::Keyword(Keyword::End) => Sexp::Nil,
            _ => return Err(self.unexpected(&tok, "'end'")),
        };
        let span = self.since(start);
        Ok(if unless {
            self.node(Tag::If, span, vec![cond, else_body, then_body])
        } else {
            self.node(Tag::If, span, vec![cond, then_body, else_body])
        })
    }

    pub(crate) fn while_expression(&mut self, start: Span, until: bool) -> Result<Sexp, ParseError> {
        let mut cond = self.expr_with(crate::shunting::Ctx::no_do())?;
        self.accept_keyword(Keyword::Do)?;
        let stmts = self.statements(stop_end)?;
        self.expect_keyword(Keyword::End)?;
        let span = self.since(start);
        if until {
            cond = self.node(Tag::Not, span, vec![cond]);
        }
        let body = self.body(stmts, span);
        Ok(self.node(Tag::While, span, vec![cond, body]))
    }

    pub(crate) fn for_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let mut vars = Vec::new();
        loop {
            let v = self.expr_with(crate::shunting::Ctx::no_do())?;
            vars.push(self.target(v)?);
            if !self.accept_punct(",")? {
                break;
            }
        }
        self.expect_keyword(Keyword::In)?;
        let iter = self.expr_with(crate::shunting::Ctx::no_do())?;
        self.accept_keyword(Keyword::Do)?;
        let stmts = self.statements(stop_end)?;
        self.expect_keyword(Keyword::End)?;
        let span = self.since(start);
        let var = if vars.len() == 1 {
            vars.pop().unwrap_or(Sexp::Nil)
        } else {
            self.node(Tag::Array, span, vars)
        };
        let body = self.body(stmts, span);
        Ok(self.node(Tag::For, span, vec![var, iter, body]))
    }

    pub(crate) fn case_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let subject = if matches!(
            self.peek()?.kind,
            TokenKind::Newline | TokenKind::Punct(";")
        ) {
            Sexp::Nil
        } else {
            self.expr()?
        };
        self.skip_terms()?;
        let mut children = vec![subject];
        let else_body = loop {
            let tok = self.next()?;
            match tok.kind {
                TokenKind::Keyword(Keyword::When) => {
                    let mut tests = Vec::new();
                    loop {
                        self.skip_newlines()?;
                        tests.push(self.expr_with(crate::shunting::Ctx::no_do())?);
                        if !self.accept_punct(",")? {
                            break;
                        }
                    }
                    self.accept_keyword(Keyword::Then)?;
                    let stmts = self.statements(stop_when)?;
                    let span = self.since(tok.span);
                    let tests = self.node(Tag::Array, span, tests);
                    let body = self.body(stmts, span);
                    children.push(self.node(Tag::When, span, vec![tests, body]));
                }
                TokenKind::Keyword(Keyword::In) => {
                    return Err(ParseError::new(
                        "pattern matching with 'case ... in' is not supported",
                        tok.span,
                    ));
                }
                TokenKind::Keyword(Keyword::Else) => {
                    let stmts = self.statements(stop_end)?;
                    self.expect_keyword(Keyword::End)?;
                    break self.body(stmts, tok.span);
                }
                TokenKind::Keyword(Keyword::End) => break Sexp::Nil,
                _ => return Err(self.unexpected(&tok, "'when'")),
            }
        };
        children.push(else_body);
        let span = self.since(start);
        Ok(self.node(Tag::Case, span, children))
    }

    pub(crate) fn begin_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        self.rescue_body(start, true)
    }

    /// Statements up to `end`, with optional `rescue`, `else` and
    /// `ensure` clauses. Without clauses the plain body comes back unless
    /// `always_wrap` is set.
    fn rescue_body(&mut self, start: Span, always_wrap: bool) -> Result<Sexp, ParseError> {
        let stmts = self.statements(stop_begin)?;
        let body = self.body(stmts, start);
        let mut clauses = Vec::new();
        let mut else_body = Sexp::Nil;
        let mut ensure_body = Sexp::Nil;
        loop {
            let tok = self.next()?;
            match tok.kind {
                TokenKind::Keyword(Keyword::Rescue) => clauses.push(self.rescue_clause(tok.span)?),
                TokenKind::Keyword(Keyword::Else) => {
                    let stmts = self.statements(stop_begin)?;
                    else_body = self.body(stmts, tok.span);
                }
                TokenKind::Keyword(Keyword::Ensure) => {
                    let stmts = self.statements(stop_begin)?;
                    ensure_body = self.body(stmts, tok.span);
                }
                TokenKind::Keyword(Keyword::End) => break,
                _ => return Err(self.unexpected(&tok, "'end'")),
            }
        }
        if !always_wrap && clauses.is_empty() && else_body.is_nil() && ensure_body.is_nil() {
            return Ok(body);
        }
        let span = self.since(start);
        let mut children = vec![body];
        children.extend(clauses);
        children.push(else_body);
        children.push(ensure_body);
        Ok(self.node(Tag::Begin, span, children))
    }

    fn rescue_clause(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let mut classes = Vec::new();
        let at_end = matches!(
            self.peek()?.kind,
            TokenKind::Newline
                | TokenKind::Punct(";")
                | TokenKind::Punct("=>")
                | TokenKind::Keyword(Keyword::Then)
        );
        if !at_end {
            loop {
                classes.push(self.expr_with(crate::shunting::Ctx::no_do())?);
                if !self.accept_punct(",")? {
                    break;
                }
            }
        }
        let target = if self.accept_punct("=>")? {
            let t = self.expr_with(crate::shunting::Ctx::no_do())?;
            self.target(t)?
        } else {
            Sexp::Nil
        };
        self.accept_keyword(Keyword::Then)?;
        let stmts = self.statements(stop_begin)?;
        let span = self.since(start);
        let classes = self.node(Tag::Array, span, classes);
        let body = self.body(stmts, span);
        Ok(self.node(Tag::Rescue, span, vec![classes, target, body]))
    }

    // ═══════════════════════════════════════════════════════════════
    // Definitions
    // ═══════════════════════════════════════════════════════════════

    pub(crate) fn def_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let tok = self.next()?;
        let singleton = matches!(
            tok.kind,
            TokenKind::Keyword(Keyword::SelfKw) | TokenKind::Const(_) | TokenKind::Ident(_)
        ) && self.at_punct(".")?;
        let (receiver, mut name) = if singleton {
            let receiver = match tok.kind {
                TokenKind::Keyword(_) => Sexp::name("self"),
                TokenKind::Const(c) | TokenKind::Ident(c) => Sexp::Name(c),
                _ => Sexp::Nil,
            };
            self.next()?;
            let name_tok = self.next()?;
            (receiver, self.method_name(name_tok)?)
        } else {
            (Sexp::Nil, self.method_name(tok)?)
        };

        let setter = {
            let next = self.peek()?;
            next.kind.is_punct("=") && !next.space_before && !name.ends_with(['=', '?', '!'])
        };
        if setter {
            self.next()?;
            name.push('=');
        }

        self.push_scope(ScopeKind::Def);
        let params = if self.at_tight_paren()? || self.at_punct("(")? {
            self.next()?;
            let params = self.parameters(stop_paren, true)?;
            self.expect_punct(")")?;
            params
        } else {
            self.parameters(stop_line, false)?
        };
        let body = if self.accept_punct("=")? {
            self.skip_newlines()?;
            self.statement()?
        } else {
            self.rescue_body(start, false)?
        };
        self.pop_scope();

        let span = self.since(start);
        Ok(if receiver.is_nil() {
            self.node(Tag::Defm, span, vec![Sexp::Name(name), params, body])
        } else {
            self.node(Tag::Defs, span, vec![receiver, Sexp::Name(name), params, body])
        })
    }

    /// Method name after `def` or `def recv.`.
    fn method_name(&mut self, tok: Token) -> Result<String, ParseError> {
        match tok.kind {
            TokenKind::Ident(n) | TokenKind::Const(n) => Ok(n),
            TokenKind::Keyword(k) => Ok(k.as_str().to_string()),
            TokenKind::Punct("[") => {
                self.expect_punct("]")?;
                let next = self.peek()?;
                if next.kind.is_punct("=") && !next.space_before {
                    self.next()?;
                    return Ok("[]=".to_string());
                }
                Ok("[]".to_string())
            }
            TokenKind::Punct(p) if crate::shunting::is_operator_method(p) => Ok(p.to_string()),
            _ => Err(self.unexpected(&tok, "method name")),
        }
    }

    /// Parameters of a `def` or `->`, up to (not including) the token
    /// matched by `close`.
    fn parameters(&mut self, close: Stop, multiline: bool) -> Result<Sexp, ParseError> {
        let start = self.peek()?.span;
        let mut params = Vec::new();
        loop {
            if multiline {
                self.skip_newlines()?;
            }
            if close(&self.peek()?.kind) {
                break;
            }
            params.push(self.parameter(false)?);
            if !self.accept_punct(",")? {
                break;
            }
        }
        if multiline {
            self.skip_newlines()?;
        }
        let span = self.since(start);
        Ok(self.node(Tag::Args, span, params))
    }

    fn parameter(&mut self, in_block: bool) -> Result<Sexp, ParseError> {
        let tok = self.next()?;
        let span = tok.span;
        let ctx = crate::shunting::Ctx {
            no_pipe: in_block,
            ..Default::default()
        };
        match tok.kind {
            TokenKind::Ident(name) => {
                self.declare(&name);
                if self.accept_punct("=")? {
                    let value = self.expr_with(ctx)?;
                    let span = self.since(span);
                    Ok(self.node(Tag::Default, span, vec![Sexp::Name(name), value]))
                } else {
                    Ok(Sexp::Name(name))
                }
            }
            TokenKind::Label(name) => {
                self.declare(&name);
                let bare = matches!(
                    self.peek()?.kind,
                    TokenKind::Punct("," | ")" | "|") | TokenKind::Newline
                );
                let value = if bare { Sexp::Nil } else { self.expr_with(ctx)? };
                let span = self.since(span);
                Ok(self.node(Tag::KwArg, span, vec![Sexp::Name(name), value]))
            }
            TokenKind::Punct("*") => {
                let name = self.optional_param_name()?;
                Ok(self.node(Tag::Rest, span, vec![name]))
            }
            TokenKind::Punct("&") => {
                let name = self.optional_param_name()?;
                if name.is_nil() {
                    return Err(ParseError::new("block parameter needs a name", span));
                }
                Ok(self.node(Tag::BlockArg, span, vec![name]))
            }
            TokenKind::Punct("**") => Err(ParseError::new(
                "keyword splat parameters are not supported",
                span,
            )),
            TokenKind::Punct("(") => {
                let mut items = Vec::new();
                loop {
                    items.push(self.parameter(in_block)?);
                    if !self.accept_punct(",")? {
                        break;
                    }
                }
                self.expect_punct(")")?;
                let span = self.since(span);
                Ok(self.node(Tag::Destruct, span, items))
            }
            _ => Err(self.unexpected(&tok, "parameter")),
        }
    }

    fn optional_param_name(&mut self) -> Result<Sexp, ParseError> {
        if let TokenKind::Ident(_) = self.peek()?.kind {
            if let TokenKind::Ident(name) = self.next()?.kind {
                self.declare(&name);
                return Ok(Sexp::Name(name));
            }
        }
        Ok(Sexp::Nil)
    }

    /// `|a, (b, c), *rest, &blk; local|` after a block opener.
    fn block_parameters(&mut self) -> Result<Sexp, ParseError> {
        let start = self.peek()?.span;
        if self.accept_punct("||")? || !self.accept_punct("|")? {
            return Ok(self.node(Tag::Args, start, vec![]));
        }
        let mut params = Vec::new();
        loop {
            if self.accept_punct("|")? {
                break;
            }
            if self.accept_punct(";")? {
                while let TokenKind::Ident(_) = self.peek()?.kind {
                    if let TokenKind::Ident(name) = self.next()?.kind {
                        self.declare(&name);
                    }
                    self.accept_punct(",")?;
                }
                self.expect_punct("|")?;
                break;
            }
            params.push(self.parameter(true)?);
            if self.accept_punct(",")? {
                // `|a,|` takes the first element of an array argument
                if self.at_punct("|")? {
                    let rest = self.node(Tag::Rest, self.last_span, vec![Sexp::Nil]);
                    params.push(rest);
                }
                continue;
            }
            if !self.at_punct(";")? {
                self.expect_punct("|")?;
                break;
            }
        }
        let span = self.since(start);
        Ok(self.node(Tag::Args, span, params))
    }

    /// Body of `{ ... }` or `do ... end` after the opener, as a lambda.
    pub(crate) fn block(&mut self, start: Span, brace: bool) -> Result<Sexp, ParseError> {
        self.push_scope(ScopeKind::Block);
        let params = self.block_parameters()?;
        let body = if brace {
            let stmts = self.statements(stop_brace)?;
            self.expect_punct("}")?;
            self.body(stmts, start)
        } else {
            self.rescue_body(start, false)?
        };
        self.pop_scope();
        let span = self.since(start);
        Ok(self.node(Tag::Lambda, span, vec![params, body]))
    }

    /// `->(x) { ... }`, a call to `lambda` with the block attached.
    pub(crate) fn lambda_literal(&mut self, start: Span) -> Result<Sexp, ParseError> {
        self.push_scope(ScopeKind::Block);
        let params = if self.accept_punct("(")? {
            let params = self.parameters(stop_paren, true)?;
            self.expect_punct(")")?;
            params
        } else {
            self.parameters(stop_lambda_params, false)?
        };
        let body = if self.accept_punct("{")? {
            let stmts = self.statements(stop_brace)?;
            self.expect_punct("}")?;
            self.body(stmts, start)
        } else {
            self.expect_keyword(Keyword::Do)?;
            self.rescue_body(start, false)?
        };
        self.pop_scope();
        let span = self.since(start);
        let lambda = self.node(Tag::Lambda, span, vec![params, body]);
        let args = self.node(Tag::Args, span, vec![]);
        Ok(self.node(Tag::Call, span, vec![Sexp::name("lambda"), args, lambda]))
    }

    pub(crate) fn class_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        if self.accept_punct("<<")? {
            let object = self.expr()?;
            self.push_scope(ScopeKind::Class);
            let body = self.rescue_body(start, false)?;
            self.pop_scope();
            let span = self.since(start);
            return Ok(self.node(Tag::SClass, span, vec![object, body]));
        }
        let path = self.constant_path()?;
        let superclass = if self.accept_punct("<")? {
            self.expr()?
        } else {
            Sexp::Nil
        };
        self.push_scope(ScopeKind::Class);
        let body = self.rescue_body(start, false)?;
        self.pop_scope();
        let span = self.since(start);
        Ok(self.node(Tag::Class, span, vec![path, superclass, body]))
    }

    pub(crate) fn module_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let path = self.constant_path()?;
        self.push_scope(ScopeKind::Class);
        let body = self.rescue_body(start, false)?;
        self.pop_scope();
        let span = self.since(start);
        Ok(self.node(Tag::Module, span, vec![path, body]))
    }

    /// `Name`, `A::B::Name` or `::Name`.
    fn constant_path(&mut self) -> Result<Sexp, ParseError> {
        let tok = self.next()?;
        let mut path = match tok.kind {
            TokenKind::Const(c) => Sexp::Name(c),
            TokenKind::Punct("::") => {
                let inner = self.next()?;
                let TokenKind::Const(c) = inner.kind else {
                    return Err(self.unexpected(&inner, "constant name"));
                };
                let span = self.since(tok.span);
                self.node(Tag::Colon3, span, vec![Sexp::Name(c)])
            }
            _ => return Err(self.unexpected(&tok, "class or module name")),
        };
        while self.accept_punct("::")? {
            let inner = self.next()?;
            let TokenKind::Const(c) = inner.kind else {
                return Err(self.unexpected(&inner, "constant name"));
            };
            let span = self.since(tok.span);
            path = self.node(Tag::Colon2, span, vec![path, Sexp::Name(c)]);
        }
        Ok(path)
    }

    pub(crate) fn alias_expression(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let new = self.alias_name()?;
        let old = self.alias_name()?;
        let span = self.since(start);
        Ok(self.node(Tag::Alias, span, vec![Sexp::Sym(new), Sexp::Sym(old)]))
    }

    fn alias_name(&mut self) -> Result<String, ParseError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Ident(s)
            | TokenKind::Const(s)
            | TokenKind::GVar(s)
            | TokenKind::Symbol(s) => Ok(s),
            TokenKind::Keyword(k) => Ok(k.as_str().to_string()),
            TokenKind::Punct(p) if crate::shunting::is_operator_method(p) => Ok(p.to_string()),
            _ => Err(self.unexpected(&tok, "method name")),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Interpolation
    // ═══════════════════════════════════════════════════════════════

    pub(crate) fn interpolation(
        &mut self,
        parts: Vec<StrPart>,
        span: Span,
    ) -> Result<Sexp, ParseError> {
        let mut children = Vec::new();
        for part in parts {
            match part {
                StrPart::Lit(bytes) => children.push(Sexp::Str(bytes)),
                StrPart::Code { source, pos } => children.push(self.embedded(&source, pos)?),
            }
        }
        Ok(self.node(Tag::Interp, span, children))
    }

    /// Parse the code of a `#{...}` segment with its own lexer. The
    /// nested parser shares node ids and the visible locals.
    fn embedded(&mut self, source: &str, pos: Pos) -> Result<Sexp, ParseError> {
        let mut sub = Parser {
            lexer: Lexer::with_origin(source, pos),
            ids: std::mem::take(&mut self.ids),
            scopes: std::mem::take(&mut self.scopes),
            file: self.file.clone(),
            last_span: Span::point(pos),
        };
        let result = sub.statements(stop_eof);
        let span = Span::new(pos, sub.last_span.end);
        self.ids = sub.ids;
        self.scopes = sub.scopes;
        let stmts = result?;
        Ok(self.body(stmts, span))
    }

    pub(crate) fn file_name(&self) -> &str {
        &self.file
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════
