/// Operator-precedence expression engine.
///
/// Expressions are parsed with an explicit value stack and operator
/// stack. Operand and operator positions alternate: in operand position
/// prefix operators are pushed and a primary value is read (literals,
/// names, calls, bracketed forms and structural keywords); in operator
/// position an infix operator first reduces everything on the stack that
/// binds tighter, then is pushed. Anything that is not an operator ends
/// the expression.
///
/// Postfix forms (`.name`, `&.name`, `::Name`, `[index]`, blocks) bind
/// tighter than any operator and are applied to a primary as soon as it
/// is read.
///
/// When a reduction finds too few values the error carries a dump of the
/// operator, its priority, the value stack and the right-hand value.
use crate::operators::{self, OpKind, Oper};
use crate::parser::{ParseError, Parser, StackDump, stop_paren};
use crate::sexp::{Sexp, Tag};
use crate::span::Span;
use crate::token::{Keyword, Token, TokenKind};

/// Context flags threaded through one expression.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Ctx {
    /// `do` belongs to an enclosing construct: `while c do`, or a command
    /// call whose arguments are being read.
    pub no_do: bool,
    /// `|` closes a block parameter list.
    pub no_pipe: bool,
    /// Stop before `=` (targets of a multiple assignment).
    pub stop_at_assign: bool,
}

impl Ctx {
    pub fn no_do() -> Self {
        Ctx {
            no_do: true,
            ..Default::default()
        }
    }
}

/// Operators that can be defined and called as methods.
pub(crate) fn is_operator_method(p: &str) -> bool {
    matches!(
        p,
        "+" | "-"
            | "*"
            | "/"
            | "%"
            | "**"
            | "=="
            | "!="
            | "==="
            | "=~"
            | "!~"
            | "<=>"
            | "<"
            | "<="
            | ">"
            | ">="
            | "<<"
            | ">>"
            | "&"
            | "|"
            | "^"
            | "~"
            | "!"
    )
}

/// Whether a block can be attached to `value`.
fn takes_block(value: &Sexp) -> bool {
    match value.as_node() {
        Some(node) => {
            matches!(
                node.tag,
                Tag::Call | Tag::Callm | Tag::SafeCallm | Tag::Super | Tag::ZSuper
            ) && node
                .children
                .last()
                .is_some_and(|b| b.is_nil() || b.is(Tag::BlockPass))
        }
        None => false,
    }
}

/// Whether the receiver chain ending at `e` holds an `&.` call.
fn has_safe_link(mut e: &Sexp) -> bool {
    while let Some(n) = e.as_node() {
        match n.tag {
            Tag::SafeCallm => return true,
            Tag::Callm => e = n.child(0),
            _ => return false,
        }
    }
    false
}

fn negate_text(s: &str) -> String {
    match s.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{s}"),
    }
}

fn dump(op: &Oper, values: &[Sexp], rightv: Option<&Sexp>) -> StackDump {
    StackDump {
        operator: op.sym.to_string(),
        priority: op.pri,
        vstack: values.iter().map(ToString::to_string).collect(),
        rightv: rightv.map(ToString::to_string),
    }
}

impl Parser {
    pub(crate) fn expr(&mut self) -> Result<Sexp, ParseError> {
        self.expr_with(Ctx::default())
    }

    pub(crate) fn expr_with(&mut self, ctx: Ctx) -> Result<Sexp, ParseError> {
        let mut values: Vec<Sexp> = Vec::new();
        let mut ops: Vec<(Oper, Span)> = Vec::new();
        loop {
            // Operand position.
            let tok = self.next()?;
            if let Some(op) = prefix_operator(&tok) {
                ops.push((op, tok.span));
                continue;
            }
            let Some(value) = self.primary(tok, ctx)? else {
                return Err(self.missing_operand(&values, &ops)?);
            };
            values.push(value);

            // Operator position.
            let tok = self.next()?;
            let Some(op) = infix_operator(&tok, ctx) else {
                self.push_back(tok);
                break;
            };
            if op.kind == OpKind::TernaryElse {
                if !ops.iter().any(|(o, _)| o.kind == OpKind::Ternary) {
                    self.push_back(tok);
                    break;
                }
                while ops.last().is_some_and(|(o, _)| o.kind != OpKind::Ternary) {
                    self.reduce(&mut values, &mut ops)?;
                }
                if let Some(top) = ops.last_mut() {
                    *top = (op, top.1);
                }
                continue;
            }
            if op.is_assignment() {
                // The target is known before its value is parsed, so
                // `f = lambda { f.call }` sees `f` as a local.
                if let Some(target) = values.pop() {
                    values.push(self.target(target)?);
                }
            } else {
                while ops.last().is_some_and(|(top, _)| top.reduces_before(&op)) {
                    self.reduce(&mut values, &mut ops)?;
                }
            }
            ops.push((op, tok.span));
        }

        while !ops.is_empty() {
            self.reduce(&mut values, &mut ops)?;
        }
        match (values.pop(), values.is_empty()) {
            (Some(value), true) => Ok(value),
            (value, _) => {
                let span = value.as_ref().and_then(Sexp::span).unwrap_or(self.last_span);
                Err(ParseError::new("unreduced values in expression", span))
            }
        }
    }

    fn missing_operand(
        &mut self,
        values: &[Sexp],
        ops: &[(Oper, Span)],
    ) -> Result<ParseError, ParseError> {
        let tok = self.next()?;
        let err = match ops.last() {
            Some((op, _)) => ParseError::new("Missing value in expression", tok.span)
                .with_stack(dump(op, values, None)),
            None => self.unexpected(&tok, "expression"),
        };
        Ok(err)
    }

    fn reduce(
        &mut self,
        values: &mut Vec<Sexp>,
        ops: &mut Vec<(Oper, Span)>,
    ) -> Result<(), ParseError> {
        let Some((op, span)) = ops.pop() else {
            return Ok(());
        };
        if op.kind == OpKind::Ternary {
            return Err(ParseError::new("Missing ':' in ternary expression", span)
                .with_stack(dump(&op, values, values.last())));
        }
        if values.len() < op.arity() {
            return Err(ParseError::new("Missing value in expression", span)
                .with_stack(dump(&op, values, values.last())));
        }
        let right = values.pop().unwrap_or(Sexp::Nil);
        let node = match op.arity() {
            1 => self.unary(&op, span, right),
            2 => {
                let left = values.pop().unwrap_or(Sexp::Nil);
                self.binary(&op, span, left, right)?
            }
            _ => {
                let then = values.pop().unwrap_or(Sexp::Nil);
                let cond = values.pop().unwrap_or(Sexp::Nil);
                let span = cond.span().map_or(span, |s| s.merge(self.last_span));
                self.node(Tag::If, span, vec![cond, then, right])
            }
        };
        values.push(node);
        Ok(())
    }

    fn unary(&mut self, op: &Oper, span: Span, value: Sexp) -> Sexp {
        let span = value.span().map_or(span, |s| span.merge(s));
        match op.kind {
            OpKind::Not => self.node(Tag::Not, span, vec![value]),
            OpKind::Negate => match value {
                Sexp::Int(n) => match n.checked_neg() {
                    Some(m) => Sexp::Int(m),
                    None => Sexp::BigInt(negate_text(&n.to_string())),
                },
                Sexp::BigInt(s) => Sexp::BigInt(negate_text(&s)),
                Sexp::Float(s) => Sexp::Float(negate_text(&s)),
                other => self.method_call_node(other, "-@", vec![], span),
            },
            OpKind::Plus => match value {
                Sexp::Int(_) | Sexp::BigInt(_) | Sexp::Float(_) => value,
                other => self.method_call_node(other, "+@", vec![], span),
            },
            OpKind::Defined => self.node(Tag::Defined, span, vec![value]),
            OpKind::Splat => self.node(Tag::Splat, span, vec![value]),
            OpKind::DSplat => self.node(Tag::DSplat, span, vec![value]),
            OpKind::BlockPass => self.node(Tag::BlockPass, span, vec![value]),
            _ => self.method_call_node(value, op.sym, vec![], span),
        }
    }

    fn binary(
        &mut self,
        op: &Oper,
        span: Span,
        left: Sexp,
        right: Sexp,
    ) -> Result<Sexp, ParseError> {
        let span = match (left.span(), right.span()) {
            (Some(l), Some(r)) => l.merge(r),
            (Some(l), None) => l.merge(span),
            (None, Some(r)) => span.merge(r),
            (None, None) => span,
        };
        Ok(match op.kind {
            OpKind::Method => self.method_call_node(left, op.sym, vec![right], span),
            OpKind::And => self.node(Tag::And, span, vec![left, right]),
            OpKind::Or => self.node(Tag::Or, span, vec![left, right]),
            OpKind::Range => self.node(Tag::Range, span, vec![left, right]),
            OpKind::ERange => self.node(Tag::ERange, span, vec![left, right]),
            OpKind::Assign => self.ids.assign(left, right, span),
            OpKind::OpAssign(m) => self.node(Tag::OpAssign, span, vec![left, Sexp::name(m), right]),
            _ => {
                return Err(ParseError::new(
                    format!("'{}' is not a binary operator", op.sym),
                    span,
                ));
            }
        })
    }

    fn method_call_node(&mut self, recv: Sexp, name: &str, args: Vec<Sexp>, span: Span) -> Sexp {
        let args = self.node(Tag::Args, span, args);
        self.node(Tag::Callm, span, vec![recv, Sexp::name(name), args, Sexp::Nil])
    }

    // ═══════════════════════════════════════════════════════════════
    // Primaries
    // ═══════════════════════════════════════════════════════════════

    /// A value starting with `tok`, with postfix forms applied. `None`
    /// (with `tok` pushed back) when `tok` cannot start a value.
    fn primary(&mut self, tok: Token, ctx: Ctx) -> Result<Option<Sexp>, ParseError> {
        let span = tok.span;
        let value = match tok.kind {
            TokenKind::Integer(n) => Sexp::Int(n),
            TokenKind::BigInteger(s) => Sexp::BigInt(s),
            TokenKind::Float(s) => Sexp::Float(s),
            TokenKind::Str(bytes) => Sexp::Str(bytes),
            TokenKind::Interp(parts) => self.interpolation(parts, span)?,
            TokenKind::Symbol(s) => Sexp::Sym(s),
            TokenKind::Words(words) => {
                let items = words.into_iter().map(|w| Sexp::Str(w.into_bytes())).collect();
                self.node(Tag::Array, span, items)
            }
            TokenKind::Symbols(words) => {
                let items = words.into_iter().map(Sexp::Sym).collect();
                self.node(Tag::Array, span, items)
            }
            TokenKind::Regex { source, flags } => self.node(
                Tag::Regex,
                span,
                vec![Sexp::Str(source.into_bytes()), Sexp::Str(flags.into_bytes())],
            ),
            TokenKind::IVar(n) | TokenKind::CVar(n) | TokenKind::GVar(n) => Sexp::Name(n),
            TokenKind::Const(c) => {
                if self.at_tight_paren()? {
                    self.next()?;
                    let (args, block) = self.paren_arguments()?;
                    self.call_node(c, args, block, span)
                } else {
                    Sexp::Name(c)
                }
            }
            TokenKind::Ident(name) => self.identifier(name, span, ctx)?,
            TokenKind::Keyword(kw) => match self.keyword_value(kw, span, ctx)? {
                Some(value) => value,
                None => {
                    self.push_back(tok);
                    return Ok(None);
                }
            },
            TokenKind::Punct("(") => {
                let stmts = self.statements(stop_paren)?;
                self.expect_punct(")")?;
                let span = self.since(span);
                match stmts.len() {
                    0 => Sexp::name("nil"),
                    1 => stmts.into_iter().next().unwrap_or(Sexp::Nil),
                    _ => self.node(Tag::Do, span, stmts),
                }
            }
            TokenKind::Punct("[") => {
                let items = self.list_items("]")?;
                self.expect_punct("]")?;
                let span = self.since(span);
                self.node(Tag::Array, span, items)
            }
            TokenKind::Punct("{") => self.hash_literal(span)?,
            TokenKind::Punct("->") => self.lambda_literal(span)?,
            TokenKind::Punct("::") => {
                let inner = self.next()?;
                let TokenKind::Const(c) = inner.kind else {
                    return Err(self.unexpected(&inner, "constant name"));
                };
                let span = self.since(span);
                self.node(Tag::Colon3, span, vec![Sexp::Name(c)])
            }
            _ => {
                self.push_back(tok);
                return Ok(None);
            }
        };
        self.postfix(value, span, ctx).map(Some)
    }

    fn keyword_value(
        &mut self,
        kw: Keyword,
        span: Span,
        ctx: Ctx,
    ) -> Result<Option<Sexp>, ParseError> {
        let value = match kw {
            Keyword::Nil => Sexp::name("nil"),
            Keyword::True => Sexp::name("true"),
            Keyword::False => Sexp::name("false"),
            Keyword::SelfKw => Sexp::name("self"),
            Keyword::File => Sexp::Str(self.file_name().as_bytes().to_vec()),
            Keyword::Line => Sexp::Int(span.start.line as i64),
            Keyword::If => self.if_expression(span, false)?,
            Keyword::Unless => self.if_expression(span, true)?,
            Keyword::While => self.while_expression(span, false)?,
            Keyword::Until => self.while_expression(span, true)?,
            Keyword::Case => self.case_expression(span)?,
            Keyword::For => self.for_expression(span)?,
            Keyword::Begin => self.begin_expression(span)?,
            Keyword::Def => self.def_expression(span)?,
            Keyword::Class => self.class_expression(span)?,
            Keyword::Module => self.module_expression(span)?,
            Keyword::Alias => self.alias_expression(span)?,
            Keyword::Yield => {
                let (args, _) = self.optional_arguments(ctx)?;
                let span = self.since(span);
                let args = self.node(Tag::Args, span, args);
                self.node(Tag::Yield, span, vec![args])
            }
            Keyword::Super => {
                let explicit = self.at_tight_paren()? || self.starts_command_argument()?;
                let (args, block) = self.optional_arguments(ctx)?;
                let span = self.since(span);
                if explicit {
                    let args = self.node(Tag::Args, span, args);
                    self.node(Tag::Super, span, vec![args, block])
                } else {
                    self.node(Tag::ZSuper, span, vec![block])
                }
            }
            Keyword::Return => self.jump(Tag::Return, span, ctx)?,
            Keyword::Break => self.jump(Tag::Break, span, ctx)?,
            Keyword::Next => self.jump(Tag::Next, span, ctx)?,
            Keyword::Redo => self.node(Tag::Redo, span, vec![]),
            Keyword::Retry => self.node(Tag::Retry, span, vec![]),
            Keyword::Undef => return Err(ParseError::new("'undef' is not supported", span)),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// `return`, `break` or `next` with an optional value. Several values
    /// make an array.
    fn jump(&mut self, tag: Tag, span: Span, ctx: Ctx) -> Result<Sexp, ParseError> {
        let bare = matches!(
            self.peek()?.kind,
            TokenKind::Newline
                | TokenKind::Eof
                | TokenKind::Punct(";" | "}" | ")" | "]" | ":")
                | TokenKind::Keyword(
                    Keyword::End
                        | Keyword::If
                        | Keyword::Unless
                        | Keyword::While
                        | Keyword::Until
                        | Keyword::Rescue
                        | Keyword::Else
                        | Keyword::Elsif
                        | Keyword::Ensure
                        | Keyword::When
                        | Keyword::Then
                        | Keyword::Do
                )
        );
        let value = if bare {
            Sexp::Nil
        } else {
            let mut items = vec![self.expr_with(ctx)?];
            while self.accept_punct(",")? {
                items.push(self.expr_with(ctx)?);
            }
            if items.len() == 1 {
                items.pop().unwrap_or(Sexp::Nil)
            } else {
                let span = self.since(span);
                self.node(Tag::Array, span, items)
            }
        };
        let span = self.since(span);
        Ok(self.node(tag, span, vec![value]))
    }

    /// A bare identifier: a local variable, or a method call with or
    /// without arguments.
    fn identifier(&mut self, name: String, span: Span, ctx: Ctx) -> Result<Sexp, ParseError> {
        if self.at_tight_paren()? {
            self.next()?;
            let (args, block) = self.paren_arguments()?;
            return Ok(self.call_node(name, args, block, span));
        }
        if self.is_local(&name) {
            return Ok(Sexp::Name(name));
        }
        if self.starts_command_argument()? {
            let (args, block) = self.command_arguments(ctx)?;
            return Ok(self.call_node(name, args, block, span));
        }
        Ok(self.call_node(name, vec![], Sexp::Nil, span))
    }

    /// A receiverless call. `include Mod` directly in a class body is an
    /// include directive.
    fn call_node(&mut self, name: String, args: Vec<Sexp>, block: Sexp, start: Span) -> Sexp {
        let span = self.since(start);
        if name == "include" && self.in_class_body() && block.is_nil() {
            if let [path] = args.as_slice() {
                let constant = match path {
                    Sexp::Name(n) => n.starts_with(|c: char| c.is_ascii_uppercase()),
                    other => other.is(Tag::Colon2) || other.is(Tag::Colon3),
                };
                if constant {
                    return self.node(Tag::Include, span, args);
                }
            }
        }
        let args = self.node(Tag::Args, span, args);
        self.node(Tag::Call, span, vec![Sexp::Name(name), args, block])
    }

    // ═══════════════════════════════════════════════════════════════
    // Arguments
    // ═══════════════════════════════════════════════════════════════

    /// Whether the next token starts the first argument of a call written
    /// without parentheses: `puts x`, `foo -1`, `bar *args`. A spaced
    /// operator (`a - 1`) or a block opener is not an argument.
    pub(crate) fn starts_command_argument(&mut self) -> Result<bool, ParseError> {
        let tok = self.peek()?;
        if !tok.space_before {
            return Ok(false);
        }
        Ok(match &tok.kind {
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
            | TokenKind::Regex { .. }
            | TokenKind::Label(_) => true,
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::Nil
                    | Keyword::True
                    | Keyword::False
                    | Keyword::SelfKw
                    | Keyword::Not
                    | Keyword::Defined
                    | Keyword::Case
                    | Keyword::Begin
                    | Keyword::Def
                    | Keyword::Yield
                    | Keyword::Super
                    | Keyword::File
                    | Keyword::Line
            ),
            TokenKind::Punct(p) => match *p {
                "(" | "[" | "->" | "::" | "!" => true,
                "-" | "*" | "**" | "&" | "~" => !tok.space_after,
                _ => false,
            },
            _ => false,
        })
    }

    /// Arguments in parentheses, after the `(`.
    pub(crate) fn paren_arguments(&mut self) -> Result<(Vec<Sexp>, Sexp), ParseError> {
        let result = self.argument_list(Ctx::default(), Some(")"))?;
        self.expect_punct(")")?;
        Ok(result)
    }

    fn command_arguments(&mut self, ctx: Ctx) -> Result<(Vec<Sexp>, Sexp), ParseError> {
        self.argument_list(Ctx { no_do: true, ..ctx }, None)
    }

    /// `(args)`, command arguments, or nothing.
    fn optional_arguments(&mut self, ctx: Ctx) -> Result<(Vec<Sexp>, Sexp), ParseError> {
        if self.at_tight_paren()? {
            self.next()?;
            self.paren_arguments()
        } else if self.starts_command_argument()? {
            self.command_arguments(ctx)
        } else {
            Ok((vec![], Sexp::Nil))
        }
    }

    /// Comma-separated call arguments. `key: value` and `k => v` pairs
    /// are collected into a trailing hash; `&blk` becomes the block.
    fn argument_list(
        &mut self,
        ctx: Ctx,
        close: Option<&str>,
    ) -> Result<(Vec<Sexp>, Sexp), ParseError> {
        let mut args = Vec::new();
        let mut pairs = Vec::new();
        let mut block = Sexp::Nil;
        loop {
            if let Some(close) = close {
                self.skip_newlines()?;
                if self.at_punct(close)? {
                    break;
                }
            }
            if let TokenKind::Label(_) = self.peek()?.kind {
                let tok = self.next()?;
                if let TokenKind::Label(key) = tok.kind {
                    self.skip_newlines()?;
                    let value = self.expr_with(ctx)?;
                    let span = self.since(tok.span);
                    pairs.push(self.node(Tag::Pair, span, vec![Sexp::Sym(key), value]));
                }
            } else {
                let value = self.expr_with(ctx)?;
                if self.accept_punct("=>")? {
                    self.skip_newlines()?;
                    let v = self.expr_with(ctx)?;
                    let span = value.span().unwrap_or(self.last_span).merge(self.last_span);
                    pairs.push(self.node(Tag::Pair, span, vec![value, v]));
                } else if value.is(Tag::BlockPass) {
                    block = value;
                } else if value.is(Tag::DSplat) {
                    pairs.push(value);
                } else {
                    args.push(value);
                }
            }
            if !self.accept_punct(",")? {
                break;
            }
        }
        if close.is_some() {
            self.skip_newlines()?;
        }
        if !pairs.is_empty() {
            let span = self.since(pairs[0].span().unwrap_or(self.last_span));
            args.push(self.node(Tag::Hash, span, pairs));
        }
        Ok((args, block))
    }

    /// Items of an array literal or index, up to `close`.
    fn list_items(&mut self, close: &str) -> Result<Vec<Sexp>, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines()?;
            if self.at_punct(close)? {
                break;
            }
            items.push(self.expr()?);
            self.skip_newlines()?;
            if !self.accept_punct(",")? {
                break;
            }
        }
        self.skip_newlines()?;
        Ok(items)
    }

    fn hash_literal(&mut self, start: Span) -> Result<Sexp, ParseError> {
        let mut pairs = Vec::new();
        loop {
            self.skip_newlines()?;
            if self.at_punct("}")? {
                break;
            }
            let tok = self.next()?;
            let pair_start = tok.span;
            let pair = if let TokenKind::Label(key) = tok.kind {
                self.skip_newlines()?;
                let value = self.expr()?;
                let span = self.since(pair_start);
                self.node(Tag::Pair, span, vec![Sexp::Sym(key), value])
            } else {
                self.push_back(tok);
                let key = self.expr()?;
                if key.is(Tag::DSplat) {
                    key
                } else {
                    self.skip_newlines()?;
                    self.expect_punct("=>")?;
                    self.skip_newlines()?;
                    let value = self.expr()?;
                    let span = self.since(pair_start);
                    self.node(Tag::Pair, span, vec![key, value])
                }
            };
            pairs.push(pair);
            self.skip_newlines()?;
            if !self.accept_punct(",")? {
                break;
            }
        }
        self.skip_newlines()?;
        self.expect_punct("}")?;
        let span = self.since(start);
        Ok(self.node(Tag::Hash, span, pairs))
    }

    // ═══════════════════════════════════════════════════════════════
    // Postfix forms
    // ═══════════════════════════════════════════════════════════════

    /// Calls, indexing, scoping and blocks after a primary starting at
    /// `start`.
    pub(crate) fn postfix(&mut self, mut value: Sexp, start: Span, ctx: Ctx) -> Result<Sexp, ParseError> {
        loop {
            let tok = self.next()?;
            value = match &tok.kind {
                TokenKind::Punct(".") => self.method_call(value, false, ctx)?,
                TokenKind::Punct("&.") => self.method_call(value, true, ctx)?,
                TokenKind::Punct("::") => self.scoped(value, start, ctx)?,
                TokenKind::Punct("[") => {
                    let items = self.list_items("]")?;
                    self.expect_punct("]")?;
                    let span = value.span().unwrap_or(start).merge(self.last_span);
                    self.method_call_node(value, "[]", items, span)
                }
                TokenKind::Punct("{") if takes_block(&value) => {
                    let block = self.block(tok.span, true)?;
                    self.attach_block(value, block)?
                }
                TokenKind::Keyword(Keyword::Do) if !ctx.no_do && takes_block(&value) => {
                    let block = self.block(tok.span, false)?;
                    self.attach_block(value, block)?
                }
                _ => {
                    self.push_back(tok);
                    return Ok(self.close_safe_chain(value));
                }
            };
        }
    }

    /// Mark a chain whose `&.` is not its last link, so a nil receiver
    /// there skips the calls after it as well.
    fn close_safe_chain(&mut self, value: Sexp) -> Sexp {
        let below = match value.as_node() {
            Some(n) if matches!(n.tag, Tag::Callm | Tag::SafeCallm) => n.child(0),
            _ => return value,
        };
        if !has_safe_link(below) {
            return value;
        }
        let span = value.span().unwrap_or(self.last_span);
        self.node(Tag::SafeChain, span, vec![value])
    }

    fn attach_block(&mut self, call: Sexp, block: Sexp) -> Result<Sexp, ParseError> {
        let Some(node) = call.into_node() else {
            return Err(ParseError::new("block given to a non-call", self.last_span));
        };
        if node.children.last().is_some_and(|b| b.is(Tag::BlockPass)) {
            return Err(ParseError::new(
                "both block argument and literal block given",
                node.span,
            ));
        }
        let mut children = node.children.clone();
        if let Some(last) = children.last_mut() {
            *last = block;
        }
        Ok(node.rebuild(children))
    }

    /// `recv.name args` after the dot.
    fn method_call(&mut self, recv: Sexp, safe: bool, ctx: Ctx) -> Result<Sexp, ParseError> {
        let tok = self.next()?;
        let name = match tok.kind {
            TokenKind::Ident(n) | TokenKind::Const(n) => n,
            TokenKind::Keyword(k) => k.as_str().to_string(),
            // `callable.(args)`
            TokenKind::Punct("(") => {
                self.push_back(tok);
                "call".to_string()
            }
            TokenKind::Punct("[") => {
                self.expect_punct("]")?;
                "[]".to_string()
            }
            TokenKind::Punct(p) if is_operator_method(p) => p.to_string(),
            _ => return Err(self.unexpected(&tok, "method name")),
        };
        self.finish_method_call(recv, name, safe, ctx)
    }

    /// `recv::Const` or `recv::method`.
    fn scoped(&mut self, recv: Sexp, start: Span, ctx: Ctx) -> Result<Sexp, ParseError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Const(c) if !self.at_tight_paren()? => {
                let span = recv.span().unwrap_or(start).merge(tok.span);
                Ok(self.node(Tag::Colon2, span, vec![recv, Sexp::Name(c)]))
            }
            TokenKind::Const(name) | TokenKind::Ident(name) => {
                self.finish_method_call(recv, name, false, ctx)
            }
            _ => Err(self.unexpected(&tok, "constant or method name")),
        }
    }

    fn finish_method_call(
        &mut self,
        recv: Sexp,
        name: String,
        safe: bool,
        ctx: Ctx,
    ) -> Result<Sexp, ParseError> {
        let start = recv.span().unwrap_or(self.last_span);
        let (args, block) = if self.at_tight_paren()? || (name == "call" && self.at_punct("(")?) {
            self.next()?;
            self.paren_arguments()?
        } else if self.starts_command_argument()? {
            self.command_arguments(ctx)?
        } else {
            (vec![], Sexp::Nil)
        };
        let span = self.since(start);
        let args = self.node(Tag::Args, span, args);
        let tag = if safe { Tag::SafeCallm } else { Tag::Callm };
        Ok(self.node(tag, span, vec![recv, Sexp::Name(name), args, block]))
    }
}

fn prefix_operator(tok: &Token) -> Option<Oper> {
    match &tok.kind {
        TokenKind::Punct(p) if matches!(*p, "!" | "~" | "-" | "+" | "*" | "**" | "&") => {
            operators::prefix(p)
        }
        TokenKind::Keyword(Keyword::Not) => operators::prefix("not"),
        TokenKind::Keyword(Keyword::Defined) => operators::prefix("defined?"),
        _ => None,
    }
}

fn infix_operator(tok: &Token, ctx: Ctx) -> Option<Oper> {
    let sym = match &tok.kind {
        TokenKind::Punct(p) => *p,
        TokenKind::Keyword(Keyword::And) => "and",
        TokenKind::Keyword(Keyword::Or) => "or",
        _ => return None,
    };
    let op = operators::infix(sym)?;
    if ctx.no_pipe && sym == "|" {
        return None;
    }
    if ctx.stop_at_assign && op.kind == OpKind::Assign {
        return None;
    }
    Some(op)
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use crate::parser::{ParseError, Parser};

    fn expr(src: &str) -> String {
        let program = Parser::new(src)
            .parse()
            .unwrap_or_else(|e| panic!("{src:?}: {e}"));
        match program.body.children() {
            [only] => only.to_string(),
            other => panic!("{src:?} has {} statements", other.len()),
        }
    }

    fn err(src: &str) -> ParseError {
        match Parser::new(src).parse() {
            Ok(p) => panic!("{src:?} parsed as {}", p.body),
            Err(e) => e,
        }
    }

    // ── Precedence ──

    #[test]
    fn multiplication_before_addition() {
        assert_eq!(
            expr("1 + 2 * 3"),
            "[:callm, 1, :\"+\", [:args, [:callm, 2, :\"*\", [:args, 3], nil]], nil]"
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(
            expr("1 - 2 - 3"),
            "[:callm, [:callm, 1, :\"-\", [:args, 2], nil], :\"-\", [:args, 3], nil]"
        );
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(
            expr("2 ** 3 ** 2"),
            "[:callm, 2, :\"**\", [:args, [:callm, 3, :\"**\", [:args, 2], nil]], nil]"
        );
    }

    #[test]
    fn and_or_keywords_bind_loosest() {
        let e = expr("x = true or false");
        assert_eq!(e, "[:or, [:assign, :x, :true], :false]");
    }

    #[test]
    fn assignment_binds_to_nearest_value() {
        assert_eq!(
            expr("a && b = c"),
            "[:and, [:call, :a, [:args], nil], [:assign, :b, [:call, :c, [:args], nil]]]"
        );
    }

    #[test]
    fn assignment_is_right_associative() {
        assert_eq!(expr("a = b = 1"), "[:assign, :a, [:assign, :b, 1]]");
    }

    #[test]
    fn op_assign() {
        assert_eq!(expr("@x ||= []"), "[:opassign, :@x, :\"||\", [:array]]");
    }

    #[test]
    fn attribute_and_index_assignment() {
        assert_eq!(expr("o.x = 1"), "[:callm, [:call, :o, [:args], nil], :x=, [:args, 1], nil]");
        assert_eq!(
            expr("h[:k] = 2"),
            "[:callm, [:call, :h, [:args], nil], :\"[]=\", [:args, [:sym, :k], 2], nil]"
        );
    }

    #[test]
    fn ternary() {
        assert_eq!(
            expr("a ? b : c"),
            "[:if, [:call, :a, [:args], nil], [:call, :b, [:args], nil], [:call, :c, [:args], nil]]"
        );
    }

    #[test]
    fn nested_ternary_in_else() {
        let e = expr("true ? 1 : false ? 2 : 3");
        assert_eq!(e, "[:if, :true, 1, [:if, :false, 2, 3]]");
    }

    #[test]
    fn ternary_binds_looser_than_or() {
        assert_eq!(expr("true || false ? 1 : 2"), "[:if, [:or, :true, :false], 1, 2]");
    }

    #[test]
    fn ranges() {
        assert!(expr("1..n + 1").starts_with("[:range, 1, [:callm"));
        assert_eq!(expr("(1...3)"), "[:erange, 1, 3]");
    }

    // ── Prefix ──

    #[test]
    fn negative_literal_folds() {
        assert_eq!(expr("- 5"), "-5");
    }

    #[test]
    fn unary_minus_on_expression() {
        assert_eq!(
            expr("-(a)"),
            "[:callm, [:call, :a, [:args], nil], :\"-@\", [:args], nil]"
        );
    }

    #[test]
    fn not_and_bang() {
        assert_eq!(expr("!a"), "[:not, [:call, :a, [:args], nil]]");
        assert!(expr("not a == b").starts_with("[:not, [:callm"));
    }

    #[test]
    fn bang_binds_tighter_than_method_result() {
        assert_eq!(
            expr("!a.nil?"),
            "[:not, [:callm, [:call, :a, [:args], nil], :nil?, [:args], nil]]"
        );
    }

    #[test]
    fn defined() {
        assert_eq!(expr("defined?(@x)"), "[:defined, :@x]");
    }

    // ── Calls ──

    #[test]
    fn command_call_with_args() {
        assert_eq!(expr("puts 1, 2"), "[:call, :puts, [:args, 1, 2], nil]");
    }

    #[test]
    fn command_call_with_negative_argument() {
        assert_eq!(expr("foo -1"), "[:call, :foo, [:args, -1], nil]");
    }

    #[test]
    fn spaced_minus_is_subtraction_for_locals() {
        let program = Parser::new("x = 3\nx -1").parse().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            program.body.children()[1].to_string(),
            "[:callm, :x, :\"-\", [:args, 1], nil]"
        );
    }

    #[test]
    fn splat_and_block_pass_arguments() {
        assert_eq!(
            expr("f(*a, &b)"),
            "[:call, :f, [:args, [:splat, [:call, :a, [:args], nil]]], [:blockpass, [:call, :b, [:args], nil]]]"
        );
    }

    #[test]
    fn keyword_arguments_become_hash() {
        assert_eq!(
            expr("f(1, a: 2, :b => 3)"),
            "[:call, :f, [:args, 1, [:hash, [:pair, [:sym, :a], 2], [:pair, [:sym, :b], 3]]], nil]"
        );
    }

    #[test]
    fn method_chain() {
        assert_eq!(
            expr("a.b(1).c"),
            "[:callm, [:callm, [:call, :a, [:args], nil], :b, [:args, 1], nil], :c, [:args], nil]"
        );
    }

    #[test]
    fn safe_navigation() {
        assert_eq!(
            expr("a&.b"),
            "[:safecallm, [:call, :a, [:args], nil], :b, [:args], nil]"
        );
    }

    #[test]
    fn safe_navigation_spans_the_rest_of_the_chain() {
        assert_eq!(
            expr("a&.b(1).d"),
            "[:safechain, [:callm, [:safecallm, [:call, :a, [:args], nil], :b, [:args, 1], nil], :d, [:args], nil]]"
        );
        assert!(expr("a&.b[0]").starts_with("[:safechain, [:callm, [:safecallm, "));
        assert!(expr("a.b&.c.d&.e").starts_with("[:safechain, [:safecallm, [:callm, [:safecallm, "));
    }

    #[test]
    fn operators_are_outside_the_safe_chain() {
        assert_eq!(
            expr("a&.b + 1"),
            "[:callm, [:safecallm, [:call, :a, [:args], nil], :b, [:args], nil], :\"+\", [:args, 1], nil]"
        );
        // Arguments hold chains of their own.
        assert_eq!(
            expr("a.f(x&.y.z)"),
            "[:callm, [:call, :a, [:args], nil], :f, [:args, [:safechain, [:callm, [:safecallm, [:call, :x, [:args], nil], :y, [:args], nil], :z, [:args], nil]]], nil]"
        );
    }

    #[test]
    fn assignment_through_safe_chain() {
        let program = Parser::new("o = nil\no&.a.b = 2").parse().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            program.body.children()[1].to_string(),
            "[:safechain, [:callm, [:safecallm, :o, :a, [:args], nil], :b=, [:args, 2], nil]]"
        );
    }

    #[test]
    fn scoped_constant() {
        assert_eq!(expr("A::B"), "[:colon2, :A, :B]");
        assert_eq!(expr("::A"), "[:colon3, :A]");
        assert_eq!(expr("A::new"), "[:callm, :A, :new, [:args], nil]");
    }

    #[test]
    fn index() {
        let program = Parser::new("a = [1]\na[0]").parse().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            program.body.children()[1].to_string(),
            "[:callm, :a, :\"[]\", [:args, 0], nil]"
        );
    }

    #[test]
    fn call_with_dot_parens() {
        let program = Parser::new("f = 1\nf.(2)").parse().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            program.body.children()[1].to_string(),
            "[:callm, :f, :call, [:args, 2], nil]"
        );
    }

    #[test]
    fn block_pass_and_literal_block_conflict() {
        let e = err("f(&b) { 1 }");
        assert!(e.message.contains("both block"), "{e}");
    }

    // ── Literals ──

    #[test]
    fn array_and_hash_literals() {
        assert_eq!(expr("[1, *a]"), "[:array, 1, [:splat, [:call, :a, [:args], nil]]]");
        assert_eq!(
            expr("{a: 1, \"b\" => 2}"),
            "[:hash, [:pair, [:sym, :a], 1], [:pair, \"b\", 2]]"
        );
        assert_eq!(expr("{}"), "[:hash]");
    }

    #[test]
    fn multiline_array() {
        assert_eq!(expr("[\n1,\n2,\n]"), "[:array, 1, 2]");
    }

    #[test]
    fn words_and_regex() {
        assert_eq!(expr("%w[a b]"), "[:array, \"a\", \"b\"]");
        assert_eq!(expr("/ab+/i"), "[:regex, \"ab+\", \"i\"]");
    }

    #[test]
    fn empty_parens_are_nil() {
        assert_eq!(expr("()"), ":nil");
    }

    // ── Diagnostics ──

    #[test]
    fn missing_operand_dumps_stacks() {
        let e = err("1 +");
        assert_eq!(e.message, "Missing value in expression");
        let dump = e.stack.as_ref().unwrap_or_else(|| panic!("no dump"));
        assert_eq!(dump.operator, "+");
        assert_eq!(dump.priority, 75);
        assert_eq!(dump.vstack, vec!["1".to_string()]);
        let text = e.to_string();
        assert!(text.contains("op: + (priority 75)"), "{text}");
        assert!(text.contains("vstack: [1]"), "{text}");
        assert!(text.contains("rightv: nil"), "{text}");
    }

    #[test]
    fn missing_ternary_colon() {
        let e = err("a ? b");
        assert!(e.message.contains("Missing ':'"), "{e}");
    }

    #[test]
    fn unexpected_token_without_operator() {
        let e = err(")");
        assert!(e.message.contains("expected expression"), "{e}");
        assert!(e.stack.is_none());
    }
}
