/// Lowering of syntactic sugar into the core vocabulary.
///
/// Two passes, split around constant folding:
///
/// * [`structure`] rewrites forms whose shape the folder must not see:
///   `for` loops, multiple assignment and destructuring parameters, block
///   auto-splat, string interpolation, range and regex literals.
/// * [`sugar`] lowers the remaining surface: operator assignment,
///   `!=`, `unless` shapes, `attr_*`, default and keyword parameters,
///   `&:sym`, visibility calls, splats in literals and calls, `case`,
///   rescue clauses and `defined?`.
///
/// Both introduce temporaries named `__<stem><n>`; the suffix is a fresh
/// node id so names never clash within a unit.
use parser::{Node, NodeIds, Sexp, Span, Tag};

use super::{Build, boolean, is_constant_name, is_local_name, map_children, nil};
use crate::error::{CompileError, Result};

fn temp(ids: &mut NodeIds, stem: &str) -> String {
    format!("__{stem}{}", ids.fresh().0)
}

fn span_of(e: &Sexp, fallback: Span) -> Span {
    e.span().unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════
// Structural pass
// ═══════════════════════════════════════════════════════════════════

pub fn structure(body: Sexp, ids: &mut NodeIds) -> Result<Sexp> {
    Structure { ids }.expr(body)
}

struct Structure<'a> {
    ids: &'a mut NodeIds,
}

impl Structure<'_> {
    fn expr(&mut self, e: Sexp) -> Result<Sexp> {
        let Sexp::Node(node) = e else {
            return Ok(e);
        };
        match node.tag {
            Tag::For => self.for_loop(node),
            Tag::MAsgn => {
                let targets = node.child(0).children().to_vec();
                let rhs = self.expr(node.child(1).clone())?;
                Ok(self.masgn(targets, rhs, node.span))
            }
            Tag::Interp => self.interpolation(node),
            Tag::Range | Tag::ERange => {
                let exclusive = node.tag == Tag::ERange;
                let mut ends = Vec::with_capacity(3);
                for end in node.children {
                    ends.push(match end {
                        Sexp::Nil => nil(),
                        other => self.expr(other)?,
                    });
                }
                ends.push(boolean(exclusive));
                Ok(self.ids.callm(node.span, Sexp::name("Range"), "new", ends))
            }
            Tag::Regex => {
                let mut args = vec![node.child(0).clone()];
                if !matches!(node.child(1), Sexp::Str(f) if f.is_empty()) {
                    args.push(node.child(1).clone());
                }
                Ok(self.ids.callm(node.span, Sexp::name("Regexp"), "new", args))
            }
            Tag::Call if node.child(0).as_name() == Some("lambda") && node.child(2).is(Tag::Lambda) => {
                let Some(block) = node.child(2).as_node().cloned() else {
                    return Ok(Sexp::Node(node));
                };
                let block = self.block(block, true)?;
                let args = self.expr(node.child(1).clone())?;
                Ok(node.rebuild(vec![node.child(0).clone(), args, block]))
            }
            Tag::Lambda => self.block(node, false),
            Tag::Defm | Tag::Defs => {
                let at = if node.tag == Tag::Defm { 1 } else { 2 };
                let mut children = node.children.clone();
                let (params, prologue) = self.destructure_params(node.child(at).clone())?;
                let body = self.expr(node.child(at + 1).clone())?;
                children[at] = params;
                children[at + 1] = self.prepend(prologue, body, node.span);
                if node.tag == Tag::Defs {
                    children[0] = self.expr(children[0].clone())?;
                }
                Ok(node.rebuild(children))
            }
            _ => map_children(node, |c| self.expr(c)),
        }
    }

    fn prepend(&mut self, mut prologue: Vec<Sexp>, body: Sexp, span: Span) -> Sexp {
        if prologue.is_empty() {
            return body;
        }
        prologue.push(body);
        self.ids.seq(span, prologue)
    }

    /// `for x in e; body; end` → `x = x; e.each { |t| x = t; body }`.
    fn for_loop(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let var = node.child(0).clone();
        let iter = self.expr(node.child(1).clone())?;
        let body = self.expr(node.child(2).clone())?;
        let param = temp(self.ids, "for");

        let mut outer = Vec::new();
        let targets = if var.is(Tag::Array) {
            var.children().to_vec()
        } else {
            vec![var.clone()]
        };
        for t in &targets {
            if let Sexp::Name(n) = t {
                outer.push(self.ids.set(span, Sexp::name(n.as_str()), Sexp::name(n.as_str())));
            }
        }
        let bind = if var.is(Tag::Array) {
            self.masgn(targets, Sexp::name(param.as_str()), span)
        } else {
            self.ids.set(span, var, Sexp::name(param.as_str()))
        };
        let body = self.ids.seq(span, vec![bind, body]);
        let params = self.ids.args(span, vec![Sexp::name(param.as_str())]);
        let block = self.ids.node(Tag::Lambda, span, vec![params, body]);
        let no_args = self.ids.args(span, vec![]);
        outer.push(self.ids.node(
            Tag::Callm,
            span,
            vec![iter, Sexp::name("each"), no_args, block],
        ));
        Ok(self.ids.seq(span, outer))
    }

    /// `a, *b, c = rhs`. Non-array values are wrapped first, so
    /// `a, b = 1` sets `a = 1, b = nil`.
    fn masgn(&mut self, targets: Vec<Sexp>, rhs: Sexp, span: Span) -> Sexp {
        let tmp = temp(self.ids, "masgn");
        let literal = rhs.is(Tag::Array);
        let mut stmts = vec![self.ids.set(span, Sexp::name(tmp.as_str()), rhs)];
        if !literal {
            let is_array = self.ids.callm(
                span,
                Sexp::name(tmp.as_str()),
                "is_a?",
                vec![Sexp::name("Array")],
            );
            let wrapped = self.ids.node(Tag::Array, span, vec![Sexp::name(tmp.as_str())]);
            let wrap = self.ids.set(span, Sexp::name(tmp.as_str()), wrapped);
            stmts.push(self.ids.if_(span, is_array, nil(), wrap));
        }
        stmts.extend(self.bind_all(&tmp, targets, span));
        stmts.push(Sexp::name(tmp.as_str()));
        self.ids.seq(span, stmts)
    }

    /// Assignments of the elements of array `tmp` to `targets`.
    fn bind_all(&mut self, tmp: &str, targets: Vec<Sexp>, span: Span) -> Vec<Sexp> {
        let splat = targets.iter().position(|t| t.is(Tag::Splat));
        let count = targets.len();
        let mut stmts = Vec::with_capacity(count);
        for (i, target) in targets.into_iter().enumerate() {
            let index = match splat {
                Some(s) if i == s => {
                    let after = (count - s - 1) as i64;
                    self.ids.callm(
                        span,
                        Sexp::name("Range"),
                        "new",
                        vec![Sexp::Int(i as i64), Sexp::Int(-(after + 1)), boolean(false)],
                    )
                }
                Some(s) if i > s => Sexp::Int(i as i64 - count as i64),
                _ => Sexp::Int(i as i64),
            };
            let value = self.ids.callm(span, Sexp::name(tmp), "[]", vec![index]);
            stmts.push(self.bind(target, value, span));
        }
        stmts
    }

    fn bind(&mut self, target: Sexp, value: Sexp, span: Span) -> Sexp {
        match target {
            Sexp::Node(n) if n.tag == Tag::Splat => {
                let inner = n.child(0).clone();
                if inner.is_nil() {
                    value
                } else {
                    self.bind(inner, value, span)
                }
            }
            Sexp::Node(n) if matches!(n.tag, Tag::Array | Tag::Destruct) => {
                let targets = n.children.into_iter().map(param_target).collect();
                self.masgn(targets, value, span)
            }
            other => self.ids.set(span, other, value),
        }
    }

    /// Replace destructuring parameters by temporaries and return the
    /// statements unpacking them.
    fn destructure_params(&mut self, params: Sexp) -> Result<(Sexp, Vec<Sexp>)> {
        let Some(node) = params.as_node().cloned() else {
            return Ok((params, Vec::new()));
        };
        let mut out = Vec::with_capacity(node.children.len());
        let mut prologue = Vec::new();
        for p in node.children.iter().cloned() {
            match p {
                Sexp::Node(d) if d.tag == Tag::Destruct => {
                    let tmp = temp(self.ids, "arg");
                    let targets = d.children.iter().cloned().map(param_target).collect();
                    prologue.extend(self.bind_all(&tmp, targets, d.span));
                    out.push(Sexp::name(tmp.as_str()));
                }
                Sexp::Node(d) if d.tag == Tag::Default || d.tag == Tag::KwArg => {
                    let value = self.expr(d.child(1).clone())?;
                    out.push(d.rebuild(vec![d.child(0).clone(), value]));
                }
                other => out.push(other),
            }
        }
        Ok((node.rebuild(out), prologue))
    }

    /// A block's parameters. Non-strict blocks with several positional
    /// parameters take `*args` and splat a lone array argument.
    fn block(&mut self, node: Node, strict: bool) -> Result<Sexp> {
        let span = node.span;
        let params = node.child(0).clone();
        let body = self.expr(node.child(1).clone())?;

        let items = params.children();
        let positional = items
            .iter()
            .filter(|p| matches!(p, Sexp::Name(_)) || p.is(Tag::Destruct) || p.is(Tag::Default))
            .count();
        let has_rest = items.iter().any(|p| p.is(Tag::Rest));
        let splats = !strict && (positional >= 2 || (positional == 1 && has_rest));
        if !splats {
            let (params, prologue) = self.destructure_params(params)?;
            let body = self.prepend(prologue, body, span);
            return Ok(node.rebuild(vec![params, body]));
        }

        let packed = temp(self.ids, "blk");
        let mut targets = Vec::new();
        let mut defaults = Vec::new();
        let mut kept = Vec::new();
        for p in items.iter().cloned() {
            match p {
                Sexp::Name(_) => targets.push(p),
                Sexp::Node(n) => match n.tag {
                    Tag::Destruct => targets.push(Sexp::Node(n)),
                    Tag::Default => {
                        let name = n.child(0).clone();
                        let value = self.expr(n.child(1).clone())?;
                        targets.push(name.clone());
                        defaults.push((name, value));
                    }
                    Tag::Rest => {
                        let inner = n.child(0).clone();
                        targets.push(self.ids.node(Tag::Splat, n.span, vec![inner]));
                    }
                    _ => kept.push(Sexp::Node(n)),
                },
                other => kept.push(other),
            }
        }

        let p = || Sexp::name(packed.as_str());
        let len = self.ids.callm(span, p(), "length", vec![]);
        let single = self.ids.callm(span, len, "==", vec![Sexp::Int(1)]);
        let first = self.ids.callm(span, p(), "[]", vec![Sexp::Int(0)]);
        let is_array = self.ids.callm(span, first.clone(), "is_a?", vec![Sexp::name("Array")]);
        let cond = self.ids.node(Tag::And, span, vec![single, is_array]);
        let unwrap = self.ids.set(span, p(), first);
        let mut prologue = vec![self.ids.if_(span, cond, unwrap, nil())];
        prologue.extend(self.bind_all(&packed, targets, span));
        for (name, value) in defaults {
            let missing = self.ids.callm(span, name.clone(), "nil?", vec![]);
            let set = self.ids.set(span, name, value);
            prologue.push(self.ids.if_(span, missing, set, nil()));
        }

        let rest = self.ids.node(Tag::Rest, span, vec![p()]);
        let mut new_params = vec![rest];
        new_params.extend(kept);
        let params = params
            .as_node()
            .map(|n| n.rebuild(new_params.clone()))
            .unwrap_or_else(|| self.ids.args(span, new_params));
        let body = self.prepend(prologue, body, span);
        Ok(node.rebuild(vec![params, body]))
    }

    /// `"a#{x}b"` → `"a" + x.to_s + "b"`.
    fn interpolation(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let mut acc: Option<Sexp> = None;
        for part in node.children {
            let piece = match part {
                Sexp::Str(_) => part,
                other => {
                    let s = span_of(&other, span);
                    let value = self.expr(other)?;
                    self.ids.callm(s, value, "to_s", vec![])
                }
            };
            acc = Some(match acc {
                None => piece,
                Some(prev) => self.ids.callm(span, prev, "+", vec![piece]),
            });
        }
        Ok(match acc {
            Some(Sexp::Str(s)) => {
                // A lone literal part still yields a fresh string.
                self.ids.callm(span, Sexp::Str(s), "+", vec![Sexp::Str(Vec::new())])
            }
            Some(e) => e,
            None => Sexp::Str(Vec::new()),
        })
    }
}

/// A parameter or masgn item as an assignment target.
fn param_target(p: Sexp) -> Sexp {
    match p {
        Sexp::Node(n) if n.tag == Tag::Rest => {
            let inner = n.child(0).clone();
            Sexp::Node(Node {
                tag: Tag::Splat,
                children: vec![inner],
                span: n.span,
                id: n.id,
            })
        }
        Sexp::Node(n) if n.tag == Tag::Default => n.child(0).clone(),
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════
// Sugar pass
// ═══════════════════════════════════════════════════════════════════

pub fn sugar(body: Sexp, ids: &mut NodeIds) -> Result<Sexp> {
    Sugar {
        ids,
        class_body: false,
    }
    .expr(body)
}

struct Sugar<'a> {
    ids: &'a mut NodeIds,
    /// Directly inside a class or module body.
    class_body: bool,
}

const VISIBILITY: &[&str] = &[
    "private",
    "public",
    "protected",
    "module_function",
    "private_class_method",
    "public_class_method",
    "private_constant",
];

impl Sugar<'_> {
    fn expr(&mut self, e: Sexp) -> Result<Sexp> {
        let Sexp::Node(node) = e else {
            return Ok(e);
        };
        match node.tag {
            Tag::OpAssign => self.op_assign(node),
            Tag::If => {
                let Sexp::Node(n) = map_children(node, |c| self.expr(c))? else {
                    return Err(CompileError::transform("malformed if", None));
                };
                if let Some(cond) = n.child(0).as_node().filter(|c| c.tag == Tag::Not) {
                    let inner = cond.child(0).clone();
                    return Ok(n.rebuild(vec![inner, n.child(2).clone(), n.child(1).clone()]));
                }
                Ok(Sexp::Node(n))
            }
            Tag::Call => self.call(node),
            Tag::Callm | Tag::SafeCallm => self.method_call(node),
            Tag::Super => {
                let args = self.call_args(node.child(0).clone())?;
                let block = self.block(node.child(1).clone())?;
                Ok(node.rebuild(vec![args, block]))
            }
            Tag::ZSuper => {
                let block = self.block(node.child(0).clone())?;
                Ok(node.rebuild(vec![block]))
            }
            Tag::Yield => {
                let args = self.call_args(node.child(0).clone())?;
                Ok(node.rebuild(vec![args]))
            }
            Tag::Defm => self.definition(node, 1, 3),
            Tag::Defs => self.definition(node, 2, 3),
            Tag::Lambda => self.definition(node, 0, 4),
            Tag::Class | Tag::Module | Tag::SClass => {
                let saved = std::mem::replace(&mut self.class_body, true);
                let out = map_children(node, |c| self.expr(c));
                self.class_body = saved;
                out
            }
            Tag::Array => self.array(node),
            Tag::Hash => self.hash(node),
            Tag::Assign if node.child(1).is(Tag::Splat) => {
                let target = self.expr(node.child(0).clone())?;
                let value = self.expr(node.child(1).children()[0].clone())?;
                let value = self.ids.callm(node.span, value, "to_a", vec![]);
                Ok(node.rebuild(vec![target, value]))
            }
            Tag::Case => self.case(node),
            Tag::Begin => self.begin(node),
            Tag::Defined => self.defined(node),
            _ => map_children(node, |c| self.expr(c)),
        }
    }

    fn exprs(&mut self, items: &[Sexp]) -> Result<Vec<Sexp>> {
        items.iter().cloned().map(|c| self.expr(c)).collect()
    }

    // ── Operator assignment ──

    fn op_assign(&mut self, node: Node) -> Result<Sexp> {
        if let Some(chain) = node.child(0).as_node().filter(|t| t.tag == Tag::SafeChain) {
            let chain = chain.clone();
            let inner = Node {
                children: vec![chain.child(0).clone(), node.child(1).clone(), node.child(2).clone()],
                ..node
            };
            let body = self.op_assign(inner)?;
            return Ok(chain.rebuild(vec![body]));
        }
        let span = node.span;
        let op = node.child(1).as_name().unwrap_or("+").to_string();
        let value = self.expr(node.child(2).clone())?;
        let mut pre = Vec::new();
        let read = match node.child(0) {
            Sexp::Node(t) if matches!(t.tag, Tag::Callm | Tag::SafeCallm) => {
                let recv = self.expr(t.child(0).clone())?;
                let r = temp(self.ids, "recv");
                pre.push(self.ids.set(span, Sexp::name(r.as_str()), recv));
                let mut index = Vec::new();
                for a in t.child(2).children().to_vec() {
                    let a = self.expr(a)?;
                    let i = temp(self.ids, "idx");
                    pre.push(self.ids.set(span, Sexp::name(i.as_str()), a));
                    index.push(Sexp::name(i.as_str()));
                }
                let name = t.child(1).as_name().unwrap_or("[]").to_string();
                self.ids.callm(span, Sexp::name(r.as_str()), &name, index)
            }
            Sexp::Name(n) if n == "self" || n == "nil" => {
                return Err(CompileError::transform(format!("cannot assign to {n}"), Some(span)));
            }
            other => self.expr(other.clone())?,
        };
        let result = match op.as_str() {
            "||" | "&&" => {
                let write = self.ids.set(span, read.clone(), value);
                let tag = if op == "||" { Tag::Or } else { Tag::And };
                self.ids.node(tag, span, vec![read, write])
            }
            _ => {
                let combined = self.ids.callm(span, read.clone(), &op, vec![value]);
                self.ids.set(span, read, combined)
            }
        };
        if pre.is_empty() {
            return Ok(result);
        }
        pre.push(result);
        Ok(self.ids.seq(span, pre))
    }

    // ── Calls ──

    fn call(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let name = node.child(0).as_name().unwrap_or_default().to_string();
        let raw_args = node.child(1).children().to_vec();

        if VISIBILITY.contains(&name.as_str()) && node.child(2).is_nil() {
            return match raw_args.as_slice() {
                [def] if def.is(Tag::Defm) || def.is(Tag::Defs) => self.expr(def.clone()),
                _ => Ok(nil()),
            };
        }
        if self.class_body && matches!(name.as_str(), "attr_reader" | "attr_writer" | "attr_accessor") {
            return self.attributes(&name, &raw_args, span);
        }

        let args = self.call_args(node.child(1).clone())?;
        let block = self.block(node.child(2).clone())?;
        Ok(node.rebuild(vec![node.child(0).clone(), args, block]))
    }

    fn method_call(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let recv = self.expr(node.child(0).clone())?;
        let args = self.call_args(node.child(2).clone())?;
        let block = self.block(node.child(3).clone())?;
        let negated = match node.child(1).as_name() {
            Some("!=") => Some("=="),
            Some("!~") => Some("=~"),
            _ => None,
        };
        if let Some(positive) = negated {
            let call = self.ids.node(
                node.tag,
                span,
                vec![recv, Sexp::name(positive), args, block],
            );
            return Ok(self.ids.node(Tag::Not, span, vec![call]));
        }
        Ok(node.rebuild(vec![recv, node.child(1).clone(), args, block]))
    }

    /// Call arguments; splats turn the whole list into one array.
    fn call_args(&mut self, args: Sexp) -> Result<Sexp> {
        let Some(node) = args.as_node().cloned() else {
            return Ok(args);
        };
        let items = self.exprs(&node.children)?;
        if !items.iter().any(|a| a.is(Tag::Splat)) {
            return Ok(node.rebuild(items));
        }
        let array = self.splat_array(items, node.span);
        let splat = self.ids.node(Tag::Splat, node.span, vec![array]);
        Ok(node.rebuild(vec![splat]))
    }

    /// The block slot: a literal block, `&:sym`, `&expr` or nothing.
    fn block(&mut self, block: Sexp) -> Result<Sexp> {
        match block {
            Sexp::Node(n) if n.tag == Tag::BlockPass => match n.child(0).clone() {
                Sexp::Sym(method) => {
                    let x = temp(self.ids, "bp");
                    let params = self.ids.args(n.span, vec![Sexp::name(x.as_str())]);
                    let body = self.ids.callm(n.span, Sexp::name(x.as_str()), &method, vec![]);
                    let lambda = self.ids.node(Tag::Lambda, n.span, vec![params, body]);
                    self.expr(lambda)
                }
                other => self.expr(other),
            },
            Sexp::Nil => Ok(Sexp::Nil),
            other => self.expr(other),
        }
    }

    fn attributes(&mut self, kind: &str, args: &[Sexp], span: Span) -> Result<Sexp> {
        let mut defs = Vec::new();
        for a in args {
            let name = match a {
                Sexp::Sym(s) => s.clone(),
                Sexp::Str(b) => String::from_utf8_lossy(b).into_owned(),
                _ => {
                    return Err(CompileError::transform(
                        format!("{kind} expects symbols"),
                        Some(span_of(a, span)),
                    ));
                }
            };
            let ivar = Sexp::Name(format!("@{name}"));
            if kind != "attr_writer" {
                let params = self.ids.args(span, vec![]);
                defs.push(self.ids.node(
                    Tag::Defm,
                    span,
                    vec![Sexp::Name(name.clone()), params, ivar.clone()],
                ));
            }
            if kind != "attr_reader" {
                let params = self.ids.args(span, vec![Sexp::name("value")]);
                let body = self.ids.set(span, ivar, Sexp::name("value"));
                defs.push(self.ids.node(
                    Tag::Defm,
                    span,
                    vec![Sexp::Name(format!("{name}=")), params, body],
                ));
            }
        }
        defs.push(nil());
        Ok(self.ids.seq(span, defs))
    }

    // ── Definitions ──

    /// Parameters of a method or block starting at child `at`. `base` is
    /// the argument count (self, block and, for blocks, the environment)
    /// before the first user parameter.
    fn definition(&mut self, node: Node, at: usize, base: i64) -> Result<Sexp> {
        let span = node.span;
        let saved = std::mem::replace(&mut self.class_body, false);
        let result = self.definition_inner(&node, at, base, span);
        self.class_body = saved;
        let (params, body) = result?;
        let mut children = node.children.clone();
        if at == 2 {
            children[0] = self.expr(children[0].clone())?;
        }
        children[at] = params;
        children[at + 1] = body;
        Ok(node.rebuild(children))
    }

    fn definition_inner(
        &mut self,
        node: &Node,
        at: usize,
        base: i64,
        span: Span,
    ) -> Result<(Sexp, Sexp)> {
        let params_node = node.child(at).clone();
        let mut params = Vec::new();
        let mut trailing = Vec::new();
        let mut prologue = Vec::new();
        let mut keywords = Vec::new();
        let mut positional = 0i64;
        let mut has_rest = false;

        for p in params_node.children().iter().cloned() {
            match p {
                Sexp::Name(_) => {
                    params.push(p);
                    positional += 1;
                }
                Sexp::Node(n) => match n.tag {
                    Tag::Default => {
                        let name = n.child(0).clone();
                        let value = self.expr(n.child(1).clone())?;
                        let missing = self.missing(positional + base, n.span);
                        let set = self.ids.set(n.span, name.clone(), value);
                        prologue.push(self.ids.if_(n.span, missing, set, nil()));
                        params.push(name);
                        positional += 1;
                    }
                    Tag::KwArg => {
                        let value = match n.child(1) {
                            Sexp::Nil => None,
                            v => Some(self.expr(v.clone())?),
                        };
                        keywords.push((n.child(0).clone(), value, n.span));
                    }
                    Tag::Rest => {
                        has_rest = true;
                        trailing.push(Sexp::Node(n));
                    }
                    Tag::BlockArg => trailing.push(Sexp::Node(n)),
                    _ => {
                        return Err(CompileError::transform(
                            format!("unsupported parameter [:{}]", n.tag.as_str()),
                            Some(n.span),
                        ));
                    }
                },
                other => {
                    return Err(CompileError::transform(
                        format!("unsupported parameter {other}"),
                        Some(span),
                    ));
                }
            }
        }

        if !keywords.is_empty() {
            if has_rest {
                return Err(CompileError::transform(
                    "keyword arguments after a rest parameter are not supported",
                    Some(span),
                ));
            }
            let kw = temp(self.ids, "kwargs");
            let k = || Sexp::name(kw.as_str());
            let missing = self.missing(positional + base, span);
            let clear = self.ids.set(span, k(), nil());
            prologue.push(self.ids.if_(span, missing, clear, nil()));
            for (name, default, s) in keywords {
                let key = Sexp::Sym(name.as_name().unwrap_or_default().to_string());
                let fetch = self.ids.callm(s, k(), "[]", vec![key]);
                let value = self.ids.node(Tag::And, s, vec![k(), fetch]);
                prologue.push(self.ids.set(s, name.clone(), value));
                if let Some(default) = default {
                    let is_nil = self.ids.callm(s, name.clone(), "nil?", vec![]);
                    let set = self.ids.set(s, name, default);
                    prologue.push(self.ids.if_(s, is_nil, set, nil()));
                }
            }
            params.push(k());
        }
        params.extend(trailing);

        let body = self.expr(node.child(at + 1).clone())?;
        let body = if prologue.is_empty() {
            body
        } else {
            prologue.push(body);
            self.ids.seq(span, prologue)
        };
        let params = match params_node.as_node() {
            Some(n) => n.rebuild(params),
            None => self.ids.args(span, params),
        };
        Ok((params, body))
    }

    /// `[:numargs] < count`
    fn missing(&mut self, count: i64, span: Span) -> Sexp {
        let numargs = self.ids.node(Tag::Numargs, span, vec![]);
        self.ids.callm(span, numargs, "<", vec![Sexp::Int(count)])
    }

    // ── Literals ──

    /// `[a, *b, c]` → `[a] + b.to_a + [c]`.
    fn splat_array(&mut self, items: Vec<Sexp>, span: Span) -> Sexp {
        let mut parts = Vec::new();
        let mut run = Vec::new();
        for item in items {
            if let Sexp::Node(n) = &item {
                if n.tag == Tag::Splat {
                    if !run.is_empty() {
                        parts.push(self.ids.node(Tag::Array, span, std::mem::take(&mut run)));
                    }
                    let inner = n.child(0).clone();
                    parts.push(self.ids.callm(n.span, inner, "to_a", vec![]));
                    continue;
                }
            }
            run.push(item);
        }
        if !run.is_empty() {
            parts.push(self.ids.node(Tag::Array, span, run));
        }
        let mut acc = match parts.first() {
            Some(p) if p.is(Tag::Array) => None,
            _ => Some(self.ids.node(Tag::Array, span, vec![])),
        };
        for part in parts {
            acc = Some(match acc {
                None => part,
                Some(prev) => self.ids.callm(span, prev, "+", vec![part]),
            });
        }
        acc.unwrap_or_else(|| self.ids.node(Tag::Array, span, vec![]))
    }

    fn array(&mut self, node: Node) -> Result<Sexp> {
        let items = self.exprs(&node.children)?;
        if items.iter().any(|i| i.is(Tag::Splat)) {
            return Ok(self.splat_array(items, node.span));
        }
        Ok(node.rebuild(items))
    }

    /// `{a: 1, **h}` → `{a: 1}.merge(h)`.
    fn hash(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let items = self.exprs(&node.children)?;
        if !items.iter().any(|i| i.is(Tag::DSplat)) {
            return Ok(node.rebuild(items));
        }
        let mut acc: Option<Sexp> = None;
        let mut run = Vec::new();
        for item in items {
            if let Sexp::Node(n) = &item {
                if n.tag == Tag::DSplat {
                    let base = match acc.take() {
                        Some(a) if run.is_empty() => a,
                        prev => {
                            let group = self.ids.node(Tag::Hash, span, std::mem::take(&mut run));
                            match prev {
                                Some(p) => self.ids.callm(span, p, "merge", vec![group]),
                                None => group,
                            }
                        }
                    };
                    acc = Some(self.ids.callm(n.span, base, "merge", vec![n.child(0).clone()]));
                    continue;
                }
            }
            run.push(item);
        }
        let mut out = acc.unwrap_or_else(|| self.ids.node(Tag::Hash, span, vec![]));
        if !run.is_empty() {
            let group = self.ids.node(Tag::Hash, span, run);
            out = self.ids.callm(span, out, "merge", vec![group]);
        }
        Ok(out)
    }

    // ── Control structures ──

    fn case(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let subject = match node.child(0) {
            Sexp::Nil => None,
            s => Some(self.expr(s.clone())?),
        };
        let tmp = temp(self.ids, "case");
        let n = node.children.len();
        let mut acc = match node.children.get(n.saturating_sub(1)) {
            Some(e) if n >= 2 && !e.is(Tag::When) => self.expr(e.clone())?,
            _ => nil(),
        };
        for when in node.children[1..].iter().rev().filter(|c| c.is(Tag::When)) {
            let Some(when) = when.as_node() else { continue };
            let mut cond: Option<Sexp> = None;
            for test in self.exprs(when.child(0).children())? {
                let s = span_of(&test, when.span);
                let check = match (&subject, test) {
                    (Some(_), Sexp::Node(t)) if t.tag == Tag::Splat => {
                        let list = t.child(0).clone();
                        self.ids.callm(s, list, "include?", vec![Sexp::name(tmp.as_str())])
                    }
                    (Some(_), test) => {
                        self.ids.callm(s, test, "===", vec![Sexp::name(tmp.as_str())])
                    }
                    (None, Sexp::Node(t)) if t.tag == Tag::Splat => {
                        let list = t.child(0).clone();
                        self.ids.callm(s, list, "any?", vec![])
                    }
                    (None, test) => test,
                };
                cond = Some(match cond {
                    None => check,
                    Some(prev) => self.ids.node(Tag::Or, s, vec![prev, check]),
                });
            }
            let body = self.expr(when.child(1).clone())?;
            acc = self.ids.if_(when.span, cond.unwrap_or_else(|| boolean(false)), body, acc);
        }
        match subject {
            Some(subject) => {
                let set = self.ids.set(span, Sexp::name(tmp.as_str()), subject);
                Ok(self.ids.seq(span, vec![set, acc]))
            }
            None => Ok(acc),
        }
    }

    /// `[:begin, body, :__excN, [:rescue, cond, body]..., else, ensure]`,
    /// where each `cond` tests `__excN` against the listed classes.
    fn begin(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let n = node.children.len();
        if n < 3 {
            return map_children(node, |c| self.expr(c));
        }
        let exc = temp(self.ids, "exc");
        let e = || Sexp::name(exc.as_str());
        let body = self.expr(node.child(0).clone())?;
        let mut children = vec![body, e()];
        for clause in &node.children[1..n - 2] {
            let Some(clause) = clause.as_node() else { continue };
            let s = clause.span;
            let classes = self.exprs(clause.child(0).children())?;
            let classes = if classes.is_empty() {
                vec![Sexp::name("StandardError")]
            } else {
                classes
            };
            let mut cond: Option<Sexp> = None;
            for class in classes {
                let check = match class {
                    Sexp::Node(c) if c.tag == Tag::Splat => {
                        let list = c.child(0).clone();
                        let class_of = self.ids.callm(s, e(), "class", vec![]);
                        self.ids.callm(s, list, "include?", vec![class_of])
                    }
                    class => self.ids.callm(s, e(), "is_a?", vec![class]),
                };
                cond = Some(match cond {
                    None => check,
                    Some(prev) => self.ids.node(Tag::Or, s, vec![prev, check]),
                });
            }
            let mut stmts = Vec::new();
            let target = clause.child(1).clone();
            if !target.is_nil() {
                let target = self.expr(target)?;
                stmts.push(self.ids.set(s, target, e()));
            }
            stmts.push(self.expr(clause.child(2).clone())?);
            let body = self.ids.seq(s, stmts);
            children.push(self.ids.node(
                Tag::Rescue,
                s,
                vec![cond.unwrap_or_else(|| boolean(true)), body],
            ));
        }
        children.push(self.expr(node.child(n - 2).clone())?);
        children.push(self.expr(node.child(n - 1).clone())?);
        Ok(self.ids.node(Tag::Begin, span, children))
    }

    fn defined(&mut self, node: Node) -> Result<Sexp> {
        let span = node.span;
        let described = |s: &str| Sexp::Str(s.as_bytes().to_vec());
        let value = node.child(0).clone();
        Ok(match &value {
            Sexp::Name(n) if n == "self" => described("self"),
            Sexp::Name(n) if matches!(n.as_str(), "nil" | "true" | "false") => described("expression"),
            Sexp::Name(n) if is_local_name(n) => described("local-variable"),
            Sexp::Name(n) if is_constant_name(n) => Sexp::Node(node),
            Sexp::Name(n) => {
                let kind = if n.starts_with("@@") {
                    "class variable"
                } else if n.starts_with('@') {
                    "instance-variable"
                } else {
                    "global-variable"
                };
                let read = Sexp::name(n.as_str());
                self.ids.if_(span, read, described(kind), nil())
            }
            Sexp::Node(v) => match v.tag {
                Tag::Colon2 | Tag::Colon3 => Sexp::Node(node),
                Tag::Call if v.child(1).children().is_empty() => {
                    let name = Sexp::Sym(v.child(0).as_name().unwrap_or_default().to_string());
                    let test = self.ids.callm(
                        span,
                        Sexp::name("self"),
                        "respond_to?",
                        vec![name, boolean(true)],
                    );
                    self.ids.if_(span, test, described("method"), nil())
                }
                Tag::Callm => {
                    let recv = self.expr(v.child(0).clone())?;
                    let name = Sexp::Sym(v.child(1).as_name().unwrap_or_default().to_string());
                    let test = self.ids.callm(span, recv, "respond_to?", vec![name]);
                    self.ids.if_(span, test, described("method"), nil())
                }
                Tag::Yield => {
                    let test = self.ids.call(span, "block_given?", vec![]);
                    self.ids.if_(span, test, described("yield"), nil())
                }
                Tag::Super | Tag::ZSuper => described("super"),
                Tag::Assign | Tag::OpAssign | Tag::MAsgn => described("assignment"),
                _ => described("expression"),
            },
            _ => described("expression"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::sugared;

    // ── Structure ──

    #[test]
    fn for_binds_in_enclosing_scope() {
        let t = sugared("for i in [1, 2]\n  puts i\nend");
        assert!(t.contains("[:assign, :i, :i]"), "{t}");
        assert!(t.contains(":each, [:args], [:lambda, [:args, :__for"), "{t}");
    }

    #[test]
    fn masgn_uses_indexed_reads() {
        let t = sugared("a, b = b, a");
        assert!(t.contains("[:assign, :a, [:callm, :__masgn"), "{t}");
        assert!(t.contains(":\"[]\", [:args, 1], nil]"), "{t}");
    }

    #[test]
    fn masgn_splat_takes_a_range() {
        let t = sugared("a, *b, c = list");
        assert!(t.contains("[:callm, :Range, :new, [:args, 1, -2, :false], nil]"), "{t}");
        assert!(t.contains("[:args, -1]"), "{t}");
    }

    #[test]
    fn nested_masgn_unpacks_the_element() {
        let t = sugared("a, (b, c) = 1, [2, 3]");
        assert!(t.contains("[:assign, :a, [:callm, :__masgn"), "{t}");
        assert!(t.contains("[:assign, :b, [:callm, :__masgn"), "{t}");
        assert!(t.contains("[:assign, :c, [:callm, :__masgn"), "{t}");
        assert_eq!(t.matches(":is_a?").count(), 1, "{t}");
        assert!(!t.contains("destruct"), "{t}");
    }

    #[test]
    fn block_with_two_params_splats() {
        let t = sugared("h.each { |k, v| p k }");
        assert!(t.contains("[:lambda, [:args, [:rest, :__blk"), "{t}");
        assert!(t.contains(":is_a?, [:args, :Array]"), "{t}");
    }

    #[test]
    fn lambda_literal_is_strict() {
        let t = sugared("f = ->(a, b) { a }");
        assert!(t.contains("[:lambda, [:args, :a, :b]"), "{t}");
    }

    #[test]
    fn interpolation_concatenates() {
        let t = sugared("x = 1\n\"a#{x}b\"");
        assert!(
            t.contains("[:callm, [:callm, \"a\", :\"+\", [:args, [:callm, :x, :to_s, [:args], nil]], nil], :\"+\", [:args, \"b\"], nil]"),
            "{t}"
        );
    }

    #[test]
    fn ranges_become_constructor_calls() {
        let t = sugared("x = 1...3");
        assert!(t.contains("[:callm, :Range, :new, [:args, 1, 3, :true], nil]"), "{t}");
    }

    // ── Sugar ──

    #[test]
    fn op_assign_on_local() {
        assert_eq!(sugared("x = 1\nx += 2"), "[:do, [:assign, :x, 1], [:assign, :x, [:callm, :x, :\"+\", [:args, 2], nil]]]");
    }

    #[test]
    fn or_assign_short_circuits() {
        let t = sugared("@a ||= []");
        assert_eq!(t, "[:do, [:or, :@a, [:assign, :@a, [:array]]]]");
    }

    #[test]
    fn index_op_assign_evaluates_once() {
        let t = sugared("h[k] += 1");
        assert!(t.contains("[:assign, :__recv"), "{t}");
        assert!(t.contains(":\"[]=\""), "{t}");
    }

    #[test]
    fn op_assign_through_safe_chain_stays_inside_it() {
        let t = sugared("o = nil\no&.a.b += 1");
        assert!(t.contains("[:safechain, [:do, [:assign, :__recv"), "{t}");
        assert!(t.contains("[:safecallm, :o, :a, [:args], nil]]"), "{t}");
        assert!(t.contains(":b=, [:args, [:callm, [:callm, :__recv"), "{t}");
    }

    #[test]
    fn not_equal_is_negated_equality() {
        let t = sugared("a = 1\na != 2");
        assert!(t.contains("[:not, [:callm, :a, :\"==\", [:args, 2], nil]]"), "{t}");
    }

    #[test]
    fn unless_with_not_swaps_branches() {
        let t = sugared("x = 1\nif !x then 1 else 2 end");
        assert!(t.contains("[:if, :x, 2, 1]"), "{t}");
    }

    #[test]
    fn attr_accessor_defines_methods() {
        let t = sugared("class A\n  attr_accessor :n\nend");
        assert!(t.contains("[:defm, :n, [:args], :@n]"), "{t}");
        assert!(t.contains("[:defm, :n=, [:args, :value], [:assign, :@n, :value]]"), "{t}");
    }

    #[test]
    fn defaults_test_numargs() {
        let t = sugared("def f(a, b = 2)\n  b\nend");
        assert!(
            t.contains("[:if, [:callm, [:numargs], :\"<\", [:args, 4], nil], [:assign, :b, 2], :nil]"),
            "{t}"
        );
    }

    #[test]
    fn block_defaults_count_the_environment() {
        let t = sugared("f = lambda { |a = 1| a }");
        assert!(t.contains("[:callm, [:numargs], :\"<\", [:args, 4], nil]"), "{t}");
    }

    #[test]
    fn keyword_arguments_become_a_hash_parameter() {
        let t = sugared("def f(a, b: 2)\n  b\nend");
        assert!(t.contains("[:defm, :f, [:args, :a, :__kwargs"), "{t}");
        assert!(t.contains("[:callm, :b, :nil?, [:args], nil]"), "{t}");
    }

    #[test]
    fn symbol_block_pass_becomes_lambda() {
        let t = sugared("[1].map(&:to_s)");
        assert!(t.contains("[:lambda, [:args, :__bp"), "{t}");
    }

    #[test]
    fn splat_arguments_form_one_array() {
        let t = sugared("x = [1]\nfoo(1, *x)");
        assert!(
            t.contains("[:args, [:splat, [:callm, [:array, 1], :\"+\", [:args, [:callm, :x, :to_a, [:args], nil]], nil]]]"),
            "{t}"
        );
    }

    #[test]
    fn private_def_is_unwrapped() {
        let t = sugared("class A\n  private def x\n    1\n  end\nend");
        assert!(t.contains("[:defm, :x, [:args], 1]"), "{t}");
        assert!(!t.contains("private"), "{t}");
    }

    #[test]
    fn case_compares_with_triple_equals() {
        let t = sugared("case 5\nwhen 1, 2 then :a\nelse :b\nend");
        assert!(t.contains("[:callm, 1, :\"===\", [:args, :__case"), "{t}");
        assert!(t.contains("[:or, "), "{t}");
        assert!(t.contains("[:sym, :b]"), "{t}");
    }

    #[test]
    fn rescue_defaults_to_standard_error() {
        let t = sugared("begin\n  x\nrescue => e\n  e\nend");
        assert!(t.contains(":is_a?, [:args, :StandardError]"), "{t}");
        assert!(t.contains("[:assign, :e, :__exc"), "{t}");
    }

    #[test]
    fn defined_local_is_static() {
        let t = sugared("x = 1\ndefined?(x)");
        assert!(t.ends_with("\"local-variable\"]"), "{t}");
    }
}
