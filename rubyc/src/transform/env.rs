/// Closure environments and function lifting.
///
/// Every method, class body, block and the unit's top level becomes a
/// [`Function`]. Variables declared in one scope and referenced from a
/// nested block are promoted into a heap frame owned by the declaring
/// scope:
///
/// ```text
///   frame   ┌────────────┐
///   slot 0  │ parent env │──▶ frame of the scope that created this block
///   slot 1  │ %ebp       │    defining stack frame, for return/break
///   slot 2… │ variables  │
///           └────────────┘
/// ```
///
/// Within the owning function the frame is `__env__`; a block reaches its
/// creator's frames through `__penv__` and each frame's slot 0. A block
/// literal becomes `[:proc_new, :label, env, break_id]`.
///
/// Declarations are whole-scope: a name assigned anywhere in a method is
/// that method's variable, and a block assigning a name its enclosing
/// scopes already declare shares theirs.
use parser::{NodeIds, Sexp, Span, Tag};

use super::yields::{LAMBDA_BLOCK, METHOD_BLOCK, block_param};
use super::{Function, FunctionKind, is_local_name, nil};
use crate::error::{CompileError, Result};

pub const ENV: &str = "__env__";
pub const PARENT_ENV: &str = "__penv__";

/// Lift `body`, the resolved tree of one unit, into functions. The unit's
/// own top level is labelled `unit_label`.
pub fn build(body: Sexp, ids: &mut NodeIds, unit_label: &str) -> Result<Vec<Function>> {
    let mut analysis = Analysis {
        scopes: Vec::new(),
        stack: Vec::new(),
        unit: unit_label.to_string(),
        breaks: 0,
    };
    let main = analysis.open(
        FunctionKind::Main,
        unit_label.to_string(),
        None,
        &Sexp::Nil,
        false,
        body.span().unwrap_or_default(),
    );
    analysis.walk_scope(main, &body);
    analysis.declare();
    analysis.capture();
    log::trace!(
        "{unit_label}: {} scopes, {} with frames",
        analysis.scopes.len(),
        analysis.scopes.iter().filter(|s| s.frame).count()
    );

    let mut builder = Builder {
        a: &analysis,
        ids,
        next: 1,
        cur: main,
        loops: 0,
        lifted: Vec::new(),
    };
    builder.lift(main, body)?;
    let mut lifted = builder.lifted;
    lifted.sort_by_key(|(scope, _)| *scope);
    Ok(lifted.into_iter().map(|(_, f)| f).collect())
}

// ═══════════════════════════════════════════════════════════════════
// Analysis
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Scope {
    kind: FunctionKind,
    label: String,
    /// Creating scope, for blocks only.
    parent: Option<usize>,
    /// `lambda`/`->` semantics: `return` and `break` leave only the block.
    strict: bool,
    block_param: String,
    params: Vec<String>,
    rest: Option<String>,
    assigned: Vec<String>,
    refs: Vec<String>,
    declared: Vec<String>,
    captured: Vec<String>,
    frame: bool,
    break_id: Option<usize>,
    span: Span,
}

impl Scope {
    fn owns(&self, name: &str) -> bool {
        self.block_param == name
            || self.rest.as_deref() == Some(name)
            || self.params.iter().any(|p| p == name)
            || self.declared.iter().any(|d| d == name)
    }

    fn is_param(&self, name: &str) -> bool {
        self.block_param == name
            || self.rest.as_deref() == Some(name)
            || self.params.iter().any(|p| p == name)
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}

struct Walk {
    scope: usize,
    loops: usize,
}

struct Analysis {
    scopes: Vec<Scope>,
    stack: Vec<Walk>,
    unit: String,
    breaks: usize,
}

impl Analysis {
    fn open(
        &mut self,
        kind: FunctionKind,
        label: String,
        parent: Option<usize>,
        params: &Sexp,
        strict: bool,
        span: Span,
    ) -> usize {
        let implicit = match kind {
            FunctionKind::Block => LAMBDA_BLOCK,
            _ => METHOD_BLOCK,
        };
        let mut scope = Scope {
            kind,
            label,
            parent,
            strict,
            block_param: block_param(params).unwrap_or(implicit).to_string(),
            params: Vec::new(),
            rest: None,
            assigned: Vec::new(),
            refs: Vec::new(),
            declared: Vec::new(),
            captured: Vec::new(),
            frame: false,
            break_id: None,
            span,
        };
        for p in params.children() {
            match p {
                Sexp::Name(n) => scope.params.push(n.clone()),
                Sexp::Node(n) if n.tag == Tag::Rest => {
                    scope.rest = Some(n.child(0).as_name().unwrap_or("__rest").to_string());
                }
                _ => {}
            }
        }
        self.scopes.push(scope);
        self.scopes.len() - 1
    }

    fn current(&mut self) -> &mut Walk {
        let at = self.stack.len() - 1;
        &mut self.stack[at]
    }

    fn scope(&mut self) -> &mut Scope {
        let s = self.stack[self.stack.len() - 1].scope;
        &mut self.scopes[s]
    }

    /// Nearest enclosing non-block scope.
    fn method_of(&self, mut s: usize) -> usize {
        while let (FunctionKind::Block, Some(p)) = (self.scopes[s].kind, self.scopes[s].parent) {
            s = p;
        }
        s
    }

    fn walk_scope(&mut self, scope: usize, body: &Sexp) {
        self.stack.push(Walk { scope, loops: 0 });
        self.walk(body);
        self.stack.pop();
    }

    fn block(&mut self, lambda: &Sexp, strict: bool) {
        let Some(node) = lambda.as_node() else {
            return;
        };
        let parent = self.current().scope;
        let label = format!("{}_block_{}", self.unit, self.scopes.len());
        let s = self.open(FunctionKind::Block, label, Some(parent), node.child(0), strict, node.span);
        self.walk_scope(s, node.child(1));
    }

    fn walk_all(&mut self, items: &[Sexp]) {
        for item in items {
            self.walk(item);
        }
    }

    fn walk(&mut self, e: &Sexp) {
        let node = match e {
            Sexp::Name(n) if is_local_name(n) => {
                push_unique(&mut self.scope().refs, n);
                return;
            }
            Sexp::Node(n) => n,
            _ => return,
        };
        match node.tag {
            Tag::Assign => {
                if let Sexp::Name(n) = node.child(0) {
                    if is_local_name(n) {
                        push_unique(&mut self.scope().assigned, n);
                    }
                }
                self.walk_all(&node.children);
            }
            Tag::Begin => {
                if let Sexp::Name(n) = node.child(1) {
                    push_unique(&mut self.scope().assigned, n);
                }
                self.walk_all(&node.children);
            }
            Tag::While | Tag::DoWhile => {
                self.walk(node.child(0));
                self.current().loops += 1;
                self.walk(node.child(1));
                self.current().loops -= 1;
            }
            Tag::Lambda => self.block(e, true),
            Tag::Call | Tag::Callm | Tag::SafeCallm | Tag::Super => {
                let skip = if node.tag == Tag::Call || node.tag == Tag::Super { 0 } else { 1 };
                let last = node.children.len().saturating_sub(1);
                for (i, child) in node.children.iter().enumerate() {
                    if i == skip {
                        continue;
                    }
                    if i == last && child.is(Tag::Lambda) {
                        let strict = node.tag == Tag::Call && node.child(0).as_name() == Some("lambda");
                        self.block(child, strict);
                    } else {
                        self.walk(child);
                    }
                }
            }
            Tag::Defm => {
                let label = node.child(1).as_name().unwrap_or_default().to_string();
                let s = self.open(FunctionKind::Method, label, None, node.child(3), false, node.span);
                self.walk_scope(s, node.child(4));
            }
            Tag::Defs => {
                self.walk(node.child(0));
                let label = node.child(2).as_name().unwrap_or_default().to_string();
                let s = self.open(FunctionKind::Method, label, None, node.child(3), false, node.span);
                self.walk_scope(s, node.child(4));
            }
            Tag::Class => {
                let label = class_body_label(node.child(0), node.child(1));
                let s = self.open(FunctionKind::ClassBody, label, None, &Sexp::Nil, false, node.span);
                self.walk_scope(s, node.child(2));
            }
            Tag::SClass => {
                self.walk(node.child(0));
                let label = format!("{}_sclass_{}", self.unit, self.scopes.len());
                let s = self.open(FunctionKind::ClassBody, label, None, &Sexp::Nil, false, node.span);
                self.walk_scope(s, node.child(1));
            }
            Tag::Const => {}
            Tag::Return => {
                self.walk_all(&node.children);
                let s = self.current().scope;
                if self.scopes[s].kind == FunctionKind::Block && !self.scopes[s].strict {
                    let m = self.method_of(s);
                    self.scopes[m].frame = true;
                }
            }
            Tag::Break => {
                self.walk_all(&node.children);
                let Walk { scope: s, loops } = *self.current();
                let scope = &self.scopes[s];
                if loops == 0 && scope.kind == FunctionKind::Block && !scope.strict {
                    if scope.break_id.is_none() {
                        self.scopes[s].break_id = Some(self.breaks);
                        self.breaks += 1;
                    }
                    if let Some(p) = self.scopes[s].parent {
                        self.scopes[p].frame = true;
                    }
                }
            }
            _ => self.walk_all(&node.children),
        }
    }

    /// Fix each scope's own variables, outermost scopes first.
    fn declare(&mut self) {
        for s in 0..self.scopes.len() {
            let names: Vec<String> = self.scopes[s]
                .assigned
                .iter()
                .chain(self.scopes[s].refs.iter())
                .cloned()
                .collect();
            for name in names {
                if self.scopes[s].is_param(&name) || self.lookup(s, &name).is_some() {
                    continue;
                }
                push_unique(&mut self.scopes[s].declared, &name);
            }
        }
    }

    /// Scope declaring `name` as seen from `s`.
    fn lookup(&self, mut s: usize, name: &str) -> Option<usize> {
        loop {
            let scope = &self.scopes[s];
            if scope.owns(name) {
                return Some(s);
            }
            match (scope.kind, scope.parent) {
                (FunctionKind::Block, Some(p)) => s = p,
                _ => return None,
            }
        }
    }

    fn resolve(&self, s: usize, name: &str) -> usize {
        self.lookup(s, name).unwrap_or(s)
    }

    fn capture(&mut self) {
        for s in 0..self.scopes.len() {
            let refs = self.scopes[s].refs.clone();
            for name in refs {
                let d = self.resolve(s, &name);
                if d != s {
                    push_unique(&mut self.scopes[d].captured, &name);
                    self.scopes[d].frame = true;
                }
            }
        }
    }

    /// Scope whose frame `s` sees as its own environment.
    fn env_owner(&self, s: usize) -> Option<usize> {
        let scope = &self.scopes[s];
        if scope.frame {
            Some(s)
        } else if scope.kind == FunctionKind::Block {
            scope.parent.and_then(|p| self.env_owner(p))
        } else {
            None
        }
    }
}

fn class_body_label(class: &Sexp, site: &Sexp) -> String {
    let site = match site {
        Sexp::Int(n) => *n,
        _ => 0,
    };
    format!("__classbody_{}_{site}", class.as_name().unwrap_or_default())
}

// ═══════════════════════════════════════════════════════════════════
// Rewriting
// ═══════════════════════════════════════════════════════════════════

struct Builder<'a> {
    a: &'a Analysis,
    ids: &'a mut NodeIds,
    /// Next scope in walk order; matches the analysis walk.
    next: usize,
    cur: usize,
    loops: usize,
    lifted: Vec<(usize, Function)>,
}

impl Builder<'_> {
    fn lift(&mut self, scope: usize, body: Sexp) -> Result<()> {
        let saved = (self.cur, self.loops);
        self.cur = scope;
        self.loops = 0;
        let body = self.expr(body);
        (self.cur, self.loops) = saved;
        let body = body?;

        let s = &self.a.scopes[scope];
        let env = s.frame.then(|| s.captured.clone());
        let locals = s
            .declared
            .iter()
            .filter(|v| !s.captured.contains(v))
            .cloned()
            .collect();
        log::trace!("lifted {} ({:?}, env {:?})", s.label, s.kind, env);
        self.lifted.push((
            scope,
            Function {
                label: s.label.clone(),
                kind: s.kind,
                block_param: s.block_param.clone(),
                params: s.params.clone(),
                rest: s.rest.clone(),
                locals,
                env,
                body,
                span: s.span,
            },
        ));
        Ok(())
    }

    fn take_scope(&mut self) -> usize {
        let s = self.next;
        self.next += 1;
        s
    }

    fn index(&mut self, base: Sexp, slot: usize, span: Span) -> Sexp {
        self.ids.node(Tag::Index, span, vec![base, Sexp::Int(slot as i64)])
    }

    /// Path from the current function to the frame of `to`.
    fn chain(&mut self, to: usize, span: Span) -> Result<Sexp> {
        let scopes = &self.a.scopes;
        let from = self.cur;
        let (mut expr, mut owner) = if scopes[from].frame {
            (Sexp::name(ENV), Some(from))
        } else {
            let up = scopes[from].parent.and_then(|p| self.a.env_owner(p));
            (Sexp::name(PARENT_ENV), up)
        };
        while owner != Some(to) {
            let Some(o) = owner else {
                return Err(CompileError::transform(
                    format!(
                        "no environment path from {} to {}",
                        scopes[from].label, scopes[to].label
                    ),
                    Some(span),
                ));
            };
            expr = self.index(expr, 0, span);
            owner = match scopes[o].kind {
                FunctionKind::Block => scopes[o].parent.and_then(|p| self.a.env_owner(p)),
                _ => None,
            };
        }
        Ok(expr)
    }

    /// Environment handed to blocks created by the current function.
    fn env_here(&self) -> Sexp {
        let s = &self.a.scopes[self.cur];
        if s.frame {
            Sexp::name(ENV)
        } else if s.kind == FunctionKind::Block {
            Sexp::name(PARENT_ENV)
        } else {
            nil()
        }
    }

    fn var(&mut self, name: String, span: Span) -> Result<Sexp> {
        let d = self.a.resolve(self.cur, &name);
        match self.a.scopes[d].captured.iter().position(|v| *v == name) {
            Some(i) => {
                let base = self.chain(d, span)?;
                Ok(self.index(base, i + 2, span))
            }
            None => Ok(Sexp::Name(name)),
        }
    }

    fn exprs(&mut self, items: Vec<Sexp>, span: Span) -> Result<Vec<Sexp>> {
        items.into_iter().map(|c| self.child(c, span)).collect()
    }

    fn child(&mut self, e: Sexp, span: Span) -> Result<Sexp> {
        match e {
            Sexp::Name(n) if is_local_name(&n) => self.var(n, span),
            other => self.expr(other),
        }
    }

    fn block(&mut self, lambda: Sexp) -> Result<Sexp> {
        let Sexp::Node(node) = lambda else {
            return Ok(lambda);
        };
        let s = self.take_scope();
        let body = node.child(1).clone();
        let env = self.env_here();
        self.lift(s, body)?;
        let scope = &self.a.scopes[s];
        let id = scope.break_id.map_or(-1, |b| b as i64);
        Ok(self.ids.node(
            Tag::ProcNew,
            node.span,
            vec![Sexp::name(scope.label.as_str()), env, Sexp::Int(id)],
        ))
    }

    fn expr(&mut self, e: Sexp) -> Result<Sexp> {
        let node = match e {
            Sexp::Name(n) if is_local_name(&n) => return self.var(n, Span::default()),
            Sexp::Node(n) => n,
            other => return Ok(other),
        };
        let span = node.span;
        match node.tag {
            Tag::While | Tag::DoWhile => {
                let cond = self.child(node.child(0).clone(), span)?;
                self.loops += 1;
                let body = self.child(node.child(1).clone(), span);
                self.loops -= 1;
                Ok(node.rebuild(vec![cond, body?]))
            }
            Tag::Lambda => self.block(Sexp::Node(node)),
            Tag::Call | Tag::Callm | Tag::SafeCallm | Tag::Super => {
                let skip = if node.tag == Tag::Call || node.tag == Tag::Super { 0 } else { 1 };
                let last = node.children.len().saturating_sub(1);
                let mut children = Vec::with_capacity(node.children.len());
                for (i, child) in node.children.iter().cloned().enumerate() {
                    children.push(if i == skip {
                        child
                    } else if i == last && child.is(Tag::Lambda) {
                        self.block(child)?
                    } else {
                        self.child(child, span)?
                    });
                }
                Ok(node.rebuild(children))
            }
            Tag::Defm => {
                let s = self.take_scope();
                self.lift(s, node.child(4).clone())?;
                Ok(self.ids.node(Tag::Defm, span, node.children[..3].to_vec()))
            }
            Tag::Defs => {
                let recv = self.child(node.child(0).clone(), span)?;
                let s = self.take_scope();
                self.lift(s, node.child(4).clone())?;
                Ok(self.ids.node(
                    Tag::Defs,
                    span,
                    vec![recv, node.child(1).clone(), node.child(2).clone()],
                ))
            }
            Tag::Class => {
                let s = self.take_scope();
                self.lift(s, node.child(2).clone())?;
                let body = Sexp::name(self.a.scopes[s].label.as_str());
                Ok(self.ids.node(
                    Tag::Class,
                    span,
                    vec![node.child(0).clone(), body, node.child(1).clone()],
                ))
            }
            Tag::SClass => {
                let object = self.child(node.child(0).clone(), span)?;
                let s = self.take_scope();
                self.lift(s, node.child(1).clone())?;
                let body = Sexp::name(self.a.scopes[s].label.as_str());
                Ok(self.ids.node(Tag::SClass, span, vec![object, body]))
            }
            Tag::Const => Ok(Sexp::Node(node)),
            Tag::Return => {
                let value = self.child(node.child(0).clone(), span)?;
                let scope = &self.a.scopes[self.cur];
                if scope.kind == FunctionKind::Block && !scope.strict {
                    let method = self.a.method_of(self.cur);
                    let frame = self.chain(method, span)?;
                    return Ok(node.rebuild(vec![value, frame]));
                }
                Ok(node.rebuild(vec![value]))
            }
            Tag::Break => {
                let value = self.child(node.child(0).clone(), span)?;
                let scope = &self.a.scopes[self.cur];
                if self.loops > 0 || scope.kind != FunctionKind::Block {
                    return Ok(node.rebuild(vec![value]));
                }
                if scope.strict {
                    return Ok(self.ids.node(Tag::Return, span, vec![value]));
                }
                let (Some(parent), Some(id)) = (scope.parent, scope.break_id) else {
                    return Err(CompileError::transform("break target not found", Some(span)));
                };
                let frame = self.chain(parent, span)?;
                Ok(node.rebuild(vec![value, frame, Sexp::Int(id as i64)]))
            }
            Tag::Next => {
                let value = self.child(node.child(0).clone(), span)?;
                if self.loops == 0 && self.a.scopes[self.cur].kind == FunctionKind::Block {
                    return Ok(self.ids.node(Tag::Return, span, vec![value]));
                }
                Ok(node.rebuild(vec![value]))
            }
            _ => {
                let children = self.exprs(node.children.clone(), span)?;
                Ok(node.rebuild(children))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{function, program};
    use super::super::Program;
    use super::*;

    fn compiled(src: &str) -> Program {
        program(src).unwrap_or_else(|e| panic!("{src:?}: {e}"))
    }

    fn body(p: &Program, label: &str) -> String {
        function(p, label).body.to_string()
    }

    // ── Captures ──

    #[test]
    fn uncaptured_variables_stay_local() {
        let p = compiled("a = 1\nb = a + 1");
        let main = function(&p, "__unit_0");
        assert_eq!(main.env, None);
        assert_eq!(main.locals, vec!["a", "b"]);
    }

    #[test]
    fn nested_block_capture_shares_slots() {
        let src = "\
pivot = 10
list = [1, 20, 3]
small = list.select { |x| x < pivot }
count = 0
list.each { |x| [x].each { |y| count += y + x } }
count";
        let p = compiled(src);
        let main = function(&p, "__unit_0");
        assert_eq!(main.env, Some(vec!["pivot".to_string(), "count".to_string()]));
        assert!(!main.locals.contains(&"count".to_string()));
        assert!(body(&p, "__unit_0").contains("[:assign, [:index, :__env__, 2], 10]"));

        let select = body(&p, "__unit_0_block_1");
        assert!(select.contains("[:index, :__penv__, 2]"), "{select}");

        let outer = function(&p, "__unit_0_block_2");
        assert_eq!(outer.env, Some(vec!["x".to_string()]));
        let inner = body(&p, "__unit_0_block_3");
        assert!(inner.contains("[:index, [:index, :__penv__, 0], 3]"), "{inner}");
        assert!(inner.contains("[:index, :__penv__, 2]"), "{inner}");
    }

    #[test]
    fn self_referential_lambda_lives_in_the_frame() {
        let p = compiled("fact = lambda { |n| n <= 1 ? 1 : n * fact.call(n - 1) }\nfact.call(5)");
        let main = function(&p, "__unit_0");
        assert_eq!(main.env, Some(vec!["fact".to_string()]));
        let text = body(&p, "__unit_0");
        assert!(
            text.contains("[:assign, [:index, :__env__, 2], [:call, :lambda, [:args], [:proc_new, :__unit_0_block_1, :__env__, -1]]]"),
            "{text}"
        );
        let block = function(&p, "__unit_0_block_1");
        assert_eq!(block.params, vec!["n"]);
        assert!(block.body.to_string().contains("[:callm, [:index, :__penv__, 2], :call"));
    }

    #[test]
    fn yield_in_nested_block_captures_method_block() {
        let p = compiled("def twice\n  [1].each { |x| yield x }\nend");
        let m = function(&p, "__method_Object_twice");
        assert_eq!(m.env, Some(vec!["__closure__".to_string()]));
    }

    // ── Lifting ──

    #[test]
    fn definitions_are_lifted() {
        let p = compiled("def foo(a, *rest, &blk)\n  a\nend");
        assert!(body(&p, "__unit_0").contains("[:defm, :foo, :__method_Object_foo, :static]"));
        let f = function(&p, "__method_Object_foo");
        assert_eq!(f.kind, FunctionKind::Method);
        assert_eq!(f.params, vec!["a"]);
        assert_eq!(f.rest.as_deref(), Some("rest"));
        assert_eq!(f.block_param, "blk");
    }

    #[test]
    fn class_bodies_are_lifted() {
        let p = compiled("class Foo\n  X = 1\nend");
        assert!(body(&p, "__unit_0").contains("[:class, :Foo, :__classbody_Foo_0, 0]"));
        assert_eq!(function(&p, "__classbody_Foo_0").kind, FunctionKind::ClassBody);
    }

    // ── Non-local exits ──

    #[test]
    fn return_from_block_goes_through_method_frame() {
        let p = compiled("def find(xs)\n  xs.each { |x| return x if x > 1 }\n  nil\nend");
        assert_eq!(function(&p, "__method_Object_find").env, Some(vec![]));
        let block = body(&p, "__unit_0_block_2");
        assert!(block.contains("[:return, :x, :__penv__]"), "{block}");
    }

    #[test]
    fn break_from_block_targets_the_call_site() {
        let p = compiled("r = [1, 2].each { |x| break x }");
        let main = body(&p, "__unit_0");
        assert!(main.contains("[:proc_new, :__unit_0_block_1, :__env__, 0]"), "{main}");
        let block = body(&p, "__unit_0_block_1");
        assert!(block.contains("[:break, :x, :__penv__, 0]"), "{block}");
    }

    #[test]
    fn next_in_block_returns_locally() {
        let p = compiled("[1].each { |x| next x }");
        let block = body(&p, "__unit_0_block_1");
        assert!(block.contains("[:return, :x]"), "{block}");
    }

    #[test]
    fn loop_break_stays_local() {
        let p = compiled("[1].each { |x| while true\n break\n end }");
        let block = body(&p, "__unit_0_block_1");
        assert!(block.contains("[:break, nil]"), "{block}");
    }

    #[test]
    fn lambda_return_is_local() {
        let p = compiled("f = -> { return 1 }");
        let block = body(&p, "__unit_0_block_1");
        assert!(block.contains("[:return, 1]"), "{block}");
        assert_eq!(function(&p, "__unit_0").env, None);
    }
}
