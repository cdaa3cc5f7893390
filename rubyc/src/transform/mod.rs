/// Tree rewriting between the parser and the emitter.
///
/// ```text
///   parsed unit ─▶ desugar (structure) ─▶ fold ─▶ desugar (sugar) ─▶ yields
///                                                                      │
///        every unit of the session ◀──────────────────────────────────┘
///                    │
///                    ▼
///            classes (collect all, then resolve) ─▶ env (per unit) ─▶ functions
/// ```
///
/// Passes consume a tree and build a new one. The only pass allowed to
/// introduce variable bindings after the environment builder has run is
/// none: the emitter rejects any name it was not told about.
pub mod classes;
pub mod desugar;
pub mod env;
pub mod fold;
pub mod yields;

use std::collections::BTreeMap;

use parser::{Node, NodeIds, Sexp, Span, Tag};

use crate::classes::ClassRegistry;
use crate::error::Result;
use crate::mangle::SymbolRegistry;

// ═══════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Top level of a unit, run once with `self` = main object.
    Main,
    Method,
    /// Class or module body, run once with `self` = the class.
    ClassBody,
    /// Block or lambda: `(self, block, env, args...)`.
    Block,
}

/// A lifted function, ready for the emitter.
#[derive(Debug, Clone)]
pub struct Function {
    pub label: String,
    pub kind: FunctionKind,
    /// Name of the block parameter (argument word 1).
    pub block_param: String,
    /// User parameters, in argument order.
    pub params: Vec<String>,
    pub rest: Option<String>,
    /// Stack-resident locals that are not parameters.
    pub locals: Vec<String>,
    /// Variables living in this function's heap frame, slot 2 onwards.
    /// `None` when the function allocates no frame.
    pub env: Option<Vec<String>>,
    pub body: Sexp,
    pub span: Span,
}

impl Function {
    /// Argument word of the first user parameter.
    pub fn first_param_word(&self) -> usize {
        match self.kind {
            FunctionKind::Block => 3,
            _ => 2,
        }
    }

    pub fn env_slot(&self, name: &str) -> Option<usize> {
        self.env.as_ref()?.iter().position(|v| v == name).map(|i| i + 2)
    }
}

/// What a static data word holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticKind {
    Global,
    Constant,
    ClassVariable,
    ClassInstanceVariable,
}

/// Everything the emitter needs for one session.
#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
    /// Main function of each unit, in execution order.
    pub units: Vec<String>,
    pub classes: ClassRegistry,
    /// Static words by label, all initialised to nil.
    pub statics: BTreeMap<String, StaticKind>,
    /// Number of class definition sites, each guarded by a once flag.
    pub class_sites: usize,
}

/// A parsed unit entering the pipeline.
#[derive(Debug)]
pub struct SourceTree {
    pub name: String,
    pub body: Sexp,
    pub ids: NodeIds,
}

#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    pub fold: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self { fold: true }
    }
}

/// Run every pass over the units of one session.
pub fn transform(
    units: Vec<SourceTree>,
    options: TransformOptions,
    symbols: &mut SymbolRegistry,
) -> Result<Program> {
    let mut sugared = Vec::with_capacity(units.len());
    for mut unit in units {
        log::debug!("desugar {}", unit.name);
        let body = desugar::structure(unit.body, &mut unit.ids)?;
        let body = if options.fold { fold::fold(body) } else { body };
        let body = desugar::sugar(body, &mut unit.ids)?;
        let body = yields::rewrite(body, &mut unit.ids)?;
        sugared.push(SourceTree { body, ..unit });
    }

    log::debug!("resolving classes over {} unit(s)", sugared.len());
    let mut resolver = classes::Resolver::new(symbols);
    for unit in &sugared {
        resolver.collect(&unit.body)?;
    }
    resolver.finish_collect();
    let mut resolved = Vec::with_capacity(sugared.len());
    for mut unit in sugared {
        let body = resolver.resolve(unit.body, &mut unit.ids)?;
        resolved.push(SourceTree { body, ..unit });
    }
    let (mut classes, statics, class_sites) = resolver.into_parts();

    let mut functions = Vec::new();
    let mut units = Vec::new();
    for (k, mut unit) in resolved.into_iter().enumerate() {
        let label = format!("__unit_{k}");
        log::debug!("building environments for {} ({label})", unit.name);
        let lifted = env::build(unit.body, &mut unit.ids, &label)?;
        units.push(label);
        functions.extend(lifted);
    }

    for f in &functions {
        allocate_sent_names(&f.body, &mut classes);
    }

    Ok(Program {
        functions,
        units,
        classes,
        statics,
        class_sites,
    })
}

/// Give every name sent anywhere a vtable slot, so each call site has an
/// offset to dispatch through.
fn allocate_sent_names(body: &Sexp, classes: &mut ClassRegistry) {
    body.walk(&mut |e| {
        let Some(node) = e.as_node() else {
            return;
        };
        let at = match node.tag {
            Tag::Call => 0,
            Tag::Callm | Tag::SafeCallm => 1,
            _ => return,
        };
        if let Some(name) = node.child(at).as_name() {
            classes.offsets.alloc(name);
        }
    });
}

/// `[:defun, :label, [:args, ...], body]` per function, for
/// `--dump-transformed`.
pub fn dump(program: &Program) -> String {
    let mut out = String::new();
    for f in &program.functions {
        let mut args = vec![":self".to_string(), format!(":{}", f.block_param)];
        if f.kind == FunctionKind::Block {
            args.push(":__penv__".into());
        }
        args.extend(f.params.iter().map(|p| format!(":{p}")));
        if let Some(r) = &f.rest {
            args.push(format!("[:rest, :{r}]"));
        }
        out.push_str(&format!(
            "[:defun, :{}, [:args, {}], {}]\n",
            f.label,
            args.join(", "),
            f.body
        ));
    }
    out
}

// ═══════════════════════════════════════════════════════════════════
// Tree helpers
// ═══════════════════════════════════════════════════════════════════

/// Constructors for the node shapes the passes build.
pub(crate) trait Build {
    fn args(&mut self, span: Span, args: Vec<Sexp>) -> Sexp;
    fn call(&mut self, span: Span, name: &str, args: Vec<Sexp>) -> Sexp;
    fn callm(&mut self, span: Span, recv: Sexp, name: &str, args: Vec<Sexp>) -> Sexp;
    fn seq(&mut self, span: Span, stmts: Vec<Sexp>) -> Sexp;
    fn if_(&mut self, span: Span, cond: Sexp, then: Sexp, otherwise: Sexp) -> Sexp;
    fn set(&mut self, span: Span, target: Sexp, value: Sexp) -> Sexp;
}

impl Build for NodeIds {
    fn args(&mut self, span: Span, args: Vec<Sexp>) -> Sexp {
        self.node(Tag::Args, span, args)
    }

    fn call(&mut self, span: Span, name: &str, args: Vec<Sexp>) -> Sexp {
        let args = self.args(span, args);
        self.node(Tag::Call, span, vec![Sexp::name(name), args, Sexp::Nil])
    }

    fn callm(&mut self, span: Span, recv: Sexp, name: &str, args: Vec<Sexp>) -> Sexp {
        let args = self.args(span, args);
        self.node(Tag::Callm, span, vec![recv, Sexp::name(name), args, Sexp::Nil])
    }

    fn seq(&mut self, span: Span, stmts: Vec<Sexp>) -> Sexp {
        self.node(Tag::Do, span, stmts)
    }

    fn if_(&mut self, span: Span, cond: Sexp, then: Sexp, otherwise: Sexp) -> Sexp {
        self.node(Tag::If, span, vec![cond, then, otherwise])
    }

    fn set(&mut self, span: Span, target: Sexp, value: Sexp) -> Sexp {
        self.assign(target, value, span)
    }
}

/// Rebuild `node` with every child passed through `f`.
pub(crate) fn map_children(
    node: Node,
    mut f: impl FnMut(Sexp) -> Result<Sexp>,
) -> Result<Sexp> {
    let Node {
        tag,
        children,
        span,
        id,
    } = node;
    let children = children.into_iter().map(&mut f).collect::<Result<Vec<_>>>()?;
    Ok(Sexp::Node(Node {
        tag,
        children,
        span,
        id,
    }))
}

pub(crate) fn nil() -> Sexp {
    Sexp::name("nil")
}

pub(crate) fn boolean(b: bool) -> Sexp {
    Sexp::name(if b { "true" } else { "false" })
}

/// `nil`, `true`, `false`, `self`.
pub(crate) fn is_pseudo_variable(name: &str) -> bool {
    matches!(name, "nil" | "true" | "false" | "self")
}

pub(crate) fn is_local_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') && !is_pseudo_variable(name)
}

pub(crate) fn is_constant_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_uppercase())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Parse and desugar `src`, returning the tree text.
    pub fn sugared(src: &str) -> String {
        let mut program = parser::parse(src).unwrap_or_else(|e| panic!("{src:?}: {e}"));
        let body = desugar::structure(program.body, &mut program.ids)
            .and_then(|b| desugar::sugar(fold::fold(b), &mut program.ids))
            .and_then(|b| yields::rewrite(b, &mut program.ids))
            .unwrap_or_else(|e| panic!("{src:?}: {e}"));
        body.to_string()
    }

    /// The whole pipeline over one unit.
    pub fn program(src: &str) -> Result<Program> {
        let program = parser::parse(src).unwrap_or_else(|e| panic!("{src:?}: {e}"));
        let unit = SourceTree {
            name: "test.rb".into(),
            body: program.body,
            ids: program.ids,
        };
        let mut symbols = SymbolRegistry::new();
        transform(vec![unit], TransformOptions::default(), &mut symbols)
    }

    pub fn function<'a>(program: &'a Program, label: &str) -> &'a Function {
        program
            .functions
            .iter()
            .find(|f| f.label == label)
            .unwrap_or_else(|| panic!("no function {label}"))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn dump_lists_every_function() {
        let p = program("def foo(a)\n  a\nend\nfoo(1)").unwrap_or_else(|e| panic!("{e}"));
        let text = dump(&p);
        assert!(text.contains("[:defun, :__unit_0, [:args, :self, :__closure__]"), "{text}");
        assert!(
            text.contains("[:defun, :__method_Object_foo, [:args, :self, :__closure__, :a]"),
            "{text}"
        );
    }

    #[test]
    fn units_run_in_order() {
        let mut symbols = SymbolRegistry::new();
        let units = ["X = 1", "puts X"]
            .iter()
            .enumerate()
            .map(|(i, src)| {
                let p = parser::parse(src).unwrap_or_else(|e| panic!("{e}"));
                SourceTree {
                    name: format!("u{i}.rb"),
                    body: p.body,
                    ids: p.ids,
                }
            })
            .collect();
        let p = transform(units, TransformOptions::default(), &mut symbols)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(p.units, vec!["__unit_0", "__unit_1"]);
        assert!(p.statics.contains_key("__const__X"));
    }
}
