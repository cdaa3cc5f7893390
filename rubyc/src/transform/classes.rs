/// Class, module and constant resolution.
///
/// Runs in two phases over every unit of the session. [`Resolver::collect`]
/// walks each tree once and fills the class registry: classes and
/// modules (qualified by their lexical nesting), methods, aliases,
/// includes, instance variables, constants, globals and class
/// variables. Once every unit has been seen, instance layouts are fixed
/// and [`Resolver::resolve`] rewrites each tree into storage forms:
///
/// | Source          | Rewritten                                    |
/// |-----------------|----------------------------------------------|
/// | `Foo`           | `[:const, :Foo, :class]` (class object)      |
/// | `X`             | `[:const, :__const__A__X, :value]`           |
/// | `$x` `@@x`      | `[:const, <static word>, :value]`            |
/// | `@x`            | `[:index, :self, k]`, a static word, or a    |
/// |                 | runtime `instance_variable_get`              |
/// | `class A ... end` | `[:class, :A, site, body]`                 |
/// | `def m`         | `[:defm, :m, :label, :static, args, body]`   |
/// | `super`         | `[:super, :target_label, args, block]`       |
///
/// Constants resolve lexically (innermost enclosing class outwards), then
/// through the superclass chain of the innermost class, then at top
/// level. Every label handed out is registered with the session's
/// [`SymbolRegistry`], which rejects two entities sharing one label.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use parser::{Node, NodeId, NodeIds, Sexp, Span, Tag};

use super::yields::METHOD_BLOCK;
use super::{Build, StaticKind, is_constant_name, nil};
use crate::classes::{ClassId, ClassKind, ClassRegistry, method_label, missing_thunk};
use crate::error::{CompileError, Result};
use crate::mangle::{SymbolRegistry, mangle};

/// Constants the runtime defines itself.
const EXTERNAL_CONSTANTS: &[&str] = &["ARGV", "ENV", "STDIN", "STDOUT", "STDERR", "RUBY_VERSION"];

/// How a method gets into a dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    /// Filled into the static vtable at assembly time.
    Static,
    /// Stored into the table `self` points at when the definition runs.
    OnSelf,
    /// Stored into the eigenclass of the receiver of `def obj.m`.
    OnObject,
}

impl Install {
    fn as_str(self) -> &'static str {
        match self {
            Install::Static => "static",
            Install::OnSelf => "self",
            Install::OnObject => "eigen",
        }
    }
}

#[derive(Debug, Clone)]
struct DefSite {
    label: String,
    install: Install,
    /// Class the method was defined in, when known statically.
    owner: Option<ClassId>,
}

/// Where `@x` lives for the code being walked.
#[derive(Debug, Clone, PartialEq)]
enum IvarMode {
    /// Word offset in instances of this class.
    Offsets(ClassId),
    /// A static word with this label prefix.
    Static(String),
    /// Looked up by name at run time.
    Dynamic,
}

#[derive(Debug, Clone)]
struct Method {
    name: String,
    owner: Option<ClassId>,
    params: Sexp,
}

#[derive(Debug, Clone)]
struct Ctx {
    /// Enclosing class and module bodies, outermost first.
    lexical: Vec<ClassId>,
    /// Receiver of plain `def`; `None` inside dynamic singleton bodies.
    definee: Option<ClassId>,
    ivars: IvarMode,
    method: Option<Method>,
}

enum ConstRef {
    Class(ClassId),
    Value(String),
}

pub struct Resolver<'a> {
    symbols: &'a mut SymbolRegistry,
    classes: ClassRegistry,
    object: ClassId,
    /// Constant names per namespace; `None` is the top level.
    constants: HashMap<Option<ClassId>, BTreeSet<String>>,
    statics: BTreeMap<String, StaticKind>,
    class_sites: HashMap<(usize, NodeId), ClassId>,
    def_sites: HashMap<(usize, NodeId), DefSite>,
    /// Definitions seen per method label, for redefinitions.
    redefinitions: HashMap<String, usize>,
    singletons: usize,
    sites: usize,
    /// Unit being walked; node ids are only unique within a unit.
    unit: usize,
    collected: usize,
    resolved: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(symbols: &'a mut SymbolRegistry) -> Self {
        let classes = ClassRegistry::new();
        let object = classes.lookup("Object").unwrap_or(ClassId(0));
        for (_, info) in classes.iter() {
            // Builtin labels never clash with each other.
            let _ = symbols.register(&info.label, "class", &info.name);
        }
        Self {
            symbols,
            classes,
            object,
            constants: HashMap::new(),
            statics: BTreeMap::new(),
            class_sites: HashMap::new(),
            def_sites: HashMap::new(),
            redefinitions: HashMap::new(),
            singletons: 0,
            sites: 0,
            unit: 0,
            collected: 0,
            resolved: 0,
        }
    }

    fn top_ctx(&self) -> Ctx {
        Ctx {
            lexical: Vec::new(),
            definee: Some(self.object),
            ivars: IvarMode::Static("__ivar__main".into()),
            method: None,
        }
    }

    pub fn finish_collect(&mut self) {
        self.classes.layout();
        log::debug!(
            "{} classes, {} vtable slots, {} static words",
            self.classes.iter().count(),
            self.classes.offsets.len(),
            self.statics.len()
        );
    }

    pub fn into_parts(self) -> (ClassRegistry, BTreeMap<String, StaticKind>, usize) {
        (self.classes, self.statics, self.sites)
    }

    fn register(&mut self, label: &str, kind: &'static str, name: &str, span: Span) -> Result<()> {
        self.symbols
            .register(label, kind, name)
            .map_err(|e| CompileError::transform(e, Some(span)))
    }

    fn add_static(
        &mut self,
        label: String,
        kind: StaticKind,
        what: &'static str,
        name: &str,
        span: Span,
    ) -> Result<String> {
        self.register(&label, what, name, span)?;
        self.statics.insert(label.clone(), kind);
        Ok(label)
    }

    // ═══════════════════════════════════════════════════════════════
    // Names and labels
    // ═══════════════════════════════════════════════════════════════

    fn ns_key(&self, id: ClassId) -> Option<ClassId> {
        if id == self.object { None } else { Some(id) }
    }

    fn const_label(&self, ns: Option<ClassId>, name: &str) -> String {
        match ns {
            Some(id) => format!("__const__{}__{}", self.classes.label(id), mangle(name)),
            None => format!("__const__{}", mangle(name)),
        }
    }

    fn const_display(&self, ns: Option<ClassId>, name: &str) -> String {
        match ns {
            Some(id) => format!("{}::{name}", self.classes.get(id).name),
            None => name.to_string(),
        }
    }

    fn const_in(&self, ns: Option<ClassId>, name: &str) -> Option<ConstRef> {
        let full = self.const_display(ns, name);
        if let Some(id) = self.classes.lookup(&full) {
            return Some(ConstRef::Class(id));
        }
        if self.constants.get(&ns).is_some_and(|set| set.contains(name)) {
            return Some(ConstRef::Value(self.const_label(ns, name)));
        }
        if ns.is_none() && EXTERNAL_CONSTANTS.contains(&name) {
            return Some(ConstRef::Value(self.const_label(None, name)));
        }
        None
    }

    fn lookup_const(&self, lexical: &[ClassId], name: &str) -> Option<ConstRef> {
        for ns in lexical.iter().rev() {
            if let Some(r) = self.const_in(self.ns_key(*ns), name) {
                return Some(r);
            }
        }
        if let Some(inner) = lexical.last() {
            for ancestor in self.classes.ancestors(*inner).into_iter().skip(1) {
                if let Some(r) = self.const_in(self.ns_key(ancestor), name) {
                    return Some(r);
                }
            }
        }
        self.const_in(None, name)
    }

    /// A constant path that must name a class or module. Bare names
    /// carry no position, so errors fall back to `at`, the construct
    /// holding the path.
    fn class_path(&self, path: &Sexp, ctx: &Ctx, at: Span) -> Result<ClassId> {
        match self.const_path(path, ctx, at)? {
            ConstRef::Class(id) => Ok(id),
            ConstRef::Value(_) => Err(CompileError::transform(
                format!("{path} is not a class or module"),
                Some(path.span().unwrap_or(at)),
            )),
        }
    }

    fn const_path(&self, path: &Sexp, ctx: &Ctx, at: Span) -> Result<ConstRef> {
        let missing = |name: &str| {
            CompileError::transform(
                format!("uninitialized constant {name}"),
                Some(path.span().unwrap_or(at)),
            )
        };
        match path {
            Sexp::Name(name) => self.lookup_const(&ctx.lexical, name).ok_or_else(|| missing(name)),
            Sexp::Node(n) if n.tag == Tag::Colon3 => {
                let name = n.child(0).as_name().unwrap_or_default();
                self.const_in(None, name).ok_or_else(|| missing(name))
            }
            Sexp::Node(n) if n.tag == Tag::Colon2 => {
                let ns = self.class_path(n.child(0), ctx, n.span)?;
                let name = n.child(1).as_name().unwrap_or_default();
                let mut found = self.const_in(self.ns_key(ns), name);
                if found.is_none() {
                    for ancestor in self.classes.ancestors(ns).into_iter().skip(1) {
                        found = self.const_in(self.ns_key(ancestor), name);
                        if found.is_some() {
                            break;
                        }
                    }
                }
                found.ok_or_else(|| missing(&format!("{}::{name}", self.classes.get(ns).name)))
            }
            other => Err(CompileError::transform(
                format!("dynamic constant path {other} is not supported"),
                Some(other.span().unwrap_or(at)),
            )),
        }
    }

    /// Qualified name for `class path`: relative paths nest inside the
    /// innermost enclosing class, `::X` escapes to the top level.
    fn defined_name(&self, path: &Sexp, ctx: &Ctx, at: Span) -> Result<String> {
        match path {
            Sexp::Name(name) => Ok(match ctx.lexical.last() {
                Some(outer) if *outer != self.object => {
                    format!("{}::{name}", self.classes.get(*outer).name)
                }
                _ => name.clone(),
            }),
            Sexp::Node(n) if n.tag == Tag::Colon3 => {
                Ok(n.child(0).as_name().unwrap_or_default().to_string())
            }
            Sexp::Node(n) if n.tag == Tag::Colon2 => {
                let ns = self.class_path(n.child(0), ctx, n.span)?;
                let name = n.child(1).as_name().unwrap_or_default();
                Ok(format!("{}::{name}", self.classes.get(ns).name))
            }
            other => Err(CompileError::transform(
                format!("invalid class name {other}"),
                Some(other.span().unwrap_or(at)),
            )),
        }
    }

    /// Ivar storage inside methods defined on `owner`.
    fn method_ivars(&self, owner: Option<ClassId>) -> IvarMode {
        let Some(owner) = owner else {
            return IvarMode::Dynamic;
        };
        let info = self.classes.get(owner);
        match info.kind {
            ClassKind::Meta => match info.owner {
                Some(c) => IvarMode::Static(format!("__civar__{}", self.classes.label(c))),
                None => IvarMode::Dynamic,
            },
            ClassKind::Class if !info.builtin => IvarMode::Offsets(owner),
            _ => IvarMode::Dynamic,
        }
    }

    fn body_ctx(&self, outer: &Ctx, id: ClassId) -> Ctx {
        let mut lexical = outer.lexical.clone();
        lexical.push(id);
        Ctx {
            lexical,
            definee: Some(id),
            ivars: IvarMode::Static(format!("__civar__{}", self.classes.label(id))),
            method: None,
        }
    }

    fn method_ctx(&self, outer: &Ctx, name: &str, owner: Option<ClassId>, params: &Sexp) -> Ctx {
        Ctx {
            lexical: outer.lexical.clone(),
            definee: owner,
            ivars: self.method_ivars(owner),
            method: Some(Method {
                name: name.to_string(),
                owner,
                params: params.clone(),
            }),
        }
    }

    fn static_label(&self, ctx: &Ctx, name: &str) -> (String, StaticKind, &'static str) {
        if let Some(g) = name.strip_prefix('$') {
            return (format!("__global__{}", mangle(g)), StaticKind::Global, "global");
        }
        if let Some(v) = name.strip_prefix("@@") {
            let class = ctx.lexical.last().copied().unwrap_or(self.object);
            let owner = match self.classes.get(class).owner {
                Some(o) => o,
                None => class,
            };
            return (
                format!("__cvar__{}__{}", self.classes.label(owner), mangle(v)),
                StaticKind::ClassVariable,
                "class variable",
            );
        }
        let v = name.trim_start_matches('@');
        let prefix = match &ctx.ivars {
            IvarMode::Static(p) => p.clone(),
            _ => "__ivar__main".to_string(),
        };
        (
            format!("{prefix}__{}", mangle(v)),
            StaticKind::ClassInstanceVariable,
            "instance variable",
        )
    }

    // ═══════════════════════════════════════════════════════════════
    // Collect
    // ═══════════════════════════════════════════════════════════════

    pub fn collect(&mut self, body: &Sexp) -> Result<()> {
        self.unit = self.collected;
        self.collected += 1;
        let ctx = self.top_ctx();
        self.collect_in(body, &ctx)
    }

    fn collect_all(&mut self, items: &[Sexp], ctx: &Ctx) -> Result<()> {
        for item in items {
            self.collect_in(item, ctx)?;
        }
        Ok(())
    }

    fn collect_in(&mut self, e: &Sexp, ctx: &Ctx) -> Result<()> {
        let node = match e {
            Sexp::Name(name) => return self.collect_name(name, ctx, Span::default()),
            Sexp::Node(n) => n,
            _ => return Ok(()),
        };
        match node.tag {
            Tag::Class | Tag::Module => {
                let kind = if node.tag == Tag::Class { ClassKind::Class } else { ClassKind::Module };
                let name = self.defined_name(node.child(0), ctx, node.span)?;
                let superclass = match (kind, node.child(1)) {
                    (ClassKind::Class, Sexp::Nil) => None,
                    (ClassKind::Class, path) => Some(self.class_path(path, ctx, node.span)?),
                    _ => None,
                };
                let id = self
                    .classes
                    .define(&name, kind, superclass)
                    .map_err(|e| CompileError::transform(e, Some(node.span)))?;
                let label = self.classes.label(id).to_string();
                self.register(&label, "class", &name, node.span)?;
                self.class_sites.insert((self.unit, node.id), id);
                let body = if kind == ClassKind::Class { node.child(2) } else { node.child(1) };
                let inner = self.body_ctx(ctx, id);
                self.collect_in(body, &inner)
            }
            Tag::SClass => {
                self.collect_in(node.child(0), ctx)?;
                match self.static_singleton(node, ctx) {
                    Some(meta) => {
                        self.class_sites.insert((self.unit, node.id), meta);
                        let mut inner = self.body_ctx(ctx, meta);
                        inner.lexical = ctx.lexical.clone();
                        self.collect_in(node.child(1), &inner)
                    }
                    None => {
                        let inner = Ctx {
                            lexical: ctx.lexical.clone(),
                            definee: None,
                            ivars: IvarMode::Dynamic,
                            method: None,
                        };
                        self.collect_in(node.child(1), &inner)
                    }
                }
            }
            Tag::Defm => {
                let name = node.child(0).as_name().unwrap_or_default().to_string();
                let owner = ctx.definee;
                let install = if owner.is_some() { Install::Static } else { Install::OnSelf };
                self.define_method(node, &name, owner, install)?;
                let inner = self.method_ctx(ctx, &name, owner, node.child(1));
                self.collect_in(node.child(2), &inner)
            }
            Tag::Defs => {
                self.collect_in(node.child(0), ctx)?;
                let name = node.child(1).as_name().unwrap_or_default().to_string();
                let owner = self.singleton_target(node.child(0), ctx);
                let install = if owner.is_some() { Install::Static } else { Install::OnObject };
                self.define_method(node, &name, owner, install)?;
                let inner = self.method_ctx(ctx, &name, owner, node.child(2));
                self.collect_in(node.child(3), &inner)
            }
            Tag::Include => {
                let target = ctx.definee.unwrap_or(self.object);
                for path in &node.children {
                    let module = self.class_path(path, ctx, node.span)?;
                    self.classes.include(target, module);
                }
                Ok(())
            }
            Tag::Alias => {
                let (Sexp::Sym(new), Sexp::Sym(old)) = (node.child(0), node.child(1)) else {
                    return Ok(());
                };
                self.alias(ctx, new, old, node.span)
            }
            Tag::Call => {
                if let Some(()) = self.collect_directive(node, ctx)? {
                    return Ok(());
                }
                self.collect_all(&node.children[1..], ctx)
            }
            Tag::Assign => {
                match node.child(0) {
                    Sexp::Name(n) if is_constant_name(n) => {
                        let ns = ctx.lexical.last().and_then(|id| self.ns_key(*id));
                        self.define_constant(ns, n, node.span)?;
                    }
                    Sexp::Node(t) if t.tag == Tag::Colon2 => {
                        let ns = self.class_path(t.child(0), ctx, t.span)?;
                        let name = t.child(1).as_name().unwrap_or_default().to_string();
                        self.define_constant(self.ns_key(ns), &name, node.span)?;
                    }
                    Sexp::Node(t) if t.tag == Tag::Colon3 => {
                        let name = t.child(0).as_name().unwrap_or_default().to_string();
                        self.define_constant(None, &name, node.span)?;
                    }
                    Sexp::Name(n) => self.collect_name(n, ctx, node.span)?,
                    other => self.collect_in(other, ctx)?,
                }
                self.collect_in(node.child(1), ctx)
            }
            Tag::Defined => Ok(()),
            _ => {
                for child in &node.children {
                    match child {
                        Sexp::Name(n) => self.collect_name(n, ctx, node.span)?,
                        other => self.collect_in(other, ctx)?,
                    }
                }
                Ok(())
            }
        }
    }

    fn collect_name(&mut self, name: &str, ctx: &Ctx, span: Span) -> Result<()> {
        if name.starts_with('$') || name.starts_with("@@") {
            let (label, kind, what) = self.static_label(ctx, name);
            self.add_static(label, kind, what, name, span)?;
        } else if name.starts_with('@') {
            match &ctx.ivars {
                IvarMode::Offsets(id) => self.classes.add_ivar(*id, name),
                IvarMode::Static(_) => {
                    let (label, kind, what) = self.static_label(ctx, name);
                    self.add_static(label, kind, what, name, span)?;
                }
                IvarMode::Dynamic => {}
            }
        }
        Ok(())
    }

    /// `include`, `extend` and `alias_method` written as calls.
    fn collect_directive(&mut self, node: &Node, ctx: &Ctx) -> Result<Option<()>> {
        let name = node.child(0).as_name().unwrap_or_default();
        let args = node.child(1).children();
        if !node.child(2).is_nil() {
            return Ok(None);
        }
        match (name, args) {
            ("include" | "extend", paths)
                if !paths.is_empty() && paths.iter().all(is_constant_path) =>
            {
                let target = ctx.definee.unwrap_or(self.object);
                let target = if name == "extend" {
                    self.classes.meta(target).unwrap_or(target)
                } else {
                    target
                };
                for path in paths {
                    let module = self.class_path(path, ctx, node.span)?;
                    self.classes.include(target, module);
                }
                Ok(Some(()))
            }
            ("alias_method", [Sexp::Sym(new), Sexp::Sym(old)]) => {
                self.alias(ctx, new, old, node.span)?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    fn alias(&mut self, ctx: &Ctx, new: &str, old: &str, span: Span) -> Result<()> {
        if new.starts_with('$') {
            return Ok(());
        }
        let target = ctx.definee.unwrap_or(self.object);
        self.classes
            .alias_method(target, new, old)
            .map_err(|e| CompileError::transform(e, Some(span)))
    }

    fn define_constant(&mut self, ns: Option<ClassId>, name: &str, span: Span) -> Result<()> {
        let label = self.const_label(ns, name);
        let display = self.const_display(ns, name);
        self.add_static(label, StaticKind::Constant, "constant", &display, span)?;
        self.constants.entry(ns).or_default().insert(name.to_string());
        Ok(())
    }

    fn define_method(
        &mut self,
        node: &Node,
        name: &str,
        owner: Option<ClassId>,
        install: Install,
    ) -> Result<()> {
        let base = match owner {
            Some(id) => method_label(self.classes.label(id), name),
            None => {
                self.singletons += 1;
                format!("__sdef_{}_{}", self.singletons, mangle(name))
            }
        };
        let seen = self.redefinitions.entry(base.clone()).or_insert(0);
        *seen += 1;
        let label = if *seen == 1 { base } else { format!("{base}_{seen}_") };
        let display = match owner {
            Some(id) => format!("{}#{name}", self.classes.get(id).name),
            None => format!("singleton #{name}"),
        };
        self.register(&label, "method", &display, node.span)?;
        match owner {
            Some(id) => self.classes.define_method(id, name, &label),
            None => {
                self.classes.offsets.alloc(name);
            }
        }
        log::trace!("method {display} -> {label}");
        self.def_sites.insert(
            (self.unit, node.id),
            DefSite {
                label,
                install,
                owner,
            },
        );
        Ok(())
    }

    /// Metaclass for `class << self` inside a class body.
    fn static_singleton(&self, node: &Node, ctx: &Ctx) -> Option<ClassId> {
        if node.child(0).as_name() != Some("self") || ctx.method.is_some() {
            return None;
        }
        let class = *ctx.lexical.last()?;
        self.classes.meta(class)
    }

    /// Metaclass receiving `def recv.m`, when known statically.
    fn singleton_target(&self, recv: &Sexp, ctx: &Ctx) -> Option<ClassId> {
        match recv {
            Sexp::Name(n) if n == "self" && ctx.method.is_none() => match ctx.lexical.last() {
                Some(class) => self.classes.meta(*class),
                None => Some(self.object),
            },
            Sexp::Name(n) if is_constant_name(n) => match self.lookup_const(&ctx.lexical, n) {
                Some(ConstRef::Class(id)) => self.classes.meta(id),
                _ => None,
            },
            _ => None,
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Resolve
    // ═══════════════════════════════════════════════════════════════

    pub fn resolve(&mut self, body: Sexp, ids: &mut NodeIds) -> Result<Sexp> {
        self.unit = self.resolved;
        self.resolved += 1;
        let ctx = self.top_ctx();
        self.rewrite(body, ids, &ctx)
    }

    fn rewrite_all(
        &mut self,
        items: Vec<Sexp>,
        ids: &mut NodeIds,
        ctx: &Ctx,
        at: Span,
    ) -> Result<Vec<Sexp>> {
        items.into_iter().map(|c| self.child(c, ids, ctx, at)).collect()
    }

    /// A child of a node spanning `at`; bare names report that span.
    fn child(&mut self, e: Sexp, ids: &mut NodeIds, ctx: &Ctx, at: Span) -> Result<Sexp> {
        match e {
            Sexp::Name(name) => self.read_name(name, ids, ctx, at),
            other => self.rewrite(other, ids, ctx),
        }
    }

    fn rewrite(&mut self, e: Sexp, ids: &mut NodeIds, ctx: &Ctx) -> Result<Sexp> {
        let node = match e {
            Sexp::Name(name) => return self.read_name(name, ids, ctx, Span::default()),
            Sexp::Node(n) => n,
            other => return Ok(other),
        };
        let span = node.span;
        match node.tag {
            Tag::Class | Tag::Module | Tag::SClass
                if self.class_sites.contains_key(&(self.unit, node.id)) =>
            {
                let id = self.class_sites[&(self.unit, node.id)];
                let site = self.sites;
                self.sites += 1;
                let body_at = match node.tag {
                    Tag::Class => 2,
                    _ => 1,
                };
                let inner = if node.tag == Tag::SClass {
                    let mut c = self.body_ctx(ctx, id);
                    c.lexical = ctx.lexical.clone();
                    c
                } else {
                    self.body_ctx(ctx, id)
                };
                let body = self.rewrite(node.child(body_at).clone(), ids, &inner)?;
                let label = Sexp::name(self.classes.label(id));
                Ok(ids.node(Tag::Class, span, vec![label, Sexp::Int(site as i64), body]))
            }
            Tag::SClass => {
                let object = self.rewrite(node.child(0).clone(), ids, ctx)?;
                let inner = Ctx {
                    lexical: ctx.lexical.clone(),
                    definee: None,
                    ivars: IvarMode::Dynamic,
                    method: None,
                };
                let body = self.rewrite(node.child(1).clone(), ids, &inner)?;
                Ok(node.rebuild(vec![object, body]))
            }
            Tag::Defm | Tag::Defs => self.rewrite_def(node, ids, ctx),
            Tag::Include | Tag::Alias => Ok(nil()),
            Tag::Call if self.is_directive(&node) => Ok(nil()),
            Tag::Super | Tag::ZSuper => self.rewrite_super(node, ids, ctx),
            Tag::Assign => {
                let value = self.child(node.child(1).clone(), ids, ctx, span)?;
                self.assign(node.child(0).clone(), value, ids, ctx, span)
            }
            Tag::Colon2 | Tag::Colon3 => {
                let found = self.const_path(&Sexp::Node(node.clone()), ctx, span)?;
                Ok(self.const_ref(found, ids, span))
            }
            Tag::Defined => {
                let described = match node.child(0) {
                    path @ (Sexp::Name(_) | Sexp::Node(_)) => self.const_path(path, ctx, span).is_ok(),
                    _ => false,
                };
                Ok(if described {
                    Sexp::Str(b"constant".to_vec())
                } else {
                    nil()
                })
            }
            Tag::Lambda => {
                // Parameters are local names, left as they are.
                let params = node.child(0).clone();
                let body = self.rewrite(node.child(1).clone(), ids, ctx)?;
                Ok(node.rebuild(vec![params, body]))
            }
            Tag::Callm | Tag::SafeCallm | Tag::Call => {
                let name_at = if node.tag == Tag::Call { 0 } else { 1 };
                let mut children = Vec::with_capacity(node.children.len());
                for (i, child) in node.children.iter().cloned().enumerate() {
                    children.push(if i == name_at {
                        child
                    } else {
                        self.child(child, ids, ctx, span)?
                    });
                }
                Ok(node.rebuild(children))
            }
            _ => {
                let children = self.rewrite_all(node.children.clone(), ids, ctx, span)?;
                Ok(node.rebuild(children))
            }
        }
    }

    fn is_directive(&self, node: &Node) -> bool {
        let args = node.child(1).children();
        node.child(2).is_nil()
            && match node.child(0).as_name() {
                Some("include" | "extend") => {
                    !args.is_empty() && args.iter().all(is_constant_path)
                }
                Some("alias_method") => matches!(args, [Sexp::Sym(_), Sexp::Sym(_)]),
                _ => false,
            }
    }

    fn const_ref(&self, found: ConstRef, ids: &mut NodeIds, span: Span) -> Sexp {
        match found {
            ConstRef::Class(id) => ids.node(
                Tag::Const,
                span,
                vec![Sexp::name(self.classes.label(id)), Sexp::name("class")],
            ),
            ConstRef::Value(label) => {
                ids.node(Tag::Const, span, vec![Sexp::Name(label), Sexp::name("value")])
            }
        }
    }

    fn static_word(&self, label: String, ids: &mut NodeIds, span: Span) -> Sexp {
        ids.node(Tag::Const, span, vec![Sexp::Name(label), Sexp::name("value")])
    }

    fn read_name(&mut self, name: String, ids: &mut NodeIds, ctx: &Ctx, span: Span) -> Result<Sexp> {
        if is_constant_name(&name) {
            let found = self.lookup_const(&ctx.lexical, &name).ok_or_else(|| {
                CompileError::transform(format!("uninitialized constant {name}"), Some(span))
            })?;
            return Ok(self.const_ref(found, ids, span));
        }
        if name.starts_with('$') || name.starts_with("@@") {
            let (label, _, _) = self.static_label(ctx, &name);
            return Ok(self.static_word(label, ids, span));
        }
        if name.starts_with('@') {
            return Ok(match &ctx.ivars {
                IvarMode::Offsets(id) => match self.classes.ivar_offset(*id, &name) {
                    Some(k) => ids.node(Tag::Index, span, vec![Sexp::name("self"), Sexp::Int(k as i64)]),
                    None => nil(),
                },
                IvarMode::Static(_) => {
                    let (label, _, _) = self.static_label(ctx, &name);
                    self.static_word(label, ids, span)
                }
                IvarMode::Dynamic => ids.callm(
                    span,
                    Sexp::name("self"),
                    "instance_variable_get",
                    vec![Sexp::Sym(name)],
                ),
            });
        }
        Ok(Sexp::Name(name))
    }

    fn assign(
        &mut self,
        target: Sexp,
        value: Sexp,
        ids: &mut NodeIds,
        ctx: &Ctx,
        span: Span,
    ) -> Result<Sexp> {
        let storage = match target {
            Sexp::Name(name) if is_constant_name(&name) => {
                let ns = ctx.lexical.last().and_then(|id| self.ns_key(*id));
                self.static_word(self.const_label(ns, &name), ids, span)
            }
            Sexp::Name(name) if name.starts_with('@') && !name.starts_with("@@") => {
                match &ctx.ivars {
                    IvarMode::Dynamic => {
                        return Ok(ids.callm(
                            span,
                            Sexp::name("self"),
                            "instance_variable_set",
                            vec![Sexp::Sym(name), value],
                        ));
                    }
                    _ => self.read_name(name, ids, ctx, span)?,
                }
            }
            Sexp::Name(name) => self.read_name(name, ids, ctx, span)?,
            Sexp::Node(t) if t.tag == Tag::Colon2 => {
                let ns = self.class_path(t.child(0), ctx, t.span)?;
                let name = t.child(1).as_name().unwrap_or_default();
                self.static_word(self.const_label(self.ns_key(ns), name), ids, t.span)
            }
            Sexp::Node(t) if t.tag == Tag::Colon3 => {
                let name = t.child(0).as_name().unwrap_or_default();
                self.static_word(self.const_label(None, name), ids, t.span)
            }
            other => {
                return Err(CompileError::transform(
                    format!("cannot assign to {other}"),
                    other.span().or(Some(span)),
                ));
            }
        };
        if !(storage.is(Tag::Const) || storage.is(Tag::Index) || storage.as_name().is_some()) {
            return Err(CompileError::transform(
                format!("cannot assign to {storage}"),
                Some(span),
            ));
        }
        if let Some(n) = storage.as_name() {
            if super::is_pseudo_variable(n) {
                return Err(CompileError::transform(format!("cannot assign to {n}"), Some(span)));
            }
        }
        Ok(ids.node(Tag::Assign, span, vec![storage, value]))
    }

    fn rewrite_def(&mut self, node: Node, ids: &mut NodeIds, ctx: &Ctx) -> Result<Sexp> {
        let span = node.span;
        let Some(site) = self.def_sites.get(&(self.unit, node.id)).cloned() else {
            return Err(CompileError::transform("method definition was not collected", Some(span)));
        };
        let (recv, name, params, body) = match node.tag {
            Tag::Defm => (None, node.child(0), node.child(1), node.child(2)),
            _ => (Some(node.child(0)), node.child(1), node.child(2), node.child(3)),
        };
        let name_str = name.as_name().unwrap_or_default().to_string();
        let inner = self.method_ctx(ctx, &name_str, site.owner, params);
        let body = self.rewrite(body.clone(), ids, &inner)?;
        let label = Sexp::Name(site.label.clone());
        match (site.install, recv) {
            (Install::OnObject, Some(recv)) => {
                let recv = self.rewrite(recv.clone(), ids, ctx)?;
                Ok(ids.node(Tag::Defs, span, vec![recv, name.clone(), label, params.clone(), body]))
            }
            (install, _) => Ok(ids.node(
                Tag::Defm,
                span,
                vec![
                    name.clone(),
                    label,
                    Sexp::name(install.as_str()),
                    params.clone(),
                    body,
                ],
            )),
        }
    }

    fn rewrite_super(&mut self, node: Node, ids: &mut NodeIds, ctx: &Ctx) -> Result<Sexp> {
        let span = node.span;
        let Some(method) = ctx.method.clone() else {
            return Err(CompileError::transform("super called outside of a method", Some(span)));
        };
        let Some(owner) = method.owner else {
            return Err(CompileError::transform(
                "super in a singleton method of an object is not supported",
                Some(span),
            ));
        };
        if self.classes.get(owner).kind == ClassKind::Module {
            return Err(CompileError::transform(
                "super in a module method is not supported",
                Some(span),
            ));
        }
        let target = self
            .classes
            .ancestors(owner)
            .into_iter()
            .skip(1)
            .find_map(|c| self.classes.get(c).methods.get(&method.name).cloned())
            .unwrap_or_else(|| missing_thunk(&method.name));

        let (args, block) = if node.tag == Tag::Super {
            let args = self.rewrite(node.child(0).clone(), ids, ctx)?;
            (args, node.child(1).clone())
        } else {
            (self.forwarded_args(&method.params, ids, span), node.child(0).clone())
        };
        let block = match block {
            Sexp::Nil => {
                let name = super::yields::block_param(&method.params).unwrap_or(METHOD_BLOCK);
                Sexp::name(name)
            }
            other => self.rewrite(other, ids, ctx)?,
        };
        Ok(ids.node(Tag::Super, span, vec![Sexp::Name(target), args, block]))
    }

    /// Arguments of a bare `super`: the method's own parameters.
    fn forwarded_args(&self, params: &Sexp, ids: &mut NodeIds, span: Span) -> Sexp {
        let mut plain = Vec::new();
        let mut rest = None;
        for p in params.children() {
            match p {
                Sexp::Name(n) => plain.push(Sexp::name(n.as_str())),
                Sexp::Node(n) if n.tag == Tag::Rest => {
                    if let Some(r) = n.child(0).as_name() {
                        rest = Some(r.to_string());
                    }
                }
                _ => {}
            }
        }
        match rest {
            None => ids.args(span, plain),
            Some(r) => {
                let head = ids.node(Tag::Array, span, plain);
                let tail = ids.callm(span, Sexp::Name(r), "to_a", vec![]);
                let all = ids.callm(span, head, "+", vec![tail]);
                let splat = ids.node(Tag::Splat, span, vec![all]);
                ids.args(span, vec![splat])
            }
        }
    }
}

fn is_constant_path(e: &Sexp) -> bool {
    match e {
        Sexp::Name(n) => is_constant_name(n),
        other => other.is(Tag::Colon2) || other.is(Tag::Colon3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::desugar;

    fn resolved(src: &str) -> Result<(String, Resolver<'static>)> {
        let mut program = parser::parse(src).unwrap_or_else(|e| panic!("{e}"));
        let body = desugar::structure(program.body, &mut program.ids)?;
        let body = desugar::sugar(body, &mut program.ids)?;
        let body = super::super::yields::rewrite(body, &mut program.ids)?;
        let symbols = Box::leak(Box::new(SymbolRegistry::new()));
        let mut r = Resolver::new(symbols);
        r.collect(&body)?;
        r.finish_collect();
        let out = r.resolve(body, &mut program.ids)?;
        Ok((out.to_string(), r))
    }

    fn text(src: &str) -> String {
        match resolved(src) {
            Ok((t, _)) => t,
            Err(e) => panic!("{src:?}: {e}"),
        }
    }

    // ── Classes ──

    #[test]
    fn class_becomes_guarded_site() {
        let t = text("class Foo\n  def bar\n    1\n  end\nend");
        assert!(t.contains("[:class, :Foo, 0, "), "{t}");
        assert!(t.contains("[:defm, :bar, :__method_Foo_bar, :static, [:args], "), "{t}");
    }

    #[test]
    fn nested_classes_are_qualified() {
        let t = text("module A\n  class B\n  end\nend\nA::B");
        assert!(t.contains("[:class, :A__B, 1, "), "{t}");
        assert!(t.ends_with("[:const, :A__B, :class]]"), "{t}");
    }

    #[test]
    fn top_level_escape() {
        let t = text("module A\n  class ::C\n  end\nend\nC");
        assert!(t.contains("[:class, :C, "), "{t}");
    }

    #[test]
    fn self_methods_go_to_the_metaclass() {
        let (_, r) = resolved("class Foo\n  def self.make\n    new\n  end\nend")
            .unwrap_or_else(|e| panic!("{e}"));
        let foo = r.classes.lookup("Foo").unwrap_or_else(|| panic!("no Foo"));
        let meta = r.classes.meta(foo).unwrap_or_else(|| panic!("no meta"));
        assert_eq!(
            r.classes.find_method(meta, "make"),
            Some("__method___meta_Foo_make")
        );
    }

    #[test]
    fn redefinition_gets_a_fresh_label() {
        let t = text("class A\n  def x; 1; end\n  def x; 2; end\nend");
        assert!(t.contains(":__method_A_x, "), "{t}");
        assert!(t.contains(":__method_A_x_2_, "), "{t}");
    }

    #[test]
    fn object_singleton_is_dynamic() {
        let t = text("o = Object.new\ndef o.hi\n  1\nend");
        assert!(t.contains("[:defs, :o, :hi, :__sdef_"), "{t}");
    }

    // ── Constants ──

    #[test]
    fn constants_resolve_lexically_then_by_superclass() {
        let t = text("class Base\n  LIMIT = 3\nend\nclass Sub < Base\n  def lim\n    LIMIT\n  end\nend");
        assert!(t.contains("[:const, :__const__Base__LIMIT, :value]"), "{t}");
    }

    #[test]
    fn unknown_constant_is_an_error() {
        let err = match resolved("Nope") {
            Ok((t, _)) => panic!("resolved {t}"),
            Err(e) => e,
        };
        assert_eq!(err.message, "uninitialized constant Nope");
    }

    #[test]
    fn nested_constant_errors_carry_a_position() {
        for (src, line, column) in [
            ("x = 1\ny = Foo::Bar", 2, 5),
            ("module M\n  class A::B\n  end\nend", 2, 9),
        ] {
            let err = match resolved(src) {
                Ok((t, _)) => panic!("resolved {t}"),
                Err(e) => e,
            };
            assert!(err.message.starts_with("uninitialized constant "), "{err}");
            let span = err.span.unwrap_or_else(|| panic!("{src:?}: no position in {err}"));
            assert_eq!((span.start.line, span.start.column), (line, column), "{src:?}: {err}");
        }
    }

    #[test]
    fn constant_defined_after_use_in_method() {
        let t = text("def f\n  X\nend\nX = 1");
        assert!(t.contains("[:const, :__const__X, :value]"), "{t}");
    }

    // ── Variables ──

    #[test]
    fn instance_variables_get_offsets() {
        let t = text("class P\n  def initialize(x)\n    @x = x\n    @y = 2\n  end\n  def y\n    @y\n  end\nend");
        assert!(t.contains("[:assign, [:index, :self, 1], :x]"), "{t}");
        assert!(t.contains("[:index, :self, 2]"), "{t}");
    }

    #[test]
    fn globals_and_class_variables_are_static() {
        let (t, r) = resolved("$count = 0\nclass K\n  @@n = 1\nend")
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(t.contains("[:const, :__global__count, :value]"), "{t}");
        assert!(r.statics.contains_key("__cvar__K__n"));
    }

    #[test]
    fn module_methods_use_dynamic_ivars() {
        let t = text("module M\n  def get\n    @v\n  end\nend");
        assert!(t.contains("[:callm, :self, :instance_variable_get, [:args, [:sym, :@v]], nil]"), "{t}");
    }

    // ── super ──

    #[test]
    fn super_targets_parent_implementation() {
        let t = text("class A\n  def f(x)\n    x\n  end\nend\nclass B < A\n  def f(x)\n    super\n  end\nend");
        assert!(t.contains("[:super, :__method_A_f, [:args, :x], :__closure__]"), "{t}");
    }

    #[test]
    fn super_without_parent_method_uses_missing_thunk() {
        let t = text("class A\n  def zork\n    super(1)\n  end\nend");
        assert!(t.contains("[:super, :__mm__zork, [:args, 1], :__closure__]"), "{t}");
    }

    #[test]
    fn include_resolves_statically() {
        let (t, r) = resolved("module Greet\n  def hi\n    1\n  end\nend\nclass P\n  include Greet\nend")
            .unwrap_or_else(|e| panic!("{e}"));
        let p = r.classes.lookup("P").unwrap_or_else(|| panic!("no P"));
        assert_eq!(r.classes.find_method(p, "hi"), Some("__method_Greet_hi"));
        assert!(!t.contains("include"), "{t}");
    }
}
