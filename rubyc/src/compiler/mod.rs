/// Assembly emission.
///
/// Every lifted function is compiled into a [`Recorded`] body first; its
/// prologue is emitted afterwards, once the number of stack slots is known,
/// and the body is replayed behind it.
///
/// ```text
///          ┌──────────────┐
///   +16…   │ arguments    │  word i at 4*(i+2)(%ebp)
///   +12    │ block        │
///   +8     │ self         │
///   +4     │ return addr  │
///   %ebp ▶ │ saved %ebp   │
///   -4     │ numargs      │  pushed %ebx, only when the body needs it
///   -8…    │ slots        │  slot i at -4*(i+2)(%ebp): locals, then temps
///          └──────────────┘
/// ```
///
/// `%eax` carries the value of the expression being compiled, `%esi` holds
/// `self`. The register allocator caches locals in the remaining pool;
/// everything is written back before a label, a jump or a call into
/// compiled code, so every control-flow merge sees variables at home.
mod arith;
mod calls;
mod control;
mod data;

use std::collections::{HashMap, HashSet};

use parser::{Node, Sexp, Span, Tag};

use crate::asm::{Emit, Operand, Recorded, TextOutput, align16};
use crate::error::{CompileError, Result};
use crate::integer::Integer;
use crate::regalloc::{HasRegs, Reg, RegAlloc, Spill};
use crate::transform::env::{ENV, PARENT_ENV};
use crate::transform::{Function, FunctionKind, Program};

use data::Data;

/// Compile a transformed program into one assembly unit.
pub fn compile(program: &Program) -> Result<String> {
    let mut shared = Shared::default();
    let mut out = TextOutput::new();
    out.directive(".text");
    for f in &program.functions {
        let code = FnEmitter::new(&mut shared, f).emit()?;
        log::trace!("{}: {} lines", f.label, code.len());
        code.replay(&mut out);
    }
    entry(&mut out, &program.units);
    shared.data.emit(program, &mut out);
    Ok(out.into_string())
}

/// `main`: initialise the runtime, then run each unit with `self` = the
/// main object.
fn entry(out: &mut TextOutput, units: &[String]) {
    out.directive(".globl\tmain");
    out.label("main");
    out.pushl(Reg::Ebp);
    out.movl(Reg::Esp, Reg::Ebp);
    out.pushl(Reg::Ebx);
    out.pushl(Reg::Esi);
    out.pushl(Reg::Edi);
    // Four words pushed since the call: 12 bytes realign, 16 hold arguments.
    out.subl(28i64, Reg::Esp);
    out.movl(Operand::mem(Reg::Ebp, 12), Reg::Eax);
    out.movl(Reg::Eax, Operand::mem(Reg::Esp, 4));
    out.movl(Operand::mem(Reg::Ebp, 8), Reg::Eax);
    out.movl(Reg::Eax, Operand::mem(Reg::Esp, 0));
    out.call("__runtime_init");
    for unit in units {
        out.movl(Operand::abs("__main_object"), Reg::Eax);
        out.movl(Reg::Eax, Operand::mem(Reg::Esp, 0));
        out.movl(Operand::addr("__nil"), Operand::mem(Reg::Esp, 4));
        out.movl(2i64, Reg::Ebx);
        out.call(unit.as_str());
    }
    out.addl(28i64, Reg::Esp);
    out.movl(0i64, Reg::Eax);
    out.popl(Reg::Edi);
    out.popl(Reg::Esi);
    out.popl(Reg::Ebx);
    out.popl(Reg::Ebp);
    out.ins("ret", vec![]);
}

/// State shared by every function of the session.
#[derive(Debug, Default)]
struct Shared {
    labels: usize,
    data: Data,
    break_sites: HashSet<i64>,
}

// ═══════════════════════════════════════════════════════════════════
// Per-function emitter
// ═══════════════════════════════════════════════════════════════════

/// Enclosing loop: where `next` and `break` go.
#[derive(Debug, Clone)]
struct Loop {
    next: String,
    exit: String,
    /// Protected regions open when the loop started.
    regions: usize,
}

/// A `begin` whose exits must run an `ensure` body or unlink a handler.
#[derive(Debug, Clone)]
struct Region {
    ensure: Sexp,
    /// Frame offset of the installed handler record.
    handler: Option<i32>,
    /// Target of `retry`, inside rescue clauses.
    retry: Option<String>,
}

struct FnEmitter<'a> {
    shared: &'a mut Shared,
    func: &'a Function,
    out: Recorded,
    regs: RegAlloc,
    homes: HashMap<String, Operand>,
    /// Slots holding named variables; temporaries follow.
    named: usize,
    next_slot: usize,
    max_slot: usize,
    loops: Vec<Loop>,
    regions: Vec<Region>,
}

impl HasRegs for FnEmitter<'_> {
    fn regs(&mut self) -> &mut RegAlloc {
        &mut self.regs
    }

    fn spill(&mut self, spill: Spill) -> Result<()> {
        let home = self.home(&spill.var, None)?;
        self.out.movl(spill.reg, home);
        Ok(())
    }

    fn reload(&mut self, var: &str, reg: Reg) -> Result<()> {
        let home = self.home(var, None)?;
        self.out.movl(home, reg);
        Ok(())
    }
}

fn slot_disp(slot: usize) -> i32 {
    -4 * (slot as i32 + 2)
}

fn arg_disp(word: usize) -> i32 {
    4 * (word as i32 + 2)
}

fn nil() -> Operand {
    Operand::addr("__nil")
}

fn emit_error(message: impl Into<String>, span: Span) -> CompileError {
    CompileError::emit(message, Some(span))
}

impl<'a> FnEmitter<'a> {
    fn new(shared: &'a mut Shared, func: &'a Function) -> Self {
        let mut homes = HashMap::new();
        let first = func.first_param_word();
        for (i, p) in func.params.iter().enumerate() {
            homes.insert(p.clone(), Operand::mem(Reg::Ebp, arg_disp(first + i)));
        }
        homes.insert(func.block_param.clone(), Operand::mem(Reg::Ebp, arg_disp(1)));
        if func.kind == FunctionKind::Block {
            homes.insert(PARENT_ENV.to_string(), Operand::mem(Reg::Ebp, arg_disp(2)));
        }
        let mut named = 0;
        let slotted = func
            .locals
            .iter()
            .chain(func.rest.iter())
            .map(String::as_str)
            .chain(func.env.is_some().then_some(ENV));
        for name in slotted {
            homes.insert(name.to_string(), Operand::mem(Reg::Ebp, slot_disp(named)));
            named += 1;
        }

        let mut uses: HashMap<String, usize> = HashMap::new();
        func.body.walk(&mut |e| {
            if let Sexp::Name(n) = e {
                if homes.contains_key(n) {
                    *uses.entry(n.clone()).or_default() += 1;
                }
            }
        });

        Self {
            shared,
            func,
            out: Recorded::new(),
            regs: RegAlloc::new(uses),
            homes,
            named,
            next_slot: named,
            max_slot: named,
            loops: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Compile the whole function, prologue included.
    fn emit(mut self) -> Result<Recorded> {
        let func = self.func;
        self.expr(&func.body)?;
        self.epilogue();

        let mut code = Recorded::new();
        self.prologue(&mut code);
        std::mem::take(&mut self.out).replay(&mut code);
        Ok(code)
    }

    fn uses_numargs(&self) -> bool {
        if self.func.rest.is_some() {
            return true;
        }
        let mut found = false;
        self.func.body.walk(&mut |e| found |= e.is(Tag::Numargs));
        found
    }

    fn prologue(&self, code: &mut Recorded) {
        let f = self.func;
        let numargs = self.uses_numargs();
        code.label(&f.label);
        code.pushl(Reg::Ebp);
        code.movl(Reg::Esp, Reg::Ebp);
        if numargs {
            code.pushl(Reg::Ebx);
        }
        let pushed = if numargs { 12 } else { 8 };
        let size = align16(12 + 4 * self.max_slot) - pushed;
        if size > 0 {
            code.subl(size as i64, Reg::Esp);
        }
        code.movl(Operand::mem(Reg::Ebp, 8), Reg::Esi);
        for slot in 0..self.named {
            code.movl(nil(), Operand::mem(Reg::Ebp, slot_disp(slot)));
        }

        if let Some(rest) = &f.rest {
            let fixed = f.first_param_word() + f.params.len();
            code.movl(Operand::mem(Reg::Ebp, -4), Reg::Eax);
            code.subl(fixed as i64, Reg::Eax);
            code.subl(16i64, Reg::Esp);
            code.movl(Reg::Eax, Operand::mem(Reg::Esp, 4));
            code.leal(Operand::mem(Reg::Ebp, arg_disp(fixed)), Reg::Eax);
            code.movl(Reg::Eax, Operand::mem(Reg::Esp, 0));
            code.call("__splat_to_array");
            code.addl(16i64, Reg::Esp);
            if let Some(home) = self.homes.get(rest) {
                code.movl(Reg::Eax, home.clone());
            }
        }

        if let Some(env) = &f.env {
            code.subl(16i64, Reg::Esp);
            code.movl((env.len() + 2) as i64, Operand::mem(Reg::Esp, 0));
            code.call("__alloc_env");
            code.addl(16i64, Reg::Esp);
            if let Some(home) = self.homes.get(ENV) {
                code.movl(Reg::Eax, home.clone());
            }
            match f.kind {
                FunctionKind::Block => {
                    code.movl(Operand::mem(Reg::Ebp, arg_disp(2)), Reg::Ecx);
                    code.movl(Reg::Ecx, Operand::mem(Reg::Eax, 0));
                }
                _ => code.movl(nil(), Operand::mem(Reg::Eax, 0)),
            }
            code.movl(Reg::Ebp, Operand::mem(Reg::Eax, 4));
            let rest = f.rest.as_deref();
            for (i, name) in env.iter().enumerate() {
                let is_param = f.params.contains(name)
                    || *name == f.block_param
                    || rest == Some(name.as_str());
                if !is_param {
                    continue;
                }
                if let Some(home) = self.homes.get(name) {
                    code.movl(home.clone(), Reg::Ecx);
                    code.movl(Reg::Ecx, Operand::mem(Reg::Eax, 4 * (i as i32 + 2)));
                }
            }
        }
    }

    fn epilogue(&mut self) {
        self.out.ins("leave", vec![]);
        self.out.ins("ret", vec![]);
        self.unreachable();
    }

    // ── Labels and control flow ──

    fn new_label(&mut self, stem: &str) -> String {
        self.shared.labels += 1;
        format!(".L{stem}{}", self.shared.labels)
    }

    /// Write every cached variable back; control flow may diverge here.
    fn branch_point(&mut self) -> Result<()> {
        for spill in self.regs.evict_all() {
            self.spill(spill)?;
        }
        Ok(())
    }

    /// Code after an unconditional transfer is only reached through a
    /// label, where nothing is cached.
    fn unreachable(&mut self) {
        let _ = self.regs.evict_all();
    }

    fn bind(&mut self, label: &str) -> Result<()> {
        self.branch_point()?;
        self.out.label(label);
        Ok(())
    }

    fn jump(&mut self, label: &str) -> Result<()> {
        self.branch_point()?;
        self.out.jmp(label);
        self.unreachable();
        Ok(())
    }

    /// Jump to `label` when `%eax` is `nil` or `false`.
    fn branch_if_false(&mut self, label: &str) -> Result<()> {
        self.branch_point()?;
        self.out.cmpl(nil(), Reg::Eax);
        self.out.jcc("je", label);
        self.out.cmpl(Operand::addr("__false"), Reg::Eax);
        self.out.jcc("je", label);
        Ok(())
    }

    /// Jump to `label` unless `%eax` is `nil` or `false`.
    fn branch_if_true(&mut self, label: &str) -> Result<()> {
        self.branch_point()?;
        let skip = self.new_label("falsy");
        self.out.cmpl(nil(), Reg::Eax);
        self.out.jcc("je", &skip);
        self.out.cmpl(Operand::addr("__false"), Reg::Eax);
        self.out.jcc("jne", label);
        self.out.label(&skip);
        Ok(())
    }

    // ── Stack slots ──

    fn temp_disp(&mut self) -> i32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slot = self.max_slot.max(self.next_slot);
        slot_disp(slot)
    }

    fn temp(&mut self) -> Operand {
        let disp = self.temp_disp();
        Operand::mem(Reg::Ebp, disp)
    }

    /// Keep `%eax` in a fresh temporary.
    fn stash(&mut self) -> Operand {
        let t = self.temp();
        self.out.movl(Reg::Eax, t.clone());
        t
    }

    /// `n` consecutive slots; returns the offset of the lowest address.
    fn record(&mut self, n: usize) -> i32 {
        let first = self.next_slot;
        self.next_slot += n;
        self.max_slot = self.max_slot.max(self.next_slot);
        slot_disp(first + n - 1)
    }

    fn mark(&self) -> usize {
        self.next_slot
    }

    fn release(&mut self, mark: usize) {
        self.next_slot = mark.max(self.named);
    }

    // ── Variables ──

    fn home(&self, name: &str, span: Option<Span>) -> Result<Operand> {
        self.homes.get(name).cloned().ok_or_else(|| {
            CompileError::emit(
                format!("undefined variable '{name}' in {}", self.func.label),
                span,
            )
        })
    }

    fn load_var(&mut self, name: &str, span: Span) -> Result<()> {
        match name {
            "self" => self.out.movl(Reg::Esi, Reg::Eax),
            "nil" | "true" | "false" => self.out.movl(Operand::addr(format!("__{name}")), Reg::Eax),
            _ => {
                let home = self.home(name, Some(span))?;
                match self.regs.cached(name) {
                    Some(r) => self.out.movl(r, Reg::Eax),
                    None => match self.regs.cache(name) {
                        Some(r) => {
                            self.out.movl(home, r);
                            self.out.movl(r, Reg::Eax);
                        }
                        None => self.out.movl(home, Reg::Eax),
                    },
                }
            }
        }
        Ok(())
    }

    fn store_var(&mut self, name: &str, span: Span) -> Result<()> {
        if crate::transform::is_pseudo_variable(name) {
            return Err(emit_error(format!("cannot assign to {name}"), span));
        }
        let home = self.home(name, Some(span))?;
        match self.regs.cache(name) {
            Some(r) => {
                self.out.movl(Reg::Eax, r);
                self.regs.mark_dirty(name);
            }
            None => self.out.movl(Reg::Eax, home),
        }
        Ok(())
    }

    /// Load a frame-chain expression (`__env__`, `__penv__` and slot-0
    /// hops) into `reg` without touching `%eax`.
    fn load_frame(&mut self, e: &Sexp, reg: Reg, span: Span) -> Result<()> {
        match e {
            Sexp::Name(n) => {
                let src = match self.regs.cached(n) {
                    Some(r) => Operand::Reg(r),
                    None => self.home(n, Some(span))?,
                };
                self.out.movl(src, reg);
                Ok(())
            }
            Sexp::Node(n) if n.tag == Tag::Index => {
                let slot = slot_index(n)?;
                self.load_frame(n.child(0), reg, n.span)?;
                self.out.movl(Operand::mem(reg, 4 * slot), reg);
                Ok(())
            }
            _ => Err(emit_error("unsupported frame expression", span)),
        }
    }

    fn load_index(&mut self, node: &Node) -> Result<()> {
        let slot = slot_index(node)?;
        match node.child(0) {
            Sexp::Name(n) if n == "self" => {
                self.out.movl(Operand::mem(Reg::Esi, 4 * slot), Reg::Eax);
            }
            base => {
                self.load_frame(base, Reg::Eax, node.span)?;
                self.out.movl(Operand::mem(Reg::Eax, 4 * slot), Reg::Eax);
            }
        }
        Ok(())
    }

    fn store_index(&mut self, node: &Node) -> Result<()> {
        let slot = slot_index(node)?;
        match node.child(0) {
            Sexp::Name(n) if n == "self" => {
                self.out.movl(Reg::Eax, Operand::mem(Reg::Esi, 4 * slot));
                Ok(())
            }
            base => crate::regalloc::with_register(self, |this, r| {
                this.load_frame(base, r, node.span)?;
                this.out.movl(Reg::Eax, Operand::mem(r, 4 * slot));
                Ok(())
            }),
        }
    }

    /// Store `%eax` into an assignment target.
    fn store(&mut self, target: &Sexp, span: Span) -> Result<()> {
        match target {
            Sexp::Name(n) => self.store_var(n, span),
            Sexp::Node(n) if n.tag == Tag::Index => self.store_index(n),
            Sexp::Node(n) if n.tag == Tag::Const => {
                let label = const_label(n)?;
                if n.child(1).as_name() == Some("class") {
                    return Err(emit_error(format!("cannot reassign class {label}"), n.span));
                }
                self.out.movl(Reg::Eax, Operand::abs(label));
                Ok(())
            }
            _ => Err(emit_error("invalid assignment target", span)),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Expressions
    // ═══════════════════════════════════════════════════════════════

    /// Compile `e`, leaving its value in `%eax`.
    fn expr(&mut self, e: &Sexp) -> Result<()> {
        let span = e.span().unwrap_or(self.func.span);
        match e {
            Sexp::Nil => {
                self.out.movl(nil(), Reg::Eax);
                Ok(())
            }
            Sexp::Int(v) => self.integer(&Integer::from_i64(*v)),
            Sexp::BigInt(text) => match Integer::parse(text) {
                Some(i) => self.integer(&i),
                None => Err(emit_error(format!("invalid integer literal {text}"), span)),
            },
            Sexp::Float(text) => Err(emit_error(
                format!("floating point literal {text} is not supported"),
                span,
            )),
            Sexp::Str(bytes) => self.string(bytes),
            Sexp::Sym(name) => self.symbol(name),
            Sexp::Name(n) => self.load_var(n, span),
            Sexp::Node(node) => self.node(node),
        }
    }

    fn node(&mut self, node: &Node) -> Result<()> {
        let span = node.span;
        match node.tag {
            Tag::Do => {
                if node.children.is_empty() {
                    self.out.movl(nil(), Reg::Eax);
                }
                for stmt in &node.children {
                    self.expr(stmt)?;
                }
                Ok(())
            }
            Tag::Assign => {
                self.expr(node.child(1))?;
                self.store(node.child(0), span)
            }
            Tag::Index => self.load_index(node),
            Tag::Const => {
                let label = const_label(node)?;
                match node.child(1).as_name() {
                    Some("class") => self.out.movl(Operand::addr(label), Reg::Eax),
                    _ => self.out.movl(Operand::abs(label), Reg::Eax),
                }
                Ok(())
            }
            Tag::Numargs => {
                self.out.movl(Operand::mem(Reg::Ebp, -4), Reg::Eax);
                self.out.addl(Reg::Eax, Reg::Eax);
                self.out.addl(1i64, Reg::Eax);
                Ok(())
            }
            Tag::If => self.if_(node),
            Tag::And | Tag::Or => self.logical(node),
            Tag::Not => self.not(node),
            Tag::While => self.while_(node),
            Tag::DoWhile => self.do_while(node),
            Tag::Begin => self.begin(node),
            Tag::Return => self.return_(node),
            Tag::Break => self.break_(node),
            Tag::Next => self.next(node),
            Tag::Retry => self.retry(node),
            Tag::Redo => Err(emit_error("redo is not supported", span)),
            Tag::Call => self.call(node),
            Tag::Callm => self.callm(node),
            Tag::SafeCallm => self.safe_callm(node),
            Tag::SafeChain => self.safe_chain(node),
            Tag::Super => self.super_call(node),
            Tag::ProcNew => self.proc_new(node),
            Tag::Array => self.array(node),
            Tag::Hash => self.hash(node),
            Tag::Defm => self.defm(node),
            Tag::Defs => self.defs(node),
            Tag::Class => self.class_site(node),
            Tag::SClass => self.singleton_body(node),
            other => Err(emit_error(
                format!("unsupported construct '{}'", other.as_str()),
                span,
            )),
        }
    }
}

fn slot_index(node: &Node) -> Result<i32> {
    match node.child(1) {
        Sexp::Int(k) => Ok(*k as i32),
        _ => Err(emit_error("malformed index node", node.span)),
    }
}

fn const_label(node: &Node) -> Result<&str> {
    node.child(0)
        .as_name()
        .ok_or_else(|| emit_error("malformed constant node", node.span))
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::transform::testing::program;

    /// Assembly for `src`, panicking on any error.
    pub fn assembly(src: &str) -> String {
        let p = program(src).unwrap_or_else(|e| panic!("{src:?}: {e}"));
        super::compile(&p).unwrap_or_else(|e| panic!("{src:?}: {e}"))
    }

    /// The lines of function `label`, up to the next function or section.
    pub fn function_text(asm: &str, label: &str) -> String {
        let start = asm
            .find(&format!("\n{label}:\n"))
            .unwrap_or_else(|| panic!("no function {label} in\n{asm}"));
        let mut lines = asm[start + 1..].lines();
        let mut out = String::new();
        if let Some(first) = lines.next() {
            out.push_str(first);
            out.push('\n');
        }
        for line in lines {
            let ends = (!line.starts_with('\t') && !line.starts_with(".L"))
                || [".globl", ".data", ".section", ".text"]
                    .iter()
                    .any(|d| line.starts_with(&format!("\t{d}")));
            if ends {
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::transform::testing::program;

    fn compile_err(src: &str) -> CompileError {
        let p = program(src).unwrap_or_else(|e| panic!("{src:?}: {e}"));
        match compile(&p) {
            Ok(asm) => panic!("{src:?} compiled:\n{asm}"),
            Err(e) => e,
        }
    }

    // ── Frames ──

    #[test]
    fn main_runs_every_unit() {
        let asm = assembly("1");
        assert!(asm.contains("\t.globl\tmain\nmain:\n"), "{asm}");
        assert!(asm.contains("\tcall\t__runtime_init\n"), "{asm}");
        assert!(asm.contains("\tcall\t__unit_0\n"), "{asm}");
    }

    #[test]
    fn prologue_reserves_aligned_slots() {
        let asm = assembly("a = 1\nb = 2\nc = a");
        let f = function_text(&asm, "__unit_0");
        assert!(f.starts_with("__unit_0:\n\tpushl\t%ebp\n\tmovl\t%esp, %ebp\n"), "{f}");
        assert!(f.contains("\tsubl\t$24, %esp\n"), "{f}");
        assert!(f.contains("\tmovl\t$__nil, -8(%ebp)\n"), "{f}");
        assert!(f.contains("\tmovl\t$__nil, -16(%ebp)\n"), "{f}");
        assert!(f.ends_with("\tleave\n\tret\n"), "{f}");
    }

    #[test]
    fn parameters_live_above_the_frame() {
        let asm = assembly("def pick(a, b)\n  b\nend");
        let f = function_text(&asm, "__method_Object_pick");
        assert!(f.contains("20(%ebp)"), "{f}");
        assert!(!f.contains("pushl\t%ebx"), "{f}");
    }

    #[test]
    fn defaults_keep_the_argument_count() {
        let asm = assembly("def f(a, b = 2)\n  b\nend");
        let f = function_text(&asm, "__method_Object_f");
        assert!(f.contains("\tpushl\t%ebx\n"), "{f}");
        assert!(f.contains("\tmovl\t-4(%ebp), %eax\n"), "{f}");
    }

    #[test]
    fn rest_parameter_collects_the_tail() {
        let asm = assembly("def f(a, *rest)\n  rest\nend");
        let f = function_text(&asm, "__method_Object_f");
        assert!(f.contains("\tsubl\t$3, %eax\n"), "{f}");
        assert!(f.contains("\tleal\t20(%ebp), %eax\n"), "{f}");
        assert!(f.contains("\tcall\t__splat_to_array\n"), "{f}");
    }

    #[test]
    fn frame_is_allocated_and_linked() {
        let asm = assembly("n = 1\n[1].each { |x| n += x }\nn");
        let main = function_text(&asm, "__unit_0");
        assert!(main.contains("\tmovl\t$3, (%esp)\n\tcall\t__alloc_env\n"), "{main}");
        assert!(main.contains("\tmovl\t%ebp, 4(%eax)\n"), "{main}");
        let block = function_text(&asm, "__unit_0_block_1");
        assert!(block.contains("16(%ebp)"), "{block}");
    }

    #[test]
    fn captured_parameters_are_copied_into_the_frame() {
        let asm = assembly("def f(a)\n  [1].map { |x| x + a }\nend");
        let f = function_text(&asm, "__method_Object_f");
        assert!(f.contains("\tmovl\t16(%ebp), %ecx\n\tmovl\t%ecx, 8(%eax)\n"), "{f}");
    }

    // ── Variables ──

    #[test]
    fn instance_variables_index_self() {
        let asm = assembly("class P\n  def initialize(x)\n    @x = x\n  end\n  def x\n    @x\n  end\nend");
        let f = function_text(&asm, "__method_P_x");
        assert!(f.contains("\tmovl\t4(%esi), %eax\n"), "{f}");
    }

    #[test]
    fn constants_are_static_words() {
        let asm = assembly("LIMIT = 3\nLIMIT");
        assert!(asm.contains("\tmovl\t%eax, __const__LIMIT\n"), "{asm}");
        assert!(asm.contains("\tmovl\t__const__LIMIT, %eax\n"), "{asm}");
        assert!(asm.contains("__const__LIMIT:\n\t.long\t__nil\n"), "{asm}");
    }

    #[test]
    fn fixnum_literals_are_tagged() {
        let asm = assembly("x = 20");
        assert!(asm.contains("\tmovl\t$41, %eax\n"), "{asm}");
    }

    // ── Errors ──

    #[test]
    fn floats_are_rejected() {
        let e = compile_err("x = 1.5");
        assert!(e.message.contains("floating point"), "{e}");
    }

    #[test]
    fn redo_is_rejected() {
        let e = compile_err("while true\n  redo\nend");
        assert_eq!(e.message, "redo is not supported");
    }
}
