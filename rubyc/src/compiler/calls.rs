/// Calls: sends through the receiver's vtable, direct `super` calls,
/// runtime helpers, block creation and the literals built by the runtime.
use parser::{Node, Sexp, Tag};

use super::{FnEmitter, emit_error, nil};
use crate::asm::{Emit, Operand, align16};
use crate::classes::voff_symbol;
use crate::error::Result;
use crate::integer::Integer;
use crate::regalloc::{HasRegs, Reg};

/// How a call reaches its callee.
#[derive(Debug, Clone)]
pub(super) enum Target {
    /// Through the vtable slot of a method name.
    Send(String),
    /// A fixed function label.
    Direct(String),
}

/// Operands of a call, each a constant or a parked stack slot.
#[derive(Debug, Clone)]
pub(super) struct CallArgs {
    pub recv: Operand,
    pub block: Operand,
    pub args: Vec<Operand>,
    /// An array spread over the arguments instead of `args`.
    pub splat: Option<Operand>,
    /// The block literal can `break` out of this call.
    pub break_id: Option<i64>,
}

impl CallArgs {
    pub fn plain(recv: Operand, args: Vec<Operand>) -> Self {
        Self {
            recv,
            block: nil(),
            args,
            splat: None,
            break_id: None,
        }
    }
}

/// Operand for expressions that need no code.
pub(super) fn immediate(e: &Sexp) -> Option<Operand> {
    match e {
        Sexp::Int(v) => Integer::from_i64(*v)
            .tagged()
            .map(|t| Operand::Imm(t as i32 as i64)),
        Sexp::Name(n) => match n.as_str() {
            "self" => Some(Operand::Reg(Reg::Esi)),
            "nil" | "true" | "false" => Some(Operand::addr(format!("__{n}"))),
            _ => None,
        },
        Sexp::Node(n) if n.tag == Tag::Const && n.child(1).as_name() == Some("class") => {
            n.child(0).as_name().map(Operand::addr)
        }
        _ => None,
    }
}

impl FnEmitter<'_> {
    /// Evaluate `e` into an operand that later code cannot clobber.
    pub(super) fn operand(&mut self, e: &Sexp) -> Result<Operand> {
        if let Some(op) = immediate(e) {
            return Ok(op);
        }
        self.expr(e)?;
        Ok(self.stash())
    }

    // ── Runtime helpers ──

    /// Call the runtime C function `name`; the result is in `%eax`.
    pub(super) fn ccall(&mut self, name: &str, args: &[Operand]) -> Result<()> {
        // Inside a protected region the callee may raise, and the handler
        // expects every variable at home.
        let spills = if self.regions.is_empty() {
            self.regs.evict_caller_saved()
        } else {
            self.regs.evict_all()
        };
        for s in spills {
            self.spill(s)?;
        }
        let size = align16(4 * args.len()).max(16);
        self.out.subl(size as i64, Reg::Esp);
        for (i, a) in args.iter().enumerate() {
            if direct(a) {
                self.out.movl(a.clone(), Operand::mem(Reg::Esp, 4 * i as i32));
            }
        }
        for (i, a) in args.iter().enumerate() {
            if !direct(a) {
                self.out.movl(a.clone(), Reg::Eax);
                self.out.movl(Reg::Eax, Operand::mem(Reg::Esp, 4 * i as i32));
            }
        }
        self.out.call(name);
        self.out.addl(size as i64, Reg::Esp);
        Ok(())
    }

    // ── Calls ──

    pub(super) fn call(&mut self, node: &Node) -> Result<()> {
        let name = method_name(node, 0)?;
        let mark = self.mark();
        let call = self.call_args(Operand::Reg(Reg::Esi), node.child(1), node.child(2))?;
        self.invoke(Target::Send(name.to_string()), call)?;
        self.release(mark);
        Ok(())
    }

    pub(super) fn callm(&mut self, node: &Node) -> Result<()> {
        let name = method_name(node, 1)?;
        if let Some(op) = super::arith::ArithOp::from_name(name) {
            if let [arg] = node.child(2).children() {
                if !arg.is(Tag::Splat) && node.child(3).is_nil() {
                    return self.arith(op, node.child(0), arg);
                }
            }
        }
        let mark = self.mark();
        let recv = self.operand(node.child(0))?;
        let call = self.call_args(recv, node.child(2), node.child(3))?;
        self.invoke(Target::Send(name.to_string()), call)?;
        self.release(mark);
        Ok(())
    }

    /// `recv&.m(args)`: nil when the receiver is nil, arguments unevaluated.
    pub(super) fn safe_callm(&mut self, node: &Node) -> Result<()> {
        let name = method_name(node, 1)?;
        let done = self.new_label("safe");
        let mark = self.mark();
        self.expr(node.child(0))?;
        self.branch_point()?;
        self.out.cmpl(nil(), Reg::Eax);
        self.out.jcc("je", &done);
        let recv = self.stash();
        let call = self.call_args(recv, node.child(2), node.child(3))?;
        self.invoke(Target::Send(name.to_string()), call)?;
        self.bind(&done)?;
        self.release(mark);
        Ok(())
    }

    /// `[:safechain, chain]`: a nil receiver at any `&.` link skips the
    /// links after it and leaves nil.
    pub(super) fn safe_chain(&mut self, node: &Node) -> Result<()> {
        let exit = self.new_label("safe");
        match node.child(0) {
            // Operator assignment through the chain reads the receiver
            // into a temporary first.
            Sexp::Node(seq) if seq.tag == Tag::Do && !seq.children.is_empty() => {
                for (i, stmt) in seq.children.iter().enumerate() {
                    match stmt {
                        Sexp::Node(set) if i == 0 && set.tag == Tag::Assign => {
                            self.chain(set.child(1), &exit)?;
                            self.store(set.child(0), set.span)?;
                        }
                        _ => self.expr(stmt)?,
                    }
                }
            }
            chain => self.chain(chain, &exit)?,
        }
        self.bind(&exit)
    }

    fn chain(&mut self, e: &Sexp, exit: &str) -> Result<()> {
        match e {
            Sexp::Node(n) if matches!(n.tag, Tag::Callm | Tag::SafeCallm) => self.chain_link(n, exit),
            other => self.expr(other),
        }
    }

    fn chain_link(&mut self, node: &Node, exit: &str) -> Result<()> {
        let name = method_name(node, 1)?;
        let mark = self.mark();
        self.chain(node.child(0), exit)?;
        if node.tag == Tag::SafeCallm {
            self.branch_point()?;
            self.out.cmpl(nil(), Reg::Eax);
            self.out.jcc("je", exit);
        }
        let recv = self.stash();
        let call = self.call_args(recv, node.child(2), node.child(3))?;
        self.invoke(Target::Send(name.to_string()), call)?;
        self.release(mark);
        Ok(())
    }

    /// `[:super, :label, args, block]`: the parent's implementation,
    /// called directly with the current `self`.
    pub(super) fn super_call(&mut self, node: &Node) -> Result<()> {
        let label = method_name(node, 0)?;
        let mark = self.mark();
        let call = self.call_args(Operand::Reg(Reg::Esi), node.child(1), node.child(2))?;
        self.invoke(Target::Direct(label.to_string()), call)?;
        self.release(mark);
        Ok(())
    }

    /// Evaluate arguments left to right, then the block.
    fn call_args(&mut self, recv: Operand, args: &Sexp, block: &Sexp) -> Result<CallArgs> {
        let mut call = CallArgs::plain(recv, Vec::new());
        match args.children() {
            [Sexp::Node(s)] if s.tag == Tag::Splat => {
                self.expr(s.child(0))?;
                call.splat = Some(self.stash());
            }
            items => {
                for a in items {
                    if let Sexp::Node(n) = a {
                        if n.tag == Tag::Splat {
                            return Err(emit_error("splat must be the only argument", n.span));
                        }
                    }
                    let op = self.operand(a)?;
                    call.args.push(op);
                }
            }
        }
        match block {
            Sexp::Nil => {}
            Sexp::Node(n) if n.tag == Tag::ProcNew => {
                self.proc_new(n)?;
                call.block = self.stash();
                call.break_id = match n.child(2) {
                    Sexp::Int(id) if *id >= 0 => Some(*id),
                    _ => None,
                };
            }
            other => call.block = self.operand(other)?,
        }
        Ok(call)
    }

    /// Transfer control to compiled code. Every cached variable is written
    /// back first; `self` is reloaded afterwards.
    pub(super) fn invoke(&mut self, target: Target, call: CallArgs) -> Result<()> {
        self.branch_point()?;
        let resume = match call.break_id {
            Some(id) => Some(self.break_site(id)?),
            None => None,
        };
        match call.splat {
            Some(array) => match &target {
                Target::Send(name) => {
                    let off = Operand::addr(voff_symbol(name));
                    self.ccall("__splat_call", &[call.recv, call.block, off, array])?;
                }
                Target::Direct(label) => {
                    let f = Operand::addr(label.as_str());
                    self.ccall("__splat_super", &[f, call.recv, call.block, array])?;
                }
            },
            None => {
                let size = align16(4 * (2 + call.args.len()));
                self.out.subl(size as i64, Reg::Esp);
                self.put(&call.recv, 0);
                self.put(&call.block, 4);
                for (i, a) in call.args.iter().enumerate() {
                    self.put(a, 8 + 4 * i as i32);
                }
                self.out.movl((call.args.len() + 2) as i64, Reg::Ebx);
                match &target {
                    Target::Send(name) => {
                        self.receiver_class(&call.recv);
                        self.out
                            .call_indirect(Operand::SymMem(voff_symbol(name), Reg::Eax));
                    }
                    Target::Direct(label) => self.out.call(label.as_str()),
                }
                self.out.addl(size as i64, Reg::Esp);
            }
        }
        if let Some(label) = resume {
            self.out.label(&label);
        }
        self.out.movl(Operand::mem(Reg::Ebp, 8), Reg::Esi);
        Ok(())
    }

    /// Store an outgoing argument word.
    fn put(&mut self, op: &Operand, disp: i32) {
        let dst = Operand::mem(Reg::Esp, disp);
        if direct(op) {
            self.out.movl(op.clone(), dst);
        } else {
            self.out.movl(op.clone(), Reg::Eax);
            self.out.movl(Reg::Eax, dst);
        }
    }

    /// Class of the receiver stored at `0(%esp)` into `%eax`. Fixnums
    /// dispatch through `Integer`.
    fn receiver_class(&mut self, recv: &Operand) {
        match recv {
            Operand::Imm(v) if v & 1 == 1 => self.out.movl(Operand::addr("Integer"), Reg::Eax),
            Operand::Addr(object) => self.out.movl(Operand::abs(object.as_str()), Reg::Eax),
            _ => {
                let heap = self.new_label("obj");
                let done = self.new_label("cls");
                self.out.movl(Operand::mem(Reg::Esp, 0), Reg::Eax);
                self.out.testl(1i64, Reg::Eax);
                self.out.jcc("jz", &heap);
                self.out.movl(Operand::addr("Integer"), Reg::Eax);
                self.out.jmp(&done);
                self.out.label(&heap);
                self.out.movl(Operand::mem(Reg::Eax, 0), Reg::Eax);
                self.out.label(&done);
            }
        }
    }

    /// Record the stack pointer for a `break` out of the block passed to
    /// the call being emitted; returns the label the break resumes at.
    fn break_site(&mut self, id: i64) -> Result<String> {
        if !self.shared.break_sites.insert(id) {
            return Err(emit_error(
                format!("break target {id} emitted twice"),
                self.func.span,
            ));
        }
        let disp = self.temp_disp();
        self.out.directive(format!(".equ\t__brk_sp_{id}, {disp}"));
        self.out.movl(Reg::Esp, Operand::mem(Reg::Ebp, disp));
        Ok(format!(".Lbrk_{id}"))
    }

    // ── Blocks ──

    /// `[:proc_new, :label, env, break_id]`: a Proc over the lifted
    /// function, the environment, `self` and this frame.
    pub(super) fn proc_new(&mut self, node: &Node) -> Result<()> {
        let label = method_name(node, 0)?;
        self.expr(node.child(1))?;
        self.ccall(
            "__new_proc",
            &[
                Operand::addr(label),
                Operand::Reg(Reg::Eax),
                Operand::Reg(Reg::Esi),
                Operand::Reg(Reg::Ebp),
            ],
        )
    }

    // ── Collections ──

    pub(super) fn array(&mut self, node: &Node) -> Result<()> {
        let mark = self.mark();
        let mut args = vec![Operand::Imm(node.children.len() as i64)];
        for item in &node.children {
            let op = self.operand(item)?;
            args.push(op);
        }
        self.ccall("__new_array", &args)?;
        self.release(mark);
        Ok(())
    }

    pub(super) fn hash(&mut self, node: &Node) -> Result<()> {
        let mark = self.mark();
        let mut args = vec![Operand::Imm(node.children.len() as i64)];
        for pair in &node.children {
            let [k, v] = pair.children() else {
                return Err(emit_error("malformed hash entry", node.span));
            };
            let k = self.operand(k)?;
            args.push(k);
            let v = self.operand(v)?;
            args.push(v);
        }
        self.ccall("__new_hash", &args)?;
        self.release(mark);
        Ok(())
    }
}

/// Operand that can be stored to memory without going through `%eax`.
fn direct(op: &Operand) -> bool {
    matches!(op, Operand::Reg(_) | Operand::Imm(_) | Operand::Addr(_))
}

pub(super) fn method_name(node: &Node, i: usize) -> Result<&str> {
    node.child(i)
        .as_name()
        .ok_or_else(|| emit_error(format!("malformed {} node", node.tag.as_str()), node.span))
}
