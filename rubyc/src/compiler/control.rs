/// Control flow, exceptions and definitions.
use parser::{Node, Sexp, Tag};

use super::calls::{CallArgs, Target, method_name};
use super::{FnEmitter, Loop, Region, emit_error, nil};
use crate::asm::{Emit, Operand};
use crate::classes::voff_symbol;
use crate::error::Result;
use crate::regalloc::{Reg, with_register};

impl FnEmitter<'_> {
    // ── Conditionals ──

    pub(super) fn if_(&mut self, node: &Node) -> Result<()> {
        let otherwise = self.new_label("else");
        let done = self.new_label("endif");
        self.expr(node.child(0))?;
        self.branch_if_false(&otherwise)?;
        self.expr(node.child(1))?;
        self.jump(&done)?;
        self.bind(&otherwise)?;
        self.expr(node.child(2))?;
        self.bind(&done)
    }

    /// `and`/`or` yield the deciding operand.
    pub(super) fn logical(&mut self, node: &Node) -> Result<()> {
        let done = self.new_label("logic");
        self.expr(node.child(0))?;
        if node.tag == Tag::And {
            self.branch_if_false(&done)?;
        } else {
            self.branch_if_true(&done)?;
        }
        self.expr(node.child(1))?;
        self.bind(&done)
    }

    pub(super) fn not(&mut self, node: &Node) -> Result<()> {
        let falsy = self.new_label("falsy");
        let done = self.new_label("not");
        self.expr(node.child(0))?;
        self.branch_if_false(&falsy)?;
        self.out.movl(Operand::addr("__false"), Reg::Eax);
        self.out.jmp(&done);
        self.out.label(&falsy);
        self.out.movl(Operand::addr("__true"), Reg::Eax);
        self.out.label(&done);
        Ok(())
    }

    // ── Loops ──

    /// `while cond; body; end`. The value is nil unless a `break` carries
    /// one.
    pub(super) fn while_(&mut self, node: &Node) -> Result<()> {
        let top = self.new_label("while");
        let finished = self.new_label("wend");
        let exit = self.new_label("wbrk");
        self.bind(&top)?;
        self.expr(node.child(0))?;
        self.branch_if_false(&finished)?;
        self.loop_body(node.child(1), &top, &exit)?;
        self.jump(&top)?;
        self.bind(&finished)?;
        self.out.movl(nil(), Reg::Eax);
        self.bind(&exit)
    }

    /// `begin; body; end while cond`: the body runs before the first test.
    pub(super) fn do_while(&mut self, node: &Node) -> Result<()> {
        let top = self.new_label("do");
        let test = self.new_label("dotest");
        let finished = self.new_label("doend");
        let exit = self.new_label("dobrk");
        self.bind(&top)?;
        self.loop_body(node.child(1), &test, &exit)?;
        self.bind(&test)?;
        self.expr(node.child(0))?;
        self.branch_if_false(&finished)?;
        self.jump(&top)?;
        self.bind(&finished)?;
        self.out.movl(nil(), Reg::Eax);
        self.bind(&exit)
    }

    fn loop_body(&mut self, body: &Sexp, next: &str, exit: &str) -> Result<()> {
        self.loops.push(Loop {
            next: next.to_string(),
            exit: exit.to_string(),
            regions: self.regions.len(),
        });
        let result = self.expr(body);
        self.loops.pop();
        result
    }

    // ── Exits ──

    /// Run the exits of protected regions down to `depth`: unlink their
    /// handlers and run their `ensure` bodies. `%eax` is preserved.
    fn leave_regions(&mut self, depth: usize) -> Result<()> {
        if self.regions.len() <= depth {
            return Ok(());
        }
        let mark = self.mark();
        let value = self.stash();
        for i in (depth..self.regions.len()).rev() {
            let region = self.regions[i].clone();
            if let Some(record) = region.handler {
                self.unlink_handler(record)?;
            }
            if !region.ensure.is_nil() {
                let outer = self.regions.split_off(i);
                let result = self.expr(&region.ensure);
                self.regions.extend(outer);
                result?;
            }
        }
        self.out.movl(value, Reg::Eax);
        self.release(mark);
        Ok(())
    }

    /// `[:return, v]` leaves this function; `[:return, v, frame]` leaves
    /// the method owning `frame`, from inside one of its blocks.
    pub(super) fn return_(&mut self, node: &Node) -> Result<()> {
        self.expr(node.child(0))?;
        match node.child(1) {
            Sexp::Nil => {
                self.leave_regions(0)?;
                self.epilogue();
                Ok(())
            }
            frame => {
                self.unwind(frame, node)?;
                self.epilogue();
                Ok(())
            }
        }
    }

    /// Switch to the stack frame stored in slot 1 of `frame`, dropping the
    /// exception handlers of every frame in between. This function's own
    /// regions are left first. The value in `%eax` survives.
    fn unwind(&mut self, frame: &Sexp, node: &Node) -> Result<()> {
        self.leave_regions(0)?;
        let mark = self.mark();
        let value = self.stash();
        self.load_frame(frame, Reg::Eax, node.span)?;
        self.out.movl(Operand::mem(Reg::Eax, 4), Reg::Eax);
        let target = self.stash();
        self.ccall("__unwind_to", &[target.clone()])?;
        self.branch_point()?;
        self.out.movl(value, Reg::Eax);
        self.out.movl(target, Reg::Ebp);
        self.release(mark);
        Ok(())
    }

    /// `[:break, v]` leaves the innermost loop; `[:break, v, frame, id]`
    /// leaves the call the block was passed to.
    pub(super) fn break_(&mut self, node: &Node) -> Result<()> {
        self.expr(node.child(0))?;
        match node.child(1) {
            Sexp::Nil => {
                let Some(target) = self.loops.last().cloned() else {
                    return Err(emit_error("break outside of a loop or block", node.span));
                };
                self.leave_regions(target.regions)?;
                self.jump(&target.exit)
            }
            frame => {
                let Sexp::Int(id) = node.child(2) else {
                    return Err(emit_error("malformed break node", node.span));
                };
                self.unwind(frame, node)?;
                self.out
                    .movl(Operand::SymMem(format!("__brk_sp_{id}"), Reg::Ebp), Reg::Esp);
                self.out.jmp(&format!(".Lbrk_{id}"));
                self.unreachable();
                Ok(())
            }
        }
    }

    pub(super) fn next(&mut self, node: &Node) -> Result<()> {
        let Some(target) = self.loops.last().cloned() else {
            return Err(emit_error("next outside of a loop or block", node.span));
        };
        self.expr(node.child(0))?;
        self.leave_regions(target.regions)?;
        self.jump(&target.next)
    }

    pub(super) fn retry(&mut self, node: &Node) -> Result<()> {
        let found = self
            .regions
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, r)| r.retry.clone().map(|label| (i, label)));
        let Some((depth, label)) = found else {
            return Err(emit_error("retry outside of a rescue clause", node.span));
        };
        self.leave_regions(depth + 1)?;
        self.jump(&label)
    }

    // ── Exceptions ──

    /// `[:begin, body, exc, [:rescue, cond, body]..., else, ensure]`.
    pub(super) fn begin(&mut self, node: &Node) -> Result<()> {
        let n = node.children.len();
        if n < 4 {
            return self.expr(node.child(0));
        }
        let body = node.child(0);
        let exc = node.child(1);
        let clauses = &node.children[2..n - 2];
        let else_body = node.child(n - 2);
        let ensure = node.child(n - 1).clone();

        if clauses.is_empty() {
            self.protected(body, Region {
                ensure: ensure.clone(),
                handler: None,
                retry: None,
            })?;
            self.protected(else_body, Region {
                ensure: ensure.clone(),
                handler: None,
                retry: None,
            })?;
            return self.run_ensure(&ensure);
        }

        let retry = self.new_label("retry");
        let rescue = self.new_label("rescue");
        let done = self.new_label("endbegin");
        let record = self.record(4);

        self.bind(&retry)?;
        self.install_handler(record, &rescue);
        self.protected(body, Region {
            ensure: ensure.clone(),
            handler: Some(record),
            retry: None,
        })?;
        self.unlink_handler(record)?;
        if !else_body.is_nil() {
            self.protected(else_body, Region {
                ensure: ensure.clone(),
                handler: None,
                retry: None,
            })?;
        }
        self.run_ensure(&ensure)?;
        self.jump(&done)?;

        // `__raise` unlinked the record and restored this frame.
        self.bind(&rescue)?;
        self.out.movl(Operand::mem(Reg::Ebp, 8), Reg::Esi);
        self.store(exc, node.span)?;
        for clause in clauses {
            let Some(clause) = clause.as_node().filter(|c| c.tag == Tag::Rescue) else {
                return Err(emit_error("malformed rescue clause", node.span));
            };
            let next = self.new_label("nextrescue");
            self.expr(clause.child(0))?;
            self.branch_if_false(&next)?;
            self.protected(clause.child(1), Region {
                ensure: ensure.clone(),
                handler: None,
                retry: Some(retry.clone()),
            })?;
            self.run_ensure(&ensure)?;
            self.jump(&done)?;
            self.bind(&next)?;
        }
        self.run_ensure(&ensure)?;
        let mark = self.mark();
        self.expr(exc)?;
        let e = self.stash();
        self.ccall("__reraise", &[e])?;
        self.release(mark);
        self.unreachable();
        self.bind(&done)
    }

    fn protected(&mut self, body: &Sexp, region: Region) -> Result<()> {
        self.regions.push(region);
        let result = self.expr(body);
        self.regions.pop();
        result
    }

    fn run_ensure(&mut self, ensure: &Sexp) -> Result<()> {
        if ensure.is_nil() {
            return Ok(());
        }
        let mark = self.mark();
        let value = self.stash();
        self.expr(ensure)?;
        self.out.movl(value, Reg::Eax);
        self.release(mark);
        Ok(())
    }

    /// Link a handler record `[previous, %ebp, %esp, handler]` at frame
    /// offset `record`.
    fn install_handler(&mut self, record: i32, handler: &str) {
        let at = |k: i32| Operand::mem(Reg::Ebp, record + 4 * k);
        self.out.movl(Operand::abs("__handler_top"), Reg::Eax);
        self.out.movl(Reg::Eax, at(0));
        self.out.movl(Reg::Ebp, at(1));
        self.out.movl(Reg::Esp, at(2));
        self.out.movl(Operand::addr(handler), at(3));
        self.out.leal(at(0), Reg::Eax);
        self.out.movl(Reg::Eax, Operand::abs("__handler_top"));
    }

    fn unlink_handler(&mut self, record: i32) -> Result<()> {
        with_register(self, |this, r| {
            this.out.movl(Operand::mem(Reg::Ebp, record), r);
            this.out.movl(r, Operand::abs("__handler_top"));
            Ok(())
        })
    }

    // ── Definitions ──

    /// `[:defm, :name, :label, :install]`. Static methods are already in
    /// the vtables; `self` installs into the class object at hand.
    pub(super) fn defm(&mut self, node: &Node) -> Result<()> {
        let name = method_name(node, 0)?;
        let label = method_name(node, 1)?;
        match node.child(2).as_name() {
            Some("static") => {}
            Some("self") => {
                self.out.movl(
                    Operand::addr(label),
                    Operand::SymMem(voff_symbol(name), Reg::Esi),
                );
            }
            _ => return Err(emit_error("malformed method definition", node.span)),
        }
        self.symbol(name)
    }

    /// `[:defs, recv, :name, :label]`: a method on one object's
    /// eigenclass.
    pub(super) fn defs(&mut self, node: &Node) -> Result<()> {
        let name = method_name(node, 1)?;
        let label = method_name(node, 2)?;
        self.expr(node.child(0))?;
        self.ccall("__new_eigenclass", &[Reg::Eax.into()])?;
        self.out.movl(
            Operand::addr(label),
            Operand::SymMem(voff_symbol(name), Reg::Eax),
        );
        self.symbol(name)
    }

    /// `[:class, :label, :body, site]`: run the body once, with `self` the
    /// class object; the value is the class.
    pub(super) fn class_site(&mut self, node: &Node) -> Result<()> {
        let class = method_name(node, 0)?;
        let body = method_name(node, 1)?;
        let Sexp::Int(site) = node.child(2) else {
            return Err(emit_error("malformed class node", node.span));
        };
        let once = Operand::abs(format!("__once_{site}"));
        let done = self.new_label("defined");
        self.branch_point()?;
        self.out.cmpl(0i64, once.clone());
        self.out.jcc("jne", &done);
        self.out.movl(1i64, once);
        self.invoke(
            Target::Direct(body.to_string()),
            CallArgs::plain(Operand::addr(class), Vec::new()),
        )?;
        self.bind(&done)?;
        self.out.movl(Operand::addr(class), Reg::Eax);
        Ok(())
    }

    /// `[:sclass, obj, :body]`: run the body with `self` the object's
    /// eigenclass.
    pub(super) fn singleton_body(&mut self, node: &Node) -> Result<()> {
        let body = method_name(node, 1)?;
        let mark = self.mark();
        self.expr(node.child(0))?;
        self.ccall("__new_eigenclass", &[Reg::Eax.into()])?;
        let eigen = self.stash();
        self.invoke(
            Target::Direct(body.to_string()),
            CallArgs::plain(eigen, Vec::new()),
        )?;
        self.release(mark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;

    fn main_text(src: &str) -> String {
        function_text(&assembly(src), "__unit_0")
    }

    // ── Conditionals and loops ──

    #[test]
    fn conditionals_test_nil_and_false() {
        let f = main_text("x = 1\ny = x ? 2 : 3");
        assert!(
            f.contains("\tcmpl\t$__nil, %eax\n\tje\t.Lelse"),
            "{f}"
        );
        assert!(f.contains("\tcmpl\t$__false, %eax\n\tje\t.Lelse"), "{f}");
        assert!(f.contains("\n.Lendif"), "{f}");
    }

    #[test]
    fn cached_variables_are_written_back_before_branches() {
        let f = main_text("x = 1\nwhile x < 10\n  x = x + 1\nend");
        let top = f.find("\n.Lwhile").unwrap_or_else(|| panic!("{f}"));
        let before = &f[..=top];
        assert!(before.contains("\tmovl\t%edx, -8(%ebp)\n"), "{f}");
    }

    #[test]
    fn while_loops_yield_nil() {
        let f = main_text("x = nil\nwhile x\nend");
        assert!(f.contains("\tmovl\t$__nil, %eax\n.Lwbrk"), "{f}");
    }

    #[test]
    fn loop_break_jumps_to_the_exit() {
        let f = main_text("while true\n  break 5\nend");
        assert!(f.contains("\tmovl\t$11, %eax\n\tjmp\t.Lwbrk"), "{f}");
    }

    #[test]
    fn do_while_runs_the_body_first() {
        let f = main_text("i = 0\nbegin\n  i += 1\nend while i < 3");
        let body = f.find("\n.Ldo").unwrap_or_else(|| panic!("{f}"));
        let test = f.find("\n.Ldotest").unwrap_or_else(|| panic!("{f}"));
        assert!(body < test, "{f}");
    }

    #[test]
    fn negation_yields_booleans() {
        let f = main_text("x = nil\n!x");
        assert!(f.contains("\tmovl\t$__false, %eax\n\tjmp\t.Lnot"), "{f}");
    }

    // ── Non-local exits ──

    #[test]
    fn block_return_unwinds_to_the_method() {
        let asm = assembly("def find(xs)\n  xs.each { |x| return x if x > 1 }\n  nil\nend");
        let block = function_text(&asm, "__unit_0_block_2");
        assert!(block.contains("\tmovl\t4(%eax), %eax\n"), "{block}");
        assert!(block.contains("\tcall\t__unwind_to\n"), "{block}");
        assert!(block.contains("%ebp\n\tleave\n\tret\n"), "{block}");
    }

    // ── Exceptions ──

    #[test]
    fn rescue_installs_a_handler_record() {
        let f = main_text("begin\n  raise \"x\"\nrescue => e\n  puts e\nend");
        assert!(f.contains("\tmovl\t__handler_top, %eax\n"), "{f}");
        assert!(f.contains("\tmovl\t$.Lrescue"), "{f}");
        assert!(f.contains("\tmovl\t%eax, __handler_top\n"), "{f}");
        assert!(f.contains("\tcall\t*__voff__is__a_p_(%eax)\n"), "{f}");
        assert!(f.contains("\tcall\t__reraise\n"), "{f}");
    }

    #[test]
    fn ensure_runs_on_every_exit() {
        let f = main_text("begin\n  foo\nrescue\n  bar\nensure\n  baz\nend");
        assert_eq!(f.matches("\tcall\t*__voff__baz(%eax)\n").count(), 3, "{f}");
    }

    #[test]
    fn retry_jumps_back_to_the_protected_body() {
        let f = main_text("begin\n  foo\nrescue\n  retry\nend");
        let retry = f.find("\n.Lretry").unwrap_or_else(|| panic!("{f}"));
        let label = f[retry + 1..].split(':').next().unwrap_or_default().to_string();
        assert!(f.contains(&format!("\tjmp\t{label}\n")), "{f}");
    }

    // ── Definitions ──

    #[test]
    fn class_bodies_run_once() {
        let f = main_text("class Foo\nend");
        assert!(f.contains("\tcmpl\t$0, __once_0\n\tjne\t.Ldefined"), "{f}");
        assert!(f.contains("\tmovl\t$Foo, (%esp)\n"), "{f}");
        assert!(f.contains("\tcall\t__classbody_Foo_0\n"), "{f}");
        assert!(f.contains("\tmovl\t$Foo, %eax\n"), "{f}");
    }

    #[test]
    fn singleton_definitions_use_eigenclasses() {
        let f = main_text("o = Object.new\ndef o.hi\n  1\nend");
        assert!(f.contains("\tcall\t__new_eigenclass\n"), "{f}");
        assert!(f.contains("(%eax)\n"), "{f}");
        assert!(f.contains("\tmovl\t$__sdef_"), "{f}");
    }
}
