/// Inline integer arithmetic.
///
/// `a op b` for the operators below gets a fast path when both operands
/// are fixnums. A fixnum `n` is the word `2n+1`, so
///
/// ```text
///   a + b  =  (a - 1) + b          a - b  =  (a - b) | 1
///   a * b  =  (a >> 1) * (b - 1) | 1
/// ```
///
/// and comparisons work on the tagged words directly. Overflow (`jo`)
/// recomputes the exact result in 64 bits and boxes it with
/// `__int_from_i64`. A heap integer receiver goes to the runtime's
/// heap-integer helpers; anything else is an ordinary send.
use parser::Sexp;

use super::FnEmitter;
use super::calls::{CallArgs, Target};
use crate::asm::{Emit, Operand};
use crate::error::Result;
use crate::regalloc::Reg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArithOp {
    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl ArithOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
        }
    }

    /// Jump taken when the comparison holds.
    fn condition(self) -> Option<&'static str> {
        match self {
            Self::Lt => Some("jl"),
            Self::Le => Some("jle"),
            Self::Gt => Some("jg"),
            Self::Ge => Some("jge"),
            Self::Eq => Some("je"),
            _ => None,
        }
    }

    /// Runtime helper for heap operands.
    fn helper(self) -> Option<&'static str> {
        match self {
            Self::Add => Some("__int_add"),
            Self::Sub => Some("__int_sub"),
            Self::Mul => Some("__int_mul"),
            // Equality with a non-integer is false, not an error: let the
            // receiver's `==` decide.
            Self::Eq => None,
            _ => Some("__int_cmp"),
        }
    }
}

impl FnEmitter<'_> {
    pub(super) fn arith(&mut self, op: ArithOp, recv: &Sexp, arg: &Sexp) -> Result<()> {
        let mark = self.mark();
        let a = self.stashed(recv)?;
        let b = self.stashed(arg)?;
        let slow = self.new_label("slow");
        let overflow = self.new_label("ovf");
        let done = self.new_label("done");

        self.branch_point()?;
        self.out.movl(a.clone(), Reg::Ecx);
        self.out.movl(b.clone(), Reg::Edx);
        self.out.movl(Reg::Ecx, Reg::Eax);
        self.out.ins("andl", vec![Reg::Edx.into(), Reg::Eax.into()]);
        self.out.testl(1i64, Reg::Eax);
        self.out.jcc("jz", &slow);

        match op.condition() {
            Some(cc) => {
                self.out.cmpl(Reg::Edx, Reg::Ecx);
                self.boolean(cc, &done);
            }
            None => {
                self.fast(op, &overflow);
                self.out.jmp(&done);
                self.out.label(&overflow);
                self.wide(op);
                self.ccall("__int_from_i64", &[Reg::Eax.into(), Reg::Edx.into()])?;
                self.out.jmp(&done);
            }
        }

        self.out.label(&slow);
        if let Some(helper) = op.helper() {
            let heap = self.new_label("heap");
            let send = self.new_label("send");
            // A fixnum receiver with a non-fixnum argument still belongs
            // to the integer runtime.
            self.out.testl(1i64, Reg::Ecx);
            self.out.jcc("jnz", &heap);
            self.out.cmpl(Operand::addr("Integer"), Operand::mem(Reg::Ecx, 0));
            self.out.jcc("jne", &send);
            self.out.label(&heap);
            self.ccall(helper, &[a.clone(), b.clone()])?;
            match op.condition() {
                Some(cc) => {
                    self.out.cmpl(0i64, Reg::Eax);
                    self.boolean(cc, &done);
                }
                None => self.out.jmp(&done),
            }
            self.out.label(&send);
        }
        self.invoke(Target::Send(op.name().to_string()), CallArgs::plain(a, vec![b]))?;
        self.out.label(&done);
        self.release(mark);
        Ok(())
    }

    /// Always a stack slot, so the slow paths can reread it.
    fn stashed(&mut self, e: &Sexp) -> Result<Operand> {
        match super::calls::immediate(e) {
            Some(op @ Operand::Imm(_)) => Ok(op),
            _ => {
                self.expr(e)?;
                Ok(self.stash())
            }
        }
    }

    /// `%eax` = true when the flags satisfy `cc`, false otherwise; then
    /// jump to `done`.
    fn boolean(&mut self, cc: &'static str, done: &str) {
        let yes = self.new_label("true");
        self.out.jcc(cc, &yes);
        self.out.movl(Operand::addr("__false"), Reg::Eax);
        self.out.jmp(done);
        self.out.label(&yes);
        self.out.movl(Operand::addr("__true"), Reg::Eax);
        self.out.jmp(done);
    }

    /// Tagged fast path; `a` in `%ecx`, `b` in `%edx`.
    fn fast(&mut self, op: ArithOp, overflow: &str) {
        match op {
            ArithOp::Add => {
                self.out.leal(Operand::mem(Reg::Ecx, -1), Reg::Eax);
                self.out.addl(Reg::Edx, Reg::Eax);
                self.out.jcc("jo", overflow);
            }
            ArithOp::Sub => {
                self.out.movl(Reg::Ecx, Reg::Eax);
                self.out.subl(Reg::Edx, Reg::Eax);
                self.out.jcc("jo", overflow);
                self.out.ins("orl", vec![Operand::Imm(1), Reg::Eax.into()]);
            }
            ArithOp::Mul => {
                self.out.movl(Reg::Ecx, Reg::Eax);
                self.out.ins("sarl", vec![Operand::Imm(1), Reg::Eax.into()]);
                self.out.leal(Operand::mem(Reg::Edx, -1), Reg::Ebx);
                self.out.ins("imull", vec![Reg::Ebx.into(), Reg::Eax.into()]);
                self.out.jcc("jo", overflow);
                self.out.ins("orl", vec![Operand::Imm(1), Reg::Eax.into()]);
            }
            _ => {}
        }
    }

    /// Exact result as a 64-bit value in `%edx:%eax`.
    fn wide(&mut self, op: ArithOp) {
        self.out.movl(Reg::Ecx, Reg::Eax);
        self.out.ins("sarl", vec![Operand::Imm(1), Reg::Eax.into()]);
        self.out.movl(Reg::Edx, Reg::Ebx);
        self.out.ins("sarl", vec![Operand::Imm(1), Reg::Ebx.into()]);
        match op {
            ArithOp::Mul => self.out.ins("imull", vec![Reg::Ebx.into()]),
            ArithOp::Sub => {
                self.out.subl(Reg::Ebx, Reg::Eax);
                self.out.ins("cltd", vec![]);
            }
            _ => {
                self.out.addl(Reg::Ebx, Reg::Eax);
                self.out.ins("cltd", vec![]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn arith_text(src: &str) -> String {
        let asm = assembly(src);
        function_text(&asm, "__unit_0")
    }

    #[test]
    fn operator_names_round_trip() {
        for name in ["+", "-", "*", "<", "<=", ">", ">=", "=="] {
            let op = ArithOp::from_name(name).unwrap_or_else(|| panic!("{name}"));
            assert_eq!(op.name(), name);
        }
        assert_eq!(ArithOp::from_name("/"), None);
    }

    #[test]
    fn addition_checks_tags_and_overflow() {
        let f = arith_text("a = 1\nb = a + 2");
        assert!(f.contains("\tandl\t%edx, %eax\n\ttestl\t$1, %eax\n\tjz\t.Lslow"), "{f}");
        assert!(f.contains("\tleal\t-1(%ecx), %eax\n\taddl\t%edx, %eax\n\tjo\t.Lovf"), "{f}");
        assert!(f.contains("\tcltd\n"), "{f}");
        assert!(f.contains("\tcall\t__int_from_i64\n"), "{f}");
        assert!(f.contains("\tcall\t__int_add\n"), "{f}");
        assert!(f.contains("\tcall\t*__voff___plus_(%eax)\n"), "{f}");
    }

    #[test]
    fn multiplication_untags_one_side() {
        let f = arith_text("a = 3\nb = a * a");
        assert!(f.contains("\tsarl\t$1, %eax\n\tleal\t-1(%edx), %ebx\n\timull\t%ebx, %eax\n"), "{f}");
        assert!(f.contains("\timull\t%ebx\n"), "{f}");
        assert!(f.contains("\tcall\t__int_mul\n"), "{f}");
    }

    #[test]
    fn comparisons_produce_booleans() {
        let f = arith_text("a = 1\na < 2");
        assert!(f.contains("\tcmpl\t%edx, %ecx\n\tjl\t.Ltrue"), "{f}");
        assert!(
            f.contains("\tcall\t__int_cmp\n\taddl\t$16, %esp\n\tcmpl\t$0, %eax\n\tjl\t.Ltrue"),
            "{f}"
        );
    }

    #[test]
    fn equality_falls_back_to_a_send() {
        let f = arith_text("a = 1\na == 2");
        assert!(!f.contains("__int_cmp"), "{f}");
        assert!(f.contains("\tcall\t*__voff___eq__eq_(%eax)\n"), "{f}");
    }

    #[test]
    fn literal_operands_are_folded_not_emitted() {
        let f = arith_text("x = 2 + 3");
        assert!(!f.contains("__int_add"), "{f}");
        assert!(f.contains("\tmovl\t$11, %eax\n"), "{f}");
    }
}
