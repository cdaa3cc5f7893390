/// Assembly text output.
///
/// The emitter writes [`Line`]s into an [`Output`]. Function bodies go to a
/// [`Recorded`] buffer first: the prologue depends on how many stack slots
/// the body ended up using, so it is emitted afterwards and the body is
/// replayed behind it.
use std::fmt;

use parser::quoted::escape_bytes;

use crate::regalloc::Reg;

/// An AT&T operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    /// `$n`
    Imm(i64),
    /// `$label`: address of a symbol.
    Addr(String),
    /// `disp(%base)`
    Mem(Reg, i32),
    /// `symbol(%base)`: displacement given by an assembler symbol.
    SymMem(String, Reg),
    /// `label`: the word stored at a symbol.
    Abs(String),
    /// `*operand` for indirect calls and jumps.
    Indirect(Box<Operand>),
}

impl Operand {
    pub fn mem(base: Reg, disp: i32) -> Self {
        Self::Mem(base, disp)
    }

    pub fn addr(label: impl Into<String>) -> Self {
        Self::Addr(label.into())
    }

    pub fn abs(label: impl Into<String>) -> Self {
        Self::Abs(label.into())
    }

    pub fn indirect(self) -> Self {
        Self::Indirect(Box::new(self))
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Self::Reg(r)
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Self::Imm(n)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(r) => write!(f, "{r}"),
            Self::Imm(n) => write!(f, "${n}"),
            Self::Addr(l) => write!(f, "${l}"),
            Self::Mem(base, 0) => write!(f, "({base})"),
            Self::Mem(base, d) => write!(f, "{d}({base})"),
            Self::SymMem(s, base) => write!(f, "{s}({base})"),
            Self::Abs(l) => write!(f, "{l}"),
            Self::Indirect(o) => write!(f, "*{o}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Ins(&'static str, Vec<Operand>),
    Label(String),
    Directive(String),
    Comment(String),
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ins(op, ops) if ops.is_empty() => write!(f, "\t{op}"),
            Self::Ins(op, ops) => {
                write!(f, "\t{op}\t")?;
                for (i, o) in ops.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{o}")?;
                }
                Ok(())
            }
            Self::Label(l) => write!(f, "{l}:"),
            Self::Directive(d) => write!(f, "\t{d}"),
            Self::Comment(c) => write!(f, "\t# {c}"),
        }
    }
}

/// Sink for assembly lines.
pub trait Output {
    fn line(&mut self, line: Line);
}

/// Instruction helpers for every [`Output`].
pub trait Emit: Output {
    fn ins(&mut self, op: &'static str, ops: Vec<Operand>) {
        self.line(Line::Ins(op, ops));
    }

    fn label(&mut self, name: &str) {
        self.line(Line::Label(name.to_string()));
    }

    fn directive(&mut self, text: impl Into<String>) {
        self.line(Line::Directive(text.into()));
    }

    fn comment(&mut self, text: impl Into<String>) {
        self.line(Line::Comment(text.into()));
    }

    fn movl(&mut self, src: impl Into<Operand>, dst: impl Into<Operand>) {
        self.ins("movl", vec![src.into(), dst.into()]);
    }

    fn leal(&mut self, src: Operand, dst: Reg) {
        self.ins("leal", vec![src, dst.into()]);
    }

    fn addl(&mut self, src: impl Into<Operand>, dst: impl Into<Operand>) {
        self.ins("addl", vec![src.into(), dst.into()]);
    }

    fn subl(&mut self, src: impl Into<Operand>, dst: impl Into<Operand>) {
        self.ins("subl", vec![src.into(), dst.into()]);
    }

    fn cmpl(&mut self, src: impl Into<Operand>, dst: impl Into<Operand>) {
        self.ins("cmpl", vec![src.into(), dst.into()]);
    }

    fn testl(&mut self, src: impl Into<Operand>, dst: impl Into<Operand>) {
        self.ins("testl", vec![src.into(), dst.into()]);
    }

    fn pushl(&mut self, src: impl Into<Operand>) {
        self.ins("pushl", vec![src.into()]);
    }

    fn popl(&mut self, dst: Reg) {
        self.ins("popl", vec![dst.into()]);
    }

    fn call(&mut self, target: impl Into<String>) {
        self.ins("call", vec![Operand::Abs(target.into())]);
    }

    fn call_indirect(&mut self, target: Operand) {
        self.ins("call", vec![target.indirect()]);
    }

    fn jmp(&mut self, target: &str) {
        self.ins("jmp", vec![Operand::abs(target)]);
    }

    /// Conditional jump, `cc` one of `e ne l le g ge o z nz`.
    fn jcc(&mut self, cc: &'static str, target: &str) {
        self.ins(cc, vec![Operand::abs(target)]);
    }
}

impl<T: Output + ?Sized> Emit for T {}

/// Whole assembly file under construction.
#[derive(Debug, Default)]
pub struct TextOutput {
    text: String,
}

impl TextOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&mut self, text: &str) {
        self.text.push_str(text);
        self.text.push('\n');
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Output for TextOutput {
    fn line(&mut self, line: Line) {
        self.text.push_str(&line.to_string());
        self.text.push('\n');
    }
}

/// Lines buffered for later replay.
#[derive(Debug, Default, Clone)]
pub struct Recorded {
    lines: Vec<Line>,
}

impl Recorded {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn replay(self, out: &mut impl Output) {
        for line in self.lines {
            out.line(line);
        }
    }
}

impl Output for Recorded {
    fn line(&mut self, line: Line) {
        self.lines.push(line);
    }
}

/// `.asciz` directive for `bytes`. The escaping is the lexer's own, so the
/// emitted text reads back as the same string literal.
pub fn asciz(bytes: &[u8]) -> String {
    format!(".asciz \"{}\"", escape_bytes(bytes))
}

/// Round `n` up to a multiple of 16.
pub fn align16(n: usize) -> usize {
    (n + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use parser::{Lexer, TokenKind};
    use proptest::prelude::*;

    #[test]
    fn operands_use_att_syntax() {
        assert_eq!(Operand::mem(Reg::Ebp, -8).to_string(), "-8(%ebp)");
        assert_eq!(Operand::mem(Reg::Eax, 0).to_string(), "(%eax)");
        assert_eq!(Operand::Imm(3).to_string(), "$3");
        assert_eq!(Operand::addr("__nil").to_string(), "$__nil");
        assert_eq!(
            Operand::SymMem("__voff__puts".into(), Reg::Ecx).indirect().to_string(),
            "*__voff__puts(%ecx)"
        );
    }

    #[test]
    fn lines_are_tab_indented() {
        let mut out = TextOutput::new();
        out.label("main");
        out.movl(Reg::Esp, Reg::Ebp);
        out.ins("ret", vec![]);
        out.comment("done");
        assert_eq!(out.as_str(), "main:\n\tmovl\t%esp, %ebp\n\tret\n\t# done\n");
    }

    #[test]
    fn recorded_lines_replay_in_order() {
        let mut body = Recorded::new();
        body.movl(1i64, Reg::Eax);
        body.jmp(".L1");
        let mut out = TextOutput::new();
        out.pushl(Reg::Ebp);
        body.replay(&mut out);
        assert_eq!(out.as_str(), "\tpushl\t%ebp\n\tmovl\t$1, %eax\n\tjmp\t.L1\n");
    }

    #[test]
    fn alignment() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(12), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }

    fn relex(bytes: &[u8]) -> Option<Vec<u8>> {
        let text = asciz(bytes);
        let literal = text.strip_prefix(".asciz ")?;
        match Lexer::new(literal).next_token().ok()?.kind {
            TokenKind::Str(b) => Some(b),
            _ => None,
        }
    }

    #[test]
    fn string_data_escapes() {
        assert_eq!(asciz(b"a\"b\n"), ".asciz \"a\\\"b\\n\"");
        assert_eq!(relex(b"#{x}"), Some(b"#{x}".to_vec()));
    }

    proptest! {
        #[test]
        fn escaped_strings_lex_back(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(relex(&bytes), Some(bytes));
        }
    }
}
