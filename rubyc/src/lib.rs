//! # rubyc
//!
//! Ahead-of-time compiler from a Ruby-like language to 32-bit x86 assembly
//! in AT&T syntax. The output links against a separate runtime providing
//! the allocator, the builtin classes and the exception machinery.
//!
//! ## Pipeline
//!
//! ```text
//!  source ──▶ parser ──▶ transform ──────────────────────────▶ compiler ──▶ .s
//!                        desugar, fold, yields,               frames, calls,
//!                        classes, env (lifting)               regalloc, data
//! ```
//!
//! A [`Session`] compiles a prelude list and a main program into one
//! assembly unit; the units share classes, constants and the mangled
//! symbol registry.
//!
//! ```rust
//! let asm = rubyc::compile("puts 1 + 2").unwrap();
//! assert!(asm.contains("\tcall\t__runtime_init\n"));
//! ```

pub mod asm;
pub mod classes;
pub mod compiler;
pub mod error;
pub mod integer;
pub mod mangle;
pub mod regalloc;
pub mod transform;

use parser::{Lexer, TokenKind};

pub use error::{CompileError, Phase, Result};
use mangle::SymbolRegistry;
use transform::{SourceTree, TransformOptions};

/// Intermediate form printed instead of assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Tokens,
    Ast,
    Transformed,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Fold integer operations on literals.
    pub fold: bool,
    pub dump: Option<DumpMode>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            fold: true,
            dump: None,
        }
    }
}

/// One source file of a session.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub name: String,
    pub source: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Compilation session. Owns the registry of mangled symbols, which is
/// cleared at the start of every compilation.
#[derive(Debug, Default)]
pub struct Session {
    options: CompileOptions,
    symbols: SymbolRegistry,
}

impl Session {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            symbols: SymbolRegistry::new(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Number of symbols registered by the last compilation.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Compile `units` in order into one assembly text, or into the
    /// requested dump.
    pub fn compile(&mut self, units: &[SourceUnit]) -> Result<String> {
        self.symbols.clear();
        if self.options.dump == Some(DumpMode::Tokens) {
            return units
                .iter()
                .map(|u| dump_tokens(&u.source).map(|t| format!("== {} ==\n{t}", u.name)))
                .collect();
        }

        let mut trees = Vec::with_capacity(units.len());
        for unit in units {
            log::debug!("parsing {}", unit.name);
            let program = parser::parse_file(&unit.source, &unit.name)?;
            trees.push(SourceTree {
                name: unit.name.clone(),
                body: program.body,
                ids: program.ids,
            });
        }
        if self.options.dump == Some(DumpMode::Ast) {
            return Ok(trees
                .iter()
                .map(|t| format!("== {} ==\n{}\n", t.name, t.body))
                .collect());
        }

        let options = TransformOptions {
            fold: self.options.fold,
        };
        let program = transform::transform(trees, options, &mut self.symbols)?;
        if self.options.dump == Some(DumpMode::Transformed) {
            return Ok(transform::dump(&program));
        }

        log::debug!("emitting {} functions", program.functions.len());
        compiler::compile(&program)
    }
}

/// Compile one source text with default options.
pub fn compile(source: &str) -> Result<String> {
    Session::default().compile(&[SourceUnit::new("main.rb", source)])
}

/// One line per token: position, then the token.
pub fn dump_tokens(source: &str) -> Result<String> {
    let mut lexer = Lexer::new(source);
    let mut out = String::new();
    loop {
        let token = lexer.next_token()?;
        out.push_str(&format!("{}\t{}\n", token.span, token.kind));
        if token.kind == TokenKind::Eof {
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(options: CompileOptions) -> Session {
        Session::new(options)
    }

    fn compiled(src: &str) -> String {
        compile(src).unwrap_or_else(|e| panic!("{src:?}: {e}"))
    }

    // ── Whole programs ──

    #[test]
    fn block_parameter_call() {
        let asm = compiled("def foo(a, &b)\n  b ? b.call(a) : a\nend\nfoo(42) { |x| x + 1 }");
        assert!(asm.contains("\n__method_Object_foo:\n"), "{asm}");
        assert!(asm.contains("\tcall\t*__voff__call(%eax)\n"), "{asm}");
        assert!(asm.contains("\tcall\t__new_proc\n"), "{asm}");
    }

    #[test]
    fn recursive_lambda_shares_its_slot() {
        let asm = compiled("fact = lambda { |n| n <= 1 ? 1 : n * fact.call(n - 1) }\nputs fact.call(5)");
        let main = compiler::testing::function_text(&asm, "__unit_0");
        assert!(main.contains("\tcall\t__alloc_env\n"), "{main}");
        assert!(main.contains("\tmovl\t%eax, 8(%"), "{main}");
        let block = compiler::testing::function_text(&asm, "__unit_0_block_1");
        assert!(block.contains("\tmovl\t8(%eax), %eax\n"), "{block}");
    }

    #[test]
    fn counter_class() {
        let src = "\
class Counter
  attr_reader :count

  def initialize(start = 0)
    @count = start
  end

  def bump(by = 1)
    @count += by
    self
  end
end

c = Counter.new(2)
3.times { c.bump }
puts c.count
";
        let asm = compiled(src);
        assert!(asm.contains("\n__method_Counter_bump:\n"), "{asm}");
        assert!(asm.contains("\n__method_Counter_count:\n"), "{asm}");
        assert!(asm.contains("\t.globl\tCounter\nCounter:\n"), "{asm}");
    }

    #[test]
    fn exceptions_and_ensure() {
        let src = "\
def risky(n)
  raise ArgumentError, \"bad\" if n < 0
  n
end

begin
  risky(-1)
rescue ArgumentError => e
  puts e.message
ensure
  puts \"done\"
end
";
        let asm = compiled(src);
        assert!(asm.contains("__handler_top"), "{asm}");
        assert!(asm.contains("\tcall\t__reraise\n"), "{asm}");
    }

    #[test]
    fn nested_multiple_assignment() {
        let asm = compiled("a, (b, c) = 1, [2, 3]\nputs a + b + c");
        let main = compiler::testing::function_text(&asm, "__unit_0");
        let is_a = format!("\tcall\t*{}(", classes::voff_symbol("is_a?"));
        assert_eq!(main.matches(is_a.as_str()).count(), 1, "{main}");
    }

    // ── Sessions ──

    #[test]
    fn prelude_runs_first() {
        let mut s = session(CompileOptions::default());
        let units = [
            SourceUnit::new("prelude.rb", "class Helper\n  def hi\n    1\n  end\nend"),
            SourceUnit::new("main.rb", "Helper.new.hi"),
        ];
        let asm = s.compile(&units).unwrap_or_else(|e| panic!("{e}"));
        let first = asm.find("\tcall\t__unit_0\n").unwrap_or_else(|| panic!("{asm}"));
        let second = asm.find("\tcall\t__unit_1\n").unwrap_or_else(|| panic!("{asm}"));
        assert!(first < second, "{asm}");
    }

    #[test]
    fn registry_is_cleared_between_compilations() {
        let mut s = session(CompileOptions::default());
        let units = [SourceUnit::new("a.rb", "def f\nend")];
        s.compile(&units).unwrap_or_else(|e| panic!("{e}"));
        let after_first = s.symbol_count();
        s.compile(&units).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(s.symbol_count(), after_first);
    }

    // ── Dumps ──

    #[test]
    fn token_dump_lists_positions() {
        let text = dump_tokens("x = 1").unwrap_or_else(|e| panic!("{e}"));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4, "{text}");
        assert!(lines[0].ends_with("\tx"), "{text}");
        assert!(lines[3].ends_with("\t<eof>"), "{text}");
    }

    #[test]
    fn ast_dump_is_sexp_text() {
        let mut s = session(CompileOptions {
            dump: Some(DumpMode::Ast),
            ..CompileOptions::default()
        });
        let text = s
            .compile(&[SourceUnit::new("m.rb", "puts 1")])
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(text, "== m.rb ==\n[:do, [:call, :puts, [:args, 1], nil]]\n");
    }

    #[test]
    fn no_fold_keeps_literal_arithmetic() {
        let mut s = session(CompileOptions {
            fold: false,
            dump: None,
        });
        let asm = s
            .compile(&[SourceUnit::new("m.rb", "x = 2 + 3")])
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(asm.contains("\tjo\t.Lovf"), "{asm}");
    }

    // ── Errors ──

    #[test]
    fn errors_carry_their_phase() {
        let e = match compile("x = (1 +\n)") {
            Ok(asm) => panic!("compiled:\n{asm}"),
            Err(e) => e,
        };
        assert_eq!(e.phase, Phase::Parse);
        assert!(e.to_string().starts_with("parse error at 2:1: "), "{e}");

        let e = match compile("x = 1.5") {
            Ok(asm) => panic!("compiled:\n{asm}"),
            Err(e) => e,
        };
        assert_eq!(e.phase, Phase::Emit);
    }

    #[test]
    fn lexer_errors_report_the_lex_phase() {
        for src in ["x = \"abc", "x = <<EOS\nabc\n", "x = 4\ny = x / 2\nz = /ab"] {
            let e = match compile(src) {
                Ok(asm) => panic!("compiled:\n{asm}"),
                Err(e) => e,
            };
            assert_eq!(e.phase, Phase::Lex, "{src:?}: {e}");
            assert!(e.to_string().starts_with("lex error at "), "{e}");
        }
        let e = match compile("x = \"abc") {
            Ok(asm) => panic!("compiled:\n{asm}"),
            Err(e) => e,
        };
        assert_eq!(e.to_string(), "lex error at 1:5: unterminated literal");
    }
}
