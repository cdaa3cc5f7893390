/// Static data: class objects and their vtables, method-missing thunks,
/// static words, and the literals referenced from code.
use std::collections::HashMap;

use super::FnEmitter;
use crate::asm::{Emit, Operand, TextOutput, asciz};
use crate::classes::{ClassKind, VtableOffsets, missing_thunk, voff_symbol};
use crate::error::Result;
use crate::integer::Integer;
use crate::regalloc::Reg;
use crate::transform::Program;

/// Literals collected while compiling functions.
#[derive(Debug, Default)]
pub(super) struct Data {
    strings: Vec<Vec<u8>>,
    string_ids: HashMap<Vec<u8>, usize>,
    symbols: Vec<String>,
    symbol_ids: HashMap<String, usize>,
    integers: Vec<(i8, Vec<u32>)>,
}

impl Data {
    fn string(&mut self, bytes: &[u8]) -> usize {
        if let Some(&k) = self.string_ids.get(bytes) {
            return k;
        }
        let k = self.strings.len();
        self.strings.push(bytes.to_vec());
        self.string_ids.insert(bytes.to_vec(), k);
        k
    }

    fn symbol(&mut self, name: &str) -> usize {
        if let Some(&k) = self.symbol_ids.get(name) {
            return k;
        }
        let k = self.symbols.len();
        self.symbols.push(name.to_string());
        self.symbol_ids.insert(name.to_string(), k);
        k
    }

    fn integer(&mut self, words: (i8, Vec<u32>)) -> usize {
        self.integers.push(words);
        self.integers.len() - 1
    }

    pub fn emit(&self, program: &Program, out: &mut TextOutput) {
        let classes = &program.classes;
        let offsets = &classes.offsets;

        for (k, name) in offsets.names().iter().enumerate() {
            let sym = voff_symbol(name);
            out.directive(format!(".globl\t{sym}"));
            out.directive(format!(".equ\t{sym}, {}", VtableOffsets::byte_offset(k)));
        }

        // Thunks for empty vtable slots.
        for (k, name) in offsets.names().iter().enumerate() {
            out.label(&missing_thunk(name));
            out.movl(Operand::addr(format!(".Lmname_{k}")), Reg::Eax);
            out.jmp("__method_missing");
        }

        out.directive(".data");
        out.directive(".align\t4");
        for (i, (id, info)) in classes.iter().enumerate() {
            let metaclass = match info.kind {
                ClassKind::Meta => "Class".to_string(),
                _ => info
                    .meta
                    .map_or_else(|| "Class".to_string(), |m| classes.label(m).to_string()),
            };
            let size = match info.kind {
                ClassKind::Meta => 4 + offsets.len(),
                _ => classes.instance_size(id),
            };
            let parent = classes
                .parent(id)
                .map_or_else(|| "0".to_string(), |p| classes.label(p).to_string());
            out.directive(format!(".globl\t{}", info.label));
            out.label(&info.label);
            out.directive(format!(".long\t{metaclass}, {size}, .Lcname_{i}, {parent}"));
            for (slot, name) in classes.vtable(id).into_iter().zip(offsets.names()) {
                let target = slot.unwrap_or_else(|| missing_thunk(name));
                out.directive(format!(".long\t{target}"));
            }
        }

        for label in program.statics.keys() {
            out.label(label);
            out.directive(".long\t__nil");
        }
        for site in 0..program.class_sites {
            out.label(&format!("__once_{site}"));
            out.directive(".long\t0");
        }
        for k in 0..self.symbols.len() {
            out.label(&format!(".Lsymc_{k}"));
            out.directive(".long\t0");
        }
        for (k, (sign, limbs)) in self.integers.iter().enumerate() {
            out.label(&format!(".Lint{k}"));
            let mut words = vec!["Integer".to_string(), sign.to_string(), limbs.len().to_string()];
            words.extend(limbs.iter().map(u32::to_string));
            out.directive(format!(".long\t{}", words.join(", ")));
        }

        out.directive(".section\t.rodata");
        for (i, (_, info)) in classes.iter().enumerate() {
            out.label(&format!(".Lcname_{i}"));
            out.directive(asciz(info.name.as_bytes()));
        }
        for (k, name) in offsets.names().iter().enumerate() {
            out.label(&format!(".Lmname_{k}"));
            out.directive(asciz(name.as_bytes()));
        }
        for (k, bytes) in self.strings.iter().enumerate() {
            out.label(&format!(".Lstr{k}"));
            out.directive(asciz(bytes));
        }
        for (k, name) in self.symbols.iter().enumerate() {
            out.label(&format!(".Lsym_{k}"));
            out.directive(asciz(name.as_bytes()));
        }
    }
}

impl FnEmitter<'_> {
    pub(super) fn integer(&mut self, value: &Integer) -> Result<()> {
        match value.tagged() {
            Some(word) => self.out.movl(word as i32 as i64, Reg::Eax),
            None => {
                let k = self.shared.data.integer(value.heap_words());
                self.out.movl(Operand::addr(format!(".Lint{k}")), Reg::Eax);
            }
        }
        Ok(())
    }

    /// A fresh String object per evaluation.
    pub(super) fn string(&mut self, bytes: &[u8]) -> Result<()> {
        let k = self.shared.data.string(bytes);
        self.ccall("__get_string", &[Operand::addr(format!(".Lstr{k}"))])
    }

    /// Symbols are interned once and cached in a data word.
    pub(super) fn symbol(&mut self, name: &str) -> Result<()> {
        let k = self.shared.data.symbol(name);
        let cache = Operand::abs(format!(".Lsymc_{k}"));
        let done = self.new_label("sym");
        self.branch_point()?;
        self.out.movl(cache.clone(), Reg::Eax);
        self.out.testl(Reg::Eax, Reg::Eax);
        self.out.jcc("jnz", &done);
        self.ccall("__get_symbol", &[Operand::addr(format!(".Lsym_{k}"))])?;
        self.out.movl(Reg::Eax, cache);
        self.out.label(&done);
        Ok(())
    }
}
