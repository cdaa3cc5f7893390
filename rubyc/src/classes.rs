/// Classes, modules and their dispatch tables.
///
/// All classes of a session live in one arena, [`ClassRegistry`], and refer
/// to each other by [`ClassId`]. Every class and module gets a metaclass
/// holding its singleton methods; a metaclass's parent is the metaclass of
/// the class's superclass, ending at `Class` (or `Module` for modules).
///
/// Method dispatch goes through per-class vtables. The slot of a method
/// name is the same in every class ([`VtableOffsets`]), so a call site only
/// needs the name to find the slot:
///
/// ```text
///   class object:  [metaclass, instance size, name, superclass, slot 0, slot 1, ...]
///   slot k at byte offset 16 + 4k
/// ```
///
/// Vtables are filled at assembly time from the nearest ancestor defining
/// each name. Methods the runtime implements are listed in the builtin
/// manifest below.
use std::collections::{BTreeMap, HashMap};

use crate::mangle::mangle;

/// Bytes before the first vtable slot in a class object.
pub const CLASS_HEADER_BYTES: usize = 16;

/// Names whose slots are reserved first, in this order.
pub const RESERVED_METHODS: &[&str] = &["new", "__send__", "__get_symbol"];

// ═══════════════════════════════════════════════════════════════════
// Vtable offsets
// ═══════════════════════════════════════════════════════════════════

/// Session-wide method name → vtable slot.
#[derive(Debug)]
pub struct VtableOffsets {
    slots: HashMap<String, usize>,
    names: Vec<String>,
}

impl Default for VtableOffsets {
    fn default() -> Self {
        Self::new()
    }
}

impl VtableOffsets {
    pub fn new() -> Self {
        let mut offsets = Self {
            slots: HashMap::new(),
            names: Vec::new(),
        };
        for name in RESERVED_METHODS {
            offsets.alloc(name);
        }
        offsets
    }

    /// Slot of `name`, allocating the next one if it has none yet.
    pub fn alloc(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.slots.get(name) {
            return slot;
        }
        let slot = self.names.len();
        self.slots.insert(name.to_string(), slot);
        self.names.push(name.to_string());
        slot
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in slot order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn byte_offset(slot: usize) -> usize {
        CLASS_HEADER_BYTES + 4 * slot
    }
}

/// Symbol holding the byte offset of `name`'s slot.
pub fn voff_symbol(name: &str) -> String {
    format!("__voff__{}", mangle(name))
}

/// Label of the thunk that reports a missing `name`.
pub fn missing_thunk(name: &str) -> String {
    format!("__mm__{}", mangle(name))
}

/// Label of the function implementing `name` in the class labelled
/// `class_label`.
pub fn method_label(class_label: &str, name: &str) -> String {
    format!("__method_{}_{}", class_label, mangle(name))
}

// ═══════════════════════════════════════════════════════════════════
// Classes
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Module,
    Meta,
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Source name, `A::B`.
    pub name: String,
    /// Assembly label of the class object.
    pub label: String,
    pub kind: ClassKind,
    pub superclass: Option<ClassId>,
    /// Metaclass of a class or module.
    pub meta: Option<ClassId>,
    /// The class a metaclass belongs to.
    pub owner: Option<ClassId>,
    /// Method name → implementing function label.
    pub methods: BTreeMap<String, String>,
    pub includes: Vec<ClassId>,
    /// Instance variables first seen in this class.
    pub ivars: Vec<String>,
    pub builtin: bool,
}

#[derive(Debug)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
    by_name: HashMap<String, ClassId>,
    pub offsets: VtableOffsets,
    layouts: HashMap<ClassId, Vec<String>>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    /// A registry without any classes, not even `Object`.
    pub fn empty() -> Self {
        Self {
            classes: Vec::new(),
            by_name: HashMap::new(),
            offsets: VtableOffsets::new(),
            layouts: HashMap::new(),
        }
    }

    /// A registry holding the builtin classes and the runtime's methods.
    pub fn new() -> Self {
        let mut reg = Self::empty();
        for (name, superclass, kind, fields) in BUILTIN_CLASSES {
            let superclass = superclass.and_then(|s| reg.lookup(s));
            let id = reg.insert(name, *kind, superclass, true);
            for field in fields.iter() {
                reg.add_ivar(id, field);
            }
        }
        for (class, methods) in BUILTIN_METHODS {
            let Some(id) = reg.lookup(class) else {
                continue;
            };
            let label = reg.get(id).label.clone();
            for m in methods.iter() {
                reg.define_method(id, m, &method_label(&label, m));
            }
        }
        for (class, methods) in BUILTIN_CLASS_METHODS {
            let Some(meta) = reg.lookup(class).and_then(|id| reg.get(id).meta) else {
                continue;
            };
            let label = reg.get(meta).label.clone();
            for m in methods.iter() {
                reg.define_method(meta, m, &method_label(&label, m));
            }
        }
        reg
    }

    fn insert(&mut self, name: &str, kind: ClassKind, superclass: Option<ClassId>, builtin: bool) -> ClassId {
        let label = name.split("::").map(mangle).collect::<Vec<_>>().join("__");
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassInfo {
            name: name.to_string(),
            label: label.clone(),
            kind,
            superclass,
            meta: None,
            owner: None,
            methods: BTreeMap::new(),
            includes: Vec::new(),
            ivars: Vec::new(),
            builtin,
        });
        self.by_name.insert(name.to_string(), id);

        let meta = ClassId(self.classes.len() as u32);
        self.classes.push(ClassInfo {
            name: format!("#<Class:{name}>"),
            label: format!("__meta_{label}"),
            kind: ClassKind::Meta,
            superclass: None,
            meta: None,
            owner: Some(id),
            methods: BTreeMap::new(),
            includes: Vec::new(),
            ivars: Vec::new(),
            builtin,
        });
        self.classes[id.0 as usize].meta = Some(meta);
        log::trace!("class {name} ({label})");
        id
    }

    /// Define (or reopen) a class or module. Reopening with a different
    /// superclass is an error.
    pub fn define(
        &mut self,
        name: &str,
        kind: ClassKind,
        superclass: Option<ClassId>,
    ) -> Result<ClassId, String> {
        if let Some(id) = self.lookup(name) {
            let info = self.get(id);
            if info.kind != kind {
                let what = if info.kind == ClassKind::Module { "module" } else { "class" };
                return Err(format!("{name} is not a {}, it is a {what}", kind_name(kind)));
            }
            if let Some(s) = superclass {
                if info.superclass != Some(s) && !info.builtin {
                    return Err(format!("superclass mismatch for class {name}"));
                }
            }
            return Ok(id);
        }
        let superclass = match kind {
            ClassKind::Class => superclass.or_else(|| self.lookup("Object")),
            _ => None,
        };
        Ok(self.insert(name, kind, superclass, false))
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0 as usize]
    }

    fn get_mut(&mut self, id: ClassId) -> &mut ClassInfo {
        &mut self.classes[id.0 as usize]
    }

    pub fn label(&self, id: ClassId) -> &str {
        &self.get(id).label
    }

    pub fn meta(&self, id: ClassId) -> Option<ClassId> {
        self.get(id).meta
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassInfo)> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (ClassId(i as u32), c))
    }

    /// Next class in the superclass chain. A metaclass's parent is the
    /// metaclass of its owner's superclass.
    pub fn parent(&self, id: ClassId) -> Option<ClassId> {
        let info = self.get(id);
        match info.kind {
            ClassKind::Class | ClassKind::Module => info.superclass,
            ClassKind::Meta => {
                let owner = self.get(info.owner?);
                match owner.superclass {
                    Some(s) => self.get(s).meta,
                    None if owner.kind == ClassKind::Module => self.lookup("Module"),
                    None => self.lookup("Class"),
                }
            }
        }
    }

    /// Method resolution order: the class, its included modules (last
    /// included first), then the same for each superclass.
    pub fn ancestors(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if out.contains(&c) {
                break;
            }
            out.push(c);
            for m in self.get(c).includes.iter().rev() {
                if !out.contains(m) {
                    out.push(*m);
                }
            }
            cur = self.parent(c);
        }
        out
    }

    // ── Methods ───────────────────────────────────────────────

    pub fn define_method(&mut self, id: ClassId, name: &str, label: &str) {
        self.offsets.alloc(name);
        self.get_mut(id)
            .methods
            .insert(name.to_string(), label.to_string());
    }

    /// Function implementing `name` for instances of `id`.
    pub fn find_method(&self, id: ClassId, name: &str) -> Option<&str> {
        self.ancestors(id)
            .into_iter()
            .find_map(|c| self.get(c).methods.get(name))
            .map(String::as_str)
    }

    /// `alias new old`: `new` shares `old`'s current implementation.
    pub fn alias_method(&mut self, id: ClassId, new: &str, old: &str) -> Result<(), String> {
        let Some(label) = self.find_method(id, old).map(str::to_string) else {
            return Err(format!(
                "undefined method '{old}' for class '{}'",
                self.get(id).name
            ));
        };
        self.define_method(id, new, &label);
        Ok(())
    }

    pub fn include(&mut self, id: ClassId, module: ClassId) {
        let includes = &mut self.get_mut(id).includes;
        if !includes.contains(&module) {
            includes.push(module);
        }
    }

    /// Function labels for every vtable slot of `id`, `None` where no
    /// ancestor defines the name.
    pub fn vtable(&self, id: ClassId) -> Vec<Option<String>> {
        let ancestors = self.ancestors(id);
        self.offsets
            .names()
            .iter()
            .map(|name| {
                ancestors
                    .iter()
                    .find_map(|c| self.get(*c).methods.get(name))
                    .cloned()
            })
            .collect()
    }

    // ── Instance variables ────────────────────────────────────

    pub fn add_ivar(&mut self, id: ClassId, name: &str) {
        let ivars = &mut self.get_mut(id).ivars;
        if !ivars.iter().any(|v| v == name) {
            ivars.push(name.to_string());
        }
    }

    /// Fix instance variable offsets: a class's layout starts with its
    /// parent's, followed by its own variables not already there.
    pub fn layout(&mut self) {
        let mut layouts = HashMap::new();
        for (id, _) in self.iter() {
            layouts.insert(id, self.compute_layout(id));
        }
        self.layouts = layouts;
    }

    fn compute_layout(&self, id: ClassId) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if chain.contains(&c) {
                break;
            }
            chain.push(c);
            cur = match self.get(c).kind {
                ClassKind::Meta => None,
                _ => self.get(c).superclass,
            };
        }
        let mut vars: Vec<String> = Vec::new();
        for c in chain.iter().rev() {
            let info = self.get(*c);
            let mixed = info.includes.iter().flat_map(|m| self.get(*m).ivars.iter());
            for v in info.ivars.iter().chain(mixed) {
                if !vars.contains(v) {
                    vars.push(v.clone());
                }
            }
        }
        vars
    }

    /// Word index of `name` in instances of `id` (word 0 is the class).
    pub fn ivar_offset(&self, id: ClassId, name: &str) -> Option<usize> {
        self.layouts
            .get(&id)?
            .iter()
            .position(|v| v == name)
            .map(|i| i + 1)
    }

    /// Instance size in words, class pointer included.
    pub fn instance_size(&self, id: ClassId) -> usize {
        1 + self.layouts.get(&id).map_or(0, Vec::len)
    }
}

fn kind_name(kind: ClassKind) -> &'static str {
    match kind {
        ClassKind::Class => "class",
        ClassKind::Module => "module",
        ClassKind::Meta => "metaclass",
    }
}

// ═══════════════════════════════════════════════════════════════════
// Builtin manifest
// ═══════════════════════════════════════════════════════════════════

/// Classes the runtime implements: name, superclass, kind, and the
/// fields the runtime keeps in their instances.
pub const BUILTIN_CLASSES: &[(&str, Option<&str>, ClassKind, &[&str])] = &[
    ("Object", None, ClassKind::Class, &[]),
    ("Module", Some("Object"), ClassKind::Class, &[]),
    ("Class", Some("Module"), ClassKind::Class, &[]),
    ("Kernel", None, ClassKind::Module, &[]),
    ("Comparable", None, ClassKind::Module, &[]),
    ("Enumerable", None, ClassKind::Module, &[]),
    ("NilClass", Some("Object"), ClassKind::Class, &[]),
    ("TrueClass", Some("Object"), ClassKind::Class, &[]),
    ("FalseClass", Some("Object"), ClassKind::Class, &[]),
    ("Integer", Some("Object"), ClassKind::Class, &["__sign", "__limbs"]),
    ("String", Some("Object"), ClassKind::Class, &["__length", "__buffer"]),
    ("Symbol", Some("Object"), ClassKind::Class, &["__name"]),
    ("Array", Some("Object"), ClassKind::Class, &["__length", "__capacity", "__items"]),
    ("Hash", Some("Object"), ClassKind::Class, &["__size", "__buckets", "__first", "__default"]),
    ("Range", Some("Object"), ClassKind::Class, &["@first", "@last", "@exclude_end"]),
    ("Regexp", Some("Object"), ClassKind::Class, &["@source"]),
    ("Proc", Some("Object"), ClassKind::Class, &["__function", "__env", "__self", "__frame"]),
    ("Exception", Some("Object"), ClassKind::Class, &["@message"]),
    ("ScriptError", Some("Exception"), ClassKind::Class, &[]),
    ("NotImplementedError", Some("ScriptError"), ClassKind::Class, &[]),
    ("StandardError", Some("Exception"), ClassKind::Class, &[]),
    ("RuntimeError", Some("StandardError"), ClassKind::Class, &[]),
    ("FrozenError", Some("RuntimeError"), ClassKind::Class, &[]),
    ("ArgumentError", Some("StandardError"), ClassKind::Class, &[]),
    ("TypeError", Some("StandardError"), ClassKind::Class, &[]),
    ("NameError", Some("StandardError"), ClassKind::Class, &[]),
    ("NoMethodError", Some("NameError"), ClassKind::Class, &[]),
    ("ZeroDivisionError", Some("StandardError"), ClassKind::Class, &[]),
    ("IndexError", Some("StandardError"), ClassKind::Class, &[]),
    ("KeyError", Some("IndexError"), ClassKind::Class, &[]),
    ("StopIteration", Some("IndexError"), ClassKind::Class, &[]),
    ("RangeError", Some("StandardError"), ClassKind::Class, &[]),
    ("LocalJumpError", Some("StandardError"), ClassKind::Class, &[]),
];

const OBJECT_METHODS: &[&str] = &[
    "puts", "print", "p", "raise", "require", "require_relative", "==", "!=", "!", "===", "=~",
    "equal?", "eql?", "hash", "class", "is_a?", "kind_of?", "instance_of?", "respond_to?",
    "send", "__send__", "__get_symbol", "inspect", "to_s", "nil?", "object_id", "freeze",
    "frozen?", "dup", "loop", "lambda", "proc", "exit", "instance_variable_get",
    "instance_variable_set", "tap", "then", "format", "sprintf", "method_missing", "initialize",
    "block_given?",
];

const MODULE_METHODS: &[&str] = &["name", "to_s", "inspect", "===", "==", "ancestors", "include?"];

const CLASS_METHODS: &[&str] = &["new", "allocate", "superclass"];

const NIL_METHODS: &[&str] = &["to_s", "to_a", "to_i", "inspect", "nil?", "&", "|"];

const BOOL_METHODS: &[&str] = &["to_s", "inspect", "&", "|", "^", "!"];

const INTEGER_METHODS: &[&str] = &[
    "+", "-", "*", "/", "%", "**", "-@", "<", "<=", ">", ">=", "==", "<=>", "&", "|", "^", "<<",
    ">>", "~", "to_s", "inspect", "times", "upto", "downto", "succ", "pred", "zero?", "even?",
    "odd?", "abs", "hash", "chr", "to_i", "divmod", "between?",
];

const STRING_METHODS: &[&str] = &[
    "+", "*", "%", "==", "<=>", "=~", "[]", "[]=", "concat", "<<", "length", "size", "to_s",
    "to_sym", "to_i", "inspect", "upcase", "downcase", "capitalize", "reverse", "include?",
    "start_with?", "end_with?", "split", "strip", "chars", "each_char", "empty?", "hash",
    "eql?", "gsub", "sub", "index", "ord", "bytes",
];

const SYMBOL_METHODS: &[&str] = &["to_s", "to_sym", "to_proc", "inspect", "==", "hash", "<=>", "length"];

const ARRAY_METHODS: &[&str] = &[
    "[]", "[]=", "<<", "push", "pop", "shift", "unshift", "length", "size", "each",
    "each_with_index", "map", "collect", "select", "filter", "reject", "inject", "reduce",
    "first", "last", "join", "include?", "index", "empty?", "to_a", "inspect", "to_s", "==",
    "+", "-", "*", "concat", "sort", "sort_by", "reverse", "min", "max", "sum", "uniq",
    "compact", "flatten", "zip", "any?", "all?", "none?", "count", "find", "detect", "delete",
    "delete_at", "insert", "slice", "hash", "eql?", "group_by", "partition", "take", "drop",
    "flat_map", "each_slice", "min_by", "max_by", "find_index",
];

const HASH_METHODS: &[&str] = &[
    "[]", "[]=", "each", "each_pair", "keys", "values", "key?", "has_key?", "include?",
    "member?", "fetch", "delete", "length", "size", "empty?", "to_a", "inspect", "to_s",
    "merge", "map", "select", "reject", "==", "each_key", "each_value", "count", "any?",
    "find", "sort_by", "transform_values", "to_h",
];

const RANGE_METHODS: &[&str] = &[
    "each", "to_a", "first", "last", "begin", "end", "include?", "member?", "===", "map",
    "select", "inject", "reduce", "step", "size", "count", "sum", "reverse_each", "min", "max",
    "exclude_end?", "inspect", "to_s", "each_with_index",
];

const REGEXP_METHODS: &[&str] = &["=~", "match", "===", "source", "to_s", "inspect"];

const PROC_METHODS: &[&str] = &["call", "[]", "yield", "to_proc", "arity", "lambda?", "==="];

const EXCEPTION_METHODS: &[&str] = &["initialize", "message", "to_s", "inspect", "backtrace", "full_message"];

const COMPARABLE_METHODS: &[&str] = &["<", "<=", ">", ">=", "==", "between?", "clamp"];

const ENUMERABLE_METHODS: &[&str] = &[
    "map", "select", "reject", "inject", "reduce", "to_a", "each_with_index", "include?",
    "min", "max", "sort", "sort_by", "count", "first", "sum", "find", "detect", "any?", "all?",
];

/// Instance methods the runtime provides.
pub const BUILTIN_METHODS: &[(&str, &[&str])] = &[
    ("Object", OBJECT_METHODS),
    ("Module", MODULE_METHODS),
    ("Class", CLASS_METHODS),
    ("NilClass", NIL_METHODS),
    ("TrueClass", BOOL_METHODS),
    ("FalseClass", BOOL_METHODS),
    ("Integer", INTEGER_METHODS),
    ("String", STRING_METHODS),
    ("Symbol", SYMBOL_METHODS),
    ("Array", ARRAY_METHODS),
    ("Hash", HASH_METHODS),
    ("Range", RANGE_METHODS),
    ("Regexp", REGEXP_METHODS),
    ("Proc", PROC_METHODS),
    ("Exception", EXCEPTION_METHODS),
    ("Comparable", COMPARABLE_METHODS),
    ("Enumerable", ENUMERABLE_METHODS),
];

/// Singleton methods the runtime provides.
pub const BUILTIN_CLASS_METHODS: &[(&str, &[&str])] = &[
    ("Proc", &["new"]),
    ("Exception", &["exception"]),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn user_class(reg: &mut ClassRegistry, name: &str, superclass: Option<&str>) -> ClassId {
        let s = superclass.and_then(|s| reg.lookup(s));
        reg.define(name, ClassKind::Class, s)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    // ── Offsets ──

    #[test]
    fn reserved_offsets_come_first() {
        let offsets = VtableOffsets::new();
        assert_eq!(offsets.get("new"), Some(0));
        assert_eq!(offsets.get("__send__"), Some(1));
        assert_eq!(offsets.get("__get_symbol"), Some(2));
        assert_eq!(VtableOffsets::byte_offset(0), 16);
        assert_eq!(VtableOffsets::byte_offset(3), 28);
    }

    #[test]
    fn alloc_is_idempotent() {
        let mut offsets = VtableOffsets::new();
        let a = offsets.alloc("foo");
        assert_eq!(offsets.alloc("foo"), a);
        assert_eq!(offsets.len(), 4);
    }

    #[test]
    fn symbols_are_mangled() {
        assert_eq!(voff_symbol("empty?"), "__voff__empty_p_");
        assert_eq!(method_label("Foo", "[]"), "__method_Foo__lb__rb_");
    }

    // ── Hierarchy ──

    #[test]
    fn builtins_are_present() {
        let reg = ClassRegistry::new();
        let int = reg.lookup("Integer").unwrap_or_else(|| panic!("no Integer"));
        assert_eq!(reg.find_method(int, "+"), Some("__method_Integer__plus_"));
        assert_eq!(reg.find_method(int, "puts"), Some("__method_Object_puts"));
    }

    #[test]
    fn classes_default_to_object() {
        let mut reg = ClassRegistry::new();
        let foo = user_class(&mut reg, "Foo", None);
        assert_eq!(reg.get(foo).superclass, reg.lookup("Object"));
    }

    #[test]
    fn nested_names_join_labels() {
        let mut reg = ClassRegistry::new();
        let id = user_class(&mut reg, "A::B", None);
        assert_eq!(reg.label(id), "A__B");
        let meta = reg.meta(id).unwrap_or_else(|| panic!("no meta"));
        assert_eq!(reg.label(meta), "__meta_A__B");
    }

    #[test]
    fn reopening_keeps_identity() {
        let mut reg = ClassRegistry::new();
        let a = user_class(&mut reg, "Foo", None);
        let b = user_class(&mut reg, "Foo", None);
        assert_eq!(a, b);
    }

    #[test]
    fn superclass_mismatch() {
        let mut reg = ClassRegistry::new();
        user_class(&mut reg, "Foo", None);
        let string = reg.lookup("String");
        let err = reg.define("Foo", ClassKind::Class, string);
        assert_eq!(err, Err("superclass mismatch for class Foo".to_string()));
    }

    #[test]
    fn metaclass_chain_ends_at_class() {
        let mut reg = ClassRegistry::new();
        let base = user_class(&mut reg, "Base", None);
        let derived = user_class(&mut reg, "Derived", Some("Base"));
        let dmeta = reg.meta(derived).unwrap_or_else(|| panic!("no meta"));
        assert_eq!(reg.parent(dmeta), reg.meta(base));
        let class = reg.lookup("Class").unwrap_or_else(|| panic!("no Class"));
        assert!(reg.ancestors(dmeta).contains(&class));
        assert_eq!(reg.find_method(dmeta, "new"), Some("__method_Class_new"));
    }

    // ── Methods ──

    #[test]
    fn nearest_definition_wins() {
        let mut reg = ClassRegistry::new();
        let base = user_class(&mut reg, "Base", None);
        let derived = user_class(&mut reg, "Derived", Some("Base"));
        reg.define_method(base, "to_s", "__method_Base_to__s");
        assert_eq!(reg.find_method(derived, "to_s"), Some("__method_Base_to__s"));
        reg.define_method(derived, "to_s", "__method_Derived_to__s");
        assert_eq!(reg.find_method(derived, "to_s"), Some("__method_Derived_to__s"));
    }

    #[test]
    fn included_module_sits_between_class_and_parent() {
        let mut reg = ClassRegistry::new();
        let m = reg
            .define("Greeting", ClassKind::Module, None)
            .unwrap_or_else(|e| panic!("{e}"));
        let c = user_class(&mut reg, "Person", None);
        reg.define_method(m, "to_s", "__method_Greeting_to__s");
        reg.include(c, m);
        assert_eq!(reg.find_method(c, "to_s"), Some("__method_Greeting_to__s"));
        let ancestors = reg.ancestors(c);
        assert_eq!(ancestors[0], c);
        assert_eq!(ancestors[1], m);
    }

    #[test]
    fn alias_copies_current_definition() {
        let mut reg = ClassRegistry::new();
        let c = user_class(&mut reg, "Foo", None);
        reg.define_method(c, "size", "__method_Foo_size");
        assert!(reg.alias_method(c, "length", "size").is_ok());
        assert_eq!(reg.find_method(c, "length"), Some("__method_Foo_size"));
        assert!(reg.alias_method(c, "x", "nope").is_err());
    }

    #[test]
    fn vtable_has_a_slot_per_name() {
        let mut reg = ClassRegistry::new();
        let c = user_class(&mut reg, "Foo", None);
        reg.define_method(c, "bar", "__method_Foo_bar");
        let vt = reg.vtable(c);
        assert_eq!(vt.len(), reg.offsets.len());
        let bar = reg.offsets.get("bar").unwrap_or_else(|| panic!("no slot"));
        assert_eq!(vt[bar].as_deref(), Some("__method_Foo_bar"));
        let new = reg.offsets.get("new").unwrap_or_else(|| panic!("no slot"));
        assert_eq!(vt[new], None);
    }

    // ── Layout ──

    #[test]
    fn parent_ivars_come_first() {
        let mut reg = ClassRegistry::new();
        let base = user_class(&mut reg, "Base", None);
        let derived = user_class(&mut reg, "Derived", Some("Base"));
        reg.add_ivar(derived, "@b");
        reg.add_ivar(base, "@a");
        reg.layout();
        assert_eq!(reg.ivar_offset(base, "@a"), Some(1));
        assert_eq!(reg.ivar_offset(derived, "@a"), Some(1));
        assert_eq!(reg.ivar_offset(derived, "@b"), Some(2));
        assert_eq!(reg.instance_size(derived), 3);
        assert_eq!(reg.ivar_offset(base, "@b"), None);
    }

    #[test]
    fn builtin_fields_precede_user_ivars() {
        let mut reg = ClassRegistry::new();
        let err = user_class(&mut reg, "MyError", Some("StandardError"));
        reg.add_ivar(err, "@code");
        reg.layout();
        assert_eq!(reg.ivar_offset(err, "@message"), Some(1));
        assert_eq!(reg.ivar_offset(err, "@code"), Some(2));
    }
}
