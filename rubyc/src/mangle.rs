/// Assembly-safe labels for source names.
///
/// Letters and digits pass through. `_` doubles, and every other character
/// becomes `_code_`, where `code` is a short lowercase word or `x` plus the
/// hex code point:
///
/// ```text
///   each_with_index  ->  each__with__index
///   empty?           ->  empty_p_
///   []=              ->  _lb__rb__eq_
/// ```
///
/// The escape is reversible ([`demangle`]), but labels are also built by
/// joining mangled parts (`A::B` becomes `A__B`), so two different source
/// entities can still end up with the same label. [`SymbolRegistry`]
/// catches that before any code is generated.
use std::collections::HashMap;

const CODES: &[(char, &str)] = &[
    ('+', "plus"),
    ('-', "minus"),
    ('*', "mul"),
    ('/', "div"),
    ('%', "mod"),
    ('<', "lt"),
    ('>', "gt"),
    ('=', "eq"),
    ('!', "not"),
    ('?', "p"),
    ('[', "lb"),
    (']', "rb"),
    ('&', "and"),
    ('|', "or"),
    ('^', "xor"),
    ('~', "tilde"),
    ('@', "at"),
    ('$', "dollar"),
    (':', "colon"),
    ('.', "dot"),
];

pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' => out.push(c),
            '_' => out.push_str("__"),
            _ => {
                out.push('_');
                match CODES.iter().find(|(ch, _)| *ch == c) {
                    Some((_, code)) => out.push_str(code),
                    None => out.push_str(&format!("x{:x}", c as u32)),
                }
                out.push('_');
            }
        }
    }
    out
}

/// Inverse of [`mangle`]. `None` for text `mangle` cannot produce.
pub fn demangle(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = label.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'_') {
            chars.next();
            out.push('_');
            continue;
        }
        let mut code = String::new();
        loop {
            match chars.next() {
                Some('_') => break,
                Some(ch) => code.push(ch),
                None => return None,
            }
        }
        let decoded = match CODES.iter().find(|(_, w)| *w == code) {
            Some((ch, _)) => *ch,
            None => {
                let hex = code.strip_prefix('x')?;
                char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
            }
        };
        out.push(decoded);
    }
    Some(out)
}

/// What a label stands for in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    pub kind: &'static str,
    pub name: String,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Every label handed out in a compilation session, with the entity it
/// was made for. Owned by the session: it starts empty and accumulates
/// across all units.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    labels: HashMap<String, Entity>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    /// Record that `label` names `kind name`. Registering the same entity
    /// twice is fine; a different entity under a taken label is an error.
    pub fn register(&mut self, label: &str, kind: &'static str, name: &str) -> Result<(), String> {
        let entity = Entity {
            kind,
            name: name.to_string(),
        };
        match self.labels.get(label) {
            Some(existing) if *existing == entity => Ok(()),
            Some(existing) => Err(format!(
                "{entity} and {existing} both map to the assembly label '{label}'"
            )),
            None => {
                log::trace!("label {label} -> {entity}");
                self.labels.insert(label.to_string(), entity);
                Ok(())
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<&Entity> {
        self.labels.get(label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
