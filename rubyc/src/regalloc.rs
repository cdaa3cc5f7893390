/// Register allocation for the emitter.
///
/// A fixed pool of three registers caches local variables. `%eax` always
/// holds the value being computed, `%esi` holds `self`, `%ebx` carries the
/// argument count into calls and `%ebp`/`%esp` frame the stack; none of
/// those are ever handed out.
///
/// Caching never evicts: a variable only gets a register while one is
/// free. Scratch registers come from [`with_register`], which evicts the
/// least valuable unlocked variable when the pool is full, reloads it once
/// the borrow ends, and always hands the register back, on error paths too.
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{CompileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Self::Eax => "%eax",
            Self::Ebx => "%ebx",
            Self::Ecx => "%ecx",
            Self::Edx => "%edx",
            Self::Esi => "%esi",
            Self::Edi => "%edi",
            Self::Ebp => "%ebp",
            Self::Esp => "%esp",
        }
    }

    /// Clobbered by C functions in the runtime.
    pub fn caller_saved(self) -> bool {
        matches!(self, Self::Eax | Self::Ecx | Self::Edx)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registers available for caching and scratch use, in preference order.
pub const POOL: [Reg; 3] = [Reg::Edx, Reg::Ecx, Reg::Edi];

/// A modified cached variable that must be stored back to its home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spill {
    pub var: String,
    pub reg: Reg,
}

#[derive(Debug, Clone)]
pub struct RegAlloc {
    /// Use counts; variables absent here are never cached.
    priority: HashMap<String, usize>,
    cached: HashMap<String, Reg>,
    free: Vec<Reg>,
    dirty: HashSet<String>,
    locked: HashSet<Reg>,
}

impl RegAlloc {
    pub fn new(priority: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self {
            priority: priority.into_iter().collect(),
            cached: HashMap::new(),
            free: POOL.to_vec(),
            dirty: HashSet::new(),
            locked: HashSet::new(),
        }
    }

    /// Register currently holding `var`.
    pub fn cached(&self, var: &str) -> Option<Reg> {
        self.cached.get(var).copied()
    }

    /// Variable cached in `reg`.
    pub fn holder(&self, reg: Reg) -> Option<&str> {
        self.cached
            .iter()
            .find(|(_, r)| **r == reg)
            .map(|(v, _)| v.as_str())
    }

    pub fn free_registers(&self) -> &[Reg] {
        &self.free
    }

    pub fn is_dirty(&self, var: &str) -> bool {
        self.dirty.contains(var)
    }

    /// Register for `var`: the one already holding it, or a free one when
    /// `var` is worth caching. The caller loads the value into a newly
    /// assigned register.
    pub fn cache(&mut self, var: &str) -> Option<Reg> {
        if let Some(reg) = self.cached(var) {
            return Some(reg);
        }
        if !self.priority.contains_key(var) || self.free.is_empty() {
            return None;
        }
        let reg = self.free.remove(0);
        log::trace!("cache {var} in {reg}");
        self.cached.insert(var.to_string(), reg);
        Some(reg)
    }

    /// The cached copy of `var` is newer than its home.
    pub fn mark_dirty(&mut self, var: &str) {
        if self.cached.contains_key(var) {
            self.dirty.insert(var.to_string());
        }
    }

    /// Drop `var` from its register, returning a write-back if it was
    /// modified.
    pub fn evict(&mut self, var: &str) -> Option<Spill> {
        let reg = self.cached.remove(var)?;
        log::trace!("evict {var} from {reg}");
        self.release(reg);
        self.dirty.remove(var).then(|| Spill {
            var: var.to_string(),
            reg,
        })
    }

    pub fn evict_all(&mut self) -> Vec<Spill> {
        self.evict_where(|_| true)
    }

    /// Evict variables living in registers a runtime call may clobber.
    pub fn evict_caller_saved(&mut self) -> Vec<Spill> {
        self.evict_where(Reg::caller_saved)
    }

    fn evict_where(&mut self, pred: impl Fn(Reg) -> bool) -> Vec<Spill> {
        let mut vars: Vec<(String, Reg)> = self
            .cached
            .iter()
            .filter(|(_, r)| pred(**r) && !self.locked.contains(*r))
            .map(|(v, r)| (v.clone(), *r))
            .collect();
        // Deterministic output order.
        vars.sort_by_key(|(_, r)| POOL.iter().position(|p| p == r));
        vars.into_iter()
            .filter_map(|(v, _)| self.evict(&v))
            .collect()
    }

    pub fn lock(&mut self, reg: Reg) {
        self.locked.insert(reg);
    }

    pub fn unlock(&mut self, reg: Reg) {
        self.locked.remove(&reg);
    }

    fn release(&mut self, reg: Reg) {
        if !self.free.contains(&reg) {
            self.free.push(reg);
            self.free
                .sort_by_key(|r| POOL.iter().position(|p| p == r));
        }
    }

    /// Least valuable cached variable that is not locked.
    fn victim(&self) -> Option<String> {
        self.cached
            .iter()
            .filter(|(_, r)| !self.locked.contains(*r))
            .min_by(|(a, ra), (b, rb)| {
                let pa = self.priority.get(*a).copied().unwrap_or(0);
                let pb = self.priority.get(*b).copied().unwrap_or(0);
                pa.cmp(&pb).then_with(|| a.cmp(b)).then_with(|| {
                    POOL.iter()
                        .position(|p| p == *ra)
                        .cmp(&POOL.iter().position(|p| p == *rb))
                })
            })
            .map(|(v, _)| v.clone())
    }

    /// A scratch register, and the variable evicted to free it.
    fn take(&mut self) -> Option<Borrow> {
        if !self.free.is_empty() {
            let reg = self.free.remove(0);
            return Some(Borrow { reg, victim: None, spill: None });
        }
        let victim = self.victim()?;
        let spill = self.evict(&victim);
        let reg = self.free.remove(0);
        Some(Borrow { reg, victim: Some(victim), spill })
    }

    /// Hand `reg` back to `victim` unless it found another register
    /// meanwhile. Returns whether the caller must reload it.
    fn restore(&mut self, reg: Reg, victim: &str) -> bool {
        if self.cached.contains_key(victim) || !self.free.contains(&reg) {
            return false;
        }
        self.free.retain(|r| *r != reg);
        log::trace!("restore {victim} to {reg}");
        self.cached.insert(victim.to_string(), reg);
        true
    }
}

struct Borrow {
    reg: Reg,
    victim: Option<String>,
    spill: Option<Spill>,
}

/// Anything that owns an allocator and can move variables between
/// registers and their homes.
pub trait HasRegs {
    fn regs(&mut self) -> &mut RegAlloc;
    fn spill(&mut self, spill: Spill) -> Result<()>;
    /// Load `var` from its home into `reg`.
    fn reload(&mut self, var: &str, reg: Reg) -> Result<()>;
}

/// Run `body` with a locked scratch register.
pub fn with_register<T, R>(owner: &mut T, body: impl FnOnce(&mut T, Reg) -> Result<R>) -> Result<R>
where
    T: HasRegs + ?Sized,
{
    let Some(Borrow { reg, victim, spill }) = owner.regs().take() else {
        return Err(CompileError::emit("register pool exhausted", None));
    };
    owner.regs().lock(reg);
    log::trace!("borrow {reg}");
    let result = match spill {
        Some(s) => owner.spill(s).and_then(|()| body(owner, reg)),
        None => body(owner, reg),
    };
    let regs = owner.regs();
    regs.unlock(reg);
    regs.release(reg);
    match victim {
        Some(var) if owner.regs().restore(reg, &var) => {
            let reloaded = owner.reload(&var, reg);
            result.and_then(|value| reloaded.map(|()| value))
        }
        _ => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Owner {
        regs: RegAlloc,
        spilled: Vec<Spill>,
        reloaded: Vec<(String, Reg)>,
    }

    impl HasRegs for Owner {
        fn regs(&mut self) -> &mut RegAlloc {
            &mut self.regs
        }

        fn spill(&mut self, spill: Spill) -> Result<()> {
            self.spilled.push(spill);
            Ok(())
        }

        fn reload(&mut self, var: &str, reg: Reg) -> Result<()> {
            self.reloaded.push((var.to_string(), reg));
            Ok(())
        }
    }

    fn owner(vars: &[(&str, usize)]) -> Owner {
        Owner {
            regs: RegAlloc::new(vars.iter().map(|(v, p)| (v.to_string(), *p))),
            spilled: Vec::new(),
            reloaded: Vec::new(),
        }
    }

    // ── Caching ──

    #[test]
    fn caching_reuses_and_never_evicts() {
        let mut o = owner(&[("a", 3), ("b", 2), ("c", 1), ("d", 5)]);
        assert_eq!(o.regs.cache("a"), Some(Reg::Edx));
        assert_eq!(o.regs.cache("a"), Some(Reg::Edx));
        assert_eq!(o.regs.cache("b"), Some(Reg::Ecx));
        assert_eq!(o.regs.cache("c"), Some(Reg::Edi));
        assert_eq!(o.regs.cache("d"), None);
        assert_eq!(o.regs.cached("a"), Some(Reg::Edx));
    }

    #[test]
    fn unknown_variables_are_never_cached() {
        let mut o = owner(&[("a", 1)]);
        assert_eq!(o.regs.cache("zz"), None);
        assert_eq!(o.regs.free_registers(), &POOL);
    }

    #[test]
    fn dirty_eviction_yields_write_back() {
        let mut o = owner(&[("a", 1), ("b", 1)]);
        o.regs.cache("a");
        o.regs.cache("b");
        o.regs.mark_dirty("b");
        assert_eq!(o.regs.evict("a"), None);
        assert_eq!(
            o.regs.evict("b"),
            Some(Spill {
                var: "b".into(),
                reg: Reg::Ecx
            })
        );
        assert_eq!(o.regs.free_registers(), &POOL);
    }

    #[test]
    fn caller_saved_eviction_keeps_edi() {
        let mut o = owner(&[("a", 1), ("b", 1), ("c", 1)]);
        for v in ["a", "b", "c"] {
            o.regs.cache(v);
            o.regs.mark_dirty(v);
        }
        let spills = o.regs.evict_caller_saved();
        assert_eq!(spills.len(), 2);
        assert_eq!(o.regs.cached("c"), Some(Reg::Edi));
    }

    // ── Borrowing ──

    #[test]
    fn borrow_uses_free_register_and_returns_it() {
        let mut o = owner(&[("a", 1)]);
        o.regs.cache("a");
        let before = o.regs.free_registers().to_vec();
        let got = with_register(&mut o, |o, r| {
            assert!(!o.regs.free_registers().contains(&r));
            Ok(r)
        });
        assert_eq!(got.ok(), Some(Reg::Ecx));
        assert_eq!(o.regs.free_registers(), before.as_slice());
        assert_eq!(o.regs.cached("a"), Some(Reg::Edx));
    }

    #[test]
    fn borrow_evicts_lowest_priority() {
        let mut o = owner(&[("hot", 9), ("warm", 5), ("cold", 1)]);
        for v in ["hot", "warm", "cold"] {
            o.regs.cache(v);
        }
        o.regs.mark_dirty("cold");
        let got = with_register(&mut o, |o, r| {
            assert_eq!(o.regs.cached("cold"), None);
            Ok(r)
        });
        assert_eq!(got.ok(), Some(Reg::Edi));
        assert_eq!(o.spilled.len(), 1);
        assert_eq!(o.spilled[0].var, "cold");
        // The evicted variable is back where it was, clean.
        assert_eq!(o.regs.cached("cold"), Some(Reg::Edi));
        assert!(!o.regs.is_dirty("cold"));
        assert_eq!(o.reloaded, vec![("cold".to_string(), Reg::Edi)]);
        assert!(o.regs.free_registers().is_empty());
    }

    #[test]
    fn victim_cached_elsewhere_is_not_reloaded() {
        let mut o = owner(&[("a", 9), ("b", 5), ("c", 1)]);
        for v in ["a", "b", "c"] {
            o.regs.cache(v);
        }
        with_register(&mut o, |o, _| {
            // `a` leaves, and `c` takes its register inside the borrow.
            o.regs.evict("a");
            assert_eq!(o.regs.cache("c"), Some(Reg::Edx));
            Ok(())
        })
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(o.regs.cached("c"), Some(Reg::Edx));
        assert!(o.reloaded.is_empty());
        assert_eq!(o.regs.free_registers(), &[Reg::Edi]);
    }

    #[test]
    fn register_comes_back_after_error() {
        let mut o = owner(&[]);
        let r: Result<()> = with_register(&mut o, |_, _| Err(CompileError::emit("boom", None)));
        assert!(r.is_err());
        assert_eq!(o.regs.free_registers(), &POOL);
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let mut o = owner(&[]);
        let r = with_register(&mut o, |o, _| {
            with_register(o, |o, _| with_register(o, |o, _| with_register(o, |_, r| Ok(r))))
        });
        let err = r.err().map(|e| e.message);
        assert_eq!(err.as_deref(), Some("register pool exhausted"));
        assert_eq!(o.regs.free_registers(), &POOL);
    }

    #[test]
    fn displays_att_names() {
        assert_eq!(Reg::Eax.to_string(), "%eax");
        assert_eq!(format!("{}", Reg::Edi), "%edi");
    }

    // ── Properties ──

    proptest! {
        #[test]
        fn borrowing_restores_allocator_state(
            cached in proptest::collection::vec(0usize..6, 0..6),
            dirty in proptest::collection::vec(0usize..6, 0..3),
            depth in 0usize..5,
        ) {
            let names: Vec<String> = (0..6).map(|i| format!("v{i}")).collect();
            let mut o = Owner {
                regs: RegAlloc::new(names.iter().cloned().zip(1..)),
                spilled: Vec::new(),
                reloaded: Vec::new(),
            };
            for i in &cached {
                o.regs.cache(&names[*i]);
            }
            for i in &dirty {
                o.regs.mark_dirty(&names[*i]);
            }
            let before_free = o.regs.free_registers().to_vec();
            let before_cached = o.regs.cached.clone();
            fn nest(o: &mut Owner, depth: usize) -> Result<()> {
                if depth == 0 {
                    return Ok(());
                }
                with_register(o, |o, _| nest(o, depth - 1))
            }
            // Full pools evict; nesting deeper than the pool is an error.
            let result = nest(&mut o, depth);
            prop_assert_eq!(result.is_ok(), depth <= POOL.len());
            prop_assert_eq!(o.regs.free_registers(), before_free.as_slice());
            prop_assert_eq!(&o.regs.cached, &before_cached);
            for (var, reg) in &o.reloaded {
                prop_assert_eq!(before_cached.get(var), Some(reg));
            }
        }

        #[test]
        fn cached_variables_keep_their_register(order in proptest::collection::vec(0usize..5, 1..12)) {
            let names: Vec<String> = (0..5).map(|i| format!("v{i}")).collect();
            let mut regs = RegAlloc::new(names.iter().cloned().zip(1..));
            let mut seen: HashMap<String, Reg> = HashMap::new();
            for i in order {
                let name = &names[i];
                match regs.cache(name) {
                    Some(r) => {
                        if let Some(prev) = seen.get(name) {
                            prop_assert_eq!(*prev, r);
                        }
                        seen.insert(name.clone(), r);
                    }
                    None => prop_assert!(regs.free_registers().is_empty()),
                }
            }
        }
    }
}
