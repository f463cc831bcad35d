use std::collections::{BTreeSet, HashMap};

use super::frame::USABLE_REGS;

/// Where a variable's canonical home lives. Temporaries have none and can
/// never be spilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Global,
    Stack,
    Temp,
}

/// One register's view: whether the allocator may use it this function,
/// and which variables currently live in it.
#[derive(Debug, Clone, Default)]
pub struct RegisterDescriptor {
    pub usable: bool,
    pub vars: BTreeSet<String>,
}

/// One variable's view: every place its current value can be found
/// (register names or memory expressions) plus its canonical home.
#[derive(Debug, Clone)]
pub struct AddressDescriptor {
    pub kind: AddrKind,
    pub locations: BTreeSet<String>,
    pub bound: Option<String>,
}

impl AddressDescriptor {
    /// The canonical store is stale when the home exists but the current
    /// value only lives in registers.
    pub fn is_stale(&self) -> bool {
        match &self.bound {
            Some(home) => !self.locations.contains(home) && !self.locations.is_empty(),
            None => false,
        }
    }
}

/// The register/address descriptor tables of Aho-Sethi-Ullman §8.6,
/// reset at every function entry.
#[derive(Debug, Default)]
pub struct Descriptors {
    regs: Vec<(&'static str, RegisterDescriptor)>,
    addrs: HashMap<String, AddressDescriptor>,
}

impl Descriptors {
    pub fn new() -> Descriptors {
        Descriptors {
            regs: USABLE_REGS
                .iter()
                .map(|r| (*r, RegisterDescriptor::default()))
                .collect(),
            addrs: HashMap::new(),
        }
    }

    /// Reset for a new function: all `$t` registers usable, `$s<k>` usable
    /// iff `k` is below the saved count (`main` gets all eight), every
    /// address descriptor dropped.
    pub fn reset(&mut self, saved_gprs: usize, is_main: bool) {
        for (name, desc) in self.regs.iter_mut() {
            desc.vars.clear();
            desc.usable = if let Some(k) = name.strip_prefix("$s") {
                let k: usize = k.parse().unwrap_or(usize::MAX);
                is_main || k < saved_gprs
            } else {
                true
            };
        }
        self.addrs.clear();
    }

    pub fn reg(&self, name: &str) -> &RegisterDescriptor {
        &self.regs.iter().find(|(n, _)| *n == name).unwrap().1
    }

    pub fn usable_regs(&self) -> impl Iterator<Item = (&'static str, &RegisterDescriptor)> {
        self.regs
            .iter()
            .filter(|(_, d)| d.usable)
            .map(|(n, d)| (*n, d))
    }

    pub fn bind(&mut self, var: &str, kind: AddrKind, bound: Option<String>) {
        let locations = match &bound {
            Some(home) => BTreeSet::from([home.clone()]),
            None => BTreeSet::new(),
        };
        self.addrs.insert(
            var.to_string(),
            AddressDescriptor {
                kind,
                locations,
                bound,
            },
        );
    }

    /// Temporaries get their (home-less) descriptor on first touch.
    pub fn addr_mut(&mut self, var: &str) -> &mut AddressDescriptor {
        self.addrs
            .entry(var.to_string())
            .or_insert_with(|| AddressDescriptor {
                kind: AddrKind::Temp,
                locations: BTreeSet::new(),
                bound: None,
            })
    }

    pub fn addr(&self, var: &str) -> Option<&AddressDescriptor> {
        self.addrs.get(var)
    }

    /// The pool register currently holding `var`, if any.
    pub fn reg_holding(&self, var: &str) -> Option<&'static str> {
        self.regs
            .iter()
            .find(|(_, d)| d.vars.contains(var))
            .map(|(n, _)| *n)
    }

    /// After an instruction writes `res` into `reg`: the register holds
    /// only `res`, every other variable forgets this register, and the
    /// result's only known location is the register (its home is NOT
    /// added; the store may be delayed or skipped entirely).
    pub fn take_for_result(&mut self, reg: &'static str, res: &str) {
        for (name, desc) in self.regs.iter_mut() {
            if *name == reg {
                desc.vars.clear();
                desc.vars.insert(res.to_string());
            }
        }
        for (var, addr) in self.addrs.iter_mut() {
            if var == res {
                addr.locations = BTreeSet::from([reg.to_string()]);
            } else {
                addr.locations.remove(reg);
            }
        }
        // First touch of a temporary result.
        let addr = self.addr_mut(res);
        if addr.locations.is_empty() {
            addr.locations.insert(reg.to_string());
        }
    }

    /// Copy semantics of `=var`: `var` joins `reg` alongside whatever is
    /// already there, and forgets every other register it lived in.
    pub fn share_register(&mut self, reg: &'static str, var: &str) {
        for (name, desc) in self.regs.iter_mut() {
            if *name == reg {
                desc.vars.insert(var.to_string());
            } else {
                desc.vars.remove(var);
            }
        }
        let addr = self.addr_mut(var);
        addr.locations
            .retain(|l| !l.starts_with('$') || l == reg || l.contains('('));
        addr.locations.insert(reg.to_string());
    }

    /// Record that `var`'s value was stored to its home.
    pub fn note_stored(&mut self, var: &str) {
        if let Some(addr) = self.addrs.get_mut(var) {
            if let Some(home) = addr.bound.clone() {
                addr.locations.insert(home);
            }
        }
    }

    /// Drop `var` from `reg` (and vice versa) without emitting anything.
    pub fn evict_all(&mut self, reg: &str) {
        for (name, desc) in self.regs.iter_mut() {
            if *name == reg {
                desc.vars.clear();
            }
        }
        for addr in self.addrs.values_mut() {
            addr.locations.remove(reg);
        }
    }

    /// Variables whose canonical store is stale, in deterministic order.
    pub fn stale_vars(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .addrs
            .iter()
            .filter(|(_, a)| a.kind != AddrKind::Temp && a.is_stale())
            .map(|(v, _)| v.clone())
            .collect();
        out.sort();
        out
    }

    /// Forget every register (and `$v0`) location so the next basic block
    /// starts cold. Memory locations survive.
    pub fn clear_registers(&mut self) {
        for (_, desc) in self.regs.iter_mut() {
            desc.vars.clear();
        }
        for addr in self.addrs.values_mut() {
            addr.locations.retain(|l| l.contains('(') || !l.starts_with('$'));
        }
    }

    /// Post-call invalidation: every `$t` register and `$v0` is clobbered
    /// by the callee; `$s` registers survive.
    pub fn invalidate_caller_saved(&mut self) {
        for (name, desc) in self.regs.iter_mut() {
            if name.starts_with("$t") {
                desc.vars.clear();
            }
        }
        for addr in self.addrs.values_mut() {
            addr.locations
                .retain(|l| l.contains('(') || (!l.starts_with("$t") && l != "$v0"));
        }
    }

    /// Mark a value as living in `$v0` only (a just-returned call result
    /// that the next instruction will consume).
    pub fn park_in_v0(&mut self, var: &str) {
        let addr = self.addr_mut(var);
        addr.locations = BTreeSet::from(["$v0".to_string()]);
    }

    pub fn lives_in_v0(&self, var: &str) -> bool {
        self.addr(var)
            .map_or(false, |a| a.locations.contains("$v0"))
    }
}
