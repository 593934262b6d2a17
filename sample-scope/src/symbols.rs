//! Symbols and the crate-wide name interning pool.
//!
//! Symbol names repeat heavily across Dsos (every libc mapping in every
//! process shares one spelling), so names are pooled and shared as
//! `Rc<str>`. The pool lives in [`crate::dso::DsoEnv`] and is append-only
//! for the lifetime of the environment.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use crate::dso::DsoEnv;

/// One named address range inside a Dso.
///
/// `len == 0` marks a placeholder whose true length is patched by
/// [`sort_and_fix_symbols`] from its successor's address.
#[derive(Clone)]
pub struct Symbol {
    pub addr: u64,
    pub len: u64,
    name: Rc<str>,
    demangled: OnceCell<Rc<str>>,
    dump_id: Cell<Option<u32>>,
}

impl Symbol {
    pub(crate) fn new(name: Rc<str>, addr: u64, len: u64) -> Self {
        Self {
            addr,
            len,
            name,
            demangled: OnceCell::new(),
            dump_id: Cell::new(None),
        }
    }

    /// The raw (possibly mangled) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The demangled name, computed on first use and cached.
    ///
    /// When demangling is disabled or fails, this is the raw name.
    pub fn demangled_name(&self, env: &DsoEnv) -> Rc<str> {
        self.demangled
            .get_or_init(|| {
                let demangled = env.demangle(&self.name);
                if demangled == *self.name {
                    Rc::clone(&self.name)
                } else {
                    env.intern(&demangled)
                }
            })
            .clone()
    }

    #[must_use]
    pub fn dump_id(&self) -> Option<u32> {
        self.dump_id.get()
    }

    pub(crate) fn has_dump_id(&self) -> bool {
        self.dump_id.get().is_some()
    }

    pub(crate) fn set_dump_id(&self, id: u32) {
        self.dump_id.set(Some(id));
    }

    /// True if `vaddr` falls inside this symbol's range.
    #[must_use]
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr.wrapping_sub(self.addr) < self.len
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &format_args!("{:#x}", self.len))
            .field("name", &self.name)
            .finish()
    }
}

/// Append-only pool of interned symbol names.
#[derive(Default)]
pub struct NamePool {
    names: RefCell<HashSet<Rc<str>>>,
}

impl NamePool {
    pub fn intern(&self, name: &str) -> Rc<str> {
        let mut names = self.names.borrow_mut();
        if let Some(existing) = names.get(name) {
            return Rc::clone(existing);
        }
        let interned: Rc<str> = Rc::from(name);
        names.insert(Rc::clone(&interned));
        interned
    }
}

/// Stable-sort by address, then give each zero-length symbol the distance
/// to its successor. A zero-length symbol at the end keeps length zero.
pub(crate) fn sort_and_fix_symbols(symbols: &mut [Symbol]) {
    symbols.sort_by_key(|s| s.addr);
    for i in 1..symbols.len() {
        let next_addr = symbols[i].addr;
        let prev = &mut symbols[i - 1];
        if prev.len == 0 {
            prev.len = next_addr - prev.addr;
        }
    }
}

/// Set-union of two address-sorted symbol lists. On an address collision
/// the entry already present (from `existing`) wins.
pub(crate) fn merge_symbols(existing: Vec<Symbol>, incoming: Vec<Symbol>) -> Vec<Symbol> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut a = existing.into_iter().peekable();
    let mut b = incoming.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if x.addr < y.addr {
                    merged.push(a.next().unwrap());
                } else if x.addr > y.addr {
                    merged.push(b.next().unwrap());
                } else {
                    merged.push(a.next().unwrap());
                    b.next();
                }
            }
            (Some(_), None) => merged.push(a.next().unwrap()),
            (None, Some(_)) => merged.push(b.next().unwrap()),
            (None, None) => break,
        }
    }
    merged
}
