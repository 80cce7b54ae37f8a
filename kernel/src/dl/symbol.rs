/// The global symbol table modules link against.
///
/// Open hashing over 509 buckets. A name may be registered more than
/// once; lookups see the most recent registration.
use alloc::string::String;
use alloc::vec::Vec;

use super::ModuleId;

pub const SYMTAB_SIZE: usize = 509;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: usize,
    pub is_func: bool,
    /// `None` for symbols exported by the core image.
    pub owner: Option<ModuleId>,
}

pub fn hash(name: &str) -> usize {
    let key = name
        .bytes()
        .fold(0u32, |key, c| key.wrapping_mul(65599).wrapping_add(c as u32));
    (key.wrapping_add(key >> 5) as usize) % SYMTAB_SIZE
}

pub struct SymbolTable {
    buckets: Vec<Vec<Symbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(SYMTAB_SIZE);
        buckets.resize_with(SYMTAB_SIZE, Vec::new);
        Self { buckets }
    }

    pub fn register(&mut self, name: &str, addr: usize, is_func: bool, owner: Option<ModuleId>) {
        self.buckets[hash(name)].push(Symbol {
            name: name.into(),
            addr,
            is_func,
            owner,
        });
    }

    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.buckets[hash(name)].iter().rev().find(|s| s.name == name)
    }

    /// Drop every symbol `owner` published.
    ///
    /// Panics for the core image (`None`): its symbols never go away.
    pub fn unregister(&mut self, owner: Option<ModuleId>) {
        if owner.is_none() {
            panic!("core symbols cannot be unregistered");
        }
        for bucket in &mut self.buckets {
            bucket.retain(|s| s.owner != owner);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
