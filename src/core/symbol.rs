// Symbol names, flags and addresses. Every name that enters the session is interned in a
// SymbolStringPool so that equality and hashing are pointer operations; SymbolName wraps the
// shared string and compares by identity. MangleAndInterner applies the target's global
// prefix before interning, turning a source-level name into its linkage name. SymbolFlags
// carry visibility (exported/hidden) and category (callable/data), and JitAddress is the
// resolved address of a materialized symbol in this process.

//! Interned symbol names and symbol metadata.

use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// An interned linkage name.
///
/// Two names from the same pool are equal iff they point at the same string.
#[derive(Clone)]
pub struct SymbolName(Arc<str>);

impl SymbolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SymbolName {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SymbolName {}

impl Hash for SymbolName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl Deref for SymbolName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Thread-safe string pool backing [`SymbolName`].
#[derive(Default)]
pub struct SymbolStringPool {
    strings: Mutex<HashSet<Arc<str>>>,
}

impl SymbolStringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning the shared name.
    pub fn intern(&self, s: &str) -> SymbolName {
        let mut strings = self.strings.lock();
        if let Some(existing) = strings.get(s) {
            return SymbolName(existing.clone());
        }
        let interned: Arc<str> = Arc::from(s);
        strings.insert(interned.clone());
        SymbolName(interned)
    }

    /// Drop every string that is only referenced by the pool itself.
    pub fn clear_dead_entries(&self) -> usize {
        let mut strings = self.strings.lock();
        let before = strings.len();
        strings.retain(|s| Arc::strong_count(s) > 1);
        before - strings.len()
    }

    pub fn len(&self) -> usize {
        self.strings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies the target's global prefix and interns the result.
#[derive(Clone)]
pub struct MangleAndInterner {
    pool: Arc<SymbolStringPool>,
    global_prefix: Option<char>,
}

impl MangleAndInterner {
    pub fn new(pool: Arc<SymbolStringPool>, global_prefix: Option<char>) -> Self {
        Self {
            pool,
            global_prefix,
        }
    }

    /// Linkage name for a source-level name.
    pub fn mangle(&self, name: &str) -> SymbolName {
        match self.global_prefix {
            Some(prefix) => {
                let mut mangled = String::with_capacity(name.len() + 1);
                mangled.push(prefix);
                mangled.push_str(name);
                self.pool.intern(&mangled)
            }
            None => self.pool.intern(name),
        }
    }

    /// Source-level name for a linkage name, if it carries the prefix.
    pub fn demangle<'a>(&self, linkage_name: &'a str) -> Option<&'a str> {
        match self.global_prefix {
            Some(prefix) => linkage_name.strip_prefix(prefix),
            None => Some(linkage_name),
        }
    }

    pub fn pool(&self) -> &Arc<SymbolStringPool> {
        &self.pool
    }
}

/// Visibility and category of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SymbolFlags {
    pub exported: bool,
    pub callable: bool,
}

impl SymbolFlags {
    pub const EXPORTED_FUNCTION: SymbolFlags = SymbolFlags {
        exported: true,
        callable: true,
    };
    pub const HIDDEN_FUNCTION: SymbolFlags = SymbolFlags {
        exported: false,
        callable: true,
    };
    pub const EXPORTED_DATA: SymbolFlags = SymbolFlags {
        exported: true,
        callable: false,
    };
    pub const HIDDEN_DATA: SymbolFlags = SymbolFlags {
        exported: false,
        callable: false,
    };
}

/// Address of a materialized symbol in the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct JitAddress(pub u64);

impl JitAddress {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for JitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Symbols a materialization unit promises to define.
pub type SymbolFlagsMap = hashbrown::HashMap<SymbolName, SymbolFlags>;

/// Addresses published by a linking stage.
pub type SymbolAddressMap = hashbrown::HashMap<SymbolName, JitAddress>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_identity() {
        let pool = SymbolStringPool::new();
        let a = pool.intern("mul");
        let b = pool.intern("mul");
        let c = pool.intern("add");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_dead_entries_are_cleared() {
        let pool = SymbolStringPool::new();
        let kept = pool.intern("kept");
        {
            let _dropped = pool.intern("dropped");
        }
        assert_eq!(pool.clear_dead_entries(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(&*kept, "kept");
    }

    #[test]
    fn test_mangling_with_prefix() {
        let pool = Arc::new(SymbolStringPool::new());
        let mangler = MangleAndInterner::new(pool.clone(), Some('_'));
        let name = mangler.mangle("main");

        assert_eq!(name.as_str(), "_main");
        assert_eq!(name, pool.intern("_main"));
        assert_eq!(mangler.demangle("_main"), Some("main"));
        assert_eq!(mangler.demangle("main"), None);
    }

    #[test]
    fn test_mangling_without_prefix() {
        let mangler = MangleAndInterner::new(Arc::new(SymbolStringPool::new()), None);
        assert_eq!(mangler.mangle("mul").as_str(), "mul");
        assert_eq!(mangler.demangle("mul"), Some("mul"));
    }
}
