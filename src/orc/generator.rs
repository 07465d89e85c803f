// Definition generators are the fallback consulted when a lookup misses in a namespace. The
// session asks each generator of each searched namespace, in order, whether it can supply
// the missing name; a generator that answers gets its address defined as a ready absolute
// symbol in that namespace so later lookups hit directly. ProcessSymbolsGenerator asks the
// dynamic loader of the host process (dlsym on the default handle), stripping the target's
// global prefix first since dlsym expects C-level names. AbsoluteSymbolsGenerator answers
// from a fixed table, which is how hosts expose their own callbacks to JIT'd code.

//! Fallback symbol sources for namespaces.

use crate::core::error::JitResult;
use crate::core::symbol::JitAddress;
use hashbrown::HashMap;

/// Supplies definitions for names a namespace does not define.
pub trait DefinitionGenerator: Send + Sync {
    /// Address for `name` (a linkage name), or `None` if unknown here.
    fn resolve(&self, name: &str) -> JitResult<Option<JitAddress>>;

    fn describe(&self) -> String {
        "generator".to_string()
    }
}

type SymbolFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Resolves names against the symbols already loaded into this process.
pub struct ProcessSymbolsGenerator {
    global_prefix: Option<char>,
    allow: Option<SymbolFilter>,
}

impl ProcessSymbolsGenerator {
    pub fn new(global_prefix: Option<char>) -> Self {
        Self {
            global_prefix,
            allow: None,
        }
    }

    /// Only resolve names for which `filter` returns true.
    pub fn with_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.allow = Some(Box::new(filter));
        self
    }

    #[cfg(unix)]
    fn dlsym(name: &str) -> Option<u64> {
        let c_name = std::ffi::CString::new(name).ok()?;
        let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize as u64)
        }
    }

    #[cfg(not(unix))]
    fn dlsym(_name: &str) -> Option<u64> {
        None
    }
}

impl DefinitionGenerator for ProcessSymbolsGenerator {
    fn resolve(&self, name: &str) -> JitResult<Option<JitAddress>> {
        let c_name = match self.global_prefix {
            Some(prefix) => match name.strip_prefix(prefix) {
                Some(stripped) => stripped,
                None => return Ok(None),
            },
            None => name,
        };

        if let Some(allow) = &self.allow {
            if !allow(c_name) {
                return Ok(None);
            }
        }

        let found = Self::dlsym(c_name).map(JitAddress);
        if let Some(addr) = found {
            log::debug!("resolved `{}` from the host process at {}", name, addr);
        }
        Ok(found)
    }

    fn describe(&self) -> String {
        "process symbols".to_string()
    }
}

/// Resolves names from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct AbsoluteSymbolsGenerator {
    symbols: HashMap<String, JitAddress>,
}

impl AbsoluteSymbolsGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, address: JitAddress) -> Self {
        self.symbols.insert(name.into(), address);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, address: JitAddress) {
        self.symbols.insert(name.into(), address);
    }
}

impl DefinitionGenerator for AbsoluteSymbolsGenerator {
    fn resolve(&self, name: &str) -> JitResult<Option<JitAddress>> {
        Ok(self.symbols.get(name).copied())
    }

    fn describe(&self) -> String {
        format!("{} absolute symbol(s)", self.symbols.len())
    }
}
