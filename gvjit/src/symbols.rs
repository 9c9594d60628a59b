///
/// External Symbol Resolution
///
/// External functions and globals get their addresses from a
/// `SymbolResolver`. `HostSymbols` serves names the host registered
/// explicitly and falls back to the process's dynamic symbol table.
///

use std::collections::HashMap;

pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<*const u8>;
}

#[derive(Debug, Default)]
pub struct HostSymbols {
    symbols: HashMap<String, usize>,
    dynamic_lookup: bool,
}

impl HostSymbols {
    /// A resolver that also searches the loaded shared objects.
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            dynamic_lookup: true,
        }
    }

    /// A resolver limited to explicitly registered symbols.
    pub fn isolated() -> Self {
        Self::default()
    }

    pub fn symbol(&mut self, name: impl Into<String>, ptr: *const u8) -> &mut Self {
        self.symbols.insert(name.into(), ptr as usize);
        self
    }
}

impl SymbolResolver for HostSymbols {
    fn resolve(&self, name: &str) -> Option<*const u8> {
        if let Some(&addr) = self.symbols.get(name) {
            return Some(addr as *const u8);
        }
        if self.dynamic_lookup {
            let found = lookup_dynamic(name);
            tracing::trace!(symbol = name, found = found.is_some(), "dynamic symbol lookup");
            return found;
        }
        None
    }
}

#[cfg(unix)]
fn lookup_dynamic(name: &str) -> Option<*const u8> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *const u8)
    }
}

#[cfg(not(unix))]
fn lookup_dynamic(_name: &str) -> Option<*const u8> {
    None
}
