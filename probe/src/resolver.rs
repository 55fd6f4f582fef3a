//! Symbol resolution across loaded modules
//!
//! Modules are enumerated again on every call, so images loaded after startup are found
//! without any explicit refresh.

use std::ffi::CString;
use std::fmt;

use log::debug;

use crate::elf::{loaded_modules, LoadedModule, SymbolEntry};
use crate::error::ResolveError;

/// Selects the modules a lookup or an indirection hook applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LibraryMatcher {
    /// Every loaded module, in load order.
    Any,
    /// The executable itself.
    MainProgram,
    /// A module whose path is exactly this string.
    Exact(String),
    /// A module whose file name is this string, e.g. `libc.so.6`.
    FileName(String),
    /// A module whose path contains this fragment.
    Contains(String),
}

impl LibraryMatcher {
    pub fn matches(&self, module: &LoadedModule) -> bool {
        match self {
            LibraryMatcher::Any => true,
            LibraryMatcher::MainProgram => module.is_main_program(),
            LibraryMatcher::Exact(path) => module.path == *path,
            LibraryMatcher::FileName(name) => module.file_name() == name,
            LibraryMatcher::Contains(fragment) => module.path.contains(fragment.as_str()),
        }
    }
}

impl From<&str> for LibraryMatcher {
    /// Paths match exactly, bare names match the file name.
    fn from(library: &str) -> Self {
        if library.contains('/') {
            LibraryMatcher::Exact(library.to_string())
        } else {
            LibraryMatcher::FileName(library.to_string())
        }
    }
}

impl fmt::Display for LibraryMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryMatcher::Any => write!(f, "*"),
            LibraryMatcher::MainProgram => write!(f, "<main>"),
            LibraryMatcher::Exact(path) => write!(f, "{}", path),
            LibraryMatcher::FileName(name) => write!(f, "{}", name),
            LibraryMatcher::Contains(fragment) => write!(f, "*{}*", fragment),
        }
    }
}

/// Run-time location of a function or object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub address: usize,
    pub size: usize,
    /// Path of the defining module.
    pub module: String,
}

/// Modules selected by `matcher`, in load order.
pub fn matching_modules(matcher: &LibraryMatcher) -> Vec<LoadedModule> {
    loaded_modules()
        .into_iter()
        .filter(|module| matcher.matches(module))
        .collect()
}

/// First definition of `symbol` in load order among the modules `matcher` selects.
pub fn resolve(matcher: &LibraryMatcher, symbol: &str) -> Result<ResolvedSymbol, ResolveError> {
    matching_modules(matcher)
        .iter()
        .find_map(|module| define(module, symbol))
        .ok_or_else(|| not_found(matcher, symbol))
}

/// Like [`resolve`], but fails if more than one module defines `symbol`.
pub fn resolve_strict(
    matcher: &LibraryMatcher,
    symbol: &str,
) -> Result<ResolvedSymbol, ResolveError> {
    let mut found: Vec<ResolvedSymbol> = matching_modules(matcher)
        .iter()
        .filter_map(|module| define(module, symbol))
        .collect();
    match found.len() {
        0 => Err(not_found(matcher, symbol)),
        1 => Ok(found.remove(0)),
        _ => Err(ResolveError::AmbiguousMatch {
            symbol: symbol.to_string(),
            modules: found.into_iter().map(|resolved| resolved.module).collect(),
        }),
    }
}

/// The module whose loaded segments contain `address`.
pub fn module_of(address: usize) -> Option<LoadedModule> {
    loaded_modules()
        .into_iter()
        .find(|module| module.contains(address))
}

fn not_found(matcher: &LibraryMatcher, symbol: &str) -> ResolveError {
    debug!("symbol {} not found in {}", symbol, matcher);
    ResolveError::NotFound {
        library: matcher.to_string(),
        symbol: symbol.to_string(),
    }
}

fn define(module: &LoadedModule, symbol: &str) -> Option<ResolvedSymbol> {
    let SymbolEntry {
        address,
        size,
        indirect,
    } = module.dynamic()?.lookup(symbol)?;
    let address = if indirect {
        select_implementation(module, symbol)?
    } else {
        address
    };
    Some(ResolvedSymbol {
        address,
        size,
        module: module.path.clone(),
    })
}

/// IFUNC symbols name a resolver; the loader knows which implementation it picked.
fn select_implementation(module: &LoadedModule, symbol: &str) -> Option<usize> {
    let symbol = CString::new(symbol).ok()?;
    let path = if module.is_main_program() {
        None
    } else {
        Some(CString::new(module.path.as_str()).ok()?)
    };
    // SAFETY: RTLD_NOLOAD never maps a new image; the handle is closed before returning.
    unsafe {
        let handle = libc::dlopen(
            path.as_ref().map_or(std::ptr::null(), |path| path.as_ptr()),
            libc::RTLD_NOLOAD | libc::RTLD_LAZY,
        );
        if handle.is_null() {
            return None;
        }
        let address = libc::dlsym(handle, symbol.as_ptr());
        libc::dlclose(handle);
        (!address.is_null()).then_some(address as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str, index: usize) -> LoadedModule {
        let mut module = loaded_modules().remove(0);
        module.path = path.to_string();
        module.index = index;
        module
    }

    #[test]
    fn test_matchers() {
        let libc = module("/usr/lib/x86_64-linux-gnu/libc.so.6", 3);
        assert!(LibraryMatcher::Any.matches(&libc));
        assert!(!LibraryMatcher::MainProgram.matches(&libc));
        assert!(LibraryMatcher::from("libc.so.6").matches(&libc));
        assert!(!LibraryMatcher::from("libc.so").matches(&libc));
        assert!(LibraryMatcher::from("/usr/lib/x86_64-linux-gnu/libc.so.6").matches(&libc));
        assert!(LibraryMatcher::Contains("libc.so".to_string()).matches(&libc));

        let main = module("/data/app/demo", 0);
        assert!(LibraryMatcher::MainProgram.matches(&main));
    }

    #[test]
    fn test_matcher_display() {
        assert_eq!(LibraryMatcher::MainProgram.to_string(), "<main>");
        assert_eq!(LibraryMatcher::from("libexample.so").to_string(), "libexample.so");
        assert_eq!(
            LibraryMatcher::Contains("example".to_string()).to_string(),
            "*example*"
        );
    }
}
