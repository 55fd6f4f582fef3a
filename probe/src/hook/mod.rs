//! Function hooking
//!
//! Two strategies redirect calls to a handler:
//!
//! * [`Strategy::Indirection`] swaps the relocated pointer a caller module calls through
//!   (PLT jump slots and `GLOB_DAT` entries). Only calls from the selected modules are
//!   intercepted.
//! * [`Strategy::Inline`] overwrites the entry of the function itself and keeps the displaced
//!   instructions in a trampoline, so every caller is intercepted.
//!
//! Every (module, symbol) pair for indirection hooks and every entry address for inline
//! hooks is a *site*. Sites have their own lock, so hooks on different functions never wait
//! on each other. A handler reaches the hooked implementation through
//! [`HookHandle::original`] or the cell given to [`HookSpec::store_original`]; the engine
//! keeps both pointing at the unhooked code, even when both strategies hook the same
//! function.

mod got;
mod inline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::error::HookError;
use crate::resolver::{self, LibraryMatcher};

/// How a hook redirects calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Rewrite the indirect call table entries of caller modules.
    Indirection,
    /// Patch the first instructions of the target function.
    Inline,
}

/// Lifecycle of a site.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SiteState {
    Uninstalled,
    Installed,
    /// Patching or restoring failed part way; the site may be installed again.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SiteKey {
    Slots { module: String, symbol: String },
    Entry { address: usize },
}

#[derive(Debug, Clone)]
enum Target {
    Symbol {
        library: LibraryMatcher,
        symbol: String,
    },
    Address {
        name: String,
        address: usize,
    },
}

impl Target {
    fn name(&self) -> &str {
        match self {
            Target::Symbol { symbol, .. } => symbol,
            Target::Address { name, .. } => name,
        }
    }
}

/// What to hook and how.
#[derive(Debug, Clone)]
pub struct HookSpec {
    strategy: Strategy,
    target: Target,
    replace: bool,
    original: Option<&'static AtomicUsize>,
}

impl HookSpec {
    /// Intercept calls to `symbol` made from the modules `callers` selects.
    pub fn indirection(callers: impl Into<LibraryMatcher>, symbol: &str) -> Self {
        Self::new(
            Strategy::Indirection,
            Target::Symbol {
                library: callers.into(),
                symbol: symbol.to_string(),
            },
        )
    }

    /// Patch the definition of `symbol` found in the modules `library` selects.
    pub fn inline(library: impl Into<LibraryMatcher>, symbol: &str) -> Self {
        Self::new(
            Strategy::Inline,
            Target::Symbol {
                library: library.into(),
                symbol: symbol.to_string(),
            },
        )
    }

    /// Patch the function starting at `address`, which need not be exported.
    pub fn inline_at(name: &str, address: usize) -> Self {
        Self::new(
            Strategy::Inline,
            Target::Address {
                name: name.to_string(),
                address,
            },
        )
    }

    fn new(strategy: Strategy, target: Target) -> Self {
        HookSpec {
            strategy,
            target,
            replace: false,
            original: None,
        }
    }

    /// Take over sites another handle installed instead of failing with `AlreadyInstalled`.
    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }

    /// Publish the original implementation into `cell` before any call is redirected.
    pub fn store_original(mut self, cell: &'static AtomicUsize) -> Self {
        self.original = Some(cell);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

/// The place the original implementation's address is published.
#[derive(Debug, Clone)]
struct OriginalCells {
    shared: Arc<AtomicUsize>,
    user: Option<&'static AtomicUsize>,
}

impl OriginalCells {
    fn publish(&self, address: usize) {
        self.shared.store(address, Ordering::SeqCst);
        if let Some(cell) = self.user {
            cell.store(address, Ordering::SeqCst);
        }
    }
}

/// An installed redirection that can be taken out again.
trait Interception: Send {
    /// Address that runs the code the site redirects away from.
    fn original(&self) -> usize;

    /// Restore the bytes or pointers the interception replaced.
    fn remove(&mut self) -> Result<(), HookError>;
}

struct HookSite {
    library: String,
    symbol: String,
    /// Function calls are redirected away from.
    address: usize,
    handler: usize,
    original: usize,
    state: SiteState,
    owner: u64,
    cells: Option<OriginalCells>,
    patch: Option<Box<dyn Interception>>,
}

impl HookSite {
    fn vacant(library: String, symbol: String, address: usize) -> Self {
        HookSite {
            library,
            symbol,
            address,
            handler: 0,
            original: 0,
            state: SiteState::Uninstalled,
            owner: 0,
            cells: None,
            patch: None,
        }
    }

    fn retarget(&mut self, original: usize) {
        self.original = original;
        if let Some(cells) = &self.cells {
            cells.publish(original);
        }
    }

    /// Take out the current patch, whoever owns it.
    fn clear(&mut self) -> Result<(), HookError> {
        if let Some(mut patch) = self.patch.take() {
            if let Err(err) = patch.remove() {
                self.patch = Some(patch);
                self.state = SiteState::Failed;
                return Err(err);
            }
        }
        self.state = SiteState::Uninstalled;
        self.cells = None;
        Ok(())
    }
}

/// Public view of a site, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub strategy: Strategy,
    pub library: String,
    pub symbol: String,
    pub address: usize,
    pub handler: usize,
    pub original: usize,
    pub state: SiteState,
}

/// Returned by [`HookEngine::install`]; identifies the sites of one installation.
#[derive(Debug, Clone)]
pub struct HookHandle {
    id: u64,
    strategy: Strategy,
    symbol: String,
    keys: Vec<SiteKey>,
    original: Arc<AtomicUsize>,
}

impl HookHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Address of the unhooked implementation.
    pub fn original(&self) -> usize {
        self.original.load(Ordering::SeqCst)
    }

    /// The unhooked implementation as a function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the hooked function's signature.
    pub unsafe fn original_fn<F: Copy>(&self) -> F {
        assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        let address = self.original();
        std::mem::transmute_copy(&address)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide registry of hook sites.
pub struct HookEngine {
    sites: Mutex<HashMap<SiteKey, Arc<Mutex<HookSite>>>>,
    /// Entry address to trampoline for every installed inline hook.
    trampolines: Mutex<HashMap<usize, usize>>,
    next_id: AtomicU64,
}

lazy_static! {
    static ref ENGINE: HookEngine = HookEngine::new();
}

impl HookEngine {
    fn new() -> Self {
        HookEngine {
            sites: Mutex::new(HashMap::new()),
            trampolines: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Patched code is process-global, so is the engine.
    pub fn global() -> &'static HookEngine {
        &ENGINE
    }

    /// Redirect calls described by `spec` to `handler`.
    ///
    /// On error no target is left modified.
    pub fn install(&self, spec: HookSpec, handler: usize) -> Result<HookHandle, HookError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cells = OriginalCells {
            shared: Arc::new(AtomicUsize::new(0)),
            user: spec.original,
        };
        let keys = match spec.strategy {
            Strategy::Indirection => self.install_slots(id, &spec, handler, &cells)?,
            Strategy::Inline => vec![self.install_inline(id, &spec, handler, &cells)?],
        };
        Ok(HookHandle {
            id,
            strategy: spec.strategy,
            symbol: spec.target.name().to_string(),
            keys,
            original: cells.shared,
        })
    }

    /// Restore every site of `handle`.
    ///
    /// Fails with `NotInstalled` if none of its sites is still owned by the handle.
    pub fn uninstall(&self, handle: &HookHandle) -> Result<(), HookError> {
        let mut removed = 0;
        for key in handle.keys.iter().rev() {
            let Some(site) = lock(&self.sites).get(key).cloned() else {
                continue;
            };
            let mut site = lock(&site);
            if site.state != SiteState::Installed || site.owner != handle.id {
                continue;
            }
            let trampoline = site.patch.as_ref().map(|patch| patch.original());
            site.clear()?;
            info!(
                "unhooked {} in {} at {:#x}",
                site.symbol, site.library, site.address
            );
            removed += 1;
            if let (SiteKey::Entry { address }, Some(trampoline)) = (key, trampoline) {
                drop(site);
                lock(&self.trampolines).remove(address);
                debug!("trampoline {:#x} for {:#x} retired", trampoline, address);
                self.retarget_slots(*address, *address);
            }
        }
        if removed == 0 {
            return Err(HookError::NotInstalled);
        }
        Ok(())
    }

    /// Whether any site of `handle` is still installed on its behalf.
    pub fn is_installed(&self, handle: &HookHandle) -> bool {
        handle.keys.iter().any(|key| {
            let site = lock(&self.sites).get(key).cloned();
            site.is_some_and(|site| {
                let site = lock(&site);
                site.state == SiteState::Installed && site.owner == handle.id
            })
        })
    }

    pub fn sites(&self) -> Vec<SiteInfo> {
        let sites: Vec<_> = lock(&self.sites)
            .iter()
            .map(|(key, site)| (key.clone(), site.clone()))
            .collect();
        sites
            .into_iter()
            .map(|(key, site)| {
                let site = lock(&site);
                SiteInfo {
                    strategy: match key {
                        SiteKey::Slots { .. } => Strategy::Indirection,
                        SiteKey::Entry { .. } => Strategy::Inline,
                    },
                    library: site.library.clone(),
                    symbol: site.symbol.clone(),
                    address: site.address,
                    handler: site.handler,
                    original: site.original,
                    state: site.state,
                }
            })
            .collect()
    }

    fn site(&self, key: SiteKey, vacant: impl FnOnce() -> HookSite) -> Arc<Mutex<HookSite>> {
        lock(&self.sites)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(vacant())))
            .clone()
    }

    fn install_slots(
        &self,
        id: u64,
        spec: &HookSpec,
        handler: usize,
        cells: &OriginalCells,
    ) -> Result<Vec<SiteKey>, HookError> {
        let Target::Symbol { library, symbol } = &spec.target else {
            return Err(HookError::SymbolNotFound {
                library: String::new(),
                symbol: spec.target.name().to_string(),
            });
        };
        // Lazily bound jump slots still point into the caller's PLT.
        let implementation = resolver::resolve(&LibraryMatcher::Any, symbol)
            .ok()
            .map(|resolved| resolved.address);

        let callers: Vec<_> = resolver::matching_modules(library)
            .into_iter()
            .filter_map(|module| {
                let slots = module.dynamic()?.slots_for(symbol);
                (!slots.is_empty()).then_some((module, slots))
            })
            .collect();
        if callers.is_empty() {
            debug!("no relocation of {} in {}", symbol, library);
            return Err(HookError::SymbolNotFound {
                library: library.to_string(),
                symbol: symbol.clone(),
            });
        }

        let mut installed = Vec::new();
        for (module, slots) in callers {
            let key = SiteKey::Slots {
                module: module.path.clone(),
                symbol: symbol.clone(),
            };
            let site = self.site(key.clone(), || {
                HookSite::vacant(module.path.clone(), symbol.clone(), 0)
            });
            let mut site = lock(&site);
            let result = self.claim(&mut site, spec.replace, &module.path).and_then(|()| {
                let target = got::SlotPatch::target_of(&module, &slots, implementation);
                let original = lock(&self.trampolines)
                    .get(&target)
                    .copied()
                    .unwrap_or(target);
                cells.publish(original);
                let patch = got::SlotPatch::apply(&slots, handler, original)?;
                info!(
                    "hooked {} in {}: {} slot(s), {:#x} -> {:#x}",
                    symbol,
                    module.path,
                    slots.len(),
                    target,
                    handler
                );
                site.address = target;
                site.handler = handler;
                site.original = original;
                site.owner = id;
                site.cells = Some(cells.clone());
                site.patch = Some(Box::new(patch));
                site.state = SiteState::Installed;
                Ok(())
            });
            if let Err(err) = result {
                if site.state != SiteState::Installed {
                    site.state = SiteState::Failed;
                }
                drop(site);
                self.roll_back(id, &installed);
                return Err(err);
            }
            installed.push(key);
        }
        Ok(installed)
    }

    /// Fails unless the site is free or `replace` allows taking it over.
    fn claim(&self, site: &mut HookSite, replace: bool, library: &str) -> Result<(), HookError> {
        if site.state == SiteState::Installed {
            if !replace {
                return Err(HookError::AlreadyInstalled {
                    library: library.to_string(),
                    symbol: site.symbol.clone(),
                });
            }
            warn!(
                "replacing hook on {} in {} (handler {:#x})",
                site.symbol, library, site.handler
            );
            site.clear()?;
        }
        Ok(())
    }

    fn install_inline(
        &self,
        id: u64,
        spec: &HookSpec,
        handler: usize,
        cells: &OriginalCells,
    ) -> Result<SiteKey, HookError> {
        let (library, name, entry) = match &spec.target {
            Target::Symbol { library, symbol } => {
                let resolved = resolver::resolve(library, symbol)?;
                (resolved.module, symbol.clone(), resolved.address)
            }
            Target::Address { name, address } => {
                let module = resolver::module_of(*address)
                    .map(|module| module.path)
                    .unwrap_or_default();
                (module, name.clone(), *address)
            }
        };

        let key = SiteKey::Entry { address: entry };
        let site = self.site(key.clone(), || {
            HookSite::vacant(library.clone(), name.clone(), entry)
        });
        let mut site = lock(&site);
        if site.state == SiteState::Installed {
            self.claim(&mut site, spec.replace, &library)?;
            lock(&self.trampolines).remove(&entry);
        }

        let prepared = match inline::prepare(&name, entry, handler) {
            Ok(prepared) => prepared,
            Err(err) => {
                site.state = SiteState::Failed;
                return Err(err);
            }
        };
        let trampoline = prepared.trampoline();
        cells.publish(trampoline);
        let patch = match prepared.commit() {
            Ok(patch) => patch,
            Err(err) => {
                site.state = SiteState::Failed;
                return Err(err);
            }
        };
        info!(
            "hooked {} in {} inline: {:#x} -> {:#x}, trampoline {:#x}",
            name, library, entry, handler, trampoline
        );
        site.library = library;
        site.handler = handler;
        site.original = trampoline;
        site.owner = id;
        site.cells = Some(cells.clone());
        site.patch = Some(Box::new(patch));
        site.state = SiteState::Installed;
        drop(site);

        lock(&self.trampolines).insert(entry, trampoline);
        self.retarget_slots(entry, trampoline);
        Ok(key)
    }

    /// Point the original of every indirection site that targets `entry` at `original`.
    fn retarget_slots(&self, entry: usize, original: usize) {
        let sites: Vec<_> = lock(&self.sites)
            .iter()
            .filter(|(key, _)| matches!(key, SiteKey::Slots { .. }))
            .map(|(_, site)| site.clone())
            .collect();
        for site in sites {
            let mut site = lock(&site);
            if site.state == SiteState::Installed && site.address == entry {
                debug!(
                    "{} in {} now reaches the original through {:#x}",
                    site.symbol, site.library, original
                );
                site.retarget(original);
            }
        }
    }

    fn roll_back(&self, id: u64, keys: &[SiteKey]) {
        for key in keys.iter().rev() {
            let Some(site) = lock(&self.sites).get(key).cloned() else {
                continue;
            };
            let mut site = lock(&site);
            if site.owner == id && site.state == SiteState::Installed {
                if let Err(err) = site.clear() {
                    warn!("failed to roll back {} in {}: {}", site.symbol, site.library, err);
                }
            }
        }
    }
}
