//! Loaded modules and their tracking state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use heap_leak_types::ModuleList;

use crate::critical_section::CriticalSection;
use crate::patch::{PatchOutcome, PatchTable};
use crate::symbols::SymbolGateway;
use crate::Result;

/// Modules never patched and whose allocations are never tracked: the C library, the loader and
/// the kernel-provided shared object.
pub const ALWAYS_EXCLUDED: &[&str] = &[
    "libc.so",
    "libc-",
    "ld-linux",
    "ld64.so",
    "linux-vdso",
    "linux-gate",
    "libdl.so",
    "libpthread.so",
    "libgcc_s.so",
];

/// A module mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    /// Lowest mapped address.
    pub low: usize,
    /// One past the highest mapped address.
    pub high: usize,
    pub path: PathBuf,
    /// Difference between run-time and link-time addresses.
    pub bias: usize,
    /// Run-time address of the dynamic section, zero if there is none.
    pub dynamic: usize,
    pub main_program: bool,
}

impl LoadedModule {
    pub fn new(low: usize, high: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            low,
            high,
            path: path.into(),
            bias: low,
            dynamic: 0,
            main_program: false,
        }
    }

    /// File name of the module.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    pub fn contains(&self, address: usize) -> bool {
        self.low <= address && address < self.high
    }
}

/// Enumerate the modules currently mapped, main program first.
#[cfg(target_os = "linux")]
pub fn loaded_modules() -> Vec<LoadedModule> {
    use std::ffi::{c_int, c_void, CStr};

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let modules = &mut *(data as *mut Vec<LoadedModule>);
        let info = &*info;
        let bias = info.dlpi_addr as usize;
        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let mut low = usize::MAX;
        let mut high = 0;
        let mut dynamic = 0;
        for header in headers {
            match header.p_type {
                libc::PT_LOAD => {
                    low = low.min(bias + header.p_vaddr as usize);
                    high = high.max(bias + (header.p_vaddr + header.p_memsz) as usize);
                }
                libc::PT_DYNAMIC => dynamic = bias + header.p_vaddr as usize,
                _ => {}
            }
        }
        if low >= high {
            return 0;
        }
        let name = if info.dlpi_name.is_null() {
            ""
        } else {
            CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
        };
        modules.push(LoadedModule {
            low,
            high,
            path: PathBuf::from(name),
            bias,
            dynamic,
            main_program: modules.is_empty(),
        });
        0
    }

    let mut modules: Vec<LoadedModule> = Vec::new();
    // SAFETY: the callback only reads the headers handed to it and appends to `modules`.
    unsafe {
        libc::dl_iterate_phdr(Some(visit), &mut modules as *mut _ as *mut c_void);
    }
    for module in &mut modules {
        if module.main_program && module.path.as_os_str().is_empty() {
            if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
                module.path = exe;
            }
        }
    }
    modules
}

#[cfg(not(target_os = "linux"))]
pub fn loaded_modules() -> Vec<LoadedModule> {
    Vec::new()
}

/// Tracking state of one module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    /// Neither patched nor tracked.
    pub excluded: bool,
    pub symbols_loaded: bool,
    /// The module containing the tracker itself.
    pub is_tracker: bool,
    pub patched: bool,
    /// Mapped after the initial attach, so a `dlclose` may unmap it again.
    pub unloadable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub module: LoadedModule,
    pub flags: ModuleFlags,
}

/// Non-overlapping address ranges ordered by their low end.
#[derive(Debug, Default)]
pub struct ModuleSet {
    records: BTreeMap<usize, ModuleRecord>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Default::default()
    }

    /// Insert a record, evicting any record whose range overlaps it.
    pub fn insert(&mut self, record: ModuleRecord) -> Vec<ModuleRecord> {
        let (low, high) = (record.module.low, record.module.high);
        let overlapping: Vec<usize> = self
            .records
            .range(..high)
            .rev()
            .take_while(|(_, existing)| existing.module.high > low)
            .map(|(start, _)| *start)
            .collect();
        let evicted = overlapping
            .into_iter()
            .filter_map(|start| self.records.remove(&start))
            .collect();
        self.records.insert(low, record);
        evicted
    }

    pub fn remove(&mut self, low: usize) -> Option<ModuleRecord> {
        self.records.remove(&low)
    }

    /// The record whose range contains `address`.
    pub fn lookup(&self, address: usize) -> Option<&ModuleRecord> {
        self.records
            .range(..=address)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.module.contains(address))
    }

    pub fn lookup_mut(&mut self, address: usize) -> Option<&mut ModuleRecord> {
        self.records
            .range_mut(..=address)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.module.contains(address))
    }

    pub fn get(&self, low: usize) -> Option<&ModuleRecord> {
        self.records.get(&low)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Applies a [`PatchTable`] to a module's import table.
pub trait ModulePatcher: Send + Sync {
    fn patch(&self, module: &LoadedModule, patches: &PatchTable) -> Result<PatchOutcome>;

    fn restore(&self, module: &LoadedModule, patches: &PatchTable) -> Result<usize>;
}

/// Patcher for hosts without import tables to rewrite.
#[derive(Debug, Default)]
pub struct NoPatching;

impl ModulePatcher for NoPatching {
    fn patch(&self, _module: &LoadedModule, _patches: &PatchTable) -> Result<PatchOutcome> {
        Ok(PatchOutcome::default())
    }

    fn restore(&self, _module: &LoadedModule, _patches: &PatchTable) -> Result<usize> {
        Ok(0)
    }
}

/// How an address relates to the tracked modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Inside a module whose allocations are tracked.
    Tracked,
    /// Inside an excluded module.
    Excluded,
    /// Outside every known module.
    Unknown,
}

/// Result of reconciling the module set with the loader.
#[derive(Debug, Default)]
pub struct Refresh {
    pub attached: Vec<LoadedModule>,
    pub detached: Vec<LoadedModule>,
}

fn tracker_anchor() {}

/// Keeps the module set in sync with the loader and patches every tracked module.
pub struct ModuleTracker {
    modules: CriticalSection<ModuleSet>,
    list: ModuleList,
    patches: PatchTable,
    patcher: Box<dyn ModulePatcher>,
    anchor: usize,
    tracker_low: AtomicUsize,
    tracker_high: AtomicUsize,
}

impl ModuleTracker {
    pub fn new(list: ModuleList, patches: PatchTable, patcher: Box<dyn ModulePatcher>) -> Self {
        Self::with_anchor(list, patches, patcher, tracker_anchor as usize)
    }

    /// A tracker that considers the module containing `anchor` to be its own.
    pub fn with_anchor(
        list: ModuleList,
        patches: PatchTable,
        patcher: Box<dyn ModulePatcher>,
        anchor: usize,
    ) -> Self {
        Self {
            modules: CriticalSection::new(ModuleSet::new()),
            list,
            patches,
            patcher,
            anchor,
            tracker_low: AtomicUsize::new(0),
            tracker_high: AtomicUsize::new(0),
        }
    }

    pub fn patches(&self) -> &PatchTable {
        &self.patches
    }

    /// `true` for addresses inside the tracker's own module, when that module is a library.
    ///
    /// Lock-free so stack capture can call it while other locks are held.
    pub fn is_tracker_address(&self, address: usize) -> bool {
        let low = self.tracker_low.load(Ordering::Relaxed);
        let high = self.tracker_high.load(Ordering::Relaxed);
        low <= address && address < high
    }

    fn flags_for(&self, module: &LoadedModule) -> ModuleFlags {
        let name = module.name();
        let is_tracker = module.contains(self.anchor);
        let excluded = (is_tracker && !module.main_program)
            || ALWAYS_EXCLUDED.iter().any(|prefix| name.starts_with(prefix))
            || !self.list.allows(&name);
        ModuleFlags {
            excluded,
            symbols_loaded: false,
            is_tracker,
            patched: false,
            unloadable: false,
        }
    }

    /// Record a newly seen module: load its symbols and, unless excluded, patch it.
    ///
    /// Returns `false` if the module was already attached.
    pub fn attach(&self, module: LoadedModule, gateway: &SymbolGateway) -> bool {
        self.attach_as(module, gateway, false)
    }

    fn attach_as(&self, module: LoadedModule, gateway: &SymbolGateway, unloadable: bool) -> bool {
        if self
            .modules
            .enter()
            .get(module.low)
            .map_or(false, |record| record.module == module)
        {
            return false;
        }
        let mut flags = self.flags_for(&module);
        flags.unloadable = unloadable && !module.main_program;
        if flags.is_tracker && !module.main_program {
            self.tracker_low.store(module.low, Ordering::Relaxed);
            self.tracker_high.store(module.high, Ordering::Relaxed);
        }
        gateway.load_module(&module);
        flags.symbols_loaded = true;
        if !flags.excluded {
            flags.patched = self.apply_patches(&module);
        }
        log::debug!(
            "attached {} [{:#x}, {:#x}){}",
            module.path.display(),
            module.low,
            module.high,
            if flags.excluded { " (excluded)" } else { "" }
        );
        let evicted = self.modules.enter().insert(ModuleRecord { module, flags });
        for record in evicted {
            gateway.unload_module(record.module.low);
        }
        true
    }

    fn apply_patches(&self, module: &LoadedModule) -> bool {
        match self.patcher.patch(module, &self.patches) {
            Ok(outcome) => {
                log::trace!("patched {}: {:?}", module.name(), outcome);
                outcome.patched + outcome.already > 0
            }
            Err(err) => {
                log::warn!("cannot patch {}: {}", module.path.display(), err);
                false
            }
        }
    }

    /// Forget the module mapped at `low` and drop its symbols.
    pub fn detach(&self, low: usize, gateway: &SymbolGateway) -> Option<ModuleRecord> {
        let record = self.modules.enter().remove(low)?;
        if record.flags.symbols_loaded {
            gateway.unload_module(low);
        }
        log::debug!("detached {}", record.module.path.display());
        Some(record)
    }

    /// Attach every module the loader reports that is not attached yet.
    pub fn attach_all(&self, gateway: &SymbolGateway) -> Vec<LoadedModule> {
        gateway
            .enumerate_modules()
            .into_iter()
            .filter(|module| self.attach(module.clone(), gateway))
            .collect()
    }

    /// Reconcile with the loader: attach new modules and detach vanished ones.
    pub fn refresh(&self, gateway: &SymbolGateway) -> Refresh {
        self.refresh_with(gateway, |_| {})
    }

    /// Like [`ModuleTracker::refresh`], calling `unloading` for each vanished module while its
    /// symbols are still loaded.
    pub fn refresh_with<F: FnMut(&LoadedModule)>(
        &self,
        gateway: &SymbolGateway,
        mut unloading: F,
    ) -> Refresh {
        let current = gateway.enumerate_modules();
        let vanished: Vec<LoadedModule> = self
            .modules
            .enter()
            .iter()
            .filter(|record| !current.iter().any(|module| *module == record.module))
            .map(|record| record.module.clone())
            .collect();
        let mut refresh = Refresh::default();
        for module in vanished {
            unloading(&module);
            if let Some(record) = self.detach(module.low, gateway) {
                refresh.detached.push(record.module);
            }
        }
        for module in current {
            if self.attach_as(module.clone(), gateway, true) {
                refresh.attached.push(module);
            }
        }
        refresh
    }

    /// Address ranges of the modules a `dlclose` could unmap.
    pub fn unloadable_ranges(&self) -> Vec<(usize, usize)> {
        self.modules
            .enter()
            .iter()
            .filter(|record| record.flags.unloadable)
            .map(|record| (record.module.low, record.module.high))
            .collect()
    }

    pub fn classify(&self, address: usize) -> AddressClass {
        match self.modules.enter().lookup(address) {
            Some(record) if record.flags.excluded => AddressClass::Excluded,
            Some(_) => AddressClass::Tracked,
            None => AddressClass::Unknown,
        }
    }

    pub fn lookup(&self, address: usize) -> Option<ModuleRecord> {
        self.modules.enter().lookup(address).cloned()
    }

    /// The attached module loaded from `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<ModuleRecord> {
        self.modules
            .enter()
            .iter()
            .find(|record| record.module.path == path)
            .cloned()
    }

    /// Include or exclude the module containing `address`. Newly included modules are patched.
    pub fn set_excluded(&self, address: usize, excluded: bool) -> Option<ModuleRecord> {
        let module = {
            let mut modules = self.modules.enter();
            let record = modules.lookup_mut(address)?;
            record.flags.excluded = excluded;
            if excluded || record.flags.patched {
                return Some(record.clone());
            }
            record.module.clone()
        };
        let patched = self.apply_patches(&module);
        let mut modules = self.modules.enter();
        let record = modules.lookup_mut(address)?;
        record.flags.patched |= patched;
        Some(record.clone())
    }

    /// Undo the patches of every attached module.
    pub fn restore_all(&self) -> usize {
        let patched: Vec<LoadedModule> = self
            .modules
            .enter()
            .iter()
            .filter(|record| record.flags.patched)
            .map(|record| record.module.clone())
            .collect();
        let mut restored = 0;
        for module in patched {
            match self.patcher.restore(&module, &self.patches) {
                Ok(count) => restored += count,
                Err(err) => log::warn!("cannot restore {}: {}", module.path.display(), err),
            }
        }
        for record in self.modules.enter().records.values_mut() {
            record.flags.patched = false;
        }
        restored
    }

    pub fn snapshot(&self) -> Vec<ModuleRecord> {
        self.modules.enter().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, Clone)]
    struct CountingPatcher {
        patched: Arc<Mutex<Vec<String>>>,
    }

    impl ModulePatcher for CountingPatcher {
        fn patch(&self, module: &LoadedModule, _patches: &PatchTable) -> Result<PatchOutcome> {
            self.patched.lock().unwrap().push(module.name());
            Ok(PatchOutcome {
                patched: 1,
                ..Default::default()
            })
        }

        fn restore(&self, _module: &LoadedModule, _patches: &PatchTable) -> Result<usize> {
            Ok(1)
        }
    }

    fn module(low: usize, high: usize, path: &str) -> LoadedModule {
        LoadedModule::new(low, high, path)
    }

    #[test]
    fn set_lookup_respects_ranges() {
        let mut set = ModuleSet::new();
        set.insert(ModuleRecord {
            module: module(0x1000, 0x2000, "/lib/a.so"),
            flags: Default::default(),
        });
        set.insert(ModuleRecord {
            module: module(0x3000, 0x4000, "/lib/b.so"),
            flags: Default::default(),
        });
        assert_eq!(set.lookup(0x1000).unwrap().module.name(), "a.so");
        assert_eq!(set.lookup(0x1fff).unwrap().module.name(), "a.so");
        assert!(set.lookup(0x2000).is_none());
        assert!(set.lookup(0x0fff).is_none());
        assert_eq!(set.lookup(0x3800).unwrap().module.name(), "b.so");
    }

    #[test]
    fn set_evicts_overlaps() {
        let mut set = ModuleSet::new();
        let ranges = [(0x1000, 0x2000, "a"), (0x2000, 0x3000, "b"), (0x4000, 0x5000, "c")];
        for (low, high, path) in ranges {
            set.insert(ModuleRecord {
                module: module(low, high, path),
                flags: Default::default(),
            });
        }
        let evicted = set.insert(ModuleRecord {
            module: module(0x1800, 0x2800, "d"),
            flags: Default::default(),
        });
        assert_eq!(evicted.len(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.lookup(0x4100).unwrap().module.name(), "c");
    }

    #[test]
    fn attach_patches_included_modules_only() {
        let engine = ScriptedEngine::default();
        engine.set_modules(vec![
            module(0x1000, 0x2000, "/usr/bin/app"),
            module(0x3000, 0x4000, "/lib/libc.so.6"),
            module(0x5000, 0x6000, "/lib/libskip.so"),
            module(0x7000, 0x8000, "/lib/libtracker.so"),
        ]);
        let gateway = SymbolGateway::new(Box::new(engine));
        let patcher = CountingPatcher::default();
        let tracker = ModuleTracker::with_anchor(
            ModuleList::Exclude(vec!["libskip".into()]),
            PatchTable::new(),
            Box::new(patcher.clone()),
            0x7100,
        );

        assert_eq!(tracker.attach_all(&gateway).len(), 4);
        assert_eq!(*patcher.patched.lock().unwrap(), vec!["app".to_owned()]);
        assert_eq!(tracker.classify(0x1500), AddressClass::Tracked);
        assert_eq!(tracker.classify(0x3500), AddressClass::Excluded);
        assert_eq!(tracker.classify(0x5500), AddressClass::Excluded);
        assert_eq!(tracker.classify(0x9000), AddressClass::Unknown);
        assert!(tracker.is_tracker_address(0x7800));
        assert!(!tracker.is_tracker_address(0x1800));

        // Already attached modules are not patched again.
        assert!(tracker.attach_all(&gateway).is_empty());
        assert_eq!(patcher.patched.lock().unwrap().len(), 1);
    }

    #[test]
    fn refresh_follows_the_loader() {
        let engine = ScriptedEngine::default();
        engine.set_modules(vec![
            module(0x1000, 0x2000, "/usr/bin/app"),
            module(0x3000, 0x4000, "/lib/liba.so"),
        ]);
        let gateway = SymbolGateway::new(Box::new(engine.clone()));
        let tracker = ModuleTracker::with_anchor(
            ModuleList::default(),
            PatchTable::new(),
            Box::new(NoPatching),
            0,
        );
        tracker.attach_all(&gateway);
        assert!(tracker.unloadable_ranges().is_empty());

        engine.set_modules(vec![
            module(0x1000, 0x2000, "/usr/bin/app"),
            module(0x5000, 0x6000, "/lib/libb.so"),
        ]);
        let refresh = tracker.refresh(&gateway);
        assert_eq!(refresh.detached.len(), 1);
        assert_eq!(refresh.detached[0].name(), "liba.so");
        assert_eq!(refresh.attached.len(), 1);
        assert_eq!(refresh.attached[0].name(), "libb.so");
        assert_eq!(engine.unloaded(), vec![0x3000]);
        assert!(tracker.find_by_path(Path::new("/lib/libb.so")).is_some());
        assert_eq!(tracker.unloadable_ranges(), vec![(0x5000, 0x6000)]);
    }

    #[test]
    fn vanished_modules_are_announced_before_detach() {
        let engine = ScriptedEngine::default();
        engine.set_modules(vec![
            module(0x1000, 0x2000, "/usr/bin/app"),
            module(0x3000, 0x4000, "/lib/liba.so"),
            module(0x5000, 0x6000, "/lib/libb.so"),
        ]);
        let gateway = SymbolGateway::new(Box::new(engine.clone()));
        let tracker = ModuleTracker::with_anchor(
            ModuleList::default(),
            PatchTable::new(),
            Box::new(NoPatching),
            0,
        );
        tracker.attach_all(&gateway);

        engine.set_modules(vec![module(0x1000, 0x2000, "/usr/bin/app")]);
        let mut announced = Vec::new();
        tracker.refresh_with(&gateway, |module| {
            // Still attached, so its symbols are still loaded.
            assert!(engine.unloaded().iter().all(|low| *low != module.low));
            announced.push(module.name());
        });
        assert_eq!(announced, vec!["liba.so".to_owned(), "libb.so".to_owned()]);
        assert_eq!(engine.unloaded(), vec![0x3000, 0x5000]);
    }

    #[test]
    fn excluding_and_including_modules() {
        let engine = ScriptedEngine::default();
        engine.set_modules(vec![module(0x1000, 0x2000, "/lib/libx.so")]);
        let gateway = SymbolGateway::new(Box::new(engine));
        let patcher = CountingPatcher::default();
        let tracker = ModuleTracker::with_anchor(
            ModuleList::Include(vec!["liby".into()]),
            PatchTable::new(),
            Box::new(patcher.clone()),
            0,
        );
        tracker.attach_all(&gateway);
        assert_eq!(tracker.classify(0x1800), AddressClass::Excluded);
        assert!(patcher.patched.lock().unwrap().is_empty());

        let record = tracker.set_excluded(0x1800, false).unwrap();
        assert!(record.flags.patched);
        assert_eq!(tracker.classify(0x1800), AddressClass::Tracked);
        assert!(tracker.set_excluded(0x9000, false).is_none());
        assert_eq!(tracker.restore_all(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loader_lists_this_program() {
        let modules = loaded_modules();
        assert!(modules[0].main_program);
        let anchor = tracker_anchor as usize;
        assert!(modules.iter().any(|module| module.contains(anchor)));
    }
}
