//! The tracker: one registry, one symbol gateway and one module set, fed by the hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use heap_leak_types::{Config, LeakReport, Statistics};

use crate::callstack::{CallStack, StackFilter};
use crate::capture::{capture_fast, capture_safe, outermost_caller};
use crate::context::{self, Busy};
use crate::error::Error;
use crate::hooks;
use crate::modules::{
    AddressClass, LoadedModule, ModulePatcher, ModuleRecord, ModuleTracker, Refresh,
};
use crate::patch::PatchTable;
use crate::registry::{
    BlockKind, BlockRecord, FreeOutcome, HeapHandle, HeapKind, LeakCandidate, Registry,
};
use crate::report::{self, LeakReporter, ReportSink, SinkSet};
use crate::symbols::{BacktraceEngine, SymbolEngine, SymbolGateway};
use crate::Result;

/// Tracking state of one thread, as returned by [`Tracker::disable_thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadState {
    enabled: bool,
}

impl ThreadState {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// A reallocation in flight, holding the old block's record until the real call returns.
pub(crate) struct Reallocation {
    heap: HeapHandle,
    old: usize,
    record: Option<BlockRecord>,
}

/// Builds a [`Tracker`].
pub struct TrackerBuilder {
    config: Config,
    engine: Option<Box<dyn SymbolEngine>>,
    patcher: Option<Box<dyn ModulePatcher>>,
    patches: Option<PatchTable>,
    filter: StackFilter,
    sinks: Vec<Box<dyn ReportSink>>,
    anchor: Option<usize>,
}

impl TrackerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: None,
            patcher: None,
            patches: None,
            filter: StackFilter::default(),
            sinks: Vec::new(),
            anchor: None,
        }
    }

    /// Replace the default symbol engine.
    pub fn symbol_engine(mut self, engine: Box<dyn SymbolEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Replace the platform's import table patcher.
    pub fn patcher(mut self, patcher: Box<dyn ModulePatcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Replace the default redirections.
    pub fn patch_table(mut self, patches: PatchTable) -> Self {
        self.patches = Some(patches);
        self
    }

    pub fn stack_filter(mut self, filter: StackFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Add a sink next to those the configuration selects.
    pub fn sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Treat the module containing `address` as the tracker's own.
    pub fn tracker_anchor(mut self, address: usize) -> Self {
        self.anchor = Some(address);
        self
    }

    pub fn build(self) -> Result<Arc<Tracker>> {
        context::suppress(|| {
            let engine = self
                .engine
                .unwrap_or_else(|| Box::new(BacktraceEngine::default()));
            let gateway = SymbolGateway::new(engine);
            gateway.initialize()?;

            let mut sinks = SinkSet::from_config(&self.config)?;
            for sink in self.sinks {
                sinks.push(sink);
            }

            let patcher = self.patcher.unwrap_or_else(default_patcher);
            let patches = self.patches.unwrap_or_else(hooks::default_patch_table);
            let modules = match self.anchor {
                Some(anchor) => ModuleTracker::with_anchor(
                    self.config.modules.clone(),
                    patches,
                    patcher,
                    anchor,
                ),
                None => ModuleTracker::new(self.config.modules.clone(), patches, patcher),
            };

            let registry = Registry::new();
            registry.register_heap(HeapHandle::DEFAULT, HeapKind::Process);

            log::debug!("tracker configured: {:?}", self.config);
            Ok(Arc::new(Tracker {
                enabled: AtomicBool::new(!self.config.start_disabled),
                config: self.config,
                registry,
                gateway,
                modules,
                filter: self.filter,
                sinks,
            }))
        })
    }
}

#[cfg(target_os = "linux")]
fn default_patcher() -> Box<dyn ModulePatcher> {
    Box::new(crate::elf::ElfPatcher::default())
}

#[cfg(not(target_os = "linux"))]
fn default_patcher() -> Box<dyn ModulePatcher> {
    Box::new(crate::modules::NoPatching)
}

/// Unpublishes the tracker when dropped.
#[must_use = "the tracker is uninstalled when the guard is dropped"]
pub struct InstallGuard {
    tracker: Arc<Tracker>,
}

impl InstallGuard {
    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        hooks::unpublish();
    }
}

/// The leak tracker.
pub struct Tracker {
    config: Config,
    enabled: AtomicBool,
    registry: Registry,
    gateway: SymbolGateway,
    modules: ModuleTracker,
    filter: StackFilter,
    sinks: SinkSet,
}

impl Tracker {
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    /// Make this tracker the one hooks report to.
    pub fn install(self: &Arc<Self>) -> Result<InstallGuard> {
        if !hooks::publish(self.clone()) {
            return Err(Error::AlreadyInstalled);
        }
        Ok(InstallGuard {
            tracker: self.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attach every loaded module, patching those that are tracked.
    pub fn attach_loaded_modules(&self) -> Vec<LoadedModule> {
        context::suppress(|| {
            let attached = self.modules.attach_all(&self.gateway);
            log::info!("attached {} modules", attached.len());
            attached
        })
    }

    /// Reconcile the module set with the loader after a module was mapped or unmapped.
    ///
    /// Stacks touching a vanished module are resolved before its symbols are dropped.
    pub fn refresh_modules(&self) -> Refresh {
        context::suppress(|| {
            self.modules.refresh_with(&self.gateway, |module| {
                self.resolve_range(Some((module.low, module.high)));
            })
        })
    }

    /// A module is about to be closed. Resolve every stack with a frame in the module containing
    /// `address` or in any module mapped since startup: closing one library also unmaps the
    /// dependencies only it needed.
    ///
    /// Returns the number of stacks resolved.
    pub fn prepare_module_close(&self, address: Option<usize>) -> usize {
        context::suppress(|| {
            let mut ranges = self.modules.unloadable_ranges();
            if let Some(record) = address.and_then(|address| self.modules.lookup(address)) {
                ranges.push((record.module.low, record.module.high));
            }
            ranges.sort_unstable();
            ranges.dedup();
            ranges
                .into_iter()
                .map(|range| self.resolve_range(Some(range)))
                .sum()
        })
    }

    /// The module containing `address` is about to be unmapped: resolve its stacks while its
    /// symbols are available, then forget it.
    pub fn module_unloading(&self, address: usize) -> Result<ModuleRecord> {
        context::suppress(|| {
            let record = self
                .modules
                .lookup(address)
                .ok_or(Error::ModuleNotFound(address))?;
            let resolved = self.resolve_range(Some((record.module.low, record.module.high)));
            log::debug!(
                "resolved {} stacks before unloading {}",
                resolved,
                record.module.path.display()
            );
            self.modules.detach(record.module.low, &self.gateway);
            Ok(record)
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Resume tracking on the calling thread. Returns the previous state.
    pub fn enable_thread(&self) -> ThreadState {
        ThreadState {
            enabled: context::set_thread_enabled(true),
        }
    }

    /// Stop tracking on the calling thread. Returns the previous state.
    pub fn disable_thread(&self) -> ThreadState {
        ThreadState {
            enabled: context::set_thread_enabled(false),
        }
    }

    pub fn restore_thread(&self, state: ThreadState) {
        context::set_thread_enabled(state.enabled);
    }

    /// Track the module containing `address`, patching it if necessary.
    pub fn enable_module(&self, address: usize) -> Result<()> {
        context::suppress(|| {
            self.modules
                .set_excluded(address, false)
                .map(|_| ())
                .ok_or(Error::ModuleNotFound(address))
        })
    }

    /// Stop tracking allocations made from the module containing `address`.
    pub fn disable_module(&self, address: usize) -> Result<()> {
        context::suppress(|| {
            self.modules
                .set_excluded(address, true)
                .map(|_| ())
                .ok_or(Error::ModuleNotFound(address))
        })
    }

    /// Install a hook receiving every report's text, or remove it with `None`.
    pub fn set_report_hook(&self, hook: Option<Box<dyn ReportSink>>) {
        context::suppress(|| self.sinks.set_hook(hook))
    }

    fn should_track(&self) -> bool {
        self.is_enabled() && context::thread_enabled() && !self.gateway.is_held_by_current_thread()
    }

    fn capture(&self) -> CallStack {
        let skip = |address| self.modules.is_tracker_address(address);
        if self.config.safe_stack_walk {
            capture_safe(&self.gateway, self.config.max_stack_depth, skip)
        } else {
            capture_fast(self.config.max_stack_depth, skip)
        }
    }

    /// Capture the current stack unless the allocation should not be tracked.
    ///
    /// Module exclusion goes by the code that called the outermost tracked routine, so a
    /// `malloc` made by the C++ runtime on behalf of an excluded module's `new` stays untracked.
    fn capture_for_registration(&self) -> Option<CallStack> {
        let stack = self.capture();
        let caller = outermost_caller(&stack, context::depth(), |address| {
            self.modules.is_tracker_address(address)
        });
        context::mark_registered(caller);
        if caller != 0 && self.modules.classify(caller) == AddressClass::Excluded {
            return None;
        }
        Some(stack)
    }

    pub(crate) fn on_allocated(
        &self,
        heap: HeapHandle,
        address: usize,
        size: usize,
        kind: BlockKind,
    ) {
        if address == 0 {
            return;
        }
        let _busy = match Busy::acquire() {
            Some(busy) => busy,
            None => return,
        };
        if context::already_registered() || !self.should_track() {
            return;
        }
        if let Some(stack) = self.capture_for_registration() {
            self.registry
                .register_block(heap, address, size, context::thread_id(), kind, stack);
        }
    }

    pub(crate) fn on_freed(&self, heap: HeapHandle, address: usize) {
        if address == 0 {
            return;
        }
        let outcome = {
            let _busy = match Busy::acquire() {
                Some(busy) => busy,
                None => return,
            };
            if self.gateway.is_held_by_current_thread() {
                return;
            }
            self.registry
                .unregister_block_checked(heap, address, self.config.validate_heaps)
        };
        if let FreeOutcome::Mismatch { owner } = outcome {
            self.fatal_mismatch(address, heap, owner);
        }
    }

    /// Take the block being reallocated out of the registry before the real call, so that an
    /// address released by a moving reallocation can be reused and registered by other threads.
    pub(crate) fn reallocation_starting(
        &self,
        heap: HeapHandle,
        old: usize,
    ) -> Option<Reallocation> {
        let _busy = Busy::acquire()?;
        if self.gateway.is_held_by_current_thread() {
            return None;
        }
        let record = match old {
            0 => None,
            old => self.registry.unregister_block(heap, old),
        };
        Some(Reallocation { heap, old, record })
    }

    pub(crate) fn reallocation_finished(
        &self,
        reallocation: Reallocation,
        new: usize,
        size: usize,
        kind: BlockKind,
    ) {
        let Reallocation { heap, old, record } = reallocation;
        if new == 0 {
            // A zero-sized reallocation frees; a failed one leaves the old block alone.
            if size != 0 {
                if let Some(record) = record {
                    self.registry.reinsert_block(heap, old, record);
                }
            }
            return;
        }
        let busy = Busy::acquire();
        let stack = match busy {
            Some(_) if !context::already_registered() && self.should_track() => {
                self.capture_for_registration()
            }
            _ => None,
        };
        match (stack, record) {
            (Some(stack), Some(record)) if new == old => {
                self.registry.reinsert_block(heap, old, record);
                self.registry.update_block_in_place(heap, old, size, stack);
            }
            (Some(stack), _) => {
                self.registry
                    .register_block(heap, new, size, context::thread_id(), kind, stack);
            }
            (None, Some(record)) if new == old => {
                self.registry.reinsert_block(heap, old, record);
            }
            (None, _) => {}
        }
    }

    /// Record an allocation from a heap the hooks do not see.
    pub fn record_allocation(&self, heap: HeapHandle, address: usize, size: usize) {
        self.on_allocated(heap, address, size, BlockKind::HEAP);
    }

    /// Record a reallocation on a heap the hooks do not see.
    ///
    /// `call` performs it and returns the new address, or 0 on failure. The old block is set
    /// aside while `call` runs and put back if the reallocation fails.
    pub fn record_reallocation<F: FnOnce() -> usize>(
        &self,
        heap: HeapHandle,
        old: usize,
        size: usize,
        call: F,
    ) -> usize {
        let reallocation = self.reallocation_starting(heap, old);
        let new = call();
        if let Some(reallocation) = reallocation {
            self.reallocation_finished(reallocation, new, size, BlockKind::HEAP);
        }
        new
    }

    /// Record a free to a heap the hooks do not see.
    pub fn record_free(&self, heap: HeapHandle, address: usize) {
        self.on_freed(heap, address);
    }

    /// A private heap was created.
    pub fn heap_created(&self, heap: HeapHandle) {
        context::suppress(|| {
            self.registry.register_heap(heap, HeapKind::Private);
        })
    }

    /// A private heap is about to be destroyed. Its remaining blocks are reported as leaks.
    pub fn heap_destroying(&self, heap: HeapHandle) -> LeakReport {
        let (report, text) = context::suppress(|| {
            let mut leaks = self
                .registry
                .drain_heap_as_leaks(heap, self.config.max_data_dump);
            if leaks.is_empty() {
                let report = LeakReport {
                    statistics: self.registry.statistics(),
                    ..Default::default()
                };
                return (report, None);
            }
            let report = self
                .reporter()
                .build(&mut leaks, self.registry.statistics());
            if report.is_empty() {
                return (report, None);
            }
            log::warn!(
                "heap {:#x} destroyed with {} outstanding blocks",
                heap.0,
                report.leak_count
            );
            let title = format!(
                "WARNING: heap 0x{:X} destroyed with outstanding blocks:",
                heap.0
            );
            let text = report::format_report(&report, Some(&title));
            (report, Some(text))
        });
        if let Some(text) = text {
            self.sinks.emit(&text);
        }
        report
    }

    fn reporter(&self) -> LeakReporter<'_> {
        LeakReporter {
            gateway: &self.gateway,
            filter: &self.filter,
            config: &self.config,
        }
    }

    fn store_resolutions(&self, candidates: &[LeakCandidate]) {
        for candidate in candidates {
            if candidate.stack.is_resolved() {
                self.registry.store_resolution(
                    candidate.heap,
                    candidate.address,
                    candidate.serial,
                    &candidate.stack,
                );
            }
        }
    }

    fn resolve_range(&self, range: Option<(usize, usize)>) -> usize {
        let mut stacks = self.registry.unresolved_stacks(range);
        self.reporter().resolve(&mut stacks);
        self.store_resolutions(&stacks);
        stacks.len()
    }

    /// Number of unreported leaks, optionally for one thread.
    pub fn leak_count(&self, thread: Option<usize>) -> usize {
        context::suppress(|| {
            let mut candidates = self.registry.snapshot_leaks(thread, 0);
            let count = self.reporter().count(&mut candidates);
            self.store_resolutions(&candidates);
            count
        })
    }

    /// Number of live blocks, reported or not.
    pub fn raw_outstanding(&self, thread: Option<usize>) -> usize {
        context::suppress(|| self.registry.raw_outstanding(thread))
    }

    /// Report unreported leaks to every sink and return them.
    ///
    /// Sinks and the report hook run with tracking active, so a hook freeing memory is seen.
    pub fn report(&self, thread: Option<usize>) -> LeakReport {
        let (report, text) = context::suppress(|| {
            let mut candidates = self
                .registry
                .snapshot_leaks(thread, self.config.max_data_dump);
            let report = self
                .reporter()
                .build(&mut candidates, self.registry.statistics());
            self.store_resolutions(&candidates);
            if report.is_empty() {
                log::info!("no memory leaks detected");
            } else {
                log::warn!(
                    "{} memory leaks ({} bytes)",
                    report.leak_count,
                    report.leaked_bytes
                );
            }
            let text = report::format_report(&report, None);
            (report, text)
        });
        self.sinks.emit(&text);
        report
    }

    /// Flag every live block as reported so later reports only show newer leaks.
    pub fn mark_all_reported(&self, thread: Option<usize>) -> usize {
        context::suppress(|| self.registry.mark_all_reported(thread))
    }

    /// Resolve every unresolved stack now.
    pub fn resolve_callstacks(&self) -> usize {
        context::suppress(|| self.resolve_range(None))
    }

    pub fn statistics(&self) -> Statistics {
        context::suppress(|| self.registry.statistics())
    }

    /// Final report: report leaks, stop tracking and put every patched import back.
    pub fn shutdown(&self) -> LeakReport {
        let report = self.report(None);
        self.disable();
        context::suppress(|| {
            let restored = self.modules.restore_all();
            log::debug!("restored {} import slots", restored);
        });
        report
    }

    fn fatal_mismatch(&self, address: usize, freed: HeapHandle, owner: HeapHandle) -> ! {
        let err = Error::heap_mismatch(address, freed, owner);
        log::error!("{}", err);
        self.sinks.emit(&format!("CRITICAL ERROR: {}\n", err));
        std::process::abort()
    }
}
