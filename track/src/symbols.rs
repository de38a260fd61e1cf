//! Serialized access to the symbol engine.
//!
//! Symbolication and unwinding are not reentrant, so every call goes through one
//! [`SymbolGateway`] holding the engine behind a [`CriticalSection`]. Allocation hooks consult
//! [`SymbolGateway::is_held_by_current_thread`] to stay out of the way of the engine's own
//! allocations.

use std::ffi::{c_void, CStr};
use std::path::PathBuf;

use crate::critical_section::{CriticalGuard, CriticalSection};
use crate::modules::LoadedModule;
use crate::Result;

/// Function containing an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    /// Offset of the address from the function's entry.
    pub displacement: Option<u64>,
}

/// Source location of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: PathBuf,
    pub line: u32,
    /// Offset of the address from the first instruction of the line.
    pub displacement: Option<u64>,
}

/// Primitive operations of a debug-info engine. None of them may be assumed thread-safe.
pub trait SymbolEngine: Send {
    fn initialize(&mut self) -> Result<()>;

    fn cleanup(&mut self);

    /// Make symbols of a newly mapped module available.
    fn load_module(&mut self, module: &LoadedModule);

    /// Forget symbols of the module mapped at `low`.
    fn unload_module(&mut self, low: usize);

    /// File name of the module containing `address`.
    fn module_name(&mut self, address: usize) -> Option<String>;

    fn function_name(&mut self, address: usize) -> Option<SymbolInfo>;

    fn source_line(&mut self, address: usize) -> Option<LineInfo>;

    fn enumerate_modules(&mut self) -> Vec<LoadedModule>;

    /// Unwind the calling thread's stack one frame at a time, innermost first, until `visit`
    /// returns `false` or the stack ends.
    fn walk_stack(&mut self, visit: &mut dyn FnMut(usize) -> bool);
}

/// The single owner of the symbol engine.
pub struct SymbolGateway {
    engine: CriticalSection<Box<dyn SymbolEngine>>,
}

impl SymbolGateway {
    pub fn new(engine: Box<dyn SymbolEngine>) -> Self {
        Self {
            engine: CriticalSection::new(engine),
        }
    }

    /// Take the gateway lock for a sequence of pre-locked calls.
    pub fn lock(&self) -> LockedGateway<'_> {
        LockedGateway {
            guard: self.engine.enter(),
        }
    }

    /// `true` while the calling thread is inside a gateway call.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.engine.is_held_by_current_thread()
    }

    pub fn initialize(&self) -> Result<()> {
        self.lock().initialize()
    }

    pub fn cleanup(&self) {
        self.lock().cleanup()
    }

    pub fn load_module(&self, module: &LoadedModule) {
        self.lock().load_module(module)
    }

    pub fn unload_module(&self, low: usize) {
        self.lock().unload_module(low)
    }

    pub fn module_name(&self, address: usize) -> Option<String> {
        self.lock().module_name(address)
    }

    pub fn function_name(&self, address: usize) -> Option<SymbolInfo> {
        self.lock().function_name(address)
    }

    pub fn source_line(&self, address: usize) -> Option<LineInfo> {
        self.lock().source_line(address)
    }

    pub fn enumerate_modules(&self) -> Vec<LoadedModule> {
        self.lock().enumerate_modules()
    }
}

/// The gateway with its lock held by the calling thread.
pub struct LockedGateway<'a> {
    guard: CriticalGuard<'a, Box<dyn SymbolEngine>>,
}

impl LockedGateway<'_> {
    pub fn initialize(&mut self) -> Result<()> {
        self.guard.initialize()
    }

    pub fn cleanup(&mut self) {
        self.guard.cleanup()
    }

    pub fn load_module(&mut self, module: &LoadedModule) {
        self.guard.load_module(module)
    }

    pub fn unload_module(&mut self, low: usize) {
        self.guard.unload_module(low)
    }

    pub fn module_name(&mut self, address: usize) -> Option<String> {
        self.guard.module_name(address)
    }

    pub fn function_name(&mut self, address: usize) -> Option<SymbolInfo> {
        self.guard.function_name(address)
    }

    pub fn source_line(&mut self, address: usize) -> Option<LineInfo> {
        self.guard.source_line(address)
    }

    pub fn enumerate_modules(&mut self) -> Vec<LoadedModule> {
        self.guard.enumerate_modules()
    }

    pub fn walk_stack(&mut self, visit: &mut dyn FnMut(usize) -> bool) {
        self.guard.walk_stack(visit)
    }
}

/// Symbol engine backed by the `backtrace` crate and the dynamic loader.
#[derive(Debug, Default)]
pub struct BacktraceEngine {
    loaded_modules: usize,
}

impl SymbolEngine for BacktraceEngine {
    fn initialize(&mut self) -> Result<()> {
        // `backtrace` loads debug info lazily on first lookup.
        Ok(())
    }

    fn cleanup(&mut self) {
        backtrace::clear_symbol_cache();
        self.loaded_modules = 0;
    }

    fn load_module(&mut self, module: &LoadedModule) {
        self.loaded_modules += 1;
        log::trace!("symbols available for {}", module.path.display());
    }

    fn unload_module(&mut self, _low: usize) {
        self.loaded_modules = self.loaded_modules.saturating_sub(1);
        // Cached mappings may refer to the unloaded file.
        backtrace::clear_symbol_cache();
    }

    fn module_name(&mut self, address: usize) -> Option<String> {
        dladdr_module(address)
    }

    fn function_name(&mut self, address: usize) -> Option<SymbolInfo> {
        let mut info = None;
        // SAFETY: the gateway lock serializes every call into the symbolizer.
        unsafe {
            backtrace::resolve_unsynchronized(address as *mut c_void, |symbol| {
                if info.is_some() {
                    return;
                }
                if let Some(name) = symbol.name() {
                    let displacement = symbol
                        .addr()
                        .map(|start| (address as u64).wrapping_sub(start as u64));
                    info = Some(SymbolInfo {
                        name: format!("{:#}", name),
                        displacement,
                    });
                }
            });
        }
        info
    }

    fn source_line(&mut self, address: usize) -> Option<LineInfo> {
        let mut info = None;
        // SAFETY: the gateway lock serializes every call into the symbolizer.
        unsafe {
            backtrace::resolve_unsynchronized(address as *mut c_void, |symbol| {
                if info.is_some() {
                    return;
                }
                if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                    info = Some(LineInfo {
                        file: file.to_owned(),
                        line,
                        displacement: None,
                    });
                }
            });
        }
        info
    }

    fn enumerate_modules(&mut self) -> Vec<LoadedModule> {
        crate::modules::loaded_modules()
    }

    fn walk_stack(&mut self, visit: &mut dyn FnMut(usize) -> bool) {
        // SAFETY: the gateway lock serializes every call into the unwinder.
        unsafe {
            backtrace::trace_unsynchronized(|frame| visit(frame.ip() as usize));
        }
    }
}

#[cfg(unix)]
fn dladdr_module(address: usize) -> Option<String> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: `dladdr` only inspects the loader's module list.
    if unsafe { libc::dladdr(address as *const c_void, &mut info) } == 0 || info.dli_fname.is_null()
    {
        return None;
    }
    let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    let name = path.rsplit('/').next().unwrap_or(&path);
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}

#[cfg(not(unix))]
fn dladdr_module(_address: usize) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn gateway_reports_holder() {
        let gateway = SymbolGateway::new(Box::new(ScriptedEngine::default()));
        assert!(!gateway.is_held_by_current_thread());
        let mut locked = gateway.lock();
        assert!(gateway.is_held_by_current_thread());
        assert!(locked.function_name(0x10).is_none());
        drop(locked);
        assert!(!gateway.is_held_by_current_thread());
    }

    #[test]
    fn gateway_forwards_lookups() {
        let engine = ScriptedEngine::default();
        engine.define(0x1000, "libdemo.so", "demo::leak", Some(("src/leak.rs", 7)));
        let gateway = SymbolGateway::new(Box::new(engine));
        assert_eq!(
            gateway.function_name(0x1000).map(|info| info.name),
            Some("demo::leak".to_owned())
        );
        assert_eq!(gateway.source_line(0x1000).map(|info| info.line), Some(7));
        assert_eq!(gateway.module_name(0x1000).as_deref(), Some("libdemo.so"));
    }

    #[test]
    fn backtrace_engine_names_this_function() {
        let mut engine = BacktraceEngine::default();
        engine.initialize().unwrap();
        let mut first = None;
        engine.walk_stack(&mut |ip| {
            first = Some(ip);
            false
        });
        assert!(first.is_some());
    }
}
