//! Stand-ins for the OS symbol engine used by unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::modules::LoadedModule;
use crate::symbols::{LineInfo, SymbolEngine, SymbolInfo};
use crate::Result;

#[derive(Debug, Clone, Default)]
struct Entry {
    module: Option<String>,
    function: Option<String>,
    line: Option<(PathBuf, u32)>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<usize, Entry>,
    modules: Vec<LoadedModule>,
    stack: Vec<usize>,
    unloaded: Vec<usize>,
}

/// A symbol engine answering from a table. Clones share the table, so tests can change answers
/// after handing the engine to a gateway.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<State>>,
}

impl ScriptedEngine {
    pub fn define(&self, address: usize, module: &str, function: &str, line: Option<(&str, u32)>) {
        self.state.lock().unwrap().entries.insert(
            address,
            Entry {
                module: Some(module.to_owned()),
                function: Some(function.to_owned()),
                line: line.map(|(file, line)| (PathBuf::from(file), line)),
            },
        );
    }

    pub fn define_function(&self, address: usize, module: &str, function: &str) {
        self.define(address, module, function, None);
    }

    /// Drop what is known about `address`, as when its module is unmapped.
    pub fn forget(&self, address: usize) {
        self.state.lock().unwrap().entries.remove(&address);
    }

    pub fn set_modules(&self, modules: Vec<LoadedModule>) {
        self.state.lock().unwrap().modules = modules;
    }

    pub fn set_stack(&self, stack: Vec<usize>) {
        self.state.lock().unwrap().stack = stack;
    }

    pub fn unloaded(&self) -> Vec<usize> {
        self.state.lock().unwrap().unloaded.clone()
    }
}

impl SymbolEngine for ScriptedEngine {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self) {}

    fn load_module(&mut self, _module: &LoadedModule) {}

    fn unload_module(&mut self, low: usize) {
        self.state.lock().unwrap().unloaded.push(low);
    }

    fn module_name(&mut self, address: usize) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(&address)
            .and_then(|entry| entry.module.clone())
            .or_else(|| {
                state
                    .modules
                    .iter()
                    .find(|module| module.contains(address))
                    .map(LoadedModule::name)
            })
    }

    fn function_name(&mut self, address: usize) -> Option<SymbolInfo> {
        let state = self.state.lock().unwrap();
        let entry = state.entries.get(&address)?;
        entry.function.clone().map(|name| SymbolInfo {
            name,
            displacement: None,
        })
    }

    fn source_line(&mut self, address: usize) -> Option<LineInfo> {
        let state = self.state.lock().unwrap();
        let (file, line) = state.entries.get(&address)?.line.clone()?;
        Some(LineInfo {
            file,
            line,
            displacement: None,
        })
    }

    fn enumerate_modules(&mut self) -> Vec<LoadedModule> {
        self.state.lock().unwrap().modules.clone()
    }

    fn walk_stack(&mut self, visit: &mut dyn FnMut(usize) -> bool) {
        let stack = self.state.lock().unwrap().stack.clone();
        for frame in stack {
            if !visit(frame) {
                break;
            }
        }
    }
}
