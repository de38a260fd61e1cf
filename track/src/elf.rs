//! Import tables of ELF modules.
//!
//! Calls into other modules go through the global offset table. Its slots are found through the
//! `GLOB_DAT` and `JUMP_SLOT` relocations listed in the module's dynamic section, and the modules
//! it links against through the `DT_NEEDED` entries. Lazily bound `JUMP_SLOT`s point back into the
//! module's PLT until first called; those are told apart by the symbol their relocation names.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::io;

use crate::error::Error;
use crate::modules::{LoadedModule, ModulePatcher};
use crate::patch::{self, ExportResolver, ImportRef, ImportTable, PatchOutcome, PatchTable};
use crate::Result;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Dyn {
    tag: isize,
    value: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct Rela {
    offset: usize,
    info: usize,
    addend: isize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Rel {
    offset: usize,
    info: usize,
}

const DT_NULL: isize = 0;
const DT_NEEDED: isize = 1;
const DT_PLTRELSZ: isize = 2;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_RELA: isize = 7;
const DT_RELASZ: isize = 8;
const DT_REL: isize = 17;
const DT_SYMENT: isize = 11;
const DT_RELSZ: isize = 18;
const DT_PLTREL: isize = 20;
const DT_JMPREL: isize = 23;

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
mod reloc {
    pub const GLOB_DAT: u32 = 6;
    pub const JUMP_SLOT: u32 = 7;
}
#[cfg(target_arch = "aarch64")]
mod reloc {
    pub const GLOB_DAT: u32 = 1025;
    pub const JUMP_SLOT: u32 = 1026;
}
#[cfg(target_arch = "arm")]
mod reloc {
    pub const GLOB_DAT: u32 = 21;
    pub const JUMP_SLOT: u32 = 22;
}

#[cfg(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
))]
const SLOT_RELOCATIONS: &[u32] = &[reloc::GLOB_DAT, reloc::JUMP_SLOT];
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
))]
const LAZY_RELOCATION: Option<u32> = Some(reloc::JUMP_SLOT);

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
const SLOT_RELOCATIONS: &[u32] = &[];
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
const LAZY_RELOCATION: Option<u32> = None;

#[cfg(target_pointer_width = "64")]
fn relocation_type(info: usize) -> u32 {
    (info & 0xffff_ffff) as u32
}

#[cfg(target_pointer_width = "64")]
fn relocation_symbol(info: usize) -> usize {
    info >> 32
}

#[cfg(target_pointer_width = "64")]
const SYMBOL_SIZE: usize = 24;

#[cfg(target_pointer_width = "32")]
fn relocation_type(info: usize) -> u32 {
    (info & 0xff) as u32
}

#[cfg(target_pointer_width = "32")]
fn relocation_symbol(info: usize) -> usize {
    info >> 8
}

#[cfg(target_pointer_width = "32")]
const SYMBOL_SIZE: usize = 16;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[derive(Debug, Clone)]
struct Slot {
    address: usize,
    symbol: Option<String>,
    /// Bound on first call unless the module was loaded with `BIND_NOW`.
    lazy: bool,
}

/// The global offset table of one loaded module.
#[derive(Debug)]
pub struct ElfImportTable {
    needed: Vec<String>,
    slots: Vec<Slot>,
    /// Ranges made read-only after relocation.
    relro: Vec<(usize, usize)>,
    /// The module's own mapping, where unbound slots point.
    range: (usize, usize),
}

impl ElfImportTable {
    /// Parse the dynamic section of a loaded module.
    ///
    /// # Safety
    ///
    /// `module` must describe a module that is currently mapped, as returned by
    /// [`crate::modules::loaded_modules`].
    pub unsafe fn open(module: &LoadedModule) -> Option<Self> {
        if module.dynamic == 0 {
            return None;
        }
        let bias = module.bias;
        // Loaders usually relocate the dynamic section's addresses in place, but not always.
        let address = |value: usize| if value < bias { value + bias } else { value };

        let (mut strtab, mut symtab, mut syment) = (0, 0, SYMBOL_SIZE);
        let mut needed_offsets = Vec::new();
        let (mut rela, mut rela_size, mut rel, mut rel_size) = (0, 0, 0, 0);
        let (mut jmprel, mut jmprel_size, mut pltrel) = (0, 0, DT_RELA);

        let mut entry = module.dynamic as *const Dyn;
        loop {
            let Dyn { tag, value } = *entry;
            match tag {
                DT_NULL => break,
                DT_NEEDED => needed_offsets.push(value),
                DT_STRTAB => strtab = address(value),
                DT_SYMTAB => symtab = address(value),
                DT_SYMENT => syment = value,
                DT_RELA => rela = address(value),
                DT_RELASZ => rela_size = value,
                DT_REL => rel = address(value),
                DT_RELSZ => rel_size = value,
                DT_JMPREL => jmprel = address(value),
                DT_PLTRELSZ => jmprel_size = value,
                DT_PLTREL => pltrel = value as isize,
                _ => {}
            }
            entry = entry.add(1);
        }

        let needed = if strtab == 0 {
            Vec::new()
        } else {
            needed_offsets
                .into_iter()
                .map(|offset| {
                    CStr::from_ptr((strtab + offset) as *const c_char)
                        .to_string_lossy()
                        .into_owned()
                })
                .collect()
        };

        // Both symbol layouts start with the name's string table offset.
        let symbol_name = |info: usize| {
            let index = relocation_symbol(info);
            if index == 0 || symtab == 0 || strtab == 0 {
                return None;
            }
            let name = *((symtab + index * syment) as *const u32) as usize;
            Some(
                CStr::from_ptr((strtab + name) as *const c_char)
                    .to_string_lossy()
                    .into_owned(),
            )
        };
        let mut slots = Vec::new();
        let mut collect = |offset: usize, info: usize| {
            let kind = relocation_type(info);
            if SLOT_RELOCATIONS.contains(&kind) {
                slots.push(Slot {
                    address: bias + offset,
                    symbol: symbol_name(info),
                    lazy: LAZY_RELOCATION == Some(kind),
                });
            }
        };
        for entry in table::<Rela>(rela, rela_size) {
            collect(entry.offset, entry.info);
        }
        for entry in table::<Rel>(rel, rel_size) {
            collect(entry.offset, entry.info);
        }
        if pltrel == DT_RELA {
            for entry in table::<Rela>(jmprel, jmprel_size) {
                collect(entry.offset, entry.info);
            }
        } else {
            for entry in table::<Rel>(jmprel, jmprel_size) {
                collect(entry.offset, entry.info);
            }
        }
        slots.sort_by_key(|slot| slot.address);
        slots.dedup_by_key(|slot| slot.address);

        Some(Self {
            needed,
            slots,
            relro: relro_ranges(module),
            range: (module.low, module.high),
        })
    }

    pub fn needed(&self) -> &[String] {
        &self.needed
    }

    /// Name of the symbol the slot's relocation refers to.
    pub fn symbol(&self, index: usize) -> Option<&str> {
        self.slots[index].symbol.as_deref()
    }

    fn is_relro(&self, address: usize) -> bool {
        self.relro
            .iter()
            .any(|(low, high)| *low <= address && address < *high)
    }
}

unsafe fn table<'a, T>(address: usize, size: usize) -> &'a [T] {
    if address == 0 || size == 0 {
        return &[];
    }
    std::slice::from_raw_parts(address as *const T, size / std::mem::size_of::<T>())
}

fn relro_ranges(module: &LoadedModule) -> Vec<(usize, usize)> {
    struct Search {
        bias: usize,
        ranges: Vec<(usize, usize)>,
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let search = &mut *(data as *mut Search);
        let info = &*info;
        if info.dlpi_addr as usize != search.bias {
            return 0;
        }
        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for header in headers {
            if header.p_type == libc::PT_GNU_RELRO {
                let low = search.bias + header.p_vaddr as usize;
                search.ranges.push((low, low + header.p_memsz as usize));
            }
        }
        1
    }

    let mut search = Search {
        bias: module.bias,
        ranges: Vec::new(),
    };
    // SAFETY: the callback only reads the program headers handed to it.
    unsafe {
        libc::dl_iterate_phdr(Some(visit), &mut search as *mut Search as *mut c_void);
    }
    search.ranges
}

impl ImportTable for ElfImportTable {
    fn imports_from(&self, exporter: &str) -> bool {
        self.needed.iter().any(|name| name.starts_with(exporter))
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn read_slot(&self, index: usize) -> usize {
        // SAFETY: slots come from the relocation tables of a mapped module.
        unsafe { std::ptr::read_volatile(self.slots[index].address as *const usize) }
    }

    fn write_slot(&mut self, index: usize, value: usize) -> Result<()> {
        let address = self.slots[index].address;
        let page = page_size();
        let start = address & !(page - 1);
        let len = (address + std::mem::size_of::<usize>()).next_multiple_of(page) - start;
        let restore = if self.is_relro(address) {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // SAFETY: the range covers mapped pages of the module's data segment.
        unsafe {
            if libc::mprotect(start as *mut c_void, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                return Err(Error::Protect {
                    address,
                    source: io::Error::last_os_error(),
                });
            }
            std::ptr::write_volatile(address as *mut usize, value);
            if libc::mprotect(start as *mut c_void, len, restore) != 0 {
                return Err(Error::Protect {
                    address,
                    source: io::Error::last_os_error(),
                });
            }
        }
        Ok(())
    }

    fn unbound_symbol(&self, index: usize) -> Option<&str> {
        let slot = &self.slots[index];
        if !slot.lazy {
            return None;
        }
        let (low, high) = self.range;
        let value = self.read_slot(index);
        (low <= value && value < high)
            .then_some(slot.symbol.as_deref())
            .flatten()
    }
}

/// Resolves exports through the loader's own lookup, without loading anything new.
#[derive(Debug, Default)]
pub struct DlsymResolver;

impl ExportResolver for DlsymResolver {
    fn resolve(&self, exporter: &str, import: &ImportRef) -> Option<usize> {
        // ELF modules export by name only.
        let name = match import {
            ImportRef::Name(name) => CString::new(name.as_str()).ok()?,
            ImportRef::Ordinal(_) => return None,
        };
        let handle = loaded_handle(exporter)?;
        // SAFETY: `handle` is a live handle returned by dlopen.
        let address = unsafe { libc::dlsym(handle, name.as_ptr()) } as usize;
        unsafe { libc::dlclose(handle) };
        (address != 0).then_some(address)
    }
}

/// A handle to an already loaded module whose file name starts with `prefix`.
fn loaded_handle(prefix: &str) -> Option<*mut c_void> {
    let candidates = crate::modules::loaded_modules()
        .into_iter()
        .filter(|module| !module.main_program && module.name().starts_with(prefix))
        .map(|module| module.path);
    for path in candidates {
        let path = CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
        // SAFETY: RTLD_NOLOAD only returns modules that are already mapped.
        let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        if !handle.is_null() {
            return Some(handle);
        }
    }
    None
}

/// Patches loaded ELF modules in place.
#[derive(Debug, Default)]
pub struct ElfPatcher {
    resolver: DlsymResolver,
}

impl ModulePatcher for ElfPatcher {
    fn patch(&self, module: &LoadedModule, patches: &PatchTable) -> Result<PatchOutcome> {
        // SAFETY: modules handed to the patcher come from the loader's current list.
        match unsafe { ElfImportTable::open(module) } {
            Some(mut table) => patch::patch_module(&mut table, &self.resolver, patches),
            None => Ok(PatchOutcome {
                skipped: patches.len(),
                ..Default::default()
            }),
        }
    }

    fn restore(&self, module: &LoadedModule, patches: &PatchTable) -> Result<usize> {
        // SAFETY: as above.
        match unsafe { ElfImportTable::open(module) } {
            Some(mut table) => patch::restore_module(&mut table, patches),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::loaded_modules;

    #[test]
    fn main_program_links_libc() {
        let modules = loaded_modules();
        let table = unsafe { ElfImportTable::open(&modules[0]) }.unwrap();
        assert!(table.imports_from("libc.so"));
        assert!(table.slot_count() > 0);
    }

    #[test]
    fn resolver_finds_malloc() {
        let resolver = DlsymResolver;
        let malloc = resolver.resolve("libc.so", &ImportRef::Name("malloc".into()));
        assert!(malloc.is_some());
        assert_eq!(resolver.resolve("libc.so", &ImportRef::Ordinal(1)), None);
        let missing = resolver.resolve("libdoes-not-exist.so", &ImportRef::Name("malloc".into()));
        assert_eq!(missing, None);
    }

    #[test]
    fn main_program_has_a_malloc_slot() {
        let modules = loaded_modules();
        let table = unsafe { ElfImportTable::open(&modules[0]) }.unwrap();
        let malloc = DlsymResolver
            .resolve("libc.so", &ImportRef::Name("malloc".into()))
            .unwrap();
        assert!((0..table.slot_count()).any(|index| table.read_slot(index) == malloc));
        assert!((0..table.slot_count()).any(|index| table.symbol(index) == Some("malloc")));
    }

    #[test]
    fn stub_bound_slots_are_patched_by_symbol() {
        use crate::patch::tests::MapResolver;
        use std::sync::atomic::AtomicUsize;

        static FREE: AtomicUsize = AtomicUsize::new(0);

        // The first word stands for a PLT stub inside the module; the slots live on the heap.
        let plt = [0u8; 64];
        let low = plt.as_ptr() as usize;
        let mut got = vec![low + 16, 0x1234usize];
        let base = got.as_mut_ptr() as usize;
        let slot = |index: usize, symbol: &str| Slot {
            address: base + index * std::mem::size_of::<usize>(),
            symbol: Some(symbol.to_owned()),
            lazy: true,
        };
        let mut table = ElfImportTable {
            needed: vec!["libc.so.6".into()],
            slots: vec![slot(0, "free"), slot(1, "calloc")],
            relro: Vec::new(),
            range: (low, low + plt.len()),
        };
        assert_eq!(table.unbound_symbol(0), Some("free"));
        assert_eq!(table.unbound_symbol(1), None);

        let mut resolver = MapResolver::default();
        resolver
            .0
            .insert(("libc.so".into(), ImportRef::Name("free".into())), 0x200);
        let patches =
            PatchTable::new().entry("libc.so", ImportRef::Name("free".into()), &FREE, 0xB00);
        let outcome = patch::patch_module(&mut table, &resolver, &patches).unwrap();
        assert_eq!(outcome.patched, 1);
        assert_eq!(table.read_slot(0), 0xB00);
        assert_eq!(table.read_slot(1), 0x1234);
        assert_eq!(table.unbound_symbol(0), None);

        assert_eq!(patch::restore_module(&mut table, &patches).unwrap(), 1);
        assert_eq!(table.read_slot(0), 0x200);
        drop(got);
    }
}
