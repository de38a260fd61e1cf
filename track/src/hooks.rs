//! Replacement entry points installed into patched modules.
//!
//! Each thunk records its name in the thread's capture context, forwards to the real routine
//! through its [`Original`] slot and hands the outcome to the published tracker. The innermost
//! primitive registers the block; outer thunks of the same call see that and stay quiet, so
//! `operator new` calling `malloc` yields one record.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::context;
use crate::patch::{ImportRef, PatchTable};
use crate::registry::{BlockKind, HeapHandle};
use crate::tracker::Tracker;

lazy_static! {
    static ref ACTIVE: RwLock<Option<Arc<Tracker>>> = RwLock::new(None);
}

/// The tracker hooks report to, if one is installed.
pub(crate) fn active() -> Option<Arc<Tracker>> {
    ACTIVE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Publish `tracker`. Returns `false` if another one is installed.
pub(crate) fn publish(tracker: Arc<Tracker>) -> bool {
    context::suppress(|| {
        let mut active = ACTIVE.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.is_some() {
            return false;
        }
        *active = Some(tracker);
        true
    })
}

/// Withdraw the published tracker.
pub(crate) fn unpublish() -> Option<Arc<Tracker>> {
    context::suppress(|| {
        ACTIVE
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    })
}

/// Storage for the real address of a patched export.
pub struct Original {
    address: AtomicUsize,
    symbol: &'static CStr,
}

impl Original {
    const fn new(symbol: &'static CStr) -> Self {
        Self {
            address: AtomicUsize::new(0),
            symbol,
        }
    }

    fn slot(&'static self) -> &'static AtomicUsize {
        &self.address
    }

    /// The real routine, falling back to the next definition in lookup order.
    fn get(&self) -> usize {
        match self.address.load(Ordering::Acquire) {
            0 => {
                // SAFETY: `symbol` is a valid C string.
                let address =
                    unsafe { libc::dlsym(libc::RTLD_NEXT, self.symbol.as_ptr()) } as usize;
                if address == 0 {
                    // Nothing to forward to; continuing would call address zero.
                    std::process::abort();
                }
                self.address.store(address, Ordering::Release);
                address
            }
            address => address,
        }
    }
}

macro_rules! real {
    ($original:ident as $ty:ty) => {
        std::mem::transmute::<usize, $ty>($original.get())
    };
}

/// Track an allocation made by `call`.
pub(crate) fn track_alloc<F: FnOnce() -> *mut c_void>(
    entry: &'static str,
    kind: BlockKind,
    size: usize,
    call: F,
) -> *mut c_void {
    let _entry = match context::enter(entry) {
        Some(guard) => guard,
        None => return call(),
    };
    let tracker = active();
    let address = call();
    if let Some(tracker) = tracker {
        tracker.on_allocated(HeapHandle::DEFAULT, address as usize, size, kind);
    }
    address
}

/// Track a free performed by `call`. The block is forgotten before its memory is released.
pub(crate) fn track_free<F: FnOnce()>(entry: &'static str, address: *mut c_void, call: F) {
    let _entry = match context::enter(entry) {
        Some(guard) => guard,
        None => return call(),
    };
    if let Some(tracker) = active() {
        tracker.on_freed(HeapHandle::DEFAULT, address as usize);
    }
    call()
}

/// Track a reallocation performed by `call`. The old block is set aside before the call, since a
/// moving reallocation releases its address to other threads.
pub(crate) fn track_realloc<F: FnOnce() -> *mut c_void>(
    entry: &'static str,
    kind: BlockKind,
    old: *mut c_void,
    size: usize,
    call: F,
) -> *mut c_void {
    let _entry = match context::enter(entry) {
        Some(guard) => guard,
        None => return call(),
    };
    let tracker = active();
    let pending = tracker
        .as_ref()
        .and_then(|tracker| tracker.reallocation_starting(HeapHandle::DEFAULT, old as usize));
    let address = call();
    if let (Some(tracker), Some(pending)) = (tracker, pending) {
        tracker.reallocation_finished(pending, address as usize, size, kind);
    }
    address
}

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type AlignedFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
type StrdupFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type NewFn = unsafe extern "C-unwind" fn(usize) -> *mut c_void;
type NewNothrowFn = unsafe extern "C" fn(usize, *const c_void) -> *mut c_void;
type NewAlignedFn = unsafe extern "C-unwind" fn(usize, usize) -> *mut c_void;
type DeleteFn = unsafe extern "C" fn(*mut c_void);
type DeleteWithFn = unsafe extern "C" fn(*mut c_void, usize);
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

static MALLOC: Original = Original::new(c"malloc");
static CALLOC: Original = Original::new(c"calloc");
static REALLOC: Original = Original::new(c"realloc");
static FREE: Original = Original::new(c"free");
static ALIGNED_ALLOC: Original = Original::new(c"aligned_alloc");
static MEMALIGN: Original = Original::new(c"memalign");
static POSIX_MEMALIGN: Original = Original::new(c"posix_memalign");
static VALLOC: Original = Original::new(c"valloc");
static STRDUP: Original = Original::new(c"strdup");
static NEW: Original = Original::new(c"_Znwm");
static NEW_ARRAY: Original = Original::new(c"_Znam");
static NEW_NOTHROW: Original = Original::new(c"_ZnwmRKSt9nothrow_t");
static NEW_ARRAY_NOTHROW: Original = Original::new(c"_ZnamRKSt9nothrow_t");
static NEW_ALIGNED: Original = Original::new(c"_ZnwmSt11align_val_t");
static NEW_ARRAY_ALIGNED: Original = Original::new(c"_ZnamSt11align_val_t");
static DELETE: Original = Original::new(c"_ZdlPv");
static DELETE_ARRAY: Original = Original::new(c"_ZdaPv");
static DELETE_SIZED: Original = Original::new(c"_ZdlPvm");
static DELETE_ARRAY_SIZED: Original = Original::new(c"_ZdaPvm");
static DELETE_ALIGNED: Original = Original::new(c"_ZdlPvSt11align_val_t");
static DELETE_ARRAY_ALIGNED: Original = Original::new(c"_ZdaPvSt11align_val_t");
static DLOPEN: Original = Original::new(c"dlopen");
static DLCLOSE: Original = Original::new(c"dlclose");

unsafe extern "C" fn malloc_thunk(size: usize) -> *mut c_void {
    track_alloc("malloc", BlockKind::CRT, size, || {
        real!(MALLOC as MallocFn)(size)
    })
}

unsafe extern "C" fn calloc_thunk(count: usize, size: usize) -> *mut c_void {
    track_alloc("calloc", BlockKind::CRT, count.saturating_mul(size), || {
        real!(CALLOC as CallocFn)(count, size)
    })
}

unsafe extern "C" fn realloc_thunk(old: *mut c_void, size: usize) -> *mut c_void {
    track_realloc("realloc", BlockKind::CRT, old, size, || {
        real!(REALLOC as ReallocFn)(old, size)
    })
}

unsafe extern "C" fn free_thunk(address: *mut c_void) {
    track_free("free", address, || real!(FREE as FreeFn)(address))
}

unsafe extern "C" fn aligned_alloc_thunk(align: usize, size: usize) -> *mut c_void {
    track_alloc("aligned_alloc", BlockKind::CRT.union(BlockKind::ALIGNED), size, || {
        real!(ALIGNED_ALLOC as AlignedFn)(align, size)
    })
}

unsafe extern "C" fn memalign_thunk(align: usize, size: usize) -> *mut c_void {
    track_alloc("memalign", BlockKind::CRT.union(BlockKind::ALIGNED), size, || {
        real!(MEMALIGN as AlignedFn)(align, size)
    })
}

unsafe extern "C" fn posix_memalign_thunk(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    let mut result = 0;
    track_alloc("posix_memalign", BlockKind::CRT.union(BlockKind::ALIGNED), size, || {
        result = real!(POSIX_MEMALIGN as PosixMemalignFn)(out, align, size);
        if result == 0 && !out.is_null() {
            *out
        } else {
            std::ptr::null_mut()
        }
    });
    result
}

unsafe extern "C" fn valloc_thunk(size: usize) -> *mut c_void {
    track_alloc("valloc", BlockKind::CRT.union(BlockKind::ALIGNED), size, || {
        real!(VALLOC as MallocFn)(size)
    })
}

unsafe extern "C" fn strdup_thunk(source: *const c_char) -> *mut c_char {
    let size = if source.is_null() {
        0
    } else {
        libc::strlen(source) + 1
    };
    track_alloc("strdup", BlockKind::CRT, size, || {
        real!(STRDUP as StrdupFn)(source) as *mut c_void
    }) as *mut c_char
}

unsafe extern "C-unwind" fn new_thunk(size: usize) -> *mut c_void {
    track_alloc("operator new", BlockKind::NEW, size, || {
        real!(NEW as NewFn)(size)
    })
}

unsafe extern "C-unwind" fn new_array_thunk(size: usize) -> *mut c_void {
    track_alloc("operator new[]", BlockKind::NEW_ARRAY, size, || {
        real!(NEW_ARRAY as NewFn)(size)
    })
}

unsafe extern "C" fn new_nothrow_thunk(size: usize, tag: *const c_void) -> *mut c_void {
    track_alloc("operator new", BlockKind::NEW, size, || {
        real!(NEW_NOTHROW as NewNothrowFn)(size, tag)
    })
}

unsafe extern "C" fn new_array_nothrow_thunk(size: usize, tag: *const c_void) -> *mut c_void {
    track_alloc("operator new[]", BlockKind::NEW_ARRAY, size, || {
        real!(NEW_ARRAY_NOTHROW as NewNothrowFn)(size, tag)
    })
}

unsafe extern "C-unwind" fn new_aligned_thunk(size: usize, align: usize) -> *mut c_void {
    track_alloc("operator new", BlockKind::NEW.union(BlockKind::ALIGNED), size, || {
        real!(NEW_ALIGNED as NewAlignedFn)(size, align)
    })
}

unsafe extern "C-unwind" fn new_array_aligned_thunk(size: usize, align: usize) -> *mut c_void {
    track_alloc("operator new[]", BlockKind::NEW_ARRAY.union(BlockKind::ALIGNED), size, || {
        real!(NEW_ARRAY_ALIGNED as NewAlignedFn)(size, align)
    })
}

unsafe extern "C" fn delete_thunk(address: *mut c_void) {
    track_free("operator delete", address, || {
        real!(DELETE as DeleteFn)(address)
    })
}

unsafe extern "C" fn delete_array_thunk(address: *mut c_void) {
    track_free("operator delete[]", address, || {
        real!(DELETE_ARRAY as DeleteFn)(address)
    })
}

unsafe extern "C" fn delete_sized_thunk(address: *mut c_void, size: usize) {
    track_free("operator delete", address, || {
        real!(DELETE_SIZED as DeleteWithFn)(address, size)
    })
}

unsafe extern "C" fn delete_array_sized_thunk(address: *mut c_void, size: usize) {
    track_free("operator delete[]", address, || {
        real!(DELETE_ARRAY_SIZED as DeleteWithFn)(address, size)
    })
}

unsafe extern "C" fn delete_aligned_thunk(address: *mut c_void, align: usize) {
    track_free("operator delete", address, || {
        real!(DELETE_ALIGNED as DeleteWithFn)(address, align)
    })
}

unsafe extern "C" fn delete_array_aligned_thunk(address: *mut c_void, align: usize) {
    track_free("operator delete[]", address, || {
        real!(DELETE_ARRAY_ALIGNED as DeleteWithFn)(address, align)
    })
}

unsafe extern "C" fn dlopen_thunk(file: *const c_char, flags: c_int) -> *mut c_void {
    let handle = real!(DLOPEN as DlopenFn)(file, flags);
    if !handle.is_null() {
        if let Some(_entry) = context::enter("dlopen") {
            if let Some(tracker) = active() {
                tracker.refresh_modules();
            }
        }
    }
    handle
}

unsafe extern "C" fn dlclose_thunk(handle: *mut c_void) -> c_int {
    if let Some(_entry) = context::enter("dlclose") {
        if let Some(tracker) = active() {
            tracker.prepare_module_close(module_address(handle));
        }
    }
    let result = real!(DLCLOSE as DlcloseFn)(handle);
    if let Some(_entry) = context::enter("dlclose") {
        if let Some(tracker) = active() {
            tracker.refresh_modules();
        }
    }
    result
}

#[repr(C)]
#[allow(dead_code)]
struct LinkMap {
    addr: usize,
    name: *const c_char,
    dynamic: *mut c_void,
    next: *mut LinkMap,
    prev: *mut LinkMap,
}

const RTLD_DI_LINKMAP: c_int = 2;

extern "C" {
    fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
}

/// An address inside the module behind a loader handle.
fn module_address(handle: *mut c_void) -> Option<usize> {
    let mut map: *mut LinkMap = std::ptr::null_mut();
    // SAFETY: `handle` came from the host's own dlopen; dlinfo fails cleanly on bad handles.
    let found = unsafe { dlinfo(handle, RTLD_DI_LINKMAP, &mut map as *mut _ as *mut c_void) } == 0;
    if !found || map.is_null() {
        return None;
    }
    // The dynamic section lies inside the module's mapping.
    let dynamic = unsafe { (*map).dynamic } as usize;
    (dynamic != 0).then_some(dynamic)
}

/// Redirections for the C runtime, the C++ runtime and the dynamic loader.
pub fn default_patch_table() -> PatchTable {
    const C: &str = "libc.so";
    const CXX: &str = "libstdc++.so";
    let entries: [(&str, &'static Original, usize); 25] = [
        (C, &MALLOC, malloc_thunk as *const () as usize),
        (C, &CALLOC, calloc_thunk as *const () as usize),
        (C, &REALLOC, realloc_thunk as *const () as usize),
        (C, &FREE, free_thunk as *const () as usize),
        (C, &ALIGNED_ALLOC, aligned_alloc_thunk as *const () as usize),
        (C, &MEMALIGN, memalign_thunk as *const () as usize),
        (C, &POSIX_MEMALIGN, posix_memalign_thunk as *const () as usize),
        (C, &VALLOC, valloc_thunk as *const () as usize),
        (C, &STRDUP, strdup_thunk as *const () as usize),
        (CXX, &NEW, new_thunk as *const () as usize),
        (CXX, &NEW_ARRAY, new_array_thunk as *const () as usize),
        (CXX, &NEW_NOTHROW, new_nothrow_thunk as *const () as usize),
        (CXX, &NEW_ARRAY_NOTHROW, new_array_nothrow_thunk as *const () as usize),
        (CXX, &NEW_ALIGNED, new_aligned_thunk as *const () as usize),
        (CXX, &NEW_ARRAY_ALIGNED, new_array_aligned_thunk as *const () as usize),
        (CXX, &DELETE, delete_thunk as *const () as usize),
        (CXX, &DELETE_ARRAY, delete_array_thunk as *const () as usize),
        (CXX, &DELETE_SIZED, delete_sized_thunk as *const () as usize),
        (CXX, &DELETE_ARRAY_SIZED, delete_array_sized_thunk as *const () as usize),
        (CXX, &DELETE_ALIGNED, delete_aligned_thunk as *const () as usize),
        (CXX, &DELETE_ARRAY_ALIGNED, delete_array_aligned_thunk as *const () as usize),
        (C, &DLOPEN, dlopen_thunk as *const () as usize),
        (C, &DLCLOSE, dlclose_thunk as *const () as usize),
        // Before glibc 2.34 the loader interface lives in its own library.
        ("libdl.so", &DLOPEN, dlopen_thunk as *const () as usize),
        ("libdl.so", &DLCLOSE, dlclose_thunk as *const () as usize),
    ];
    entries
        .into_iter()
        .fold(PatchTable::new(), |table, (exporter, original, replacement)| {
            let symbol = original.symbol.to_string_lossy().into_owned();
            table.entry(exporter, ImportRef::Name(symbol), original.slot(), replacement)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_allocator_families() {
        let table = default_patch_table();
        let names: Vec<String> = table
            .entries()
            .iter()
            .map(|entry| entry.import.to_string())
            .collect();
        for expected in ["malloc", "free", "realloc", "_Znwm", "_ZdlPv", "dlopen", "dlclose"] {
            assert!(names.iter().any(|name| name == expected), "{}", expected);
        }
        assert!(table.entries().iter().all(|entry| entry.replacement != 0));
    }

    #[test]
    fn loader_handles_map_to_their_module() {
        let handle = unsafe { libc::dlopen(c"libm.so.6".as_ptr(), libc::RTLD_NOW) };
        assert!(!handle.is_null());
        let address = module_address(handle).unwrap();
        let modules = crate::modules::loaded_modules();
        let module = modules
            .iter()
            .find(|module| module.contains(address))
            .unwrap();
        assert!(module.name().starts_with("libm"), "{}", module.name());
        assert_eq!(unsafe { dlclose_thunk(handle) }, 0);
        assert!(module_address(std::ptr::null_mut()).is_none());
    }

    #[test]
    fn thunks_forward_without_a_tracker() {
        unsafe {
            let block = malloc_thunk(32);
            assert!(!block.is_null());
            let grown = realloc_thunk(block, 64);
            assert!(!grown.is_null());
            free_thunk(grown);

            let copy = strdup_thunk(c"leak".as_ptr());
            assert_eq!(CStr::from_ptr(copy).to_str().unwrap(), "leak");
            free_thunk(copy as *mut c_void);

            let mut aligned = std::ptr::null_mut();
            assert_eq!(posix_memalign_thunk(&mut aligned, 64, 128), 0);
            assert_eq!(aligned as usize % 64, 0);
            free_thunk(aligned);
        }
    }
}
