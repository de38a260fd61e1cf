//! An in-process heap leak tracker.
//!
//! Allocation entry points of every tracked module are redirected to thunks that record each
//! live block with the call stack that allocated it. Blocks never freed are reported with
//! resolved stacks, grouped by call site.
//!
//! Rust programs can install [`TrackingAllocator`] as their global allocator; other programs
//! load the tracker into the process and patch the modules' import tables.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ffi::c_void;

pub mod callstack;
pub mod capture;
pub mod context;
mod critical_section;
#[cfg(target_os = "linux")]
pub mod elf;
mod error;
pub mod hooks;
pub mod modules;
pub mod patch;
pub mod registry;
pub mod report;
pub mod symbols;
#[cfg(test)]
mod testing;
mod tracker;

pub use critical_section::{CriticalGuard, CriticalSection};
pub use error::{Error, Result};
pub use heap_leak_types::{Config, LeakGroup, LeakReport, ModuleList, ReportEncoding, Statistics};
pub use registry::{BlockKind, HeapHandle};
pub use tracker::{InstallGuard, ThreadState, Tracker, TrackerBuilder};

/// A global allocator reporting every Rust allocation to the installed tracker.
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    /// Track allocations served by the system allocator. Usable in a `#[global_allocator]`
    /// static.
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    /// Track allocations served by `inner`.
    ///
    /// Nothing is recorded until a [`Tracker`] is installed; until then every call goes straight
    /// to `inner`.
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        hooks::track_alloc("__rust_alloc", BlockKind::RUST, layout.size(), || {
            self.inner.alloc(layout) as *mut c_void
        }) as *mut u8
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        hooks::track_alloc("__rust_alloc_zeroed", BlockKind::RUST, layout.size(), || {
            self.inner.alloc_zeroed(layout) as *mut c_void
        }) as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        hooks::track_free("__rust_dealloc", ptr as *mut c_void, || {
            self.inner.dealloc(ptr, layout)
        })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        hooks::track_realloc(
            "__rust_realloc",
            BlockKind::RUST,
            ptr as *mut c_void,
            new_size,
            || self.inner.realloc(ptr, layout, new_size) as *mut c_void,
        ) as *mut u8
    }
}
