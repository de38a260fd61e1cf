//! Leak tracking for unmodified programs.
//!
//! Load with `LD_PRELOAD=libheap_leak_preload.so`. The tracker is configured from the
//! `HEAP_LEAK_*` environment variables, patches every module loaded at startup and reports
//! outstanding leaks when the process exits. Programs that know about the tracker can steer it
//! through the `heap_leak_*` functions.

use std::os::raw::c_int;
use std::sync::{Arc, Mutex};

use ctor::{ctor, dtor};
use heap_leak_track::context;
use heap_leak_track::{Config, InstallGuard, Tracker};

static INSTALLED: Mutex<Option<InstallGuard>> = Mutex::new(None);

#[ctor]
fn start() {
    let _ = pretty_env_logger::try_init();
    let tracker = match Tracker::builder(Config::from_env()).build() {
        Ok(tracker) => tracker,
        Err(err) => {
            log::error!("heap leak tracking unavailable: {}", err);
            return;
        }
    };
    let guard = match tracker.install() {
        Ok(guard) => guard,
        Err(err) => {
            log::error!("heap leak tracking unavailable: {}", err);
            return;
        }
    };
    tracker.attach_loaded_modules();
    if let Ok(mut installed) = INSTALLED.lock() {
        *installed = Some(guard);
    }
}

#[dtor]
fn stop() {
    let guard = match INSTALLED.lock() {
        Ok(mut installed) => installed.take(),
        Err(_) => None,
    };
    if let Some(guard) = guard {
        guard.tracker().shutdown();
    }
}

fn tracker() -> Option<Arc<Tracker>> {
    INSTALLED
        .lock()
        .ok()?
        .as_ref()
        .map(|guard| guard.tracker().clone())
}

fn scope(thread_only: c_int) -> Option<usize> {
    (thread_only != 0).then(context::thread_id)
}

/// Resume tracking in the whole process.
#[no_mangle]
pub extern "C" fn heap_leak_enable() {
    if let Some(tracker) = tracker() {
        tracker.enable();
    }
}

/// Stop tracking new allocations in the whole process. Frees are still observed.
#[no_mangle]
pub extern "C" fn heap_leak_disable() {
    if let Some(tracker) = tracker() {
        tracker.disable();
    }
}

/// Resume or stop tracking on the calling thread. Returns the previous state, or -1 without a
/// tracker.
#[no_mangle]
pub extern "C" fn heap_leak_set_thread_enabled(enabled: c_int) -> c_int {
    let tracker = match tracker() {
        Some(tracker) => tracker,
        None => return -1,
    };
    let previous = if enabled != 0 {
        tracker.enable_thread()
    } else {
        tracker.disable_thread()
    };
    c_int::from(previous.is_enabled())
}

/// Number of unreported leaks, of the calling thread only if `thread_only` is nonzero.
#[no_mangle]
pub extern "C" fn heap_leak_count(thread_only: c_int) -> usize {
    tracker().map_or(0, |tracker| tracker.leak_count(scope(thread_only)))
}

/// Report unreported leaks now. Returns their number.
#[no_mangle]
pub extern "C" fn heap_leak_report(thread_only: c_int) -> usize {
    tracker().map_or(0, |tracker| tracker.report(scope(thread_only)).leak_count)
}

/// Leave every current leak out of later reports.
#[no_mangle]
pub extern "C" fn heap_leak_mark_all_reported(thread_only: c_int) {
    if let Some(tracker) = tracker() {
        tracker.mark_all_reported(scope(thread_only));
    }
}

/// Resolve all outstanding call stacks while every module is still loaded.
#[no_mangle]
pub extern "C" fn heap_leak_resolve_callstacks() -> usize {
    tracker().map_or(0, |tracker| tracker.resolve_callstacks())
}

/// Track allocations made from the module containing `address`. Returns -1 if no module does.
#[no_mangle]
pub extern "C" fn heap_leak_enable_module(address: usize) -> c_int {
    match tracker().map(|tracker| tracker.enable_module(address)) {
        Some(Ok(())) => 0,
        _ => -1,
    }
}

/// Stop tracking allocations made from the module containing `address`.
#[no_mangle]
pub extern "C" fn heap_leak_disable_module(address: usize) -> c_int {
    match tracker().map(|tracker| tracker.disable_module(address)) {
        Some(Ok(())) => 0,
        _ => -1,
    }
}
