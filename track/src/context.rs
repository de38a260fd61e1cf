//! Per-thread state of tracked calls.
//!
//! Every thread carries a small context in a thread-local: how many tracked entry points are in
//! flight, the outermost one's name, whether the innermost primitive already registered the
//! current allocation, and a busy flag set while the tracker does its own bookkeeping. A busy
//! thread bypasses every hook, so allocations made by the tracker itself are never tracked.

use std::cell::Cell;
use std::marker::PhantomData;

struct ThreadContext {
    busy: Cell<bool>,
    enabled: Cell<bool>,
    depth: Cell<u32>,
    registered: Cell<bool>,
    entry: Cell<Option<&'static str>>,
    caller: Cell<usize>,
}

impl ThreadContext {
    const fn new() -> Self {
        Self {
            busy: Cell::new(false),
            enabled: Cell::new(true),
            depth: Cell::new(0),
            registered: Cell::new(false),
            entry: Cell::new(None),
            caller: Cell::new(0),
        }
    }
}

thread_local! {
    static CONTEXT: ThreadContext = const { ThreadContext::new() };
}

/// Held while the tracker works on the calling thread. Hooks hit meanwhile forward directly.
pub struct Busy {
    _thread_bound: PhantomData<*const ()>,
}

impl Busy {
    /// Mark the thread busy. `None` if it already is, or if the thread is exiting.
    pub fn acquire() -> Option<Busy> {
        CONTEXT
            .try_with(|context| {
                if context.busy.replace(true) {
                    None
                } else {
                    Some(Busy {
                        _thread_bound: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|context| context.busy.set(false));
    }
}

/// Identifier of the calling thread, as recorded with each block. Never 0.
pub fn thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

/// `true` while the calling thread is inside tracker bookkeeping.
pub fn is_busy() -> bool {
    CONTEXT.try_with(|context| context.busy.get()).unwrap_or(true)
}

/// Run `f` with hooks bypassed on this thread. Nests.
pub fn suppress<R, F: FnOnce() -> R>(f: F) -> R {
    let _busy = Busy::acquire();
    f()
}

/// One tracked entry point in flight on this thread.
pub struct EntryGuard {
    _thread_bound: PhantomData<*const ()>,
}

/// Record entry into a tracked routine. `None` if the thread is busy.
pub fn enter(name: &'static str) -> Option<EntryGuard> {
    CONTEXT
        .try_with(|context| {
            if context.busy.get() {
                return None;
            }
            let depth = context.depth.get();
            if depth == 0 {
                context.entry.set(Some(name));
                context.caller.set(0);
            }
            context.registered.set(false);
            context.depth.set(depth + 1);
            Some(EntryGuard {
                _thread_bound: PhantomData,
            })
        })
        .ok()
        .flatten()
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|context| {
            let depth = context.depth.get().saturating_sub(1);
            context.depth.set(depth);
            if depth == 0 {
                context.entry.set(None);
            }
        });
    }
}

/// Number of tracked entry points in flight.
pub fn depth() -> u32 {
    CONTEXT.try_with(|context| context.depth.get()).unwrap_or(0)
}

/// Name of the outermost tracked routine in flight.
pub fn entry() -> Option<&'static str> {
    CONTEXT.try_with(|context| context.entry.get()).ok().flatten()
}

/// `true` if a primitive entered after the innermost routine still in flight registered a block.
pub fn already_registered() -> bool {
    CONTEXT
        .try_with(|context| context.depth.get() > 0 && context.registered.get())
        .unwrap_or(false)
}

/// Remember that the routine in flight had its block registered, allocated from `caller`.
pub fn mark_registered(caller: usize) {
    let _ = CONTEXT.try_with(|context| {
        if context.depth.get() > 0 {
            context.registered.set(true);
            context.caller.set(caller);
        }
    });
}

/// Return address of the code that called the outermost tracked routine, once known.
pub fn caller() -> Option<usize> {
    CONTEXT
        .try_with(|context| context.caller.get())
        .ok()
        .filter(|caller| *caller != 0)
}

pub fn thread_enabled() -> bool {
    CONTEXT.try_with(|context| context.enabled.get()).unwrap_or(false)
}

/// Enable or disable tracking for the calling thread. Returns the previous state.
pub fn set_thread_enabled(enabled: bool) -> bool {
    CONTEXT
        .try_with(|context| context.enabled.replace(enabled))
        .unwrap_or(false)
}
