//! Stack capture strategies.
//!
//! The fast strategy grabs the whole backtrace in one bulk call into a fixed buffer and hashes
//! it on the way; the safe strategy asks the unwinder for one frame at a time through the symbol
//! gateway.

use std::ffi::c_void;
use std::hash::Hasher;

use fnv::FnvHasher;

use crate::callstack::CallStack;
use crate::symbols::SymbolGateway;

/// Upper bound on frames captured by the fast strategy.
pub const TRACE_MAX_SIZE: usize = 256;

/// A size-limited stack trace composed of instruction pointers
struct Trace {
    size: usize,
    complete: bool,
    data: [*mut c_void; TRACE_MAX_SIZE],
}

impl Trace {
    /// Construct and fill a new trace of at most `depth` frames.
    #[inline(never)]
    fn new(depth: usize) -> Self {
        let mut trace = Self {
            size: 0,
            complete: true,
            data: [std::ptr::null_mut(); TRACE_MAX_SIZE],
        };
        trace.fill(depth.min(TRACE_MAX_SIZE));
        trace
    }

    #[cfg(feature = "libunwind")]
    fn fill(&mut self, depth: usize) {
        let size = unsafe { libunwind_sys::unw_backtrace(self.data.as_mut_ptr(), depth as _) };
        if size < 0 {
            self.size = 0;
            self.complete = false;
        } else {
            self.finish(size as usize, depth);
        }
    }

    #[cfg(not(feature = "libunwind"))]
    fn fill(&mut self, depth: usize) {
        let data = &mut self.data;
        let mut size = 0;
        let mut truncated = false;
        // SAFETY: the fast walk is lock-free by contract; re-entrant tracker calls are blocked by
        // the thread-local context before they get here.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if size == depth {
                    truncated = true;
                    return false;
                }
                data[size] = frame.ip();
                size += 1;
                true
            });
        }
        self.finish(size, if truncated { size } else { usize::MAX });
    }

    fn finish(&mut self, mut size: usize, depth: usize) {
        while size > 0 && self.data[size - 1].is_null() {
            size -= 1;
        }
        self.size = size;
        if size >= depth {
            self.complete = false;
        }
    }

    fn frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.data[..self.size].iter().map(|ip| *ip as usize)
    }
}

/// Capture the calling thread's stack with one bulk backtrace call.
///
/// Leading frames for which `skip` returns `true` are dropped, so the stack starts at the first
/// frame outside the tracker. The stack hash is computed while copying.
pub fn capture_fast<F: Fn(usize) -> bool>(max_depth: usize, skip: F) -> CallStack {
    let trace = Trace::new(max_depth.saturating_add(1));
    let mut stack = CallStack::new();
    let mut hasher = FnvHasher::default();
    let mut leading = true;
    for ip in trace.frames() {
        if ip == 0 {
            stack.mark_incomplete();
            break;
        }
        if leading && skip(ip) {
            continue;
        }
        leading = false;
        if stack.size() == max_depth {
            stack.mark_incomplete();
            break;
        }
        stack.push(ip);
        hasher.write_usize(ip);
    }
    if !trace.complete {
        stack.mark_incomplete();
    }
    stack.set_hash(hasher.finish());
    stack
}

/// Capture the calling thread's stack frame by frame through the gateway's unwinder.
pub fn capture_safe<F: Fn(usize) -> bool>(
    gateway: &SymbolGateway,
    max_depth: usize,
    skip: F,
) -> CallStack {
    let mut stack = CallStack::new();
    let mut leading = true;
    let mut truncated = false;
    gateway.lock().walk_stack(&mut |ip| {
        if leading && skip(ip) {
            return true;
        }
        leading = false;
        if stack.size() == max_depth {
            truncated = true;
            return false;
        }
        stack.push(ip);
        true
    });
    if truncated {
        stack.mark_incomplete();
    }
    stack
}

/// The frame that called the outermost of `entries` nested tracked routines.
///
/// `stack` starts just outside the innermost routine, and every routine further out shows up as
/// a run of frames for which `is_tracker` holds. The frame after the last such run is the caller;
/// without runs to go by it is the first frame.
pub fn outermost_caller<F: Fn(usize) -> bool>(
    stack: &CallStack,
    entries: u32,
    is_tracker: F,
) -> usize {
    let mut frames = stack.iter();
    let mut caller = match frames.next() {
        Some(frame) => frame,
        None => return 0,
    };
    let mut remaining = entries.saturating_sub(1);
    let mut inside = false;
    for frame in frames {
        if remaining == 0 {
            break;
        }
        if is_tracker(frame) {
            inside = true;
        } else if inside {
            caller = frame;
            inside = false;
            remaining -= 1;
        }
    }
    caller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[inline(never)]
    fn nested(depth: usize) -> CallStack {
        if depth == 0 {
            capture_fast(TRACE_MAX_SIZE, |_| false)
        } else {
            let stack = nested(depth - 1);
            std::hint::black_box(stack)
        }
    }

    #[test]
    fn fast_capture_sees_frames() {
        let stack = nested(4);
        assert!(stack.size() > 4);
        assert_eq!(stack.hash_value(), stack.iter().collect::<CallStack>().hash_value());
    }

    #[test]
    fn fast_capture_bounded() {
        let stack = nested(8);
        let short = capture_fast(2, |_| false);
        assert!(stack.size() > 2);
        assert_eq!(short.size(), 2);
        assert!(short.is_incomplete());
    }

    #[test]
    fn caller_is_outside_the_outermost_entry() {
        let tracker = |ip: usize| (0x700..0x800).contains(&ip);
        // operator new (0x710) called by 0x310; its malloc (0x720) called from 0x510.
        let stack: CallStack = [0x510usize, 0x710, 0x711, 0x310, 0x110].into_iter().collect();
        assert_eq!(outermost_caller(&stack, 1, tracker), 0x510);
        assert_eq!(outermost_caller(&stack, 2, tracker), 0x310);
        // More entries than runs: the last run found wins.
        assert_eq!(outermost_caller(&stack, 3, tracker), 0x310);
        assert_eq!(outermost_caller(&stack, 0, tracker), 0x510);
        assert_eq!(outermost_caller(&CallStack::new(), 2, tracker), 0);
    }

    #[test]
    fn safe_capture_skips_leading_frames() {
        let engine = ScriptedEngine::default();
        engine.set_stack(vec![0x10, 0x20, 0x30, 0x40]);
        let gateway = SymbolGateway::new(Box::new(engine));

        let stack = capture_safe(&gateway, 8, |ip| ip < 0x30);
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![0x30, 0x40]);
        assert!(!stack.is_incomplete());

        let short = capture_safe(&gateway, 1, |_| false);
        assert_eq!(short.iter().collect::<Vec<_>>(), vec![0x10]);
        assert!(short.is_incomplete());
    }
}
