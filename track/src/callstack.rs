//! Call stacks of tracked allocations.
//!
//! A [`CallStack`] stores raw return addresses in fixed-size chunks, so that appending only
//! allocates when a chunk boundary is crossed and `clear` keeps the chunks for reuse. Resolution
//! into source locations happens at most once per stack; the result is cached on the stack.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use fnv::FnvHasher;
use heap_leak_types::FrameLine;

use crate::symbols::SymbolGateway;

/// Number of frames per chunk.
pub const CHUNK_SIZE: usize = 32;

/// Status bits of a call stack.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StackStatus(u8);

impl StackStatus {
    /// Capture stopped before reaching the outermost frame.
    pub const INCOMPLETE: StackStatus = StackStatus(0b001);
    /// Classified as runtime static-initialization noise.
    pub const STARTUP_NOISE: StackStatus = StackStatus(0b010);
    /// Classified as ordinary user allocation.
    pub const NOT_STARTUP_NOISE: StackStatus = StackStatus(0b100);

    pub fn contains(self, other: StackStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StackStatus) {
        self.0 |= other.0;
    }
}

/// Matches demangled function names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(pattern) => name == pattern,
            NamePattern::Prefix(pattern) => name.starts_with(pattern.as_str()),
            NamePattern::Suffix(pattern) => name.ends_with(pattern.as_str()),
            NamePattern::Contains(pattern) => name.contains(pattern.as_str()),
        }
    }
}

/// Classification rules applied while resolving stacks.
#[derive(Debug, Clone)]
pub struct StackFilter {
    /// Path fragments of source files internal to the tracker or the allocator.
    pub internal_files: Vec<String>,
    /// Functions internal to the tracker or the allocator, for frames without line info.
    pub internal_functions: Vec<NamePattern>,
    /// Static-initialization machinery.
    pub startup: Vec<NamePattern>,
    /// Entry points of user code.
    pub user: Vec<NamePattern>,
}

impl Default for StackFilter {
    fn default() -> Self {
        use NamePattern::*;
        Self {
            internal_files: vec![
                "heap-leak-track/src/".into(),
                "library/alloc/src/".into(),
                "library/std/src/sys/alloc/".into(),
                "library/std/src/alloc.rs".into(),
                "malloc/malloc.c".into(),
                "libsupc++/new_op".into(),
            ],
            internal_functions: vec![
                Prefix("heap_leak_track::".into()),
                Prefix("<heap_leak_track::".into()),
                Prefix("alloc::alloc::".into()),
                Prefix("__rust_alloc".into()),
                Prefix("__rust_realloc".into()),
                Prefix("__rdl_".into()),
                Exact("malloc".into()),
                Exact("calloc".into()),
                Exact("realloc".into()),
                Prefix("operator new".into()),
            ],
            startup: vec![
                Exact("_dl_init".into()),
                Exact("call_init".into()),
                Exact("_init".into()),
                Exact("__libc_csu_init".into()),
                Exact("__libc_early_init".into()),
                Prefix("_GLOBAL__sub_I_".into()),
                Prefix("__static_initialization_and_destruction".into()),
                Prefix("std::rt::init".into()),
                Prefix("std::rt::lang_start_internal".into()),
            ],
            user: vec![
                Exact("main".into()),
                Suffix("::main".into()),
                Contains("__rust_begin_short_backtrace".into()),
                Exact("start_thread".into()),
            ],
        }
    }
}

impl StackFilter {
    fn is_internal(&self, frame: &ResolvedFrame) -> bool {
        match &frame.file {
            Some(file) => {
                let file = file.to_string_lossy();
                self.internal_files
                    .iter()
                    .any(|fragment| file.contains(fragment.as_str()))
            }
            None => frame.function.as_deref().map_or(false, |name| {
                self.internal_functions
                    .iter()
                    .any(|pattern| pattern.matches(name))
            }),
        }
    }
}

/// A frame after symbol lookup. Either lookup may have failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: usize,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub module: Option<String>,
    pub function: Option<String>,
    pub displacement: Option<u64>,
    pub internal: bool,
}

impl ResolvedFrame {
    pub fn to_frame_line(&self) -> FrameLine {
        FrameLine {
            address: self.address as u64,
            file: self.file.clone(),
            line: self.line,
            module: self.module.clone(),
            function: self.function.clone(),
            displacement: self.displacement,
        }
    }
}

/// An ordered sequence of return addresses, innermost first.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    chunks: Vec<Box<[usize; CHUNK_SIZE]>>,
    len: usize,
    status: StackStatus,
    hash: Option<u64>,
    resolved: Option<Vec<ResolvedFrame>>,
}

impl CallStack {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append a frame. Allocates only when the last chunk is full.
    pub fn push(&mut self, address: usize) {
        let (chunk, offset) = (self.len / CHUNK_SIZE, self.len % CHUNK_SIZE);
        if chunk == self.chunks.len() {
            self.chunks.push(Box::new([0; CHUNK_SIZE]));
        }
        self.chunks[chunk][offset] = address;
        self.len += 1;
        self.hash = None;
    }

    /// The frame at `index`.
    ///
    /// # Panics
    ///
    /// If `index` is out of bounds.
    pub fn at(&self, index: usize) -> usize {
        assert!(
            index < self.len,
            "frame index {} out of bounds for stack of {}",
            index,
            self.len
        );
        self.chunks[index / CHUNK_SIZE][index % CHUNK_SIZE]
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        (index < self.len).then(|| self.at(index))
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forget all frames and derived state, keeping the chunks.
    pub fn clear(&mut self) {
        self.len = 0;
        self.status = StackStatus::default();
        self.hash = None;
        self.resolved = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .take(self.len)
    }

    /// Number of chunks backing the stack.
    pub fn capacity_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn status(&self) -> StackStatus {
        self.status
    }

    pub fn mark_incomplete(&mut self) {
        self.status.insert(StackStatus::INCOMPLETE);
    }

    pub fn is_incomplete(&self) -> bool {
        self.status.contains(StackStatus::INCOMPLETE)
    }

    /// Stable hash of the frame sequence.
    pub fn hash_value(&self) -> u64 {
        self.hash.unwrap_or_else(|| {
            let mut hasher = FnvHasher::default();
            for frame in self.iter() {
                hasher.write_usize(frame);
            }
            hasher.finish()
        })
    }

    /// Remember a hash computed while capturing.
    pub(crate) fn set_hash(&mut self, hash: u64) {
        self.hash = Some(hash);
    }

    /// `true` if any frame lies in `[low, high)`.
    pub fn touches(&self, low: usize, high: usize) -> bool {
        self.iter().any(|frame| low <= frame && frame < high)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Resolve every frame once and cache the result.
    ///
    /// Must run before the module owning any frame is unloaded; afterwards the frames can only be
    /// rendered as raw addresses.
    pub fn resolve_frames(
        &mut self,
        gateway: &SymbolGateway,
        filter: &StackFilter,
    ) -> &[ResolvedFrame] {
        if self.resolved.is_none() {
            let mut locked = gateway.lock();
            let mut frames = Vec::with_capacity(self.len);
            for address in self.iter() {
                // Return addresses point past the call instruction.
                let lookup = address.saturating_sub(1);
                let symbol = locked.function_name(lookup);
                let line = locked.source_line(lookup);
                let mut frame = ResolvedFrame {
                    address,
                    module: locked.module_name(lookup),
                    displacement: line
                        .as_ref()
                        .and_then(|line| line.displacement)
                        .or_else(|| symbol.as_ref().and_then(|symbol| symbol.displacement)),
                    file: line.as_ref().map(|line| line.file.clone()),
                    line: line.map(|line| line.line),
                    function: symbol.map(|symbol| symbol.name),
                    internal: false,
                };
                frame.internal = filter.is_internal(&frame);
                frames.push(frame);
            }
            self.resolved = Some(frames);
        }
        self.resolved.as_deref().unwrap_or(&[])
    }

    /// Frames selected for output, innermost first.
    ///
    /// Internal frames are dropped unless `include_internal` is set, except for the single
    /// internal frame right before the first retained user frame of a run.
    pub fn retained_frames(
        &self,
        include_internal: bool,
        max_frames: usize,
    ) -> Vec<&ResolvedFrame> {
        let frames = match &self.resolved {
            Some(frames) => frames,
            None => return Vec::new(),
        };
        let mut retained = Vec::new();
        for (index, frame) in frames.iter().enumerate() {
            if retained.len() == max_frames {
                break;
            }
            let keep = include_internal
                || !frame.internal
                || frames.get(index + 1).map_or(false, |next| !next.internal);
            if keep {
                retained.push(frame);
            }
        }
        retained
    }

    /// Resolve (once) and format the stack, one line per retained frame.
    pub fn resolve(
        &mut self,
        gateway: &SymbolGateway,
        filter: &StackFilter,
        include_internal: bool,
        max_frames: usize,
    ) -> String {
        self.resolve_frames(gateway, filter);
        let mut text = String::new();
        for frame in self.retained_frames(include_internal, max_frames) {
            text.push_str(&frame.to_frame_line().to_string());
            text.push('\n');
        }
        text
    }

    /// Decide whether the allocation came from runtime static initialization.
    ///
    /// Walks outward from the innermost frame; the first frame matching either the startup or the
    /// user patterns decides. The decision is cached in the status bits.
    pub fn is_startup_noise(&mut self, gateway: &SymbolGateway, filter: &StackFilter) -> bool {
        if self.status.contains(StackStatus::STARTUP_NOISE) {
            return true;
        }
        if self.status.contains(StackStatus::NOT_STARTUP_NOISE) {
            return false;
        }
        let mut noise = false;
        for frame in self.resolve_frames(gateway, filter) {
            let name = match &frame.function {
                Some(name) => name.as_str(),
                None => continue,
            };
            if filter.startup.iter().any(|pattern| pattern.matches(name)) {
                noise = true;
                break;
            }
            if filter.user.iter().any(|pattern| pattern.matches(name)) {
                break;
            }
        }
        self.status.insert(if noise {
            StackStatus::STARTUP_NOISE
        } else {
            StackStatus::NOT_STARTUP_NOISE
        });
        noise
    }

    /// Take over the resolution and classification of an equal stack.
    pub fn adopt_resolution(&mut self, other: &CallStack) {
        if self.resolved.is_none() && other.resolved.is_some() && *self == *other {
            self.resolved = other.resolved.clone();
            self.status.insert(StackStatus(
                other.status.0 & (StackStatus::STARTUP_NOISE.0 | StackStatus::NOT_STARTUP_NOISE.0),
            ));
        }
    }
}

impl FromIterator<usize> for CallStack {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut stack = CallStack::new();
        for frame in iter {
            stack.push(frame);
        }
        stack
    }
}

impl PartialEq for CallStack {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for CallStack {}

impl Hash for CallStack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use proptest::prelude::*;

    fn gateway(engine: &ScriptedEngine) -> SymbolGateway {
        SymbolGateway::new(Box::new(engine.clone()))
    }

    #[test]
    fn push_and_index_across_chunks() {
        let stack: CallStack = (1..=CHUNK_SIZE * 2 + 3).collect();
        assert_eq!(stack.size(), CHUNK_SIZE * 2 + 3);
        assert_eq!(stack.capacity_chunks(), 3);
        assert_eq!(stack.at(0), 1);
        assert_eq!(stack.at(CHUNK_SIZE), CHUNK_SIZE + 1);
        assert_eq!(stack.get(CHUNK_SIZE * 2 + 3), None);
    }

    #[test]
    fn clear_keeps_chunks() {
        let mut stack: CallStack = (0..CHUNK_SIZE * 3).collect();
        stack.mark_incomplete();
        stack.clear();
        assert!(stack.is_empty());
        assert!(!stack.is_incomplete());
        assert_eq!(stack.capacity_chunks(), 3);
    }

    #[test]
    fn hash_follows_frames() {
        let a: CallStack = [1, 2, 3].into_iter().collect();
        let b: CallStack = [1, 2, 3].into_iter().collect();
        let c: CallStack = [1, 2, 4].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a, c);
        assert_ne!(a.hash_value(), c.hash_value());
    }

    #[test]
    fn resolve_is_memoized() {
        let engine = ScriptedEngine::default();
        engine.define(0x1001, "demo", "demo::leak", Some(("src/leak.rs", 10)));
        engine.define(0x2001, "demo", "demo::main", Some(("src/main.rs", 3)));
        let gateway = gateway(&engine);
        let filter = StackFilter::default();

        let mut stack: CallStack = [0x1002, 0x2002].into_iter().collect();
        let first = stack.resolve(&gateway, &filter, false, 16);
        assert_eq!(
            first,
            "  src/leak.rs (10): demo!demo::leak()\n  src/main.rs (3): demo!demo::main()\n"
        );

        engine.define(0x1001, "demo", "demo::renamed", Some(("src/other.rs", 99)));
        let second = stack.resolve(&gateway, &filter, false, 16);
        assert_eq!(first, second);
    }

    #[test]
    fn unresolvable_frames_render_raw() {
        let engine = ScriptedEngine::default();
        engine.define_function(0x3001, "libfoo.so", "foo");
        let gateway = gateway(&engine);
        let mut stack: CallStack = [0x3002, 0x4002].into_iter().collect();
        let text = stack.resolve(&gateway, &StackFilter::default(), false, 16);
        assert_eq!(
            text,
            "  0x0000000000003002 (unavailable): libfoo.so!foo()\n\
             \x20 0x0000000000004002 (unavailable): <unknown module>!<unknown function>()\n"
        );
    }

    #[test]
    fn internal_frames_are_suppressed_but_nearest_is_kept() {
        let engine = ScriptedEngine::default();
        engine.define(0x1001, "t", "a", Some(("/x/heap-leak-track/src/hooks.rs", 1)));
        engine.define(0x2001, "t", "b", Some(("/x/heap-leak-track/src/context.rs", 2)));
        engine.define(0x3001, "t", "user", Some(("src/user.rs", 3)));
        let gateway = gateway(&engine);
        let mut stack: CallStack = [0x1002, 0x2002, 0x3002].into_iter().collect();

        let brief = stack.resolve(&gateway, &StackFilter::default(), false, 16);
        assert_eq!(
            brief,
            "  /x/heap-leak-track/src/context.rs (2): t!b()\n  src/user.rs (3): t!user()\n"
        );
        let full = stack.resolve(&gateway, &StackFilter::default(), true, 16);
        assert_eq!(full.lines().count(), 3);
        let bounded = stack.resolve(&gateway, &StackFilter::default(), true, 1);
        assert_eq!(bounded.lines().count(), 1);
    }

    #[test]
    fn startup_classification() {
        let engine = ScriptedEngine::default();
        engine.define_function(0x1001, "t", "std::rt::lang_start_internal");
        engine.define_function(0x2001, "t", "demo::main");
        engine.define_function(0x3001, "t", "_dl_init");
        engine.define_function(0x4001, "t", "helper");
        let gateway = gateway(&engine);
        let filter = StackFilter::default();

        let mut startup: CallStack = [0x4002, 0x1002, 0x2002].into_iter().collect();
        assert!(startup.is_startup_noise(&gateway, &filter));
        assert!(startup.status().contains(StackStatus::STARTUP_NOISE));

        let mut user: CallStack = [0x4002, 0x2002, 0x3002].into_iter().collect();
        assert!(!user.is_startup_noise(&gateway, &filter));
        assert!(user.status().contains(StackStatus::NOT_STARTUP_NOISE));

        let mut unknown: CallStack = [0x4002].into_iter().collect();
        assert!(!unknown.is_startup_noise(&gateway, &filter));
    }

    #[test]
    fn adopts_resolution_from_equal_stack() {
        let engine = ScriptedEngine::default();
        engine.define_function(0x1001, "t", "f");
        let gateway = gateway(&engine);
        let mut resolved: CallStack = [0x1002].into_iter().collect();
        resolved.resolve_frames(&gateway, &StackFilter::default());

        let mut fresh: CallStack = [0x1002].into_iter().collect();
        fresh.adopt_resolution(&resolved);
        assert!(fresh.is_resolved());

        let mut different: CallStack = [0x2002].into_iter().collect();
        different.adopt_resolution(&resolved);
        assert!(!different.is_resolved());
    }

    proptest! {
        #[test]
        fn refill_equals_fresh(
            frames in proptest::collection::vec(1usize..usize::MAX, 0..CHUNK_SIZE * 4),
        ) {
            let mut reused: CallStack = (0..CHUNK_SIZE * 4).map(|i| i + 7).collect();
            reused.clear();
            for frame in &frames {
                reused.push(*frame);
            }
            let fresh: CallStack = frames.iter().copied().collect();
            prop_assert_eq!(reused.size(), frames.len());
            prop_assert_eq!(reused.hash_value(), fresh.hash_value());
            prop_assert!(reused == fresh);
        }
    }
}
