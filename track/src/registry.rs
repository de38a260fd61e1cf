//! Live blocks per heap.
//!
//! One [`CriticalSection`] guards every heap's block map. It is held for the duration of a single
//! register, unregister or drain call and never across a symbol gateway call: resolution works on
//! cloned stacks whose results are written back with [`Registry::store_resolution`].

use fnv::FnvHashMap;
use heap_leak_types::Statistics;

use crate::callstack::CallStack;
use crate::critical_section::CriticalSection;

/// Opaque identifier of an allocation arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(pub usize);

impl HeapHandle {
    /// The process default heap, used by the C runtime and the Rust global allocator.
    pub const DEFAULT: HeapHandle = HeapHandle(0);
}

/// Which family of entry points produced a block.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockKind(u16);

impl BlockKind {
    /// `malloc` and friends.
    pub const CRT: BlockKind = BlockKind(0b0000_0001);
    /// C++ `operator new`.
    pub const NEW: BlockKind = BlockKind(0b0000_0010);
    /// C++ `operator new[]`.
    pub const NEW_ARRAY: BlockKind = BlockKind(0b0000_0100);
    /// Over-aligned allocation.
    pub const ALIGNED: BlockKind = BlockKind(0b0000_1000);
    /// The Rust global allocator.
    pub const RUST: BlockKind = BlockKind(0b0001_0000);
    /// A private heap managed by the host.
    pub const HEAP: BlockKind = BlockKind(0b0010_0000);

    pub const fn union(self, other: BlockKind) -> BlockKind {
        BlockKind(self.0 | other.0)
    }

    pub fn contains(self, other: BlockKind) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Kind of a heap record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeapKind {
    /// The default heap; never destroyed.
    Process,
    /// A heap created and destroyed by the host.
    Private,
}

/// Metadata of one live allocation.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub stack: CallStack,
    pub thread_id: usize,
    pub serial: u64,
    pub size: usize,
    pub reported: bool,
    pub kind: BlockKind,
}

#[derive(Debug)]
struct HeapRecord {
    blocks: FnvHashMap<usize, BlockRecord>,
    kind: HeapKind,
}

impl HeapRecord {
    fn new(kind: HeapKind) -> Self {
        Self {
            blocks: Default::default(),
            kind,
        }
    }
}

/// Result of freeing an address.
#[derive(Debug)]
pub enum FreeOutcome {
    Removed(BlockRecord),
    /// Not tracked, for example allocated before tracking started.
    Untracked,
    /// Tracked, but by a different heap than the one freeing it.
    Mismatch { owner: HeapHandle },
}

/// A leaked block copied out of the registry for reporting.
#[derive(Debug, Clone)]
pub struct LeakCandidate {
    pub heap: HeapHandle,
    pub address: usize,
    pub serial: u64,
    pub size: usize,
    pub thread_id: usize,
    pub stack: CallStack,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct RegistryState {
    heaps: FnvHashMap<HeapHandle, HeapRecord>,
    next_serial: u64,
    stats: Statistics,
}

impl RegistryState {
    fn release(&mut self, size: usize) {
        self.stats.current_bytes = self.stats.current_bytes.saturating_sub(size as u64);
    }
}

fn matches_thread(record: &BlockRecord, thread: Option<usize>) -> bool {
    thread.map_or(true, |thread| record.thread_id == thread)
}

/// Copy the leading bytes of a live block.
///
/// # Safety
///
/// `address` must point to at least `len` readable bytes.
unsafe fn copy_user_data(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Maps heaps to their live blocks.
#[derive(Debug, Default)]
pub struct Registry {
    state: CriticalSection<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Create an empty heap record unless one exists. Returns `true` if created.
    pub fn register_heap(&self, heap: HeapHandle, kind: HeapKind) -> bool {
        let mut state = self.state.enter();
        if state.heaps.contains_key(&heap) {
            return false;
        }
        state.heaps.insert(heap, HeapRecord::new(kind));
        true
    }

    pub fn contains_heap(&self, heap: HeapHandle) -> bool {
        self.state.enter().heaps.contains_key(&heap)
    }

    pub fn heap_kind(&self, heap: HeapHandle) -> Option<HeapKind> {
        self.state.enter().heaps.get(&heap).map(|record| record.kind)
    }

    /// Record a new block and return its serial number.
    ///
    /// Unknown heaps are registered on the fly as private heaps, except the default heap. A block
    /// already present at `address` means its free went unobserved; the stale record is replaced.
    pub fn register_block(
        &self,
        heap: HeapHandle,
        address: usize,
        size: usize,
        thread_id: usize,
        kind: BlockKind,
        stack: CallStack,
    ) -> u64 {
        let mut state = self.state.enter();
        state.next_serial += 1;
        let serial = state.next_serial;
        state.stats.total_allocations += 1;
        state.stats.total_bytes += size as u64;
        state.stats.current_bytes += size as u64;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.current_bytes);

        let heap_kind = if heap == HeapHandle::DEFAULT {
            HeapKind::Process
        } else {
            HeapKind::Private
        };
        let record = BlockRecord {
            stack,
            thread_id,
            serial,
            size,
            reported: false,
            kind,
        };
        let stale = state
            .heaps
            .entry(heap)
            .or_insert_with(|| HeapRecord::new(heap_kind))
            .blocks
            .insert(address, record);
        if let Some(stale) = stale {
            state.release(stale.size);
        }
        serial
    }

    /// Replace size and stack of a block reallocated in place, keeping its serial number.
    ///
    /// Returns `false` if the block is not tracked.
    pub fn update_block_in_place(
        &self,
        heap: HeapHandle,
        address: usize,
        size: usize,
        stack: CallStack,
    ) -> bool {
        let mut state = self.state.enter();
        let old_size = match state
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&address))
        {
            Some(block) => {
                let old_size = block.size;
                block.size = size;
                block.stack = stack;
                block.reported = false;
                old_size
            }
            None => return false,
        };
        state.release(old_size);
        state.stats.total_bytes += size as u64;
        state.stats.current_bytes += size as u64;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.current_bytes);
        true
    }

    /// Put back a record taken out with [`Registry::unregister_block`], keeping its serial
    /// number. Returns `false`, dropping the record, if `address` was registered meanwhile.
    pub fn reinsert_block(&self, heap: HeapHandle, address: usize, record: BlockRecord) -> bool {
        let mut state = self.state.enter();
        let size = record.size as u64;
        let heap_kind = if heap == HeapHandle::DEFAULT {
            HeapKind::Process
        } else {
            HeapKind::Private
        };
        let blocks = &mut state
            .heaps
            .entry(heap)
            .or_insert_with(|| HeapRecord::new(heap_kind))
            .blocks;
        if blocks.contains_key(&address) {
            return false;
        }
        blocks.insert(address, record);
        state.stats.current_bytes += size;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.current_bytes);
        true
    }

    /// Forget a block. A no-op for untracked addresses.
    pub fn unregister_block(&self, heap: HeapHandle, address: usize) -> Option<BlockRecord> {
        match self.unregister_block_checked(heap, address, false) {
            FreeOutcome::Removed(record) => Some(record),
            _ => None,
        }
    }

    /// Forget a block, optionally checking that no other heap owns it when `heap` does not.
    pub fn unregister_block_checked(
        &self,
        heap: HeapHandle,
        address: usize,
        validate: bool,
    ) -> FreeOutcome {
        let mut state = self.state.enter();
        let removed = state
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.remove(&address));
        if let Some(record) = removed {
            state.release(record.size);
            return FreeOutcome::Removed(record);
        }
        if validate {
            let owner = state
                .heaps
                .iter()
                .find(|(_, record)| record.blocks.contains_key(&address))
                .map(|(handle, _)| *handle);
            if let Some(owner) = owner {
                return FreeOutcome::Mismatch { owner };
            }
        }
        FreeOutcome::Untracked
    }

    /// Remove a heap that is about to be destroyed and return every block still in it, ordered
    /// by serial number. Each is a leak: the memory becomes unreadable with the heap.
    pub fn drain_heap_as_leaks(&self, heap: HeapHandle, max_data: usize) -> Vec<LeakCandidate> {
        let mut state = self.state.enter();
        let record = match state.heaps.remove(&heap) {
            Some(record) => record,
            None => return Vec::new(),
        };
        let mut leaks: Vec<_> = record
            .blocks
            .into_iter()
            .map(|(address, block)| {
                let data = if max_data > 0 {
                    // SAFETY: the heap has not been destroyed yet and the block was never freed.
                    unsafe { copy_user_data(address, block.size.min(max_data)) }
                } else {
                    Vec::new()
                };
                LeakCandidate {
                    heap,
                    address,
                    serial: block.serial,
                    size: block.size,
                    thread_id: block.thread_id,
                    stack: block.stack,
                    data,
                }
            })
            .collect();
        for leak in &leaks {
            state.release(leak.size);
        }
        leaks.sort_by_key(|leak| leak.serial);
        leaks
    }

    /// Number of live blocks not yet reported, optionally for one thread only.
    pub fn leak_count(&self, thread: Option<usize>) -> usize {
        self.count(|record| !record.reported && matches_thread(record, thread))
    }

    /// Number of live blocks including reported ones.
    pub fn raw_outstanding(&self, thread: Option<usize>) -> usize {
        self.count(|record| matches_thread(record, thread))
    }

    fn count<F: Fn(&BlockRecord) -> bool>(&self, predicate: F) -> usize {
        let state = self.state.enter();
        state
            .heaps
            .values()
            .flat_map(|heap| heap.blocks.values())
            .filter(|record| predicate(record))
            .count()
    }

    /// Flag every live block as reported. Returns the number of newly flagged blocks.
    pub fn mark_all_reported(&self, thread: Option<usize>) -> usize {
        let mut state = self.state.enter();
        let mut marked = 0;
        for record in state.heaps.values_mut().flat_map(|heap| heap.blocks.values_mut()) {
            if !record.reported && matches_thread(record, thread) {
                record.reported = true;
                marked += 1;
            }
        }
        marked
    }

    /// Copy every unreported live block, ordered by serial number.
    ///
    /// With `max_data > 0` the leading bytes of each block are copied too; this reads the
    /// blocks' memory, which stays valid because frees wait for the registry lock before
    /// releasing memory.
    pub fn snapshot_leaks(&self, thread: Option<usize>, max_data: usize) -> Vec<LeakCandidate> {
        let state = self.state.enter();
        let mut leaks = Vec::new();
        for (heap, record) in &state.heaps {
            for (address, block) in &record.blocks {
                if block.reported || !matches_thread(block, thread) {
                    continue;
                }
                let data = if max_data > 0 {
                    // SAFETY: the block is live and cannot be freed while we hold the lock.
                    unsafe { copy_user_data(*address, block.size.min(max_data)) }
                } else {
                    Vec::new()
                };
                leaks.push(LeakCandidate {
                    heap: *heap,
                    address: *address,
                    serial: block.serial,
                    size: block.size,
                    thread_id: block.thread_id,
                    stack: block.stack.clone(),
                    data,
                });
            }
        }
        leaks.sort_by_key(|leak| leak.serial);
        leaks
    }

    /// Copies of unresolved stacks, optionally only those with a frame in `[low, high)`.
    pub fn unresolved_stacks(&self, range: Option<(usize, usize)>) -> Vec<LeakCandidate> {
        let state = self.state.enter();
        let mut stacks = Vec::new();
        for (heap, record) in &state.heaps {
            for (address, block) in &record.blocks {
                if block.stack.is_resolved() {
                    continue;
                }
                if let Some((low, high)) = range {
                    if !block.stack.touches(low, high) {
                        continue;
                    }
                }
                stacks.push(LeakCandidate {
                    heap: *heap,
                    address: *address,
                    serial: block.serial,
                    size: block.size,
                    thread_id: block.thread_id,
                    stack: block.stack.clone(),
                    data: Vec::new(),
                });
            }
        }
        stacks
    }

    /// Write a resolved stack back to its block, if the block still exists unchanged.
    pub fn store_resolution(
        &self,
        heap: HeapHandle,
        address: usize,
        serial: u64,
        stack: &CallStack,
    ) {
        let mut state = self.state.enter();
        if let Some(block) = state
            .heaps
            .get_mut(&heap)
            .and_then(|record| record.blocks.get_mut(&address))
            .filter(|block| block.serial == serial)
        {
            block.stack.adopt_resolution(stack);
        }
    }

    /// A copy of one block's record.
    pub fn block(&self, heap: HeapHandle, address: usize) -> Option<BlockRecord> {
        let state = self.state.enter();
        state
            .heaps
            .get(&heap)
            .and_then(|record| record.blocks.get(&address))
            .cloned()
    }

    pub fn statistics(&self) -> Statistics {
        self.state.enter().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stack(frames: &[usize]) -> CallStack {
        frames.iter().copied().collect()
    }

    #[test]
    fn register_and_unregister() {
        let registry = Registry::new();
        let heap = HeapHandle(7);
        assert!(registry.register_heap(heap, HeapKind::Private));
        assert!(!registry.register_heap(heap, HeapKind::Private));

        registry.register_block(heap, 0x1000, 16, 1, BlockKind::CRT, stack(&[1, 2]));
        assert_eq!(registry.leak_count(None), 1);
        assert!(registry.unregister_block(heap, 0x1000).is_some());
        assert_eq!(registry.leak_count(None), 0);
        assert!(registry.unregister_block(heap, 0x1000).is_none());
    }

    #[test]
    fn serials_increase() {
        let registry = Registry::new();
        let heap = HeapHandle::DEFAULT;
        let a = registry.register_block(heap, 0x10, 1, 1, BlockKind::CRT, stack(&[1]));
        let b = registry.register_block(heap, 0x20, 1, 1, BlockKind::CRT, stack(&[1]));
        assert!(b > a);
    }

    #[test]
    fn update_in_place_keeps_serial() {
        let registry = Registry::new();
        let heap = HeapHandle::DEFAULT;
        let serial = registry.register_block(heap, 0x10, 8, 1, BlockKind::CRT, stack(&[1]));
        assert!(registry.update_block_in_place(heap, 0x10, 64, stack(&[2, 3])));
        let block = registry.block(heap, 0x10).unwrap();
        assert_eq!(block.serial, serial);
        assert_eq!(block.size, 64);
        assert_eq!(block.stack, stack(&[2, 3]));
        assert!(!registry.update_block_in_place(heap, 0x20, 64, stack(&[2])));
        assert_eq!(registry.statistics().current_bytes, 64);
        assert_eq!(registry.statistics().peak_bytes, 64);
    }

    #[test]
    fn reinsert_restores_a_taken_block() {
        let registry = Registry::new();
        let heap = HeapHandle::DEFAULT;
        let serial = registry.register_block(heap, 0x10, 8, 1, BlockKind::CRT, stack(&[1]));
        let taken = registry.unregister_block(heap, 0x10).unwrap();
        assert_eq!(registry.statistics().current_bytes, 0);
        assert!(registry.reinsert_block(heap, 0x10, taken.clone()));
        assert_eq!(registry.block(heap, 0x10).unwrap().serial, serial);
        assert_eq!(registry.statistics().current_bytes, 8);
        assert_eq!(registry.statistics().total_allocations, 1);

        // Someone else registered the address meanwhile: theirs stays.
        registry.unregister_block(heap, 0x10);
        let newer = registry.register_block(heap, 0x10, 32, 2, BlockKind::CRT, stack(&[2]));
        assert!(!registry.reinsert_block(heap, 0x10, taken));
        assert_eq!(registry.block(heap, 0x10).unwrap().serial, newer);
        assert_eq!(registry.statistics().current_bytes, 32);
    }

    #[test]
    fn mismatched_free_is_detected() {
        let registry = Registry::new();
        registry.register_block(HeapHandle(1), 0x10, 8, 1, BlockKind::HEAP, stack(&[1]));
        assert!(matches!(
            registry.unregister_block_checked(HeapHandle(2), 0x10, true),
            FreeOutcome::Mismatch { owner: HeapHandle(1) }
        ));
        assert!(matches!(
            registry.unregister_block_checked(HeapHandle(2), 0x10, false),
            FreeOutcome::Untracked
        ));
        assert_eq!(registry.leak_count(None), 1);
    }

    #[test]
    fn drain_reports_all_and_removes_heap() {
        let registry = Registry::new();
        let heap = HeapHandle(3);
        registry.register_heap(heap, HeapKind::Private);
        for address in [0x30, 0x10, 0x20] {
            registry.register_block(heap, address, 4, 1, BlockKind::HEAP, stack(&[address]));
        }
        registry.register_block(HeapHandle::DEFAULT, 0x40, 4, 1, BlockKind::CRT, stack(&[9]));

        let leaks = registry.drain_heap_as_leaks(heap, 0);
        assert_eq!(leaks.len(), 3);
        assert!(leaks.windows(2).all(|pair| pair[0].serial < pair[1].serial));
        assert!(!registry.contains_heap(heap));
        assert_eq!(registry.leak_count(None), 1);
        assert!(registry.drain_heap_as_leaks(heap, 0).is_empty());
    }

    #[test]
    fn mark_reported_then_new_leak() {
        let registry = Registry::new();
        let heap = HeapHandle::DEFAULT;
        for address in 1..=3 {
            registry.register_block(heap, address, 1, 1, BlockKind::CRT, stack(&[1]));
        }
        assert_eq!(registry.mark_all_reported(None), 3);
        registry.register_block(heap, 4, 1, 1, BlockKind::CRT, stack(&[1]));
        assert_eq!(registry.leak_count(None), 1);
        assert_eq!(registry.raw_outstanding(None), 4);
        assert_eq!(registry.snapshot_leaks(None, 0).len(), 1);
    }

    #[test]
    fn thread_filter() {
        let registry = Registry::new();
        registry.register_block(HeapHandle::DEFAULT, 1, 1, 10, BlockKind::CRT, stack(&[1]));
        registry.register_block(HeapHandle::DEFAULT, 2, 1, 20, BlockKind::CRT, stack(&[1]));
        assert_eq!(registry.leak_count(Some(10)), 1);
        assert_eq!(registry.mark_all_reported(Some(20)), 1);
        assert_eq!(registry.leak_count(None), 1);
        assert_eq!(registry.raw_outstanding(Some(20)), 1);
    }

    #[test]
    fn user_data_is_copied() {
        let registry = Registry::new();
        let buffer = b"leaky bytes".to_vec();
        let address = buffer.as_ptr() as usize;
        let size = buffer.len();
        registry.register_block(HeapHandle::DEFAULT, address, size, 1, BlockKind::CRT, stack(&[1]));
        let leaks = registry.snapshot_leaks(None, 5);
        assert_eq!(leaks[0].data, b"leaky");
        registry.unregister_block(HeapHandle::DEFAULT, address);
    }

    #[test]
    fn resolution_is_written_back() {
        use crate::callstack::StackFilter;
        use crate::symbols::SymbolGateway;
        use crate::testing::ScriptedEngine;

        let registry = Registry::new();
        let heap = HeapHandle::DEFAULT;
        let serial = registry.register_block(heap, 1, 1, 1, BlockKind::CRT, stack(&[0x11]));
        let mut pending = registry.unresolved_stacks(Some((0x10, 0x20)));
        assert_eq!(pending.len(), 1);
        assert!(registry.unresolved_stacks(Some((0x20, 0x30))).is_empty());

        let gateway = SymbolGateway::new(Box::new(ScriptedEngine::default()));
        pending[0].stack.resolve_frames(&gateway, &StackFilter::default());
        registry.store_resolution(HeapHandle::DEFAULT, 1, serial, &pending[0].stack);
        assert!(registry.block(HeapHandle::DEFAULT, 1).unwrap().stack.is_resolved());
        assert!(registry.unresolved_stacks(None).is_empty());
    }

    proptest! {
        #[test]
        fn count_tracks_operations(
            ops in proptest::collection::vec((0usize..32, any::<bool>()), 0..200),
            mark_at in 0usize..200,
        ) {
            let registry = Registry::new();
            let mut live = std::collections::HashSet::new();
            let mut reported = std::collections::HashSet::new();
            for (step, (address, allocate)) in ops.into_iter().enumerate() {
                if step == mark_at {
                    registry.mark_all_reported(None);
                    reported.extend(live.iter().copied());
                }
                if allocate {
                    if live.insert(address) {
                        let (heap, frames) = (HeapHandle::DEFAULT, stack(&[address]));
                        registry.register_block(heap, address, 1, 1, BlockKind::CRT, frames);
                        reported.remove(&address);
                    }
                } else if live.remove(&address) {
                    registry.unregister_block(HeapHandle::DEFAULT, address);
                    reported.remove(&address);
                }
            }
            prop_assert_eq!(registry.raw_outstanding(None), live.len());
            prop_assert_eq!(registry.leak_count(None), live.difference(&reported).count());
        }
    }
}
