//! # Heap Tracker
//!
//! Keeps the number of live host mappings below the host's per-process
//! ceiling while still offering a flat host view of guest memory.
//!
//! Ordinary regions are mapped straight through to the host buffer.
//! Separate heap regions are only recorded; the host mapping is created the
//! first time the guest touches the region (a host fault routed to
//! [`HeapTracker::deferred_map_separate_heap`]). When the number of resident
//! separate heap mappings passes the ceiling, the oldest half is unmapped
//! again in one batch.
//!
//! Nodes live in a slab and are indexed twice: by guest address for range
//! queries and splits, and by `(tick, slot)` for the resident mappings only.

use guestmem_hal::{HostMemoryBuffer, MemoryPermission};
use spin::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Host map count assumed when the host does not report one
pub const DEFAULT_MAX_MAP_COUNT: usize = 65530;

/// Mappings left for the rest of the emulator and its libraries
pub const MAP_COUNT_MARGIN: usize = 20000;

const MAX_MAP_COUNT_PATH: &str = "/proc/sys/vm/max_map_count";

/// Heap tracker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapTrackerConfig {
    /// Resident separate heap mappings allowed before eviction
    pub max_resident_map_count: usize,
}

impl HeapTrackerConfig {
    /// Derive the ceiling from a host maximum map count
    pub const fn from_max_map_count(max_map_count: usize) -> Self {
        Self { max_resident_map_count: max_map_count.saturating_sub(MAP_COUNT_MARGIN) }
    }

    /// Read the host maximum map count once
    pub fn from_host() -> Self {
        let max_map_count = match std::fs::read_to_string(MAX_MAP_COUNT_PATH) {
            Ok(contents) => contents.trim().parse().unwrap_or_else(|_| {
                log::warn!("Unparsable {MAX_MAP_COUNT_PATH}: {:?}", contents.trim());
                DEFAULT_MAX_MAP_COUNT
            }),
            Err(err) => {
                log::warn!("Cannot read {MAX_MAP_COUNT_PATH}: {err}, assuming {DEFAULT_MAX_MAP_COUNT}");
                DEFAULT_MAX_MAP_COUNT
            }
        };
        Self::from_max_map_count(max_map_count)
    }
}

impl Default for HeapTrackerConfig {
    fn default() -> Self {
        Self::from_max_map_count(DEFAULT_MAX_MAP_COUNT)
    }
}

#[derive(Debug, Clone, Copy)]
struct SeparateHeapMap {
    vaddr: u64,
    paddr: u64,
    size: u64,
    tick: u64,
    perm: MemoryPermission,
    is_resident: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    slab: Vec<Option<SeparateHeapMap>>,
    free_slots: Vec<usize>,
    by_address: BTreeMap<u64, usize>,
    resident: BTreeSet<(u64, usize)>,
    tick: u64,
}

impl TrackerState {
    fn node(&self, slot: usize) -> &SeparateHeapMap {
        self.slab[slot].as_ref().expect("dangling separate heap slot")
    }

    fn node_mut(&mut self, slot: usize) -> &mut SeparateHeapMap {
        self.slab[slot].as_mut().expect("dangling separate heap slot")
    }

    fn insert(&mut self, map: SeparateHeapMap) -> usize {
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slab[slot] = Some(map);
                slot
            }
            None => {
                self.slab.push(Some(map));
                self.slab.len() - 1
            }
        };
        self.by_address.insert(map.vaddr, slot);
        if map.is_resident {
            self.resident.insert((map.tick, slot));
        }
        slot
    }

    fn remove(&mut self, slot: usize) {
        let map = self.slab[slot].take().expect("dangling separate heap slot");
        self.by_address.remove(&map.vaddr);
        if map.is_resident {
            self.resident.remove(&(map.tick, slot));
        }
        self.free_slots.push(slot);
    }

    fn next_tick(&mut self) -> u64 {
        let tick = self.tick;
        self.tick += 1;
        tick
    }

    /// Node containing `offset`
    fn nearest(&self, offset: u64) -> Option<usize> {
        let (_, &slot) = self.by_address.range(..=offset).next_back()?;
        let node = self.node(slot);
        (offset < node.vaddr + node.size).then_some(slot)
    }

    /// Drop every node inside `[offset, offset + size)`, splitting nodes
    /// that straddle the edges. Returns whether anything was removed.
    fn remove_range(&mut self, offset: u64, size: u64) -> bool {
        let end = offset + size;
        self.split_at(offset);
        self.split_at(end);

        let doomed: Vec<usize> = self.by_address.range(offset..end).map(|(_, &slot)| slot).collect();
        for &slot in &doomed {
            self.remove(slot);
        }
        !doomed.is_empty()
    }

    /// Split the node containing `offset` so that a node starts there
    fn split_at(&mut self, offset: u64) {
        let Some(slot) = self.nearest(offset) else {
            return;
        };
        let left = self.node_mut(slot);
        if left.vaddr == offset {
            return;
        }

        let left_size = offset - left.vaddr;
        let right = SeparateHeapMap {
            vaddr: offset,
            paddr: left.paddr + left_size,
            size: left.size - left_size,
            ..*left
        };
        left.size = left_size;
        self.insert(right);
    }
}

/// Host mapping pressure manager
pub struct HeapTracker {
    buffer: Arc<dyn HostMemoryBuffer>,
    config: HeapTrackerConfig,
    rebuild_lock: RwLock<()>,
    state: Mutex<TrackerState>,
}

impl HeapTracker {
    /// Create a tracker over `buffer`
    pub fn new(buffer: Arc<dyn HostMemoryBuffer>, config: HeapTrackerConfig) -> Self {
        log::info!(
            "Heap tracker: at most {} resident separate heap mappings",
            config.max_resident_map_count
        );
        Self {
            buffer,
            config,
            rebuild_lock: RwLock::new(()),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> HeapTrackerConfig {
        self.config
    }

    /// Number of recorded separate heap mappings
    pub fn map_count(&self) -> usize {
        self.state.lock().by_address.len()
    }

    /// Number of separate heap mappings currently mapped on the host
    pub fn resident_map_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Map `length` bytes at `virtual_offset` to backing `host_offset`.
    ///
    /// Separate heap regions are only recorded here.
    pub fn map(
        &self,
        virtual_offset: u64,
        host_offset: u64,
        length: u64,
        perm: MemoryPermission,
        is_separate_heap: bool,
    ) {
        if length == 0 {
            return;
        }
        if !is_separate_heap {
            self.buffer.map(virtual_offset, host_offset, length, perm);
            return;
        }

        let mut state = self.state.lock();
        if state.remove_range(virtual_offset, length) {
            self.buffer.unmap(virtual_offset, length);
        }
        let tick = state.next_tick();
        state.insert(SeparateHeapMap {
            vaddr: virtual_offset,
            paddr: host_offset,
            size: length,
            tick,
            perm,
            is_resident: false,
        });
        log::debug!(
            "Recorded separate heap {:#x}-{:#x} -> {:#x}",
            virtual_offset,
            virtual_offset + length,
            host_offset
        );
    }

    /// Remove every mapping in `[virtual_offset, virtual_offset + size)`
    pub fn unmap(&self, virtual_offset: u64, size: u64, is_separate_heap: bool) {
        if size == 0 {
            return;
        }
        if is_separate_heap {
            self.state.lock().remove_range(virtual_offset, size);
        }
        self.buffer.unmap(virtual_offset, size);
    }

    /// Change the permission of `[virtual_offset, virtual_offset + size)`.
    ///
    /// Non-resident separate heap mappings only remember the permission for
    /// when they are mapped.
    pub fn protect(&self, virtual_offset: u64, size: u64, perm: MemoryPermission) {
        if size == 0 {
            return;
        }
        let _rebuild = self.rebuild_lock.read();

        let end = virtual_offset + size;
        {
            let mut state = self.state.lock();
            state.split_at(virtual_offset);
            state.split_at(end);
        }

        let mut cur = virtual_offset;
        while cur < end {
            let (next, should_protect) = {
                let mut state = self.state.lock();
                let found = state.by_address.range(cur..).next().map(|(&vaddr, &slot)| (vaddr, slot));
                match found {
                    None => (end, true),
                    Some((vaddr, slot)) if vaddr == cur => {
                        let node = state.node_mut(slot);
                        node.perm = perm;
                        (cur + node.size, node.is_resident)
                    }
                    Some((vaddr, _)) => (vaddr, true),
                }
            };

            let next = next.min(end);
            if should_protect {
                self.buffer.protect(cur, next - cur, perm);
            }
            cur = next;
        }
    }

    /// Materialize the recorded separate heap mapping containing
    /// `virtual_offset`. Returns `false` if there is none or it is already
    /// resident.
    pub fn deferred_map_separate_heap(&self, virtual_offset: u64) -> bool {
        let rebuild_required = {
            let mut state = self.state.lock();
            let Some(slot) = state.nearest(virtual_offset) else {
                return false;
            };
            if state.node(slot).is_resident {
                return false;
            }

            let tick = state.next_tick();
            let node = state.node_mut(slot);
            node.tick = tick;
            node.is_resident = true;
            let node = *node;

            self.buffer.map(node.vaddr, node.paddr, node.size, node.perm);
            state.resident.insert((tick, slot));

            log::trace!("Deferred map of separate heap {:#x}-{:#x}", node.vaddr, node.vaddr + node.size);
            state.resident.len() > self.config.max_resident_map_count
        };

        if rebuild_required {
            self.rebuild_separate_heap_address_space();
        }
        true
    }

    /// Host fault entry point. `fault_offset` is relative to the host view.
    pub fn handle_fault(&self, fault_offset: u64) -> bool {
        if fault_offset >= self.buffer.virtual_size() {
            return false;
        }
        self.deferred_map_separate_heap(fault_offset)
    }

    /// Unmap the older half of the resident separate heap mappings
    fn rebuild_separate_heap_address_space(&self) {
        let _rebuild = self.rebuild_lock.write();
        let mut state = self.state.lock();

        let resident_count = state.resident.len();
        let desired_count = resident_count.min(self.config.max_resident_map_count) / 2;
        let evict_count = resident_count - desired_count;

        for _ in 0..evict_count {
            let Some((_, slot)) = state.resident.pop_first() else {
                break;
            };
            let node = state.node_mut(slot);
            node.is_resident = false;
            let (vaddr, size) = (node.vaddr, node.size);
            self.buffer.unmap(vaddr, size);
        }

        log::debug!(
            "Rebuilt separate heap address space: evicted {evict_count}, {} resident",
            state.resident.len()
        );
    }
}

impl core::fmt::Debug for HeapTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapTracker")
            .field("config", &self.config)
            .field("map_count", &self.map_count())
            .field("resident_map_count", &self.resident_map_count())
            .finish()
    }
}
