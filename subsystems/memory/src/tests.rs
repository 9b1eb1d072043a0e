//! Cross-module scenarios

use std::sync::{Arc, Weak};

use guestmem_hal::{DeviceAddr, HostMemory, MemoryPermission, PhysAddr, VirtAddr, DRAM_BASE, PAGE_SIZE};

use crate::device::{DeviceAddressTranslator, DeviceTranslatorConfig, ProcessMemory};
use crate::host::heap_tracker::MAP_COUNT_MARGIN;
use crate::physical::layout::{PoolLayout, PoolRegion};
use crate::physical::BlockInfoManager;
use crate::*;

const DRAM_PAGES: u64 = 64;

fn dram(page: u64) -> PhysAddr {
    PhysAddr::new(DRAM_BASE + page * PAGE_SIZE)
}

fn translator(view: u64) -> Arc<DeviceAddressTranslator> {
    let host = Arc::new(HostMemory::new(DRAM_PAGES * PAGE_SIZE, view).unwrap());
    let config = DeviceTranslatorConfig { device_virtual_bits: 24, max_processes: 4 };
    Arc::new(DeviceAddressTranslator::new(config, host).unwrap())
}

fn process(translator: &Arc<DeviceAddressTranslator>, config: CpuMemoryConfig) -> Arc<CpuMemory> {
    let heap = HeapTrackerConfig::from_max_map_count(MAP_COUNT_MARGIN + 2);
    Arc::new(CpuMemory::new(config, translator.clone(), heap).unwrap())
}

fn register(translator: &DeviceAddressTranslator, memory: &Arc<CpuMemory>) -> Asid {
    let weak: Weak<dyn ProcessMemory> = Arc::downgrade(memory) as Weak<dyn ProcessMemory>;
    translator.register_process(weak).unwrap()
}

#[test]
fn test_partial_close_returns_pages() {
    let layout =
        PoolLayout::new(vec![PoolRegion::new(dram(0), DRAM_PAGES * PAGE_SIZE, Pool::System)]).unwrap();
    let host = Arc::new(HostMemory::new(DRAM_PAGES * PAGE_SIZE, 0).unwrap());
    let pool = Arc::new(PhysicalPagePool::new(&layout, host).unwrap());
    let mut group = PageGroup::new(pool.clone(), Arc::new(BlockInfoManager::new(64)));

    let option = AllocationOption::new(Pool::System, Direction::FromFront);
    pool.allocate_and_open(&mut group, 16, option).unwrap();
    assert_eq!(group.num_pages(), 16);
    let free_after_open = pool.free_size();
    assert_eq!(free_after_open, (DRAM_PAGES - 16) * PAGE_SIZE);

    // Close the first 8 pages of the group, keep the rest.
    let mut pages = Vec::new();
    for block in group.blocks() {
        for index in 0..block.num_pages() {
            pages.push(block.address().add(index * PAGE_SIZE));
        }
    }
    let (closed, kept) = pages.split_at(8);
    for &page in closed {
        pool.close(page, 1);
    }

    assert_eq!(pool.free_size(), free_after_open + 8 * PAGE_SIZE);
    assert!(closed.iter().all(|&page| pool.ref_count(page) == Some(0)));
    assert!(kept.iter().all(|&page| pool.ref_count(page) == Some(1)));

    for &page in kept {
        pool.close(page, 1);
    }
    group.finalize();
    assert_eq!(pool.free_size(), DRAM_PAGES * PAGE_SIZE);
}

#[test]
fn test_shared_page_seen_from_both_processes_and_device() {
    let translator = translator(0);
    let config = CpuMemoryConfig { address_space_bits: 28, fastmem: false, cpu_cores: 1 };
    let first = process(&translator, config);
    let second = process(&translator, config);
    let rw = MemoryPermission::READ_WRITE;
    first.map_memory_region(VirtAddr::new(0x10000), PAGE_SIZE, dram(5), rw, false).unwrap();
    second.map_memory_region(VirtAddr::new(0x40000), PAGE_SIZE, dram(5), rw, false).unwrap();

    let first_asid = register(&translator, &first);
    let second_asid = register(&translator, &second);
    let first_device = translator.allocate(PAGE_SIZE).unwrap();
    let second_device = translator.allocate(PAGE_SIZE).unwrap();
    translator.map(first_device, VirtAddr::new(0x10000), PAGE_SIZE, first_asid, true);
    translator.map(second_device, VirtAddr::new(0x40000), PAGE_SIZE, second_asid, true);

    let mut aliases = Vec::new();
    translator.apply_op_on_paddr(dram(5).add(0x10), |address| aliases.push(address));
    aliases.sort_unstable();
    assert_eq!(aliases, [first_device.add(0x10), second_device.add(0x10)]);

    first.write::<u32>(VirtAddr::new(0x10010), 0xC0FF_EE00);
    assert_eq!(second.read::<u32>(VirtAddr::new(0x40010)), 0xC0FF_EE00);
    assert_eq!(translator.read::<u32>(first_device.add(0x10)), 0xC0FF_EE00);
    assert_eq!(translator.read::<u32>(second_device.add(0x10)), 0xC0FF_EE00);

    // Caching one alias only affects the process that owns it.
    translator.update_pages_cached_count(first_device, PAGE_SIZE, 1);
    assert_eq!(first.page_type(VirtAddr::new(0x10000)), PageType::RasterizerCachedMemory);
    assert_eq!(second.page_type(VirtAddr::new(0x40000)), PageType::Memory);
    translator.update_pages_cached_count(first_device, PAGE_SIZE, -1);
    assert_eq!(first.page_type(VirtAddr::new(0x10000)), PageType::Memory);

    translator.unmap(first_device, PAGE_SIZE);
    let mut remaining: Vec<DeviceAddr> = Vec::new();
    translator.apply_op_on_paddr(dram(5), |address| remaining.push(address));
    assert_eq!(remaining, [second_device]);
    assert_eq!(translator.physical_address(second_device), Some(dram(5)));
}

#[test]
fn test_separate_heap_residency_stays_bounded() {
    let translator = translator(1 << 28);
    let config = CpuMemoryConfig { address_space_bits: 28, fastmem: true, cpu_cores: 1 };
    let memory = process(&translator, config);
    let host = translator.host().clone();
    let rw = MemoryPermission::READ_WRITE;

    let heaps: Vec<u64> = (0..6).map(|index| 0x100000 + index * 0x10000).collect();
    for (index, &vaddr) in heaps.iter().enumerate() {
        memory.map_memory_region(VirtAddr::new(vaddr), PAGE_SIZE, dram(index as u64), rw, true).unwrap();
    }

    let tracker = memory.heap_tracker().unwrap();
    for &vaddr in &heaps {
        assert!(memory.handle_host_fault(vaddr));
        assert!(tracker.resident_map_count() <= 2);
        assert!(host.resolve(vaddr, MemoryPermission::READ).is_some());
    }
    assert_eq!(tracker.map_count(), heaps.len());

    // An evicted heap comes back on its next fault.
    let evicted = heaps.iter().copied().find(|&vaddr| host.resolve(vaddr, MemoryPermission::READ).is_none());
    let evicted = evicted.unwrap();
    assert!(memory.invalidate_nce(VirtAddr::new(evicted), 8));
    assert!(host.resolve(evicted, MemoryPermission::READ).is_some());

    // Guest accesses never depend on residency.
    memory.write::<u64>(VirtAddr::new(heaps[0]), 42);
    assert_eq!(memory.read::<u64>(VirtAddr::new(heaps[0])), 42);
}
