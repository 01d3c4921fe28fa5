use super::heap::{PageAllocation, ResourceHeap, ResourceHeapPage};
use super::DeviceMemoryManager;
use crate::backend::headless::{HeadlessBackend, HeadlessConfig};
use crate::backend::Backend;
use crate::TempestError;
use ash::vk;
use proptest::prelude::*;

use std::sync::Arc;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

fn init_memory(config: HeadlessConfig) -> (Arc<HeadlessBackend>, Arc<DeviceMemoryManager>) {
    let headless = Arc::new(HeadlessBackend::new(config));
    let backend: Arc<dyn Backend> = headless.clone();
    (headless, Arc::new(DeviceMemoryManager::new(backend)))
}

fn host_type(mem: &DeviceMemoryManager) -> u32 {
    mem.find_memory_type_index(
        u32::MAX,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .unwrap()
}

fn new_page(mem: &DeviceMemoryManager, size: u64) -> ResourceHeapPage {
    ResourceHeapPage::new(mem.alloc(size, host_type(mem)).unwrap())
}

#[test]
fn map_discipline() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let mut alloc = mem.alloc(4 * KB, host_type(&mem)).unwrap();

    assert_eq!(alloc.unmap(), Err(TempestError::MEMORY_NOT_MAPPED));
    let ptr = alloc.map(0, 4 * KB).unwrap();
    assert!(!ptr.is_null());
    assert_eq!(
        alloc.map(0, 4 * KB),
        Err(TempestError::MEMORY_ALREADY_MAPPED)
    );
    alloc.unmap().unwrap();

    // Mapping again after unmapping is fine
    alloc.map(0, vk::WHOLE_SIZE).unwrap();
    mem.free(alloc);
    assert_eq!(mem.num_allocations(), 0);
}

#[test]
fn freeing_mapped_memory_unmaps_it() {
    let (headless, mem) = init_memory(HeadlessConfig::default());
    let mut alloc = mem.alloc(4 * KB, host_type(&mem)).unwrap();
    alloc.map(0, vk::WHOLE_SIZE).unwrap();
    assert!(alloc.is_mapped());

    mem.free(alloc);
    assert_eq!(mem.num_allocations(), 0);
    assert_eq!(headless.num_live_memory_allocations(), 0);
    assert_eq!(mem.dump_memory().heap_usage.iter().sum::<u64>(), 0);
}

#[test]
fn device_local_is_not_mappable() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let ty = mem
        .find_memory_type_index(u32::MAX, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let mut alloc = mem.alloc(4 * KB, ty).unwrap();

    assert!(!alloc.can_be_mapped());
    assert_eq!(
        alloc.map(0, 4 * KB),
        Err(TempestError::MEMORY_NOT_HOST_VISIBLE)
    );
    mem.free(alloc);
}

#[test]
fn driver_failure_is_out_of_memory() {
    let (_h, mem) = init_memory(HeadlessConfig {
        max_memory_allocation_count: 2,
        ..Default::default()
    });
    let ty = host_type(&mem);

    let a = mem.alloc(KB, ty).unwrap();
    let b = mem.alloc(KB, ty).unwrap();
    assert_eq!(mem.alloc(KB, ty).err(), Some(TempestError::OUT_OF_MEMORY));
    assert_eq!(mem.num_allocations(), 2);

    mem.free(a);
    let c = mem.alloc(KB, ty).unwrap();
    mem.free(b);
    mem.free(c);
    assert_eq!(mem.dump_memory().peak_num_allocations, 2);
}

#[test]
fn device_lost_passes_through() {
    let (headless, mem) = init_memory(HeadlessConfig::default());
    headless.set_device_lost(true);
    assert_eq!(
        mem.alloc(KB, host_type(&mem)).err(),
        Some(TempestError::DEVICE_LOST)
    );
}

#[test]
fn first_fit_reuses_freed_range() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let mut page = new_page(&mem, MB);

    let big = page.try_allocate(64 * KB, 256).unwrap();
    assert_eq!(big.aligned_offset, 0);
    assert!(page.release_allocation(big.range));

    let small = page.try_allocate(32 * KB, 256).unwrap();
    assert_eq!(small.aligned_offset, big.aligned_offset);
    assert_eq!(page.num_allocations(), 1);
}

#[test]
fn release_within_page_is_reused() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let mut page = new_page(&mem, MB);

    let a = page.try_allocate(4 * KB, 16).unwrap();
    let b = page.try_allocate(4 * KB, 16).unwrap();
    let _c = page.try_allocate(4 * KB, 16).unwrap();

    // Freeing the middle range leaves a hole the same size request fits
    assert!(!page.release_allocation(b.range));
    let d = page.try_allocate(4 * KB, 16).unwrap();
    assert_eq!(d.aligned_offset, b.aligned_offset);
    assert_ne!(d.aligned_offset, a.aligned_offset);
}

#[test]
fn alignment_padding_is_charged_to_the_allocation() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let mut page = new_page(&mem, MB);

    let a = page.try_allocate(10, 1).unwrap();
    let b = page.try_allocate(100, 256).unwrap();
    assert_eq!(b.aligned_offset, 256);
    assert_eq!(b.range.offset, 10);
    assert_eq!(b.range.size, 246 + 100);

    assert_eq!(page.used_size() + page.free_size(), page.max_size());
    page.release_allocation(a.range);
    assert!(page.release_allocation(b.range));
    assert!(page.is_fully_free());
}

#[test]
fn page_too_small_fails() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let mut page = new_page(&mem, 4 * KB);

    assert!(page.try_allocate(4 * KB + 1, 1).is_none());
    assert!(page.try_allocate(0, 1).is_none());
    assert!(page.try_allocate(4 * KB, 1).is_some());
    assert!(page.try_allocate(1, 1).is_none());
}

#[test]
fn heap_recycles_vacated_pages() {
    let (headless, mem) = init_memory(HeadlessConfig::default());
    let heap = ResourceHeap::new("test", mem.clone(), host_type(&mem), MB, true, 3);

    let a = heap.allocate_resource(64 * KB, 256).unwrap();
    let b = heap.allocate_resource(64 * KB, 256).unwrap();
    assert_eq!(a.page(), b.page());
    assert_eq!(heap.num_used_pages(), 1);

    drop(a);
    drop(b);
    assert_eq!(heap.num_used_pages(), 0);
    assert_eq!(heap.num_free_pages(), 1);
    assert_eq!(headless.num_live_memory_allocations(), 1);

    // A vacated page is reused before a new one is made
    let c = heap.allocate_resource(KB, 256).unwrap();
    assert_eq!(heap.num_used_pages(), 1);
    assert_eq!(heap.num_free_pages(), 0);
    assert_eq!(mem.num_allocations(), 1);
    drop(c);

    // Held for the page lifetime before the device memory is freed
    assert!(!heap.release_freed_pages(1));
    assert!(!heap.release_freed_pages(2));
    assert!(heap.release_freed_pages(3));
    assert_eq!(heap.num_free_pages(), 0);
    assert_eq!(mem.num_allocations(), 0);
}

#[test]
fn oversize_requests_get_dedicated_pages() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let heap = ResourceHeap::new("test", mem.clone(), host_type(&mem), MB, true, 30);

    let small = heap.allocate_resource(KB, 16).unwrap();
    let big = heap.allocate_resource(MB, 16).unwrap();
    assert_ne!(small.page(), big.page());
    assert_eq!(
        heap.with_page(big.page(), |p| p.max_size()).unwrap(),
        MB
    );

    let bigger = heap.allocate_resource(3 * MB, 16).unwrap();
    assert_eq!(
        heap.with_page(bigger.page(), |p| p.max_size()).unwrap(),
        3 * MB
    );
    assert_eq!(heap.num_used_pages(), 3);
}

#[test]
fn mapped_allocations_are_writable() {
    let (_h, mem) = init_memory(HeadlessConfig::default());
    let heap = ResourceHeap::new("test", mem.clone(), host_type(&mem), MB, true, 30);

    let a = heap.allocate_resource(16, 16).unwrap();
    let b = heap.allocate_resource(16, 16).unwrap();
    a.write_bytes(0, &[7; 16]).unwrap();
    b.write_bytes(0, &[9; 16]).unwrap();

    let mut out = [0u8; 16];
    a.read_bytes(0, &mut out).unwrap();
    assert_eq!(out, [7; 16]);
    assert_eq!(
        a.write_bytes(8, &[0; 16]),
        Err(TempestError::INVALID_SIZE)
    );
    a.flush().unwrap();
}

#[derive(Debug, Clone)]
enum PageOp {
    Alloc { size: u64, align_pow: u32 },
    Release(usize),
    Join,
}

fn page_op() -> impl Strategy<Value = PageOp> {
    prop_oneof![
        (1u64..32 * 1024, 0u32..9).prop_map(|(size, align_pow)| PageOp::Alloc { size, align_pow }),
        any::<usize>().prop_map(PageOp::Release),
        Just(PageOp::Join),
    ]
}

proptest! {
    #[test]
    fn device_memory_count_tracks_alloc_and_free(ops in prop::collection::vec(any::<(bool, usize)>(), 1..64)) {
        let (headless, mem) = init_memory(HeadlessConfig::default());
        let ty = host_type(&mem);
        let mut live = Vec::new();
        let mut allocs = 0u32;
        let mut frees = 0u32;

        for (is_alloc, idx) in ops {
            if is_alloc || live.is_empty() {
                live.push(mem.alloc(256, ty).unwrap());
                allocs += 1;
            } else {
                mem.free(live.swap_remove(idx % live.len()));
                frees += 1;
            }
            prop_assert_eq!(mem.num_allocations(), allocs - frees);
            prop_assert_eq!(headless.num_live_memory_allocations() as u32, allocs - frees);
        }
    }

    #[test]
    fn page_accounting_holds(ops in prop::collection::vec(page_op(), 1..128)) {
        let (_h, mem) = init_memory(HeadlessConfig::default());
        let mut page = new_page(&mem, 256 * 1024);
        let mut live: Vec<PageAllocation> = Vec::new();

        for op in ops {
            match op {
                PageOp::Alloc { size, align_pow } => {
                    if let Some(a) = page.try_allocate(size, 1 << align_pow) {
                        prop_assert_eq!(a.aligned_offset % (1 << align_pow), 0);
                        prop_assert!(a.aligned_offset + size <= a.range.offset + a.range.size);
                        live.push(a);
                    }
                }
                PageOp::Release(idx) => {
                    if !live.is_empty() {
                        let a = live.swap_remove(idx % live.len());
                        page.release_allocation(a.range);
                    }
                }
                PageOp::Join => page.join_free_blocks(),
            }

            let live_bytes: u64 = live.iter().map(|a| a.range.size).sum();
            prop_assert_eq!(page.free_size() + live_bytes, page.max_size());
            prop_assert_eq!(page.used_size(), live_bytes);
            prop_assert_eq!(page.num_allocations() as usize, live.len());
        }

        for a in live.drain(..) {
            page.release_allocation(a.range);
        }
        prop_assert!(page.is_fully_free());
    }

    #[test]
    fn joining_is_idempotent(sizes in prop::collection::vec(1u64..4096, 1..32), keep in any::<u64>()) {
        let (_h, mem) = init_memory(HeadlessConfig::default());
        let mut page = new_page(&mem, 256 * 1024);
        let allocs: Vec<_> = sizes
            .iter()
            .filter_map(|s| page.try_allocate(*s, 16))
            .collect();

        // Release a pseudo random subset to fragment the free list
        for (i, a) in allocs.iter().enumerate() {
            if (keep >> (i % 64)) & 1 == 0 {
                page.release_allocation(a.range);
            }
        }

        page.join_free_blocks();
        let once = page.free_list().to_vec();
        page.join_free_blocks();
        prop_assert_eq!(page.free_list(), once.as_slice());

        // No two entries are left adjacent
        for pair in once.windows(2) {
            prop_assert!(pair[0].offset + pair[0].size < pair[1].offset);
        }
    }
}
