// Resource heaps
//
// A ResourceHeap carves big DeviceMemoryAllocations ("pages") into
// small ResourceAllocations with a first fit free list. Pages live in an
// arena owned by the heap and are referred to by PageId. Allocations
// hold a reference to the heap and give their range back on drop.
//
// Vacated pages are not freed right away. They sit in the heap's free
// pool so the next burst of allocations can reuse them, and are only
// returned to the device after staying unused for a number of frames.
use super::{DeviceMemoryAllocation, DeviceMemoryManager};
use crate::backend::Backend;
use crate::{align_up, lock, CreateInfo, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::sync::{Arc, Mutex};

/// A free or used byte range inside a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub size: u64,
}

/// Where a `try_allocate` landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageAllocation {
    /// Start of the range taken from the free list, including padding
    pub range: Range,
    /// The aligned offset handed to the user
    pub aligned_offset: u64,
}

/// `len` bytes at `offset` fit inside `size`
fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(TempestError::INVALID_SIZE)?;
    if end > size {
        return Err(TempestError::INVALID_SIZE);
    }
    Ok(())
}

/// One device allocation treated as a sub-allocatable arena
pub struct ResourceHeapPage {
    rp_memory: DeviceMemoryAllocation,
    rp_max_size: u64,
    /// Sorted by offset. Adjacent entries are merged on release.
    rp_free_list: Vec<Range>,
    rp_used_size: u64,
    rp_num_allocations: u32,
    /// Frame this page was last vacated in
    rp_frame_freed: u64,
}

impl ResourceHeapPage {
    pub fn new(memory: DeviceMemoryAllocation) -> Self {
        let size = memory.size();
        Self {
            rp_memory: memory,
            rp_max_size: size,
            rp_free_list: vec![Range {
                offset: 0,
                size: size,
            }],
            rp_used_size: 0,
            rp_num_allocations: 0,
            rp_frame_freed: 0,
        }
    }

    pub fn memory(&self) -> &DeviceMemoryAllocation {
        &self.rp_memory
    }

    pub fn max_size(&self) -> u64 {
        self.rp_max_size
    }

    pub fn used_size(&self) -> u64 {
        self.rp_used_size
    }

    pub fn free_size(&self) -> u64 {
        self.rp_free_list.iter().map(|r| r.size).sum()
    }

    pub fn num_allocations(&self) -> u32 {
        self.rp_num_allocations
    }

    pub fn free_list(&self) -> &[Range] {
        self.rp_free_list.as_slice()
    }

    /// The free list spans the whole page and nothing is allocated
    pub fn is_fully_free(&self) -> bool {
        self.rp_num_allocations == 0
            && self.rp_free_list.len() == 1
            && self.rp_free_list[0].offset == 0
            && self.rp_free_list[0].size == self.rp_max_size
    }

    /// First fit allocation
    ///
    /// The candidate offset of each free entry is aligned up. The padding
    /// this introduces is charged to the allocation so it is returned
    /// along with it.
    pub(crate) fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<PageAllocation> {
        if size == 0 {
            return None;
        }

        for i in 0..self.rp_free_list.len() {
            let entry = self.rp_free_list[i];
            let aligned = align_up(entry.offset, alignment);
            let padding = aligned - entry.offset;
            let alloc_size = padding + size;

            if alloc_size > entry.size {
                continue;
            }

            if alloc_size == entry.size {
                self.rp_free_list.remove(i);
            } else {
                let e = &mut self.rp_free_list[i];
                e.offset += alloc_size;
                e.size -= alloc_size;
            }

            self.rp_used_size += alloc_size;
            self.rp_num_allocations += 1;
            return Some(PageAllocation {
                range: Range {
                    offset: entry.offset,
                    size: alloc_size,
                },
                aligned_offset: aligned,
            });
        }

        None
    }

    /// Give a range back to the free list and coalesce
    ///
    /// Returns true if the page is now completely free.
    pub(crate) fn release_allocation(&mut self, range: Range) -> bool {
        let pos = self
            .rp_free_list
            .iter()
            .position(|r| r.offset > range.offset)
            .unwrap_or(self.rp_free_list.len());
        self.rp_free_list.insert(pos, range);

        self.rp_used_size -= range.size;
        self.rp_num_allocations -= 1;
        self.join_free_blocks();

        self.is_fully_free()
    }

    /// Merge adjacent free entries
    ///
    /// Running this on an already merged list changes nothing.
    pub fn join_free_blocks(&mut self) {
        self.rp_free_list.sort_by_key(|r| r.offset);

        let mut joined: Vec<Range> = Vec::with_capacity(self.rp_free_list.len());
        for r in self.rp_free_list.drain(..) {
            match joined.last_mut() {
                Some(last) if last.offset + last.size == r.offset => last.size += r.size,
                _ => joined.push(r),
            }
        }
        self.rp_free_list = joined;
    }
}

/// Index of a page inside its heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(usize);

/// Per heap statistics for diagnostics
#[derive(Debug, Clone, Default)]
pub struct HeapReport {
    pub name: &'static str,
    pub memory_type_index: u32,
    pub page_size: u64,
    pub used_pages: usize,
    pub free_pages: usize,
    pub peak_pages: usize,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub num_allocations: u32,
}

struct ResourceHeapInner {
    rh_name: &'static str,
    rh_memory: Arc<DeviceMemoryManager>,
    rh_memory_type_index: u32,
    rh_page_size: u64,
    rh_persistently_mapped: bool,
    rh_page_lifetime_frames: u64,
    /// Arena of pages, empty slots are reused
    rh_pages: Vec<Option<ResourceHeapPage>>,
    rh_used_pages: Vec<PageId>,
    rh_free_pages: Vec<PageId>,
    rh_peak_pages: usize,
    /// Latest frame we were told about
    rh_frame: u64,
}

impl ResourceHeapInner {
    fn page_mut(&mut self, id: PageId) -> Result<&mut ResourceHeapPage> {
        self.rh_pages
            .get_mut(id.0)
            .and_then(|p| p.as_mut())
            .ok_or(TempestError::UNKNOWN_RESOURCE)
    }

    fn allocate_from(
        &mut self,
        id: PageId,
        size: u64,
        alignment: u64,
    ) -> Option<(PageAllocation, vk::DeviceMemory, Option<*mut u8>)> {
        let page = self.rh_pages.get_mut(id.0)?.as_mut()?;
        let alloc = page.try_allocate(size, alignment)?;
        let mapped = page.memory().mapped_ptr(alloc.aligned_offset);
        Some((alloc, page.memory().handle(), mapped))
    }

    fn add_page(&mut self, size: u64) -> Result<PageId> {
        let mut memory = self.rh_memory.alloc(size, self.rh_memory_type_index)?;
        if self.rh_persistently_mapped {
            if let Err(e) = memory.map(0, size) {
                self.rh_memory.free(memory);
                return Err(e);
            }
        }
        let page = ResourceHeapPage::new(memory);

        let slot = match self.rh_pages.iter().position(|p| p.is_none()) {
            Some(i) => {
                self.rh_pages[i] = Some(page);
                i
            }
            None => {
                self.rh_pages.push(Some(page));
                self.rh_pages.len() - 1
            }
        };

        let live = self.rh_pages.iter().filter(|p| p.is_some()).count();
        self.rh_peak_pages = self.rh_peak_pages.max(live);
        log::debug!(
            "{} heap: created page #{} of {} bytes ({} live)",
            self.rh_name,
            slot,
            size,
            live
        );

        Ok(PageId(slot))
    }

    fn release_allocation(&mut self, id: PageId, range: Range) {
        let frame = self.rh_frame;
        let name = self.rh_name;
        let now_free = match self.page_mut(id) {
            Ok(page) => {
                let free = page.release_allocation(range);
                if free {
                    page.rp_frame_freed = frame;
                }
                free
            }
            Err(_) => {
                log::error!("{} heap: released into unknown page {:?}", name, id);
                return;
            }
        };

        if now_free {
            if let Some(pos) = self.rh_used_pages.iter().position(|p| *p == id) {
                self.rh_used_pages.remove(pos);
                self.rh_free_pages.push(id);
            }
        }
    }

    fn free_page(&mut self, id: PageId) {
        if let Some(page) = self.rh_pages.get_mut(id.0).and_then(|p| p.take()) {
            log::debug!(
                "{} heap: returning page #{} ({} bytes) to the device",
                self.rh_name,
                id.0,
                page.max_size()
            );
            self.rh_memory.free(page.rp_memory);
        }
    }
}

impl Drop for ResourceHeapInner {
    fn drop(&mut self) {
        for slot in 0..self.rh_pages.len() {
            self.free_page(PageId(slot));
        }
    }
}

/// A reference counted sub-range of a heap page
///
/// Dropping the last reference returns the range to its page.
pub struct ResourceAllocation {
    ra_heap: Arc<Mutex<ResourceHeapInner>>,
    ra_page: PageId,
    /// What was taken from the free list, including alignment padding
    ra_range: Range,
    ra_offset: u64,
    ra_size: u64,
    ra_memory: vk::DeviceMemory,
    ra_mapped_ptr: Option<*mut u8>,
}

// The mapped pointer is into a persistently mapped page that cannot be
// freed while this allocation holds a range in it.
unsafe impl Send for ResourceAllocation {}
unsafe impl Sync for ResourceAllocation {}

impl ResourceAllocation {
    pub fn page(&self) -> PageId {
        self.ra_page
    }

    /// Aligned offset into the page's device memory
    pub fn offset(&self) -> u64 {
        self.ra_offset
    }

    /// Requested size
    pub fn size(&self) -> u64 {
        self.ra_size
    }

    /// Size taken from the page, including alignment padding
    pub fn allocated_size(&self) -> u64 {
        self.ra_range.size
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.ra_memory
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.ra_mapped_ptr
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<*mut u8> {
        let ptr = self
            .ra_mapped_ptr
            .ok_or(TempestError::MEMORY_NOT_HOST_VISIBLE)?;
        check_range(offset, len, self.ra_size)?;
        Ok(ptr)
    }

    /// Copy `data` into the mapping at `offset` bytes into this allocation
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.check_bounds(offset, data.len())?;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(ptr.add(offset as usize), data.len());
            dst.copy_from_slice(data);
        }
        Ok(())
    }

    /// Copy out of the mapping at `offset` bytes into this allocation
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.check_bounds(offset, out.len())?;
        unsafe {
            let src = std::slice::from_raw_parts(ptr.add(offset as usize), out.len());
            out.copy_from_slice(src);
        }
        Ok(())
    }

    fn with_page<T>(&self, f: impl FnOnce(&ResourceHeapPage) -> Result<T>) -> Result<T> {
        let mut heap = lock(&self.ra_heap);
        let page = heap.page_mut(self.ra_page)?;
        f(page)
    }

    pub fn flush(&self) -> Result<()> {
        self.with_page(|page| {
            page.memory()
                .flush_mapped_range(self.ra_range.offset, self.ra_range.size)
        })
    }

    pub fn invalidate(&self) -> Result<()> {
        self.with_page(|page| {
            page.memory()
                .invalidate_mapped_range(self.ra_range.offset, self.ra_range.size)
        })
    }
}

impl Drop for ResourceAllocation {
    fn drop(&mut self) {
        lock(&self.ra_heap).release_allocation(self.ra_page, self.ra_range);
    }
}

/// A page allocator for one memory type
#[derive(Clone)]
pub struct ResourceHeap {
    rh_inner: Arc<Mutex<ResourceHeapInner>>,
}

impl ResourceHeap {
    pub fn new(
        name: &'static str,
        memory: Arc<DeviceMemoryManager>,
        memory_type_index: u32,
        page_size: u64,
        persistently_mapped: bool,
        page_lifetime_frames: u64,
    ) -> Self {
        Self {
            rh_inner: Arc::new(Mutex::new(ResourceHeapInner {
                rh_name: name,
                rh_memory: memory,
                rh_memory_type_index: memory_type_index,
                rh_page_size: page_size,
                rh_persistently_mapped: persistently_mapped,
                rh_page_lifetime_frames: page_lifetime_frames,
                rh_pages: Vec::new(),
                rh_used_pages: Vec::new(),
                rh_free_pages: Vec::new(),
                rh_peak_pages: 0,
                rh_frame: 0,
            })),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        lock(&self.rh_inner).rh_memory_type_index
    }

    pub fn page_size(&self) -> u64 {
        lock(&self.rh_inner).rh_page_size
    }

    /// Sub-allocate `size` bytes aligned to `alignment`
    ///
    /// Used pages are searched first, then vacated pages, and only then
    /// is a new page of `max(size, page_size)` bytes created. Requests of
    /// at least a page always get a dedicated page.
    pub fn allocate_resource(&self, size: u64, alignment: u64) -> Result<Arc<ResourceAllocation>> {
        if size == 0 {
            return Err(TempestError::INVALID_SIZE);
        }

        let mut inner = lock(&self.rh_inner);
        let dedicated = size >= inner.rh_page_size;
        let mut found = None;

        if !dedicated {
            for i in 0..inner.rh_used_pages.len() {
                let id = inner.rh_used_pages[i];
                if let Some(res) = inner.allocate_from(id, size, alignment) {
                    found = Some((id, res));
                    break;
                }
            }
        }

        if found.is_none() && !dedicated {
            for i in 0..inner.rh_free_pages.len() {
                let id = inner.rh_free_pages[i];
                if let Some(res) = inner.allocate_from(id, size, alignment) {
                    inner.rh_free_pages.remove(i);
                    inner.rh_used_pages.push(id);
                    found = Some((id, res));
                    break;
                }
            }
        }

        let (id, (alloc, memory, mapped)) = match found {
            Some(f) => f,
            None => {
                let page_size = match dedicated {
                    true => size,
                    false => inner.rh_page_size,
                };
                let id = inner.add_page(page_size)?;
                inner.rh_used_pages.push(id);
                let res = inner
                    .allocate_from(id, size, alignment)
                    .ok_or(TempestError::OUT_OF_MEMORY)?;
                (id, res)
            }
        };

        Ok(Arc::new(ResourceAllocation {
            ra_heap: self.rh_inner.clone(),
            ra_page: id,
            ra_range: alloc.range,
            ra_offset: alloc.aligned_offset,
            ra_size: size,
            ra_memory: memory,
            ra_mapped_ptr: mapped,
        }))
    }

    /// Return at most one long-vacated page to the device
    ///
    /// A page qualifies once it has been free for the heap's page
    /// lifetime. Returns true if a page was released.
    pub fn release_freed_pages(&self, frame: u64) -> bool {
        let mut inner = lock(&self.rh_inner);
        inner.rh_frame = frame;
        let lifetime = inner.rh_page_lifetime_frames;

        let pos = inner.rh_free_pages.iter().position(|id| {
            inner.rh_pages[id.0]
                .as_ref()
                .map(|p| p.rp_frame_freed + lifetime <= frame)
                .unwrap_or(false)
        });

        match pos {
            Some(i) => {
                let id = inner.rh_free_pages.remove(i);
                inner.free_page(id);
                true
            }
            None => false,
        }
    }

    /// Inspect a page. Mostly for tests and diagnostics.
    pub fn with_page<T>(&self, id: PageId, f: impl FnOnce(&ResourceHeapPage) -> T) -> Result<T> {
        let mut inner = lock(&self.rh_inner);
        Ok(f(inner.page_mut(id)?))
    }

    pub fn num_used_pages(&self) -> usize {
        lock(&self.rh_inner).rh_used_pages.len()
    }

    pub fn num_free_pages(&self) -> usize {
        lock(&self.rh_inner).rh_free_pages.len()
    }

    pub fn dump_memory(&self) -> HeapReport {
        let inner = lock(&self.rh_inner);
        let pages = inner.rh_pages.iter().filter_map(|p| p.as_ref());

        let mut report = HeapReport {
            name: inner.rh_name,
            memory_type_index: inner.rh_memory_type_index,
            page_size: inner.rh_page_size,
            used_pages: inner.rh_used_pages.len(),
            free_pages: inner.rh_free_pages.len(),
            peak_pages: inner.rh_peak_pages,
            ..Default::default()
        };
        for page in pages {
            report.total_bytes += page.max_size();
            report.used_bytes += page.used_size();
            report.num_allocations += page.num_allocations();
        }
        report
    }
}

/// A device buffer bound to a range of a heap page
///
/// Dropping this destroys the buffer and then releases the range.
pub struct BufferSuballocation {
    bs_backend: Arc<dyn Backend>,
    bs_buffer: vk::Buffer,
    bs_size: u64,
    bs_usage: vk::BufferUsageFlags,
    bs_allocation: Arc<ResourceAllocation>,
}

impl BufferSuballocation {
    pub fn buffer(&self) -> vk::Buffer {
        self.bs_buffer
    }

    pub fn size(&self) -> u64 {
        self.bs_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.bs_usage
    }

    pub fn allocation(&self) -> &Arc<ResourceAllocation> {
        &self.bs_allocation
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.bs_allocation.mapped_ptr()
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.bs_size)?;
        self.bs_allocation.write_bytes(offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        check_range(offset, out.len(), self.bs_size)?;
        self.bs_allocation.read_bytes(offset, out)
    }
}

impl Drop for BufferSuballocation {
    fn drop(&mut self) {
        self.bs_backend.destroy_buffer(self.bs_buffer);
    }
}

/// The two heaps everything is sub-allocated from
///
/// One for device local memory that is never mapped, and one for host
/// visible staging memory that is mapped as soon as a page is created.
pub struct ResourceHeapManager {
    hm_backend: Arc<dyn Backend>,
    hm_memory: Arc<DeviceMemoryManager>,
    hm_gpu_heap: ResourceHeap,
    hm_upload_heap: ResourceHeap,
}

impl ResourceHeapManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        memory: Arc<DeviceMemoryManager>,
        info: &CreateInfo,
    ) -> Result<Self> {
        let all_types = u32::MAX;
        let gpu_type =
            memory.find_memory_type_index(all_types, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let upload_type = memory.find_memory_type_index(
            all_types,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        log::debug!(
            "Heap memory types: gpu {} ({:?}), upload {} ({:?})",
            gpu_type,
            memory.memory_type_flags(gpu_type),
            upload_type,
            memory.memory_type_flags(upload_type)
        );

        Ok(Self {
            hm_backend: backend,
            hm_gpu_heap: ResourceHeap::new(
                "gpu",
                memory.clone(),
                gpu_type,
                info.gpu_page_size,
                false,
                info.page_lifetime_frames,
            ),
            hm_upload_heap: ResourceHeap::new(
                "upload",
                memory.clone(),
                upload_type,
                info.upload_page_size,
                true,
                info.page_lifetime_frames,
            ),
            hm_memory: memory,
        })
    }

    pub fn gpu_heap(&self) -> &ResourceHeap {
        &self.hm_gpu_heap
    }

    pub fn upload_heap(&self) -> &ResourceHeap {
        &self.hm_upload_heap
    }

    pub fn memory_manager(&self) -> &Arc<DeviceMemoryManager> {
        &self.hm_memory
    }

    fn heap_for(&self, persistently_mapped: bool) -> &ResourceHeap {
        match persistently_mapped {
            true => &self.hm_upload_heap,
            false => &self.hm_gpu_heap,
        }
    }

    /// Sub-allocate from the staging heap if `persistently_mapped`,
    /// otherwise from the device local heap
    pub fn allocate_resource(
        &self,
        size: u64,
        alignment: u64,
        persistently_mapped: bool,
    ) -> Result<Arc<ResourceAllocation>> {
        self.heap_for(persistently_mapped)
            .allocate_resource(size, alignment)
    }

    /// Allocate memory for `reqs`, checking it is compatible with the heap
    pub(crate) fn allocate_for_requirements(
        &self,
        reqs: &vk::MemoryRequirements,
        persistently_mapped: bool,
    ) -> Result<Arc<ResourceAllocation>> {
        let heap = self.heap_for(persistently_mapped);
        if (reqs.memory_type_bits >> heap.memory_type_index()) & 1 == 0 {
            return Err(TempestError::NO_MATCHING_MEMORY_TYPE);
        }
        heap.allocate_resource(reqs.size, reqs.alignment)
    }

    /// Create a buffer and bind it to a freshly sub-allocated range
    pub fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        persistently_mapped: bool,
    ) -> Result<BufferSuballocation> {
        let buffer = self.hm_backend.create_buffer(size, usage)?;
        let reqs = self.hm_backend.buffer_memory_requirements(buffer);

        let bound = self
            .allocate_for_requirements(&reqs, persistently_mapped)
            .and_then(|alloc| {
                self.hm_backend
                    .bind_buffer_memory(buffer, alloc.memory(), alloc.offset())?;
                Ok(alloc)
            });

        match bound {
            Ok(alloc) => Ok(BufferSuballocation {
                bs_backend: self.hm_backend.clone(),
                bs_buffer: buffer,
                bs_size: size,
                bs_usage: usage,
                bs_allocation: alloc,
            }),
            Err(e) => {
                self.hm_backend.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Hand long-vacated pages of both heaps back to the device
    pub fn release_freed_pages(&self, frame: u64) {
        self.hm_gpu_heap.release_freed_pages(frame);
        self.hm_upload_heap.release_freed_pages(frame);
    }

    pub fn dump_memory(&self) -> Vec<HeapReport> {
        vec![
            self.hm_gpu_heap.dump_memory(),
            self.hm_upload_heap.dump_memory(),
        ]
    }
}
