// Device memory management
//
// DeviceMemoryManager hands out raw allocations straight from the
// driver's memory heaps. Everything else sub-allocates from these, see
// `heap` for the page allocator built on top.
pub mod heap;

#[cfg(test)]
mod tests;

use crate::backend::{self, Backend};
use crate::{lock, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::sync::{Arc, Mutex};

/// One raw allocation from a memory type
///
/// Exclusively owned by whoever asked for it, and only returned through
/// `DeviceMemoryManager::free`, which consumes it.
pub struct DeviceMemoryAllocation {
    dma_backend: Arc<dyn Backend>,
    dma_handle: vk::DeviceMemory,
    dma_size: u64,
    dma_memory_type_index: u32,
    dma_can_map: bool,
    dma_coherent: bool,
    /// Base address of the current mapping, null when unmapped
    dma_mapped_ptr: *mut u8,
    dma_mapped_offset: u64,
}

// The mapped pointer refers to driver owned memory that lives as long
// as this allocation does.
unsafe impl Send for DeviceMemoryAllocation {}
unsafe impl Sync for DeviceMemoryAllocation {}

impl DeviceMemoryAllocation {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.dma_handle
    }

    pub fn size(&self) -> u64 {
        self.dma_size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.dma_memory_type_index
    }

    pub fn can_be_mapped(&self) -> bool {
        self.dma_can_map
    }

    pub fn is_coherent(&self) -> bool {
        self.dma_coherent
    }

    pub fn is_mapped(&self) -> bool {
        !self.dma_mapped_ptr.is_null()
    }

    /// Pointer to byte `offset` of the allocation, if it is mapped there
    pub fn mapped_ptr(&self, offset: u64) -> Option<*mut u8> {
        if !self.is_mapped() || offset < self.dma_mapped_offset || offset > self.dma_size {
            return None;
        }
        Some(unsafe {
            self.dma_mapped_ptr
                .add((offset - self.dma_mapped_offset) as usize)
        })
    }

    /// Map `size` bytes starting at `offset`
    ///
    /// Only one mapping may exist at a time.
    pub fn map(&mut self, offset: u64, size: u64) -> Result<*mut u8> {
        if !self.dma_can_map {
            return Err(TempestError::MEMORY_NOT_HOST_VISIBLE);
        }
        if self.is_mapped() {
            return Err(TempestError::MEMORY_ALREADY_MAPPED);
        }

        let ptr = self.dma_backend.map_memory(self.dma_handle, offset, size)?;
        self.dma_mapped_ptr = ptr;
        self.dma_mapped_offset = offset;
        Ok(ptr)
    }

    pub fn unmap(&mut self) -> Result<()> {
        if !self.is_mapped() {
            return Err(TempestError::MEMORY_NOT_MAPPED);
        }
        self.dma_backend.unmap_memory(self.dma_handle);
        self.dma_mapped_ptr = std::ptr::null_mut();
        self.dma_mapped_offset = 0;
        Ok(())
    }

    /// Make host writes visible to the device. A no-op for coherent memory.
    pub fn flush_mapped_range(&self, offset: u64, size: u64) -> Result<()> {
        if self.dma_coherent {
            return Ok(());
        }
        self.dma_backend
            .flush_mapped_range(self.dma_handle, offset, size)
    }

    /// Make device writes visible to the host. A no-op for coherent memory.
    pub fn invalidate_mapped_range(&self, offset: u64, size: u64) -> Result<()> {
        if self.dma_coherent {
            return Ok(());
        }
        self.dma_backend
            .invalidate_mapped_range(self.dma_handle, offset, size)
    }
}

/// Snapshot of the manager's bookkeeping for diagnostics
#[derive(Debug, Clone, Default)]
pub struct DeviceMemoryReport {
    pub num_allocations: u32,
    pub peak_num_allocations: u32,
    pub max_allocations: u32,
    /// Bytes allocated per memory heap
    pub heap_usage: Vec<u64>,
    pub heap_sizes: Vec<u64>,
}

struct DeviceMemoryStats {
    ms_num_allocations: u32,
    ms_peak_num_allocations: u32,
    ms_heap_usage: Vec<u64>,
}

/// Raw device memory allocator
///
/// Tracks the live allocation count against the device maximum.
pub struct DeviceMemoryManager {
    dm_backend: Arc<dyn Backend>,
    dm_mem_props: vk::PhysicalDeviceMemoryProperties,
    dm_max_allocations: u32,
    dm_stats: Mutex<DeviceMemoryStats>,
}

impl DeviceMemoryManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let props = backend.properties();
        let mem_props = props.memory_properties;
        let max = props.limits.max_memory_allocation_count;

        Self {
            dm_backend: backend,
            dm_mem_props: mem_props,
            dm_max_allocations: max,
            dm_stats: Mutex::new(DeviceMemoryStats {
                ms_num_allocations: 0,
                ms_peak_num_allocations: 0,
                ms_heap_usage: vec![0; mem_props.memory_heap_count as usize],
            }),
        }
    }

    fn heap_index(&self, memory_type_index: u32) -> usize {
        self.dm_mem_props.memory_types[memory_type_index as usize].heap_index as usize
    }

    /// Allocate `size` bytes of memory type `memory_type_index`
    ///
    /// Going over the device's allocation count only warns. The driver
    /// failing the allocation is returned as OUT_OF_MEMORY.
    pub fn alloc(&self, size: u64, memory_type_index: u32) -> Result<DeviceMemoryAllocation> {
        if size == 0 {
            return Err(TempestError::INVALID_SIZE);
        }
        if memory_type_index >= self.dm_mem_props.memory_type_count {
            return Err(TempestError::NO_MATCHING_MEMORY_TYPE);
        }

        let mut stats = lock(&self.dm_stats);
        if stats.ms_num_allocations >= self.dm_max_allocations {
            log::warn!(
                "Hit maximum # of allocations ({}) reported by device!",
                self.dm_max_allocations
            );
        }

        let handle = match self.dm_backend.allocate_memory(size, memory_type_index) {
            Ok(h) => h,
            Err(TempestError::DEVICE_LOST) => return Err(TempestError::DEVICE_LOST),
            Err(e) => {
                log::error!(
                    "Failed to allocate {} bytes of memory type {} ({:?}), {} allocations live",
                    size,
                    memory_type_index,
                    e,
                    stats.ms_num_allocations
                );
                return Err(TempestError::OUT_OF_MEMORY);
            }
        };

        stats.ms_num_allocations += 1;
        stats.ms_peak_num_allocations = stats
            .ms_peak_num_allocations
            .max(stats.ms_num_allocations);
        let heap = self.heap_index(memory_type_index);
        stats.ms_heap_usage[heap] += size;

        let flags = self.dm_mem_props.memory_types[memory_type_index as usize].property_flags;
        Ok(DeviceMemoryAllocation {
            dma_backend: self.dm_backend.clone(),
            dma_handle: handle,
            dma_size: size,
            dma_memory_type_index: memory_type_index,
            dma_can_map: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            dma_coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            dma_mapped_ptr: std::ptr::null_mut(),
            dma_mapped_offset: 0,
        })
    }

    /// Return an allocation to the driver
    ///
    /// Takes ownership, the allocation cannot be used afterwards. A
    /// mapped allocation is unmapped first.
    pub fn free(&self, mut allocation: DeviceMemoryAllocation) {
        if allocation.is_mapped() {
            log::debug!("Freeing device memory that is still mapped");
            if let Err(e) = allocation.unmap() {
                log::debug!("Could not unmap device memory before freeing: {}", e);
            }
        }

        let mut stats = lock(&self.dm_stats);
        self.dm_backend.free_memory(allocation.dma_handle);
        stats.ms_num_allocations -= 1;
        let heap = self.heap_index(allocation.dma_memory_type_index);
        stats.ms_heap_usage[heap] -= allocation.dma_size;
    }

    /// Find a memory type allowed by `type_bits` that has all of `flags`
    pub fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        backend::find_memory_type_index(&self.dm_mem_props, type_bits, flags)
            .ok_or(TempestError::NO_MATCHING_MEMORY_TYPE)
    }

    /// Like `find_memory_type_index` but tries `preferred` first
    pub fn find_memory_type_index_preferred(
        &self,
        type_bits: u32,
        preferred: vk::MemoryPropertyFlags,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        self.find_memory_type_index(type_bits, preferred | required)
            .or_else(|_| self.find_memory_type_index(type_bits, required))
    }

    pub fn memory_type_flags(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.dm_mem_props.memory_types[memory_type_index as usize].property_flags
    }

    pub fn num_allocations(&self) -> u32 {
        lock(&self.dm_stats).ms_num_allocations
    }

    pub fn max_allocations(&self) -> u32 {
        self.dm_max_allocations
    }

    pub fn dump_memory(&self) -> DeviceMemoryReport {
        let stats = lock(&self.dm_stats);
        DeviceMemoryReport {
            num_allocations: stats.ms_num_allocations,
            peak_num_allocations: stats.ms_peak_num_allocations,
            max_allocations: self.dm_max_allocations,
            heap_usage: stats.ms_heap_usage.clone(),
            heap_sizes: self.dm_mem_props.memory_heaps
                [..self.dm_mem_props.memory_heap_count as usize]
                .iter()
                .map(|h| h.size)
                .collect(),
        }
    }
}
