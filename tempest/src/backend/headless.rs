// Headless backend
//
// A GPU simulated in host memory. Handles are made up, host visible
// memory is backed by real bytes so mapped pointers work, and fences
// only signal when the simulated GPU "finishes" a submission.
//
// Submissions finish in one of three ways:
// * immediately, if `auto_signal` is set
// * when somebody blocks on the fence, if `complete_on_wait` is set
// * when a test calls `signal_fence`/`signal_all_pending`
use super::{Backend, DeviceProperties};
use crate::{align_up, lock, Result, TempestError};
use ash::vk;
use ash::vk::Handle;
use tp_utils::log;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Knobs for the simulated device
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Fences signal as soon as their submission is queued
    pub auto_signal: bool,
    /// Blocking fence waits complete pending work instead of timing out
    pub complete_on_wait: bool,
    /// Report device local memory as host visible
    pub unified_memory: bool,
    /// The device reported max number of live memory allocations. Going
    /// past it makes allocation fail.
    pub max_memory_allocation_count: u32,
    /// Fail every memory allocation after this many have been made
    pub fail_allocations_after: Option<usize>,
    pub min_uniform_buffer_offset_alignment: u64,
    pub device_local_heap_size: u64,
    pub host_heap_size: u64,
    /// Used for every per-set descriptor limit
    pub max_descriptors_per_kind: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            auto_signal: false,
            complete_on_wait: true,
            unified_memory: false,
            max_memory_allocation_count: 4096,
            fail_allocations_after: None,
            min_uniform_buffer_offset_alignment: 256,
            device_local_heap_size: 4 * 1024 * 1024 * 1024,
            host_heap_size: 4 * 1024 * 1024 * 1024,
            max_descriptors_per_kind: 1024,
        }
    }
}

struct FenceSim {
    signaled: bool,
    /// Submitted and waiting on the simulated GPU
    pending: bool,
}

struct MemorySim {
    size: u64,
    host_visible: bool,
    /// Lazily created on first map
    host: Option<Box<[u8]>>,
    mapped: bool,
}

struct BufferSim {
    size: u64,
    bound: bool,
}

struct CmdBufferSim {
    pool: u64,
    recording: bool,
    num_commands: usize,
}

struct DescPoolSim {
    max_sets: u32,
    used_sets: u32,
    capacity: HashMap<i32, u32>,
    used: HashMap<i32, u32>,
}

struct HeadlessState {
    hs_next_handle: u64,
    hs_auto_signal: bool,
    hs_device_lost: bool,
    hs_fences: HashMap<u64, FenceSim>,
    hs_semaphores: HashSet<u64>,
    hs_memory: HashMap<u64, MemorySim>,
    hs_memory_allocation_calls: usize,
    hs_buffers: HashMap<u64, BufferSim>,
    hs_images: HashMap<u64, u64>,
    hs_command_pools: HashSet<u64>,
    hs_cmd_buffers: HashMap<u64, CmdBufferSim>,
    hs_desc_layouts: HashMap<u64, Vec<(i32, u32)>>,
    hs_desc_pools: HashMap<u64, DescPoolSim>,
    hs_submissions: u64,
}

impl HeadlessState {
    fn new_handle(&mut self) -> u64 {
        self.hs_next_handle += 1;
        self.hs_next_handle
    }

    fn check_lost(&self) -> Result<()> {
        match self.hs_device_lost {
            true => Err(TempestError::DEVICE_LOST),
            false => Ok(()),
        }
    }

    fn record_command(&mut self, cbuf: vk::CommandBuffer) {
        if let Some(cb) = self.hs_cmd_buffers.get_mut(&cbuf.as_raw()) {
            cb.num_commands += 1;
        }
    }

    fn signal_pending(&mut self) -> usize {
        let mut count = 0;
        for fence in self.hs_fences.values_mut().filter(|f| f.pending) {
            fence.pending = false;
            fence.signaled = true;
            count += 1;
        }
        count
    }
}

/// A simulated GPU
pub struct HeadlessBackend {
    h_props: DeviceProperties,
    h_config: HeadlessConfig,
    h_state: Mutex<HeadlessState>,
}

fn texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 4,
    }
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        let mut mem_props = vk::PhysicalDeviceMemoryProperties::default();

        if config.unified_memory {
            mem_props.memory_heap_count = 1;
            mem_props.memory_heaps[0] = vk::MemoryHeap {
                size: config.device_local_heap_size,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            };
            mem_props.memory_type_count = 2;
            mem_props.memory_types[0] = vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 0,
            };
            mem_props.memory_types[1] = vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                heap_index: 0,
            };
        } else {
            mem_props.memory_heap_count = 2;
            mem_props.memory_heaps[0] = vk::MemoryHeap {
                size: config.device_local_heap_size,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            };
            mem_props.memory_heaps[1] = vk::MemoryHeap {
                size: config.host_heap_size,
                flags: vk::MemoryHeapFlags::empty(),
            };
            mem_props.memory_type_count = 3;
            mem_props.memory_types[0] = vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            };
            mem_props.memory_types[1] = vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            };
            mem_props.memory_types[2] = vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            };
        }

        let max = config.max_descriptors_per_kind;
        let limits = vk::PhysicalDeviceLimits {
            max_memory_allocation_count: config.max_memory_allocation_count,
            min_uniform_buffer_offset_alignment: config.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: 16,
            non_coherent_atom_size: 64,
            max_bound_descriptor_sets: 8,
            max_descriptor_set_samplers: max,
            max_descriptor_set_uniform_buffers: max,
            max_descriptor_set_uniform_buffers_dynamic: max,
            max_descriptor_set_storage_buffers: max,
            max_descriptor_set_storage_buffers_dynamic: max,
            max_descriptor_set_sampled_images: max,
            max_descriptor_set_storage_images: max,
            max_descriptor_set_input_attachments: max,
            ..Default::default()
        };

        log::debug!(
            "Creating headless device (unified memory: {})",
            config.unified_memory
        );

        Self {
            h_props: DeviceProperties {
                device_name: "Tempest Headless".to_string(),
                memory_properties: mem_props,
                limits: limits,
                graphics_queue_family: 0,
                is_unified_memory: config.unified_memory,
            },
            h_state: Mutex::new(HeadlessState {
                hs_next_handle: 0,
                hs_auto_signal: config.auto_signal,
                hs_device_lost: false,
                hs_fences: HashMap::new(),
                hs_semaphores: HashSet::new(),
                hs_memory: HashMap::new(),
                hs_memory_allocation_calls: 0,
                hs_buffers: HashMap::new(),
                hs_images: HashMap::new(),
                hs_command_pools: HashSet::new(),
                hs_cmd_buffers: HashMap::new(),
                hs_desc_layouts: HashMap::new(),
                hs_desc_pools: HashMap::new(),
                hs_submissions: 0,
            }),
            h_config: config,
        }
    }

    /// Finish the submission that will signal `fence`
    ///
    /// Returns false if nothing was pending on it.
    pub fn signal_fence(&self, fence: vk::Fence) -> bool {
        let mut state = lock(&self.h_state);
        match state.hs_fences.get_mut(&fence.as_raw()) {
            Some(f) if f.pending => {
                f.pending = false;
                f.signaled = true;
                true
            }
            _ => false,
        }
    }

    /// Finish every pending submission. Returns how many there were.
    pub fn signal_all_pending(&self) -> usize {
        lock(&self.h_state).signal_pending()
    }

    pub fn pending_fence_count(&self) -> usize {
        lock(&self.h_state)
            .hs_fences
            .values()
            .filter(|f| f.pending)
            .count()
    }

    pub fn is_fence_pending(&self, fence: vk::Fence) -> bool {
        lock(&self.h_state)
            .hs_fences
            .get(&fence.as_raw())
            .map(|f| f.pending)
            .unwrap_or(false)
    }

    pub fn set_auto_signal(&self, auto: bool) {
        lock(&self.h_state).hs_auto_signal = auto;
    }

    /// Make every following driver call report device loss
    pub fn set_device_lost(&self, lost: bool) {
        lock(&self.h_state).hs_device_lost = lost;
    }

    pub fn num_live_memory_allocations(&self) -> usize {
        lock(&self.h_state).hs_memory.len()
    }

    pub fn num_live_fences(&self) -> usize {
        lock(&self.h_state).hs_fences.len()
    }

    pub fn num_live_buffers(&self) -> usize {
        lock(&self.h_state).hs_buffers.len()
    }

    pub fn num_live_images(&self) -> usize {
        lock(&self.h_state).hs_images.len()
    }

    pub fn num_live_descriptor_pools(&self) -> usize {
        lock(&self.h_state).hs_desc_pools.len()
    }

    pub fn num_submissions(&self) -> u64 {
        lock(&self.h_state).hs_submissions
    }

    /// Number of commands recorded into `cbuf` since it was last reset
    pub fn num_recorded_commands(&self, cbuf: vk::CommandBuffer) -> usize {
        lock(&self.h_state)
            .hs_cmd_buffers
            .get(&cbuf.as_raw())
            .map(|cb| cb.num_commands)
            .unwrap_or(0)
    }
}

impl Backend for HeadlessBackend {
    fn properties(&self) -> &DeviceProperties {
        &self.h_props
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        state.hs_fences.insert(
            handle,
            FenceSim {
                signaled: signaled,
                pending: false,
            },
        );
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        lock(&self.h_state).hs_fences.remove(&fence.as_raw());
    }

    fn get_fence_status(&self, fence: vk::Fence) -> Result<bool> {
        let state = lock(&self.h_state);
        state.check_lost()?;
        state
            .hs_fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .ok_or(TempestError::UNKNOWN_RESOURCE)
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let complete_on_wait = self.h_config.complete_on_wait;
        let f = state
            .hs_fences
            .get_mut(&fence.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;

        if !f.signaled && f.pending && complete_on_wait {
            f.pending = false;
            f.signaled = true;
        }

        // Nothing can signal us while we hold the lock, so anything
        // still unsignaled here would time out
        Ok(f.signaled)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let f = state
            .hs_fences
            .get_mut(&fence.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        f.signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        state.hs_semaphores.insert(handle);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, sema: vk::Semaphore) {
        lock(&self.h_state).hs_semaphores.remove(&sema.as_raw());
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;

        if memory_type_index >= self.h_props.memory_properties.memory_type_count {
            return Err(TempestError::NO_MATCHING_MEMORY_TYPE);
        }
        if let Some(limit) = self.h_config.fail_allocations_after {
            if state.hs_memory_allocation_calls >= limit {
                return Err(TempestError::OUT_OF_MEMORY);
            }
        }
        if state.hs_memory.len() >= self.h_config.max_memory_allocation_count as usize {
            return Err(vk::Result::ERROR_TOO_MANY_OBJECTS.into());
        }

        let mem_type = self.h_props.memory_properties.memory_types[memory_type_index as usize];
        let heap_index = mem_type.heap_index;
        let heap_size = self.h_props.memory_properties.memory_heaps[heap_index as usize].size;
        let heap_used: u64 = state
            .hs_memory
            .values()
            .filter(|m| {
                // Host visible memory lives in the last heap when not unified
                let idx = match (self.h_config.unified_memory, m.host_visible) {
                    (false, true) => 1,
                    _ => 0,
                };
                idx == heap_index
            })
            .map(|m| m.size)
            .sum();
        if heap_used + size > heap_size {
            return Err(TempestError::OUT_OF_MEMORY);
        }

        state.hs_memory_allocation_calls += 1;
        let handle = state.new_handle();
        state.hs_memory.insert(
            handle,
            MemorySim {
                size: size,
                host_visible: mem_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                host: None,
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_memory(&self, mem: vk::DeviceMemory) {
        lock(&self.h_state).hs_memory.remove(&mem.as_raw());
    }

    fn map_memory(&self, mem: vk::DeviceMemory, offset: u64, size: u64) -> Result<*mut u8> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let m = state
            .hs_memory
            .get_mut(&mem.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;

        if !m.host_visible {
            return Err(TempestError::MEMORY_NOT_HOST_VISIBLE);
        }
        if m.mapped {
            return Err(TempestError::MEMORY_ALREADY_MAPPED);
        }
        let size = match size {
            vk::WHOLE_SIZE => m.size.saturating_sub(offset),
            s => s,
        };
        if offset.checked_add(size).map_or(true, |end| end > m.size) {
            return Err(TempestError::INVALID_SIZE);
        }

        let total = m.size as usize;
        let host = m
            .host
            .get_or_insert_with(|| vec![0u8; total].into_boxed_slice());
        m.mapped = true;

        // The boxed slice never moves until the memory is freed
        Ok(unsafe { host.as_mut_ptr().add(offset as usize) })
    }

    fn unmap_memory(&self, mem: vk::DeviceMemory) {
        if let Some(m) = lock(&self.h_state).hs_memory.get_mut(&mem.as_raw()) {
            m.mapped = false;
        }
    }

    fn flush_mapped_range(&self, mem: vk::DeviceMemory, _offset: u64, _size: u64) -> Result<()> {
        let state = lock(&self.h_state);
        state.check_lost()?;
        match state.hs_memory.get(&mem.as_raw()) {
            Some(m) if m.mapped => Ok(()),
            Some(_) => Err(TempestError::MEMORY_NOT_MAPPED),
            None => Err(TempestError::UNKNOWN_RESOURCE),
        }
    }

    fn invalidate_mapped_range(
        &self,
        mem: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.flush_mapped_range(mem, offset, size)
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        if size == 0 {
            return Err(TempestError::INVALID_SIZE);
        }
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        state.hs_buffers.insert(
            handle,
            BufferSim {
                size: size,
                bound: false,
            },
        );
        Ok(vk::Buffer::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        lock(&self.h_state).hs_buffers.remove(&buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = lock(&self.h_state);
        let size = state
            .hs_buffers
            .get(&buffer.as_raw())
            .map(|b| b.size)
            .unwrap_or(0);
        let alignment = self.h_props.limits.min_uniform_buffer_offset_alignment.max(16);

        vk::MemoryRequirements {
            size: align_up(size, 4),
            alignment: alignment,
            memory_type_bits: (1 << self.h_props.memory_properties.memory_type_count) - 1,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        mem: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let mem_size = state
            .hs_memory
            .get(&mem.as_raw())
            .map(|m| m.size)
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        let b = state
            .hs_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;

        if b.bound || offset.checked_add(b.size).map_or(true, |end| end > mem_size) {
            return Err(TempestError::INVALID);
        }
        b.bound = true;
        Ok(())
    }

    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent3D,
        _usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image> {
        let size = extent.width as u64
            * extent.height as u64
            * extent.depth.max(1) as u64
            * texel_size(format);
        if size == 0 {
            return Err(TempestError::INVALID_SIZE);
        }
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        state.hs_images.insert(handle, size);
        Ok(vk::Image::from_raw(handle))
    }

    fn destroy_image(&self, image: vk::Image) {
        lock(&self.h_state).hs_images.remove(&image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = lock(&self.h_state);
        vk::MemoryRequirements {
            size: state.hs_images.get(&image.as_raw()).copied().unwrap_or(0),
            alignment: 256,
            memory_type_bits: (1 << self.h_props.memory_properties.memory_type_count) - 1,
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        mem: vk::DeviceMemory,
        _offset: u64,
    ) -> Result<()> {
        let state = lock(&self.h_state);
        state.check_lost()?;
        if !state.hs_images.contains_key(&image.as_raw())
            || !state.hs_memory.contains_key(&mem.as_raw())
        {
            return Err(TempestError::UNKNOWN_RESOURCE);
        }
        Ok(())
    }

    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        state.hs_command_pools.insert(handle);
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = lock(&self.h_state);
        let raw = pool.as_raw();
        state.hs_command_pools.remove(&raw);
        state.hs_cmd_buffers.retain(|_, cb| cb.pool != raw);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        if !state.hs_command_pools.contains(&pool.as_raw()) {
            return Err(TempestError::UNKNOWN_RESOURCE);
        }
        let handle = state.new_handle();
        state.hs_cmd_buffers.insert(
            handle,
            CmdBufferSim {
                pool: pool.as_raw(),
                recording: false,
                num_commands: 0,
            },
        );
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let cb = state
            .hs_cmd_buffers
            .get_mut(&cbuf.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        cb.recording = true;
        cb.num_commands = 0;
        Ok(())
    }

    fn end_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let cb = state
            .hs_cmd_buffers
            .get_mut(&cbuf.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        if !cb.recording {
            return Err(TempestError::INVALID);
        }
        cb.recording = false;
        Ok(())
    }

    fn reset_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let cb = state
            .hs_cmd_buffers
            .get_mut(&cbuf.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        cb.recording = false;
        cb.num_commands = 0;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cbuf: vk::CommandBuffer,
        _render_pass: vk::RenderPass,
        _framebuffer: vk::Framebuffer,
        _area: vk::Rect2D,
    ) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn cmd_end_render_pass(&self, cbuf: vk::CommandBuffer) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn cmd_set_viewport(&self, cbuf: vk::CommandBuffer, _viewport: &vk::Viewport) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn cmd_set_scissor(&self, cbuf: vk::CommandBuffer, _scissor: &vk::Rect2D) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn cmd_set_stencil_reference(&self, cbuf: vk::CommandBuffer, _reference: u32) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn cmd_copy_buffer(
        &self,
        cbuf: vk::CommandBuffer,
        _src: vk::Buffer,
        _dst: vk::Buffer,
        _regions: &[vk::BufferCopy],
    ) {
        lock(&self.h_state).record_command(cbuf);
    }

    fn queue_submit(
        &self,
        cbuf: Option<vk::CommandBuffer>,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        _signal_semas: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;

        if wait_semas.len() != wait_stages.len() {
            return Err(TempestError::INVALID);
        }
        if let Some(cbuf) = cbuf {
            match state.hs_cmd_buffers.get(&cbuf.as_raw()) {
                Some(cb) if !cb.recording => {}
                Some(_) => return Err(TempestError::INVALID),
                None => return Err(TempestError::UNKNOWN_RESOURCE),
            }
        }

        let auto_signal = state.hs_auto_signal;
        if fence != vk::Fence::null() {
            let f = state
                .hs_fences
                .get_mut(&fence.as_raw())
                .ok_or(TempestError::UNKNOWN_RESOURCE)?;
            // Submitting with a fence that is already in use is a usage error
            if f.signaled || f.pending {
                log::error!("Submitting with a fence that is still signaled or pending");
                return Err(TempestError::INVALID);
            }
            match auto_signal {
                true => f.signaled = true,
                false => f.pending = true,
            }
        }

        state.hs_submissions += 1;
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        let counts = bindings
            .iter()
            .map(|b| (b.descriptor_type.as_raw(), b.descriptor_count))
            .collect();
        state.hs_desc_layouts.insert(handle, counts);
        Ok(vk::DescriptorSetLayout::from_raw(handle))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        lock(&self.h_state).hs_desc_layouts.remove(&layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let handle = state.new_handle();
        let mut capacity = HashMap::new();
        for size in sizes.iter() {
            *capacity.entry(size.ty.as_raw()).or_insert(0) += size.descriptor_count;
        }
        state.hs_desc_pools.insert(
            handle,
            DescPoolSim {
                max_sets: max_sets,
                used_sets: 0,
                capacity: capacity,
                used: HashMap::new(),
            },
        );
        Ok(vk::DescriptorPool::from_raw(handle))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        lock(&self.h_state).hs_desc_pools.remove(&pool.as_raw());
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        let p = state
            .hs_desc_pools
            .get_mut(&pool.as_raw())
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;
        p.used_sets = 0;
        p.used.clear();
        Ok(())
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;

        // Total up what these layouts need
        let mut needed: HashMap<i32, u32> = HashMap::new();
        for layout in layouts.iter() {
            let counts = state
                .hs_desc_layouts
                .get(&layout.as_raw())
                .ok_or(TempestError::UNKNOWN_RESOURCE)?;
            for (ty, count) in counts.iter() {
                *needed.entry(*ty).or_insert(0) += count;
            }
        }

        {
            let p = state
                .hs_desc_pools
                .get_mut(&pool.as_raw())
                .ok_or(TempestError::UNKNOWN_RESOURCE)?;
            if p.used_sets + layouts.len() as u32 > p.max_sets {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
            }
            for (ty, count) in needed.iter() {
                let cap = p.capacity.get(ty).copied().unwrap_or(0);
                let used = p.used.get(ty).copied().unwrap_or(0);
                if used + count > cap {
                    return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
                }
            }
            p.used_sets += layouts.len() as u32;
            for (ty, count) in needed.iter() {
                *p.used.entry(*ty).or_insert(0) += count;
            }
        }

        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.new_handle()))
            .collect())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = lock(&self.h_state);
        state.check_lost()?;
        if self.h_config.complete_on_wait {
            state.signal_pending();
        }
        Ok(())
    }
}
