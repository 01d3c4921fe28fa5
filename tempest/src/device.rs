// The Device context
//
// Owns one instance of every manager in the crate and threads the
// backend through them. Everything goes through here so multiple
// devices (and tests) can live side by side without global state.
use crate::backend::headless::HeadlessBackend;
use crate::backend::vulkan::VkBackend;
use crate::backend::{Backend, DeviceProperties};
use crate::cmdbuf::{CmdBuffer, CommandBufferManager, Queue};
use crate::deletion_queue::DeferredDeletionQueue;
use crate::descpool::{DescriptorPoolReport, DescriptorSetAllocator, DescriptorSetsLayout, LayoutShape};
use crate::fence::FenceManager;
use crate::memory::heap::{BufferSuballocation, HeapReport, ResourceAllocation, ResourceHeapManager};
use crate::memory::{DeviceMemoryManager, DeviceMemoryReport};
use crate::ring::{UniformAllocation, UniformBufferUploader};
use crate::staging::{StagingBuffer, StagingImage, StagingManager, StagingReport};
use crate::swapchain::HeadlessSwapchain;
use crate::{lock, BackendType, CreateInfo, Droppable, HeadlessConfig, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Everything `dump_memory` knows, for postmortems
#[derive(Debug, Clone, Default)]
pub struct MemoryReport {
    pub frame: u64,
    pub device_memory: DeviceMemoryReport,
    pub heaps: Vec<HeapReport>,
    pub staging: StagingReport,
    pub descriptor_pools: Vec<DescriptorPoolReport>,
    pub fences_used: usize,
    pub fences_free: usize,
    pub pending_deletions: usize,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory report at frame {}", self.frame)?;
        writeln!(
            f,
            "  device allocations: {} live, {} peak, {} max",
            self.device_memory.num_allocations,
            self.device_memory.peak_num_allocations,
            self.device_memory.max_allocations
        )?;
        for (i, (used, size)) in self
            .device_memory
            .heap_usage
            .iter()
            .zip(self.device_memory.heap_sizes.iter())
            .enumerate()
        {
            writeln!(f, "  memory heap {}: {} / {} bytes", i, used, size)?;
        }
        for heap in self.heaps.iter() {
            writeln!(
                f,
                "  {} heap (type {}): {} used pages, {} free pages, {} peak, {} / {} bytes in {} allocations",
                heap.name,
                heap.memory_type_index,
                heap.used_pages,
                heap.free_pages,
                heap.peak_pages,
                heap.used_bytes,
                heap.total_bytes,
                heap.num_allocations
            )?;
        }
        writeln!(
            f,
            "  staging: {} used ({} peak), {} pending, {} free ({} bytes)",
            self.staging.num_used,
            self.staging.peak_used,
            self.staging.num_pending,
            self.staging.num_free,
            self.staging.free_bytes
        )?;
        for pools in self.descriptor_pools.iter() {
            writeln!(
                f,
                "  descriptor chain ({}): {} pools, {} / {} sets, {} in flight",
                match pools.num_sets_in_shape {
                    Some(n) => format!("{} sets per allocation", n),
                    None => "monolithic".to_string(),
                },
                pools.num_pools,
                pools.allocated_sets,
                pools.max_sets,
                pools.in_flight_pools
            )?;
        }
        write!(
            f,
            "  fences: {} used, {} free; {} pending deletions",
            self.fences_used, self.fences_free, self.pending_deletions
        )
    }
}

/// A GPU and all of the resource tracking for it
pub struct Device {
    d_backend: Arc<dyn Backend>,
    d_fences: Arc<FenceManager>,
    d_memory: Arc<DeviceMemoryManager>,
    d_heaps: Arc<ResourceHeapManager>,
    d_queue: Arc<Queue>,
    /// The immediate recording context
    d_immediate: Mutex<CommandBufferManager>,
    d_staging: StagingManager,
    d_descriptors: DescriptorSetAllocator,
    d_deletion_queue: DeferredDeletionQueue,
    d_uniforms: UniformBufferUploader,
    d_frame: AtomicU64,
    /// Set once the device is lost. There is no recovering from this.
    d_crashed: AtomicBool,
    d_reuse_fences: bool,
    d_fence_timeout_ns: u64,
}

impl Device {
    /// Create the backend selected by `info` and a Device on it
    ///
    /// `TEMPEST_HEADLESS_BACKEND` in the environment forces the
    /// headless backend.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let backend: Arc<dyn Backend> = match (&info.backend, CreateInfo::headless_forced()) {
            (BackendType::Headless(config), _) => Arc::new(HeadlessBackend::new(config.clone())),
            (BackendType::Vulkan, true) => {
                log::info!("TEMPEST_HEADLESS_BACKEND is set, using the headless backend");
                Arc::new(HeadlessBackend::new(HeadlessConfig::default()))
            }
            (BackendType::Vulkan, false) => Arc::new(VkBackend::new(info)?),
        };

        Self::with_backend(backend, info)
    }

    /// Build a Device on an existing backend
    pub fn with_backend(backend: Arc<dyn Backend>, info: &CreateInfo) -> Result<Self> {
        let reuse_fences = info.effective_reuse_fences();
        let fence_timeout_ns = info.effective_fence_timeout_ns();
        log::info!(
            "Creating device on {} (reuse fences: {}, fence timeout: {} ns)",
            backend.properties().device_name,
            reuse_fences,
            fence_timeout_ns
        );

        let fences = Arc::new(FenceManager::new(backend.clone()));
        let memory = Arc::new(DeviceMemoryManager::new(backend.clone()));
        let heaps = Arc::new(ResourceHeapManager::new(
            backend.clone(),
            memory.clone(),
            info,
        )?);
        let queue = Arc::new(Queue::new(backend.clone(), fences.clone()));
        let immediate = CommandBufferManager::new(
            backend.clone(),
            fences.clone(),
            queue.clone(),
            reuse_fences,
            fence_timeout_ns,
        )?;
        let uniforms =
            UniformBufferUploader::new(&heaps, backend.properties(), info.uniform_ring_size)?;

        Ok(Self {
            d_staging: StagingManager::new(
                backend.clone(),
                heaps.clone(),
                info.staging_lifetime_frames,
                info.reclaim_batch_size,
            ),
            d_descriptors: DescriptorSetAllocator::new(
                backend.clone(),
                info.descriptor_strategy,
                info.reclaim_batch_size,
            ),
            d_deletion_queue: DeferredDeletionQueue::new(),
            d_uniforms: uniforms,
            d_immediate: Mutex::new(immediate),
            d_backend: backend,
            d_fences: fences,
            d_memory: memory,
            d_heaps: heaps,
            d_queue: queue,
            d_frame: AtomicU64::new(0),
            d_crashed: AtomicBool::new(false),
            d_reuse_fences: reuse_fences,
            d_fence_timeout_ns: fence_timeout_ns,
        })
    }

    /// Pass `res` through, handling fatal errors
    ///
    /// Device loss marks us crashed. Every fatal error dumps the memory
    /// report before being returned. Must not be called with any of our
    /// locks held.
    fn check<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if *e == TempestError::DEVICE_LOST {
                self.d_crashed.store(true, Ordering::Release);
            }
            if e.is_fatal() {
                log::error!("Fatal GPU error: {}", e);
                log::error!("{}", self.dump_memory());
            }
        }
        res
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.d_backend
    }

    pub fn properties(&self) -> &DeviceProperties {
        self.d_backend.properties()
    }

    pub fn fence_manager(&self) -> &Arc<FenceManager> {
        &self.d_fences
    }

    pub fn memory_manager(&self) -> &Arc<DeviceMemoryManager> {
        &self.d_memory
    }

    pub fn heap_manager(&self) -> &Arc<ResourceHeapManager> {
        &self.d_heaps
    }

    pub fn staging_manager(&self) -> &StagingManager {
        &self.d_staging
    }

    pub fn descriptor_allocator(&self) -> &DescriptorSetAllocator {
        &self.d_descriptors
    }

    pub fn deletion_queue(&self) -> &DeferredDeletionQueue {
        &self.d_deletion_queue
    }

    pub fn uniform_uploader(&self) -> &UniformBufferUploader {
        &self.d_uniforms
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.d_queue
    }

    /// Number of completed end_frame calls
    pub fn frame(&self) -> u64 {
        self.d_frame.load(Ordering::Acquire)
    }

    /// Hang detection ceiling for waits on this device
    pub fn fence_timeout_ns(&self) -> u64 {
        self.d_fence_timeout_ns
    }

    pub fn is_crashed(&self) -> bool {
        self.d_crashed.load(Ordering::Acquire)
    }

    // ------------ command buffers ------------

    pub fn get_active_cmd_buffer(&self) -> Result<Arc<CmdBuffer>> {
        let res = lock(&self.d_immediate).get_active_cmd_buffer();
        self.check(res)
    }

    pub fn get_upload_cmd_buffer(&self) -> Result<Arc<CmdBuffer>> {
        let res = lock(&self.d_immediate).get_upload_cmd_buffer();
        self.check(res)
    }

    pub fn prepare_for_new_active_command_buffer(&self) -> Result<Arc<CmdBuffer>> {
        let res = lock(&self.d_immediate).prepare_for_new_active_command_buffer();
        self.check(res)
    }

    pub fn submit_upload_cmd_buffer(&self, wait_for_fence: bool) -> Result<()> {
        let res = lock(&self.d_immediate).submit_upload_cmd_buffer(wait_for_fence);
        self.check(res)
    }

    pub fn submit_active_cmd_buffer(&self, wait_for_fence: bool) -> Result<()> {
        let res = lock(&self.d_immediate).submit_active_cmd_buffer(wait_for_fence);
        self.check(res)
    }

    /// Submit the active buffer waiting on and signaling semaphores
    pub fn submit_active_cmd_buffer_with(
        &self,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        wait_for_fence: bool,
    ) -> Result<()> {
        let res =
            lock(&self.d_immediate).submit_active_cmd_buffer_with(wait, signal, wait_for_fence);
        self.check(res)
    }

    /// Block until `cmd` completes. Ok(false) on timeout.
    pub fn wait_for_cmd_buffer(&self, cmd: &CmdBuffer, timeout_ns: u64) -> Result<bool> {
        let res = cmd.wait(timeout_ns);
        self.check(res)
    }

    /// Poll every buffer of the immediate context
    pub fn refresh_fence_status(&self) -> Result<()> {
        let res = lock(&self.d_immediate).refresh_fence_status();
        self.check(res)
    }

    pub fn num_cmd_buffers(&self) -> usize {
        lock(&self.d_immediate).num_cmd_buffers()
    }

    /// A new recording context sharing our pools
    ///
    /// Its command buffers are only polled when it prepares a new one
    /// or `refresh_fence_status` is called on it.
    pub fn create_context(&self) -> Result<CommandBufferManager> {
        let res = CommandBufferManager::new(
            self.d_backend.clone(),
            self.d_fences.clone(),
            self.d_queue.clone(),
            self.d_reuse_fences,
            self.d_fence_timeout_ns,
        );
        self.check(res)
    }

    pub fn create_headless_swapchain(&self, image_count: u32) -> Result<HeadlessSwapchain> {
        let res = HeadlessSwapchain::new(self.d_backend.clone(), image_count, self.d_fence_timeout_ns);
        self.check(res)
    }

    // ------------ memory ------------

    pub fn allocate_resource(
        &self,
        size: u64,
        alignment: u64,
        persistently_mapped: bool,
    ) -> Result<Arc<ResourceAllocation>> {
        let res = self
            .d_heaps
            .allocate_resource(size, alignment, persistently_mapped);
        self.check(res)
    }

    pub fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        persistently_mapped: bool,
    ) -> Result<BufferSuballocation> {
        let res = self.d_heaps.allocate_buffer(size, usage, persistently_mapped);
        self.check(res)
    }

    pub fn acquire_staging_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        cpu_read: bool,
    ) -> Result<StagingBuffer> {
        let res = self.d_staging.acquire_buffer(size, usage, cpu_read);
        self.check(res)
    }

    pub fn acquire_staging_image(
        &self,
        format: vk::Format,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<StagingImage> {
        let res = self.d_staging.acquire_image(format, width, height, depth);
        self.check(res)
    }

    pub fn release_staging_buffer(&self, cmd: &Arc<CmdBuffer>, buffer: StagingBuffer) {
        self.d_staging.release_buffer(cmd, buffer)
    }

    pub fn release_staging_image(&self, cmd: &Arc<CmdBuffer>, image: StagingImage) {
        self.d_staging.release_image(cmd, image)
    }

    /// Upload constant data for `cmd`, see UniformBufferUploader
    pub fn upload_uniform(
        &self,
        cmd: &Arc<CmdBuffer>,
        data: &[u8],
        alignment: u64,
    ) -> Result<UniformAllocation> {
        let res = self.d_uniforms.upload(cmd, data, alignment);
        self.check(res)
    }

    // ------------ descriptors ------------

    pub fn create_descriptor_layout(&self, shape: LayoutShape) -> Result<Arc<DescriptorSetsLayout>> {
        let res = self.d_descriptors.create_layout(shape);
        self.check(res)
    }

    pub fn allocate_descriptor_sets(
        &self,
        cmd: &Arc<CmdBuffer>,
        layout: &DescriptorSetsLayout,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let res = self.d_descriptors.allocate_descriptor_sets(cmd, layout);
        self.check(res)
    }

    // ------------ lifetimes ------------

    /// Destroy `item` once `cmd`'s current work completes
    pub fn enqueue_deletion(&self, item: Arc<dyn Droppable + Send + Sync>, cmd: &Arc<CmdBuffer>) {
        self.d_deletion_queue.enqueue(item, cmd)
    }

    /// Frame boundary
    ///
    /// Polls the immediate context's fences and then reclaims whatever
    /// they retired: deferred deletions, staging resources, descriptor
    /// pools and finally long vacated heap pages.
    pub fn end_frame(&self) -> Result<()> {
        let res = self.end_frame_internal();
        self.check(res)
    }

    fn end_frame_internal(&self) -> Result<()> {
        let frame = self.frame();

        lock(&self.d_immediate).refresh_fence_status()?;
        self.d_deletion_queue.release_resources();
        self.d_staging.process_pending_free(frame);
        self.d_descriptors.release_reclaimable_pools()?;
        self.d_heaps.release_freed_pages(frame);

        self.d_frame.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Wait for the GPU to finish everything and poll our fences
    pub fn wait_idle(&self) -> Result<()> {
        let res = self
            .d_backend
            .wait_idle()
            .and_then(|_| lock(&self.d_immediate).refresh_fence_status());
        self.check(res)
    }

    pub fn dump_memory(&self) -> MemoryReport {
        MemoryReport {
            frame: self.frame(),
            device_memory: self.d_memory.dump_memory(),
            heaps: self.d_heaps.dump_memory(),
            staging: self.d_staging.dump_memory(),
            descriptor_pools: self.d_descriptors.dump_memory(),
            fences_used: self.d_fences.num_used(),
            fences_free: self.d_fences.num_free(),
            pending_deletions: self.d_deletion_queue.num_pending(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.is_crashed() {
            if let Err(e) = self.d_backend.wait_idle() {
                log::error!("Could not idle the device during teardown: {}", e);
            }
            if let Err(e) = lock(&self.d_immediate).refresh_fence_status() {
                log::debug!("Could not refresh fences during teardown: {}", e);
            }
        }
        self.d_deletion_queue.clear();
        self.d_staging.clear();
    }
}
