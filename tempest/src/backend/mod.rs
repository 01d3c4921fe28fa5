// The driver seam
//
// Every raw call into the graphics driver goes through `Backend`. The
// managers in this crate only ever see an `Arc<dyn Backend>`, which lets
// the same code run against a real GPU or the headless simulator.
pub mod headless;
pub mod vulkan;

use crate::Result;
use ash::vk;

/// What we need to know about the physical device
#[derive(Clone)]
pub struct DeviceProperties {
    pub device_name: String,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub limits: vk::PhysicalDeviceLimits,
    pub graphics_queue_family: u32,
    /// Device local memory is also host visible (integrated GPUs). When
    /// this is set uploads skip the device local ring.
    pub is_unified_memory: bool,
}

/// Raw driver operations
///
/// Handles are plain `ash::vk` handles. Callers own them and must
/// destroy what they create. None of these calls track lifetimes, that
/// is the job of the managers built on top.
pub trait Backend: Send + Sync {
    fn properties(&self) -> &DeviceProperties;

    // ------------ fences and semaphores ------------
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Non-blocking poll. true if signaled.
    fn get_fence_status(&self, fence: vk::Fence) -> Result<bool>;
    /// Block for up to `timeout_ns`. Ok(false) on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, sema: vk::Semaphore);

    // ------------ device memory ------------
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, mem: vk::DeviceMemory);
    fn map_memory(&self, mem: vk::DeviceMemory, offset: u64, size: u64) -> Result<*mut u8>;
    fn unmap_memory(&self, mem: vk::DeviceMemory);
    fn flush_mapped_range(&self, mem: vk::DeviceMemory, offset: u64, size: u64) -> Result<()>;
    fn invalidate_mapped_range(&self, mem: vk::DeviceMemory, offset: u64, size: u64)
        -> Result<()>;

    // ------------ buffers and images ------------
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        mem: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    /// Creates a linearly tiled image, suitable for staging
    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, mem: vk::DeviceMemory, offset: u64)
        -> Result<()>;

    // ------------ command buffers ------------
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    /// Also frees every command buffer allocated from `pool`
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()>;
    fn reset_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()>;
    fn cmd_begin_render_pass(
        &self,
        cbuf: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
    );
    fn cmd_end_render_pass(&self, cbuf: vk::CommandBuffer);
    fn cmd_set_viewport(&self, cbuf: vk::CommandBuffer, viewport: &vk::Viewport);
    fn cmd_set_scissor(&self, cbuf: vk::CommandBuffer, scissor: &vk::Rect2D);
    fn cmd_set_stencil_reference(&self, cbuf: vk::CommandBuffer, reference: u32);
    fn cmd_copy_buffer(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// Submit to the graphics queue
    ///
    /// `cbuf` may be None, in which case this only waits on
    /// `wait_semas` and signals `fence`/`signal_semas`.
    fn queue_submit(
        &self,
        cbuf: Option<vk::CommandBuffer>,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()>;

    // ------------ descriptors ------------
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Returns every set allocated from `pool`
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;

    fn wait_idle(&self) -> Result<()>;
}

/// Find a memory type matching `type_bits` that has all of `flags`
///
/// Shared by the backends and the memory manager.
pub(crate) fn find_memory_type_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for (i, mem_type) in props.memory_types[..props.memory_type_count as usize]
        .iter()
        .enumerate()
    {
        // Bit i of memory_type_bits is set if the resource supports
        // the ith memory type in props.
        if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
            return Some(i as u32);
        }
    }
    None
}
