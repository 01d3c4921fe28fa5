// Vulkan backend
//
// Talks to a real driver through ash. This holds the instance, the
// logical device and the one graphics queue everything is submitted on.
use super::{Backend, DeviceProperties};
use crate::{lock, CreateInfo, Result, TempestError};
use ash::extensions::ext;
use ash::{vk, Entry};
use tp_utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::sync::Mutex;

// Route validation messages to our logger at a matching level
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => {
            CStr::from_ptr(data.p_message).to_string_lossy().into_owned()
        }
        _ => String::from("<no message>"),
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {}", message_types, message);
    } else {
        log::trace!("[VK][{:?}] {}", message_types, message);
    }
    vk::FALSE
}

/// A Vulkan 1.2 device
pub struct VkBackend {
    /// the entry just loads function pointers from the dynamic library
    _vb_entry: Entry,
    vb_inst: ash::Instance,
    /// debug callback sugar, only present with validation enabled
    vb_debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    vb_dev: ash::Device,
    /// vkQueue is externally synchronized
    vb_queue: Mutex<vk::Queue>,
    vb_props: DeviceProperties,
}

impl VkBackend {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe { dr_loader.create_debug_utils_messenger(&debug_info, None)? };
        Ok((dr_loader, callback))
    }

    /// Is the Khronos validation layer installed
    #[allow(unused_unsafe)]
    fn validation_available(entry: &Entry, name: &CStr) -> bool {
        match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers
                .iter()
                .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == name),
            Err(_) => false,
        }
    }

    /// Choose a vkPhysicalDevice and graphics queue family index.
    ///
    /// Discrete GPUs win over everything else. Ties go to
    /// enumeration order.
    fn select_pdev(inst: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevices = unsafe { inst.enumerate_physical_devices()? };

        let mut candidates: Vec<(vk::PhysicalDevice, u32, bool)> = Vec::new();
        for pdev in pdevices.iter() {
            let family = unsafe { inst.get_physical_device_queue_family_properties(*pdev) }
                .iter()
                .position(|info| info.queue_flags.contains(vk::QueueFlags::GRAPHICS));

            if let Some(family) = family {
                let props = unsafe { inst.get_physical_device_properties(*pdev) };
                let discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
                candidates.push((*pdev, family as u32, discrete));
            }
        }

        candidates
            .iter()
            .find(|c| c.2)
            .or(candidates.first())
            .map(|c| (c.0, c.1))
            .ok_or(TempestError::NO_SUITABLE_DEVICE)
    }

    /// Destroy the instance and its debug messenger when `new` fails
    /// before a device exists
    fn destroy_instance(
        inst: &ash::Instance,
        debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    ) {
        unsafe {
            if let Some((loader, callback)) = debug {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            inst.destroy_instance(None);
        }
    }

    /// Create a new Vulkan backend
    ///
    /// This loads the Vulkan library, creates an instance (with
    /// validation if asked for and installed) and a logical device with
    /// a single graphics queue.
    pub fn new(info: &CreateInfo) -> Result<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            log::error!("Could not load the Vulkan library: {}", e);
            TempestError::VK_LOADING_FAILED
        })?;
        let app_name = CString::new("Tempest").or(Err(TempestError::INVALID))?;
        let validation_name =
            CString::new("VK_LAYER_KHRONOS_validation").or(Err(TempestError::INVALID))?;

        let enable_validation =
            info.enable_validation && Self::validation_available(&entry, &validation_name);
        if info.enable_validation && !enable_validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }

        let mut layer_names_raw = Vec::new();
        let mut extension_names_raw = Vec::new();
        if enable_validation {
            layer_names_raw.push(validation_name.as_ptr());
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let inst = unsafe { entry.create_instance(&create_info, None)? };

        let debug = match enable_validation {
            true => match Self::setup_debug(&entry, &inst) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    Self::destroy_instance(&inst, None);
                    return Err(e);
                }
            },
            false => None,
        };

        let (pdev, graphics_queue_family) = match Self::select_pdev(&inst) {
            Ok(found) => found,
            Err(e) => {
                Self::destroy_instance(&inst, debug);
                return Err(e);
            }
        };
        let pdev_props = unsafe { inst.get_physical_device_properties(pdev) };
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let device_name = unsafe { CStr::from_ptr(pdev_props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&priorities)
            .build()];
        let dev_create_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_infos);

        let dev = match unsafe { inst.create_device(pdev, &dev_create_info, None) } {
            Ok(dev) => dev,
            Err(e) => {
                log::error!("Could not create a logical device: {:?}", e);
                Self::destroy_instance(&inst, debug);
                return Err(e.into());
            }
        };
        let queue = unsafe { dev.get_device_queue(graphics_queue_family, 0) };

        log::info!(
            "Using GPU {} (max {} memory allocations)",
            device_name,
            pdev_props.limits.max_memory_allocation_count
        );

        Ok(Self {
            _vb_entry: entry,
            vb_inst: inst,
            vb_debug: debug,
            vb_dev: dev,
            vb_queue: Mutex::new(queue),
            vb_props: DeviceProperties {
                device_name: device_name,
                memory_properties: mem_props,
                limits: pdev_props.limits,
                graphics_queue_family: graphics_queue_family,
                is_unified_memory: pdev_props.device_type
                    == vk::PhysicalDeviceType::INTEGRATED_GPU,
            },
        })
    }
}

impl Backend for VkBackend {
    fn properties(&self) -> &DeviceProperties {
        &self.vb_props
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.vb_dev.create_fence(&info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.vb_dev.destroy_fence(fence, None) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.vb_dev.get_fence_status(fence)? })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.vb_dev.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.vb_dev.reset_fences(&[fence])? })
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.vb_dev.create_semaphore(&info, None)? })
    }

    fn destroy_semaphore(&self, sema: vk::Semaphore) {
        unsafe { self.vb_dev.destroy_semaphore(sema, None) }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        Ok(unsafe { self.vb_dev.allocate_memory(&alloc_info, None)? })
    }

    fn free_memory(&self, mem: vk::DeviceMemory) {
        unsafe { self.vb_dev.free_memory(mem, None) }
    }

    fn map_memory(&self, mem: vk::DeviceMemory, offset: u64, size: u64) -> Result<*mut u8> {
        let ptr = unsafe {
            self.vb_dev
                .map_memory(mem, offset, size, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr as *mut u8)
    }

    fn unmap_memory(&self, mem: vk::DeviceMemory) {
        unsafe { self.vb_dev.unmap_memory(mem) }
    }

    fn flush_mapped_range(&self, mem: vk::DeviceMemory, offset: u64, size: u64) -> Result<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(mem)
            .offset(offset)
            .size(size)
            .build();
        Ok(unsafe { self.vb_dev.flush_mapped_memory_ranges(&[range])? })
    }

    fn invalidate_mapped_range(
        &self,
        mem: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(mem)
            .offset(offset)
            .size(size)
            .build();
        Ok(unsafe { self.vb_dev.invalidate_mapped_memory_ranges(&[range])? })
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        Ok(unsafe { self.vb_dev.create_buffer(&create_info, None)? })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.vb_dev.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.vb_dev.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        mem: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        Ok(unsafe { self.vb_dev.bind_buffer_memory(buffer, mem, offset)? })
    }

    fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image> {
        let image_type = match extent.depth > 1 {
            true => vk::ImageType::TYPE_3D,
            false => vk::ImageType::TYPE_2D,
        };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Ok(unsafe { self.vb_dev.create_image(&create_info, None)? })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.vb_dev.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.vb_dev.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        mem: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        Ok(unsafe { self.vb_dev.bind_image_memory(image, mem, offset)? })
    }

    /// Command buffers are allocated from command pools. That's about
    /// all they do.
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        Ok(unsafe { self.vb_dev.create_command_pool(&pool_create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.vb_dev.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe { self.vb_dev.allocate_command_buffers(&cbuf_allocate_info)? }
            .into_iter()
            .next()
            .ok_or(TempestError::INVALID)
    }

    fn begin_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        // each recording is submitted once before being reset
        let record_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        Ok(unsafe { self.vb_dev.begin_command_buffer(cbuf, &record_info)? })
    }

    fn end_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.vb_dev.end_command_buffer(cbuf)? })
    }

    fn reset_command_buffer(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe {
            self.vb_dev
                .reset_command_buffer(cbuf, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?
        })
    }

    fn cmd_begin_render_pass(
        &self,
        cbuf: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
    ) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(area);
        unsafe {
            self.vb_dev
                .cmd_begin_render_pass(cbuf, &info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cbuf: vk::CommandBuffer) {
        unsafe { self.vb_dev.cmd_end_render_pass(cbuf) }
    }

    fn cmd_set_viewport(&self, cbuf: vk::CommandBuffer, viewport: &vk::Viewport) {
        unsafe { self.vb_dev.cmd_set_viewport(cbuf, 0, &[*viewport]) }
    }

    fn cmd_set_scissor(&self, cbuf: vk::CommandBuffer, scissor: &vk::Rect2D) {
        unsafe { self.vb_dev.cmd_set_scissor(cbuf, 0, &[*scissor]) }
    }

    fn cmd_set_stencil_reference(&self, cbuf: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.vb_dev
                .cmd_set_stencil_reference(cbuf, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        }
    }

    fn cmd_copy_buffer(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.vb_dev.cmd_copy_buffer(cbuf, src, dst, regions) }
    }

    fn queue_submit(
        &self,
        cbuf: Option<vk::CommandBuffer>,
        wait_semas: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semas: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let cbufs: Vec<vk::CommandBuffer> = cbuf.into_iter().collect();
        let submit_info = [vk::SubmitInfo::builder()
            .wait_semaphores(wait_semas)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(signal_semas)
            .build()];

        let queue = lock(&self.vb_queue);
        Ok(unsafe { self.vb_dev.queue_submit(*queue, &submit_info, fence)? })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        Ok(unsafe { self.vb_dev.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.vb_dev.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        // Sets are never freed individually, the whole pool is reset
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets);
        Ok(unsafe { self.vb_dev.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.vb_dev.destroy_descriptor_pool(pool, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        Ok(unsafe {
            self.vb_dev
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        })
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        Ok(unsafe { self.vb_dev.allocate_descriptor_sets(&info)? })
    }

    fn wait_idle(&self) -> Result<()> {
        // vkDeviceWaitIdle needs every queue externally synchronized
        let _queue = lock(&self.vb_queue);
        Ok(unsafe { self.vb_dev.device_wait_idle()? })
    }
}

impl Drop for VkBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.vb_dev.device_wait_idle() {
                log::error!("Could not idle the device during teardown: {:?}", e);
            }
            self.vb_dev.destroy_device(None);
            if let Some((loader, callback)) = self.vb_debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.vb_inst.destroy_instance(None);
        }
    }
}
