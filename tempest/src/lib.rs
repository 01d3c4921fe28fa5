//! # Tempest: GPU resource and submission lifetime tracking
//!
//! Tempest sits between a renderer and an explicit graphics API. It hands
//! out command buffers, device memory, staging resources, transient ring
//! memory and descriptor sets, and it tracks every one of them so nothing
//! is reused or destroyed while the GPU may still be reading it.
//!
//! The tracking is done with generation counters instead of callbacks.
//! Each command buffer owns a fence and a `fence_signaled_counter` which
//! is bumped every time that fence is observed signaled. Anything handed
//! to the GPU is tagged with `(cmd, counter)` and becomes reusable once
//! `cmd.fence_signaled_counter() > counter`.
//!
//! ## Frame flow
//!
//! * Grab the active command buffer (`Device::get_active_cmd_buffer`)
//! * Request descriptor sets, staging buffers and uniform ring memory
//!   while recording
//! * Submit (`Device::submit_active_cmd_buffer`)
//! * Call `Device::end_frame` once per frame, which reclaims everything
//!   whose fence has advanced
//!
//! ```no_run
//! use tempest as tp;
//!
//! let info = tp::CreateInfo::builder()
//!     .backend(tp::BackendType::Headless(tp::HeadlessConfig::default()))
//!     .build();
//! let dev = tp::Device::new(&info).unwrap();
//!
//! let cmd = dev.get_active_cmd_buffer().unwrap();
//! let staging = dev
//!     .acquire_staging_buffer(4096, tp::vk::BufferUsageFlags::TRANSFER_SRC, false)
//!     .unwrap();
//! staging.write(0, &[1, 2, 3, 4]).unwrap();
//! dev.release_staging_buffer(&cmd, staging);
//!
//! dev.submit_active_cmd_buffer(false).unwrap();
//! dev.end_frame().unwrap();
//! ```
//!
//! ## Backends
//!
//! All driver calls go through the `Backend` trait. `VkBackend` talks to
//! a Vulkan 1.2 driver through ash, `HeadlessBackend` simulates a GPU in
//! host memory and is what the tests run against.

#![allow(non_camel_case_types)]

mod backend;
mod cmdbuf;
mod deletion_queue;
mod descpool;
mod device;
mod fence;
mod memory;
mod ring;
mod staging;
mod swapchain;

pub use backend::headless::{HeadlessBackend, HeadlessConfig};
pub use backend::vulkan::VkBackend;
pub use backend::{Backend, DeviceProperties};
pub use cmdbuf::{CmdBuffer, CmdBufferState, CommandBufferManager, CommandBufferPool, Queue};
pub use deletion_queue::DeferredDeletionQueue;
pub use descpool::{
    DescriptorCounts, DescriptorKind, DescriptorPool, DescriptorPoolReport, DescriptorPoolSet,
    DescriptorSetAllocator, DescriptorSetsLayout, LayoutShape,
};
pub use device::{Device, MemoryReport};
pub use fence::{FenceId, FenceManager, FenceState};
pub use memory::heap::{
    BufferSuballocation, HeapReport, PageId, ResourceAllocation, ResourceHeap,
    ResourceHeapManager, ResourceHeapPage,
};
pub use memory::{DeviceMemoryAllocation, DeviceMemoryManager, DeviceMemoryReport};
pub use ring::{RingBuffer, UniformAllocation, UniformBufferUploader};
pub use staging::{StagingBuffer, StagingImage, StagingManager, StagingReport};
pub use swapchain::{AcquiredImage, HeadlessSwapchain, Swapchain};

/// Re-exported so callers name the same handle types we do
pub use ash::vk;

#[macro_use]
extern crate lazy_static;
extern crate utils as tp_utils;

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempestError {
    #[error("Ran out of device memory")]
    OUT_OF_MEMORY,
    #[error("Could not create or allocate from a descriptor pool")]
    DESCRIPTOR_POOL_EXHAUSTED,
    #[error("The GPU device was lost")]
    DEVICE_LOST,
    #[error("Timed out waiting on the GPU")]
    TIMEOUT,
    #[error("Command buffer is in state {0:?} but {1:?} is required")]
    INVALID_CMD_BUFFER_STATE(CmdBufferState, CmdBufferState),
    #[error("Fence has not been signaled")]
    FENCE_NOT_SIGNALED,
    #[error("Device memory is already mapped")]
    MEMORY_ALREADY_MAPPED,
    #[error("Device memory is not mapped")]
    MEMORY_NOT_MAPPED,
    #[error("Device memory is not host visible")]
    MEMORY_NOT_HOST_VISIBLE,
    #[error("Could not find a memory type matching the requirements")]
    NO_MATCHING_MEMORY_TYPE,
    #[error("Ring buffer region is still in use by the GPU")]
    RING_BUFFER_IN_FLIGHT,
    #[error("Invalid allocation size")]
    INVALID_SIZE,
    #[error("Descriptor layout exceeds the device limits")]
    DESCRIPTOR_LIMITS_EXCEEDED,
    #[error("Handle does not refer to a live resource")]
    UNKNOWN_RESOURCE,
    #[error("Could not load the Vulkan library")]
    VK_LOADING_FAILED,
    #[error("Could not find a suitable GPU")]
    NO_SUITABLE_DEVICE,
    #[error("Vulkan call failed with {0:?}")]
    VK_ERROR(vk::Result),
    #[error("Invalid operation")]
    INVALID,
}

impl TempestError {
    /// Errors that leave no safe way to continue the frame
    ///
    /// Resource exhaustion, device loss and hung waits on required
    /// synchronization points. Callers are expected to tear down.
    pub fn is_fatal(&self) -> bool {
        match self {
            TempestError::OUT_OF_MEMORY
            | TempestError::DESCRIPTOR_POOL_EXHAUSTED
            | TempestError::DEVICE_LOST
            | TempestError::TIMEOUT => true,
            _ => false,
        }
    }
}

impl From<vk::Result> for TempestError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_DEVICE_LOST => TempestError::DEVICE_LOST,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => TempestError::OUT_OF_MEMORY,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                TempestError::DESCRIPTOR_POOL_EXHAUSTED
            }
            vk::Result::TIMEOUT => TempestError::TIMEOUT,
            other => TempestError::VK_ERROR(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TempestError>;

/// Anything that can be handed to the deferred deletion queue
///
/// The queue only holds a reference, dropping the last one is what
/// destroys the resource.
pub trait Droppable {}
impl<T: ?Sized> Droppable for T {}

/// Lock a mutex, recovering the data if another thread panicked with it
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Round `val` up to the next multiple of `alignment`
///
/// An alignment of 0 is treated as 1.
pub(crate) fn align_up(val: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    (val + alignment - 1) / alignment * alignment
}

/// Which driver implementation a Device talks to
pub enum BackendType {
    /// A real GPU through the Vulkan loader
    Vulkan,
    /// A simulated GPU in host memory
    Headless(HeadlessConfig),
}

/// How descriptor pools are carved up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPoolStrategy {
    /// One chain of pools per layout shape. Each pool holds
    /// `allocations_per_pool` allocations of that exact shape.
    PerLayout { allocations_per_pool: u32 },
    /// One chain of big pools shared by every shape
    Monolithic {
        max_sets: u32,
        descriptors_per_kind: u32,
    },
}

/// Parameters for Device creation.
pub struct CreateInfo {
    pub backend: BackendType,
    /// Request the Khronos validation layers. Vulkan only.
    pub enable_validation: bool,
    /// Reset and reuse a command buffer's fence once it signals. If
    /// false the fence goes back to the FenceManager and a new one is
    /// allocated.
    pub reuse_fences: bool,
    /// Default page size of the device local heap
    pub gpu_page_size: u64,
    /// Default page size of the persistently mapped staging heap
    pub upload_page_size: u64,
    /// Frames a vacated heap page stays around before it is freed
    pub page_lifetime_frames: u64,
    /// Frames an unused staging resource stays in the free list
    pub staging_lifetime_frames: u64,
    /// Max number of reclamation work items processed per frame
    pub reclaim_batch_size: usize,
    pub descriptor_strategy: DescriptorPoolStrategy,
    /// Size of the uniform upload ring
    pub uniform_ring_size: u64,
    /// Hang detection ceiling for the waits tempest issues itself
    pub fence_timeout_ns: u64,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                backend: BackendType::Vulkan,
                enable_validation: cfg!(debug_assertions),
                reuse_fences: true,
                gpu_page_size: 64 * 1024 * 1024,
                upload_page_size: 16 * 1024 * 1024,
                page_lifetime_frames: 30,
                staging_lifetime_frames: 30,
                reclaim_batch_size: 64,
                descriptor_strategy: DescriptorPoolStrategy::PerLayout {
                    allocations_per_pool: 8,
                },
                uniform_ring_size: 4 * 1024 * 1024,
                fence_timeout_ns: 30 * 1_000_000_000,
            },
        }
    }
}

/// Implements the builder pattern for easier Device creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn backend(mut self, ty: BackendType) -> Self {
        self.ci.backend = ty;
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.ci.enable_validation = enable;
        self
    }

    pub fn reuse_fences(mut self, reuse: bool) -> Self {
        self.ci.reuse_fences = reuse;
        self
    }

    pub fn gpu_page_size(mut self, size: u64) -> Self {
        self.ci.gpu_page_size = size;
        self
    }

    pub fn upload_page_size(mut self, size: u64) -> Self {
        self.ci.upload_page_size = size;
        self
    }

    pub fn page_lifetime_frames(mut self, frames: u64) -> Self {
        self.ci.page_lifetime_frames = frames;
        self
    }

    pub fn staging_lifetime_frames(mut self, frames: u64) -> Self {
        self.ci.staging_lifetime_frames = frames;
        self
    }

    pub fn reclaim_batch_size(mut self, size: usize) -> Self {
        self.ci.reclaim_batch_size = size;
        self
    }

    pub fn descriptor_strategy(mut self, strategy: DescriptorPoolStrategy) -> Self {
        self.ci.descriptor_strategy = strategy;
        self
    }

    pub fn uniform_ring_size(mut self, size: u64) -> Self {
        self.ci.uniform_ring_size = size;
        self
    }

    pub fn fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.ci.fence_timeout_ns = timeout;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// User overrides from the environment, read once per process
struct EnvOverrides {
    force_headless: bool,
    reuse_fences: Option<bool>,
    fence_timeout_ns: Option<u64>,
}

impl EnvOverrides {
    /// Parse the overrides, `var` looks up one variable by name
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            force_headless: var("TEMPEST_HEADLESS_BACKEND").is_some(),
            reuse_fences: var("TEMPEST_REUSE_FENCES").map(|v| v.trim() != "0"),
            fence_timeout_ns: var("TEMPEST_FENCE_TIMEOUT_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|ms| ms.saturating_mul(1_000_000)),
        }
    }
}

lazy_static! {
    static ref ENV_OVERRIDES: EnvOverrides =
        EnvOverrides::from_vars(|name| std::env::var(name).ok());
}

impl CreateInfo {
    /// Whether the headless backend should be used regardless of `backend`
    pub(crate) fn headless_forced() -> bool {
        ENV_OVERRIDES.force_headless
    }

    pub(crate) fn effective_reuse_fences(&self) -> bool {
        ENV_OVERRIDES.reuse_fences.unwrap_or(self.reuse_fences)
    }

    pub(crate) fn effective_fence_timeout_ns(&self) -> u64 {
        ENV_OVERRIDES.fence_timeout_ns.unwrap_or(self.fence_timeout_ns)
    }
}
