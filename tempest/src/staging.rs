// Staging resources
//
// Host visible buffers and images used to move data across the
// CPU/GPU boundary. They are pooled by exact shape. Releasing one only
// queues it, it becomes reusable once the command buffer it was
// released against has moved past its fence.
use crate::backend::Backend;
use crate::cmdbuf::CmdBuffer;
use crate::memory::heap::{BufferSuballocation, ResourceAllocation, ResourceHeapManager};
use crate::{lock, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::sync::{Arc, Mutex};

/// A host visible buffer
pub struct StagingBuffer {
    sb_buffer: BufferSuballocation,
    sb_cpu_read: bool,
}

impl StagingBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.sb_buffer.buffer()
    }

    pub fn size(&self) -> u64 {
        self.sb_buffer.size()
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.sb_buffer.usage()
    }

    /// Meant for GPU to CPU transfers
    pub fn is_cpu_read(&self) -> bool {
        self.sb_cpu_read
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.sb_buffer.mapped_ptr()
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.sb_buffer.write(offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.sb_buffer.read(offset, out)
    }

    pub fn flush_mapped_range(&self) -> Result<()> {
        self.sb_buffer.allocation().flush()
    }

    /// Call before reading back what the GPU wrote
    pub fn invalidate_mapped_range(&self) -> Result<()> {
        self.sb_buffer.allocation().invalidate()
    }

    fn matches(&self, size: u64, usage: vk::BufferUsageFlags, cpu_read: bool) -> bool {
        self.size() == size && self.usage() == usage && self.sb_cpu_read == cpu_read
    }
}

/// A host visible linear image
pub struct StagingImage {
    si_backend: Arc<dyn Backend>,
    si_image: vk::Image,
    si_format: vk::Format,
    si_extent: vk::Extent3D,
    si_allocation: Arc<ResourceAllocation>,
}

impl StagingImage {
    pub fn image(&self) -> vk::Image {
        self.si_image
    }

    pub fn format(&self) -> vk::Format {
        self.si_format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.si_extent
    }

    pub fn allocation(&self) -> &Arc<ResourceAllocation> {
        &self.si_allocation
    }

    fn matches(&self, format: vk::Format, extent: &vk::Extent3D) -> bool {
        self.si_format == format
            && self.si_extent.width == extent.width
            && self.si_extent.height == extent.height
            && self.si_extent.depth == extent.depth
    }
}

impl Drop for StagingImage {
    fn drop(&mut self) {
        self.si_backend.destroy_image(self.si_image);
    }
}

enum StagingResource {
    Buffer(StagingBuffer),
    Image(StagingImage),
}

struct PendingItem {
    pi_resource: StagingResource,
    pi_cmd: Arc<CmdBuffer>,
    pi_counter: u64,
}

struct FreeItem {
    fi_resource: StagingResource,
    fi_frame: u64,
}

struct StagingInternal {
    si_num_used: usize,
    si_peak_used: usize,
    si_pending: Vec<PendingItem>,
    si_free: Vec<FreeItem>,
}

/// Staging pool utilization
#[derive(Debug, Clone, Default)]
pub struct StagingReport {
    /// Acquired and not yet released
    pub num_used: usize,
    pub peak_used: usize,
    /// Released, waiting on the GPU
    pub num_pending: usize,
    pub num_free: usize,
    pub free_bytes: u64,
}

pub struct StagingManager {
    sm_backend: Arc<dyn Backend>,
    sm_heaps: Arc<ResourceHeapManager>,
    sm_lifetime_frames: u64,
    sm_batch_size: usize,
    sm_internal: Mutex<StagingInternal>,
}

impl StagingManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        heaps: Arc<ResourceHeapManager>,
        lifetime_frames: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            sm_backend: backend,
            sm_heaps: heaps,
            sm_lifetime_frames: lifetime_frames,
            sm_batch_size: batch_size,
            sm_internal: Mutex::new(StagingInternal {
                si_num_used: 0,
                si_peak_used: 0,
                si_pending: Vec::new(),
                si_free: Vec::new(),
            }),
        }
    }

    fn mark_used(internal: &mut StagingInternal) {
        internal.si_num_used += 1;
        internal.si_peak_used = internal.si_peak_used.max(internal.si_num_used);
    }

    /// Get a buffer of exactly `size` bytes with `usage`
    ///
    /// A free buffer of the same shape is reused if there is one.
    pub fn acquire_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        cpu_read: bool,
    ) -> Result<StagingBuffer> {
        if size == 0 {
            return Err(TempestError::INVALID_SIZE);
        }

        {
            let mut internal = lock(&self.sm_internal);
            let pos = internal.si_free.iter().position(|f| match &f.fi_resource {
                StagingResource::Buffer(b) => b.matches(size, usage, cpu_read),
                _ => false,
            });
            if let Some(i) = pos {
                let item = internal.si_free.swap_remove(i);
                if let StagingResource::Buffer(b) = item.fi_resource {
                    Self::mark_used(&mut internal);
                    return Ok(b);
                }
            }
        }

        // Create outside the lock, this can hit the driver
        let buffer = self.sm_heaps.allocate_buffer(size, usage, true)?;
        log::debug!(
            "Created staging buffer of {} bytes (cpu_read: {})",
            size,
            cpu_read
        );

        Self::mark_used(&mut lock(&self.sm_internal));
        Ok(StagingBuffer {
            sb_buffer: buffer,
            sb_cpu_read: cpu_read,
        })
    }

    /// Get a linear image of exactly this format and size
    pub fn acquire_image(
        &self,
        format: vk::Format,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<StagingImage> {
        let extent = vk::Extent3D {
            width: width,
            height: height,
            depth: depth.max(1),
        };

        {
            let mut internal = lock(&self.sm_internal);
            let pos = internal.si_free.iter().position(|f| match &f.fi_resource {
                StagingResource::Image(img) => img.matches(format, &extent),
                _ => false,
            });
            if let Some(i) = pos {
                let item = internal.si_free.swap_remove(i);
                if let StagingResource::Image(img) = item.fi_resource {
                    Self::mark_used(&mut internal);
                    return Ok(img);
                }
            }
        }

        let image = self.sm_backend.create_image(
            format,
            extent,
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let reqs = self.sm_backend.image_memory_requirements(image);
        let allocation = match self
            .sm_heaps
            .allocate_for_requirements(&reqs, true)
            .and_then(|alloc| {
                self.sm_backend
                    .bind_image_memory(image, alloc.memory(), alloc.offset())?;
                Ok(alloc)
            }) {
            Ok(a) => a,
            Err(e) => {
                self.sm_backend.destroy_image(image);
                return Err(e);
            }
        };
        log::debug!(
            "Created staging image {:?} {}x{}x{}",
            format,
            extent.width,
            extent.height,
            extent.depth
        );

        Self::mark_used(&mut lock(&self.sm_internal));
        Ok(StagingImage {
            si_backend: self.sm_backend.clone(),
            si_image: image,
            si_format: format,
            si_extent: extent,
            si_allocation: allocation,
        })
    }

    fn release(&self, cmd: &Arc<CmdBuffer>, resource: StagingResource) {
        let counter = cmd.fence_signaled_counter();
        let mut internal = lock(&self.sm_internal);
        internal.si_num_used = internal.si_num_used.saturating_sub(1);
        internal.si_pending.push(PendingItem {
            pi_resource: resource,
            pi_cmd: cmd.clone(),
            pi_counter: counter,
        });
    }

    /// Queue `buffer` for reuse once `cmd`'s current work completes
    pub fn release_buffer(&self, cmd: &Arc<CmdBuffer>, buffer: StagingBuffer) {
        self.release(cmd, StagingResource::Buffer(buffer))
    }

    pub fn release_image(&self, cmd: &Arc<CmdBuffer>, image: StagingImage) {
        self.release(cmd, StagingResource::Image(image))
    }

    /// Once per frame: recycle retired resources and trim stale ones
    ///
    /// At most the batch size worth of pending entries are moved to the
    /// free list. Free resources unused for the staging lifetime are
    /// destroyed. Returns the number of entries recycled.
    pub fn process_pending_free(&self, frame: u64) -> usize {
        let mut destroyed = Vec::new();
        let recycled;
        {
            let mut internal = lock(&self.sm_internal);

            let mut budget = self.sm_batch_size;
            let mut i = 0;
            while i < internal.si_pending.len() && budget > 0 {
                let item = &internal.si_pending[i];
                if item.pi_cmd.has_advanced_past(item.pi_counter) {
                    let item = internal.si_pending.remove(i);
                    internal.si_free.push(FreeItem {
                        fi_resource: item.pi_resource,
                        fi_frame: frame,
                    });
                    budget -= 1;
                } else {
                    i += 1;
                }
            }
            recycled = self.sm_batch_size - budget;

            let lifetime = self.sm_lifetime_frames;
            let mut j = internal.si_free.len();
            while j > 0 {
                j -= 1;
                if internal.si_free[j].fi_frame + lifetime < frame {
                    destroyed.push(internal.si_free.swap_remove(j));
                }
            }
        }

        if !destroyed.is_empty() {
            log::debug!("Destroying {} unused staging resources", destroyed.len());
        }
        recycled
    }

    /// Destroy everything in the free list and anything pending
    ///
    /// Only safe once all GPU work has been waited on.
    pub fn clear(&self) {
        let mut internal = lock(&self.sm_internal);
        let pending = std::mem::take(&mut internal.si_pending);
        let free = std::mem::take(&mut internal.si_free);
        drop(internal);
        drop(pending);
        drop(free);
    }

    pub fn dump_memory(&self) -> StagingReport {
        let internal = lock(&self.sm_internal);
        StagingReport {
            num_used: internal.si_num_used,
            peak_used: internal.si_peak_used,
            num_pending: internal.si_pending.len(),
            num_free: internal.si_free.len(),
            free_bytes: internal
                .si_free
                .iter()
                .map(|f| match &f.fi_resource {
                    StagingResource::Buffer(b) => b.size(),
                    StagingResource::Image(i) => i.si_allocation.size(),
                })
                .sum(),
        }
    }
}
