/// Swapchain interface
///
/// Platform surfaces are not handled here. A swapchain only needs the
/// queue and the backend's semaphore and fence primitives, it does not
/// use the fence pool.
use crate::backend::Backend;
use crate::cmdbuf::Queue;
use crate::{Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::sync::Arc;

/// An image handed out by `acquire_next_image`
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub index: u32,
    /// Signaled when the image can be rendered to. Rendering should wait
    /// on it. Null for swapchains without a surface, which only hand out
    /// images that are already free.
    pub acquire_semaphore: vk::Semaphore,
    /// Rendering should signal this, presentation waits on it
    pub present_semaphore: vk::Semaphore,
}

pub trait Swapchain {
    fn image_count(&self) -> u32;

    /// Get the next image to render to
    ///
    /// Blocks until the image is free. Timing out here means the GPU is
    /// hung and is reported as TIMEOUT.
    fn acquire_next_image(&mut self) -> Result<AcquiredImage>;

    /// Queue `index` for presentation once `wait` is signaled
    fn present(&mut self, queue: &Queue, index: u32, wait: &[vk::Semaphore]) -> Result<()>;
}

struct HeadlessImage {
    hi_present_sema: vk::Semaphore,
    /// Signaled while the image is free to be acquired
    hi_fence: vk::Fence,
}

/// A swapchain with no surface
///
/// Images are recycled round robin, and an image can only be acquired
/// again once its last presentation has completed.
pub struct HeadlessSwapchain {
    hs_backend: Arc<dyn Backend>,
    hs_images: Vec<HeadlessImage>,
    hs_next: u32,
    hs_timeout_ns: u64,
}

impl HeadlessSwapchain {
    pub fn new(backend: Arc<dyn Backend>, image_count: u32, timeout_ns: u64) -> Result<Self> {
        let mut ret = Self {
            hs_backend: backend,
            hs_images: Vec::new(),
            hs_next: 0,
            hs_timeout_ns: timeout_ns,
        };

        for _ in 0..image_count.max(1) {
            let present = ret.hs_backend.create_semaphore()?;
            let fence = match ret.hs_backend.create_fence(true) {
                Ok(f) => f,
                Err(e) => {
                    ret.hs_backend.destroy_semaphore(present);
                    return Err(e);
                }
            };
            ret.hs_images.push(HeadlessImage {
                hi_present_sema: present,
                hi_fence: fence,
            });
        }

        Ok(ret)
    }
}

impl Swapchain for HeadlessSwapchain {
    fn image_count(&self) -> u32 {
        self.hs_images.len() as u32
    }

    fn acquire_next_image(&mut self) -> Result<AcquiredImage> {
        let index = self.hs_next;
        let image = &self.hs_images[index as usize];

        if !self
            .hs_backend
            .wait_for_fence(image.hi_fence, self.hs_timeout_ns)?
        {
            log::error!(
                "Timed out acquiring swapchain image {} after {} ns",
                index,
                self.hs_timeout_ns
            );
            return Err(TempestError::TIMEOUT);
        }
        self.hs_backend.reset_fence(image.hi_fence)?;

        self.hs_next = (index + 1) % self.hs_images.len() as u32;
        log::debug!("Acquired swapchain image {}", index);

        Ok(AcquiredImage {
            index: index,
            acquire_semaphore: vk::Semaphore::null(),
            present_semaphore: image.hi_present_sema,
        })
    }

    fn present(&mut self, queue: &Queue, index: u32, wait: &[vk::Semaphore]) -> Result<()> {
        let image = self
            .hs_images
            .get(index as usize)
            .ok_or(TempestError::UNKNOWN_RESOURCE)?;

        let waits: Vec<_> = wait
            .iter()
            .map(|s| (*s, vk::PipelineStageFlags::BOTTOM_OF_PIPE))
            .collect();
        // Without a display, "scanout" is done once the wait completes.
        // The image's fence tracks that and frees it for acquisition.
        queue.submit_empty(waits.as_slice(), &[], image.hi_fence)
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        for image in self.hs_images.drain(..) {
            self.hs_backend.destroy_fence(image.hi_fence);
            self.hs_backend.destroy_semaphore(image.hi_present_sema);
        }
    }
}
