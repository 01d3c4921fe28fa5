// Fence pooling
//
// Fences are created on demand and recycled through a free list. They
// are referred to by index into the manager's arena, command buffers
// only ever hold a FenceId.
use crate::backend::Backend;
use crate::{lock, Result, TempestError};
use ash::vk;
use tp_utils::log;
use tp_utils::timing::StopWatch;

use std::sync::{Arc, Mutex};

/// Index of a fence owned by a FenceManager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    NotReady,
    Signaled,
}

struct Fence {
    f_handle: vk::Fence,
    f_state: FenceState,
    /// false while sitting in the free list
    f_in_use: bool,
}

struct FenceManagerInternal {
    fm_fences: Vec<Fence>,
    fm_free: Vec<FenceId>,
}

impl FenceManagerInternal {
    fn get(&self, id: FenceId) -> Result<&Fence> {
        match self.fm_fences.get(id.0) {
            Some(f) if f.f_in_use => Ok(f),
            _ => Err(TempestError::UNKNOWN_RESOURCE),
        }
    }

    fn get_mut(&mut self, id: FenceId) -> Result<&mut Fence> {
        match self.fm_fences.get_mut(id.0) {
            Some(f) if f.f_in_use => Ok(f),
            _ => Err(TempestError::UNKNOWN_RESOURCE),
        }
    }
}

/// Owner of every fence used by command buffers
pub struct FenceManager {
    fm_backend: Arc<dyn Backend>,
    fm_internal: Mutex<FenceManagerInternal>,
}

impl FenceManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            fm_backend: backend,
            fm_internal: Mutex::new(FenceManagerInternal {
                fm_fences: Vec::new(),
                fm_free: Vec::new(),
            }),
        }
    }

    /// Get an unsignaled fence, reusing a free one if possible
    pub fn allocate_fence(&self) -> Result<FenceId> {
        let mut internal = lock(&self.fm_internal);

        if let Some(id) = internal.fm_free.pop() {
            let fence = &mut internal.fm_fences[id.0];
            fence.f_in_use = true;
            fence.f_state = FenceState::NotReady;
            return Ok(id);
        }

        let handle = self.fm_backend.create_fence(false)?;
        internal.fm_fences.push(Fence {
            f_handle: handle,
            f_state: FenceState::NotReady,
            f_in_use: true,
        });
        log::debug!("Created fence #{}", internal.fm_fences.len());

        Ok(FenceId(internal.fm_fences.len() - 1))
    }

    pub fn handle(&self, id: FenceId) -> Result<vk::Fence> {
        Ok(lock(&self.fm_internal).get(id)?.f_handle)
    }

    /// The last state we observed. Does not poll.
    pub fn state(&self, id: FenceId) -> Result<FenceState> {
        Ok(lock(&self.fm_internal).get(id)?.f_state)
    }

    /// Poll the GPU without blocking
    ///
    /// A signaled result is cached until the fence is reset.
    pub fn is_signaled(&self, id: FenceId) -> Result<bool> {
        let mut internal = lock(&self.fm_internal);
        let fence = internal.get_mut(id)?;

        if fence.f_state == FenceState::Signaled {
            return Ok(true);
        }
        if self.fm_backend.get_fence_status(fence.f_handle)? {
            fence.f_state = FenceState::Signaled;
            return Ok(true);
        }
        Ok(false)
    }

    /// Block for up to `timeout_ns` waiting on the fence
    ///
    /// Returns false on timeout. Errors from the wait itself mean the
    /// device is gone.
    pub fn wait_for_fence(&self, id: FenceId, timeout_ns: u64) -> Result<bool> {
        let handle = {
            let internal = lock(&self.fm_internal);
            let fence = internal.get(id)?;
            if fence.f_state == FenceState::Signaled {
                return Ok(true);
            }
            fence.f_handle
        };

        // Don't hold the lock while blocked on the GPU
        let mut sw = StopWatch::new();
        sw.start();
        let signaled = self.fm_backend.wait_for_fence(handle, timeout_ns)?;
        sw.end();

        if !signaled {
            log::warn!(
                "Fence wait timed out after {:?} (timeout {} ns)",
                sw.get_duration(),
                timeout_ns
            );
            return Ok(false);
        }

        lock(&self.fm_internal).get_mut(id)?.f_state = FenceState::Signaled;
        Ok(true)
    }

    /// Return a signaled fence to NotReady
    pub fn reset_fence(&self, id: FenceId) -> Result<()> {
        let mut internal = lock(&self.fm_internal);
        Self::reset_internal(&self.fm_backend, internal.get_mut(id)?)
    }

    fn reset_internal(backend: &Arc<dyn Backend>, fence: &mut Fence) -> Result<()> {
        if fence.f_state != FenceState::Signaled {
            return Err(TempestError::FENCE_NOT_SIGNALED);
        }
        backend.reset_fence(fence.f_handle)?;
        fence.f_state = FenceState::NotReady;
        Ok(())
    }

    fn release_internal(&self, internal: &mut FenceManagerInternal, id: FenceId) -> Result<()> {
        let fence = internal.get_mut(id)?;

        // The GPU may have signaled it after our last poll
        if fence.f_state == FenceState::NotReady
            && self.fm_backend.get_fence_status(fence.f_handle)?
        {
            fence.f_state = FenceState::Signaled;
        }
        if fence.f_state == FenceState::Signaled {
            Self::reset_internal(&self.fm_backend, fence)?;
        }

        fence.f_in_use = false;
        internal.fm_free.push(id);
        Ok(())
    }

    /// Reset the fence if needed and put it back in the free list
    ///
    /// `id` is invalid afterwards.
    pub fn release_fence(&self, id: FenceId) -> Result<()> {
        let mut internal = lock(&self.fm_internal);
        self.release_internal(&mut internal, id)
    }

    /// Wait for the fence and release it, all under our lock
    ///
    /// If the wait times out the fence is kept, false is returned and
    /// `id` stays valid.
    pub fn wait_and_release_fence(&self, id: FenceId, timeout_ns: u64) -> Result<bool> {
        let mut internal = lock(&self.fm_internal);
        let fence = internal.get_mut(id)?;

        if fence.f_state != FenceState::Signaled {
            if !self.fm_backend.wait_for_fence(fence.f_handle, timeout_ns)? {
                log::warn!("Fence wait timed out, not releasing it");
                return Ok(false);
            }
            fence.f_state = FenceState::Signaled;
        }

        self.release_internal(&mut internal, id)?;
        Ok(true)
    }

    /// Number of fences handed out and not yet released
    pub fn num_used(&self) -> usize {
        let internal = lock(&self.fm_internal);
        internal.fm_fences.len() - internal.fm_free.len()
    }

    pub fn num_free(&self) -> usize {
        lock(&self.fm_internal).fm_free.len()
    }

    /// Number of driver fences ever created by this manager
    pub fn num_created(&self) -> usize {
        lock(&self.fm_internal).fm_fences.len()
    }
}

impl Drop for FenceManager {
    fn drop(&mut self) {
        let internal = lock(&self.fm_internal);
        for fence in internal.fm_fences.iter() {
            self.fm_backend.destroy_fence(fence.f_handle);
        }
    }
}
