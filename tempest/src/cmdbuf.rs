// Command buffer lifecycle
//
// Each CmdBuffer owns a fence for its whole life and walks this cycle:
//
//   ReadyForBegin -> Recording <-> InsideRenderPass
//                 -> Ended -> Submitted -> (fence signals) -> ReadyForBegin
//
// Every time the fence is observed signaled the buffer's
// fence_signaled_counter is bumped. Every other pool in the crate tags
// what it hands out with (cmd, counter) and treats
// `cmd.fence_signaled_counter() > counter` as "the GPU is done with it".
use crate::backend::Backend;
use crate::fence::{FenceId, FenceManager};
use crate::{lock, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdBufferState {
    ReadyForBegin,
    /// Recording, outside of a render pass
    Recording,
    InsideRenderPass,
    Ended,
    Submitted,
}

/// Cached dynamic state so redundant sets can be skipped
#[derive(Default)]
struct DynamicState {
    viewport: Option<[f32; 6]>,
    scissor: Option<(i32, i32, u32, u32)>,
    stencil_ref: Option<u32>,
}

struct CmdBufferInternal {
    cbi_state: CmdBufferState,
    cbi_fence: FenceId,
    cbi_dynamic: DynamicState,
    /// Semaphores the next submission must wait on
    cbi_wait_semas: Vec<vk::Semaphore>,
    cbi_wait_stages: Vec<vk::PipelineStageFlags>,
}

/// A recordable command buffer
///
/// Not meant to be recorded from more than one thread at a time, the
/// internal lock only keeps the bookkeeping consistent.
pub struct CmdBuffer {
    cb_backend: Arc<dyn Backend>,
    cb_fences: Arc<FenceManager>,
    cb_handle: vk::CommandBuffer,
    cb_reuse_fence: bool,
    cb_fence_signaled_counter: AtomicU64,
    cb_internal: Mutex<CmdBufferInternal>,
}

impl CmdBuffer {
    fn new(
        backend: Arc<dyn Backend>,
        fences: Arc<FenceManager>,
        pool: vk::CommandPool,
        reuse_fence: bool,
    ) -> Result<Self> {
        let handle = backend.allocate_command_buffer(pool)?;
        let fence = fences.allocate_fence()?;

        Ok(Self {
            cb_backend: backend,
            cb_fences: fences,
            cb_handle: handle,
            cb_reuse_fence: reuse_fence,
            cb_fence_signaled_counter: AtomicU64::new(0),
            cb_internal: Mutex::new(CmdBufferInternal {
                cbi_state: CmdBufferState::ReadyForBegin,
                cbi_fence: fence,
                cbi_dynamic: DynamicState::default(),
                cbi_wait_semas: Vec::new(),
                cbi_wait_stages: Vec::new(),
            }),
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cb_handle
    }

    pub fn state(&self) -> CmdBufferState {
        lock(&self.cb_internal).cbi_state
    }

    /// The fence this buffer will signal on its next submission
    pub fn fence(&self) -> FenceId {
        lock(&self.cb_internal).cbi_fence
    }

    /// Number of times this buffer's fence has been observed signaled
    pub fn fence_signaled_counter(&self) -> u64 {
        self.cb_fence_signaled_counter.load(Ordering::Acquire)
    }

    /// Has the GPU finished the submission that was current when
    /// `counter` was read
    pub fn has_advanced_past(&self, counter: u64) -> bool {
        self.fence_signaled_counter() > counter
    }

    fn expect_state(internal: &CmdBufferInternal, state: CmdBufferState) -> Result<()> {
        if internal.cbi_state != state {
            return Err(TempestError::INVALID_CMD_BUFFER_STATE(
                internal.cbi_state,
                state,
            ));
        }
        Ok(())
    }

    fn expect_recording(internal: &CmdBufferInternal) -> Result<()> {
        match internal.cbi_state {
            CmdBufferState::Recording | CmdBufferState::InsideRenderPass => Ok(()),
            s => Err(TempestError::INVALID_CMD_BUFFER_STATE(
                s,
                CmdBufferState::Recording,
            )),
        }
    }

    pub fn begin(&self) -> Result<()> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_state(&internal, CmdBufferState::ReadyForBegin)?;
        self.cb_backend.begin_command_buffer(self.cb_handle)?;
        internal.cbi_state = CmdBufferState::Recording;
        Ok(())
    }

    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
    ) -> Result<()> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_state(&internal, CmdBufferState::Recording)?;
        self.cb_backend
            .cmd_begin_render_pass(self.cb_handle, render_pass, framebuffer, area);
        internal.cbi_state = CmdBufferState::InsideRenderPass;
        Ok(())
    }

    pub fn end_render_pass(&self) -> Result<()> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_state(&internal, CmdBufferState::InsideRenderPass)?;
        self.cb_backend.cmd_end_render_pass(self.cb_handle);
        internal.cbi_state = CmdBufferState::Recording;
        Ok(())
    }

    /// Finish recording. Must be outside a render pass.
    pub fn end(&self) -> Result<()> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_state(&internal, CmdBufferState::Recording)?;
        self.cb_backend.end_command_buffer(self.cb_handle)?;
        internal.cbi_state = CmdBufferState::Ended;
        Ok(())
    }

    /// Set the viewport, skipped if it is already current
    ///
    /// Returns true if a command was recorded.
    pub fn set_viewport(&self, viewport: &vk::Viewport) -> Result<bool> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_recording(&internal)?;
        let key = [
            viewport.x,
            viewport.y,
            viewport.width,
            viewport.height,
            viewport.min_depth,
            viewport.max_depth,
        ];
        if internal.cbi_dynamic.viewport == Some(key) {
            return Ok(false);
        }
        self.cb_backend.cmd_set_viewport(self.cb_handle, viewport);
        internal.cbi_dynamic.viewport = Some(key);
        Ok(true)
    }

    pub fn set_scissor(&self, scissor: &vk::Rect2D) -> Result<bool> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_recording(&internal)?;
        let key = (
            scissor.offset.x,
            scissor.offset.y,
            scissor.extent.width,
            scissor.extent.height,
        );
        if internal.cbi_dynamic.scissor == Some(key) {
            return Ok(false);
        }
        self.cb_backend.cmd_set_scissor(self.cb_handle, scissor);
        internal.cbi_dynamic.scissor = Some(key);
        Ok(true)
    }

    pub fn set_stencil_reference(&self, reference: u32) -> Result<bool> {
        let mut internal = lock(&self.cb_internal);
        Self::expect_recording(&internal)?;
        if internal.cbi_dynamic.stencil_ref == Some(reference) {
            return Ok(false);
        }
        self.cb_backend
            .cmd_set_stencil_reference(self.cb_handle, reference);
        internal.cbi_dynamic.stencil_ref = Some(reference);
        Ok(true)
    }

    /// Record a buffer to buffer copy. Not allowed inside a render pass.
    pub fn copy_buffer(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        let internal = lock(&self.cb_internal);
        Self::expect_state(&internal, CmdBufferState::Recording)?;
        self.cb_backend
            .cmd_copy_buffer(self.cb_handle, src, dst, regions);
        Ok(())
    }

    /// Make the next submission of this buffer wait on `sema`
    pub fn add_wait_semaphore(&self, sema: vk::Semaphore, stage: vk::PipelineStageFlags) {
        let mut internal = lock(&self.cb_internal);
        internal.cbi_wait_semas.push(sema);
        internal.cbi_wait_stages.push(stage);
    }

    /// Poll the fence of a submitted buffer
    ///
    /// If it signaled, the dynamic state caches are dropped, the fence
    /// and command buffer are reset, the counter is bumped and the buffer
    /// becomes ReadyForBegin. Buffers in any other state are untouched.
    pub fn refresh_fence_status(&self) -> Result<()> {
        let mut internal = lock(&self.cb_internal);
        if internal.cbi_state != CmdBufferState::Submitted {
            return Ok(());
        }
        if !self.cb_fences.is_signaled(internal.cbi_fence)? {
            return Ok(());
        }
        self.recycle(&mut internal)
    }

    fn recycle(&self, internal: &mut CmdBufferInternal) -> Result<()> {
        internal.cbi_dynamic = DynamicState::default();

        if self.cb_reuse_fence {
            self.cb_fences.reset_fence(internal.cbi_fence)?;
        } else {
            self.cb_fences.release_fence(internal.cbi_fence)?;
            internal.cbi_fence = self.cb_fences.allocate_fence()?;
        }
        self.cb_backend.reset_command_buffer(self.cb_handle)?;

        self.cb_fence_signaled_counter
            .fetch_add(1, Ordering::AcqRel);
        internal.cbi_state = CmdBufferState::ReadyForBegin;
        Ok(())
    }

    /// Block until this buffer's submission completes
    ///
    /// Returns false on timeout. A buffer that is not submitted returns
    /// true immediately.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        let fence = {
            let internal = lock(&self.cb_internal);
            if internal.cbi_state != CmdBufferState::Submitted {
                return Ok(true);
            }
            internal.cbi_fence
        };

        if !self.cb_fences.wait_for_fence(fence, timeout_ns)? {
            return Ok(false);
        }
        self.refresh_fence_status()?;
        Ok(true)
    }
}

impl Drop for CmdBuffer {
    fn drop(&mut self) {
        // The vk command buffer itself is freed with its pool
        let fence = lock(&self.cb_internal).cbi_fence;
        if let Err(e) = self.cb_fences.release_fence(fence) {
            log::debug!("Could not release command buffer fence: {}", e);
        }
    }
}

/// The graphics queue
///
/// The only place a command buffer becomes Submitted.
pub struct Queue {
    q_backend: Arc<dyn Backend>,
    q_fences: Arc<FenceManager>,
    q_family: u32,
    q_submit_counter: AtomicU64,
}

impl Queue {
    pub fn new(backend: Arc<dyn Backend>, fences: Arc<FenceManager>) -> Self {
        let family = backend.properties().graphics_queue_family;
        Self {
            q_backend: backend,
            q_fences: fences,
            q_family: family,
            q_submit_counter: AtomicU64::new(0),
        }
    }

    pub fn family(&self) -> u32 {
        self.q_family
    }

    /// Total number of submissions made on this queue
    pub fn submit_counter(&self) -> u64 {
        self.q_submit_counter.load(Ordering::Acquire)
    }

    /// Submit an Ended command buffer
    ///
    /// The buffer signals its own fence. `wait` is added to any waits
    /// registered on the buffer with `add_wait_semaphore`.
    pub fn submit(
        &self,
        cmd: &CmdBuffer,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        let mut internal = lock(&cmd.cb_internal);
        CmdBuffer::expect_state(&internal, CmdBufferState::Ended)?;

        let fence = self.q_fences.handle(internal.cbi_fence)?;
        let mut wait_semas = internal.cbi_wait_semas.clone();
        let mut wait_stages = internal.cbi_wait_stages.clone();
        for (sema, stage) in wait.iter() {
            wait_semas.push(*sema);
            wait_stages.push(*stage);
        }

        self.q_backend.queue_submit(
            Some(cmd.cb_handle),
            wait_semas.as_slice(),
            wait_stages.as_slice(),
            signal,
            fence,
        )?;

        // Registered waits are consumed only by a successful submission
        internal.cbi_wait_semas.clear();
        internal.cbi_wait_stages.clear();
        internal.cbi_state = CmdBufferState::Submitted;
        self.q_submit_counter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// A submission with no command buffer, only synchronization
    ///
    /// Used for presentation, `fence` may be null.
    pub fn submit_empty(
        &self,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let (semas, stages): (Vec<_>, Vec<_>) = wait.iter().cloned().unzip();
        self.q_backend.queue_submit(
            None,
            semas.as_slice(),
            stages.as_slice(),
            signal,
            fence,
        )?;
        self.q_submit_counter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A driver command pool and the command buffers allocated from it
pub struct CommandBufferPool {
    cp_backend: Arc<dyn Backend>,
    cp_fences: Arc<FenceManager>,
    cp_handle: vk::CommandPool,
    cp_reuse_fences: bool,
    cp_cmd_buffers: Vec<Arc<CmdBuffer>>,
}

impl CommandBufferPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        fences: Arc<FenceManager>,
        queue_family: u32,
        reuse_fences: bool,
    ) -> Result<Self> {
        let handle = backend.create_command_pool(queue_family)?;
        Ok(Self {
            cp_backend: backend,
            cp_fences: fences,
            cp_handle: handle,
            cp_reuse_fences: reuse_fences,
            cp_cmd_buffers: Vec::new(),
        })
    }

    /// Add a new command buffer (and its fence) to the pool
    pub fn create(&mut self) -> Result<Arc<CmdBuffer>> {
        let cmd = Arc::new(CmdBuffer::new(
            self.cp_backend.clone(),
            self.cp_fences.clone(),
            self.cp_handle,
            self.cp_reuse_fences,
        )?);
        self.cp_cmd_buffers.push(cmd.clone());
        log::debug!(
            "Created command buffer #{} in pool",
            self.cp_cmd_buffers.len()
        );
        Ok(cmd)
    }

    pub fn refresh_fence_status(&self) -> Result<()> {
        for cmd in self.cp_cmd_buffers.iter() {
            cmd.refresh_fence_status()?;
        }
        Ok(())
    }

    /// First buffer in ReadyForBegin that is not `skip`
    pub fn find_ready(&self, skip: Option<&Arc<CmdBuffer>>) -> Option<Arc<CmdBuffer>> {
        self.cp_cmd_buffers
            .iter()
            .filter(|cmd| match skip {
                Some(s) => !Arc::ptr_eq(cmd, s),
                None => true,
            })
            .find(|cmd| cmd.state() == CmdBufferState::ReadyForBegin)
            .cloned()
    }

    pub fn cmd_buffers(&self) -> &[Arc<CmdBuffer>] {
        self.cp_cmd_buffers.as_slice()
    }

    pub fn num_cmd_buffers(&self) -> usize {
        self.cp_cmd_buffers.len()
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        self.cp_cmd_buffers.clear();
        self.cp_backend.destroy_command_pool(self.cp_handle);
    }
}

/// One recording context
///
/// Tracks the active graphics buffer and an optional upload buffer used
/// for resource initialization. The upload buffer is always submitted
/// before the active buffer so initialization lands first.
pub struct CommandBufferManager {
    cm_queue: Arc<Queue>,
    cm_pool: CommandBufferPool,
    cm_active: Option<Arc<CmdBuffer>>,
    cm_upload: Option<Arc<CmdBuffer>>,
    cm_fence_timeout_ns: u64,
}

impl CommandBufferManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        fences: Arc<FenceManager>,
        queue: Arc<Queue>,
        reuse_fences: bool,
        fence_timeout_ns: u64,
    ) -> Result<Self> {
        let pool = CommandBufferPool::new(backend, fences, queue.family(), reuse_fences)?;
        Ok(Self {
            cm_queue: queue,
            cm_pool: pool,
            cm_active: None,
            cm_upload: None,
            cm_fence_timeout_ns: fence_timeout_ns,
        })
    }

    pub fn pool(&self) -> &CommandBufferPool {
        &self.cm_pool
    }

    pub fn num_cmd_buffers(&self) -> usize {
        self.cm_pool.num_cmd_buffers()
    }

    pub fn has_pending_upload(&self) -> bool {
        self.cm_upload.is_some()
    }

    /// The buffer currently being recorded
    ///
    /// Any pending upload buffer is submitted first. If there is no
    /// active buffer one is prepared.
    pub fn get_active_cmd_buffer(&mut self) -> Result<Arc<CmdBuffer>> {
        if self.cm_upload.is_some() {
            self.submit_upload_cmd_buffer(false)?;
        }
        self.prepare_for_new_active_command_buffer()
    }

    /// A buffer for resource initialization, begun and ready to record
    pub fn get_upload_cmd_buffer(&mut self) -> Result<Arc<CmdBuffer>> {
        if let Some(upload) = self.cm_upload.as_ref() {
            return Ok(upload.clone());
        }

        self.cm_pool.refresh_fence_status()?;
        let cmd = match self.cm_pool.find_ready(self.cm_active.as_ref()) {
            Some(cmd) => cmd,
            None => self.cm_pool.create()?,
        };
        cmd.begin()?;
        self.cm_upload = Some(cmd.clone());
        Ok(cmd)
    }

    /// Make sure there is an active buffer in the Recording state
    ///
    /// An active buffer that has not been submitted yet is returned
    /// as is. Otherwise the pool is refreshed and the first free buffer
    /// is reused, or a new one is created. This never blocks waiting for
    /// the GPU, so the pool grows when the GPU falls behind.
    pub fn prepare_for_new_active_command_buffer(&mut self) -> Result<Arc<CmdBuffer>> {
        if let Some(active) = self.cm_active.as_ref() {
            return Ok(active.clone());
        }

        self.cm_pool.refresh_fence_status()?;
        let cmd = match self.cm_pool.find_ready(self.cm_upload.as_ref()) {
            Some(cmd) => cmd,
            None => self.cm_pool.create()?,
        };
        cmd.begin()?;
        self.cm_active = Some(cmd.clone());
        Ok(cmd)
    }

    /// End and submit `cmd`
    ///
    /// A buffer left Ended by an earlier failed queue submission is not
    /// ended again.
    fn end_and_submit(
        &self,
        cmd: &Arc<CmdBuffer>,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        if cmd.state() != CmdBufferState::Ended {
            cmd.end()?;
        }
        self.cm_queue.submit(cmd, wait, signal)
    }

    fn finish_submission(&self, cmd: &Arc<CmdBuffer>, wait_for_fence: bool) -> Result<()> {
        if wait_for_fence && !self.wait_for_cmd_buffer(cmd, self.cm_fence_timeout_ns)? {
            log::error!("Timed out waiting for a required submission, assuming the GPU hung");
            return Err(TempestError::TIMEOUT);
        }
        Ok(())
    }

    /// Submit the pending upload buffer, if any
    ///
    /// The buffer stays the pending upload buffer until it has been
    /// handed to the queue, so a failed submission can be retried.
    pub fn submit_upload_cmd_buffer(&mut self, wait_for_fence: bool) -> Result<()> {
        let upload = match self.cm_upload.as_ref() {
            Some(upload) => upload.clone(),
            None => return Ok(()),
        };
        self.end_and_submit(&upload, &[], &[])?;
        self.cm_upload = None;
        self.finish_submission(&upload, wait_for_fence)
    }

    /// Submit the active buffer, flushing uploads first
    pub fn submit_active_cmd_buffer(&mut self, wait_for_fence: bool) -> Result<()> {
        self.submit_active_cmd_buffer_with(&[], &[], wait_for_fence)
    }

    /// Submit the active buffer with explicit semaphores
    ///
    /// Used when presenting: wait on the image acquire, signal render
    /// completion. On error the buffer stays active.
    pub fn submit_active_cmd_buffer_with(
        &mut self,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
        wait_for_fence: bool,
    ) -> Result<()> {
        self.submit_upload_cmd_buffer(false)?;

        let active = match self.cm_active.as_ref() {
            Some(active) => active.clone(),
            None => return Ok(()),
        };
        self.end_and_submit(&active, wait, signal)?;
        self.cm_active = None;
        self.finish_submission(&active, wait_for_fence)
    }

    /// Block until `cmd` completes or `timeout_ns` passes
    pub fn wait_for_cmd_buffer(&self, cmd: &CmdBuffer, timeout_ns: u64) -> Result<bool> {
        cmd.wait(timeout_ns)
    }

    /// Poll every buffer in the pool
    pub fn refresh_fence_status(&self) -> Result<()> {
        self.cm_pool.refresh_fence_status()
    }

    /// Wait on everything this context submitted
    pub fn wait_all(&self, timeout_ns: u64) -> Result<bool> {
        for cmd in self.cm_pool.cmd_buffers().iter() {
            if !cmd.wait(timeout_ns)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
