// Ring buffers for transient per-frame data
//
// A RingBuffer is one buffer with a cursor that only moves forward and
// wraps to 0 when a request does not fit at the end. Callers may tag
// what they have allocated with `fence_allocations(cmd)`, after which
// the ring refuses to hand those bytes out again until `cmd` has
// retired them.
use crate::backend::DeviceProperties;
use crate::cmdbuf::CmdBuffer;
use crate::memory::heap::{BufferSuballocation, ResourceHeapManager};
use crate::{align_up, lock, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// [start, end) of ring memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u64,
    end: u64,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

struct FencedSpan {
    fs_span: Span,
    fs_cmd: Arc<CmdBuffer>,
    fs_counter: u64,
}

struct RingInternal {
    ri_offset: u64,
    ri_wrap_count: u64,
    /// Allocated since the last fence_allocations
    ri_unfenced: Vec<Span>,
    /// Oldest first
    ri_fenced: VecDeque<FencedSpan>,
}

pub struct RingBuffer {
    rb_buffer: BufferSuballocation,
    rb_size: u64,
    rb_min_alignment: u64,
    rb_internal: Mutex<RingInternal>,
}

impl RingBuffer {
    /// Create a ring of `size` bytes
    ///
    /// `host_visible` rings live in the persistently mapped heap and can
    /// be written with `write`.
    pub fn new(
        heaps: &ResourceHeapManager,
        size: u64,
        usage: vk::BufferUsageFlags,
        min_alignment: u64,
        host_visible: bool,
    ) -> Result<Self> {
        let buffer = heaps.allocate_buffer(size, usage, host_visible)?;
        log::debug!(
            "Created {} ring buffer of {} bytes",
            match host_visible {
                true => "host",
                false => "device",
            },
            size
        );

        Ok(Self {
            rb_buffer: buffer,
            rb_size: size,
            rb_min_alignment: min_alignment.max(1),
            rb_internal: Mutex::new(RingInternal {
                ri_offset: 0,
                ri_wrap_count: 0,
                ri_unfenced: Vec::new(),
                ri_fenced: VecDeque::new(),
            }),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.rb_buffer.buffer()
    }

    pub fn size(&self) -> u64 {
        self.rb_size
    }

    /// Current cursor position
    pub fn offset(&self) -> u64 {
        lock(&self.rb_internal).ri_offset
    }

    pub fn wrap_count(&self) -> u64 {
        lock(&self.rb_internal).ri_wrap_count
    }

    /// Fenced regions the GPU has not retired yet
    pub fn num_in_flight_regions(&self) -> usize {
        let mut internal = lock(&self.rb_internal);
        Self::retire(&mut internal);
        internal.ri_fenced.len()
    }

    fn retire(internal: &mut RingInternal) {
        internal
            .ri_fenced
            .retain(|f| !f.fs_cmd.has_advanced_past(f.fs_counter));
    }

    /// Allocate `size` bytes, returning the offset into `buffer()`
    ///
    /// The offset is aligned to `alignment` (and the ring's minimum
    /// alignment). Requests that do not fit before the end of the ring
    /// wrap to 0. Returns RING_BUFFER_IN_FLIGHT if the range overlaps a
    /// fenced region that the GPU may still be reading.
    pub fn allocate_memory(&self, size: u64, alignment: u64) -> Result<u64> {
        if size == 0 || size > self.rb_size {
            return Err(TempestError::INVALID_SIZE);
        }

        let mut internal = lock(&self.rb_internal);
        Self::retire(&mut internal);

        let alignment = alignment.max(self.rb_min_alignment);
        let mut aligned = align_up(internal.ri_offset, alignment);
        let mut wrapped = false;
        if aligned + size > self.rb_size {
            wrapped = true;
            aligned = 0;
        }

        let span = Span {
            start: aligned,
            end: aligned + size,
        };
        if internal.ri_fenced.iter().any(|f| f.fs_span.overlaps(&span)) {
            log::warn!(
                "Ring buffer allocation of {} bytes at {} overlaps memory still in flight",
                size,
                aligned
            );
            return Err(TempestError::RING_BUFFER_IN_FLIGHT);
        }

        if wrapped {
            internal.ri_wrap_count += 1;
            log::info!(
                "Ring buffer of {} bytes wrapped (offset {}, request {})",
                self.rb_size,
                internal.ri_offset,
                size
            );
        }
        internal.ri_offset = span.end;

        // Anything unfenced under the new span has been handed out again
        internal.ri_unfenced.retain(|s| !s.overlaps(&span));
        match internal.ri_unfenced.last_mut() {
            Some(last) if last.end <= span.start && !wrapped => last.end = span.end,
            _ => internal.ri_unfenced.push(span),
        }

        Ok(aligned)
    }

    /// Tag everything allocated since the last call with `cmd`
    ///
    /// Those bytes are not handed out again until `cmd` retires the work
    /// it currently holds.
    pub fn fence_allocations(&self, cmd: &Arc<CmdBuffer>) {
        let counter = cmd.fence_signaled_counter();
        let mut internal = lock(&self.rb_internal);
        let spans = std::mem::take(&mut internal.ri_unfenced);
        for span in spans {
            internal.ri_fenced.push_back(FencedSpan {
                fs_span: span,
                fs_cmd: cmd.clone(),
                fs_counter: counter,
            });
        }
    }

    /// Copy `data` into a host visible ring at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.rb_buffer.write(offset, data)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.rb_buffer.read(offset, out)
    }
}

/// Where an upload landed, ready to be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformAllocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

/// Small per draw constant uploads
///
/// Data is written into a host ring. Devices without unified memory
/// also get a device local ring which the data is copied into.
pub struct UniformBufferUploader {
    uu_cpu_ring: RingBuffer,
    uu_gpu_ring: Option<RingBuffer>,
}

impl UniformBufferUploader {
    pub fn new(heaps: &ResourceHeapManager, props: &DeviceProperties, size: u64) -> Result<Self> {
        let min_align = props.limits.min_uniform_buffer_offset_alignment;

        let cpu_ring = RingBuffer::new(
            heaps,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            min_align,
            true,
        )?;
        let gpu_ring = match props.is_unified_memory {
            true => None,
            false => Some(RingBuffer::new(
                heaps,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                min_align,
                false,
            )?),
        };

        Ok(Self {
            uu_cpu_ring: cpu_ring,
            uu_gpu_ring: gpu_ring,
        })
    }

    pub fn cpu_ring(&self) -> &RingBuffer {
        &self.uu_cpu_ring
    }

    pub fn gpu_ring(&self) -> Option<&RingBuffer> {
        self.uu_gpu_ring.as_ref()
    }

    /// Upload `data` for use by `cmd`
    ///
    /// If there is a device local ring the copy is recorded into `cmd`,
    /// so it must be recording outside of a render pass.
    pub fn upload(
        &self,
        cmd: &Arc<CmdBuffer>,
        data: &[u8],
        alignment: u64,
    ) -> Result<UniformAllocation> {
        let size = data.len() as u64;
        let cpu_offset = self.uu_cpu_ring.allocate_memory(size, alignment)?;
        self.uu_cpu_ring.write(cpu_offset, data)?;
        self.uu_cpu_ring.fence_allocations(cmd);

        let gpu_ring = match self.uu_gpu_ring.as_ref() {
            Some(ring) => ring,
            None => {
                return Ok(UniformAllocation {
                    buffer: self.uu_cpu_ring.buffer(),
                    offset: cpu_offset,
                    size: size,
                })
            }
        };

        let gpu_offset = gpu_ring.allocate_memory(size, alignment)?;
        gpu_ring.fence_allocations(cmd);
        let region = vk::BufferCopy::builder()
            .src_offset(cpu_offset)
            .dst_offset(gpu_offset)
            .size(size)
            .build();
        cmd.copy_buffer(self.uu_cpu_ring.buffer(), gpu_ring.buffer(), &[region])?;

        Ok(UniformAllocation {
            buffer: gpu_ring.buffer(),
            offset: gpu_offset,
            size: size,
        })
    }
}
