//! # Squall
//!
//! A small driver for tempest. It runs a fixed number of frames against
//! a device the way a renderer would:
//!
//! * wait until at most `MAX_FRAMES_IN_FLIGHT` frames are queued
//! * grab the active command buffer
//! * stage some data and release it back to the staging pool
//! * allocate descriptor sets and upload per frame uniforms
//! * submit and end the frame
//!
//! The memory report is logged every `REPORT_INTERVAL` frames. Pass the
//! number of frames as the first argument, set TEMPEST_HEADLESS_BACKEND
//! to run without a GPU.
extern crate tempest as tp;
extern crate utils;

use tp::vk;
use std::collections::VecDeque;
use std::sync::Arc;
use utils::log;
use utils::timing::{StopWatch, TimingManager};
use utils::{anyhow, Context, Result};

const DEFAULT_FRAMES: u64 = 600;
const REPORT_INTERVAL: u64 = 120;
const FRAME_PERIOD_MS: u32 = 16;
const MAX_FRAMES_IN_FLIGHT: usize = 2;

struct Squall {
    s_dev: tp::Device,
    s_layout: Arc<tp::DescriptorSetsLayout>,
    s_swapchain: tp::HeadlessSwapchain,
    /// Submitted frames, oldest first, with the counter they were
    /// recorded at
    s_in_flight: VecDeque<(Arc<tp::CmdBuffer>, u64)>,
}

impl Squall {
    fn new(info: &tp::CreateInfo) -> Result<Self> {
        let dev = tp::Device::new(info).context("Could not create device")?;

        let shape = tp::LayoutShape::new(vec![
            tp::DescriptorCounts::new().with(tp::DescriptorKind::UniformBuffer, 1),
            tp::DescriptorCounts::new().with(tp::DescriptorKind::CombinedImageSampler, 4),
        ]);
        let layout = dev
            .create_descriptor_layout(shape)
            .context("Could not create descriptor layout")?;
        let swapchain = dev
            .create_headless_swapchain(3)
            .context("Could not create swapchain")?;

        Ok(Self {
            s_dev: dev,
            s_layout: layout,
            s_swapchain: swapchain,
            s_in_flight: VecDeque::new(),
        })
    }

    /// Block on the oldest frame until fewer than `max` are in flight
    ///
    /// Tempest never waits on earlier frames by itself, nothing is
    /// reclaimed until their fences are seen signaled.
    fn throttle(&mut self, max: usize) -> tp::Result<()> {
        while self.s_in_flight.len() >= max {
            let (cmd, counter) = match self.s_in_flight.pop_front() {
                Some(oldest) => oldest,
                None => break,
            };
            if cmd.has_advanced_past(counter) {
                continue;
            }
            if !self
                .s_dev
                .wait_for_cmd_buffer(&cmd, self.s_dev.fence_timeout_ns())?
            {
                log::error!("Timed out waiting for an earlier frame to finish");
                return Err(tp::TempestError::TIMEOUT);
            }
        }
        Ok(())
    }

    fn draw_frame(&mut self, frame: u64) -> tp::Result<()> {
        use tp::Swapchain;
        self.throttle(MAX_FRAMES_IN_FLIGHT)?;
        let image = self.s_swapchain.acquire_next_image()?;
        let cmd = self.s_dev.get_active_cmd_buffer()?;
        let counter = cmd.fence_signaled_counter();

        // Pretend to upload a texture every few frames
        if frame % 4 == 0 {
            let staging = self.s_dev.acquire_staging_buffer(
                64 * 1024,
                vk::BufferUsageFlags::TRANSFER_SRC,
                false,
            )?;
            staging.write(0, &frame.to_le_bytes())?;
            staging.flush_mapped_range()?;
            self.s_dev.release_staging_buffer(&cmd, staging);
        }

        let _sets = self.s_dev.allocate_descriptor_sets(&cmd, &self.s_layout)?;
        let mut constants = [0u8; 64];
        constants[..8].copy_from_slice(&frame.to_le_bytes());
        self.s_dev.upload_uniform(&cmd, &constants, 16)?;

        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: extent,
        };
        cmd.set_viewport(&vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        })?;
        cmd.set_scissor(&area)?;

        // Nothing signals the acquire semaphore without a surface, the
        // acquire fence already guarantees the image is free
        self.s_dev
            .submit_active_cmd_buffer_with(&[], &[image.present_semaphore], false)?;
        self.s_in_flight.push_back((cmd, counter));
        self.s_swapchain.present(
            self.s_dev.queue(),
            image.index,
            &[image.present_semaphore],
        )?;

        self.s_dev.end_frame()
    }

    fn run(&mut self, frames: u64) -> Result<()> {
        let mut pacing = TimingManager::new(FRAME_PERIOD_MS);
        let mut sw = StopWatch::new();
        sw.start();

        for frame in 0..frames {
            pacing.reset();
            self.draw_frame(frame)
                .map_err(|e| anyhow!("Frame {} failed: {}", frame, e))?;

            if pacing.is_overdue() {
                log::debug!("Frame {} went over its {} ms budget", frame, FRAME_PERIOD_MS);
            }
            if frame % REPORT_INTERVAL == 0 {
                log::info!("{}", self.s_dev.dump_memory());
            }
        }

        sw.end();
        self.s_dev.wait_idle()?;
        log::info!("Ran {} frames in {:?}", frames, sw.get_duration());
        log::info!("{}", self.s_dev.dump_memory());
        Ok(())
    }
}

fn main() {
    utils::logging::init();

    let frames = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                log::error!("Usage: squall [frames]");
                std::process::exit(2);
            }
        },
        None => DEFAULT_FRAMES,
    };

    let info = tp::CreateInfo::builder()
        .page_lifetime_frames(60)
        .staging_lifetime_frames(60)
        .build();
    let res = Squall::new(&info).and_then(|mut squall| squall.run(frames));
    if let Err(e) = res {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
