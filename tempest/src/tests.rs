/// Tempest tests
///
/// Everything here runs against the headless backend, the tests drive
/// the simulated GPU by signaling fences by hand.
use crate as tp;
use tp::vk;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

fn test_info() -> tp::CreateInfoBuilder {
    tp::CreateInfo::builder()
        .backend(tp::BackendType::Headless(tp::HeadlessConfig::default()))
        .gpu_page_size(MB)
        .upload_page_size(MB)
        .uniform_ring_size(64 * KB)
        .fence_timeout_ns(1_000_000)
}

/// Initialize a device on a headless backend we can poke at
fn init_device_with(
    config: tp::HeadlessConfig,
    info: tp::CreateInfo,
) -> (Arc<tp::HeadlessBackend>, tp::Device) {
    tp_utils::logging::init_test();

    let headless = Arc::new(tp::HeadlessBackend::new(config));
    let dev = tp::Device::with_backend(headless.clone(), &info).unwrap();
    (headless, dev)
}

fn init_device() -> (Arc<tp::HeadlessBackend>, tp::Device) {
    init_device_with(tp::HeadlessConfig::default(), test_info().build())
}

fn fence_handle(dev: &tp::Device, cmd: &tp::CmdBuffer) -> vk::Fence {
    dev.fence_manager().handle(cmd.fence()).unwrap()
}

fn viewport(width: f32) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: width,
        height: 480.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn render_area() -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: 640,
            height: 480,
        },
    }
}

// ------------ fences ------------

#[test]
fn fence_reset_requires_signal() {
    let (headless, dev) = init_device();
    let fences = dev.fence_manager();

    let id = fences.allocate_fence().unwrap();
    assert_eq!(fences.state(id).unwrap(), tp::FenceState::NotReady);
    assert_eq!(fences.reset_fence(id), Err(tp::TempestError::FENCE_NOT_SIGNALED));

    // Submit an empty batch so the fence has something to signal on
    let handle = fences.handle(id).unwrap();
    dev.queue().submit_empty(&[], &[], handle).unwrap();
    assert!(!fences.is_signaled(id).unwrap());
    assert!(headless.signal_fence(handle));
    assert!(fences.is_signaled(id).unwrap());
    assert_eq!(fences.state(id).unwrap(), tp::FenceState::Signaled);

    fences.reset_fence(id).unwrap();
    assert_eq!(fences.state(id).unwrap(), tp::FenceState::NotReady);
    fences.release_fence(id).unwrap();
}

#[test]
fn fences_are_recycled() {
    let (_headless, dev) = init_device();
    let fences = dev.fence_manager();
    let created = fences.num_created();

    let id = fences.allocate_fence().unwrap();
    fences.release_fence(id).unwrap();
    assert_eq!(fences.num_free(), 1);
    assert_eq!(fences.state(id), Err(tp::TempestError::UNKNOWN_RESOURCE));

    let again = fences.allocate_fence().unwrap();
    assert_eq!(again, id);
    assert_eq!(fences.num_created(), created + 1);
    assert_eq!(fences.num_free(), 0);
}

#[test]
fn wait_and_release_keeps_fence_on_timeout() {
    let (_headless, dev) = init_device_with(
        tp::HeadlessConfig {
            complete_on_wait: false,
            ..Default::default()
        },
        test_info().build(),
    );
    let fences = dev.fence_manager();

    let id = fences.allocate_fence().unwrap();
    let handle = fences.handle(id).unwrap();
    dev.queue().submit_empty(&[], &[], handle).unwrap();

    assert!(!fences.wait_and_release_fence(id, 1000).unwrap());
    // Still ours
    assert_eq!(fences.state(id).unwrap(), tp::FenceState::NotReady);
    assert_eq!(fences.num_free(), 0);
}

// ------------ command buffers ------------

#[test]
fn refresh_waits_for_fence_signal() {
    let (headless, dev) = init_device();

    let cmd = dev.get_active_cmd_buffer().unwrap();
    assert_eq!(cmd.state(), tp::CmdBufferState::Recording);
    let counter = cmd.fence_signaled_counter();

    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(cmd.state(), tp::CmdBufferState::Submitted);

    // Fence not signaled yet
    cmd.refresh_fence_status().unwrap();
    assert_eq!(cmd.state(), tp::CmdBufferState::Submitted);
    assert_eq!(cmd.fence_signaled_counter(), counter);

    assert!(headless.signal_fence(fence_handle(&dev, &cmd)));
    cmd.refresh_fence_status().unwrap();
    assert_eq!(cmd.state(), tp::CmdBufferState::ReadyForBegin);
    assert_eq!(cmd.fence_signaled_counter(), counter + 1);

    // Refreshing again changes nothing
    cmd.refresh_fence_status().unwrap();
    assert_eq!(cmd.fence_signaled_counter(), counter + 1);
}

#[test]
fn counter_only_moves_on_signals() {
    for reuse in [true, false].iter() {
        let (headless, dev) = init_device_with(
            tp::HeadlessConfig::default(),
            test_info().reuse_fences(*reuse).build(),
        );

        let mut last = 0;
        let mut created = None;
        for _ in 0..5 {
            let cmd = dev.get_active_cmd_buffer().unwrap();
            let num_created = *created.get_or_insert(dev.fence_manager().num_created());
            dev.submit_active_cmd_buffer(false).unwrap();

            for _ in 0..3 {
                dev.refresh_fence_status().unwrap();
                assert_eq!(cmd.state(), tp::CmdBufferState::Submitted);
                assert_eq!(cmd.fence_signaled_counter(), last);
            }

            assert_eq!(headless.signal_all_pending(), 1);
            dev.refresh_fence_status().unwrap();
            assert_eq!(cmd.state(), tp::CmdBufferState::ReadyForBegin);
            assert_eq!(cmd.fence_signaled_counter(), last + 1);
            last = cmd.fence_signaled_counter();

            // Released fences are handed back out instead of new ones
            assert_eq!(dev.fence_manager().num_created(), num_created);
        }

        // Every cycle reused the same command buffer
        assert_eq!(dev.num_cmd_buffers(), 1);
        assert_eq!(last, 5);
    }
}

fn env_vars(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }
}

#[test]
fn env_overrides_are_parsed() {
    let none = tp::EnvOverrides::from_vars(env_vars(&[]));
    assert!(!none.force_headless);
    assert_eq!(none.reuse_fences, None);
    assert_eq!(none.fence_timeout_ns, None);

    let set = tp::EnvOverrides::from_vars(env_vars(&[
        ("TEMPEST_HEADLESS_BACKEND", ""),
        ("TEMPEST_REUSE_FENCES", " 0 "),
        ("TEMPEST_FENCE_TIMEOUT_MS", "250"),
    ]));
    assert!(set.force_headless);
    assert_eq!(set.reuse_fences, Some(false));
    assert_eq!(set.fence_timeout_ns, Some(250_000_000));

    let odd = tp::EnvOverrides::from_vars(env_vars(&[
        ("TEMPEST_REUSE_FENCES", "yes"),
        ("TEMPEST_FENCE_TIMEOUT_MS", "soon"),
    ]));
    assert_eq!(odd.reuse_fences, Some(true));
    assert_eq!(odd.fence_timeout_ns, None);

    let huge = tp::EnvOverrides::from_vars(env_vars(&[(
        "TEMPEST_FENCE_TIMEOUT_MS",
        "18446744073709551615",
    )]));
    assert_eq!(huge.fence_timeout_ns, Some(u64::MAX));
}

#[test]
fn state_machine_rejects_bad_transitions() {
    let (_headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    use tp::CmdBufferState::*;
    use tp::TempestError::INVALID_CMD_BUFFER_STATE;

    assert_eq!(cmd.begin(), Err(INVALID_CMD_BUFFER_STATE(Recording, ReadyForBegin)));
    assert_eq!(
        cmd.end_render_pass(),
        Err(INVALID_CMD_BUFFER_STATE(Recording, InsideRenderPass))
    );
    // Not ended yet
    assert_eq!(
        dev.queue().submit(&cmd, &[], &[]),
        Err(INVALID_CMD_BUFFER_STATE(Recording, Ended))
    );

    cmd.begin_render_pass(vk::RenderPass::null(), vk::Framebuffer::null(), render_area())
        .unwrap();
    assert_eq!(cmd.state(), InsideRenderPass);
    assert_eq!(cmd.end(), Err(INVALID_CMD_BUFFER_STATE(InsideRenderPass, Recording)));
    assert_eq!(
        cmd.copy_buffer(vk::Buffer::null(), vk::Buffer::null(), &[]),
        Err(INVALID_CMD_BUFFER_STATE(InsideRenderPass, Recording))
    );
    cmd.end_render_pass().unwrap();

    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(cmd.begin(), Err(INVALID_CMD_BUFFER_STATE(Submitted, ReadyForBegin)));
    assert_eq!(
        dev.queue().submit(&cmd, &[], &[]),
        Err(INVALID_CMD_BUFFER_STATE(Submitted, Ended))
    );
}

#[test]
fn failed_submit_keeps_the_active_buffer() {
    use tp::CmdBufferState::*;
    let (headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    cmd.begin_render_pass(vk::RenderPass::null(), vk::Framebuffer::null(), render_area())
        .unwrap();

    assert_eq!(
        dev.submit_active_cmd_buffer(false),
        Err(tp::TempestError::INVALID_CMD_BUFFER_STATE(
            InsideRenderPass,
            Recording
        ))
    );
    assert_eq!(headless.num_submissions(), 0);
    assert!(Arc::ptr_eq(&cmd, &dev.get_active_cmd_buffer().unwrap()));

    // Retrying once the render pass is closed submits the same buffer
    cmd.end_render_pass().unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(headless.num_submissions(), 1);
    assert_eq!(cmd.state(), Submitted);

    headless.signal_all_pending();
    dev.refresh_fence_status().unwrap();
    assert_eq!(cmd.state(), ReadyForBegin);
    assert_eq!(dev.num_cmd_buffers(), 1);
}

#[test]
fn redundant_dynamic_state_is_skipped() {
    let (headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    let scissor = render_area();

    assert!(cmd.set_viewport(&viewport(640.0)).unwrap());
    assert!(!cmd.set_viewport(&viewport(640.0)).unwrap());
    assert!(cmd.set_viewport(&viewport(320.0)).unwrap());
    assert!(cmd.set_scissor(&scissor).unwrap());
    assert!(!cmd.set_scissor(&scissor).unwrap());
    assert!(cmd.set_stencil_reference(1).unwrap());
    assert!(!cmd.set_stencil_reference(1).unwrap());
    assert_eq!(headless.num_recorded_commands(cmd.handle()), 4);

    // The cache is dropped once the buffer is recycled
    dev.submit_active_cmd_buffer(false).unwrap();
    headless.signal_all_pending();
    let again = dev.get_active_cmd_buffer().unwrap();
    assert!(Arc::ptr_eq(&cmd, &again));
    assert!(again.set_viewport(&viewport(320.0)).unwrap());
    assert!(again.set_stencil_reference(1).unwrap());
}

#[test]
fn pool_grows_under_backpressure() {
    let (headless, dev) = init_device();

    let mut cmds = Vec::new();
    for _ in 0..3 {
        cmds.push(dev.get_active_cmd_buffer().unwrap());
        dev.submit_active_cmd_buffer(false).unwrap();
    }
    assert_eq!(dev.num_cmd_buffers(), 3);
    assert!(!Arc::ptr_eq(&cmds[0], &cmds[1]));
    assert_eq!(headless.pending_fence_count(), 3);

    headless.signal_all_pending();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    assert_eq!(dev.num_cmd_buffers(), 3);
    assert!(Arc::ptr_eq(&cmd, &cmds[0]));
    for other in cmds[1..].iter() {
        assert_eq!(other.state(), tp::CmdBufferState::ReadyForBegin);
    }
}

#[test]
fn upload_buffer_is_flushed_first() {
    let (headless, dev) = init_device();

    let upload = dev.get_upload_cmd_buffer().unwrap();
    assert_eq!(upload.state(), tp::CmdBufferState::Recording);
    // Same one until it is submitted
    assert!(Arc::ptr_eq(&upload, &dev.get_upload_cmd_buffer().unwrap()));

    let active = dev.get_active_cmd_buffer().unwrap();
    assert!(!Arc::ptr_eq(&upload, &active));
    assert_eq!(upload.state(), tp::CmdBufferState::Submitted);
    assert_eq!(active.state(), tp::CmdBufferState::Recording);
    assert_eq!(headless.num_submissions(), 1);

    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(dev.queue().submit_counter(), 2);
}

#[test]
fn blocking_submit_waits() {
    let (_headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();

    dev.submit_active_cmd_buffer(true).unwrap();
    assert_eq!(cmd.state(), tp::CmdBufferState::ReadyForBegin);
    assert_eq!(cmd.fence_signaled_counter(), 1);
}

#[test]
fn hung_blocking_submit_is_fatal() {
    let (_headless, dev) = init_device_with(
        tp::HeadlessConfig {
            complete_on_wait: false,
            ..Default::default()
        },
        test_info().build(),
    );
    let cmd = dev.get_active_cmd_buffer().unwrap();

    // Nothing submitted yet
    assert!(dev.wait_for_cmd_buffer(&cmd, 0).unwrap());
    let err = dev.submit_active_cmd_buffer(true).unwrap_err();
    assert_eq!(err, tp::TempestError::TIMEOUT);
    assert!(err.is_fatal());
    // A timeout is not device loss
    assert!(!dev.is_crashed());

    assert!(!dev.wait_for_cmd_buffer(&cmd, 1000).unwrap());
}

#[test]
fn wait_semaphores_are_consumed() {
    let (headless, dev) = init_device();
    let sema = dev.backend().create_semaphore().unwrap();

    let cmd = dev.get_active_cmd_buffer().unwrap();
    cmd.add_wait_semaphore(sema, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(headless.num_submissions(), 1);

    headless.signal_all_pending();
    let again = dev.get_active_cmd_buffer().unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();
    assert!(Arc::ptr_eq(&cmd, &again));
    dev.backend().destroy_semaphore(sema);
}

#[test]
fn contexts_are_independent() {
    let (headless, dev) = init_device();
    let mut ctx = dev.create_context().unwrap();

    let a = dev.get_active_cmd_buffer().unwrap();
    let b = ctx.get_active_cmd_buffer().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(ctx.num_cmd_buffers(), 1);

    ctx.submit_active_cmd_buffer(false).unwrap();
    headless.signal_all_pending();
    // The device only polls its own context
    dev.end_frame().unwrap();
    assert_eq!(b.state(), tp::CmdBufferState::Submitted);
    ctx.refresh_fence_status().unwrap();
    assert_eq!(b.state(), tp::CmdBufferState::ReadyForBegin);
}

// ------------ deferred deletion ------------

struct Tracked(Arc<AtomicBool>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn deletion_waits_for_the_fence() {
    let (headless, dev) = init_device();
    let dropped = Arc::new(AtomicBool::new(false));

    let cmd = dev.get_active_cmd_buffer().unwrap();
    dev.enqueue_deletion(Arc::new(Tracked(dropped.clone())), &cmd);
    dev.submit_active_cmd_buffer(false).unwrap();

    for _ in 0..3 {
        dev.end_frame().unwrap();
        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(dev.deletion_queue().num_pending(), 1);
    }

    headless.signal_all_pending();
    dev.end_frame().unwrap();
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(dev.deletion_queue().num_pending(), 0);
}

#[test]
fn deletion_keeps_other_references_alive() {
    let (headless, dev) = init_device();
    let dropped = Arc::new(AtomicBool::new(false));
    let item = Arc::new(Tracked(dropped.clone()));

    let cmd = dev.get_active_cmd_buffer().unwrap();
    dev.enqueue_deletion(item.clone(), &cmd);
    dev.submit_active_cmd_buffer(true).unwrap();
    assert_eq!(headless.pending_fence_count(), 0);

    assert_eq!(dev.deletion_queue().release_resources(), 1);
    assert!(!dropped.load(Ordering::SeqCst));
    drop(item);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn deletion_queue_releases_out_of_order() {
    let (headless, dev) = init_device();
    let flags: Vec<_> = (0..4).map(|_| Arc::new(AtomicBool::new(false))).collect();

    // Two buffers in flight, items interleaved between them
    let a = dev.get_active_cmd_buffer().unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();
    let b = dev.get_active_cmd_buffer().unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();
    let queue = dev.deletion_queue();
    queue.enqueue(Arc::new(Tracked(flags[0].clone())), &a);
    queue.enqueue(Arc::new(Tracked(flags[1].clone())), &b);
    queue.enqueue(Arc::new(Tracked(flags[2].clone())), &a);
    queue.enqueue(Arc::new(Tracked(flags[3].clone())), &b);

    // Items were queued while the buffers were in flight, so they wait
    // for those submissions
    assert!(headless.signal_fence(fence_handle(&dev, &b)));
    dev.refresh_fence_status().unwrap();
    assert_eq!(queue.release_resources(), 2);
    let dropped: Vec<bool> = flags.iter().map(|f| f.load(Ordering::SeqCst)).collect();
    assert_eq!(dropped, vec![false, true, false, true]);

    queue.clear();
    assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
}

// ------------ staging ------------

#[test]
fn staging_buffers_are_reused_after_retire() {
    let (headless, dev) = init_device();
    let usage = vk::BufferUsageFlags::TRANSFER_SRC;

    let cmd = dev.get_active_cmd_buffer().unwrap();
    let first = dev.acquire_staging_buffer(4096, usage, false).unwrap();
    first.write(0, &[1, 2, 3, 4]).unwrap();
    let first_handle = first.buffer();
    dev.release_staging_buffer(&cmd, first);
    dev.submit_active_cmd_buffer(false).unwrap();

    // Still in flight, so a new one is made
    let second = dev.acquire_staging_buffer(4096, usage, false).unwrap();
    assert_ne!(second.buffer(), first_handle);
    let report = dev.dump_memory().staging;
    assert_eq!(report.num_used, 1);
    assert_eq!(report.num_pending, 1);

    headless.signal_all_pending();
    dev.end_frame().unwrap();
    assert_eq!(dev.dump_memory().staging.num_free, 1);

    // Shape has to match exactly
    let other = dev.acquire_staging_buffer(2048, usage, false).unwrap();
    assert_ne!(other.buffer(), first_handle);
    let readback = dev.acquire_staging_buffer(4096, usage, true).unwrap();
    assert_ne!(readback.buffer(), first_handle);
    assert!(readback.is_cpu_read());

    let reused = dev.acquire_staging_buffer(4096, usage, false).unwrap();
    assert_eq!(reused.buffer(), first_handle);
    let mut out = [0u8; 4];
    reused.invalidate_mapped_range().unwrap();
    reused.read(0, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
    assert_eq!(dev.dump_memory().staging.peak_used, 4);
}

#[test]
fn staging_images_match_by_shape() {
    let (headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();

    let image = dev
        .acquire_staging_image(vk::Format::R8G8B8A8_UNORM, 64, 64, 1)
        .unwrap();
    let handle = image.image();
    dev.release_staging_image(&cmd, image);
    dev.submit_active_cmd_buffer(true).unwrap();
    dev.end_frame().unwrap();
    assert_eq!(headless.pending_fence_count(), 0);

    let different = dev
        .acquire_staging_image(vk::Format::R8G8B8A8_UNORM, 64, 32, 1)
        .unwrap();
    assert_ne!(different.image(), handle);
    let same = dev
        .acquire_staging_image(vk::Format::R8G8B8A8_UNORM, 64, 64, 0)
        .unwrap();
    assert_eq!(same.image(), handle);
    assert_eq!(same.extent().depth, 1);
}

#[test]
fn unused_staging_is_trimmed() {
    let (headless, dev) = init_device_with(
        tp::HeadlessConfig::default(),
        test_info().staging_lifetime_frames(2).build(),
    );

    let cmd = dev.get_active_cmd_buffer().unwrap();
    let buf = dev
        .acquire_staging_buffer(256, vk::BufferUsageFlags::TRANSFER_SRC, false)
        .unwrap();
    dev.release_staging_buffer(&cmd, buf);
    dev.submit_active_cmd_buffer(false).unwrap();
    let live = headless.num_live_buffers();

    headless.signal_all_pending();
    dev.end_frame().unwrap();
    assert_eq!(dev.dump_memory().staging.num_free, 1);

    for _ in 0..3 {
        dev.end_frame().unwrap();
    }
    assert_eq!(dev.dump_memory().staging.num_free, 0);
    assert_eq!(headless.num_live_buffers(), live - 1);
}

#[test]
fn staging_reclaim_is_batched() {
    let (headless, dev) = init_device_with(
        tp::HeadlessConfig::default(),
        test_info().reclaim_batch_size(2).build(),
    );

    let cmd = dev.get_active_cmd_buffer().unwrap();
    for _ in 0..5 {
        let buf = dev
            .acquire_staging_buffer(256, vk::BufferUsageFlags::TRANSFER_SRC, false)
            .unwrap();
        dev.release_staging_buffer(&cmd, buf);
    }
    dev.submit_active_cmd_buffer(false).unwrap();
    headless.signal_all_pending();
    dev.refresh_fence_status().unwrap();

    let staging = dev.staging_manager();
    assert_eq!(staging.process_pending_free(0), 2);
    assert_eq!(staging.process_pending_free(0), 2);
    assert_eq!(staging.process_pending_free(0), 1);
    assert_eq!(staging.dump_memory().num_free, 5);
}

// ------------ ring buffers ------------

#[test]
fn ring_wraps_when_request_does_not_fit() {
    let (_headless, dev) = init_device();
    let ring = tp::RingBuffer::new(
        dev.heap_manager(),
        1024,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        4,
        true,
    )
    .unwrap();

    assert_eq!(ring.allocate_memory(900, 4).unwrap(), 0);
    assert_eq!(ring.allocate_memory(200, 4).unwrap(), 0);
    assert_eq!(ring.wrap_count(), 1);
    assert_eq!(ring.offset(), 200);

    assert_eq!(ring.allocate_memory(10, 64).unwrap(), 256);
    assert_eq!(ring.allocate_memory(0, 4), Err(tp::TempestError::INVALID_SIZE));
    assert_eq!(
        ring.allocate_memory(1025, 4),
        Err(tp::TempestError::INVALID_SIZE)
    );
}

#[test]
fn ring_refuses_memory_in_flight() {
    let (headless, dev) = init_device();
    let ring = tp::RingBuffer::new(
        dev.heap_manager(),
        1024,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        4,
        true,
    )
    .unwrap();

    let cmd = dev.get_active_cmd_buffer().unwrap();
    assert_eq!(ring.allocate_memory(512, 4).unwrap(), 0);
    ring.fence_allocations(&cmd);
    dev.submit_active_cmd_buffer(false).unwrap();

    assert_eq!(ring.allocate_memory(512, 4).unwrap(), 512);
    assert_eq!(
        ring.allocate_memory(256, 4),
        Err(tp::TempestError::RING_BUFFER_IN_FLIGHT)
    );
    assert_eq!(ring.num_in_flight_regions(), 1);

    headless.signal_all_pending();
    dev.refresh_fence_status().unwrap();
    assert_eq!(ring.num_in_flight_regions(), 0);
    assert_eq!(ring.allocate_memory(256, 4).unwrap(), 0);
}

#[test]
fn unfenced_ring_only_tracks_live_allocations() {
    let (headless, dev) = init_device();
    let ring = tp::RingBuffer::new(
        dev.heap_manager(),
        1024,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        4,
        true,
    )
    .unwrap();

    for _ in 0..10_000 {
        assert_eq!(ring.allocate_memory(600, 4).unwrap(), 0);
    }
    assert_eq!(ring.wrap_count(), 9_999);

    // Only the latest allocation is still live when fencing starts
    let cmd = dev.get_active_cmd_buffer().unwrap();
    ring.fence_allocations(&cmd);
    dev.submit_active_cmd_buffer(false).unwrap();
    assert_eq!(ring.num_in_flight_regions(), 1);
    assert_eq!(ring.allocate_memory(300, 4).unwrap(), 600);

    headless.signal_all_pending();
    dev.refresh_fence_status().unwrap();
    assert_eq!(ring.num_in_flight_regions(), 0);
}

#[test]
fn uniform_upload_copies_to_device_ring() {
    let (headless, dev) = init_device();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    let data = [7u8; 64];

    let uploader = dev.uniform_uploader();
    let gpu_ring = uploader.gpu_ring().unwrap();
    let alloc = dev.upload_uniform(&cmd, &data, 16).unwrap();
    assert_eq!(alloc.buffer, gpu_ring.buffer());
    assert_eq!(alloc.size, 64);
    assert_eq!(headless.num_recorded_commands(cmd.handle()), 1);

    let mut out = [0u8; 64];
    uploader.cpu_ring().read(0, &mut out).unwrap();
    assert_eq!(out, data);

    // Offsets honor the device's uniform alignment
    let next = dev.upload_uniform(&cmd, &data, 16).unwrap();
    assert_eq!(next.offset, 256);
}

#[test]
fn uniform_upload_on_unified_memory_skips_copy() {
    let config = tp::HeadlessConfig {
        unified_memory: true,
        ..Default::default()
    };
    let (headless, dev) = init_device_with(config, test_info().build());
    let cmd = dev.get_active_cmd_buffer().unwrap();

    let uploader = dev.uniform_uploader();
    assert!(uploader.gpu_ring().is_none());
    let alloc = dev.upload_uniform(&cmd, &[3u8; 32], 16).unwrap();
    assert_eq!(alloc.buffer, uploader.cpu_ring().buffer());
    assert_eq!(headless.num_recorded_commands(cmd.handle()), 0);
}

// ------------ descriptors ------------

fn test_shape() -> tp::LayoutShape {
    tp::LayoutShape::new(vec![
        tp::DescriptorCounts::new().with(tp::DescriptorKind::UniformBuffer, 1),
        tp::DescriptorCounts::new()
            .with(tp::DescriptorKind::CombinedImageSampler, 2)
            .with(tp::DescriptorKind::StorageBuffer, 1),
    ])
}

#[test]
fn ninth_allocation_chains_a_pool() {
    let (headless, dev) = init_device();
    let shape = test_shape();
    let layout = dev.create_descriptor_layout(shape.clone()).unwrap();
    let cmd = dev.get_active_cmd_buffer().unwrap();

    for _ in 0..8 {
        let sets = dev.allocate_descriptor_sets(&cmd, &layout).unwrap();
        assert_eq!(sets.len(), 2);
    }
    assert_eq!(dev.descriptor_allocator().num_pools_for(&shape), 1);

    dev.allocate_descriptor_sets(&cmd, &layout).unwrap();
    assert_eq!(dev.descriptor_allocator().num_pools_for(&shape), 2);
    assert_eq!(headless.num_live_descriptor_pools(), 2);
}

#[test]
fn descriptor_pools_reset_only_after_retire() {
    let (headless, dev) = init_device();
    let shape = test_shape();
    let layout = dev.create_descriptor_layout(shape.clone()).unwrap();

    let cmd = dev.get_active_cmd_buffer().unwrap();
    for _ in 0..9 {
        dev.allocate_descriptor_sets(&cmd, &layout).unwrap();
    }
    dev.submit_active_cmd_buffer(false).unwrap();

    dev.end_frame().unwrap();
    let report = &dev.dump_memory().descriptor_pools[0];
    assert_eq!(report.allocated_sets, 18);
    assert_eq!(report.in_flight_pools, 2);

    headless.signal_all_pending();
    dev.end_frame().unwrap();
    let report = &dev.dump_memory().descriptor_pools[0];
    assert_eq!(report.allocated_sets, 0);
    assert_eq!(report.num_pools, 2);

    // Reset pools are reused before chaining new ones
    let cmd = dev.get_active_cmd_buffer().unwrap();
    for _ in 0..16 {
        dev.allocate_descriptor_sets(&cmd, &layout).unwrap();
    }
    assert_eq!(dev.descriptor_allocator().num_pools_for(&shape), 2);
}

#[test]
fn pool_with_one_busy_buffer_is_kept() {
    let (headless, dev) = init_device();
    let layout = dev.create_descriptor_layout(test_shape()).unwrap();

    let a = dev.get_active_cmd_buffer().unwrap();
    dev.allocate_descriptor_sets(&a, &layout).unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();
    let b = dev.get_active_cmd_buffer().unwrap();
    dev.allocate_descriptor_sets(&b, &layout).unwrap();
    dev.submit_active_cmd_buffer(false).unwrap();

    // Only a has finished
    assert!(headless.signal_fence(fence_handle(&dev, &a)));
    dev.end_frame().unwrap();
    assert_eq!(dev.dump_memory().descriptor_pools[0].allocated_sets, 4);

    headless.signal_all_pending();
    dev.end_frame().unwrap();
    assert_eq!(dev.dump_memory().descriptor_pools[0].allocated_sets, 0);
}

#[test]
fn monolithic_pools_are_shared() {
    let info = test_info()
        .descriptor_strategy(tp::DescriptorPoolStrategy::Monolithic {
            max_sets: 4,
            descriptors_per_kind: 8,
        })
        .build();
    let (_headless, dev) = init_device_with(tp::HeadlessConfig::default(), info);

    let one = tp::LayoutShape::new(vec![
        tp::DescriptorCounts::new().with(tp::DescriptorKind::UniformBuffer, 1)
    ]);
    let two = test_shape();
    let l1 = dev.create_descriptor_layout(one.clone()).unwrap();
    let l2 = dev.create_descriptor_layout(two.clone()).unwrap();
    let cmd = dev.get_active_cmd_buffer().unwrap();

    dev.allocate_descriptor_sets(&cmd, &l1).unwrap();
    dev.allocate_descriptor_sets(&cmd, &l2).unwrap();
    assert_eq!(dev.descriptor_allocator().num_pools_for(&one), 1);

    // 3 of 4 sets used, the next shape two needs a new pool
    dev.allocate_descriptor_sets(&cmd, &l2).unwrap();
    assert_eq!(dev.descriptor_allocator().num_pools_for(&two), 2);
    assert_eq!(dev.descriptor_allocator().dump_memory().len(), 1);
}

#[test]
fn oversize_layouts_are_rejected() {
    let config = tp::HeadlessConfig {
        max_descriptors_per_kind: 16,
        ..Default::default()
    };
    let (_headless, dev) = init_device_with(config, test_info().build());

    let shape = tp::LayoutShape::new(vec![
        tp::DescriptorCounts::new().with(tp::DescriptorKind::SampledImage, 10),
        tp::DescriptorCounts::new().with(tp::DescriptorKind::CombinedImageSampler, 10),
    ]);
    assert_eq!(
        dev.create_descriptor_layout(shape).err(),
        Some(tp::TempestError::DESCRIPTOR_LIMITS_EXCEEDED)
    );

    let ok = tp::LayoutShape::new(vec![
        tp::DescriptorCounts::new().with(tp::DescriptorKind::SampledImage, 8)
    ]);
    assert!(dev.create_descriptor_layout(ok).is_ok());
}

// ------------ device ------------

#[test]
fn device_loss_is_recorded() {
    let (headless, dev) = init_device();
    assert!(!dev.is_crashed());

    headless.set_device_lost(true);
    assert_eq!(
        dev.get_active_cmd_buffer().err(),
        Some(tp::TempestError::DEVICE_LOST)
    );
    assert!(dev.is_crashed());
}

#[test]
fn out_of_memory_is_fatal_but_not_a_crash() {
    // The uniform rings take the first two allocations
    let config = tp::HeadlessConfig {
        fail_allocations_after: Some(2),
        ..Default::default()
    };
    let (_headless, dev) = init_device_with(config, test_info().build());

    // Fits in the page the uniform ring already made
    dev.allocate_resource(KB, 256, false).unwrap();

    let err = dev.allocate_resource(2 * MB, 256, false).err().unwrap();
    assert_eq!(err, tp::TempestError::OUT_OF_MEMORY);
    assert!(err.is_fatal());
    assert!(!dev.is_crashed());
}

#[test]
fn vacated_pages_are_returned_after_their_lifetime() {
    let (headless, dev) = init_device_with(
        tp::HeadlessConfig::default(),
        test_info().page_lifetime_frames(2).build(),
    );
    let base = headless.num_live_memory_allocations();

    let alloc = dev.allocate_resource(2 * MB, 256, false).unwrap();
    assert_eq!(headless.num_live_memory_allocations(), base + 1);
    drop(alloc);
    assert_eq!(dev.heap_manager().gpu_heap().num_free_pages(), 1);

    dev.end_frame().unwrap();
    dev.end_frame().unwrap();
    assert_eq!(headless.num_live_memory_allocations(), base + 1);
    dev.end_frame().unwrap();
    assert_eq!(headless.num_live_memory_allocations(), base);
}

#[test]
fn buffers_are_bound_to_suballocations() {
    let (headless, dev) = init_device();
    let buffers = headless.num_live_buffers();

    let a = dev
        .allocate_buffer(1000, vk::BufferUsageFlags::VERTEX_BUFFER, false)
        .unwrap();
    let b = dev
        .allocate_buffer(1000, vk::BufferUsageFlags::VERTEX_BUFFER, false)
        .unwrap();
    assert_eq!(a.allocation().page(), b.allocation().page());
    assert_eq!(b.allocation().offset() % 256, 0);
    assert!(a.mapped_ptr().is_none());
    assert_eq!(a.write(0, &[0; 4]), Err(tp::TempestError::MEMORY_NOT_HOST_VISIBLE));
    assert_eq!(headless.num_live_buffers(), buffers + 2);

    drop(a);
    drop(b);
    assert_eq!(headless.num_live_buffers(), buffers);
}

#[test]
fn out_of_range_access_is_rejected() {
    let (_headless, dev) = init_device();
    let buf = dev
        .allocate_buffer(256, vk::BufferUsageFlags::TRANSFER_SRC, true)
        .unwrap();
    let mut out = [0u8; 2];

    assert_eq!(buf.write(u64::MAX, &[1, 2]), Err(tp::TempestError::INVALID_SIZE));
    assert_eq!(buf.read(u64::MAX - 1, &mut out), Err(tp::TempestError::INVALID_SIZE));
    assert_eq!(
        buf.allocation().write_bytes(u64::MAX, &[1, 2]),
        Err(tp::TempestError::INVALID_SIZE)
    );
    assert_eq!(buf.write(255, &[1, 2]), Err(tp::TempestError::INVALID_SIZE));

    buf.write(254, &[1, 2]).unwrap();
    buf.read(254, &mut out).unwrap();
    assert_eq!(out, [1, 2]);
}

#[test]
fn memory_report_covers_every_pool() {
    let (_headless, dev) = init_device();
    let layout = dev.create_descriptor_layout(test_shape()).unwrap();
    let cmd = dev.get_active_cmd_buffer().unwrap();
    dev.allocate_descriptor_sets(&cmd, &layout).unwrap();
    let _buf = dev
        .acquire_staging_buffer(128, vk::BufferUsageFlags::TRANSFER_SRC, false)
        .unwrap();

    let report = dev.dump_memory();
    assert_eq!(report.heaps.len(), 2);
    assert_eq!(report.device_memory.num_allocations, 2);
    assert_eq!(report.staging.num_used, 1);
    assert_eq!(report.descriptor_pools.len(), 1);
    assert_eq!(report.fences_used, 1);

    let text = format!("{}", report);
    assert!(text.contains("upload heap"));
    assert!(text.contains("staging: 1 used"));
}

#[test]
fn frame_counter_advances() {
    let (_headless, dev) = init_device();
    assert_eq!(dev.frame(), 0);
    for _ in 0..3 {
        dev.get_active_cmd_buffer().unwrap();
        dev.submit_active_cmd_buffer(false).unwrap();
        dev.end_frame().unwrap();
    }
    assert_eq!(dev.frame(), 3);
    dev.wait_idle().unwrap();
    assert_eq!(dev.num_cmd_buffers(), 3);
}

// ------------ swapchain ------------

#[test]
fn headless_swapchain_round_robin() {
    use tp::Swapchain;
    let (_headless, dev) = init_device();
    let mut swapchain = dev.create_headless_swapchain(2).unwrap();
    assert_eq!(swapchain.image_count(), 2);

    for expected in [0, 1, 0, 1].iter() {
        let image = swapchain.acquire_next_image().unwrap();
        assert_eq!(image.index, *expected);
        assert_eq!(image.acquire_semaphore, vk::Semaphore::null());

        dev.get_active_cmd_buffer().unwrap();
        dev.submit_active_cmd_buffer_with(&[], &[image.present_semaphore], false)
            .unwrap();
        swapchain
            .present(dev.queue(), image.index, &[image.present_semaphore])
            .unwrap();
    }
}

#[test]
fn stuck_acquire_times_out() {
    use tp::Swapchain;
    let config = tp::HeadlessConfig {
        complete_on_wait: false,
        ..Default::default()
    };
    let (_headless, dev) = init_device_with(config, test_info().build());
    let mut swapchain = dev.create_headless_swapchain(1).unwrap();

    let image = swapchain.acquire_next_image().unwrap();
    swapchain.present(dev.queue(), image.index, &[]).unwrap();
    assert_eq!(
        swapchain.acquire_next_image().err(),
        Some(tp::TempestError::TIMEOUT)
    );
}
