//! Frame pacing, presentation and teardown against the null device.

mod common;

use common::{backend, manual_backend};
use vkframe_rhi::native::NullCall;
use vkframe_rhi::{
    vk, BufferKind, BufferUsage, FrameOpResult, FramePhase, Lifecycle, LogicalState,
    PassOptions, PassTarget, PhysicalState, ResourceUpdateBatch, RhiError, SlotTag,
    SwapChainDesc,
};

fn swapchain_desc(width: u32, height: u32) -> SwapChainDesc {
    SwapChainDesc::new(vk::SurfaceKHR::null(), vk::Extent2D { width, height })
}

#[test]
fn test_slots_rotate_round_robin() {
    let (_device, mut rhi) = backend(3);
    for _ in 0..7 {
        assert_eq!(rhi.begin_offscreen_frame(), FrameOpResult::Success);
        assert!(rhi.in_frame());
        assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Success);
    }
    assert_eq!(rhi.frame_count(), 7);
    assert_eq!(rhi.current_slot(), 7 % 3);
    assert_eq!(rhi.phase(), FramePhase::Idle);
}

#[test]
fn test_end_without_begin_is_an_error() {
    let (_device, mut rhi) = backend(2);
    assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Error);
    assert_eq!(rhi.frame_count(), 0);
}

#[test]
fn test_nested_begin_is_rejected() {
    let (_device, mut rhi) = backend(2);
    assert!(rhi.begin_offscreen_frame().is_success());
    assert_eq!(rhi.begin_offscreen_frame(), FrameOpResult::Error);
    assert!(rhi.end_offscreen_frame().is_success());
}

#[test]
fn test_release_waits_for_frame_completion() {
    let (device, mut rhi) = manual_backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Vertex, 16);
    let native = rhi.native_buffer(buffer, 0).expect("native buffer");

    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[7; 16]);
    rhi.resource_update(batch).expect("upload");
    assert!(rhi.end_offscreen_frame().is_success());
    assert_eq!(rhi.last_active(buffer), SlotTag::Slot(0));

    rhi.destroy(buffer).expect("destroy");
    assert_eq!(
        rhi.lifecycle(buffer),
        Lifecycle {
            logical: LogicalState::Destroyed,
            physical: PhysicalState::PendingFree,
        }
    );

    // Slot 0 is still executing: the next frame must not free the buffer.
    assert!(rhi.begin_offscreen_frame().is_success());
    assert!(device.buffer_contents(native).is_some());
    assert!(rhi.end_offscreen_frame().is_success());
    assert_eq!(device.pending_submissions(), 2);

    device.complete_submissions();
    assert!(rhi.begin_offscreen_frame().is_success());
    assert!(device.buffer_contents(native).is_none());
    assert_eq!(rhi.lifecycle(buffer), Lifecycle::FREED);
    assert!(rhi.end_offscreen_frame().is_success());
}

#[test]
fn test_destroyed_handle_is_rejected() {
    let (_device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Uniform, 64);
    rhi.destroy(buffer).expect("destroy");
    assert!(matches!(rhi.destroy(buffer), Err(RhiError::InvalidHandle(_))));
    assert!(matches!(rhi.create(buffer), Err(RhiError::InvalidHandle(_))));
}

#[test]
fn test_finish_is_idempotent() {
    let (_device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Vertex, 16);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[1; 16]);
    rhi.resource_update(batch).expect("upload");
    assert!(rhi.end_offscreen_frame().is_success());
    rhi.destroy(buffer).expect("destroy");

    assert_eq!(rhi.finish(), FrameOpResult::Success);
    let after_first = rhi.stats();
    assert_eq!(after_first.pending_releases, 0);
    assert_eq!(rhi.finish(), FrameOpResult::Success);
    assert_eq!(rhi.stats().pending_releases, 0);
    assert_eq!(rhi.stats().live_resources, after_first.live_resources);
}

#[test]
fn test_finish_inside_frame_keeps_recording() {
    let (_device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 8);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[3; 8]);
    let readback = batch.read_back_buffer(buffer, 0, 8);
    rhi.resource_update(batch).expect("update");

    let slot = rhi.current_slot();
    assert_eq!(rhi.finish(), FrameOpResult::Success);
    assert_eq!(readback.take().expect("readback result").data, vec![3; 8]);
    assert!(rhi.in_frame());
    assert_eq!(rhi.current_slot(), slot);
    assert!(rhi.command_list().is_empty());

    assert!(rhi.end_offscreen_frame().is_success());
    assert_eq!(rhi.frame_count(), 1);
}

#[test]
fn test_finish_reports_stuck_work_as_timeout() {
    let (_device, mut rhi) = manual_backend(2);
    assert!(rhi.begin_offscreen_frame().is_success());
    assert_eq!(rhi.finish(), FrameOpResult::Timeout);
    assert!(!rhi.is_device_lost());
}

fn copy_count(device: &vkframe_rhi::NullDevice) -> usize {
    device
        .submissions()
        .iter()
        .flat_map(|s| s.calls.iter())
        .filter(|call| matches!(call, NullCall::CopyBuffer { .. }))
        .count()
}

#[test]
fn test_timed_out_finish_does_not_resubmit() {
    let (device, mut rhi) = manual_backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Vertex, 8);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[5; 8]);
    rhi.resource_update(batch).expect("upload");

    assert_eq!(rhi.finish(), FrameOpResult::Timeout);
    assert!(rhi.in_frame());
    assert!(rhi.command_list().is_empty());
    assert_eq!(device.pending_submissions(), 1);

    // The slot's buffer is still in flight, so the frame cannot end yet.
    assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Timeout);
    assert!(rhi.in_frame());
    assert_eq!(device.pending_submissions(), 1);

    device.complete_submissions();
    assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Success);
    device.complete_submissions();
    assert_eq!(device.submissions().len(), 2);
    assert_eq!(copy_count(&device), 1);
    assert_eq!(rhi.frame_count(), 1);
}

#[test]
fn test_recording_continues_after_failed_finish() {
    let (device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[1; 4]);
    let lost = batch.read_back_buffer(buffer, 0, 4);
    rhi.resource_update(batch).expect("first upload");

    device.fail_next_submit();
    assert_eq!(rhi.finish(), FrameOpResult::Error);
    assert!(rhi.in_frame());
    assert!(!rhi.is_device_lost());
    assert!(lost.is_ready());
    assert!(lost.error().is_some());
    assert!(lost.take().is_none());

    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[2; 4]);
    rhi.resource_update(batch).expect("second upload");
    assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Success);

    assert_eq!(copy_count(&device), 1);
    let native = rhi.native_buffer(buffer, 0).expect("native");
    assert_eq!(device.buffer_contents(native), Some(vec![2; 4]));
}

#[test]
fn test_readback_of_failed_submission_fails() {
    let (device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[7; 4]);
    let readback = batch.read_back_buffer(buffer, 0, 4);
    rhi.resource_update(batch).expect("update");

    device.fail_next_submit();
    assert_eq!(rhi.end_offscreen_frame(), FrameOpResult::Error);
    assert!(!rhi.in_frame());
    assert_eq!(rhi.frame_count(), 0);
    assert!(readback.error().is_some());
    assert!(readback.take().is_none());
    assert_eq!(rhi.stats().pending_readbacks, 0);

    // The slot is reusable once the failure is reported.
    assert!(rhi.begin_offscreen_frame().is_success());
    assert!(rhi.end_offscreen_frame().is_success());
    assert_eq!(rhi.frame_count(), 1);
}

#[test]
fn test_finish_outside_frame_completes_readbacks() {
    let (device, mut rhi) = manual_backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 0, &[9, 8, 7, 6]);
    let readback = batch.read_back_buffer(buffer, 0, 4);
    rhi.resource_update(batch).expect("update");
    assert!(rhi.end_offscreen_frame().is_success());

    assert!(!readback.is_ready());
    assert_eq!(device.pending_submissions(), 1);
    assert!(rhi.finish().is_success());
    assert_eq!(device.pending_submissions(), 0);
    let result = readback.take().expect("readback result");
    assert_eq!(result.data, vec![9, 8, 7, 6]);
}

#[test]
fn test_out_of_date_acquire_does_not_consume_a_slot() {
    let (device, mut rhi) = backend(2);
    let swapchain = rhi
        .create_swapchain("main", swapchain_desc(64, 64))
        .expect("swapchain");
    assert_eq!(rhi.generation(swapchain), Some(1));

    assert!(rhi.begin_frame(swapchain).is_success());
    rhi.begin_pass(PassTarget::SwapChain(swapchain), PassOptions::clear([0.0; 4]), None)
        .expect("pass");
    rhi.end_pass(None).expect("end pass");
    assert!(rhi.end_frame().is_success());
    assert_eq!(rhi.frame_count(), 1);

    device.set_out_of_date(true);
    assert_eq!(rhi.begin_frame(swapchain), FrameOpResult::SwapChainOutOfDate);
    assert_eq!(rhi.frame_count(), 1);
    assert_eq!(rhi.current_slot(), 1);
    assert!(!rhi.in_frame());

    device.set_out_of_date(false);
    rhi.set_swapchain_pixel_size(swapchain, vk::Extent2D { width: 32, height: 16 })
        .expect("resize");
    assert_eq!(rhi.create(swapchain).expect("recreate"), 2);
    assert_eq!(
        rhi.swapchain_extent(swapchain),
        Some(vk::Extent2D { width: 32, height: 16 })
    );
    assert!(rhi.begin_frame(swapchain).is_success());
    assert!(rhi.end_frame().is_success());
    assert_eq!(rhi.frame_count(), 2);
}

#[test]
fn test_out_of_date_present_still_rotates() {
    let (device, mut rhi) = backend(2);
    let swapchain = rhi
        .create_swapchain("main", swapchain_desc(64, 64))
        .expect("swapchain");
    assert!(rhi.begin_frame(swapchain).is_success());
    device.set_out_of_date(true);
    assert_eq!(rhi.end_frame(), FrameOpResult::SwapChainOutOfDate);
    assert_eq!(rhi.frame_count(), 1);
    assert_eq!(rhi.current_slot(), 1);
    assert!(!rhi.in_frame());
}

#[test]
fn test_swapchain_cannot_be_recreated_while_presenting() {
    let (_device, mut rhi) = backend(2);
    let swapchain = rhi
        .create_swapchain("main", swapchain_desc(64, 64))
        .expect("swapchain");
    assert!(rhi.begin_frame(swapchain).is_success());
    assert!(matches!(rhi.create(swapchain), Err(RhiError::InvalidState(_))));
    assert!(matches!(rhi.destroy(swapchain), Err(RhiError::InvalidState(_))));
    assert!(rhi.end_frame().is_success());
}

#[test]
fn test_swapchain_image_is_transitioned_for_present() {
    let (device, mut rhi) = backend(2);
    let swapchain = rhi
        .create_swapchain("main", swapchain_desc(8, 8))
        .expect("swapchain");
    assert!(rhi.begin_frame(swapchain).is_success());
    rhi.begin_pass(PassTarget::SwapChain(swapchain), PassOptions::clear([1.0; 4]), None)
        .expect("pass");
    rhi.end_pass(None).expect("end pass");
    assert!(rhi.end_frame().is_success());

    let calls = common::last_calls(&device);
    let present = calls
        .iter()
        .rev()
        .find_map(|call| match call {
            NullCall::PipelineBarrier { images, .. } => images.first().copied(),
            _ => None,
        })
        .expect("present barrier");
    assert_eq!(present.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    let submission = device.last_submission().expect("submission");
    assert!(submission.wait.is_some());
    assert!(submission.signal.is_some());
}

#[test]
fn test_device_lost_is_sticky() {
    let (device, mut rhi) = backend(2);
    device.set_device_lost(true);
    assert_eq!(rhi.begin_offscreen_frame(), FrameOpResult::DeviceLost);
    assert!(rhi.is_device_lost());

    device.set_device_lost(false);
    assert_eq!(rhi.begin_offscreen_frame(), FrameOpResult::DeviceLost);
    assert_eq!(rhi.finish(), FrameOpResult::DeviceLost);
    assert!(matches!(
        rhi.create_buffer(
            "late",
            vkframe_rhi::BufferDesc {
                kind: BufferKind::Static,
                usage: BufferUsage::Vertex,
                size: 4,
            }
        ),
        Err(RhiError::DeviceLost)
    ));
}

#[test]
fn test_pipeline_cache_round_trip() {
    let (_device, mut rhi) = backend(2);
    let blob = b"cache blob from an earlier run".to_vec();
    rhi.set_pipeline_cache_data(&blob).expect("seed cache");
    assert_eq!(rhi.pipeline_cache_data().expect("cache data"), blob);
}

#[test]
fn test_drop_frees_every_native_object() {
    let device = vkframe_rhi::NullDevice::new();
    {
        let mut rhi =
            vkframe_rhi::Rhi::new(device.clone(), common::config(2)).expect("backend");
        let _ = common::buffer(&mut rhi, BufferKind::Dynamic, BufferUsage::Uniform, 256);
        let _ = common::color_target(&mut rhi);
        let _ = common::pipeline(&mut rhi, None);
        assert!(rhi.begin_offscreen_frame().is_success());
        assert!(rhi.end_offscreen_frame().is_success());
    }
    assert_eq!(device.live_object_count(), 0);
}

#[test]
fn test_gpu_frame_time_is_reported() {
    let device = vkframe_rhi::NullDevice::new();
    let config = vkframe_core::BackendConfig {
        gpu_timestamps: true,
        ..common::config(2)
    };
    let mut rhi = vkframe_rhi::Rhi::new(device.clone(), config).expect("backend");
    assert_eq!(device.query_pool_count(), 2);

    // Slot 0's timings are read when it comes around again.
    for _ in 0..3 {
        assert!(rhi.begin_offscreen_frame().is_success());
        assert!(rhi.end_offscreen_frame().is_success());
    }
    let elapsed = rhi.stats().last_gpu_frame_time.expect("gpu frame time");
    assert!(!elapsed.is_zero());

    let calls = common::last_calls(&device);
    let timestamp = |query: u32| {
        common::position(&calls, |c| {
            matches!(c, NullCall::WriteTimestamp { query: q, .. } if *q == query)
        })
    };
    let reset = common::position(&calls, |c| matches!(c, NullCall::ResetQueries { count: 2, .. }));
    assert!(reset.is_some());
    assert!(reset < timestamp(0) && timestamp(0) < timestamp(1));
}

#[test]
fn test_gpu_timestamps_are_off_by_default() {
    let (device, mut rhi) = backend(2);
    for _ in 0..3 {
        assert!(rhi.begin_offscreen_frame().is_success());
        assert!(rhi.end_offscreen_frame().is_success());
    }
    assert_eq!(device.query_pool_count(), 0);
    assert_eq!(rhi.stats().last_gpu_frame_time, None);
}

#[test]
fn test_swapchain_readback_copies_the_acquired_image() {
    let (device, mut rhi) = backend(2);
    let desc = SwapChainDesc {
        readback: true,
        ..swapchain_desc(8, 4)
    };
    let swapchain = rhi.create_swapchain("main", desc).expect("swapchain");

    assert!(rhi.begin_frame(swapchain).is_success());
    rhi.begin_pass(PassTarget::SwapChain(swapchain), PassOptions::clear([0.0; 4]), None)
        .expect("pass");
    let mut batch = ResourceUpdateBatch::new();
    let readback = batch.read_back_swapchain();
    rhi.end_pass(Some(batch)).expect("end pass");
    assert!(rhi.end_frame().is_success());
    assert!(rhi.finish().is_success());

    let result = readback.take().expect("readback result");
    assert_eq!(result.data.len(), 8 * 4 * 4);
    assert_eq!(result.extent, Some(vk::Extent2D { width: 8, height: 4 }));
    assert_eq!(result.format, Some(vk::Format::B8G8R8A8_UNORM));

    let calls = common::last_calls(&device);
    let present = calls
        .iter()
        .rev()
        .find_map(|call| match call {
            NullCall::PipelineBarrier { images, .. } => images.first().copied(),
            _ => None,
        })
        .expect("present barrier");
    assert_eq!(present.old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    assert_eq!(present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
}

#[test]
fn test_swapchain_readback_is_refused_when_unavailable() {
    let (_device, mut rhi) = backend(2);
    let swapchain = rhi
        .create_swapchain("main", swapchain_desc(8, 8))
        .expect("swapchain");

    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    let offscreen = batch.read_back_swapchain();
    assert!(matches!(rhi.resource_update(batch), Err(RhiError::InvalidState(_))));
    assert!(offscreen.error().is_some());
    assert!(rhi.end_offscreen_frame().is_success());

    assert!(rhi.begin_frame(swapchain).is_success());
    let mut batch = ResourceUpdateBatch::new();
    let disabled = batch.read_back_swapchain();
    assert!(matches!(rhi.resource_update(batch), Err(RhiError::InvalidState(_))));
    assert!(disabled.error().is_some());
    assert!(rhi.end_frame().is_success());
}

#[test]
fn test_multisampled_swapchain_resolves_into_presented_image() {
    let (device, mut rhi) = backend(2);
    let before = device.image_count();
    let plain = rhi
        .create_swapchain("plain", swapchain_desc(8, 8))
        .expect("swapchain");
    let plain_images = device.image_count() - before;
    let desc = SwapChainDesc {
        sample_count: 4,
        ..swapchain_desc(8, 8)
    };
    let msaa = rhi.create_swapchain("msaa", desc).expect("swapchain");
    let images = rhi.swapchain_image_count(msaa);
    assert_eq!(device.image_count() - before, 2 * plain_images + images);

    assert!(rhi.begin_frame(msaa).is_success());
    rhi.begin_pass(PassTarget::SwapChain(msaa), PassOptions::clear([0.0; 4]), None)
        .expect("pass");
    rhi.end_pass(None).expect("end pass");
    assert!(rhi.end_frame().is_success());

    let calls = common::last_calls(&device);
    let color = calls
        .iter()
        .find_map(|call| match call {
            NullCall::BeginRendering { colors, .. } => colors.first().copied(),
            _ => None,
        })
        .expect("color attachment");
    assert!(color.resolve.is_some());
    assert_ne!(color.resolve, Some(color.view));
    assert_eq!(color.store_op, vk::AttachmentStoreOp::DONT_CARE);

    rhi.destroy(msaa).expect("destroy");
    rhi.destroy(plain).expect("destroy");
    assert!(rhi.finish().is_success());
    assert_eq!(device.image_count(), before);
}
