//! Resource lifecycle, per-slot copies, binding-set pools and readbacks.

mod common;

use std::collections::HashSet;

use common::backend;
use vkframe_rhi::native::DescriptorResource;
use vkframe_rhi::{
    vk, BindingSetDesc, BufferDesc, BufferKind, BufferUsage, Lifecycle, LogicalState,
    NativeTexture, NullDevice, PassOptions, PassTarget, PhysicalState, ResourceUpdateBatch, Rhi,
    RhiError, SamplerDesc, TextureDesc,
};

#[test]
fn test_registration_then_creation_bumps_generation() {
    let (_device, mut rhi) = backend(2);
    let buffer = rhi.new_buffer(
        "vertices",
        BufferDesc {
            kind: BufferKind::Immutable,
            usage: BufferUsage::Vertex,
            size: 64,
        },
    );
    assert_eq!(rhi.generation(buffer), Some(0));
    assert_eq!(
        rhi.lifecycle(buffer),
        Lifecycle {
            logical: LogicalState::Live,
            physical: PhysicalState::Unallocated,
        }
    );
    assert_eq!(rhi.native_buffer(buffer, 0), None);

    assert_eq!(rhi.create(buffer).expect("create"), 1);
    assert!(rhi.lifecycle(buffer).is_usable());
    let first = rhi.native_buffer(buffer, 0).expect("native");

    assert_eq!(rhi.create(buffer).expect("recreate"), 2);
    let second = rhi.native_buffer(buffer, 0).expect("native");
    assert_ne!(first, second);
    assert_eq!(rhi.resource_name(buffer).as_deref(), Some("vertices"));
}

#[test]
fn test_failed_creation_leaves_backend_usable() {
    let (device, mut rhi) = backend(2);
    device.fail_next_allocation();
    let result = rhi.create_buffer(
        "doomed",
        BufferDesc {
            kind: BufferKind::Static,
            usage: BufferUsage::Storage,
            size: 128,
        },
    );
    assert!(matches!(result, Err(RhiError::ResourceCreationFailed(_))));
    assert!(!rhi.is_device_lost());

    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 128);
    assert_eq!(rhi.generation(buffer), Some(1));
}

#[test]
fn test_dynamic_buffer_has_one_copy_per_slot() {
    let (device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Dynamic, BufferUsage::Uniform, 8);
    let slot0 = rhi.native_buffer(buffer, 0).expect("slot 0 copy");
    let slot1 = rhi.native_buffer(buffer, 1).expect("slot 1 copy");
    assert_ne!(slot0, slot1);

    for value in [1.0f32, 2.0] {
        assert!(rhi.begin_offscreen_frame().is_success());
        let bytes = rhi.begin_dynamic_update(buffer).expect("map");
        bytes.copy_from_slice(bytemuck::cast_slice(&[value, value]));
        rhi.end_dynamic_update(buffer).expect("unmap");
        assert!(rhi.end_offscreen_frame().is_success());
    }

    let a = device.buffer_contents(slot0).expect("slot 0 contents");
    let b = device.buffer_contents(slot1).expect("slot 1 contents");
    assert_eq!(a, bytemuck::cast_slice::<f32, u8>(&[1.0, 1.0]));
    assert_eq!(b, bytemuck::cast_slice::<f32, u8>(&[2.0, 2.0]));
}

#[test]
fn test_dynamic_write_reaches_every_slot() {
    let (device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Dynamic, BufferUsage::Uniform, 4);

    let mut batch = ResourceUpdateBatch::new();
    batch.update_dynamic_buffer(buffer, 0, &[5, 6, 7, 8]);
    assert!(rhi.begin_offscreen_frame().is_success());
    rhi.resource_update(batch).expect("queue write");
    let readback = {
        let mut batch = ResourceUpdateBatch::new();
        let readback = batch.read_back_buffer(buffer, 0, 4);
        rhi.resource_update(batch).expect("read back");
        readback
    };
    assert!(rhi.end_offscreen_frame().is_success());
    assert_eq!(readback.take().expect("immediate readback").data, vec![5, 6, 7, 8]);

    // Slot 1 picks the write up the next time it touches the buffer.
    assert!(rhi.begin_offscreen_frame().is_success());
    let bytes = rhi.begin_dynamic_update(buffer).expect("map");
    assert_eq!(&bytes[..], &[5u8, 6, 7, 8][..]);
    rhi.end_dynamic_update(buffer).expect("unmap");
    assert!(rhi.end_offscreen_frame().is_success());
    let slot1 = rhi.native_buffer(buffer, 1).expect("slot 1 copy");
    assert_eq!(device.buffer_contents(slot1).expect("contents"), vec![5, 6, 7, 8]);
}

#[test]
fn test_dynamic_update_of_device_local_buffer_uploads() {
    let (device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Vertex, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    rhi.begin_dynamic_update(buffer)
        .expect("stage")
        .copy_from_slice(&[4, 3, 2, 1]);
    rhi.end_dynamic_update(buffer).expect("upload");
    assert!(rhi.end_offscreen_frame().is_success());

    let native = rhi.native_buffer(buffer, 0).expect("native");
    assert_eq!(device.buffer_contents(native).expect("contents"), vec![4, 3, 2, 1]);
}

#[test]
fn test_dynamic_update_needs_a_frame() {
    let (_device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Dynamic, BufferUsage::Uniform, 4);
    assert!(matches!(
        rhi.begin_dynamic_update(buffer),
        Err(RhiError::InvalidState(_))
    ));
}

#[test]
fn test_upload_out_of_range_is_rejected() {
    let (_device, mut rhi) = backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Vertex, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_static_buffer(buffer, 2, &[0; 4]);
    let readback = batch.read_back_buffer(buffer, 0, 4);
    assert!(rhi.resource_update(batch).is_err());
    assert!(readback.error().is_some());
    assert!(rhi.end_offscreen_frame().is_success());
}

#[test]
fn test_binding_sets_spill_into_new_pools() {
    let (_device, mut rhi) = backend(2);
    let ubo = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Uniform, 64);

    let mut sets = Vec::new();
    for _ in 0..300 {
        let desc = BindingSetDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX, ubo, 64);
        sets.push(rhi.create_binding_set("material", desc).expect("binding set"));
    }

    let stats = rhi.stats();
    // 300 sets x 2 slots at 128 sets per pool.
    assert_eq!(stats.pool_count, 5);
    assert!(stats.pool_count >= 3);
    let natives: HashSet<vk::DescriptorSet> = sets
        .iter()
        .flat_map(|&set| [(set, 0), (set, 1)])
        .filter_map(|(set, slot)| rhi.native_binding_set(set, slot))
        .collect();
    assert_eq!(natives.len(), 600);
}

#[test]
fn test_released_binding_sets_free_their_pool() {
    let device = NullDevice::new();
    let mut config = common::config(2);
    // Room for exactly one binding set per pool.
    config.pool.max_sets = 2;
    let mut rhi = Rhi::new(device.clone(), config).expect("backend");
    let ubo = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Uniform, 64);
    let desc = BindingSetDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX, ubo, 64);

    let first = rhi.create_binding_set("first", desc.clone()).expect("binding set");
    assert_eq!(rhi.stats().sets_per_pool, vec![2]);
    rhi.destroy(first).expect("destroy");
    assert!(rhi.finish().is_success());

    rhi.create_binding_set("second", desc.clone()).expect("binding set");
    assert_eq!(rhi.stats().pool_count, 1);
    rhi.create_binding_set("third", desc).expect("binding set");
    assert_eq!(rhi.stats().pool_count, 2);
    assert_eq!(device.descriptor_pool_count(), 2);
}

#[test]
fn test_recreated_buffer_refreshes_binding_set() {
    let (device, mut rhi) = backend(2);
    let ubo = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Uniform, 64);
    let desc = BindingSetDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX, ubo, 64);
    let set = rhi.create_binding_set("globals", desc).expect("binding set");
    let pipeline = common::pipeline(&mut rhi, Some(set));
    let (_texture, target) = common::color_target(&mut rhi);

    assert_eq!(rhi.create(ubo).expect("recreate"), 2);
    let fresh = rhi.native_buffer(ubo, 0).expect("native");
    let writes_before = device.descriptor_write_count();

    assert!(rhi.begin_offscreen_frame().is_success());
    rhi.begin_pass(PassTarget::RenderTarget(target), PassOptions::default(), None)
        .expect("pass");
    rhi.set_graphics_pipeline(pipeline).expect("pipeline");
    rhi.set_binding_set(set, &[]).expect("binding set");
    rhi.draw(3, 1, 0, 0).expect("draw");
    rhi.end_pass(None).expect("end pass");
    assert!(rhi.end_offscreen_frame().is_success());

    assert!(device.descriptor_write_count() > writes_before);
    let native_set = rhi.native_binding_set(set, 0).expect("slot 0 set");
    match device.descriptor(native_set, 0) {
        Some(DescriptorResource::Buffer { buffer, .. }) => assert_eq!(buffer, fresh),
        other => panic!("unexpected descriptor {other:?}"),
    }
}

#[test]
fn test_texture_round_trip_through_readback() {
    let (_device, mut rhi) = backend(2);
    let texture = rhi
        .create_texture(
            "pixels",
            TextureDesc::sampled(2, 2, vk::Format::R8G8B8A8_UNORM),
        )
        .expect("texture");
    let pixels: Vec<u8> = (0..16).collect();

    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_texture(texture, 0, &pixels);
    let readback = batch.read_back_texture(texture, 0);
    rhi.resource_update(batch).expect("update");
    assert!(rhi.end_offscreen_frame().is_success());
    assert!(rhi.finish().is_success());

    let result = readback.take().expect("readback");
    assert_eq!(result.data, pixels);
    assert_eq!(result.extent, Some(vk::Extent2D { width: 2, height: 2 }));
    assert_eq!(result.format, Some(vk::Format::R8G8B8A8_UNORM));
}

#[test]
fn test_texture_upload_size_is_checked() {
    let (_device, mut rhi) = backend(2);
    let texture = rhi
        .create_texture("small", TextureDesc::sampled(2, 2, vk::Format::R8G8B8A8_UNORM))
        .expect("texture");
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    batch.upload_texture(texture, 0, &[0; 15]);
    assert!(matches!(
        rhi.resource_update(batch),
        Err(RhiError::InvalidState(_))
    ));
    assert!(rhi.end_offscreen_frame().is_success());
}

#[test]
fn test_readback_of_destroyed_backend_fails() {
    let (_device, mut rhi) = common::manual_backend(2);
    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 4);
    assert!(rhi.begin_offscreen_frame().is_success());
    let mut batch = ResourceUpdateBatch::new();
    let readback = batch.read_back_buffer(buffer, 0, 4);
    rhi.resource_update(batch).expect("update");
    assert!(rhi.end_offscreen_frame().is_success());
    assert!(!readback.is_ready());

    drop(rhi);
    assert!(readback.is_ready());
    assert!(readback.take().is_some());
}

#[test]
fn test_material_pipelines_are_shared() {
    let (device, mut rhi) = backend(2);
    let desc = common::pipeline_desc(None);
    let first = rhi.material_pipeline("lit", desc.clone(), 7).expect("material");
    let second = rhi.material_pipeline("lit again", desc.clone(), 7).expect("material");
    let other = rhi.material_pipeline("unlit", desc, 8).expect("material");
    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(device.pipelines_created(), 2);

    rhi.release_material(first).expect("release");
    assert!(rhi.lifecycle(first).is_usable());
    rhi.release_material(second).expect("release last");
    assert_eq!(rhi.lifecycle(first).logical, LogicalState::Destroyed);
    assert!(matches!(
        rhi.release_material(first),
        Err(RhiError::InvalidHandle(_))
    ));

    assert!(rhi.finish().is_success());
    assert_eq!(rhi.lifecycle(first), Lifecycle::FREED);
}

#[test]
fn test_sampler_and_compute_pipeline_lifecycle() {
    let (_device, mut rhi) = backend(2);
    let sampler = rhi
        .create_sampler("linear", SamplerDesc::default())
        .expect("sampler");
    assert_eq!(rhi.generation(sampler), Some(1));

    let buffer = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Storage, 16);
    let set = rhi
        .create_binding_set(
            "particles",
            BindingSetDesc::new().storage_buffer(
                0,
                vk::ShaderStageFlags::COMPUTE,
                buffer,
                16,
                vkframe_rhi::StorageAccess::LoadStore,
            ),
        )
        .expect("binding set");
    let pipeline = rhi
        .create_compute_pipeline(
            "simulate",
            vkframe_rhi::pipeline::ComputePipelineDesc {
                shader: common::shader(vkframe_rhi::pipeline::ShaderStage::Compute),
                binding_set: Some(set),
            },
        )
        .expect("compute pipeline");
    assert_eq!(rhi.generation(pipeline), Some(1));

    rhi.destroy(pipeline).expect("destroy pipeline");
    rhi.destroy(set).expect("destroy set");
    rhi.destroy(sampler).expect("destroy sampler");
    assert!(rhi.finish().is_success());
    assert_eq!(rhi.lifecycle(sampler), Lifecycle::FREED);
    assert_eq!(rhi.stats().live_resources, 1);
}

#[test]
fn test_imported_texture_is_left_to_its_owner() {
    let (device, mut rhi) = backend(2);
    let owner = rhi
        .create_texture("owner", TextureDesc::sampled(4, 4, vk::Format::R8G8B8A8_UNORM))
        .expect("texture");
    let native = rhi.native_texture(owner).expect("native texture");
    let images = device.image_count();

    let desc = TextureDesc::sampled(4, 4, vk::Format::R8G8B8A8_UNORM);
    let imported = rhi.new_texture("imported", desc);
    assert_eq!(rhi.create_texture_from_native(imported, native).expect("import"), 1);
    assert_eq!(rhi.native_image(imported), Some(native.image));
    assert_eq!(device.image_count(), images);

    rhi.destroy(imported).expect("destroy");
    assert!(rhi.finish().is_success());
    assert_eq!(rhi.lifecycle(imported), Lifecycle::FREED);
    assert_eq!(device.image_count(), images);
    assert_eq!(rhi.native_image(owner), Some(native.image));
}

#[test]
fn test_import_rejects_null_handles() {
    let (_device, mut rhi) = backend(2);
    let desc = TextureDesc::sampled(4, 4, vk::Format::R8G8B8A8_UNORM);
    let texture = rhi.new_texture("texture", desc);
    let result = rhi.create_texture_from_native(
        texture,
        NativeTexture {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            layout: vk::ImageLayout::UNDEFINED,
        },
    );
    assert!(matches!(result, Err(RhiError::InvalidHandle(_))));
    assert_eq!(rhi.generation(texture), Some(0));
}

#[test]
fn test_release_cached_resources_drops_idle_pools() {
    let device = NullDevice::new();
    let mut config = common::config(2);
    config.pool.max_sets = 2;
    let mut rhi = Rhi::new(device.clone(), config).expect("backend");
    let ubo = common::buffer(&mut rhi, BufferKind::Static, BufferUsage::Uniform, 64);
    let desc = BindingSetDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX, ubo, 64);

    let kept = rhi.create_binding_set("kept", desc.clone()).expect("binding set");
    let first = rhi.create_binding_set("first", desc.clone()).expect("binding set");
    let second = rhi.create_binding_set("second", desc).expect("binding set");
    assert_eq!(device.descriptor_pool_count(), 3);

    rhi.destroy(first).expect("destroy");
    rhi.destroy(second).expect("destroy");
    assert!(rhi.finish().is_success());
    rhi.release_cached_resources().expect("release");
    assert_eq!(device.descriptor_pool_count(), 1);
    assert_eq!(rhi.stats().pool_count, 1);
    assert!(rhi.native_binding_set(kept, 0).is_some());

    assert!(rhi.begin_offscreen_frame().is_success());
    assert!(matches!(
        rhi.release_cached_resources(),
        Err(RhiError::InvalidState(_))
    ));
    assert!(rhi.end_offscreen_frame().is_success());
}
