use std::time::Duration;

use aero_draw_translate::hal::{DeviceCall, FailPoint, RecordingDevice};
use aero_draw_translate::state::types::{CullMode, RasterizerState};
use aero_draw_translate::{
    AttributeFormat, AttributePath, BufferUsage, DeviceCaps, DeviceError, DeviceState, IndexPath,
    IndexSource, IndexType, TranslateError, TranslationContext, TranslatorConfig,
    VertexAttribute,
};
use pretty_assertions::assert_eq;

fn context() -> TranslationContext<RecordingDevice> {
    TranslationContext::new(
        RecordingDevice::new(DeviceCaps::d3d9_class()),
        TranslatorConfig::for_tests(),
    )
}

fn quad_positions() -> Vec<u8> {
    let floats: Vec<f32> = vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
    bytemuck::cast_slice(&floats).to_vec()
}

fn raster() -> RasterizerState {
    RasterizerState {
        cull_mode: CullMode::Back,
        ..RasterizerState::default()
    }
}

#[test]
fn loss_invalidates_native_caches_and_reset_forces_state() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut ctx = context();
    let positions = quad_positions();

    let vertices = ctx.create_buffer();
    ctx.buffer_data(vertices, &positions, BufferUsage::Static)
        .unwrap();
    let indices = ctx.create_buffer();
    let index_bytes: Vec<u8> = bytemuck::cast_slice(&[0u16, 1, 2, 0, 2, 3]).to_vec();
    ctx.buffer_data(indices, &index_bytes, BufferUsage::Static)
        .unwrap();
    let attrs = [VertexAttribute::buffer(AttributeFormat::float(2), vertices, 8, 0)];
    let source = IndexSource::Buffer {
        name: indices,
        offset: 0,
    };

    ctx.prepare_vertex_data(&attrs, 0b1, 0, 4, 0).unwrap();
    ctx.prepare_index_data(IndexType::U16, 6, source).unwrap();
    assert!(ctx.apply_rasterizer(&raster()).unwrap());
    assert!(!ctx.apply_rasterizer(&raster()).unwrap());

    // The next upload observes the loss.
    ctx.device_mut().lose_device(DeviceError::DeviceRemoved);
    let client = [VertexAttribute::client(
        AttributeFormat::float(2),
        &positions,
        0,
    )];
    assert_eq!(
        ctx.prepare_vertex_data(&client, 0b1, 0, 4, 0),
        Err(TranslateError::ContextLost)
    );
    assert_eq!(ctx.device_state(), DeviceState::Lost);

    // Refused while lost; system-memory contents survive.
    assert_eq!(
        ctx.prepare_index_data(IndexType::U16, 6, source),
        Err(TranslateError::ContextLost)
    );
    assert_eq!(ctx.apply_rasterizer(&raster()), Err(TranslateError::ContextLost));
    assert_eq!(ctx.buffer(vertices).unwrap().data(), &positions[..]);
    assert_eq!(ctx.buffer(indices).unwrap().data(), &index_bytes[..]);
    assert!(ctx.buffer(vertices).unwrap().static_vertex().is_none());
    assert!(ctx.buffer(indices).unwrap().static_index().is_none());

    let mut slept = Vec::new();
    ctx.reset_device_with(|d| slept.push(d)).unwrap();
    assert_eq!(ctx.device_state(), DeviceState::Active);
    assert!(slept.iter().all(|d| *d == Duration::ZERO));
    let stats = ctx.stats().snapshot();
    assert_eq!(stats.device_losses, 1);
    assert_eq!(stats.resets_succeeded, 1);

    // Static translations are misses again.
    let vertices_out = ctx.prepare_vertex_data(&attrs, 0b1, 0, 4, 0).unwrap();
    assert_eq!(vertices_out[0].path, AttributePath::StaticMiss);
    let indices_out = ctx.prepare_index_data(IndexType::U16, 6, source).unwrap();
    assert_eq!(indices_out.path, IndexPath::StaticMiss);
    assert_eq!((indices_out.min_index, indices_out.max_index), (0, 3));

    // One full re-apply, then diffing resumes.
    ctx.device_mut().clear_calls();
    assert!(ctx.apply_rasterizer(&raster()).unwrap());
    assert!(!ctx.apply_rasterizer(&raster()).unwrap());
    assert_eq!(
        ctx.device()
            .count_calls(|c| matches!(c, DeviceCall::SetRasterizerState(_))),
        1
    );
}

#[test]
fn notify_is_idempotent_across_call_sites() {
    let mut ctx = context();
    assert!(ctx.notify_device_lost());
    assert!(!ctx.notify_device_lost());
    assert_eq!(ctx.counting_indices(3), Err(TranslateError::ContextLost));
    assert_eq!(ctx.stats().snapshot().device_losses, 1);
}

#[test]
fn exhausted_resets_are_fatal() {
    let mut ctx = context();
    ctx.device_mut().lose_device(DeviceError::DeviceHung);
    ctx.device_mut().fail_resets(10);
    ctx.notify_device_lost();

    assert_eq!(
        ctx.reset_device_with(|_| {}),
        Err(TranslateError::ResetFailed { attempts: 3 })
    );
    assert_eq!(ctx.stats().snapshot().resets_attempted, 3);
    assert_eq!(
        ctx.check_device(),
        Err(TranslateError::ResetFailed { attempts: 3 })
    );
    assert_eq!(ctx.counting_indices(3), Err(TranslateError::ContextLost));
}

#[test]
fn out_of_memory_keeps_the_context_usable() {
    let mut ctx = context();
    let positions = quad_positions();
    let client = [VertexAttribute::client(
        AttributeFormat::float(2),
        &positions,
        0,
    )];

    ctx.device_mut()
        .fail_next(FailPoint::CreateBuffer, DeviceError::OutOfVideoMemory);
    assert!(matches!(
        ctx.prepare_vertex_data(&client, 0b1, 0, 4, 0),
        Err(TranslateError::OutOfMemory(_))
    ));
    assert_eq!(ctx.device_state(), DeviceState::Active);

    let out = ctx.prepare_vertex_data(&client, 0b1, 0, 4, 0).unwrap();
    assert_eq!(out[0].offset, 0);
    assert_eq!(ctx.vertex_translator().stream().reserved(), 0);
}

#[test]
fn failed_static_upload_is_retried_as_a_static_miss() {
    let mut ctx = context();
    let positions: Vec<f32> = (0..9).map(|i| i as f32).collect();
    let vertices = ctx.create_buffer();
    ctx.buffer_data(vertices, bytemuck::cast_slice(&positions), BufferUsage::Static)
        .unwrap();
    let attrs = [VertexAttribute::buffer(AttributeFormat::float(3), vertices, 12, 0)];

    ctx.device_mut()
        .fail_next(FailPoint::WriteBuffer, DeviceError::OutOfVideoMemory);
    assert!(matches!(
        ctx.prepare_vertex_data(&attrs, 0b1, 0, 3, 0),
        Err(TranslateError::OutOfMemory(_))
    ));
    assert_eq!(ctx.device_state(), DeviceState::Active);

    let out = ctx.prepare_vertex_data(&attrs, 0b1, 0, 3, 0).unwrap();
    assert_eq!(out[0].path, AttributePath::StaticMiss);
    assert!(ctx.buffer(vertices).unwrap().is_promoted());
    assert_eq!(ctx.stats().snapshot().static_invalidations, 0);
}

#[test]
fn status_poll_routes_loss() {
    let mut ctx = context();
    ctx.check_device().unwrap();
    ctx.device_mut().lose_device(DeviceError::DeviceLost);
    assert_eq!(ctx.check_device(), Err(TranslateError::ContextLost));
    assert!(ctx.is_lost());
    ctx.reset_device_with(|_| {}).unwrap();
    ctx.check_device().unwrap();
}
