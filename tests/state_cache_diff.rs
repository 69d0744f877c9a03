use aero_draw_translate::backend::translate::{
    culls_everything, translate_blend_factor, translate_compare_func,
    translate_cull_and_front_face, translate_depth_stencil, translate_index_format,
    translate_sampler, translate_stencil_op, translate_vertex_format,
};
use aero_draw_translate::hal::{
    DeviceCall, IndexFormat, NativeVertexFormat, ProgramId, RecordingDevice, TextureId,
};
use aero_draw_translate::state::types::{
    BlendFactor, BlendState, ColorF, CompareFunc, CullMode, DepthStencilState, MipFilter,
    RasterizerState, SamplerState, ScissorRect, ShaderStage, StencilOp, Viewport,
};
use aero_draw_translate::{
    AttributeFormat, DeviceCaps, Serial, TranslateError, TranslationContext, TranslatorConfig,
    VertexAttribute,
};

fn context(state_diffing: bool) -> TranslationContext<RecordingDevice> {
    let config = TranslatorConfig {
        state_diffing,
        ..TranslatorConfig::for_tests()
    };
    TranslationContext::new(RecordingDevice::new(DeviceCaps::d3d9_class()), config)
}

fn state_calls(ctx: &TranslationContext<RecordingDevice>) -> usize {
    ctx.device().count_calls(DeviceCall::is_state_call)
}

fn viewport() -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width: 640.0,
        height: 480.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn apply_everything(ctx: &mut TranslationContext<RecordingDevice>, texture_serial: Serial) {
    let raster = RasterizerState {
        cull_mode: CullMode::Back,
        ..RasterizerState::default()
    };
    let blend = BlendState {
        enabled: true,
        src_rgb: BlendFactor::SrcAlpha,
        dst_rgb: BlendFactor::InvSrcAlpha,
        ..BlendState::default()
    };
    let depth = DepthStencilState {
        depth_test: true,
        ..DepthStencilState::default()
    };
    ctx.apply_rasterizer(&raster).unwrap();
    ctx.apply_blend(&blend, ColorF::default(), u32::MAX).unwrap();
    ctx.apply_depth_stencil(&depth, 0, 0).unwrap();
    ctx.apply_scissor(Some(ScissorRect {
        x: 0,
        y: 0,
        width: 320,
        height: 240,
    }))
    .unwrap();
    ctx.apply_viewport(&viewport()).unwrap();
    ctx.apply_sampler(ShaderStage::Pixel, 0, &SamplerState::default())
        .unwrap();
    ctx.apply_texture(ShaderStage::Pixel, 0, Some((TextureId(7), texture_serial)))
        .unwrap();
    ctx.apply_program(Some((ProgramId(1), Serial::NONE))).unwrap();
}

#[test]
fn identical_state_is_applied_once() {
    let mut ctx = context(true);
    let serial = Serial::issue();

    apply_everything(&mut ctx, serial);
    assert_eq!(state_calls(&ctx), 8);

    apply_everything(&mut ctx, serial);
    assert_eq!(state_calls(&ctx), 8);
    assert_eq!(ctx.stats().snapshot().state_calls_skipped, 8);
}

#[test]
fn force_all_reapplies_every_category() {
    let mut ctx = context(true);
    let serial = Serial::issue();
    apply_everything(&mut ctx, serial);

    ctx.force_all_state();
    ctx.device_mut().clear_calls();
    apply_everything(&mut ctx, serial);
    assert_eq!(state_calls(&ctx), 8);
}

#[test]
fn disabled_diffing_issues_every_call() {
    let mut ctx = context(false);
    let serial = Serial::issue();
    apply_everything(&mut ctx, serial);
    apply_everything(&mut ctx, serial);
    assert_eq!(state_calls(&ctx), 16);
}

#[test]
fn texture_serial_change_rebinds() {
    let mut ctx = context(true);
    let first = Serial::issue();
    assert!(ctx
        .apply_texture(ShaderStage::Vertex, 2, Some((TextureId(3), first)))
        .unwrap());
    assert!(!ctx
        .apply_texture(ShaderStage::Vertex, 2, Some((TextureId(3), first)))
        .unwrap());
    assert!(ctx
        .apply_texture(ShaderStage::Vertex, 2, Some((TextureId(3), Serial::issue())))
        .unwrap());
    // Same unit on another stage is tracked separately.
    assert!(ctx
        .apply_texture(ShaderStage::Pixel, 2, Some((TextureId(3), first)))
        .unwrap());
}

#[test]
fn nan_and_signed_zero_compare_bitwise() {
    let mut ctx = context(true);
    let nan = Viewport {
        min_depth: f32::NAN,
        ..viewport()
    };
    assert!(ctx.apply_viewport(&nan).unwrap());
    assert!(!ctx.apply_viewport(&nan).unwrap());

    let negative_zero = Viewport { x: -0.0, ..viewport() };
    assert!(ctx.apply_viewport(&viewport()).unwrap());
    assert!(ctx.apply_viewport(&negative_zero).unwrap());
}

#[test]
fn sampler_units_are_bounded_by_caps() {
    let mut ctx = context(true);
    assert!(matches!(
        ctx.apply_sampler(ShaderStage::Pixel, 16, &SamplerState::default()),
        Err(TranslateError::InvalidOperation(_))
    ));
}

#[test]
fn translated_attributes_bind_once() {
    let mut ctx = context(true);
    let positions: Vec<f32> = vec![0.0; 12];
    let vertices = ctx.create_buffer();
    ctx.buffer_data(
        vertices,
        bytemuck::cast_slice(&positions),
        aero_draw_translate::BufferUsage::Static,
    )
    .unwrap();
    let attrs = [VertexAttribute::buffer(AttributeFormat::float(3), vertices, 12, 0)];

    let translated = ctx.prepare_vertex_data(&attrs, 0b1, 0, 4, 0).unwrap();
    ctx.apply_vertex_buffers(&translated).unwrap();
    let after_first = state_calls(&ctx);
    assert_eq!(after_first, 2);

    let again = ctx.prepare_vertex_data(&attrs, 0b1, 0, 4, 0).unwrap();
    ctx.apply_vertex_buffers(&again).unwrap();
    assert_eq!(state_calls(&ctx), after_first);
    assert_eq!(ctx.stats().snapshot().vertex_layouts_created, 1);
}

#[test]
fn cull_mode_respects_front_face() {
    let mut raster = RasterizerState {
        cull_mode: CullMode::Back,
        ..RasterizerState::default()
    };
    let (front_face, cull_mode) = translate_cull_and_front_face(&raster);
    assert_eq!(front_face, wgpu::FrontFace::Ccw);
    assert_eq!(cull_mode, Some(wgpu::Face::Back));

    raster.cull_mode = CullMode::FrontAndBack;
    assert!(culls_everything(&raster));
}

#[test]
fn compare_and_stencil_ops_map_correctly() {
    assert_eq!(
        translate_compare_func(CompareFunc::LessEqual),
        wgpu::CompareFunction::LessEqual
    );
    assert_eq!(
        translate_stencil_op(StencilOp::IncrSat),
        wgpu::StencilOperation::IncrementClamp
    );
    assert_eq!(
        translate_blend_factor(BlendFactor::InvSrcAlpha),
        wgpu::BlendFactor::OneMinusSrcAlpha
    );
}

#[test]
fn depth_stencil_is_omitted_when_both_tests_are_off() {
    let bias = wgpu::DepthBiasState::default();
    assert!(translate_depth_stencil(&DepthStencilState::default(), bias).is_none());

    let state = DepthStencilState {
        depth_test: true,
        depth_func: CompareFunc::GreaterEqual,
        ..DepthStencilState::default()
    };
    let translated = translate_depth_stencil(&state, bias).unwrap();
    assert_eq!(translated.depth_compare, wgpu::CompareFunction::GreaterEqual);
    assert!(translated.depth_write_enabled);
    assert_eq!(translated.stencil, wgpu::StencilState::default());
}

#[test]
fn sampler_without_mips_clamps_lod() {
    let state = SamplerState {
        mip_filter: MipFilter::None,
        ..SamplerState::default()
    };
    let desc = translate_sampler(&state);
    assert_eq!(desc.lod_max_clamp, 0.0);
}

#[test]
fn native_formats_map_to_wgpu() {
    assert_eq!(
        translate_vertex_format(NativeVertexFormat::Float32x3),
        wgpu::VertexFormat::Float32x3
    );
    assert_eq!(
        translate_index_format(IndexFormat::U16),
        wgpu::IndexFormat::Uint16
    );
}
