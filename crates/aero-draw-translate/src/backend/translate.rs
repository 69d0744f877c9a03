//! Translation of the backend-neutral state types into wgpu descriptors.

use crate::hal::{IndexFormat, NativeVertexFormat};
use crate::state::types::{
    AddressMode, BlendFactor, BlendOp, BlendState, ColorF, ColorWriteMask, CompareFunc, CullMode,
    DepthStencilState, FilterMode, MipFilter, RasterizerState, SamplerState, StencilFaceState,
    StencilOp,
};

/// Depth/stencil format assumed when building `wgpu::DepthStencilState`.
pub const DEPTH_STENCIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

pub fn translate_compare_func(func: CompareFunc) -> wgpu::CompareFunction {
    match func {
        CompareFunc::Never => wgpu::CompareFunction::Never,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Always => wgpu::CompareFunction::Always,
    }
}

pub fn translate_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::IncrSat => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrSat => wgpu::StencilOperation::DecrementClamp,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::Incr => wgpu::StencilOperation::IncrementWrap,
        StencilOp::Decr => wgpu::StencilOperation::DecrementWrap,
    }
}

pub fn translate_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DestAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::InvDestAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::DestColor => wgpu::BlendFactor::Dst,
        BlendFactor::InvDestColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::SrcAlphaSat => wgpu::BlendFactor::SrcAlphaSaturated,
        BlendFactor::BlendFactor => wgpu::BlendFactor::Constant,
        BlendFactor::InvBlendFactor => wgpu::BlendFactor::OneMinusConstant,
    }
}

pub fn translate_blend_op(op: BlendOp) -> wgpu::BlendOperation {
    match op {
        BlendOp::Add => wgpu::BlendOperation::Add,
        BlendOp::Subtract => wgpu::BlendOperation::Subtract,
        BlendOp::RevSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOp::Min => wgpu::BlendOperation::Min,
        BlendOp::Max => wgpu::BlendOperation::Max,
    }
}

pub fn translate_color_write_mask(mask: ColorWriteMask) -> wgpu::ColorWrites {
    let mut out = wgpu::ColorWrites::empty();
    if mask.contains(ColorWriteMask::RED) {
        out |= wgpu::ColorWrites::RED;
    }
    if mask.contains(ColorWriteMask::GREEN) {
        out |= wgpu::ColorWrites::GREEN;
    }
    if mask.contains(ColorWriteMask::BLUE) {
        out |= wgpu::ColorWrites::BLUE;
    }
    if mask.contains(ColorWriteMask::ALPHA) {
        out |= wgpu::ColorWrites::ALPHA;
    }
    out
}

/// `None` when blending is disabled. Min/max ignore their factors, which wgpu requires to be
/// `One`.
pub fn translate_blend_state(state: &BlendState) -> Option<wgpu::BlendState> {
    if !state.enabled {
        return None;
    }
    let component = |src, dst, op: BlendOp| {
        let (src, dst) = match op {
            BlendOp::Min | BlendOp::Max => (wgpu::BlendFactor::One, wgpu::BlendFactor::One),
            _ => (translate_blend_factor(src), translate_blend_factor(dst)),
        };
        wgpu::BlendComponent {
            src_factor: src,
            dst_factor: dst,
            operation: translate_blend_op(op),
        }
    };
    Some(wgpu::BlendState {
        color: component(state.src_rgb, state.dst_rgb, state.op_rgb),
        alpha: component(state.src_alpha, state.dst_alpha, state.op_alpha),
    })
}

pub fn translate_blend_constant(color: ColorF) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(color.r),
        g: f64::from(color.g),
        b: f64::from(color.b),
        a: f64::from(color.a),
    }
}

/// Front face winding and culled face. `FrontAndBack` has no wgpu equivalent and is reported
/// through [`culls_everything`].
pub fn translate_cull_and_front_face(
    raster: &RasterizerState,
) -> (wgpu::FrontFace, Option<wgpu::Face>) {
    let front_face = if raster.front_counter_clockwise {
        wgpu::FrontFace::Ccw
    } else {
        wgpu::FrontFace::Cw
    };
    let cull_mode = match raster.cull_mode {
        CullMode::None | CullMode::FrontAndBack => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    };
    (front_face, cull_mode)
}

/// Whether polygon draws must be skipped entirely.
pub fn culls_everything(raster: &RasterizerState) -> bool {
    raster.cull_mode == CullMode::FrontAndBack
}

pub fn translate_primitive_state(raster: &RasterizerState) -> wgpu::PrimitiveState {
    let (front_face, cull_mode) = translate_cull_and_front_face(raster);
    wgpu::PrimitiveState {
        front_face,
        cull_mode,
        ..wgpu::PrimitiveState::default()
    }
}

pub fn translate_depth_bias(raster: &RasterizerState) -> wgpu::DepthBiasState {
    if !raster.polygon_offset_fill {
        return wgpu::DepthBiasState::default();
    }
    wgpu::DepthBiasState {
        constant: raster.polygon_offset_units as i32,
        slope_scale: raster.polygon_offset_factor,
        clamp: 0.0,
    }
}

fn translate_stencil_face(face: &StencilFaceState) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: translate_compare_func(face.func),
        fail_op: translate_stencil_op(face.fail),
        depth_fail_op: translate_stencil_op(face.depth_fail),
        pass_op: translate_stencil_op(face.pass),
    }
}

/// `None` when both depth and stencil testing are off. wgpu has one pair of stencil masks; the
/// front face's masks are used.
pub fn translate_depth_stencil(
    state: &DepthStencilState,
    bias: wgpu::DepthBiasState,
) -> Option<wgpu::DepthStencilState> {
    if !state.depth_test && !state.stencil_test {
        return None;
    }
    let stencil = if state.stencil_test {
        wgpu::StencilState {
            front: translate_stencil_face(&state.stencil_front),
            back: translate_stencil_face(&state.stencil_back),
            read_mask: state.stencil_front.read_mask,
            write_mask: state.stencil_front.write_mask,
        }
    } else {
        wgpu::StencilState::default()
    };
    Some(wgpu::DepthStencilState {
        format: DEPTH_STENCIL_FORMAT,
        depth_write_enabled: state.depth_test && state.depth_write,
        depth_compare: if state.depth_test {
            translate_compare_func(state.depth_func)
        } else {
            wgpu::CompareFunction::Always
        },
        stencil,
        bias,
    })
}

fn translate_address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn translate_filter(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

/// Sampler descriptor. Without mipmapping the LOD is clamped to the base level; anisotropy is
/// only requested when every filter is linear, which wgpu requires.
pub fn translate_sampler(state: &SamplerState) -> wgpu::SamplerDescriptor<'static> {
    let (mipmap_filter, lod_max) = match state.mip_filter {
        MipFilter::None => (wgpu::FilterMode::Nearest, 0.0),
        MipFilter::Nearest => (wgpu::FilterMode::Nearest, state.lod_max.max(0.0)),
        MipFilter::Linear => (wgpu::FilterMode::Linear, state.lod_max.max(0.0)),
    };
    let all_linear = state.min_filter == FilterMode::Linear
        && state.mag_filter == FilterMode::Linear
        && state.mip_filter == MipFilter::Linear;
    let anisotropy_clamp = if all_linear {
        state.max_anisotropy.clamp(1.0, 16.0) as u16
    } else {
        1
    };
    let lod_min = state.lod_min.max(0.0).min(lod_max);
    wgpu::SamplerDescriptor {
        label: Some("aero-draw-translate sampler"),
        address_mode_u: translate_address_mode(state.address_u),
        address_mode_v: translate_address_mode(state.address_v),
        address_mode_w: translate_address_mode(state.address_w),
        mag_filter: translate_filter(state.mag_filter),
        min_filter: translate_filter(state.min_filter),
        mipmap_filter,
        lod_min_clamp: lod_min,
        lod_max_clamp: lod_max,
        compare: None,
        anisotropy_clamp,
        border_color: None,
    }
}

pub fn translate_vertex_format(format: NativeVertexFormat) -> wgpu::VertexFormat {
    match format {
        NativeVertexFormat::Float32 => wgpu::VertexFormat::Float32,
        NativeVertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        NativeVertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        NativeVertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        NativeVertexFormat::Float16x2 => wgpu::VertexFormat::Float16x2,
        NativeVertexFormat::Float16x4 => wgpu::VertexFormat::Float16x4,
        NativeVertexFormat::Uint8x4 => wgpu::VertexFormat::Uint8x4,
        NativeVertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
        NativeVertexFormat::Sint16x2 => wgpu::VertexFormat::Sint16x2,
        NativeVertexFormat::Sint16x4 => wgpu::VertexFormat::Sint16x4,
        NativeVertexFormat::Snorm16x2 => wgpu::VertexFormat::Snorm16x2,
        NativeVertexFormat::Snorm16x4 => wgpu::VertexFormat::Snorm16x4,
        NativeVertexFormat::Unorm16x2 => wgpu::VertexFormat::Unorm16x2,
        NativeVertexFormat::Unorm16x4 => wgpu::VertexFormat::Unorm16x4,
        NativeVertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        NativeVertexFormat::Sint32x2 => wgpu::VertexFormat::Sint32x2,
        NativeVertexFormat::Sint32x3 => wgpu::VertexFormat::Sint32x3,
        NativeVertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
        NativeVertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        NativeVertexFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        NativeVertexFormat::Uint32x3 => wgpu::VertexFormat::Uint32x3,
        NativeVertexFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
    }
}

pub fn translate_index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}
