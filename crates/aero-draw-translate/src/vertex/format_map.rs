use half::f16;

use crate::hal::{NativeComponent, NativeVertexFormat, VertexFormatCaps};

/// Component type of a client vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    /// 16.16 signed fixed point.
    Fixed,
    HalfFloat,
    Float,
}

impl ElementType {
    pub fn byte_size(self) -> u32 {
        match self {
            ElementType::Byte | ElementType::UnsignedByte => 1,
            ElementType::Short | ElementType::UnsignedShort | ElementType::HalfFloat => 2,
            ElementType::Int
            | ElementType::UnsignedInt
            | ElementType::Fixed
            | ElementType::Float => 4,
        }
    }
}

/// Layout of one attribute element as the client describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeFormat {
    pub element_type: ElementType,
    /// 1..=4
    pub components: u8,
    pub normalized: bool,
    pub pure_integer: bool,
}

impl AttributeFormat {
    pub fn new(
        element_type: ElementType,
        components: u8,
        normalized: bool,
        pure_integer: bool,
    ) -> Self {
        debug_assert!((1..=4).contains(&components));
        Self {
            element_type,
            components,
            normalized,
            pure_integer,
        }
    }

    pub fn float(components: u8) -> Self {
        Self::new(ElementType::Float, components, false, false)
    }

    pub fn byte_size(&self) -> u32 {
        self.element_type.byte_size() * u32::from(self.components)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementConversion {
    /// Bytes are consumed as-is.
    None,
    /// Components are copied into a wider native component type; missing components are filled
    /// with `(0, 0, 0, 1)`.
    Widen,
    /// Components are converted to 32-bit floats, applying normalization.
    ToFloat,
}

/// How a client attribute is represented natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementFormat {
    pub format: NativeVertexFormat,
    pub byte_size: u32,
    pub conversion: ElementConversion,
}

impl ElementFormat {
    fn new(format: NativeVertexFormat, conversion: ElementConversion) -> Self {
        Self {
            format,
            byte_size: format.byte_size(),
            conversion,
        }
    }
}

fn native_format(component: NativeComponent, components: u32) -> Option<NativeVertexFormat> {
    use NativeComponent as C;
    use NativeVertexFormat as F;
    Some(match (component, components) {
        (C::F32, 1) => F::Float32,
        (C::F32, 2) => F::Float32x2,
        (C::F32, 3) => F::Float32x3,
        (C::F32, 4) => F::Float32x4,
        (C::F16, 2) => F::Float16x2,
        (C::F16, 4) => F::Float16x4,
        (C::U8, 4) => F::Uint8x4,
        (C::Unorm8, 4) => F::Unorm8x4,
        (C::I16, 2) => F::Sint16x2,
        (C::I16, 4) => F::Sint16x4,
        (C::Snorm16, 2) => F::Snorm16x2,
        (C::Snorm16, 4) => F::Snorm16x4,
        (C::Unorm16, 2) => F::Unorm16x2,
        (C::Unorm16, 4) => F::Unorm16x4,
        (C::I32, 1) => F::Sint32,
        (C::I32, 2) => F::Sint32x2,
        (C::I32, 3) => F::Sint32x3,
        (C::I32, 4) => F::Sint32x4,
        (C::U32, 1) => F::Uint32,
        (C::U32, 2) => F::Uint32x2,
        (C::U32, 3) => F::Uint32x3,
        (C::U32, 4) => F::Uint32x4,
        _ => return None,
    })
}

/// Native formats only come in 2- and 4-wide variants for 16-bit components.
fn pair_or_quad(components: u8) -> u32 {
    if components <= 2 {
        2
    } else {
        4
    }
}

fn copy_or_widen(
    component: NativeComponent,
    components: u8,
    output_components: u32,
) -> Option<ElementFormat> {
    let format = native_format(component, output_components)?;
    let conversion = if output_components == u32::from(components) {
        ElementConversion::None
    } else {
        ElementConversion::Widen
    };
    Some(ElementFormat::new(format, conversion))
}

fn to_float(components: u8) -> ElementFormat {
    match native_format(NativeComponent::F32, u32::from(components)) {
        Some(format) => ElementFormat::new(format, ElementConversion::ToFloat),
        None => ElementFormat::new(NativeVertexFormat::Float32x4, ElementConversion::ToFloat),
    }
}

/// Pick the native representation of `format`.
///
/// Prefers a byte-for-byte copy, then widening to a wider integer format, then conversion to
/// floats, depending on which vertex formats the backend supports.
pub fn map_element_format(format: AttributeFormat, caps: VertexFormatCaps) -> ElementFormat {
    use ElementType as T;
    let n = format.components;

    let mapped = if format.pure_integer {
        match format.element_type {
            T::Byte | T::Short | T::Int if caps.int32 => {
                if format.element_type == T::Int {
                    copy_or_widen(NativeComponent::I32, n, u32::from(n))
                } else {
                    native_format(NativeComponent::I32, u32::from(n))
                        .map(|f| ElementFormat::new(f, ElementConversion::Widen))
                }
            }
            T::UnsignedByte | T::UnsignedShort | T::UnsignedInt if caps.int32 => {
                if format.element_type == T::UnsignedInt {
                    copy_or_widen(NativeComponent::U32, n, u32::from(n))
                } else {
                    native_format(NativeComponent::U32, u32::from(n))
                        .map(|f| ElementFormat::new(f, ElementConversion::Widen))
                }
            }
            _ => None,
        }
    } else {
        match (format.element_type, format.normalized) {
            (T::Float, _) => copy_or_widen(NativeComponent::F32, n, u32::from(n)),
            (T::Byte, false) => native_format(NativeComponent::I16, pair_or_quad(n))
                .map(|f| ElementFormat::new(f, ElementConversion::Widen)),
            (T::UnsignedByte, false) if caps.ubyte4 => copy_or_widen(NativeComponent::U8, n, 4),
            (T::UnsignedByte, true) if caps.ubyte4n => {
                copy_or_widen(NativeComponent::Unorm8, n, 4)
            }
            (T::Short, false) => copy_or_widen(NativeComponent::I16, n, pair_or_quad(n)),
            (T::Short, true) if caps.short_normalized => {
                copy_or_widen(NativeComponent::Snorm16, n, pair_or_quad(n))
            }
            (T::UnsignedShort, true) if caps.short_normalized => {
                copy_or_widen(NativeComponent::Unorm16, n, pair_or_quad(n))
            }
            (T::HalfFloat, _) if caps.half_float => {
                copy_or_widen(NativeComponent::F16, n, pair_or_quad(n))
            }
            _ => None,
        }
    };

    mapped.unwrap_or_else(|| to_float(n))
}

/// Fill value of component `i` for a padded output element.
fn default_component(component: NativeComponent, i: usize) -> i64 {
    if i < 3 {
        return 0;
    }
    match component {
        NativeComponent::F32 => i64::from(1.0f32.to_bits()),
        NativeComponent::F16 => i64::from(f16::ONE.to_bits()),
        NativeComponent::Unorm8 => 0xff,
        NativeComponent::Snorm16 => 0x7fff,
        NativeComponent::Unorm16 => 0xffff,
        NativeComponent::U8
        | NativeComponent::I16
        | NativeComponent::I32
        | NativeComponent::U32 => 1,
    }
}

fn read_integer(ty: ElementType, src: &[u8]) -> i64 {
    match ty {
        ElementType::Byte => i64::from(src[0] as i8),
        ElementType::UnsignedByte => i64::from(src[0]),
        ElementType::Short => i64::from(i16::from_le_bytes([src[0], src[1]])),
        ElementType::UnsignedShort | ElementType::HalfFloat => {
            i64::from(u16::from_le_bytes([src[0], src[1]]))
        }
        ElementType::Int | ElementType::Fixed => {
            i64::from(i32::from_le_bytes([src[0], src[1], src[2], src[3]]))
        }
        ElementType::UnsignedInt | ElementType::Float => {
            i64::from(u32::from_le_bytes([src[0], src[1], src[2], src[3]]))
        }
    }
}

fn write_integer(component: NativeComponent, value: i64, dst: &mut [u8]) {
    match component.byte_size() {
        1 => dst[0] = value as u8,
        2 => dst[..2].copy_from_slice(&(value as u16).to_le_bytes()),
        _ => dst[..4].copy_from_slice(&(value as u32).to_le_bytes()),
    }
}

fn read_float(format: AttributeFormat, src: &[u8]) -> f32 {
    let ty = format.element_type;
    match ty {
        ElementType::Float => f32::from_le_bytes([src[0], src[1], src[2], src[3]]),
        ElementType::HalfFloat => f16::from_bits(u16::from_le_bytes([src[0], src[1]])).to_f32(),
        ElementType::Fixed => read_integer(ty, src) as f32 / 65536.0,
        _ => {
            let v = read_integer(ty, src);
            if !format.normalized {
                return v as f32;
            }
            match ty {
                ElementType::Byte => signed_normalize(v, i64::from(i8::MAX)),
                ElementType::Short => signed_normalize(v, i64::from(i16::MAX)),
                ElementType::Int => signed_normalize(v, i64::from(i32::MAX)),
                ElementType::UnsignedByte => (v as f64 / f64::from(u8::MAX)) as f32,
                ElementType::UnsignedShort => (v as f64 / f64::from(u16::MAX)) as f32,
                _ => (v as f64 / f64::from(u32::MAX)) as f32,
            }
        }
    }
}

/// `(2v + 1) / (2 max + 1)`
fn signed_normalize(v: i64, max: i64) -> f32 {
    ((2 * v + 1) as f64 / (2 * max + 1) as f64) as f32
}

/// Source format plus chosen native representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPlan {
    pub source: AttributeFormat,
    pub output: ElementFormat,
}

impl ConversionPlan {
    pub fn new(source: AttributeFormat, caps: VertexFormatCaps) -> Self {
        Self {
            source,
            output: map_element_format(source, caps),
        }
    }

    pub fn needs_conversion(&self) -> bool {
        self.output.conversion != ElementConversion::None
    }

    /// Convert `count` elements read at `src_stride` from `src` into tightly packed output
    /// elements in `dst`.
    ///
    /// `src` must hold `(count - 1) * src_stride + source size` bytes and `dst` must hold
    /// `count * output size` bytes.
    pub fn convert(&self, src: &[u8], src_stride: usize, count: usize, dst: &mut [u8]) {
        let in_size = self.source.byte_size() as usize;
        let out_size = self.output.byte_size as usize;

        if self.output.conversion == ElementConversion::None && src_stride == in_size {
            let len = count * in_size;
            dst[..len].copy_from_slice(&src[..len]);
            return;
        }

        for i in 0..count {
            let element = &src[i * src_stride..i * src_stride + in_size];
            let out = &mut dst[i * out_size..(i + 1) * out_size];
            self.convert_element(element, out);
        }
    }

    fn convert_element(&self, src: &[u8], dst: &mut [u8]) {
        let in_comp = self.source.element_type.byte_size() as usize;
        let n = usize::from(self.source.components);
        match self.output.conversion {
            ElementConversion::None => dst.copy_from_slice(&src[..dst.len()]),
            ElementConversion::ToFloat => {
                for c in 0..n {
                    let v = read_float(self.source, &src[c * in_comp..]);
                    dst[c * 4..c * 4 + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
            ElementConversion::Widen => {
                let component = self.output.format.component();
                let out_comp = component.byte_size() as usize;
                let out_n = self.output.format.components() as usize;
                for c in 0..out_n {
                    let v = if c < n {
                        read_integer(self.source.element_type, &src[c * in_comp..])
                    } else {
                        default_component(component, c)
                    };
                    write_integer(component, v, &mut dst[c * out_comp..]);
                }
            }
        }
    }
}
