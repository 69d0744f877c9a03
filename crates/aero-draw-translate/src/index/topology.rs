use std::fmt;

/// Client primitive modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl fmt::Display for PrimitiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimitiveMode::Points => "points",
            PrimitiveMode::Lines => "lines",
            PrimitiveMode::LineLoop => "line_loop",
            PrimitiveMode::LineStrip => "line_strip",
            PrimitiveMode::Triangles => "triangles",
            PrimitiveMode::TriangleStrip => "triangle_strip",
            PrimitiveMode::TriangleFan => "triangle_fan",
        };
        f.write_str(s)
    }
}

/// Topologies every backend supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

/// Index rewriting needed to draw a mode the backend lacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveEmulation {
    /// Line strip closed by repeating the first index.
    LineLoop,
    /// Triangle list with triangle(i) = (0, i, i+1).
    TriangleFan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimitiveTranslation {
    pub topology: NativeTopology,
    pub emulation: Option<PrimitiveEmulation>,
}

pub fn translate_primitive_mode(mode: PrimitiveMode) -> PrimitiveTranslation {
    let (topology, emulation) = match mode {
        PrimitiveMode::Points => (NativeTopology::PointList, None),
        PrimitiveMode::Lines => (NativeTopology::LineList, None),
        PrimitiveMode::LineLoop => (NativeTopology::LineStrip, Some(PrimitiveEmulation::LineLoop)),
        PrimitiveMode::LineStrip => (NativeTopology::LineStrip, None),
        PrimitiveMode::Triangles => (NativeTopology::TriangleList, None),
        PrimitiveMode::TriangleStrip => (NativeTopology::TriangleStrip, None),
        PrimitiveMode::TriangleFan => (
            NativeTopology::TriangleList,
            Some(PrimitiveEmulation::TriangleFan),
        ),
    };
    PrimitiveTranslation {
        topology,
        emulation,
    }
}

/// Append the first index so a line strip closes the loop.
pub fn close_line_loop(indices: &[u32]) -> Vec<u32> {
    let Some(&first) = indices.first() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(indices.len() + 1);
    out.extend_from_slice(indices);
    out.push(first);
    out
}

/// Expand a triangle fan into a triangle list.
pub fn expand_triangle_fan(indices: &[u32]) -> Vec<u32> {
    if indices.len() < 3 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity((indices.len() - 2) * 3);
    for i in 1..(indices.len() - 1) {
        out.push(indices[0]);
        out.push(indices[i]);
        out.push(indices[i + 1]);
    }
    out
}

/// Rewrite `indices` (the logical index sequence of the draw) for `emulation`.
pub fn emulate(emulation: PrimitiveEmulation, indices: &[u32]) -> Vec<u32> {
    match emulation {
        PrimitiveEmulation::LineLoop => close_line_loop(indices),
        PrimitiveEmulation::TriangleFan => expand_triangle_fan(indices),
    }
}
