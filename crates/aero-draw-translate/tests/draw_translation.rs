use aero_draw_translate::hal::RecordingDevice;
use aero_draw_translate::{
    AttributeFormat, AttributePath, BufferUsage, DeviceCaps, IndexPath, IndexSource, IndexType,
    PrimitiveEmulation, TranslateError, TranslationContext, TranslatorConfig, VertexAttribute,
};
use pretty_assertions::assert_eq;

fn context() -> TranslationContext<RecordingDevice> {
    TranslationContext::new(
        RecordingDevice::new(DeviceCaps::d3d9_class()),
        TranslatorConfig::for_tests(),
    )
}

/// Three triangles, 9 vertices of float3 positions.
fn triangle_positions() -> Vec<f32> {
    (0..27).map(|i| i as f32 * 0.5).collect()
}

fn u16_bytes(values: &[u16]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

#[test]
fn nine_vertex_draw_end_to_end() {
    let mut ctx = context();

    // Enabled attribute with neither a buffer nor a client pointer.
    let missing = [VertexAttribute {
        enabled: true,
        format: AttributeFormat::float(3),
        ..VertexAttribute::default()
    }];
    assert!(matches!(
        ctx.prepare_vertex_data(&missing, 0b1, 0, 9, 0),
        Err(TranslateError::InvalidOperation(_))
    ));

    let positions = triangle_positions();
    let bytes: &[u8] = bytemuck::cast_slice(&positions);
    let client = [VertexAttribute::client(AttributeFormat::float(3), bytes, 0)];
    let out = ctx.prepare_vertex_data(&client, 0b1, 0, 9, 0).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].stride, 12);
    assert_eq!(out[0].offset, 0);
    assert_eq!(out[0].path, AttributePath::Streamed);
    let uploaded = ctx.device().buffer_contents(out[0].buffer).unwrap();
    assert_eq!(&uploaded[..bytes.len()], bytes);

    // Indexed: the same vertices and indices from static buffers.
    let vertices = ctx.create_buffer();
    ctx.buffer_data(vertices, bytes, BufferUsage::Static).unwrap();
    let indices = ctx.create_buffer();
    let index_values: Vec<u16> = (0..9).collect();
    ctx.buffer_data(indices, &u16_bytes(&index_values), BufferUsage::Static)
        .unwrap();
    let attrs = [VertexAttribute::buffer(
        AttributeFormat::float(3),
        vertices,
        12,
        0,
    )];
    let source = IndexSource::Buffer {
        name: indices,
        offset: 0,
    };

    let first_vertices = ctx.prepare_vertex_data(&attrs, 0b1, 0, 9, 0).unwrap();
    let first_indices = ctx.prepare_index_data(IndexType::U16, 9, source).unwrap();
    assert_eq!(first_vertices[0].path, AttributePath::StaticMiss);
    assert_eq!(first_indices.path, IndexPath::StaticMiss);
    assert_eq!((first_indices.min_index, first_indices.max_index), (0, 8));

    let before = ctx.stats().snapshot();
    let second_vertices = ctx.prepare_vertex_data(&attrs, 0b1, 0, 9, 0).unwrap();
    let second_indices = ctx.prepare_index_data(IndexType::U16, 9, source).unwrap();
    let after = ctx.stats().snapshot();

    assert_eq!(second_vertices[0].path, AttributePath::StaticHit);
    assert_eq!(second_indices.path, IndexPath::StaticHit);
    assert_eq!(second_vertices[0].offset, first_vertices[0].offset);
    assert_eq!(second_indices.start_offset, first_indices.start_offset);
    assert_eq!(
        (second_indices.min_index, second_indices.max_index),
        (first_indices.min_index, first_indices.max_index)
    );
    assert_eq!(after.conversions, before.conversions);
    assert_eq!(after.index_range_scans, before.index_range_scans);
}

#[test]
fn range_cache_matches_a_naive_scan() {
    let mut ctx = context();
    let values: Vec<u16> = vec![7, 3, 9, 12, 4, 4, 30, 1, 18, 5, 22, 6];
    let indices = ctx.create_buffer();
    ctx.buffer_data(indices, &u16_bytes(&values), BufferUsage::Static)
        .unwrap();

    let ranges = [(0u64, 12u32), (2, 3), (6, 2), (8, 4), (2, 3)];
    for (first, count) in ranges {
        let source = IndexSource::Buffer {
            name: indices,
            offset: first * 2,
        };
        let a = ctx.prepare_index_data(IndexType::U16, count, source).unwrap();
        let b = ctx.prepare_index_data(IndexType::U16, count, source).unwrap();

        let window = &values[first as usize..first as usize + count as usize];
        let naive = (
            u32::from(*window.iter().min().unwrap()),
            u32::from(*window.iter().max().unwrap()),
        );
        assert_eq!((a.min_index, a.max_index), naive, "range at {first}+{count}");
        assert_eq!(
            (b.min_index, b.max_index, b.start_offset),
            (a.min_index, a.max_index, a.start_offset)
        );
        assert_eq!(b.path, IndexPath::StaticHit);
        assert_eq!(a.start_index as u64, first);
    }
}

#[test]
fn buffer_write_invalidates_cached_ranges() {
    let mut ctx = context();
    let indices = ctx.create_buffer();
    ctx.buffer_data(indices, &u16_bytes(&[0, 1, 2, 3]), BufferUsage::Static)
        .unwrap();
    let source = IndexSource::Buffer {
        name: indices,
        offset: 0,
    };
    let cached = ctx.prepare_index_data(IndexType::U16, 4, source).unwrap();
    assert_eq!(cached.max_index, 3);

    ctx.buffer_sub_data(indices, 2, &u16_bytes(&[40])).unwrap();
    let invalidations = ctx.stats().snapshot().static_invalidations;

    let fresh = ctx.prepare_index_data(IndexType::U16, 4, source).unwrap();
    assert_ne!(fresh.path, IndexPath::StaticHit);
    assert_eq!((fresh.min_index, fresh.max_index), (0, 40));
    assert_eq!(ctx.stats().snapshot().static_invalidations, invalidations + 1);
    assert!(!ctx.buffer(indices).unwrap().is_promoted());
}

#[test]
fn streaming_wrap_discards_exactly_once() {
    let mut ctx = context();
    let positions = triangle_positions();
    let bytes: &[u8] = bytemuck::cast_slice(&positions);
    let attrs = [VertexAttribute::client(AttributeFormat::float(3), bytes, 0)];

    // 108 bytes per draw against a 256 byte stream.
    let first = ctx.prepare_vertex_data(&attrs, 0b1, 0, 9, 0).unwrap();
    let second = ctx.prepare_vertex_data(&attrs, 0b1, 0, 9, 0).unwrap();
    assert_eq!((first[0].offset, second[0].offset), (0, 108));
    assert_eq!(first[0].serial, second[0].serial);
    assert_eq!(ctx.stats().snapshot().stream_discards, 0);

    let third = ctx.prepare_vertex_data(&attrs, 0b1, 0, 9, 0).unwrap();
    assert_eq!(third[0].offset, 0);
    assert_ne!(third[0].serial, first[0].serial);
    let stats = ctx.stats().snapshot();
    assert_eq!(stats.stream_discards, 1);
    assert_eq!(stats.stream_regrows, 0);

    // A single draw larger than the stream regrows it instead.
    let many: Vec<f32> = (0..90).map(|i| i as f32).collect();
    let large = [VertexAttribute::client(
        AttributeFormat::float(3),
        bytemuck::cast_slice(&many),
        0,
    )];
    let grown = ctx.prepare_vertex_data(&large, 0b1, 0, 30, 0).unwrap();
    assert_eq!(grown[0].offset, 0);
    assert_eq!(ctx.stats().snapshot().stream_regrows, 1);
    assert!(ctx.vertex_translator().stream().capacity() >= 360);
}

#[test]
fn triangle_fan_is_expanded_to_a_list() {
    let mut ctx = context();
    let out = ctx
        .prepare_emulated_indices(PrimitiveEmulation::TriangleFan, None, 5)
        .unwrap();
    assert_eq!(out.count, 9);
    assert_eq!((out.min_index, out.max_index), (0, 4));

    let contents = ctx.device().buffer_contents(out.buffer).unwrap();
    let start = out.start_offset as usize;
    let written: Vec<u16> = contents[start..start + 18]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(written, vec![0, 1, 2, 0, 2, 3, 0, 3, 4]);
}

#[test]
fn repeated_streaming_promotes_a_buffer() {
    let mut ctx = context();
    let indices = ctx.create_buffer();
    ctx.buffer_data(indices, &u16_bytes(&[2, 1, 0, 3]), BufferUsage::Dynamic)
        .unwrap();
    let source = IndexSource::Buffer {
        name: indices,
        offset: 0,
    };

    // Promotion happens once more than 3 * size bytes were read unmodified.
    for _ in 0..4 {
        let out = ctx.prepare_index_data(IndexType::U16, 4, source).unwrap();
        assert_eq!(out.path, IndexPath::Streamed);
    }
    assert!(ctx.buffer(indices).unwrap().is_promoted());
    assert_eq!(ctx.stats().snapshot().static_promotions, 1);

    let promoted = ctx.prepare_index_data(IndexType::U16, 4, source).unwrap();
    assert_eq!(promoted.path, IndexPath::StaticMiss);
    let hit = ctx.prepare_index_data(IndexType::U16, 4, source).unwrap();
    assert_eq!(hit.path, IndexPath::StaticHit);
}
