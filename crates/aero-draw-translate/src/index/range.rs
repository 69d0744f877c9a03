use crate::hal::IndexFormat;

use super::{IndexRange, IndexType};

/// Read index `i` of a packed index array.
fn read_index(index_type: IndexType, bytes: &[u8], i: usize) -> u32 {
    match index_type {
        IndexType::U8 => u32::from(bytes[i]),
        IndexType::U16 => u32::from(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]])),
        IndexType::U32 => u32::from_le_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ]),
    }
}

/// Iterate `count` indices of `index_type` from the start of `bytes`.
pub fn indices(
    index_type: IndexType,
    bytes: &[u8],
    count: u32,
) -> impl Iterator<Item = u32> + '_ {
    (0..count as usize).map(move |i| read_index(index_type, bytes, i))
}

/// Single linear scan for `[min, max]`. An empty range reports `0..=0`.
pub fn compute_range(index_type: IndexType, bytes: &[u8], count: u32) -> IndexRange {
    let mut iter = indices(index_type, bytes, count);
    let Some(first) = iter.next() else {
        return IndexRange { min: 0, max: 0 };
    };
    let (min, max) = iter.fold((first, first), |(min, max), v| (min.min(v), max.max(v)));
    IndexRange { min, max }
}

/// Copy `count` indices into `dst` as `format`, widening 8-bit indices.
pub fn convert_indices(
    index_type: IndexType,
    format: IndexFormat,
    src: &[u8],
    count: u32,
    dst: &mut [u8],
) {
    let count = count as usize;
    match (index_type, format) {
        (IndexType::U16, IndexFormat::U16) => dst[..count * 2].copy_from_slice(&src[..count * 2]),
        (IndexType::U32, IndexFormat::U32) => dst[..count * 4].copy_from_slice(&src[..count * 4]),
        _ => {
            for (i, v) in indices(index_type, src, count as u32).enumerate() {
                write_index(format, dst, i, v);
            }
        }
    }
}

pub fn write_index(format: IndexFormat, dst: &mut [u8], i: usize, value: u32) {
    match format {
        IndexFormat::U16 => dst[i * 2..i * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        IndexFormat::U32 => dst[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Pack `values` as `format`.
pub fn pack_indices(format: IndexFormat, values: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * format.byte_size() as usize];
    for (i, &v) in values.iter().enumerate() {
        write_index(format, &mut out, i, v);
    }
    out
}
