//! Byte-level compression for cuboid payloads.
//!
//! Payloads are byte-shuffled by element width (grouping the n-th byte of
//! every element together) and then LZ4 block-compressed with a length
//! prefix. The shuffle is what makes multi-byte voxel data compress well:
//! high-order bytes of neighboring voxels are usually equal.

/// A payload that could not be decompressed.
#[derive(Debug, thiserror::Error)]
#[error("cuboid payload decompression failed: {0}")]
pub struct DecodeError(#[from] lz4_flex::block::DecompressError);

fn typesize_bytes(typesize_bits: usize) -> usize {
    (typesize_bits / 8).max(1)
}

fn shuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || !data.len().is_multiple_of(typesize) {
        return data.to_vec();
    }
    let elems = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for byte in 0..typesize {
        for elem in 0..elems {
            out[byte * elems + elem] = data[elem * typesize + byte];
        }
    }
    out
}

fn unshuffle(data: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || !data.len().is_multiple_of(typesize) {
        return data.to_vec();
    }
    let elems = data.len() / typesize;
    let mut out = vec![0u8; data.len()];
    for byte in 0..typesize {
        for elem in 0..elems {
            out[elem * typesize + byte] = data[byte * elems + elem];
        }
    }
    out
}

/// Compress a cuboid payload. `typesize_bits` is the voxel element width in
/// bits, as carried by the channel datatype.
pub fn compress(data: &[u8], typesize_bits: usize) -> Vec<u8> {
    let shuffled = shuffle(data, typesize_bytes(typesize_bits));
    lz4_flex::block::compress_prepend_size(&shuffled)
}

/// Invert [`compress`]; used by tests and debugging tooling.
pub fn decompress(data: &[u8], typesize_bits: usize) -> Result<Vec<u8>, DecodeError> {
    let shuffled = lz4_flex::block::decompress_size_prepended(data)?;
    Ok(unshuffle(&shuffled, typesize_bytes(typesize_bits)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_u8() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let packed = compress(&data, 8);
        assert_eq!(decompress(&packed, 8).unwrap(), data);
    }

    #[test]
    fn round_trips_u16() {
        let data: Vec<u8> = (0..8192u32).flat_map(|v| (v as u16).to_le_bytes()).collect();
        let packed = compress(&data, 16);
        assert_eq!(decompress(&packed, 16).unwrap(), data);
    }

    #[test]
    fn shuffle_groups_bytes_by_position() {
        // Two u16 elements 0x0201 and 0x0403 (LE bytes 01 02 03 04) shuffle to
        // low bytes first, high bytes second.
        assert_eq!(shuffle(&[1, 2, 3, 4], 2), vec![1, 3, 2, 4]);
        assert_eq!(unshuffle(&[1, 3, 2, 4], 2), vec![1, 2, 3, 4]);
    }

    #[test]
    fn zero_heavy_payload_shrinks() {
        let mut data = vec![0u8; 512 * 512 * 16];
        data[0] = 7;
        let packed = compress(&data, 8);
        assert!(packed.len() < data.len() / 100);
    }

    #[test]
    fn odd_length_payload_passes_through_shuffle() {
        let data = vec![9u8; 33];
        let packed = compress(&data, 16);
        assert_eq!(decompress(&packed, 16).unwrap(), data);
    }
}
