//! Volumetric chunk handling: axis normalization, cuboid carving, padding.
//!
//! Readers hand back arrays in whatever axis order their source uses. Before
//! carving, every chunk is normalized to T-Z-Y-X with C-contiguous storage so
//! cuboid extraction is a plain slice. Cuboids on the far edge of a chunk are
//! zero-padded to the native cuboid shape.

use ndarray::{s, Array4, ArrayD, Axis, Ix3, Ix4};

/// Native cuboid extent in X.
pub const CUBOID_X: usize = voxhaul_core::CUBOID_X as usize;
/// Native cuboid extent in Y.
pub const CUBOID_Y: usize = voxhaul_core::CUBOID_Y as usize;
/// Native cuboid extent in Z.
pub const CUBOID_Z: usize = voxhaul_core::CUBOID_Z as usize;

/// Axis order of an array returned by a chunk reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisOrder {
    /// 3-D, X varies slowest.
    Xyz,
    /// 3-D, Z varies slowest.
    Zyx,
    /// 4-D with a trailing time axis.
    Xyzt,
    /// 4-D, already in the native upload order.
    Tzyx,
}

impl AxisOrder {
    fn rank(&self) -> usize {
        match self {
            AxisOrder::Xyz | AxisOrder::Zyx => 3,
            AxisOrder::Xyzt | AxisOrder::Tzyx => 4,
        }
    }
}

/// A chunk array as produced by a reader, tagged by voxel datatype.
#[derive(Debug, Clone)]
pub enum ChunkData {
    /// 8-bit voxels.
    U8(ArrayD<u8>),
    /// 16-bit voxels.
    U16(ArrayD<u16>),
    /// 32-bit voxels.
    U32(ArrayD<u32>),
    /// 64-bit voxels.
    U64(ArrayD<u64>),
}

impl ChunkData {
    /// Voxel element width in bits.
    pub fn element_bits(&self) -> usize {
        match self {
            ChunkData::U8(_) => 8,
            ChunkData::U16(_) => 16,
            ChunkData::U32(_) => 32,
            ChunkData::U64(_) => 64,
        }
    }
}

/// A chunk normalized to T-Z-Y-X, C-contiguous.
#[derive(Debug, Clone)]
pub enum NormalizedChunk {
    /// 8-bit voxels.
    U8(Array4<u8>),
    /// 16-bit voxels.
    U16(Array4<u16>),
    /// 32-bit voxels.
    U32(Array4<u32>),
    /// 64-bit voxels.
    U64(Array4<u64>),
}

impl NormalizedChunk {
    /// Shape as (t, z, y, x).
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        match self {
            NormalizedChunk::U8(a) => a.dim(),
            NormalizedChunk::U16(a) => a.dim(),
            NormalizedChunk::U32(a) => a.dim(),
            NormalizedChunk::U64(a) => a.dim(),
        }
    }

    /// Voxel element width in bits.
    pub fn element_bits(&self) -> usize {
        match self {
            NormalizedChunk::U8(_) => 8,
            NormalizedChunk::U16(_) => 16,
            NormalizedChunk::U32(_) => 32,
            NormalizedChunk::U64(_) => 64,
        }
    }
}

/// A chunk that could not be normalized or carved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// The reader's array rank does not match its declared axis order.
    #[error("chunk array has rank {got}, expected {expected} for {order:?} order")]
    WrongRank {
        /// Rank the axis order implies.
        expected: usize,
        /// Rank the reader actually produced.
        got: usize,
        /// The declared order.
        order: AxisOrder,
    },
    /// A cuboid descriptor points outside the chunk.
    #[error("cuboid offset ({x}, {y}, {z}) lies outside chunk of shape {shape:?}")]
    OffsetOutOfBounds {
        /// X offset from the descriptor.
        x: usize,
        /// Y offset from the descriptor.
        y: usize,
        /// Z offset from the descriptor.
        z: usize,
        /// Normalized chunk shape (t, z, y, x).
        shape: [usize; 4],
    },
}

/// Raw bytes of one full-size cuboid, ready for compression.
#[derive(Debug, Clone)]
pub struct CuboidPayload {
    /// C-order voxel bytes, little-endian elements.
    pub bytes: Vec<u8>,
    /// Voxel element width in bits.
    pub typesize_bits: usize,
}

trait Element: Copy + Default + bytemuck::Pod + Send + Sync + 'static {}
impl Element for u8 {}
impl Element for u16 {}
impl Element for u32 {}
impl Element for u64 {}

fn normalize_array<T: Element>(
    arr: ArrayD<T>,
    order: AxisOrder,
) -> Result<Array4<T>, ChunkError> {
    let got = arr.ndim();
    let rank_err = || ChunkError::WrongRank {
        expected: order.rank(),
        got,
        order,
    };

    let tzyx = match order {
        AxisOrder::Xyz => {
            let a = arr.into_dimensionality::<Ix3>().map_err(|_| rank_err())?;
            a.permuted_axes([2, 1, 0]).insert_axis(Axis(0))
        }
        AxisOrder::Zyx => {
            let a = arr.into_dimensionality::<Ix3>().map_err(|_| rank_err())?;
            a.insert_axis(Axis(0))
        }
        AxisOrder::Xyzt => {
            let a = arr.into_dimensionality::<Ix4>().map_err(|_| rank_err())?;
            a.permuted_axes([3, 2, 1, 0])
        }
        AxisOrder::Tzyx => arr.into_dimensionality::<Ix4>().map_err(|_| rank_err())?,
    };

    Ok(tzyx.as_standard_layout().to_owned())
}

/// Normalize a reader's chunk to T-Z-Y-X C-contiguous storage.
pub fn normalize(data: ChunkData, order: AxisOrder) -> Result<NormalizedChunk, ChunkError> {
    Ok(match data {
        ChunkData::U8(a) => NormalizedChunk::U8(normalize_array(a, order)?),
        ChunkData::U16(a) => NormalizedChunk::U16(normalize_array(a, order)?),
        ChunkData::U32(a) => NormalizedChunk::U32(normalize_array(a, order)?),
        ChunkData::U64(a) => NormalizedChunk::U64(normalize_array(a, order)?),
    })
}

fn carve<T: Element>(
    chunk: &Array4<T>,
    x: usize,
    y: usize,
    z: usize,
) -> Result<Array4<T>, ChunkError> {
    let (t_len, z_len, y_len, x_len) = chunk.dim();
    if x >= x_len || y >= y_len || z >= z_len {
        return Err(ChunkError::OffsetOutOfBounds {
            x,
            y,
            z,
            shape: [t_len, z_len, y_len, x_len],
        });
    }

    let xe = (x + CUBOID_X).min(x_len);
    let ye = (y + CUBOID_Y).min(y_len);
    let ze = (z + CUBOID_Z).min(z_len);
    let view = chunk.slice(s![.., z..ze, y..ye, x..xe]);

    if view.dim() == (t_len, CUBOID_Z, CUBOID_Y, CUBOID_X) {
        return Ok(view.to_owned());
    }

    let mut full = Array4::from_elem((t_len, CUBOID_Z, CUBOID_Y, CUBOID_X), T::default());
    full.slice_mut(s![.., 0..(ze - z), 0..(ye - y), 0..(xe - x)])
        .assign(&view);
    Ok(full)
}

fn to_bytes<T: Element>(arr: &Array4<T>) -> Vec<u8> {
    match arr.as_slice() {
        Some(slice) => bytemuck::cast_slice(slice).to_vec(),
        None => {
            let data: Vec<T> = arr.iter().copied().collect();
            bytemuck::cast_slice(&data).to_vec()
        }
    }
}

/// Carve the cuboid at chunk-relative offset `(x, y, z)`, zero-padding to the
/// native cuboid shape when the chunk ends short of a full cuboid.
pub fn cuboid_payload(
    chunk: &NormalizedChunk,
    x: usize,
    y: usize,
    z: usize,
) -> Result<CuboidPayload, ChunkError> {
    let (bytes, typesize_bits) = match chunk {
        NormalizedChunk::U8(a) => (to_bytes(&carve(a, x, y, z)?), 8),
        NormalizedChunk::U16(a) => (to_bytes(&carve(a, x, y, z)?), 16),
        NormalizedChunk::U32(a) => (to_bytes(&carve(a, x, y, z)?), 32),
        NormalizedChunk::U64(a) => (to_bytes(&carve(a, x, y, z)?), 64),
    };
    Ok(CuboidPayload {
        bytes,
        typesize_bits,
    })
}
