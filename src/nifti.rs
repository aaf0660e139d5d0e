//! Single-file NIfTI-1 (`.nii`) codec, the default [`VolumeCodec`].
//!
//! Reads either byte order and every integer/float datatype up to 64 bits, applying
//! `scl_slope`/`scl_inter`. Writes float64 volumes in the byte order of the template
//! header the volume was loaded with, so the group average keeps the subjects' grid.

use crate::volume::{Volume, VolumeCodec, VolumeError, voxel_count};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::Array1;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;
const DIM_OFFSET: usize = 40;
const DATATYPE_OFFSET: usize = 70;
const BITPIX_OFFSET: usize = 72;
const PIXDIM_OFFSET: usize = 76;
const VOX_OFFSET_OFFSET: usize = 108;
const SCL_SLOPE_OFFSET: usize = 112;
const SCL_INTER_OFFSET: usize = 116;
const CAL_MAX_OFFSET: usize = 124;
const CAL_MIN_OFFSET: usize = 128;
const MAGIC_OFFSET: usize = 344;
const MAGIC_SINGLE_FILE: &[u8; 4] = b"n+1\0";
const MAGIC_PAIR: &[u8; 4] = b"ni1\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;
const DT_INT64: i16 = 1024;
const DT_UINT64: i16 = 1280;

/// Raw 348-byte header of a loaded image plus the byte order it was stored in.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    raw: Vec<u8>,
    big_endian: bool,
}

impl NiftiHeader {
    fn synthesized(shape: &[usize]) -> Self {
        let mut raw = vec![0u8; HEADER_SIZE];
        LittleEndian::write_i32(&mut raw[0..4], HEADER_SIZE as i32);
        // qfac and unit voxel spacing; geometry codes stay zero.
        for axis in 0..=shape.len().min(7) {
            let at = PIXDIM_OFFSET + 4 * axis;
            LittleEndian::write_f32(&mut raw[at..at + 4], 1.0);
        }
        raw[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC_SINGLE_FILE);
        Self {
            raw,
            big_endian: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiCodec;

impl NiftiCodec {
    pub fn new() -> Self {
        Self
    }
}

impl VolumeCodec for NiftiCodec {
    fn load(&self, path: &Path) -> Result<Volume, VolumeError> {
        let bytes = std::fs::read(path).map_err(|e| VolumeError::io(path, e))?;
        if bytes.starts_with(&GZIP_MAGIC) {
            return Err(VolumeError::Compressed(path.to_path_buf()));
        }
        if bytes.len() < HEADER_SIZE {
            return Err(format_error(path, "file is shorter than a NIfTI-1 header"));
        }
        if LittleEndian::read_i32(&bytes[0..4]) == HEADER_SIZE as i32 {
            decode::<LittleEndian>(&bytes, path, false)
        } else if BigEndian::read_i32(&bytes[0..4]) == HEADER_SIZE as i32 {
            decode::<BigEndian>(&bytes, path, true)
        } else {
            Err(format_error(path, "sizeof_hdr is not 348 in either byte order"))
        }
    }

    fn save(&self, volume: &Volume, path: &Path) -> Result<(), VolumeError> {
        let header = volume
            .header()
            .cloned()
            .unwrap_or_else(|| NiftiHeader::synthesized(volume.shape()));
        if header.big_endian {
            encode::<BigEndian>(volume, header.raw, path)
        } else {
            encode::<LittleEndian>(volume, header.raw, path)
        }
    }
}

fn format_error(path: &Path, reason: impl Into<String>) -> VolumeError {
    VolumeError::Format {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn bytes_per_voxel(datatype: i16) -> Option<usize> {
    match datatype {
        DT_UINT8 | DT_INT8 => Some(1),
        DT_INT16 | DT_UINT16 => Some(2),
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => Some(4),
        DT_INT64 | DT_UINT64 | DT_FLOAT64 => Some(8),
        _ => None,
    }
}

fn decode<B: ByteOrder>(bytes: &[u8], path: &Path, big_endian: bool) -> Result<Volume, VolumeError> {
    let magic = &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4];
    if magic == MAGIC_PAIR {
        return Err(format_error(path, "header/image pairs (.hdr/.img) are not supported"));
    }
    if magic != MAGIC_SINGLE_FILE {
        return Err(format_error(path, "missing n+1 magic"));
    }

    let ndim = B::read_i16(&bytes[DIM_OFFSET..DIM_OFFSET + 2]);
    if !(1..=7).contains(&ndim) {
        return Err(format_error(path, format!("dim[0] = {ndim} is outside 1..=7")));
    }
    let mut shape = Vec::with_capacity(ndim as usize);
    for axis in 1..=ndim as usize {
        let at = DIM_OFFSET + 2 * axis;
        let extent = B::read_i16(&bytes[at..at + 2]);
        if extent < 1 {
            return Err(format_error(path, format!("dim[{axis}] = {extent} is not positive")));
        }
        shape.push(extent as usize);
    }

    let datatype = B::read_i16(&bytes[DATATYPE_OFFSET..DATATYPE_OFFSET + 2]);
    let width = bytes_per_voxel(datatype).ok_or_else(|| VolumeError::UnsupportedDatatype {
        path: path.to_path_buf(),
        code: datatype,
    })?;

    let vox_offset = B::read_f32(&bytes[VOX_OFFSET_OFFSET..VOX_OFFSET_OFFSET + 4]);
    if !(vox_offset.is_finite() && vox_offset >= HEADER_SIZE as f32) {
        return Err(format_error(path, format!("vox_offset {vox_offset} is invalid")));
    }
    if vox_offset as f64 > bytes.len() as f64 {
        return Err(format_error(
            path,
            format!("vox_offset {vox_offset} lies past the end of a {}-byte file", bytes.len()),
        ));
    }
    let offset = vox_offset as usize;
    let needed = voxel_count(&shape)
        .and_then(|nvox| nvox.checked_mul(width))
        .and_then(|len| len.checked_add(offset))
        .ok_or_else(|| {
            format_error(path, format!("dimensions {shape:?} overflow the address space"))
        })?;
    if bytes.len() < needed {
        return Err(format_error(
            path,
            format!("expected {needed} bytes of image data, found {}", bytes.len()),
        ));
    }
    let payload = &bytes[offset..needed];

    let raw: Vec<f64> = match datatype {
        DT_UINT8 => payload.iter().map(|&v| v as f64).collect(),
        DT_INT8 => payload.iter().map(|&v| v as i8 as f64).collect(),
        DT_INT16 => payload.chunks_exact(2).map(|c| B::read_i16(c) as f64).collect(),
        DT_UINT16 => payload.chunks_exact(2).map(|c| B::read_u16(c) as f64).collect(),
        DT_INT32 => payload.chunks_exact(4).map(|c| B::read_i32(c) as f64).collect(),
        DT_UINT32 => payload.chunks_exact(4).map(|c| B::read_u32(c) as f64).collect(),
        DT_FLOAT32 => payload.chunks_exact(4).map(|c| B::read_f32(c) as f64).collect(),
        DT_INT64 => payload.chunks_exact(8).map(|c| B::read_i64(c) as f64).collect(),
        DT_UINT64 => payload.chunks_exact(8).map(|c| B::read_u64(c) as f64).collect(),
        _ => payload.chunks_exact(8).map(B::read_f64).collect(),
    };

    let slope = B::read_f32(&bytes[SCL_SLOPE_OFFSET..SCL_SLOPE_OFFSET + 4]) as f64;
    let inter = B::read_f32(&bytes[SCL_INTER_OFFSET..SCL_INTER_OFFSET + 4]) as f64;
    let mut data = Array1::from(raw);
    // slope == 0 means "no scaling" in NIfTI-1.
    if slope != 0.0 && slope.is_finite() && inter.is_finite() && !(slope == 1.0 && inter == 0.0) {
        data.mapv_inplace(|v| v * slope + inter);
    }

    let header = NiftiHeader {
        raw: bytes[..HEADER_SIZE].to_vec(),
        big_endian,
    };
    Ok(Volume::new(shape, data)?.with_header(header))
}

fn encode<B: ByteOrder>(volume: &Volume, mut raw: Vec<u8>, path: &Path) -> Result<(), VolumeError> {
    let shape = volume.shape();
    if shape.is_empty() || shape.len() > 7 {
        return Err(format_error(path, format!("cannot store a {}-d volume", shape.len())));
    }

    B::write_i32(&mut raw[0..4], HEADER_SIZE as i32);
    for entry in raw[DIM_OFFSET..DIM_OFFSET + 16].iter_mut() {
        *entry = 0;
    }
    B::write_i16(&mut raw[DIM_OFFSET..DIM_OFFSET + 2], shape.len() as i16);
    for (axis, &extent) in shape.iter().enumerate() {
        let extent = i16::try_from(extent)
            .map_err(|_| format_error(path, format!("extent {extent} does not fit dim[]")))?;
        let at = DIM_OFFSET + 2 * (axis + 1);
        B::write_i16(&mut raw[at..at + 2], extent);
    }
    B::write_i16(&mut raw[DATATYPE_OFFSET..DATATYPE_OFFSET + 2], DT_FLOAT64);
    B::write_i16(&mut raw[BITPIX_OFFSET..BITPIX_OFFSET + 2], 64);
    B::write_f32(&mut raw[VOX_OFFSET_OFFSET..VOX_OFFSET_OFFSET + 4], DATA_OFFSET as f32);
    B::write_f32(&mut raw[SCL_SLOPE_OFFSET..SCL_SLOPE_OFFSET + 4], 1.0);
    B::write_f32(&mut raw[SCL_INTER_OFFSET..SCL_INTER_OFFSET + 4], 0.0);
    B::write_f32(&mut raw[CAL_MAX_OFFSET..CAL_MAX_OFFSET + 4], 0.0);
    B::write_f32(&mut raw[CAL_MIN_OFFSET..CAL_MIN_OFFSET + 4], 0.0);
    raw[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC_SINGLE_FILE);

    let file = File::create(path).map_err(|e| VolumeError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let io = |e: std::io::Error| VolumeError::io(path, e);
    writer.write_all(&raw).map_err(io)?;
    // Empty extension block.
    writer.write_all(&[0u8; DATA_OFFSET - HEADER_SIZE]).map_err(io)?;
    for &value in volume.data().iter() {
        writer.write_f64::<B>(value).map_err(io)?;
    }
    writer.flush().map_err(io)?;
    Ok(())
}
