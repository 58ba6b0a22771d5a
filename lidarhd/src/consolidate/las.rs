//! LAS point-cloud merging.
//!
//! Merging uncompressed LAS tiles is point-record concatenation: all tiles of
//! one acquisition share the point format, record length, and scale/offset,
//! so the merged file is the first tile's header block followed by every
//! tile's point records, with the header's point count, by-return counts, and
//! bounds rewritten.
//!
//! Header fields are read and patched at their fixed little-endian offsets
//! (LAS 1.0–1.4 share the 227-byte core layout; 1.4 appends 64-bit counts).
//! Compressed payloads (LAZ/COPC, recognizable by bit 7 of the point format
//! byte) cannot be concatenated and are skipped with a reason.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Fixed header offsets shared by all LAS versions.
const SIGNATURE: &[u8; 4] = b"LASF";
const OFF_VERSION_MINOR: usize = 25;
const OFF_HEADER_SIZE: usize = 94;
const OFF_POINT_DATA: usize = 96;
const OFF_POINT_FORMAT: usize = 104;
const OFF_RECORD_LENGTH: usize = 105;
const OFF_LEGACY_COUNT: usize = 107;
const OFF_LEGACY_BY_RETURN: usize = 111;
const OFF_SCALE: usize = 131;
const OFF_OFFSET: usize = 155;
const OFF_BOUNDS: usize = 179;
const CORE_HEADER_SIZE: usize = 227;

/// LAS 1.4 additions (header size 375).
const OFF_EXT_COUNT: usize = 247;
const OFF_EXT_BY_RETURN: usize = 255;
const V14_HEADER_SIZE: usize = 375;

/// Bit 7 of the point format byte marks LAZ compression.
const COMPRESSION_BIT: u8 = 0x80;

/// Fatal LAS merge failures. Per-file problems are skip reasons, not errors.
#[derive(Debug, Error)]
pub enum LasError {
    /// Every input was unreadable, compressed, or incompatible.
    #[error("no valid LAS input: {0}")]
    NoValidInput(String),

    /// The merged output could not be written.
    #[error("I/O error: {0}")]
    Io(String),

    /// The merged point count does not fit the legacy 32-bit header field.
    #[error("merged point count {0} exceeds the legacy LAS limit")]
    TooManyPoints(u64),
}

/// Result of a merge: which inputs were left out, and why.
pub(crate) struct MergeOutcome {
    pub skipped: Vec<(String, String)>,
}

/// Parsed LAS header, plus the raw prefix (header + VLRs) for rewriting.
struct LasHeader {
    prefix: Vec<u8>,
    header_size: u16,
    point_offset: u32,
    point_format: u8,
    record_length: u16,
    point_count: u64,
    by_return: [u64; 15],
    scale: [f64; 3],
    offset: [f64; 3],
    /// max_x, min_x, max_y, min_y, max_z, min_z — header field order.
    bounds: [f64; 6],
}

impl LasHeader {
    fn is_v14(&self) -> bool {
        self.header_size as usize >= V14_HEADER_SIZE
    }

    fn compatible_with(&self, other: &LasHeader) -> Option<String> {
        if self.point_format != other.point_format {
            return Some(format!(
                "point format {} differs from {}",
                other.point_format, self.point_format
            ));
        }
        if self.record_length != other.record_length {
            return Some(format!(
                "record length {} differs from {}",
                other.record_length, self.record_length
            ));
        }
        if self.scale != other.scale || self.offset != other.offset {
            return Some("scale/offset differs".to_string());
        }
        None
    }
}

/// Concatenates the point records of `inputs` (already in merge order) into
/// `output`, rewriting the header of the first valid input.
pub(crate) fn merge_tiles(
    inputs: &[(String, PathBuf)],
    output: &Path,
) -> Result<MergeOutcome, LasError> {
    let mut skipped = Vec::new();
    let mut valid: Vec<(&String, &PathBuf, LasHeader)> = Vec::new();

    for (id, path) in inputs {
        match read_header(path) {
            Ok(header) => {
                if let Some(first) = valid.first() {
                    if let Some(reason) = first.2.compatible_with(&header) {
                        skipped.push((id.clone(), reason));
                        continue;
                    }
                }
                valid.push((id, path, header));
            }
            Err(reason) => skipped.push((id.clone(), reason)),
        }
    }

    if valid.is_empty() {
        return Err(LasError::NoValidInput(format!(
            "all {} point-cloud input(s) unreadable or unsupported",
            inputs.len()
        )));
    }

    let total: u64 = valid.iter().map(|(_, _, h)| h.point_count).sum();
    let base = &valid[0].2;
    if !base.is_v14() && total > u32::MAX as u64 {
        return Err(LasError::TooManyPoints(total));
    }

    let mut by_return = [0u64; 15];
    let mut bounds = base.bounds;
    for (_, _, header) in &valid {
        for (sum, n) in by_return.iter_mut().zip(header.by_return.iter()) {
            *sum = sum.saturating_add(*n);
        }
        bounds[0] = bounds[0].max(header.bounds[0]); // max_x
        bounds[1] = bounds[1].min(header.bounds[1]); // min_x
        bounds[2] = bounds[2].max(header.bounds[2]); // max_y
        bounds[3] = bounds[3].min(header.bounds[3]); // min_y
        bounds[4] = bounds[4].max(header.bounds[4]); // max_z
        bounds[5] = bounds[5].min(header.bounds[5]); // min_z
    }

    let prefix = patched_prefix(base, total, &by_return, &bounds)?;

    let io_err = |e: std::io::Error| LasError::Io(e.to_string());
    let mut writer = BufWriter::new(File::create(output).map_err(io_err)?);
    writer.write_all(&prefix).map_err(io_err)?;
    for (_, path, header) in &valid {
        let mut file = File::open(path).map_err(io_err)?;
        file.seek(SeekFrom::Start(header.point_offset as u64))
            .map_err(io_err)?;
        let len = header.point_count * header.record_length as u64;
        let copied = std::io::copy(&mut file.take(len), &mut writer).map_err(io_err)?;
        if copied != len {
            // Header promised more points than the file holds; validation in
            // read_header should prevent this, but never emit a short file.
            return Err(LasError::Io(format!(
                "{}: expected {} point bytes, copied {}",
                path.display(),
                len,
                copied
            )));
        }
    }
    writer.flush().map_err(io_err)?;

    Ok(MergeOutcome { skipped })
}

/// Reads and validates a LAS header. The error string is the skip reason.
fn read_header(path: &Path) -> Result<LasHeader, String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open: {}", e))?;
    let file_len = file
        .metadata()
        .map_err(|e| format!("cannot stat: {}", e))?
        .len();

    let mut core = [0u8; CORE_HEADER_SIZE];
    file.read_exact(&mut core)
        .map_err(|_| "file shorter than a LAS header".to_string())?;
    if &core[0..4] != SIGNATURE {
        return Err("missing LASF signature".to_string());
    }

    let header_size = read_u16(&core, OFF_HEADER_SIZE);
    let point_offset = read_u32(&core, OFF_POINT_DATA);
    if (header_size as usize) < CORE_HEADER_SIZE || point_offset < header_size as u32 {
        return Err("inconsistent header sizes".to_string());
    }

    let point_format = core[OFF_POINT_FORMAT];
    if point_format & COMPRESSION_BIT != 0 {
        return Err("compressed (LAZ) payload, merge unsupported".to_string());
    }
    let record_length = read_u16(&core, OFF_RECORD_LENGTH);
    if record_length == 0 {
        return Err("zero point record length".to_string());
    }

    // Full prefix: header plus VLRs, everything before the point data.
    let mut prefix = vec![0u8; point_offset as usize];
    prefix[..CORE_HEADER_SIZE].copy_from_slice(&core);
    file.read_exact(&mut prefix[CORE_HEADER_SIZE..])
        .map_err(|_| "truncated header block".to_string())?;

    let version_minor = core[OFF_VERSION_MINOR];
    let legacy_count = read_u32(&core, OFF_LEGACY_COUNT) as u64;
    let mut by_return = [0u64; 15];
    for (i, slot) in by_return.iter_mut().take(5).enumerate() {
        *slot = read_u32(&core, OFF_LEGACY_BY_RETURN + i * 4) as u64;
    }

    let mut point_count = legacy_count;
    if version_minor >= 4 && header_size as usize >= V14_HEADER_SIZE {
        point_count = read_u64(&prefix, OFF_EXT_COUNT);
        for (i, slot) in by_return.iter_mut().enumerate() {
            *slot = read_u64(&prefix, OFF_EXT_BY_RETURN + i * 8);
        }
    }

    let expected_end = point_offset as u64 + point_count * record_length as u64;
    if file_len < expected_end {
        return Err(format!(
            "truncated point data: header promises {} bytes, file has {}",
            expected_end, file_len
        ));
    }

    let mut scale = [0f64; 3];
    let mut offset = [0f64; 3];
    let mut bounds = [0f64; 6];
    for i in 0..3 {
        scale[i] = read_f64(&core, OFF_SCALE + i * 8);
        offset[i] = read_f64(&core, OFF_OFFSET + i * 8);
    }
    for i in 0..6 {
        bounds[i] = read_f64(&core, OFF_BOUNDS + i * 8);
    }

    Ok(LasHeader {
        prefix,
        header_size,
        point_offset,
        point_format,
        record_length,
        point_count,
        by_return,
        scale,
        offset,
        bounds,
    })
}

/// Clones the base prefix with merged counts and bounds patched in.
fn patched_prefix(
    base: &LasHeader,
    total: u64,
    by_return: &[u64; 15],
    bounds: &[f64; 6],
) -> Result<Vec<u8>, LasError> {
    let mut prefix = base.prefix.clone();

    let legacy_total = u32::try_from(total).unwrap_or(0);
    write_u32(&mut prefix, OFF_LEGACY_COUNT, legacy_total);
    for i in 0..5 {
        let n = u32::try_from(by_return[i]).unwrap_or(0);
        write_u32(&mut prefix, OFF_LEGACY_BY_RETURN + i * 4, n);
    }
    for (i, b) in bounds.iter().enumerate() {
        write_f64(&mut prefix, OFF_BOUNDS + i * 8, *b);
    }
    if base.is_v14() {
        write_u64(&mut prefix, OFF_EXT_COUNT, total);
        for (i, n) in by_return.iter().enumerate() {
            write_u64(&mut prefix, OFF_EXT_BY_RETURN + i * 8, *n);
        }
    }
    Ok(prefix)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_bits(read_u64(buf, at))
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_f64(buf: &mut [u8], at: usize, value: f64) {
    write_u64(buf, at, value.to_bits());
}
