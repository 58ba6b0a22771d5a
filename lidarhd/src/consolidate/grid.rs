//! Esri ASCII grid (.asc) mosaicking for the raster data types.
//!
//! Elevation tiles (DTM/DSM/DHM) are regular grids sharing one cell size and
//! grid alignment. The mosaic allocates a union-extent grid filled with the
//! nodata value and pastes each tile in merge order; cells carrying data
//! overwrite, nodata cells never erase data from an earlier tile. With inputs
//! ordered by ascending tile id this makes overlaps last-wins by id.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::las::MergeOutcome;

/// Default nodata marker when a tile header omits one.
const DEFAULT_NODATA: f64 = -9999.0;

/// Refuse to allocate absurd mosaics (guards against misparsed headers).
const MAX_CELLS: usize = 100_000_000;

/// Fatal grid merge failures. Per-file problems are skip reasons.
#[derive(Debug, Error)]
pub enum GridError {
    /// Every input was unreadable or misaligned.
    #[error("no valid grid input: {0}")]
    NoValidInput(String),

    /// The merged output could not be written.
    #[error("I/O error: {0}")]
    Io(String),

    /// The union extent is implausibly large.
    #[error("merged grid would have {0} cells")]
    TooLarge(usize),
}

/// One parsed ASCII grid. Values are row-major, first row northernmost.
struct AscGrid {
    ncols: usize,
    nrows: usize,
    xll: f64,
    yll: f64,
    cellsize: f64,
    nodata: f64,
    values: Vec<f64>,
}

impl AscGrid {
    /// Y coordinate of the grid's top (north) edge.
    fn top(&self) -> f64 {
        self.yll + self.nrows as f64 * self.cellsize
    }

    fn right(&self) -> f64 {
        self.xll + self.ncols as f64 * self.cellsize
    }
}

/// Mosaics `inputs` (already in merge order) into `output`.
pub(crate) fn merge_tiles(
    inputs: &[(String, PathBuf)],
    output: &Path,
) -> Result<MergeOutcome, GridError> {
    let mut skipped = Vec::new();
    let mut valid: Vec<(&String, AscGrid)> = Vec::new();

    for (id, path) in inputs {
        match parse_grid(path) {
            Ok(grid) => {
                if let Some((_, base)) = valid.first() {
                    if let Some(reason) = alignment_mismatch(base, &grid) {
                        skipped.push((id.clone(), reason));
                        continue;
                    }
                }
                valid.push((id, grid));
            }
            Err(reason) => skipped.push((id.clone(), reason)),
        }
    }

    if valid.is_empty() {
        return Err(GridError::NoValidInput(format!(
            "all {} raster input(s) unreadable or misaligned",
            inputs.len()
        )));
    }

    let cellsize = valid[0].1.cellsize;
    let nodata = valid[0].1.nodata;
    let xll = valid.iter().map(|(_, g)| g.xll).fold(f64::INFINITY, f64::min);
    let yll = valid.iter().map(|(_, g)| g.yll).fold(f64::INFINITY, f64::min);
    let right = valid
        .iter()
        .map(|(_, g)| g.right())
        .fold(f64::NEG_INFINITY, f64::max);
    let top = valid
        .iter()
        .map(|(_, g)| g.top())
        .fold(f64::NEG_INFINITY, f64::max);

    let ncols = ((right - xll) / cellsize).round() as usize;
    let nrows = ((top - yll) / cellsize).round() as usize;
    if ncols.saturating_mul(nrows) > MAX_CELLS {
        return Err(GridError::TooLarge(ncols.saturating_mul(nrows)));
    }

    let mut values = vec![nodata; ncols * nrows];
    for (_, grid) in &valid {
        let col_off = ((grid.xll - xll) / cellsize).round() as usize;
        let row_off = ((top - grid.top()) / cellsize).round() as usize;
        for r in 0..grid.nrows {
            for c in 0..grid.ncols {
                let v = grid.values[r * grid.ncols + c];
                if v == grid.nodata {
                    continue;
                }
                values[(row_off + r) * ncols + (col_off + c)] = v;
            }
        }
    }

    write_grid(
        output,
        &AscGrid {
            ncols,
            nrows,
            xll,
            yll,
            cellsize,
            nodata,
            values,
        },
    )?;
    Ok(MergeOutcome { skipped })
}

/// Grids must share cell size and lattice alignment to be mosaicked without
/// resampling.
fn alignment_mismatch(base: &AscGrid, other: &AscGrid) -> Option<String> {
    let cs = base.cellsize;
    if (other.cellsize - cs).abs() > cs * 1e-9 {
        return Some(format!(
            "cell size {} differs from {}",
            other.cellsize, cs
        ));
    }
    let dx = (other.xll - base.xll) / cs;
    let dy = (other.yll - base.yll) / cs;
    if (dx - dx.round()).abs() > 1e-6 || (dy - dy.round()).abs() > 1e-6 {
        return Some("grid lattice misaligned".to_string());
    }
    None
}

/// Parses an ASCII grid. The error string is the skip reason.
fn parse_grid(path: &Path) -> Result<AscGrid, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read: {}", e))?;
    let mut tokens = text.split_whitespace();

    let mut ncols = None;
    let mut nrows = None;
    let mut xll = None;
    let mut yll = None;
    let mut cellsize = None;
    let mut nodata = DEFAULT_NODATA;
    let mut first_value = None;

    // Header lines are `key value` pairs; the first bare number starts the
    // data section.
    while let Some(token) = tokens.next() {
        let key = token.to_ascii_lowercase();
        let known = matches!(
            key.as_str(),
            "ncols" | "nrows" | "xllcorner" | "yllcorner" | "xllcenter" | "yllcenter"
                | "cellsize" | "nodata_value"
        );
        if !known {
            first_value = Some(
                token
                    .parse::<f64>()
                    .map_err(|_| format!("unexpected token in header: {}", token))?,
            );
            break;
        }
        let value: f64 = tokens
            .next()
            .ok_or_else(|| format!("missing value for {}", key))?
            .parse()
            .map_err(|_| format!("bad value for {}", key))?;
        match key.as_str() {
            "ncols" => ncols = Some(value as usize),
            "nrows" => nrows = Some(value as usize),
            "xllcorner" => xll = Some(value),
            "yllcorner" => yll = Some(value),
            "cellsize" => cellsize = Some(value),
            "nodata_value" => nodata = value,
            // Center-registered headers shift by half a cell.
            "xllcenter" => xll = Some(value), // adjusted below once cellsize is known
            "yllcenter" => yll = Some(value),
            _ => unreachable!(),
        }
    }

    let ncols = ncols.ok_or("missing ncols")?;
    let nrows = nrows.ok_or("missing nrows")?;
    let mut xll = xll.ok_or("missing xllcorner")?;
    let mut yll = yll.ok_or("missing yllcorner")?;
    let cellsize = cellsize.ok_or("missing cellsize")?;
    if cellsize <= 0.0 {
        return Err("non-positive cellsize".to_string());
    }
    if text.to_ascii_lowercase().contains("xllcenter") {
        xll -= cellsize / 2.0;
    }
    if text.to_ascii_lowercase().contains("yllcenter") {
        yll -= cellsize / 2.0;
    }

    let expected = ncols
        .checked_mul(nrows)
        .ok_or("grid dimensions overflow")?;
    if expected == 0 {
        return Err("empty grid".to_string());
    }
    let mut values = Vec::with_capacity(expected);
    if let Some(v) = first_value {
        values.push(v);
    }
    for token in tokens {
        if values.len() == expected {
            return Err("more values than ncols * nrows".to_string());
        }
        values.push(
            token
                .parse::<f64>()
                .map_err(|_| format!("bad cell value: {}", token))?,
        );
    }
    if values.len() != expected {
        return Err(format!(
            "expected {} values, found {}",
            expected,
            values.len()
        ));
    }

    Ok(AscGrid {
        ncols,
        nrows,
        xll,
        yll,
        cellsize,
        nodata,
        values,
    })
}

fn write_grid(path: &Path, grid: &AscGrid) -> Result<(), GridError> {
    let io_err = |e: std::io::Error| GridError::Io(e.to_string());
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    writeln!(writer, "ncols {}", grid.ncols).map_err(io_err)?;
    writeln!(writer, "nrows {}", grid.nrows).map_err(io_err)?;
    writeln!(writer, "xllcorner {}", grid.xll).map_err(io_err)?;
    writeln!(writer, "yllcorner {}", grid.yll).map_err(io_err)?;
    writeln!(writer, "cellsize {}", grid.cellsize).map_err(io_err)?;
    writeln!(writer, "NODATA_value {}", grid.nodata).map_err(io_err)?;
    for row in grid.values.chunks(grid.ncols) {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(writer, "{}", line.join(" ")).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_asc(path: &Path, xll: f64, yll: f64, rows: &[&[f64]]) {
        let nrows = rows.len();
        let ncols = rows[0].len();
        let mut text = format!(
            "ncols {}\nnrows {}\nxllcorner {}\nyllcorner {}\ncellsize 1\nNODATA_value -9999\n",
            ncols, nrows, xll, yll
        );
        for row in rows {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            text.push_str(&line.join(" "));
            text.push('\n');
        }
        std::fs::write(path, text).unwrap();
    }

    fn parse(path: &Path) -> AscGrid {
        parse_grid(path).unwrap()
    }

    #[test]
    fn test_parse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.asc");
        write_asc(&path, 10.0, 20.0, &[&[1.0, 2.0], &[3.0, 4.0]]);
        let grid = parse(&path);
        assert_eq!((grid.ncols, grid.nrows), (2, 2));
        assert_eq!(grid.top(), 22.0);
        assert_eq!(grid.values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_adjacent_tiles_widen_the_mosaic() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        write_asc(&a, 0.0, 0.0, &[&[1.0, 1.0], &[1.0, 1.0]]);
        write_asc(&b, 2.0, 0.0, &[&[2.0, 2.0], &[2.0, 2.0]]);

        let output = dir.path().join("m.asc");
        merge_tiles(
            &[("a".into(), a), ("b".into(), b)],
            &output,
        )
        .unwrap();

        let merged = parse(&output);
        assert_eq!((merged.ncols, merged.nrows), (4, 2));
        assert_eq!(merged.values[0..4], [1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_overlap_is_last_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        // Both 2x1 rows at y=0; b overlaps a's second column.
        write_asc(&a, 0.0, 0.0, &[&[1.0, 1.0]]);
        write_asc(&b, 1.0, 0.0, &[&[2.0, 2.0]]);

        let output = dir.path().join("m.asc");
        merge_tiles(
            &[("a".into(), a), ("b".into(), b)],
            &output,
        )
        .unwrap();

        let merged = parse(&output);
        assert_eq!(merged.values, vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_nodata_never_erases_data() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        write_asc(&a, 0.0, 0.0, &[&[5.0, 5.0]]);
        write_asc(&b, 0.0, 0.0, &[&[-9999.0, 7.0]]);

        let output = dir.path().join("m.asc");
        merge_tiles(
            &[("a".into(), a), ("b".into(), b)],
            &output,
        )
        .unwrap();

        assert_eq!(parse(&output).values, vec![5.0, 7.0]);
    }

    #[test]
    fn test_misaligned_tile_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        write_asc(&a, 0.0, 0.0, &[&[1.0]]);
        write_asc(&b, 0.5, 0.0, &[&[2.0]]);

        let output = dir.path().join("m.asc");
        let outcome = merge_tiles(
            &[("a".into(), a), ("b".into(), b)],
            &output,
        )
        .unwrap();
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].1.contains("misaligned"));
    }

    #[test]
    fn test_corrupt_grid_is_skipped_and_all_corrupt_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.asc");
        std::fs::write(&bad, "ncols 2\nnrows 2\n1 2 3").unwrap();

        let output = dir.path().join("m.asc");
        let result = merge_tiles(&[("bad".into(), bad.clone())], &output);
        assert!(matches!(result, Err(GridError::NoValidInput(_))));

        let good = dir.path().join("good.asc");
        write_asc(&good, 0.0, 0.0, &[&[1.0]]);
        let outcome = merge_tiles(
            &[("bad".into(), bad), ("good".into(), good)],
            &output,
        )
        .unwrap();
        assert_eq!(outcome.skipped.len(), 1);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        write_asc(&a, 0.0, 0.0, &[&[1.0, 2.0]]);
        write_asc(&b, 2.0, 0.0, &[&[3.0, 4.0]]);
        let inputs = vec![("a".to_string(), a), ("b".to_string(), b)];

        let m1 = dir.path().join("m1.asc");
        let m2 = dir.path().join("m2.asc");
        merge_tiles(&inputs, &m1).unwrap();
        merge_tiles(&inputs, &m2).unwrap();
        assert_eq!(std::fs::read(m1).unwrap(), std::fs::read(m2).unwrap());
    }
}
