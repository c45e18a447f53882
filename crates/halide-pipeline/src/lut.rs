//! CUBE 3D look-up tables: parsing, validation, and repair.
//!
//! A CUBE file is line-oriented text. Comment (`#`) and blank lines are
//! ignored, keyword lines (`TITLE`, `DOMAIN_MIN`, `LUT_3D_SIZE`, ...)
//! carry metadata, and every remaining line is one `R G B` row with
//! components in `[0, 1]`.
//!
//! # Grid layout
//!
//! Rows are stored with **blue varying fastest and red slowest**, so the
//! entry for grid coordinate `(r, g, b)` lives at `r·N² + g·N + b`. The
//! color transform in [`crate::color`] uses the same order; tables built
//! with [`LutTable::from_fn`] follow it automatically.
//!
//! # Repair
//!
//! Files exported by some tools carry a few rows too many or too few.
//! Up to [`ROW_SLACK`] missing rows are padded with the last row and
//! surplus rows are truncated. Anything further off is rejected.

use tracing::debug;

use crate::types::LutError;

/// Maximum row-count mismatch that is repaired instead of rejected.
pub const ROW_SLACK: usize = 20;

/// Grid sizes tried when a file has no `LUT_3D_SIZE` directive and the
/// row count is not an exact cube.
pub const CONVENTIONAL_SIZES: [usize; 3] = [17, 33, 65];

/// Smallest supported grid size.
pub const MIN_SIZE: usize = 2;

/// Largest supported grid size.
pub const MAX_SIZE: usize = 256;

/// A validated 3D color table of `size³` RGB entries in `[0, 1]`.
///
/// Immutable once constructed. Construction guarantees
/// `MIN_SIZE <= size <= MAX_SIZE` and `entries.len() == size³`, so
/// the color transform never has to handle a degenerate table.
#[derive(Debug, Clone, PartialEq)]
pub struct LutTable {
    size: usize,
    entries: Vec<[f32; 3]>,
}

impl LutTable {
    /// Build a table from pre-computed entries.
    ///
    /// # Errors
    ///
    /// Returns [`LutError::InvalidSize`] if `size` is out of range and
    /// [`LutError::RowCountMismatch`] if `entries.len() != size³`.
    pub fn new(size: usize, entries: Vec<[f32; 3]>) -> Result<Self, LutError> {
        check_size(size)?;
        let expected = size.pow(3);
        if entries.len() != expected {
            return Err(LutError::RowCountMismatch {
                expected,
                found: entries.len(),
            });
        }
        Ok(Self { size, entries })
    }

    /// Build a table by evaluating `f(r, g, b)` at every grid coordinate.
    ///
    /// # Errors
    ///
    /// Returns [`LutError::InvalidSize`] if `size` is out of range.
    pub fn from_fn(
        size: usize,
        mut f: impl FnMut(usize, usize, usize) -> [f32; 3],
    ) -> Result<Self, LutError> {
        check_size(size)?;
        let mut entries = Vec::with_capacity(size.pow(3));
        for r in 0..size {
            for g in 0..size {
                for b in 0..size {
                    entries.push(f(r, g, b));
                }
            }
        }
        Self::new(size, entries)
    }

    /// The identity table: every grid point maps to its own coordinate.
    ///
    /// # Errors
    ///
    /// Returns [`LutError::InvalidSize`] if `size` is out of range.
    #[allow(clippy::cast_precision_loss)]
    pub fn identity(size: usize) -> Result<Self, LutError> {
        check_size(size)?;
        let step = (size - 1) as f32;
        Self::from_fn(size, |r, g, b| {
            [r as f32 / step, g as f32 / step, b as f32 / step]
        })
    }

    /// Grid points per axis (`N`).
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// All `N³` entries in storage order.
    #[must_use]
    pub fn entries(&self) -> &[[f32; 3]] {
        &self.entries
    }

    /// Flattened storage index for a grid coordinate.
    #[must_use]
    pub const fn index(&self, r: usize, g: usize, b: usize) -> usize {
        (r * self.size + g) * self.size + b
    }

    /// Entry at a grid coordinate. Coordinates must be `< size`.
    #[must_use]
    pub fn lookup(&self, r: usize, g: usize, b: usize) -> [f32; 3] {
        self.entries[self.index(r, g, b)]
    }
}

/// Parse CUBE text into a validated [`LutTable`].
///
/// # Errors
///
/// - [`LutError::Empty`] if there are no color rows.
/// - [`LutError::MalformedDirective`] / [`LutError::MalformedRow`] on
///   unreadable lines.
/// - [`LutError::Unsupported`] for 1D LUTs.
/// - [`LutError::InvalidSize`] / [`LutError::UnknownSize`] if the grid
///   size is out of range or cannot be inferred.
/// - [`LutError::RowCountMismatch`] if the row count is off by more than
///   [`ROW_SLACK`].
pub fn parse(text: &str) -> Result<LutTable, LutError> {
    let mut declared: Option<usize> = None;
    let mut rows: Vec<[f32; 3]> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };

        if first.starts_with(|c: char| c.is_ascii_alphabetic()) {
            match first {
                "LUT_3D_SIZE" => {
                    let size = fields
                        .next()
                        .and_then(|v| v.parse::<usize>().ok())
                        .ok_or(LutError::MalformedDirective { line: line_no })?;
                    declared = Some(size);
                }
                "LUT_1D_SIZE" => {
                    return Err(LutError::Unsupported("1D LUTs are not supported".into()));
                }
                // TITLE, DOMAIN_MIN, DOMAIN_MAX, LUT_3D_INPUT_RANGE, ...
                _ => {}
            }
            continue;
        }

        rows.push(parse_row(first, fields, line_no)?);
    }

    if rows.is_empty() {
        return Err(LutError::Empty);
    }

    let size = match declared {
        Some(size) => {
            check_size(size)?;
            size
        }
        None => infer_size(rows.len())?,
    };

    reconcile_rows(&mut rows, size.pow(3))?;
    LutTable::new(size, rows)
}

/// Parse one data row of exactly three finite numbers, clamped to `[0, 1]`.
fn parse_row<'a>(
    first: &'a str,
    rest: impl Iterator<Item = &'a str>,
    line: usize,
) -> Result<[f32; 3], LutError> {
    let mut out = [0.0_f32; 3];
    let mut count = 0;
    for field in std::iter::once(first).chain(rest) {
        if count == 3 {
            return Err(LutError::MalformedRow { line });
        }
        let value: f32 = field
            .parse()
            .map_err(|_| LutError::MalformedRow { line })?;
        if !value.is_finite() {
            return Err(LutError::MalformedRow { line });
        }
        out[count] = value.clamp(0.0, 1.0);
        count += 1;
    }
    if count != 3 {
        return Err(LutError::MalformedRow { line });
    }
    Ok(out)
}

const fn check_size(size: usize) -> Result<(), LutError> {
    if size < MIN_SIZE || size > MAX_SIZE {
        return Err(LutError::InvalidSize(size));
    }
    Ok(())
}

/// Infer the grid size of a table that has no size directive.
///
/// Exact cubes win. Otherwise the conventional sizes are tried, then
/// the rounded cube root, each accepted only within [`ROW_SLACK`].
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn infer_size(rows: usize) -> Result<usize, LutError> {
    let rounded = (rows as f64).cbrt().round() as usize;
    if rounded.pow(3) == rows {
        check_size(rounded)?;
        return Ok(rounded);
    }

    let within_slack = |size: usize| size.pow(3).abs_diff(rows) <= ROW_SLACK;

    if let Some(&size) = CONVENTIONAL_SIZES.iter().find(|&&s| within_slack(s)) {
        debug!(rows, size, "inferred conventional LUT size");
        return Ok(size);
    }
    if (MIN_SIZE..=MAX_SIZE).contains(&rounded) && within_slack(rounded) {
        debug!(rows, size = rounded, "inferred LUT size from cube root");
        return Ok(rounded);
    }
    Err(LutError::UnknownSize { rows })
}

/// Pad or truncate `rows` to `expected` when the mismatch is within slack.
fn reconcile_rows(rows: &mut Vec<[f32; 3]>, expected: usize) -> Result<(), LutError> {
    let found = rows.len();
    if found == expected {
        return Ok(());
    }
    if found.abs_diff(expected) > ROW_SLACK {
        return Err(LutError::RowCountMismatch { expected, found });
    }

    if found < expected {
        let Some(&last) = rows.last() else {
            return Err(LutError::Empty);
        };
        rows.resize(expected, last);
        debug!(found, expected, "padded short LUT with its last row");
    } else {
        rows.truncate(expected);
        debug!(found, expected, "truncated surplus LUT rows");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;

    /// Render a CUBE document for an `n`-sized identity table.
    fn identity_cube(n: usize, with_header: bool, row_delta: isize) -> String {
        let mut text = String::from("# generated\nTITLE \"identity\"\n");
        if with_header {
            text.push_str(&format!("LUT_3D_SIZE {n}\n"));
        }
        text.push_str("DOMAIN_MIN 0.0 0.0 0.0\nDOMAIN_MAX 1.0 1.0 1.0\n\n");
        let table = LutTable::identity(n).unwrap();
        let mut entries: Vec<[f32; 3]> = table.entries().to_vec();
        if row_delta < 0 {
            entries.truncate(entries.len() - row_delta.unsigned_abs());
        } else {
            for _ in 0..row_delta {
                entries.push([0.5, 0.25, 0.125]);
            }
        }
        for [r, g, b] in entries {
            text.push_str(&format!("{r:.6} {g:.6} {b:.6}\n"));
        }
        text
    }

    #[test]
    fn parse_declared_size_yields_n_cubed_entries() {
        for n in [2, 5, 17] {
            let table = parse(&identity_cube(n, true, 0)).unwrap();
            assert_eq!(table.size(), n);
            assert_eq!(table.entries().len(), n.pow(3));
        }
    }

    #[test]
    fn parse_preserves_storage_order() {
        let table = parse(&identity_cube(3, true, 0)).unwrap();
        // Blue varies fastest: entry 1 is (r=0, g=0, b=1).
        assert_eq!(table.entries()[1], [0.0, 0.0, 0.5]);
        assert_eq!(table.lookup(2, 0, 0), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn parse_pads_short_table_with_last_row() {
        let table = parse(&identity_cube(4, true, -5)).unwrap();
        assert_eq!(table.entries().len(), 64);
        let last_real = table.entries()[58];
        for entry in &table.entries()[59..] {
            assert_eq!(*entry, last_real);
        }
    }

    #[test]
    fn parse_truncates_surplus_rows() {
        let table = parse(&identity_cube(4, true, 12)).unwrap();
        assert_eq!(table.entries().len(), 64);
        assert_eq!(table.lookup(3, 3, 3), [1.0, 1.0, 1.0]);
        assert!(table.entries().iter().all(|e| *e != [0.5, 0.25, 0.125]));
    }

    #[test]
    fn parse_rejects_mismatch_beyond_slack() {
        let result = parse(&identity_cube(4, true, -(ROW_SLACK as isize) - 1));
        assert_eq!(
            result,
            Err(LutError::RowCountMismatch {
                expected: 64,
                found: 64 - ROW_SLACK - 1,
            })
        );
    }

    #[test]
    fn parse_infers_exact_cube_without_header() {
        let table = parse(&identity_cube(5, false, 0)).unwrap();
        assert_eq!(table.size(), 5);
    }

    #[test]
    fn parse_infers_conventional_size_within_slack() {
        let table = parse(&identity_cube(17, false, -3)).unwrap();
        assert_eq!(table.size(), 17);
        assert_eq!(table.entries().len(), 17 * 17 * 17);
    }

    #[test]
    fn parse_rejects_uninferable_row_count() {
        let text = "0 0 0\n1 1 1\n0.5 0.5 0.5\n";
        assert_eq!(parse(text), Err(LutError::UnknownSize { rows: 3 }));
    }

    #[test]
    fn parse_empty_text() {
        assert_eq!(parse(""), Err(LutError::Empty));
        assert_eq!(parse("# only a comment\nLUT_3D_SIZE 2\n"), Err(LutError::Empty));
    }

    #[test]
    fn parse_rejects_malformed_row_with_line_number() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n0 0 oops\n";
        assert_eq!(parse(text), Err(LutError::MalformedRow { line: 3 }));
    }

    #[test]
    fn parse_rejects_four_component_row() {
        let text = "LUT_3D_SIZE 2\n0 0 0 0\n";
        assert_eq!(parse(text), Err(LutError::MalformedRow { line: 2 }));
    }

    #[test]
    fn parse_rejects_bad_size_directive() {
        assert_eq!(
            parse("LUT_3D_SIZE big\n0 0 0\n"),
            Err(LutError::MalformedDirective { line: 1 })
        );
        assert_eq!(
            parse("LUT_3D_SIZE 1\n0 0 0\n"),
            Err(LutError::InvalidSize(1))
        );
    }

    #[test]
    fn parse_rejects_1d_lut() {
        let result = parse("LUT_1D_SIZE 4\n0 0 0\n");
        assert!(matches!(result, Err(LutError::Unsupported(_))));
    }

    #[test]
    fn parse_clamps_out_of_range_components() {
        let mut text = String::from("LUT_3D_SIZE 2\n");
        text.push_str("-0.25 1.5 0.5\n");
        for _ in 0..7 {
            text.push_str("0 0 0\n");
        }
        let table = parse(&text).unwrap();
        assert_eq!(table.entries()[0], [0.0, 1.0, 0.5]);
    }

    #[test]
    fn parse_ignores_trailing_comments() {
        let mut text = String::from("LUT_3D_SIZE 2 # grid\n");
        for _ in 0..8 {
            text.push_str("0.1 0.2 0.3 # row\n");
        }
        let table = parse(&text).unwrap();
        assert!(table.entries().iter().all(|e| *e == [0.1, 0.2, 0.3]));
    }

    #[test]
    fn new_rejects_wrong_entry_count() {
        let result = LutTable::new(2, vec![[0.0; 3]; 7]);
        assert_eq!(
            result,
            Err(LutError::RowCountMismatch {
                expected: 8,
                found: 7
            })
        );
    }

    #[test]
    fn identity_corners() {
        let table = LutTable::identity(3).unwrap();
        assert_eq!(table.lookup(0, 0, 0), [0.0, 0.0, 0.0]);
        assert_eq!(table.lookup(2, 2, 2), [1.0, 1.0, 1.0]);
        assert_eq!(table.lookup(1, 2, 0), [0.5, 1.0, 0.0]);
    }
}
