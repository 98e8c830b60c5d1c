//! Recorded-pattern reader.
//!
//! Parses the multi-block scan CSV back into per-block data for review. The
//! reader is lenient in the same places the writer can leave a file rough:
//!
//! - several blocks in one file, one per polarization pass or repeated run,
//! - older files with `# Test Type:` / `# Date:` header comments and no
//!   `CONFIG_JSON` line (or no markers at all),
//! - a final block cut off before its end marker (`complete == false`),
//! - data rows that do not parse; they are skipped and counted.

use std::fs;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RangeError, RangeResult};
use crate::scan::csv_block::{
    BlockMetadata, BLOCK_END, BLOCK_START, CONFIG_PREFIX, FREQUENCY_COLUMN, META_PREFIX,
    PHI_COLUMN, THETA_COLUMN,
};
use crate::scan::{Axis, ScanSample, SliceSeries};
use crate::session::SessionState;

const LEGACY_TEST_TYPE: &str = "# Test Type:";
const LEGACY_DATE: &str = "# Date:";

/// Tolerance used when matching angles and frequencies from text.
pub const MATCH_TOLERANCE: f64 = 1e-6;

/// One block of a recorded scan file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedBlock {
    /// Decoded `CONFIG_JSON`, when present and well-formed
    pub metadata: Option<BlockMetadata>,
    /// Raw `CONFIG_JSON` object, kept even when it does not decode
    pub config_json: Option<Value>,
    /// `# Test Type:` of older files
    pub test_type: Option<String>,
    /// `# Date:` of older files
    pub date: Option<String>,
    /// `META` key/value pairs in file order
    pub meta: Vec<(String, String)>,
    pub header: Vec<String>,
    pub rows: Vec<ScanSample>,
    /// False when the file ended before this block's end marker
    pub complete: bool,
    pub skipped_rows: usize,
    /// 1-based line of the first line belonging to the block
    pub first_line: usize,
}

impl RecordedBlock {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    /// Scan name from the metadata, else the legacy test type.
    pub fn name(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.name.as_str())
            .or(self.test_type.as_deref())
    }

    pub fn polarization(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.polarization.as_str())
            .or_else(|| self.meta("polarization"))
    }

    /// Label of the measured column, e.g. `Magnitude (dB)`.
    pub fn value_label(&self) -> Option<&str> {
        self.header.get(3).map(String::as_str)
    }

    /// Distinct frequencies in ascending order.
    pub fn frequencies(&self) -> Vec<f64> {
        distinct(self.rows.iter().map(|row| row.freq_ghz))
    }

    pub fn angles(&self, axis: Axis) -> Vec<f64> {
        distinct(self.rows.iter().map(|row| row.angle(axis)))
    }

    /// The 2D cut with `fixed_axis == fixed_deg` at `freq_ghz`, ordered by
    /// the other axis.
    ///
    /// With `normalize` the peak of the cut is shifted to 0 dB.
    pub fn slice(
        &self,
        fixed_axis: Axis,
        fixed_deg: f64,
        freq_ghz: f64,
        normalize: bool,
    ) -> SliceSeries {
        let swept = fixed_axis.other();
        let mut points: Vec<(f64, f64)> = self
            .rows
            .iter()
            .filter(|row| {
                close(row.angle(fixed_axis), fixed_deg) && close(row.freq_ghz, freq_ghz)
            })
            .map(|row| (row.angle(swept), row.value))
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        if normalize {
            let peak = points
                .iter()
                .map(|(_, value)| *value)
                .fold(f64::NEG_INFINITY, f64::max);
            if peak.is_finite() {
                for point in &mut points {
                    point.1 -= peak;
                }
            }
        }

        let mut series = SliceSeries::default();
        for (angle, value) in points {
            series.push(angle, value);
        }
        series
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= MATCH_TOLERANCE
}

fn distinct(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut values: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    values.sort_by(f64::total_cmp);
    values.dedup_by(|a, b| close(*a, *b));
    values
}

/// Column positions resolved from a header row.
#[derive(Debug, Clone, Copy)]
struct Columns {
    phi: usize,
    theta: usize,
    freq: usize,
    value: usize,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            phi: 0,
            theta: 1,
            freq: 2,
            value: 3,
        }
    }
}

impl Columns {
    fn from_header(header: &[String]) -> Self {
        let find = |name: &str, fallback: usize| {
            header
                .iter()
                .position(|column| column.eq_ignore_ascii_case(name))
                .unwrap_or(fallback)
        };
        let mut columns = Self {
            phi: find(PHI_COLUMN, 0),
            theta: find(THETA_COLUMN, 1),
            freq: find(FREQUENCY_COLUMN, 2),
            value: 3,
        };
        columns.value = (0..header.len().max(4))
            .find(|i| ![columns.phi, columns.theta, columns.freq].contains(i))
            .unwrap_or(3);
        columns
    }

    fn parse(&self, fields: &StringRecord) -> Option<ScanSample> {
        let field = |i: usize| fields.get(i).and_then(|f| f.parse::<f64>().ok());
        Some(ScanSample::new(
            field(self.phi)?,
            field(self.theta)?,
            field(self.freq)?,
            field(self.value)?,
        ))
    }
}

struct BlockBuilder {
    block: RecordedBlock,
    columns: Columns,
    /// Opened by an explicit start marker
    marked: bool,
}

impl BlockBuilder {
    fn new(first_line: usize, marked: bool) -> Self {
        Self {
            block: RecordedBlock {
                first_line,
                ..RecordedBlock::default()
            },
            columns: Columns::default(),
            marked,
        }
    }

    fn has_content(&self) -> bool {
        let b = &self.block;
        !b.rows.is_empty()
            || !b.header.is_empty()
            || b.config_json.is_some()
            || b.test_type.is_some()
            || !b.meta.is_empty()
    }

    fn finish(mut self, ended: bool) -> RecordedBlock {
        // Blocks without markers predate them and cannot be detected as cut off.
        self.block.complete = ended || !self.marked;
        self.block
    }
}

/// Parse the text of a scan file into its blocks.
pub fn parse_pattern_str(text: &str) -> Vec<RecordedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<BlockBuilder> = None;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if line == BLOCK_START {
            if let Some(open) = current.take() {
                if open.has_content() {
                    if open.marked {
                        warn!(line = open.block.first_line, "block without end marker");
                    }
                    blocks.push(open.finish(false));
                }
            }
            current = Some(BlockBuilder::new(line_no, true));
            continue;
        }
        if line == BLOCK_END {
            match current.take() {
                Some(open) => blocks.push(open.finish(true)),
                None => debug!(line = line_no, "stray end marker"),
            }
            continue;
        }

        // Legacy headers open a new implicit block once data has been seen.
        if line.starts_with(LEGACY_TEST_TYPE) {
            if current
                .as_ref()
                .map(|open| !open.block.rows.is_empty() || open.block.test_type.is_some())
                .unwrap_or(false)
            {
                if let Some(open) = current.take() {
                    blocks.push(open.finish(false));
                }
            }
        }

        let open = current.get_or_insert_with(|| BlockBuilder::new(line_no, false));

        if let Some(json) = line.strip_prefix(CONFIG_PREFIX.trim_end()) {
            let json = json.trim();
            match serde_json::from_str::<Value>(json) {
                Ok(value) => {
                    match serde_json::from_value::<BlockMetadata>(value.clone()) {
                        Ok(metadata) => open.block.metadata = Some(metadata),
                        Err(e) => debug!(line = line_no, "CONFIG_JSON does not decode: {e}"),
                    }
                    open.block.config_json = Some(value);
                }
                Err(e) => warn!(line = line_no, "unreadable CONFIG_JSON: {e}"),
            }
        } else if let Some(pair) = line.strip_prefix(META_PREFIX.trim_end()) {
            if let Some((key, value)) = pair.trim().split_once('=') {
                open.block
                    .meta
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        } else if let Some(value) = line.strip_prefix(LEGACY_TEST_TYPE) {
            open.block.test_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix(LEGACY_DATE) {
            open.block.date = Some(value.trim().to_string());
        } else if line.starts_with('#') {
            debug!(line = line_no, "ignoring comment");
        } else {
            let fields = match read_record(line) {
                Ok(fields) => fields,
                Err(e) => {
                    open.block.skipped_rows += 1;
                    debug!(line = line_no, "skipping unreadable row: {e}");
                    continue;
                }
            };
            match open.columns.parse(&fields) {
                Some(sample) => open.block.rows.push(sample),
                None if open.block.header.is_empty() && open.block.rows.is_empty() => {
                    open.block.header = fields.iter().map(str::to_string).collect();
                    open.columns = Columns::from_header(&open.block.header);
                }
                None => {
                    open.block.skipped_rows += 1;
                    debug!(line = line_no, "skipping malformed row");
                }
            }
        }
    }

    if let Some(open) = current.take() {
        if open.has_content() {
            if open.marked {
                warn!(line = open.block.first_line, "last block has no end marker");
            }
            blocks.push(open.finish(false));
        }
    }
    blocks
}

/// One CSV record from a single non-comment line, quotes honored.
fn read_record(line: &str) -> csv::Result<StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let mut record = StringRecord::new();
    reader.read_record(&mut record)?;
    Ok(record)
}

/// Read and parse a scan file.
pub fn parse_pattern_file(path: &Path) -> RangeResult<Vec<RecordedBlock>> {
    let text = fs::read_to_string(path)
        .map_err(|e| RangeError::Persistence(format!("{}: {e}", path.display())))?;
    let blocks = parse_pattern_str(&text);
    debug!(path = %path.display(), blocks = blocks.len(), "scan file parsed");
    Ok(blocks)
}

/// Open the scan file most recently recorded in `session`.
pub fn load_last_test(session: &SessionState) -> RangeResult<(PathBuf, Vec<RecordedBlock>)> {
    let path = session
        .last_csv()
        .filter(|path| path.exists())
        .ok_or(RangeError::NoRecordedScan)?;
    let blocks = parse_pattern_file(&path)?;
    Ok((path, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_BLOCKS: &str = "\
# --- TEST-START ---
# CONFIG_JSON: {\"name\":\"horn\",\"mode\":\"XY\",\"polarization\":\"vertical\"}
# META: vna=HP8720D
# META: polarization=vertical
Phi (deg),Theta (deg),Frequency (GHz),Magnitude (dB)
0.0,90.0,8.0,-1.5
90.0,90.0,8.0,-3.0
# --- TEST-END ---
# --- TEST-START ---
# META: polarization=horizontal
Phi (deg),Theta (deg),Frequency (GHz),Magnitude (dB)
0.0,90.0,8.0,-10.0
";

    #[test]
    fn test_blocks_and_dangling_tail() {
        let blocks = parse_pattern_str(TWO_BLOCKS);
        assert_eq!(blocks.len(), 2);

        assert!(blocks[0].complete);
        assert_eq!(blocks[0].rows.len(), 2);
        assert_eq!(blocks[0].meta("vna"), Some("HP8720D"));
        assert_eq!(blocks[0].polarization(), Some("vertical"));
        assert_eq!(blocks[0].value_label(), Some("Magnitude (dB)"));
        assert!(blocks[0].config_json.is_some());

        assert!(!blocks[1].complete);
        assert_eq!(blocks[1].polarization(), Some("horizontal"));
        assert_eq!(blocks[1].rows[0].value, -10.0);
    }

    #[test]
    fn test_legacy_header_without_markers() {
        let text = "\
# Test Type: XY Slice
# Date: 2024-05-01 10:00:00
Phi (deg),Theta (deg),Frequency (GHz),Magnitude (dB)
0.0,90.0,9.0,-2.0
10.0,90.0,9.0,-2.5
";
        let blocks = parse_pattern_str(text);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].complete);
        assert!(blocks[0].metadata.is_none());
        assert_eq!(blocks[0].name(), Some("XY Slice"));
        assert_eq!(blocks[0].date.as_deref(), Some("2024-05-01 10:00:00"));
        assert_eq!(blocks[0].rows.len(), 2);
    }

    #[test]
    fn test_quoted_fields() {
        let text = "\
# --- TEST-START ---
\"Phi (deg)\",\"Theta (deg)\",\"Frequency (GHz)\",\"Magnitude, dB\"
\"0.0\",\"90.0\",\"8.0\",\"-3.0\"
# --- TEST-END ---
";
        let blocks = parse_pattern_str(text);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(
            block.header,
            ["Phi (deg)", "Theta (deg)", "Frequency (GHz)", "Magnitude, dB"]
        );
        assert_eq!(block.value_label(), Some("Magnitude, dB"));
        assert_eq!(block.skipped_rows, 0);
        assert_eq!(block.rows, [ScanSample::new(0.0, 90.0, 8.0, -3.0)]);
    }

    #[test]
    fn test_malformed_rows_are_counted() {
        let text = "\
Phi (deg),Theta (deg),Frequency (GHz),Magnitude (dB)
0.0,90.0,8.0,-1.0
0.0,90.0,oops,-1.0
10.0,90.0
";
        let blocks = parse_pattern_str(text);
        assert_eq!(blocks[0].rows.len(), 1);
        assert_eq!(blocks[0].skipped_rows, 2);
    }

    #[test]
    fn test_slice_and_normalize() {
        let text = "\
Phi (deg),Theta (deg),Frequency (GHz),Magnitude (dB)
0.0,0.0,8.0,-4.0
0.0,90.0,8.0,-1.0
0.0,45.0,8.0,-2.0
90.0,45.0,8.0,-9.0
0.0,45.0,9.0,-7.0
";
        let block = &parse_pattern_str(text)[0];
        assert_eq!(block.frequencies(), vec![8.0, 9.0]);
        assert_eq!(block.angles(Axis::Phi), vec![0.0, 90.0]);

        let cut = block.slice(Axis::Phi, 0.0, 8.0, false);
        assert_eq!(cut.angles, vec![0.0, 45.0, 90.0]);
        assert_eq!(cut.values, vec![-4.0, -2.0, -1.0]);

        let cut = block.slice(Axis::Phi, 0.0, 8.0, true);
        assert_eq!(cut.values, vec![-3.0, -1.0, 0.0]);
    }

    #[test]
    fn test_load_last_test_without_record() {
        let session = SessionState::new();
        assert!(matches!(
            load_last_test(&session),
            Err(RangeError::NoRecordedScan)
        ));
    }

    #[test]
    fn test_load_last_test_reads_recorded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        fs::write(&path, TWO_BLOCKS).unwrap();
        let session = SessionState::new();
        session.record_csv(&path, "horn").unwrap();

        let (loaded, blocks) = load_last_test(&session).unwrap();
        assert_eq!(loaded, path);
        assert_eq!(blocks.len(), 2);
    }
}
