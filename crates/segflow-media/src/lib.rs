#![forbid(unsafe_code)]

mod history;

use std::{
    fs,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use history::{
    BufferEntry, BufferHistory, PlaybackEntry, PlaybackHistory, ThroughputEntry,
    ThroughputHistory,
};

pub const MICROS_PER_SECOND: f64 = 1_000_000.0;
pub const DEFAULT_SEGMENT_DURATION_US: i64 = 2_000_000;

#[derive(Debug, Clone, PartialEq)]
struct Representation {
    segment_sizes: Vec<u64>,
    /// Mean segment size in bits divided by the segment duration in seconds.
    average_bitrate: f64,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("segment size table has no representation rows")]
    Empty,
    #[error("segment duration must be positive, got {0}us")]
    InvalidDuration(i64),
    #[error("row {row}: invalid segment size '{token}'")]
    InvalidSize { row: usize, token: String },
    #[error("row {row} has {found} segments, expected {expected}")]
    SegmentCountMismatch {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("read segment size table failed: {0}")]
    Io(#[from] io::Error),
}

/// Immutable table of representations and their per-segment byte sizes.
///
/// Every representation has the same, non-zero number of segments and all
/// segments share one duration. Deserialization goes through
/// [`SegmentCatalog::from_rows`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CatalogTable", into = "CatalogTable")]
pub struct SegmentCatalog {
    representations: Vec<Representation>,
    segment_duration_us: i64,
}

/// Serialized shape of a catalog: the raw size rows plus the duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogTable {
    rows: Vec<Vec<u64>>,
    segment_duration_us: i64,
}

impl TryFrom<CatalogTable> for SegmentCatalog {
    type Error = CatalogError;

    fn try_from(table: CatalogTable) -> Result<Self, Self::Error> {
        Self::from_rows(table.rows, table.segment_duration_us)
    }
}

impl From<SegmentCatalog> for CatalogTable {
    fn from(catalog: SegmentCatalog) -> Self {
        Self {
            rows: catalog
                .representations
                .into_iter()
                .map(|rep| rep.segment_sizes)
                .collect(),
            segment_duration_us: catalog.segment_duration_us,
        }
    }
}

impl SegmentCatalog {
    pub fn from_rows(
        rows: Vec<Vec<u64>>,
        segment_duration_us: i64,
    ) -> Result<Self, CatalogError> {
        if segment_duration_us <= 0 {
            return Err(CatalogError::InvalidDuration(segment_duration_us));
        }
        let expected = rows.first().map(Vec::len).unwrap_or_default();
        if expected == 0 {
            return Err(CatalogError::Empty);
        }
        let duration_secs = segment_duration_us as f64 / MICROS_PER_SECOND;
        let mut representations = Vec::with_capacity(rows.len());
        for (row, sizes) in rows.into_iter().enumerate() {
            if sizes.len() != expected {
                return Err(CatalogError::SegmentCountMismatch {
                    row,
                    found: sizes.len(),
                    expected,
                });
            }
            if let Some(zero) = sizes.iter().find(|size| **size == 0) {
                return Err(CatalogError::InvalidSize {
                    row,
                    token: zero.to_string(),
                });
            }
            let mean =
                sizes.iter().map(|size| *size as f64).sum::<f64>() / sizes.len() as f64;
            representations.push(Representation {
                average_bitrate: 8.0 * mean / duration_secs,
                segment_sizes: sizes,
            });
        }
        Ok(Self {
            representations,
            segment_duration_us,
        })
    }

    /// Parses one representation per line; a blank line or EOF ends the table.
    pub fn from_reader<R: BufRead>(
        reader: R,
        segment_duration_us: i64,
    ) -> Result<Self, CatalogError> {
        let mut rows = Vec::new();
        for (row, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                break;
            }
            let sizes = line
                .split_whitespace()
                .map(|token| match token.parse::<u64>() {
                    Ok(size) if size > 0 => Ok(size),
                    _ => Err(CatalogError::InvalidSize {
                        row,
                        token: token.to_string(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(sizes);
        }
        Self::from_rows(rows, segment_duration_us)
    }

    pub fn load(table: &str, segment_duration_us: i64) -> Result<Self, CatalogError> {
        Self::from_reader(table.as_bytes(), segment_duration_us)
    }

    pub fn load_file(path: &Path, segment_duration_us: i64) -> Result<Self, CatalogError> {
        let file = fs::File::open(path)?;
        Self::from_reader(BufReader::new(file), segment_duration_us)
    }

    pub fn representation_count(&self) -> usize {
        self.representations.len()
    }

    pub fn highest_index(&self) -> usize {
        self.representations.len().saturating_sub(1)
    }

    pub fn segment_count(&self) -> usize {
        self.representations
            .first()
            .map(|rep| rep.segment_sizes.len())
            .unwrap_or_default()
    }

    pub fn last_segment_index(&self) -> usize {
        self.segment_count().saturating_sub(1)
    }

    pub fn segment_duration_us(&self) -> i64 {
        self.segment_duration_us
    }

    pub fn segment_duration_secs(&self) -> f64 {
        self.segment_duration_us as f64 / MICROS_PER_SECOND
    }

    /// Panics when `representation` or `segment` is out of range.
    pub fn segment_size(&self, representation: usize, segment: usize) -> u64 {
        self.representations[representation].segment_sizes[segment]
    }

    /// Bitrate of one concrete segment, in bits per second.
    pub fn segment_bitrate(&self, representation: usize, segment: usize) -> f64 {
        8.0 * self.segment_size(representation, segment) as f64 / self.segment_duration_secs()
    }

    pub fn average_bitrate(&self, representation: usize) -> f64 {
        self.representations[representation].average_bitrate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_until_blank_line() {
        let table = "100 200 300\n400 500 600\n\n7 8 9\n";
        let catalog = SegmentCatalog::load(table, DEFAULT_SEGMENT_DURATION_US).unwrap();

        assert_eq!(catalog.representation_count(), 2);
        assert_eq!(catalog.segment_count(), 3);
        assert_eq!(catalog.highest_index(), 1);
        assert_eq!(catalog.last_segment_index(), 2);
        assert_eq!(catalog.segment_size(1, 2), 600);
        // mean 200 bytes over 2 s
        assert_eq!(catalog.average_bitrate(0), 800.0);
        assert_eq!(catalog.average_bitrate(1), 2_000.0);
    }

    #[test]
    fn rejects_empty_table() {
        let err = SegmentCatalog::load("\n100 200\n", DEFAULT_SEGMENT_DURATION_US).unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }

    #[test]
    fn rejects_mismatched_segment_counts() {
        let err = SegmentCatalog::load("1 2 3\n4 5\n", DEFAULT_SEGMENT_DURATION_US).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::SegmentCountMismatch {
                row: 1,
                found: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn rejects_non_positive_sizes() {
        let err = SegmentCatalog::load("1 x 3\n", DEFAULT_SEGMENT_DURATION_US).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidSize { row: 0, .. }));

        let err = SegmentCatalog::load("1 0 3\n", DEFAULT_SEGMENT_DURATION_US).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidSize { row: 0, .. }));
    }

    #[test]
    fn rejects_non_positive_duration() {
        let err = SegmentCatalog::load("1 2\n", 0).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDuration(0)));
    }

    #[test]
    fn deserialization_validates_rows() {
        let err = serde_json::from_str::<SegmentCatalog>(
            r#"{"rows":[[1,2,3],[4]],"segment_duration_us":2000000}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("row 1 has 1 segments"));

        let err = serde_json::from_str::<SegmentCatalog>(
            r#"{"rows":[[1,2,3]],"segment_duration_us":-5}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be positive"));

        let err =
            serde_json::from_str::<SegmentCatalog>(r#"{"rows":[],"segment_duration_us":1}"#)
                .unwrap_err();
        assert!(err.to_string().contains("no representation rows"));
    }

    #[test]
    fn serialized_catalog_reloads_with_derived_bitrates() {
        let catalog = SegmentCatalog::load("100 300\n400 400\n", 1_000_000).unwrap();
        let json = serde_json::to_string(&catalog).unwrap();
        assert_eq!(json, r#"{"rows":[[100,300],[400,400]],"segment_duration_us":1000000}"#);

        let reloaded: SegmentCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded, catalog);
        assert_eq!(reloaded.average_bitrate(0), 1_600.0);
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!(
            "segflow-catalog-test-{}.txt",
            std::process::id()
        ));
        fs::write(&path, "1000 1000\n2000 2000\n").unwrap();

        let catalog = SegmentCatalog::load_file(&path, 1_000_000).unwrap();
        assert_eq!(catalog.representation_count(), 2);
        assert_eq!(catalog.segment_bitrate(1, 0), 16_000.0);

        let _ = fs::remove_file(path);
    }
}
