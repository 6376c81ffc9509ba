use crate::matcher::{is_no_call, ExpectedBarcode};
use crate::metrics::BarcodeLabel;
use crate::read_structure::ReadStructure;
use anyhow::{Context, Result};
use indexmap::IndexSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

const RESERVED_TAGS: [&str; 4] = ["PU", "CN", "PL", "DT"];

/// One row of the expected-barcodes table.
#[derive(Debug, Clone)]
pub struct SampleSheetEntry {
    pub output: Option<PathBuf>,
    pub sample_alias: String,
    pub library_name: String,
    /// One barcode string per Barcode segment, in segment order.
    pub barcodes: Vec<String>,
    /// The canonical key: the concatenation of the barcode strings.
    pub key: String,
    /// Two-letter header columns forwarded to the sink's metadata.
    pub tags: Vec<(String, String)>,
}

/// The configured barcode set: expected barcodes in registration order,
/// plus the optional row (all-`N` barcodes) that routes unmatched clusters
/// to a sink of its own.
#[derive(Debug, Clone)]
pub struct SampleSheet {
    pub samples: Vec<SampleSheetEntry>,
    pub no_match: Option<SampleSheetEntry>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SampleSheetError {
    #[error("sample sheet is missing the required column `{0}`")]
    MissingColumn(String),

    #[error(
        "sample sheet must carry `BARCODE_1` through `BARCODE_{0}` \
         to match the read structure's {0} barcode segments"
    )]
    MissingBarcodeColumn(usize),

    #[error("column `{0}` is a reserved output header tag and cannot be supplied")]
    ReservedTag(String),

    #[error("duplicate barcode key `{0}`")]
    DuplicateKey(String),

    #[error("more than one row declares the no-match sink")]
    DuplicateNoMatch,

    #[error(
        "barcode `{barcode}` in column {column} is {actual} bases long, \
         but the matching read structure segment is {expected}"
    )]
    BarcodeLength {
        barcode: String,
        column: usize,
        expected: usize,
        actual: usize,
    },

    #[error("expected barcodes table is empty")]
    Empty,

    #[error("an inline barcode list applies only to single-barcode read structures")]
    InlineMultiSegment,
}

impl SampleSheet {
    pub fn from_tsv(path: &Path, structure: &ReadStructure) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open sample sheet {}", path.display()))?;
        Self::from_reader(file, structure)
            .with_context(|| format!("invalid sample sheet {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R, structure: &ReadStructure) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(reader);

        let headers = rdr.headers().context("could not read header row")?.clone();
        let col = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| SampleSheetError::MissingColumn(name.to_string()))
        };

        let output_col = col("OUTPUT")?;
        let alias_col = col("SAMPLE_ALIAS")?;
        let library_col = col("LIBRARY_NAME")?;

        let num_segments = structure.barcodes().len();
        let barcode_cols: Vec<usize> = if num_segments == 1 {
            let idx = headers
                .iter()
                .position(|h| h == "BARCODE" || h == "BARCODE_1")
                .ok_or(SampleSheetError::MissingBarcodeColumn(1))?;
            vec![idx]
        } else {
            (1..=num_segments)
                .map(|k| {
                    headers
                        .iter()
                        .position(|h| h == format!("BARCODE_{k}"))
                        .ok_or(SampleSheetError::MissingBarcodeColumn(num_segments))
                })
                .collect::<Result<_, _>>()?
        };

        // every remaining two-character column is an output header tag
        let mut tag_cols = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            if name.len() != 2 {
                continue;
            }
            if RESERVED_TAGS.contains(&name) {
                return Err(SampleSheetError::ReservedTag(name.to_string()).into());
            }
            tag_cols.push((idx, name.to_string()));
        }

        let segment_lengths: Vec<usize> =
            structure.barcodes().iter().map(|(_, len)| *len).collect();

        let mut samples = Vec::new();
        let mut no_match = None;
        let mut seen = IndexSet::new();
        for (row_idx, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("could not parse row {}", row_idx + 2))?;
            let field = |i: usize| record.get(i).unwrap_or("").to_string();

            let barcodes: Vec<String> = barcode_cols.iter().map(|&i| field(i)).collect();
            let is_no_match = barcodes
                .iter()
                .any(|b| b.bytes().any(is_no_call));

            if !is_no_match {
                for (seg, barcode) in barcodes.iter().enumerate() {
                    if barcode.len() != segment_lengths[seg] {
                        return Err(SampleSheetError::BarcodeLength {
                            barcode: barcode.clone(),
                            column: seg + 1,
                            expected: segment_lengths[seg],
                            actual: barcode.len(),
                        }
                        .into());
                    }
                }
            }

            let key: String = barcodes.concat();
            if !seen.insert(key.clone()) {
                return Err(SampleSheetError::DuplicateKey(key).into());
            }

            let entry = SampleSheetEntry {
                output: Some(PathBuf::from(field(output_col))),
                sample_alias: field(alias_col),
                library_name: field(library_col),
                tags: tag_cols
                    .iter()
                    .map(|(i, name)| (name.clone(), field(*i)))
                    .collect(),
                barcodes,
                key,
            };

            if is_no_match {
                if no_match.is_some() {
                    return Err(SampleSheetError::DuplicateNoMatch.into());
                }
                no_match = Some(entry);
            } else {
                samples.push(entry);
            }
        }

        if samples.is_empty() {
            return Err(SampleSheetError::Empty.into());
        }

        Ok(SampleSheet { samples, no_match })
    }

    /// Builds a sheet from a bare list of barcode strings. Only valid when
    /// the read structure has exactly one Barcode segment; no outputs and
    /// no no-match sink are configured.
    pub fn from_inline(barcodes: &[String], structure: &ReadStructure) -> Result<Self> {
        let segments = structure.barcodes();
        if segments.len() != 1 {
            return Err(SampleSheetError::InlineMultiSegment.into());
        }
        if barcodes.is_empty() {
            return Err(SampleSheetError::Empty.into());
        }
        let expected_len = segments[0].1;

        let mut samples = Vec::new();
        let mut seen = IndexSet::new();
        for barcode in barcodes {
            if barcode.len() != expected_len {
                return Err(SampleSheetError::BarcodeLength {
                    barcode: barcode.clone(),
                    column: 1,
                    expected: expected_len,
                    actual: barcode.len(),
                }
                .into());
            }
            if !seen.insert(barcode.clone()) {
                return Err(SampleSheetError::DuplicateKey(barcode.clone()).into());
            }
            samples.push(SampleSheetEntry {
                output: None,
                sample_alias: barcode.clone(),
                library_name: barcode.clone(),
                barcodes: vec![barcode.clone()],
                key: barcode.clone(),
                tags: Vec::new(),
            });
        }

        Ok(SampleSheet {
            samples,
            no_match: None,
        })
    }

    /// The matcher's view of the configuration.
    pub fn expected_barcodes(&self) -> Vec<ExpectedBarcode> {
        self.samples
            .iter()
            .map(|e| {
                ExpectedBarcode::new(e.barcodes.iter().map(|b| b.as_bytes().to_vec()).collect())
            })
            .collect()
    }

    /// Labels for the metrics report, in registration order.
    pub fn labels(&self) -> Vec<BarcodeLabel> {
        self.samples
            .iter()
            .map(|e| BarcodeLabel {
                key: e.key.clone(),
                barcode_name: e.sample_alias.clone(),
                library_name: e.library_name.clone(),
            })
            .collect()
    }

    pub fn expected_keys(&self) -> Vec<String> {
        self.samples.iter().map(|e| e.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure(s: &str) -> ReadStructure {
        s.parse().unwrap()
    }

    fn parse(sheet: &str, rs: &str) -> Result<SampleSheet> {
        SampleSheet::from_reader(sheet.as_bytes(), &structure(rs))
    }

    #[test]
    fn parses_single_barcode_sheet() {
        let sheet = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\n\
             s1.fastq\tsample1\tlib1\tACGTACGT\n\
             s2.fastq\tsample2\tlib2\tTTTTGGGG\n",
            "10T8B10T",
        )
        .unwrap();

        assert_eq!(sheet.samples.len(), 2);
        assert_eq!(sheet.samples[0].key, "ACGTACGT");
        assert_eq!(sheet.samples[1].sample_alias, "sample2");
        assert!(sheet.no_match.is_none());
    }

    #[test]
    fn parses_dual_barcode_sheet_with_no_match_row() {
        let sheet = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE_1\tBARCODE_2\n\
             s1.fastq\tsample1\tlib1\tACGTACGT\tGGGGCCCC\n\
             un.fastq\tunmatched\tunmatched\tNNNNNNNN\tNNNNNNNN\n",
            "10T8B8B10T",
        )
        .unwrap();

        assert_eq!(sheet.samples.len(), 1);
        assert_eq!(sheet.samples[0].key, "ACGTACGTGGGGCCCC");
        let nm = sheet.no_match.unwrap();
        assert_eq!(nm.sample_alias, "unmatched");
    }

    #[test]
    fn forwards_two_letter_tags() {
        let sheet = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\tSM\n\
             s1.fastq\tsample1\tlib1\tACGTACGT\tproject42\n",
            "10T8B10T",
        )
        .unwrap();
        assert_eq!(
            sheet.samples[0].tags,
            vec![("SM".to_string(), "project42".to_string())]
        );
    }

    #[test]
    fn rejects_reserved_tag_column() {
        let err = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\tPU\n\
             s1.fastq\tsample1\tlib1\tACGTACGT\tx\n",
            "10T8B10T",
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<SampleSheetError>(),
            Some(&SampleSheetError::ReservedTag("PU".to_string()))
        );
    }

    #[test]
    fn rejects_missing_column() {
        let err = parse(
            "OUTPUT\tLIBRARY_NAME\tBARCODE\ns1.fastq\tlib1\tACGTACGT\n",
            "10T8B10T",
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<SampleSheetError>(),
            Some(&SampleSheetError::MissingColumn("SAMPLE_ALIAS".to_string()))
        );
    }

    #[test]
    fn rejects_wrong_barcode_length() {
        // longer than the segment
        let err = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\n\
             s1.fastq\tsample1\tlib1\tACGTACGTA\n",
            "10T8B10T",
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SampleSheetError>(),
            Some(SampleSheetError::BarcodeLength { actual: 9, expected: 8, .. })
        ));

        // shorter too
        let err = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\n\
             s1.fastq\tsample1\tlib1\tACGT\n",
            "10T8B10T",
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SampleSheetError>(),
            Some(SampleSheetError::BarcodeLength { actual: 4, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = parse(
            "OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\n\
             s1.fastq\tsample1\tlib1\tACGTACGT\n\
             s2.fastq\tsample2\tlib2\tACGTACGT\n",
            "10T8B10T",
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<SampleSheetError>(),
            Some(&SampleSheetError::DuplicateKey("ACGTACGT".to_string()))
        );
    }

    #[test]
    fn rejects_empty_sheet() {
        let err = parse("OUTPUT\tSAMPLE_ALIAS\tLIBRARY_NAME\tBARCODE\n", "10T8B10T").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SampleSheetError>(),
            Some(&SampleSheetError::Empty)
        );
    }

    #[test]
    fn inline_list_single_segment_only() {
        let rs = structure("10T8B8B10T");
        let err = SampleSheet::from_inline(&["ACGTACGT".to_string()], &rs).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SampleSheetError>(),
            Some(&SampleSheetError::InlineMultiSegment)
        );

        let rs = structure("10T8B10T");
        let sheet = SampleSheet::from_inline(
            &["ACGTACGT".to_string(), "TTTTGGGG".to_string()],
            &rs,
        )
        .unwrap();
        assert_eq!(sheet.expected_keys(), vec!["ACGTACGT", "TTTTGGGG"]);
        assert!(sheet.samples[0].output.is_none());
    }
}
