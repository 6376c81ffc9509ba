use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Counters for one expected barcode (or the no-match bucket).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarcodeCounts {
    pub reads: u64,
    pub pf_reads: u64,
    pub perfect_matches: u64,
    pub pf_perfect_matches: u64,
    pub one_mismatch_matches: u64,
    pub pf_one_mismatch_matches: u64,
}

impl BarcodeCounts {
    fn record(&mut self, mismatches: usize, pf: bool) {
        self.reads += 1;
        if pf {
            self.pf_reads += 1;
        }
        match mismatches {
            0 => {
                self.perfect_matches += 1;
                if pf {
                    self.pf_perfect_matches += 1;
                }
            }
            1 => {
                self.one_mismatch_matches += 1;
                if pf {
                    self.pf_one_mismatch_matches += 1;
                }
            }
            _ => {}
        }
    }

    fn merge(&mut self, other: &BarcodeCounts) {
        self.reads += other.reads;
        self.pf_reads += other.pf_reads;
        self.perfect_matches += other.perfect_matches;
        self.pf_perfect_matches += other.pf_perfect_matches;
        self.one_mismatch_matches += other.one_mismatch_matches;
        self.pf_one_mismatch_matches += other.pf_one_mismatch_matches;
    }
}

/// Per-task barcode counters. Each reader task owns a private tally; the
/// tallies travel back over a channel and are merged once at the end, so no
/// counter is ever shared between threads.
#[derive(Debug, Clone)]
pub struct MetricsTally {
    per_barcode: IndexMap<String, BarcodeCounts>,
    pub no_match: BarcodeCounts,
}

impl MetricsTally {
    /// Keys must be registered up front, in the same order the expected
    /// barcodes were configured.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetricsTally {
            per_barcode: keys
                .into_iter()
                .map(|k| (k.into(), BarcodeCounts::default()))
                .collect(),
            no_match: BarcodeCounts::default(),
        }
    }

    /// Exactly one of `record_match` / `record_no_match` is called per
    /// cluster handed to the matcher.
    pub fn record_match(&mut self, key: &str, mismatches: usize, pf: bool) {
        self.per_barcode
            .get_mut(key)
            .unwrap_or_else(|| panic!("tally has no entry for barcode key `{key}`"))
            .record(mismatches, pf);
    }

    pub fn record_no_match(&mut self, pf: bool) {
        self.no_match.reads += 1;
        if pf {
            self.no_match.pf_reads += 1;
        }
    }

    pub fn merge(&mut self, other: &MetricsTally) {
        for (key, counts) in &other.per_barcode {
            self.per_barcode
                .entry(key.clone())
                .or_default()
                .merge(counts);
        }
        self.no_match.merge(&other.no_match);
    }

    pub fn get(&self, key: &str) -> Option<&BarcodeCounts> {
        self.per_barcode.get(key)
    }

    /// Clusters seen by the matcher, over every bucket.
    pub fn total_reads(&self) -> u64 {
        self.per_barcode.values().map(|c| c.reads).sum::<u64>() + self.no_match.reads
    }

    pub fn total_pf_reads(&self) -> u64 {
        self.per_barcode.values().map(|c| c.pf_reads).sum::<u64>() + self.no_match.pf_reads
    }
}

/// Labels for one metrics row; the key ties a row to its tally bucket.
pub struct BarcodeLabel {
    pub key: String,
    pub barcode_name: String,
    pub library_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct MetricRow {
    pub barcode: String,
    pub barcode_name: String,
    pub library_name: String,
    pub reads: u64,
    pub pf_reads: u64,
    pub perfect_matches: u64,
    pub pf_perfect_matches: u64,
    pub one_mismatch_matches: u64,
    pub pf_one_mismatch_matches: u64,
    pub pct_matches: f64,
    pub ratio_this_barcode_to_best_barcode_pct: f64,
    pub pf_pct_matches: f64,
    pub pf_ratio_this_barcode_to_best_barcode_pct: f64,
    pub pf_normalized_matches: f64,
}

#[derive(Serialize)]
pub struct MetricsFileMeta {
    pub lanesplit_version: String,
    pub metrics_date: String,
    pub elapsed: f64,
    pub clusters: u64,
}

/// Builds the final report rows: one per expected barcode plus a trailing
/// no-match row whose BARCODE is all `N`.
///
/// Ratio denominators: PCT columns are fractions of all (or all PF) reads;
/// the best-barcode ratio and the normalised-matches mean are taken over
/// the expected barcodes only, excluding the no-match bucket.
pub fn build_rows(
    tally: &MetricsTally,
    labels: &[BarcodeLabel],
    barcode_len: usize,
) -> Vec<MetricRow> {
    let total = tally.total_reads() as f64;
    let total_pf = tally.total_pf_reads() as f64;

    let pct = |reads: u64| if total > 0.0 { reads as f64 / total } else { 0.0 };
    let pf_pct = |reads: u64| {
        if total_pf > 0.0 {
            reads as f64 / total_pf
        } else {
            0.0
        }
    };

    let best_pct = labels
        .iter()
        .filter_map(|l| tally.get(&l.key))
        .map(|c| pct(c.reads))
        .fold(0.0, f64::max);
    let best_pf_pct = labels
        .iter()
        .filter_map(|l| tally.get(&l.key))
        .map(|c| pf_pct(c.pf_reads))
        .fold(0.0, f64::max);
    let mean_pf = if labels.is_empty() {
        0.0
    } else {
        labels
            .iter()
            .filter_map(|l| tally.get(&l.key))
            .map(|c| c.pf_reads as f64)
            .sum::<f64>()
            / labels.len() as f64
    };

    let make = |barcode: String, name: String, library: String, c: &BarcodeCounts| MetricRow {
        barcode,
        barcode_name: name,
        library_name: library,
        reads: c.reads,
        pf_reads: c.pf_reads,
        perfect_matches: c.perfect_matches,
        pf_perfect_matches: c.pf_perfect_matches,
        one_mismatch_matches: c.one_mismatch_matches,
        pf_one_mismatch_matches: c.pf_one_mismatch_matches,
        pct_matches: pct(c.reads),
        ratio_this_barcode_to_best_barcode_pct: if best_pct > 0.0 {
            pct(c.reads) / best_pct
        } else {
            0.0
        },
        pf_pct_matches: pf_pct(c.pf_reads),
        pf_ratio_this_barcode_to_best_barcode_pct: if best_pf_pct > 0.0 {
            pf_pct(c.pf_reads) / best_pf_pct
        } else {
            0.0
        },
        pf_normalized_matches: if mean_pf > 0.0 {
            c.pf_reads as f64 / mean_pf
        } else {
            0.0
        },
    };

    let mut rows: Vec<MetricRow> = labels
        .iter()
        .map(|l| {
            let counts = tally.get(&l.key).copied().unwrap_or_default();
            make(
                l.key.clone(),
                l.barcode_name.clone(),
                l.library_name.clone(),
                &counts,
            )
        })
        .collect();

    rows.push(make(
        "N".repeat(barcode_len),
        String::new(),
        String::new(),
        &tally.no_match,
    ));
    rows
}

/// Writes the metrics file: a `#`-prefixed JSON metadata line, then a
/// tab-separated table with one row per barcode.
pub fn write_metrics_file(path: &Path, meta: &MetricsFileMeta, rows: &[MetricRow]) -> Result<()> {
    let mut out = std::fs::File::create(path)
        .with_context(|| format!("could not create metrics file {}", path.display()))?;
    writeln!(out, "#{}", serde_json::to_string(meta)?)?;

    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}
