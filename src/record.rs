use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One output record: a template read of a cluster, annotated with the
/// barcode decision, carrying the read name used as the sort comparator.
///
/// Ordering (and equality) follow the read-name comparator: name bytes,
/// then first-of-pair before second-of-pair. Two records comparing equal
/// originate from clusters sharing coordinates, which the per-tile buffer
/// treats as a vendor artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemuxRecord {
    pub name: String,
    pub paired: bool,
    pub second_of_pair: bool,
    pub bases: Vec<u8>,
    pub quals: Option<Vec<u8>>,
    pub pf: bool,
    /// The matched barcode key, or the lowercase near-miss hint.
    pub barcode: Option<String>,
}

impl PartialEq for DemuxRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DemuxRecord {}

impl PartialOrd for DemuxRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DemuxRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.second_of_pair.cmp(&other.second_of_pair))
    }
}

/// A per-library destination accepting already-sorted records.
pub trait RecordSink: Send {
    fn write(&mut self, rec: &DemuxRecord) -> Result<()>;

    /// Flush and release resources. Called exactly once after the run.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
