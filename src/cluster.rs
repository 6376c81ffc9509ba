use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A tile identifier, ordered the way tile components compare inside a
/// read name. Because `:` sorts above every digit, a tile string that is
/// a prefix of another sorts *after* its extension: 1101 < 110 < 12 < 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId(pub u32);

impl Ord for TileId {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            return Ordering::Equal;
        }
        let a = self.0.to_string();
        let b = other.0.to_string();
        if a.starts_with(&b) {
            // longer first
            Ordering::Less
        } else if b.starts_with(&a) {
            Ordering::Greater
        } else {
            a.cmp(&b)
        }
    }
}

impl PartialOrd for TileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bases (and optional qualities) of one non-skip segment of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSegment {
    pub bases: Vec<u8>,
    pub quals: Option<Vec<u8>>,
}

/// One sequenced spot on a flowcell tile: spatial coordinates, the
/// pass-filter flag, and one read segment per non-skip segment of the
/// run's read structure.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub lane: u32,
    pub tile: TileId,
    pub x: u32,
    pub y: u32,
    pub pf: bool,
    pub segments: Vec<ReadSegment>,
    /// A barcode key already decided by an upstream matcher. When unset the
    /// pipeline's own matcher (if configured) decides.
    pub matched_barcode: Option<String>,
}

impl Cluster {
    /// The read name shared by all records of this cluster:
    /// `<run_barcode>:<lane>:<tile>:<x>:<y>`, every number base 10 without
    /// padding. Output ordering relies on this string being the comparator
    /// key.
    pub fn read_name(&self, run_barcode: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            run_barcode, self.lane, self.tile, self.x, self.y
        )
    }
}

/// A finite, non-restartable stream of clusters for one (lane, tile).
pub trait ClusterSource: Send {
    fn next_cluster(&mut self) -> Result<Option<Cluster>>;
}

/// A source backed by an in-memory vector. Used by tests and small runs.
pub struct VecClusterSource {
    clusters: std::vec::IntoIter<Cluster>,
}

impl VecClusterSource {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        VecClusterSource {
            clusters: clusters.into_iter(),
        }
    }
}

impl ClusterSource for VecClusterSource {
    fn next_cluster(&mut self) -> Result<Option<Cluster>> {
        Ok(self.clusters.next())
    }
}
