use crate::cluster::TileId;
use crate::record::DemuxRecord;
use crate::sorter::{ExternalSorter, SortedIter};
use anyhow::Result;
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("no sink registered for barcode key `{key}` (tile {tile})")]
pub struct RoutingError {
    pub tile: TileId,
    pub key: String,
}

/// One tile's worth of records, bucketed by barcode key. The tile's RAM
/// budget is divided evenly across the registry's keys at construction, so
/// the sum of in-RAM records across buckets never exceeds the budget.
///
/// Owned by exactly one task at a time: the reader while filling, then
/// each writer takes its bucket out with `take_key`.
pub struct TileBuffer {
    tile: TileId,
    sorters: IndexMap<Option<String>, ExternalSorter<DemuxRecord>>,
}

impl TileBuffer {
    /// `keys` must be the sink registry's keys in registry order.
    pub fn new<I>(tile: TileId, keys: I, max_in_ram_per_tile: usize, tmp_dir: &Path) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let keys: Vec<Option<String>> = keys.into_iter().collect();
        let share = (max_in_ram_per_tile / keys.len().max(1)).max(1);
        TileBuffer {
            tile,
            sorters: keys
                .into_iter()
                .map(|key| (key, ExternalSorter::new(share, tmp_dir)))
                .collect(),
        }
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn route(&mut self, key: &Option<String>, rec: DemuxRecord) -> Result<()> {
        match self.sorters.get_mut(key) {
            Some(sorter) => sorter.push(rec),
            None => Err(RoutingError {
                tile: self.tile,
                key: key.clone().unwrap_or_else(|| "<unmatched>".to_string()),
            }
            .into()),
        }
    }

    /// Keys that received at least one record, in registry order.
    pub fn occupied_keys(&self) -> Vec<Option<String>> {
        self.sorters
            .iter()
            .filter(|(_, sorter)| !sorter.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Hands the bucket for `key` to its writer. Returns None if the key
    /// was never registered or was already taken.
    pub fn take_key(&mut self, key: &Option<String>) -> Option<ExternalSorter<DemuxRecord>> {
        self.sorters.swap_remove(key)
    }
}

/// Streams a finalised bucket in comparator order, dropping *both* records
/// of any adjacent pair that shares a comparator key. Two clusters landing
/// on the same coordinates are a vendor artifact, and neither copy can be
/// trusted. Paired layouts group both firsts and both seconds adjacently,
/// so one record of lookahead suffices.
pub struct DedupIter {
    inner: SortedIter<DemuxRecord>,
    lookahead: Option<DemuxRecord>,
    tile: TileId,
    /// Records removed by duplicate suppression.
    pub dropped: usize,
}

impl DedupIter {
    pub fn new(inner: SortedIter<DemuxRecord>, tile: TileId) -> Self {
        DedupIter {
            inner,
            lookahead: None,
            tile,
            dropped: 0,
        }
    }
}

impl Iterator for DedupIter {
    type Item = Result<DemuxRecord>;

    fn next(&mut self) -> Option<Result<DemuxRecord>> {
        loop {
            let cur = match self.lookahead.take() {
                Some(rec) => rec,
                None => match self.inner.next()? {
                    Ok(rec) => rec,
                    Err(e) => return Some(Err(e)),
                },
            };
            match self.inner.next() {
                None => return Some(Ok(cur)),
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(peek)) => {
                    if peek.cmp(&cur) == Ordering::Equal {
                        self.dropped += 2;
                        warn!(
                            "tile {}: dropping both records named {} (duplicate coordinates)",
                            self.tile, cur.name
                        );
                        continue;
                    }
                    self.lookahead = Some(peek);
                    return Some(Ok(cur));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, second: bool) -> DemuxRecord {
        DemuxRecord {
            name: name.to_string(),
            paired: true,
            second_of_pair: second,
            bases: b"ACGT".to_vec(),
            quals: Some(vec![40; 4]),
            pf: true,
            barcode: None,
        }
    }

    fn keys(names: &[Option<&str>]) -> Vec<Option<String>> {
        names.iter().map(|k| k.map(String::from)).collect()
    }

    #[test]
    fn routes_by_key_and_tracks_occupancy() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = TileBuffer::new(
            TileId(1101),
            keys(&[Some("AAAA"), Some("TTTT"), None]),
            30,
            dir.path(),
        );

        buf.route(&Some("AAAA".to_string()), rec("R:1:1101:1:1", false))
            .unwrap();
        buf.route(&None, rec("R:1:1101:2:2", false)).unwrap();

        assert_eq!(
            buf.occupied_keys(),
            keys(&[Some("AAAA"), None])
        );
    }

    #[test]
    fn unknown_key_is_fatal_and_names_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = TileBuffer::new(TileId(1101), keys(&[Some("AAAA")]), 30, dir.path());

        let err = buf
            .route(&Some("GGGG".to_string()), rec("R:1:1101:1:1", false))
            .unwrap_err();
        assert!(err.to_string().contains("GGGG"));
    }

    #[test]
    fn finalised_bucket_is_sorted_by_read_name() {
        let dir = tempfile::tempdir().unwrap();
        let key = Some("AAAA".to_string());
        // a share of 1 record forces a spill per push
        let mut buf = TileBuffer::new(TileId(1101), vec![key.clone()], 1, dir.path());

        for (x, y) in [(9, 1), (2, 5), (2, 3), (11, 1)] {
            buf.route(&key, rec(&format!("R:1:1101:{x}:{y}"), false))
                .unwrap();
        }

        let sorter = buf.take_key(&key).unwrap();
        let names: Vec<String> = DedupIter::new(sorter.into_sorted_iter().unwrap(), TileId(1101))
            .map(|r| r.unwrap().name)
            .collect();

        // lexicographic on the whole name: 11 < 2 < 9
        assert_eq!(
            names,
            vec![
                "R:1:1101:11:1",
                "R:1:1101:2:3",
                "R:1:1101:2:5",
                "R:1:1101:9:1"
            ]
        );
    }

    #[test]
    fn colliding_pairs_are_dropped_per_end() {
        let dir = tempfile::tempdir().unwrap();
        let key = Some("AAAA".to_string());
        let mut buf = TileBuffer::new(TileId(1101), vec![key.clone()], 100, dir.path());

        // two paired clusters share coordinates (1,1); two more are unique
        for second in [false, true] {
            buf.route(&key, rec("R:1:1101:1:1", second)).unwrap();
            buf.route(&key, rec("R:1:1101:1:1", second)).unwrap();
            buf.route(&key, rec("R:1:1101:3:3", second)).unwrap();
            buf.route(&key, rec("R:1:1101:5:5", second)).unwrap();
        }

        let sorter = buf.take_key(&key).unwrap();
        let mut iter = DedupIter::new(sorter.into_sorted_iter().unwrap(), TileId(1101));
        let survivors: Vec<(String, bool)> = iter
            .by_ref()
            .map(|r| r.unwrap())
            .map(|r| (r.name, r.second_of_pair))
            .collect();

        assert_eq!(
            survivors,
            vec![
                ("R:1:1101:3:3".to_string(), false),
                ("R:1:1101:3:3".to_string(), true),
                ("R:1:1101:5:5".to_string(), false),
                ("R:1:1101:5:5".to_string(), true),
            ]
        );
        assert_eq!(iter.dropped, 4);
    }

    #[test]
    fn take_key_hands_over_each_bucket_once() {
        let dir = tempfile::tempdir().unwrap();
        let key = Some("AAAA".to_string());
        let mut buf = TileBuffer::new(TileId(1101), vec![key.clone()], 10, dir.path());
        buf.route(&key, rec("R:1:1101:1:1", false)).unwrap();

        assert!(buf.take_key(&key).is_some());
        assert!(buf.take_key(&key).is_none());
    }
}
