use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::tempfile_in;

/// An external-sort collection: records accumulate in RAM up to a bound,
/// overflow is written out as sorted runs, and `into_sorted_iter` merges
/// the runs with the in-memory remainder into one ordered stream.
///
/// Spilled runs live in anonymous temp files, so the OS reclaims them even
/// if the process dies mid-run.
pub struct ExternalSorter<T> {
    max_in_ram: usize,
    tmp_dir: PathBuf,
    buf: Vec<T>,
    runs: Vec<SpilledRun>,
    total: usize,
}

struct SpilledRun {
    file: File,
    records: usize,
}

impl<T: Ord + Serialize + DeserializeOwned> ExternalSorter<T> {
    pub fn new(max_in_ram: usize, tmp_dir: &Path) -> Self {
        ExternalSorter {
            max_in_ram: max_in_ram.max(1),
            tmp_dir: tmp_dir.to_path_buf(),
            buf: Vec::new(),
            runs: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.buf.push(value);
        self.total += 1;
        if self.buf.len() >= self.max_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    /// Records pushed so far, spilled or not.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn spill(&mut self) -> Result<()> {
        self.buf.sort_unstable();
        let mut file = tempfile_in(&self.tmp_dir).with_context(|| {
            format!("could not create a spill file in {}", self.tmp_dir.display())
        })?;
        let records = self.buf.len();
        {
            let mut wtr = BufWriter::new(&mut file);
            for rec in self.buf.drain(..) {
                bincode::serialize_into(&mut wtr, &rec)
                    .context("could not serialise a record to the spill file")?;
            }
            wtr.flush()?;
        }
        self.runs.push(SpilledRun { file, records });
        Ok(())
    }

    /// Ends the adding phase: sorts the in-memory remainder and returns an
    /// iterator merging it with every spilled run.
    pub fn into_sorted_iter(mut self) -> Result<SortedIter<T>> {
        self.buf.sort_unstable();

        let mut runs = Vec::with_capacity(self.runs.len());
        for run in self.runs {
            let mut file = run.file;
            file.seek(SeekFrom::Start(0))
                .context("could not rewind a spill file")?;
            runs.push((BufReader::new(file), run.records));
        }

        let mut iter = SortedIter {
            runs,
            mem: self.buf.into_iter(),
            heap: BinaryHeap::new(),
        };
        iter.prime()?;
        Ok(iter)
    }
}

struct HeapEntry<T> {
    value: T,
    source: usize,
}

impl<T: Ord> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapEntry<T> {}

impl<T: Ord> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then(self.source.cmp(&other.source))
    }
}

/// K-way merge over the spilled runs and the in-memory remainder.
pub struct SortedIter<T> {
    runs: Vec<(BufReader<File>, usize)>,
    mem: std::vec::IntoIter<T>,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
}

impl<T: Ord + DeserializeOwned> SortedIter<T> {
    fn prime(&mut self) -> Result<()> {
        for source in 0..self.runs.len() {
            if let Some(value) = self.read_run(source)? {
                self.heap.push(Reverse(HeapEntry { value, source }));
            }
        }
        let mem_source = self.runs.len();
        if let Some(value) = self.mem.next() {
            self.heap.push(Reverse(HeapEntry {
                value,
                source: mem_source,
            }));
        }
        Ok(())
    }

    fn read_run(&mut self, source: usize) -> Result<Option<T>> {
        let (reader, remaining) = &mut self.runs[source];
        if *remaining == 0 {
            return Ok(None);
        }
        *remaining -= 1;
        let value =
            bincode::deserialize_from(&mut *reader).context("could not read a spilled record")?;
        Ok(Some(value))
    }

    fn refill(&mut self, source: usize) -> Result<Option<T>> {
        if source < self.runs.len() {
            self.read_run(source)
        } else {
            Ok(self.mem.next())
        }
    }
}

impl<T: Ord + DeserializeOwned> Iterator for SortedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        let Reverse(entry) = self.heap.pop()?;
        match self.refill(entry.source) {
            Ok(Some(value)) => self.heap.push(Reverse(HeapEntry {
                value,
                source: entry.source,
            })),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sorter: ExternalSorter<i32>) -> Vec<i32> {
        sorter
            .into_sorted_iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn sorts_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalSorter::new(100, dir.path());
        for v in [5, 3, 9, 1, 1, 7] {
            sorter.push(v).unwrap();
        }
        assert_eq!(sorter.len(), 6);
        assert_eq!(drain(sorter), vec![1, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn sorts_across_spilled_runs() {
        let dir = tempfile::tempdir().unwrap();
        // capacity of 3 forces several spills
        let mut sorter = ExternalSorter::new(3, dir.path());
        let values: Vec<i32> = (0..50).map(|v| (v * 37) % 41).collect();
        for v in &values {
            sorter.push(*v).unwrap();
        }

        let mut expected = values;
        expected.sort_unstable();
        assert_eq!(drain(sorter), expected);
    }

    #[test]
    fn empty_sorter_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sorter = ExternalSorter::<i32>::new(4, dir.path());
        assert!(sorter.is_empty());
        assert_eq!(drain(sorter), Vec::<i32>::new());
    }

    #[test]
    fn exact_multiple_of_capacity_spills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalSorter::new(2, dir.path());
        for v in [4, 2, 3, 1] {
            sorter.push(v).unwrap();
        }
        assert_eq!(drain(sorter), vec![1, 2, 3, 4]);
    }
}
