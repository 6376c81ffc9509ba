use crate::record::{DemuxRecord, RecordSink};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The run's output map: one sink per expected barcode key, plus a sink
/// under the `None` key when the configuration declares a no-match output.
///
/// Insertion order is the order writers are scheduled in, and the map is
/// read-only once the run starts; per-barcode write serialisation means a
/// sink's mutex is never contended.
pub struct SinkRegistry {
    sinks: IndexMap<Option<String>, Mutex<Box<dyn RecordSink>>>,
    closed: Mutex<bool>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        SinkRegistry {
            sinks: IndexMap::new(),
            closed: Mutex::new(false),
        }
    }

    pub fn register(&mut self, key: Option<String>, sink: Box<dyn RecordSink>) -> Result<()> {
        if self.sinks.contains_key(&key) {
            bail!(
                "a sink is already registered for barcode key `{}`",
                key.as_deref().unwrap_or("<unmatched>")
            );
        }
        self.sinks.insert(key, Mutex::new(sink));
        Ok(())
    }

    /// Keys in registration order; the scheduler scans barcodes this way.
    pub fn keys(&self) -> Vec<Option<String>> {
        self.sinks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn has_no_match_sink(&self) -> bool {
        self.sinks.contains_key(&None)
    }

    pub fn sink(&self, key: &Option<String>) -> Option<&Mutex<Box<dyn RecordSink>>> {
        self.sinks.get(key)
    }

    /// Closes every sink. Closing twice is an implementation bug.
    pub fn close_all(&self) -> Result<()> {
        let mut closed = self.closed.lock().expect("registry lock poisoned");
        if *closed {
            bail!("sink registry closed twice");
        }
        *closed = true;
        for (key, sink) in &self.sinks {
            sink.lock()
                .expect("sink lock poisoned")
                .close()
                .with_context(|| {
                    format!(
                        "could not close the sink for barcode key `{}`",
                        key.as_deref().unwrap_or("<unmatched>")
                    )
                })?;
        }
        Ok(())
    }
}

/// Writes records as FASTQ, with `/1`/`/2` name suffixes for paired
/// layouts and the barcode decision carried in a `BC:Z:` comment.
/// Qualities are Phred values and are encoded with the usual +33 offset;
/// a record without qualities gets a run of `!`.
pub struct FastqSink {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl FastqSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("could not create output file {}", path.display()))?;
        Ok(FastqSink {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }
}

impl RecordSink for FastqSink {
    fn write(&mut self, rec: &DemuxRecord) -> Result<()> {
        write!(self.writer, "@{}", rec.name)?;
        if rec.paired {
            write!(self.writer, "/{}", if rec.second_of_pair { 2 } else { 1 })?;
        }
        if let Some(barcode) = &rec.barcode {
            write!(self.writer, " BC:Z:{barcode}")?;
        }
        self.writer.write_all(b"\n")?;
        self.writer.write_all(&rec.bases)?;
        self.writer.write_all(b"\n+\n")?;
        match &rec.quals {
            Some(quals) => {
                for q in quals {
                    self.writer.write_all(&[q.saturating_add(33).min(b'~')])?;
                }
            }
            None => {
                for _ in 0..rec.bases.len() {
                    self.writer.write_all(b"!")?;
                }
            }
        }
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("could not flush {}", self.path.display()))?;
        info!("wrote {} records to {}", self.records, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl RecordSink for NullSink {
        fn write(&mut self, _rec: &DemuxRecord) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn keys_keep_registration_order() {
        let mut registry = SinkRegistry::new();
        registry
            .register(Some("TTTT".to_string()), Box::new(NullSink))
            .unwrap();
        registry
            .register(Some("AAAA".to_string()), Box::new(NullSink))
            .unwrap();
        registry.register(None, Box::new(NullSink)).unwrap();

        assert_eq!(
            registry.keys(),
            vec![Some("TTTT".to_string()), Some("AAAA".to_string()), None]
        );
        assert!(registry.has_no_match_sink());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = SinkRegistry::new();
        registry
            .register(Some("AAAA".to_string()), Box::new(NullSink))
            .unwrap();
        assert!(registry
            .register(Some("AAAA".to_string()), Box::new(NullSink))
            .is_err());
    }

    #[test]
    fn closes_exactly_once() {
        let mut registry = SinkRegistry::new();
        registry
            .register(Some("AAAA".to_string()), Box::new(NullSink))
            .unwrap();
        registry.close_all().unwrap();
        assert!(registry.close_all().is_err());
    }

    #[test]
    fn fastq_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.fastq");
        let mut sink = FastqSink::create(&path).unwrap();

        sink.write(&DemuxRecord {
            name: "R:1:1101:5:7".to_string(),
            paired: true,
            second_of_pair: false,
            bases: b"ACGT".to_vec(),
            quals: Some(vec![40, 40, 2, 40]),
            pf: true,
            barcode: Some("ACGTACGT".to_string()),
        })
        .unwrap();
        sink.close().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "@R:1:1101:5:7/1 BC:Z:ACGTACGT\nACGT\n+\nII#I\n");
    }
}
