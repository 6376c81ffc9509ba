use crate::cluster::{Cluster, ClusterSource, ReadSegment, TileId};
use crate::config::ConfigError;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A lane's clusters as a tab-separated file, one row per cluster:
///
/// ```text
/// tile  x  y  pf  bases_1  quals_1  [bases_2  quals_2  ...]
/// ```
///
/// One bases/quals pair per non-skip segment of the read structure, `*`
/// for absent qualities, qualities Phred+33 encoded. Rows must be grouped
/// by tile; lines that are empty or start with `#` are skipped. Opening
/// the file scans it once to find each tile's byte range, so a tile's
/// source reads only its own slice.
#[derive(Debug)]
pub struct ClusterFile {
    slices: Vec<TileSlice>,
}

/// One tile's byte range within the cluster file. Cheap to move into a
/// reader task; `open` gives the task its own file handle.
#[derive(Debug)]
pub struct TileSlice {
    pub tile: TileId,
    path: PathBuf,
    lane: u32,
    offset: u64,
    rows: usize,
}

impl ClusterFile {
    pub fn open(path: &Path, lane: u32) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("could not open cluster file {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut slices: Vec<TileSlice> = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0u64;
        let mut line = String::new();
        let mut line_no = 0usize;

        loop {
            line.clear();
            let consumed = reader.read_line(&mut line)?;
            if consumed == 0 {
                break;
            }
            line_no += 1;
            let start = offset;
            offset += consumed as u64;

            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let tile_field = trimmed.split('\t').next().unwrap_or("");
            let tile = TileId(tile_field.parse().with_context(|| {
                format!("line {line_no}: invalid tile number `{tile_field}`")
            })?);

            match slices.last_mut() {
                Some(last) if last.tile == tile => last.rows += 1,
                _ => {
                    if !seen.insert(tile) {
                        bail!(
                            "cluster file is not grouped by tile: tile {} reappears at line {}",
                            tile,
                            line_no
                        );
                    }
                    slices.push(TileSlice {
                        tile,
                        path: path.to_path_buf(),
                        lane,
                        offset: start,
                        rows: 1,
                    });
                }
            }
        }

        slices.sort_by_key(|s| s.tile);
        Ok(ClusterFile { slices })
    }

    /// Restricts the run to the configured tile window. `first_tile` drops
    /// tiles that sort before it; `tile_limit` keeps at most that many.
    pub fn apply_window(
        &mut self,
        first_tile: Option<u32>,
        tile_limit: Option<usize>,
    ) -> Result<()> {
        if let Some(first) = first_tile {
            let first = TileId(first);
            let pos = self
                .slices
                .iter()
                .position(|s| s.tile == first)
                .ok_or(ConfigError::FirstTileMissing(first.0))?;
            self.slices.drain(..pos);
        }
        if let Some(limit) = tile_limit {
            self.slices.truncate(limit);
        }
        if self.slices.is_empty() {
            bail!(ConfigError::NoTiles);
        }
        Ok(())
    }

    pub fn tiles(&self) -> Vec<TileId> {
        self.slices.iter().map(|s| s.tile).collect()
    }

    pub fn into_slices(self) -> Vec<TileSlice> {
        self.slices
    }
}

impl TileSlice {
    pub fn open(&self) -> Result<ClusterFileSource> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("could not reopen cluster file {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.offset))?;
        Ok(ClusterFileSource {
            reader: BufReader::new(file),
            lane: self.lane,
            tile: self.tile,
            remaining: self.rows,
            line: String::new(),
        })
    }
}

pub struct ClusterFileSource {
    reader: BufReader<File>,
    lane: u32,
    tile: TileId,
    remaining: usize,
    line: String,
}

impl ClusterSource for ClusterFileSource {
    fn next_cluster(&mut self) -> Result<Option<Cluster>> {
        while self.remaining > 0 {
            self.line.clear();
            let consumed = self.reader.read_line(&mut self.line)?;
            if consumed == 0 {
                bail!("cluster file ended early inside tile {}", self.tile);
            }
            let trimmed = self.line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            self.remaining -= 1;
            let cluster = parse_cluster(trimmed, self.lane)?;
            return Ok(Some(cluster));
        }
        Ok(None)
    }
}

fn parse_cluster(line: &str, lane: u32) -> Result<Cluster> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 6 || fields.len() % 2 != 0 {
        bail!(
            "malformed cluster row: expected `tile x y pf` plus bases/quals \
             pairs, got {} fields",
            fields.len()
        );
    }

    let tile = TileId(fields[0].parse().context("invalid tile number")?);
    let x = fields[1].parse().context("invalid x coordinate")?;
    let y = fields[2].parse().context("invalid y coordinate")?;
    let pf = match fields[3] {
        "1" => true,
        "0" => false,
        other => bail!("invalid pass-filter flag `{other}` (expected 0 or 1)"),
    };

    let mut segments = Vec::new();
    for pair in fields[4..].chunks(2) {
        let bases = pair[0].as_bytes().to_vec();
        let quals = match pair[1] {
            "*" => None,
            encoded => {
                if encoded.len() != bases.len() {
                    bail!(
                        "quality string length {} does not match {} bases",
                        encoded.len(),
                        bases.len()
                    );
                }
                let mut quals = Vec::with_capacity(encoded.len());
                for b in encoded.bytes() {
                    if b < 33 {
                        bail!("invalid quality character {:#x}", b);
                    }
                    quals.push(b - 33);
                }
                Some(quals)
            }
        };
        segments.push(ReadSegment { bases, quals });
    }

    Ok(Cluster {
        lane,
        tile,
        x,
        y,
        pf,
        segments,
        matched_barcode: None,
    })
}
