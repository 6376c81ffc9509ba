use crate::cluster::TileId;
use crate::pool::PriorityPool;
use crate::sinks::SinkRegistry;
use crate::tile_buffer::{DedupIter, TileBuffer};
use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

/// Writers always outrank readers, whose priorities start at -1 and fall
/// by one per tile.
const WRITE_PRIORITY: i32 = 1;

/// Per-tile, per-barcode progress. A key absent from the map never
/// produced a record in that tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Read,
    QueuedForWrite,
    Written,
}

/// State transitions that only an implementation bug can produce.
#[derive(Error, Debug)]
pub enum OrderingViolation {
    #[error("tile {0} was reported complete twice")]
    TileCompletedTwice(TileId),

    #[error("tile {0} completed but was never scheduled")]
    UnknownTile(TileId),

    #[error(
        "write task found tile {tile}, barcode {key:?} in state {state:?} \
         instead of QueuedForWrite"
    )]
    UnexpectedWriteState {
        tile: TileId,
        key: Option<String>,
        state: Option<KeyState>,
    },

    #[error("write task found no buffer for tile {0}")]
    MissingBuffer(TileId),

    #[error("submit() called twice")]
    DoubleSubmit,
}

/// The reading half of one tile's work: fill the buffer the scheduler
/// hands over, return once the tile's cluster source is exhausted.
pub struct TileWork {
    pub tile: TileId,
    pub read: Box<dyn FnOnce(&mut TileBuffer) -> Result<()> + Send>,
}

struct TileEntry {
    tile: TileId,
    done_reading: bool,
    buffer: Option<TileBuffer>,
    states: IndexMap<Option<String>, KeyState>,
}

struct SchedState {
    /// Tile entries in tile-number order.
    tiles: Vec<TileEntry>,
    pending: Option<Vec<TileWork>>,
    completed: bool,
    failure: Option<anyhow::Error>,
}

/// Coordinates readers and writers so that, per sink, tiles are written in
/// tile-number order with at most one write in flight, while readers for
/// different tiles and writers for different barcodes run concurrently.
///
/// All state transitions happen under one mutex; a condition variable
/// wakes the main thread on completion or on the first failure.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

struct SchedulerShared {
    state: Mutex<SchedState>,
    progress: Condvar,
    registry: Arc<SinkRegistry>,
    pool: Arc<PriorityPool>,
    max_in_ram_per_tile: usize,
    tmp_dir: PathBuf,
}

impl Scheduler {
    pub fn new(
        mut work: Vec<TileWork>,
        registry: Arc<SinkRegistry>,
        pool: Arc<PriorityPool>,
        max_in_ram_per_tile: usize,
        tmp_dir: PathBuf,
    ) -> Self {
        work.sort_by_key(|w| w.tile);
        let tiles = work
            .iter()
            .map(|w| TileEntry {
                tile: w.tile,
                done_reading: false,
                buffer: None,
                states: IndexMap::new(),
            })
            .collect();

        Scheduler {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedState {
                    tiles,
                    pending: Some(work),
                    completed: false,
                    failure: None,
                }),
                progress: Condvar::new(),
                registry,
                pool,
                max_in_ram_per_tile,
                tmp_dir,
            }),
        }
    }

    /// Enqueues one reader task per tile, earlier tiles at higher
    /// priority. May be called at most once.
    pub fn submit(&self) -> Result<()> {
        let work = {
            let mut state = self.shared.lock();
            state
                .pending
                .take()
                .ok_or(OrderingViolation::DoubleSubmit)?
        };

        for (i, tile_work) in work.into_iter().enumerate() {
            let priority = -1 - i as i32;
            let shared = Arc::clone(&self.shared);
            self.shared
                .pool
                .execute(priority, move || shared.run_reader(tile_work));
        }
        // a run with no tiles completes immediately
        self.shared.pump();
        Ok(())
    }

    /// Blocks until every (tile, barcode) pair is written, or the first
    /// failure. On failure the caller shuts the pool down.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.lock();
        while !state.completed && state.failure.is_none() {
            state = self
                .shared
                .progress
                .wait(state)
                .expect("scheduler lock poisoned");
        }
        match state.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl SchedulerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    fn fail(&self, error: anyhow::Error) {
        {
            let mut state = self.lock();
            if state.failure.is_none() {
                state.failure = Some(error);
            } else {
                debug!("suppressing a failure after the first: {error:?}");
            }
        }
        self.progress.notify_all();
    }

    fn run_reader(self: Arc<Self>, work: TileWork) {
        let tile = work.tile;
        let read = work.read;
        let shared = Arc::clone(&self);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || -> Result<()> {
            let mut buffer = TileBuffer::new(
                tile,
                shared.registry.keys(),
                shared.max_in_ram_per_tile,
                &shared.tmp_dir,
            );
            read(&mut buffer)?;
            shared.complete_tile(tile, buffer)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e.context(format!("reader task for tile {tile} failed"))),
            Err(_) => self.fail(anyhow!("reader task for tile {tile} panicked")),
        }
    }

    /// Reader callback: marks the tile done, records which barcodes it
    /// produced, and looks for newly eligible writes.
    fn complete_tile(self: &Arc<Self>, tile: TileId, buffer: TileBuffer) -> Result<()> {
        {
            let mut state = self.lock();
            let entry = state
                .tiles
                .iter_mut()
                .find(|t| t.tile == tile)
                .ok_or(OrderingViolation::UnknownTile(tile))?;
            if entry.done_reading {
                bail!(OrderingViolation::TileCompletedTwice(tile));
            }
            entry.done_reading = true;
            for key in buffer.occupied_keys() {
                entry.states.insert(key, KeyState::Read);
            }
            entry.buffer = Some(buffer);
        }
        debug!("tile {tile}: done reading");
        self.pump();
        Ok(())
    }

    /// The heart of the ordering guarantee. Under one lock, scan each
    /// barcode in registry order across tiles in tile order:
    /// a tile still reading blocks everything behind it for that barcode,
    /// an in-flight write does the same, and the first READ tile whose
    /// predecessors are all written becomes the barcode's next write.
    fn pump(self: &Arc<Self>) {
        let mut to_write = Vec::new();
        {
            let mut state = self.lock();
            if state.completed || state.failure.is_some() {
                return;
            }

            let all_written = state.pending.is_none()
                && state.tiles.iter().all(|t| {
                    t.done_reading && t.states.values().all(|s| *s == KeyState::Written)
                });
            if all_written {
                state.completed = true;
                self.progress.notify_all();
                return;
            }

            for key in self.registry.keys() {
                for entry in state.tiles.iter_mut() {
                    if !entry.done_reading {
                        break;
                    }
                    match entry.states.get(&key) {
                        None | Some(KeyState::Written) => continue,
                        Some(KeyState::QueuedForWrite) => break,
                        Some(KeyState::Read) => {
                            entry.states.insert(key.clone(), KeyState::QueuedForWrite);
                            to_write.push((entry.tile, key.clone()));
                            break;
                        }
                    }
                }
            }
        }

        for (tile, key) in to_write {
            let shared = Arc::clone(self);
            self.pool
                .execute(WRITE_PRIORITY, move || shared.run_writer(tile, key));
        }
    }

    fn run_writer(self: Arc<Self>, tile: TileId, key: Option<String>) {
        let shared = Arc::clone(&self);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            shared.write_tile_barcode(tile, &key)
        }));
        match outcome {
            Ok(Ok(())) => self.pump(),
            Ok(Err(e)) => self.fail(e.context(format!("writer task for tile {tile} failed"))),
            Err(_) => self.fail(anyhow!("writer task for tile {tile} panicked")),
        }
    }

    fn write_tile_barcode(self: &Arc<Self>, tile: TileId, key: &Option<String>) -> Result<()> {
        let sorter = {
            let mut state = self.lock();
            let entry = state
                .tiles
                .iter_mut()
                .find(|t| t.tile == tile)
                .ok_or(OrderingViolation::UnknownTile(tile))?;
            match entry.states.get(key) {
                Some(KeyState::QueuedForWrite) => {}
                other => bail!(OrderingViolation::UnexpectedWriteState {
                    tile,
                    key: key.clone(),
                    state: other.copied(),
                }),
            }
            entry
                .buffer
                .as_mut()
                .ok_or(OrderingViolation::MissingBuffer(tile))?
                .take_key(key)
                .ok_or(OrderingViolation::MissingBuffer(tile))?
        };

        let mut drain = DedupIter::new(sorter.into_sorted_iter()?, tile);
        {
            let sink = self
                .registry
                .sink(key)
                .ok_or_else(|| anyhow!("no sink registered for barcode key {key:?}"))?;
            let mut sink = sink.lock().expect("sink lock poisoned");
            for rec in &mut drain {
                let rec = rec?;
                sink.write(&rec).with_context(|| {
                    format!("sink for barcode key {key:?} rejected record {}", rec.name)
                })?;
            }
        }
        if drain.dropped > 0 {
            info!(
                "tile {tile}, barcode {}: suppressed {} records with duplicate coordinates",
                key.as_deref().unwrap_or("<unmatched>"),
                drain.dropped
            );
        }

        let mut state = self.lock();
        let entry = state
            .tiles
            .iter_mut()
            .find(|t| t.tile == tile)
            .ok_or(OrderingViolation::UnknownTile(tile))?;
        entry.states.insert(key.clone(), KeyState::Written);
        if entry.done_reading && entry.states.values().all(|s| *s == KeyState::Written) {
            // the last barcode of this tile is on disk; the buffer and its
            // spill files can go
            entry.buffer = None;
        }
        Ok(())
    }
}
