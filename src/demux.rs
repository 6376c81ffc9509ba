use crate::cli::VERSION;
use crate::cluster::ClusterSource;
use crate::config::DemuxConfig;
use crate::io::ClusterFile;
use crate::matcher::BarcodeMatcher;
use crate::metrics::{build_rows, write_metrics_file, MetricsFileMeta, MetricsTally};
use crate::pool::{resolve_pool_size, PriorityPool};
use crate::read_structure::ReadStructure;
use crate::reader::{process_tile, ReadContext};
use crate::sample_sheet::SampleSheet;
use crate::scheduler::{Scheduler, TileWork};
use crate::sinks::{FastqSink, SinkRegistry};
use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Runs the full pipeline: demultiplex one lane's cluster file into one
/// sorted output per sample-sheet row, then write the barcode metrics.
pub fn run_demux(
    input: &Path,
    sheet_path: &Path,
    structure: &ReadStructure,
    metrics_path: &Path,
    config: &DemuxConfig,
) -> Result<()> {
    let started = Instant::now();

    let sheet = SampleSheet::from_tsv(sheet_path, structure)?;
    let num_sinks = sheet.samples.len() + usize::from(sheet.no_match.is_some());
    config.validate(num_sinks)?;

    let mut cluster_file = ClusterFile::open(input, config.lane)?;
    cluster_file.apply_window(config.first_tile, config.tile_limit)?;
    let tiles = cluster_file.tiles();

    // outputs are only created once the inputs have checked out
    let registry = Arc::new(build_registry(&sheet)?);
    info!(
        "lane {}: {} tiles across {} outputs, read structure {}",
        config.lane,
        tiles.len(),
        registry.len(),
        structure
    );
    debug!("tile order: {}", tiles.iter().join(", "));
    if config.force_gc {
        debug!("force_gc requested; spill buffers already bound memory, nothing to do");
    }

    let matcher = BarcodeMatcher::new(sheet.expected_barcodes(), config.matcher);
    let ctx = Arc::new(ReadContext::new(
        structure,
        config.run_barcode.clone(),
        Some(matcher),
        sheet.no_match.is_some(),
    ));

    let pool = Arc::new(PriorityPool::new(resolve_pool_size(
        config.num_threads,
        tiles.len(),
    )));
    let (tally_tx, tally_rx) = crossbeam::channel::unbounded::<MetricsTally>();

    let work: Vec<TileWork> = cluster_file
        .into_slices()
        .into_iter()
        .map(|slice| {
            let ctx = Arc::clone(&ctx);
            let tally_tx = tally_tx.clone();
            TileWork {
                tile: slice.tile,
                read: Box::new(move |buffer| {
                    let mut source = slice.open()?;
                    let mut tally = ctx.new_tally();
                    let clusters = process_tile(&mut source, &ctx, buffer, &mut tally)?;
                    debug!("tile {}: {} clusters", buffer.tile(), clusters);
                    // the receiver only disappears when the run is failing
                    let _ = tally_tx.send(tally);
                    Ok(())
                }),
            }
        })
        .collect();
    drop(tally_tx);

    let scheduler = Scheduler::new(
        work,
        Arc::clone(&registry),
        Arc::clone(&pool),
        config.max_in_ram_per_tile,
        config.tmp_dir.clone(),
    );
    scheduler.submit()?;
    let outcome = scheduler.wait();
    pool.shutdown_now();
    pool.join();
    outcome?;

    registry.close_all()?;

    let mut total = MetricsTally::new(sheet.expected_keys());
    for tally in tally_rx.try_iter() {
        total.merge(&tally);
    }
    write_metrics(metrics_path, &sheet, structure, &total, started)?;

    info!(
        "demultiplexed {} clusters in {:.1}s",
        total.total_reads(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

/// The separable companion: assign every cluster a barcode and write the
/// metrics file, producing no per-library output. Runs single-threaded;
/// barcode decisions do not depend on tile order, so there is nothing to
/// coordinate.
pub fn run_barcodes(
    input: &Path,
    sheet: &SampleSheet,
    structure: &ReadStructure,
    metrics_path: &Path,
    config: &DemuxConfig,
) -> Result<()> {
    let started = Instant::now();

    let mut cluster_file = ClusterFile::open(input, config.lane)?;
    cluster_file.apply_window(config.first_tile, config.tile_limit)?;

    let matcher = BarcodeMatcher::new(sheet.expected_barcodes(), config.matcher);
    let barcode_reads = structure.barcode_reads();
    let mut tally = MetricsTally::new(sheet.expected_keys());

    let mut clusters = 0u64;
    for slice in cluster_file.into_slices() {
        let tile = slice.tile;
        let mut source = slice.open()?;
        while let Some(cluster) = source.next_cluster()? {
            clusters += 1;
            if clusters % 50_000 == 0 {
                info!("processed {} clusters", clusters);
            }
            let reads: Vec<&[u8]> = barcode_reads
                .iter()
                .map(|(i, _)| {
                    cluster
                        .segments
                        .get(*i)
                        .map(|s| s.bases.as_slice())
                        .unwrap_or(&[])
                })
                .collect();
            let quals: Vec<Option<&[u8]>> = barcode_reads
                .iter()
                .map(|(i, _)| cluster.segments.get(*i).and_then(|s| s.quals.as_deref()))
                .collect();
            matcher.assign(&reads, &quals, cluster.pf, &mut tally);
        }
        debug!("tile {tile}: done");
    }

    write_metrics(metrics_path, sheet, structure, &tally, started)?;
    info!(
        "assigned {} clusters in {:.1}s",
        clusters,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

fn build_registry(sheet: &SampleSheet) -> Result<SinkRegistry> {
    let mut registry = SinkRegistry::new();
    for entry in &sheet.samples {
        let output = entry
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("sample {} has no OUTPUT path", entry.sample_alias))?;
        registry.register(Some(entry.key.clone()), Box::new(FastqSink::create(output)?))?;
    }
    if let Some(no_match) = &sheet.no_match {
        let output = no_match
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("the no-match row has no OUTPUT path"))?;
        registry.register(None, Box::new(FastqSink::create(output)?))?;
    }
    Ok(registry)
}

fn write_metrics(
    path: &Path,
    sheet: &SampleSheet,
    structure: &ReadStructure,
    tally: &MetricsTally,
    started: Instant,
) -> Result<()> {
    let rows = build_rows(tally, &sheet.labels(), structure.total_barcode_length());
    let meta = MetricsFileMeta {
        lanesplit_version: VERSION.to_string(),
        metrics_date: format!("{:?}", chrono::offset::Local::now()),
        elapsed: started.elapsed().as_secs_f64(),
        clusters: tally.total_reads(),
    };
    write_metrics_file(path, &meta, &rows)
        .with_context(|| format!("could not write metrics to {}", path.display()))
}
