#![cfg_attr(debug_assertions, allow(dead_code, unused_imports))]

#[macro_use]
extern crate log;

mod cli;
mod cluster;
mod config;
mod demux;
mod io;
mod matcher;
mod metrics;
mod pool;
mod read_structure;
mod reader;
mod record;
mod sample_sheet;
mod scheduler;
mod sinks;
mod sorter;
mod tile_buffer;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::{ConfigError, DemuxConfig};
use env_logger::{Builder, Env};
use read_structure::{ReadStructure, ReadStructureError};
use sample_sheet::{SampleSheet, SampleSheetError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// 1 for anything caught before the pipeline starts, 2 for failures
/// during the run itself.
fn exit_code(err: &anyhow::Error) -> u8 {
    let preflight = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<SampleSheetError>().is_some()
            || cause.downcast_ref::<ReadStructureError>().is_some()
    });
    if preflight {
        1
    } else {
        2
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Demux {
            input,
            sample_sheet,
            read_structure,
            run_barcode,
            lane,
            metrics,
            matching,
            pipeline,
        } => {
            let structure: ReadStructure = read_structure.parse()?;
            let config = DemuxConfig {
                run_barcode,
                lane,
                matcher: matching.to_opts(),
                num_threads: pipeline.threads,
                max_in_ram_per_tile: pipeline.max_in_ram_per_tile,
                first_tile: pipeline.first_tile,
                tile_limit: pipeline.tile_limit,
                force_gc: pipeline.force_gc,
                tmp_dir: pipeline
                    .tmp_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
            };
            demux::run_demux(
                Path::new(&input),
                Path::new(&sample_sheet),
                &structure,
                Path::new(&metrics),
                &config,
            )
        }
        Commands::Barcodes {
            input,
            read_structure,
            sample_sheet,
            barcodes,
            lane,
            metrics,
            matching,
            pipeline,
        } => {
            let structure: ReadStructure = read_structure.parse()?;
            let sheet = match sample_sheet {
                Some(path) => SampleSheet::from_tsv(Path::new(&path), &structure)?,
                None if barcodes.is_empty() => {
                    return Err(anyhow::Error::from(SampleSheetError::Empty).context(
                        indoc::formatdoc! {"
                        no expected barcodes were given. Pass either a table:
                          --sample-sheet <barcodes.tsv>
                        or one inline barcode per expected sample:
                          --barcode ACGTACGT --barcode TTTTGGGG"},
                    ));
                }
                None => SampleSheet::from_inline(&barcodes, &structure)?,
            };
            let config = DemuxConfig {
                lane,
                matcher: matching.to_opts(),
                first_tile: pipeline.first_tile,
                tile_limit: pipeline.tile_limit,
                ..DemuxConfig::default()
            };
            demux::run_barcodes(
                Path::new(&input),
                &sheet,
                &structure,
                Path::new(&metrics),
                &config,
            )
        }
    }
}
