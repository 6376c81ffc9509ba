use clap::builder::styling::AnsiColor;
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};

use crate::matcher::{DistanceMode, MatcherOpts};

const fn extra_build_info() -> &'static str {
    match option_env!("CARGO_BUILD_DESC") {
        Some(e) => e,
        None => env!("CARGO_PKG_VERSION"),
    }
}
pub const VERSION: &str = extra_build_info();
const INFO_STRING: &str = "
🧬 lanesplit version ";
const AFTER_STRING: &str = "
   ──────────────────────────────────
   demultiplex one flowcell lane into sorted per-library records";

// colouring of the help
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Yellow.on_default().bold())
    .usage(AnsiColor::BrightMagenta.on_default().bold())
    .literal(AnsiColor::BrightMagenta.on_default())
    .placeholder(AnsiColor::White.on_default());

#[derive(Parser)]
#[command(
    version = VERSION,
    about = format!("{}{}{}", INFO_STRING, VERSION, AFTER_STRING),
    arg_required_else_help = true,
    flatten_help = true,
    styles = STYLES
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Demultiplex a lane's cluster file into per-library outputs
    #[command(arg_required_else_help = true)]
    Demux {
        /// the input cluster file, rows grouped by tile
        input: String,

        /// tab-separated expected barcodes table with OUTPUT, SAMPLE_ALIAS,
        /// LIBRARY_NAME and BARCODE (or BARCODE_1..BARCODE_K) columns.
        /// a row of all-N barcodes collects unmatched clusters.
        #[arg(long, verbatim_doc_comment)]
        sample_sheet: String,

        /// the run's cycle layout, e.g. 151T8B8B151T
        #[arg(long)]
        read_structure: String,

        /// the run identifier prefixed to every read name
        #[arg(long)]
        run_barcode: String,

        #[arg(long, default_value_t = 1)]
        lane: u32,

        /// the per-barcode metrics output
        #[arg(short, default_value = "barcode_metrics.tsv")]
        metrics: String,

        #[command(flatten)]
        matching: MatchArgs,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Assign clusters to barcodes and write metrics, with no record output
    #[command(arg_required_else_help = true)]
    Barcodes {
        /// the input cluster file, rows grouped by tile
        input: String,

        /// the run's cycle layout, e.g. 151T8B8B151T
        #[arg(long)]
        read_structure: String,

        /// expected barcodes table; see `demux --sample-sheet`
        #[arg(long, conflicts_with = "barcodes")]
        sample_sheet: Option<String>,

        /// an expected barcode, repeatable; only for single-barcode
        /// read structures
        #[arg(long = "barcode", verbatim_doc_comment)]
        barcodes: Vec<String>,

        #[arg(long, default_value_t = 1)]
        lane: u32,

        /// the per-barcode metrics output
        #[arg(short, default_value = "barcode_metrics.tsv")]
        metrics: String,

        #[command(flatten)]
        matching: MatchArgs,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct MatchArgs {
    /// mismatches tolerated in the chosen barcode, summed across segments
    #[arg(long, default_value_t = 1)]
    pub max_mismatches: usize,

    /// how many more mismatches the runner-up barcode must carry
    #[arg(long, default_value_t = 1)]
    pub min_mismatch_delta: usize,

    /// no-call budget per cluster, summed across barcode segments
    #[arg(long, default_value_t = 2)]
    pub max_no_calls: usize,

    /// bases below this quality count as mismatches; 0 disables
    #[arg(long, default_value_t = 0)]
    pub min_base_quality: u8,

    #[arg(long, value_enum, default_value = "hamming")]
    pub distance_mode: DistanceMode,
}

impl MatchArgs {
    pub fn to_opts(&self) -> MatcherOpts {
        MatcherOpts {
            max_mismatches: self.max_mismatches,
            min_mismatch_delta: self.min_mismatch_delta,
            max_no_calls: self.max_no_calls,
            min_base_quality: self.min_base_quality,
            distance_mode: self.distance_mode,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// worker threads: 0 = all cores, negative = leave that many cores free
    #[arg(short, long, default_value_t = 0)]
    pub threads: i32,

    /// total in-RAM records per live tile, shared across all outputs
    #[arg(long, default_value_t = crate::config::DEFAULT_MAX_IN_RAM_PER_TILE)]
    pub max_in_ram_per_tile: usize,

    /// skip tiles that sort before this tile number
    #[arg(long)]
    pub first_tile: Option<u32>,

    /// process at most this many tiles
    #[arg(long)]
    pub tile_limit: Option<usize>,

    /// directory for sort spill files (defaults to the system temp dir)
    #[arg(long)]
    pub tmp_dir: Option<String>,

    /// accepted for compatibility; memory is reclaimed as buffers drop
    #[arg(long, hide = true)]
    pub force_gc: bool,
}
