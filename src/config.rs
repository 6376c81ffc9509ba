use crate::matcher::MatcherOpts;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_MAX_IN_RAM_PER_TILE: usize = 1_200_000;

/// Typed pipeline configuration, validated once before any work starts.
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// The run identifier that prefixes every read name.
    pub run_barcode: String,
    pub lane: u32,
    pub matcher: MatcherOpts,
    /// Pool width: positive = exact, 0 = all cores, negative = cores + n.
    pub num_threads: i32,
    /// Total in-RAM records per live tile, shared across all sinks.
    pub max_in_ram_per_tile: usize,
    pub first_tile: Option<u32>,
    pub tile_limit: Option<usize>,
    /// Accepted for compatibility with drivers that request explicit
    /// memory reclamation; spill buffers already bound memory, so this
    /// has no effect.
    pub force_gc: bool,
    /// Where per-sink sort collections spill their sorted runs.
    pub tmp_dir: PathBuf,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        DemuxConfig {
            run_barcode: String::new(),
            lane: 1,
            matcher: MatcherOpts::default(),
            num_threads: 0,
            max_in_ram_per_tile: DEFAULT_MAX_IN_RAM_PER_TILE,
            first_tile: None,
            tile_limit: None,
            force_gc: false,
            tmp_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "max_in_ram_per_tile ({budget}) split across {sinks} sinks leaves no room \
         for records; raise the budget or reduce the number of outputs"
    )]
    RamBudgetTooSmall { budget: usize, sinks: usize },

    #[error("tile_limit must be at least 1")]
    ZeroTileLimit,

    #[error("first_tile {0} is not present in the input")]
    FirstTileMissing(u32),

    #[error("no tiles to process")]
    NoTiles,
}

impl DemuxConfig {
    pub fn validate(&self, num_sinks: usize) -> Result<(), ConfigError> {
        if num_sinks == 0 || self.max_in_ram_per_tile / num_sinks == 0 {
            return Err(ConfigError::RamBudgetTooSmall {
                budget: self.max_in_ram_per_tile,
                sinks: num_sinks,
            });
        }
        if self.tile_limit == Some(0) {
            return Err(ConfigError::ZeroTileLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_must_cover_every_sink() {
        let config = DemuxConfig {
            max_in_ram_per_tile: 3,
            ..DemuxConfig::default()
        };
        assert!(config.validate(3).is_ok());
        assert_eq!(
            config.validate(4),
            Err(ConfigError::RamBudgetTooSmall { budget: 3, sinks: 4 })
        );
    }

    #[test]
    fn zero_tile_limit_rejected() {
        let config = DemuxConfig {
            tile_limit: Some(0),
            ..DemuxConfig::default()
        };
        assert_eq!(config.validate(1), Err(ConfigError::ZeroTileLimit));
    }
}
