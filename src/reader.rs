use crate::cluster::{Cluster, ClusterSource};
use crate::matcher::BarcodeMatcher;
use crate::metrics::MetricsTally;
use crate::read_structure::ReadStructure;
use crate::record::DemuxRecord;
use crate::tile_buffer::TileBuffer;
use anyhow::{bail, Result};

/// Everything a tile reader needs besides the tile itself. Shared,
/// immutable, across every reader task of the run.
pub struct ReadContext {
    pub run_barcode: String,
    pub matcher: Option<BarcodeMatcher>,
    pub null_key_registered: bool,
    template_reads: Vec<(usize, usize)>,
    barcode_reads: Vec<(usize, usize)>,
}

impl ReadContext {
    pub fn new(
        structure: &ReadStructure,
        run_barcode: String,
        matcher: Option<BarcodeMatcher>,
        null_key_registered: bool,
    ) -> Self {
        ReadContext {
            run_barcode,
            matcher,
            null_key_registered,
            template_reads: structure.template_reads(),
            barcode_reads: structure.barcode_reads(),
        }
    }

    /// A fresh per-task tally covering the matcher's expected barcodes.
    pub fn new_tally(&self) -> MetricsTally {
        match &self.matcher {
            Some(matcher) => MetricsTally::new(matcher.expected_keys().map(String::from)),
            None => MetricsTally::new(Vec::<String>::new()),
        }
    }
}

/// Drains a tile's cluster source into its buffer: shapes each cluster
/// into one record per template segment, resolves the barcode key, and
/// routes. Returns the number of clusters read.
pub fn process_tile(
    source: &mut dyn ClusterSource,
    ctx: &ReadContext,
    buffer: &mut TileBuffer,
    tally: &mut MetricsTally,
) -> Result<u64> {
    let mut clusters = 0u64;
    let paired = ctx.template_reads.len() == 2;

    while let Some(cluster) = source.next_cluster()? {
        if cluster.tile != buffer.tile() {
            bail!(
                "cluster source for tile {} produced a cluster from tile {}",
                buffer.tile(),
                cluster.tile
            );
        }
        clusters += 1;
        if clusters % 50_000 == 0 {
            info!("tile {}: processed {} clusters", buffer.tile(), clusters);
        }

        let (key, annotation) = resolve_barcode(&cluster, ctx, tally);
        if key.is_none() && !ctx.null_key_registered {
            // unmatched, and no sink wants unmatched records
            continue;
        }

        let name = cluster.read_name(&ctx.run_barcode);
        for (i, (segment_idx, _)) in ctx.template_reads.iter().enumerate() {
            let Some(segment) = cluster.segments.get(*segment_idx) else {
                bail!(
                    "cluster {} carries {} segments, but the read structure expects {}",
                    name,
                    cluster.segments.len(),
                    segment_idx + 1
                );
            };
            buffer.route(
                &key,
                DemuxRecord {
                    name: name.clone(),
                    paired,
                    second_of_pair: i == 1,
                    bases: segment.bases.clone(),
                    quals: segment.quals.clone(),
                    pf: cluster.pf,
                    barcode: annotation.clone(),
                },
            )?;
        }
    }
    Ok(clusters)
}

/// Returns the routing key and the annotation carried on the records. A
/// pre-assigned key is trusted as-is; otherwise the matcher decides, and
/// an unmatched cluster routes to the null key with the near-miss hint (if
/// any) as its annotation.
fn resolve_barcode(
    cluster: &Cluster,
    ctx: &ReadContext,
    tally: &mut MetricsTally,
) -> (Option<String>, Option<String>) {
    if let Some(key) = &cluster.matched_barcode {
        return (Some(key.clone()), Some(key.clone()));
    }
    let Some(matcher) = &ctx.matcher else {
        return (None, None);
    };

    let reads: Vec<&[u8]> = ctx
        .barcode_reads
        .iter()
        .map(|(i, _)| {
            cluster
                .segments
                .get(*i)
                .map(|s| s.bases.as_slice())
                .unwrap_or(&[])
        })
        .collect();
    let quals: Vec<Option<&[u8]>> = ctx
        .barcode_reads
        .iter()
        .map(|(i, _)| {
            cluster
                .segments
                .get(*i)
                .and_then(|s| s.quals.as_deref())
        })
        .collect();

    let decision = matcher.assign(&reads, &quals, cluster.pf, tally);
    let annotation = if decision.barcode.is_empty() {
        None
    } else {
        Some(decision.barcode.clone())
    };
    if decision.matched {
        (Some(decision.barcode), annotation)
    } else {
        (None, annotation)
    }
}
