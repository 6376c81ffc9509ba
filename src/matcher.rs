use crate::metrics::MetricsTally;
use clap::ValueEnum;

/// Sentinel bases the instrument emits when a cycle could not be resolved.
pub fn is_no_call(base: u8) -> bool {
    matches!(base, b'N' | b'n' | b'.')
}

fn bases_equal(read: u8, expected: u8) -> bool {
    read.to_ascii_uppercase() == expected.to_ascii_uppercase()
}

/// How mismatches between a barcode read and an expected barcode are
/// counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DistanceMode {
    /// Base-by-base, counting low-quality bases as mismatches.
    #[default]
    Hamming,
    /// Base-by-base, ignoring qualities.
    LenientHamming,
    /// A bounded edit distance tolerating an indel, compared from the far
    /// end of each sequence.
    Free,
}

#[derive(Debug, Clone, Copy)]
pub struct MatcherOpts {
    pub max_mismatches: usize,
    pub min_mismatch_delta: usize,
    pub max_no_calls: usize,
    /// Bases below this quality count as mismatches even when the letters
    /// agree. Zero disables the penalty.
    pub min_base_quality: u8,
    pub distance_mode: DistanceMode,
}

impl Default for MatcherOpts {
    fn default() -> Self {
        MatcherOpts {
            max_mismatches: 1,
            min_mismatch_delta: 1,
            max_no_calls: 2,
            min_base_quality: 0,
            distance_mode: DistanceMode::Hamming,
        }
    }
}

/// One configured sample barcode: a subsequence per Barcode segment of the
/// read structure, plus the canonical key (the concatenation in segment
/// order).
#[derive(Debug, Clone)]
pub struct ExpectedBarcode {
    pub key: String,
    pub segments: Vec<Vec<u8>>,
}

impl ExpectedBarcode {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        let key = segments
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<String>();
        ExpectedBarcode { key, segments }
    }
}

/// The decision for one cluster's barcode reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeMatch {
    pub matched: bool,
    /// The canonical key when matched; the lowercase best-candidate hint
    /// when narrowly missed; empty otherwise.
    pub barcode: String,
    pub mismatches: usize,
    pub mismatches_to_second_best: usize,
}

/// Assigns cluster barcode reads to expected barcodes.
///
/// The decision is a pure function of the barcode reads, their qualities
/// and the configuration; tile order, thread count and scheduling play no
/// part. Metric updates go to a caller-owned tally, so concurrent readers
/// each tally privately.
pub struct BarcodeMatcher {
    expected: Vec<ExpectedBarcode>,
    opts: MatcherOpts,
}

impl BarcodeMatcher {
    pub fn new(expected: Vec<ExpectedBarcode>, opts: MatcherOpts) -> Self {
        assert!(
            !expected.is_empty(),
            "matcher requires at least one expected barcode"
        );
        BarcodeMatcher { expected, opts }
    }

    pub fn expected_keys(&self) -> impl Iterator<Item = &str> {
        self.expected.iter().map(|e| e.key.as_str())
    }

    /// Decide the best match for one cluster. `reads` and `quals` carry one
    /// entry per Barcode segment, in segment order. Exactly one tally
    /// counter is incremented.
    pub fn assign(
        &self,
        reads: &[&[u8]],
        quals: &[Option<&[u8]>],
        pf: bool,
        tally: &mut MetricsTally,
    ) -> BarcodeMatch {
        let total_bases: usize = reads.iter().map(|r| r.len()).sum();
        let no_calls: usize = reads
            .iter()
            .map(|r| r.iter().filter(|b| is_no_call(**b)).count())
            .sum();

        // distances past this bound can never change the outcome
        let max_interesting = self.opts.max_mismatches + self.opts.min_mismatch_delta;

        let mut best = usize::MAX;
        let mut second = usize::MAX;
        let mut best_idx = 0usize;
        for (i, eb) in self.expected.iter().enumerate() {
            let d = self.distance(reads, quals, eb, max_interesting);
            if d < best {
                second = best;
                best = d;
                best_idx = i;
            } else if d < second {
                second = d;
            }
        }

        let matched = if self.expected.len() == 1 {
            // force-to-single-barcode: one configured barcode always wins
            true
        } else {
            no_calls <= self.opts.max_no_calls
                && best <= self.opts.max_mismatches
                && second.saturating_sub(best) >= self.opts.min_mismatch_delta
        };

        let winner = &self.expected[best_idx];
        if matched {
            tally.record_match(&winner.key, best, pf);
            BarcodeMatch {
                matched: true,
                barcode: winner.key.clone(),
                mismatches: best,
                mismatches_to_second_best: second.min(total_bases),
            }
        } else {
            tally.record_no_match(pf);
            if no_calls + best < total_bases {
                BarcodeMatch {
                    matched: false,
                    barcode: winner.key.to_lowercase(),
                    mismatches: best,
                    mismatches_to_second_best: second.min(total_bases),
                }
            } else {
                BarcodeMatch {
                    matched: false,
                    barcode: String::new(),
                    mismatches: total_bases,
                    mismatches_to_second_best: second.min(total_bases),
                }
            }
        }
    }

    /// Total distance across all barcode segments, capped just past
    /// `max_interesting`.
    fn distance(
        &self,
        reads: &[&[u8]],
        quals: &[Option<&[u8]>],
        expected: &ExpectedBarcode,
        max_interesting: usize,
    ) -> usize {
        let mut total = 0usize;
        for (i, exp_seg) in expected.segments.iter().enumerate() {
            let read = reads.get(i).copied().unwrap_or(&[]);
            let qual = quals.get(i).copied().flatten();
            total += match self.opts.distance_mode {
                DistanceMode::Hamming => {
                    hamming_mismatches(read, qual, exp_seg, self.opts.min_base_quality)
                }
                DistanceMode::LenientHamming => hamming_mismatches(read, qual, exp_seg, 0),
                DistanceMode::Free => free_distance(read, exp_seg, max_interesting),
            };
            if total > max_interesting {
                return max_interesting + 1;
            }
        }
        total
    }
}

/// Positions are compared up to the shorter of the two sequences; extra
/// bytes on either side are ignored. Read-side no-calls are skipped, and
/// expected-side no-calls are never penalised.
fn hamming_mismatches(read: &[u8], quals: Option<&[u8]>, expected: &[u8], min_quality: u8) -> usize {
    let mut mismatches = 0usize;
    for i in 0..expected.len().min(read.len()) {
        let rb = read[i];
        if is_no_call(rb) {
            continue;
        }
        let eb = expected[i];
        if is_no_call(eb) {
            continue;
        }
        if !bases_equal(rb, eb) {
            mismatches += 1;
        } else if min_quality > 0 {
            if let Some(q) = quals {
                if q.get(i).copied().unwrap_or(u8::MAX) < min_quality {
                    mismatches += 1;
                }
            }
        }
    }
    mismatches
}

/// Banded edit distance (band width one, so a single insertion or deletion
/// is tolerated at unit cost and further indels keep adding). Sequences
/// are compared reversed so that an extra base at the start of the read
/// becomes a trailing indel, and the scan aborts as soon as the best
/// achievable cost exceeds `max_interesting`.
fn free_distance(read: &[u8], expected: &[u8], max_interesting: usize) -> usize {
    let cap = max_interesting + 1;
    if read.len().abs_diff(expected.len()) > 1 {
        return cap;
    }

    let e: Vec<u8> = expected.iter().rev().copied().collect();
    let r: Vec<u8> = read.iter().rev().copied().collect();
    let m = r.len();

    const FAR: usize = usize::MAX / 2;
    let mut prev: Vec<usize> = vec![FAR; m + 1];
    prev[0] = 0;
    if m >= 1 {
        prev[1] = 1;
    }

    for (row, &eb) in e.iter().enumerate() {
        let i = row + 1;
        let mut cur = vec![FAR; m + 1];
        let lo = i.saturating_sub(1);
        let hi = (i + 1).min(m);
        let mut row_min = FAR;

        if lo == 0 {
            cur[0] = i;
            row_min = i;
        }
        for j in lo.max(1)..=hi {
            let rb = r[j - 1];
            let sub_cost = if is_no_call(rb) || is_no_call(eb) || bases_equal(rb, eb) {
                0
            } else {
                1
            };
            let sub = prev[j - 1].saturating_add(sub_cost);
            let del = prev[j].saturating_add(1);
            let ins = cur[j - 1].saturating_add(1);
            cur[j] = sub.min(del).min(ins);
            row_min = row_min.min(cur[j]);
        }

        if row_min > max_interesting {
            return cap;
        }
        prev = cur;
    }
    prev[m].min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(barcodes: &[&str]) -> Vec<ExpectedBarcode> {
        barcodes
            .iter()
            .map(|b| ExpectedBarcode::new(vec![b.as_bytes().to_vec()]))
            .collect()
    }

    fn tally_for(matcher: &BarcodeMatcher) -> MetricsTally {
        MetricsTally::new(matcher.expected_keys().map(String::from))
    }

    #[test]
    fn perfect_match() {
        let m = BarcodeMatcher::new(expected(&["ACGTACGT", "TTTTGGGG"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let q = vec![40u8; 8];
        let result = m.assign(&[b"ACGTACGT"], &[Some(&q)], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.barcode, "ACGTACGT");
        assert_eq!(result.mismatches, 0);
        assert_eq!(tally.get("ACGTACGT").unwrap().perfect_matches, 1);
        assert_eq!(tally.no_match.reads, 0);
    }

    #[test]
    fn one_mismatch_within_tolerance() {
        let m = BarcodeMatcher::new(expected(&["ACGTACGT", "TTTTGGGG"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"ACGTACGA"], &[None], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.mismatches, 1);
        let c = tally.get("ACGTACGT").unwrap();
        assert_eq!(c.one_mismatch_matches, 1);
        assert_eq!(c.perfect_matches, 0);
    }

    #[test]
    fn ambiguity_depends_on_delta() {
        let barcodes = expected(&["AAAAAAAA", "AAAAAAAT"]);

        let m = BarcodeMatcher::new(barcodes.clone(), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"AAAAAAAA"], &[None], true, &mut tally);
        assert!(result.matched);
        assert_eq!(result.barcode, "AAAAAAAA");
        assert_eq!(result.mismatches_to_second_best, 1);

        let m = BarcodeMatcher::new(
            barcodes,
            MatcherOpts {
                min_mismatch_delta: 2,
                ..MatcherOpts::default()
            },
        );
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"AAAAAAAA"], &[None], true, &mut tally);
        assert!(!result.matched);
        // narrowly missed, so the best candidate is hinted in lower case
        assert_eq!(result.barcode, "aaaaaaaa");
        assert_eq!(tally.no_match.reads, 1);
    }

    #[test]
    fn no_call_budget_exceeded() {
        let m = BarcodeMatcher::new(expected(&["NNNACGTA", "ACGTACGT"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"NNNACGTA"], &[None], true, &mut tally);

        assert!(!result.matched);
        assert_eq!(tally.no_match.reads, 1);
    }

    #[test]
    fn all_no_calls_reports_empty_barcode() {
        let m = BarcodeMatcher::new(expected(&["ACGT", "TTTT"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"NNNN"], &[None], false, &mut tally);

        assert!(!result.matched);
        assert_eq!(result.barcode, "");
        assert_eq!(result.mismatches, 4);
    }

    #[test]
    fn single_barcode_always_matches() {
        let m = BarcodeMatcher::new(expected(&["ACGTACGT"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"TGCATGCA"], &[None], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.barcode, "ACGTACGT");
        assert_eq!(tally.get("ACGTACGT").unwrap().reads, 1);

        // even an all-no-call read is forced onto the single barcode
        let result = m.assign(&[b"NNNNNNNN"], &[None], true, &mut tally);
        assert!(result.matched);
    }

    #[test]
    fn low_quality_bases_count_as_mismatches() {
        let opts = MatcherOpts {
            min_base_quality: 20,
            ..MatcherOpts::default()
        };
        let m = BarcodeMatcher::new(expected(&["ACGT", "TTTT"]), opts);
        let mut tally = tally_for(&m);
        let q = [40u8, 40, 5, 40];
        let result = m.assign(&[b"ACGT"], &[Some(&q)], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.mismatches, 1);
        assert_eq!(tally.get("ACGT").unwrap().one_mismatch_matches, 1);
    }

    #[test]
    fn lenient_hamming_ignores_quality() {
        let opts = MatcherOpts {
            min_base_quality: 20,
            distance_mode: DistanceMode::LenientHamming,
            ..MatcherOpts::default()
        };
        let m = BarcodeMatcher::new(expected(&["ACGT", "TTTT"]), opts);
        let mut tally = tally_for(&m);
        let q = [5u8, 5, 5, 5];
        let result = m.assign(&[b"ACGT"], &[Some(&q)], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.mismatches, 0);
    }

    #[test]
    fn registration_order_breaks_ties() {
        let m = BarcodeMatcher::new(
            expected(&["AAAT", "AAAG"]),
            MatcherOpts {
                min_mismatch_delta: 0,
                ..MatcherOpts::default()
            },
        );
        let mut tally = tally_for(&m);
        // one mismatch to both; the earlier registration wins
        let result = m.assign(&[b"AAAC"], &[None], true, &mut tally);
        assert!(result.matched);
        assert_eq!(result.barcode, "AAAT");
    }

    #[test]
    fn dual_segment_mismatches_are_summed() {
        let eb = vec![
            ExpectedBarcode::new(vec![b"ACGT".to_vec(), b"TTTT".to_vec()]),
            ExpectedBarcode::new(vec![b"GGGG".to_vec(), b"CCCC".to_vec()]),
        ];
        assert_eq!(eb[0].key, "ACGTTTTT");

        let m = BarcodeMatcher::new(
            eb,
            MatcherOpts {
                max_mismatches: 2,
                ..MatcherOpts::default()
            },
        );
        let mut tally = MetricsTally::new(m.expected_keys().map(String::from));
        let result = m.assign(&[b"ACGA", b"TTTA"], &[None, None], true, &mut tally);

        assert!(result.matched);
        assert_eq!(result.barcode, "ACGTTTTT");
        assert_eq!(result.mismatches, 2);
    }

    #[test]
    fn free_distance_tolerates_single_indel() {
        // read has an extra leading base; reversed comparison absorbs it
        // as one trailing indel
        assert_eq!(free_distance(b"TACGTACGT", b"ACGTACGT", 3), 1);
        assert_eq!(free_distance(b"ACGTACGT", b"ACGTACGT", 3), 0);
        // a substitution alongside costs one more
        assert_eq!(free_distance(b"TACGTACGG", b"ACGTACGT", 3), 2);
    }

    #[test]
    fn free_distance_aborts_early() {
        assert_eq!(free_distance(b"TTTTTTTT", b"ACGCACGC", 2), 3);
        // length difference beyond the band is immediately uninteresting
        assert_eq!(free_distance(b"ACG", b"ACGTA", 2), 3);
    }

    #[test]
    fn expected_no_calls_are_not_penalised() {
        let m = BarcodeMatcher::new(expected(&["ACNT", "GGGG"]), MatcherOpts::default());
        let mut tally = tally_for(&m);
        let result = m.assign(&[b"ACGT"], &[None], true, &mut tally);
        assert!(result.matched);
        assert_eq!(result.mismatches, 0);
    }
}
