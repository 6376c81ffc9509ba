use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What a run of cycles contributes to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Template,
    Barcode,
    MolecularBarcode,
    Skip,
}

impl SegmentKind {
    pub fn symbol(&self) -> char {
        match self {
            SegmentKind::Template => 'T',
            SegmentKind::Barcode => 'B',
            SegmentKind::MolecularBarcode => 'M',
            SegmentKind::Skip => 'S',
        }
    }

    fn from_symbol(c: char) -> Option<Self> {
        match c {
            'T' => Some(SegmentKind::Template),
            'B' => Some(SegmentKind::Barcode),
            'M' => Some(SegmentKind::MolecularBarcode),
            'S' => Some(SegmentKind::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub length: usize,
}

/// The cycle layout of a run, e.g. `36T8B8S30T`: an ordered list of
/// `<length><kind>` segments describing how each cluster's cycles are
/// carved into template reads, sample barcodes, molecular barcodes and
/// discarded cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStructure {
    segments: Vec<Segment>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReadStructureError {
    #[error(
        "malformed read structure `{0}`: expected one or more `<length><T|B|M|S>` pairs, \
         as in `151T8B8B151T`"
    )]
    Malformed(String),

    #[error("read structure `{0}` contains a zero-length segment")]
    ZeroLength(String),

    #[error("read structure `{0}` has no template segment")]
    NoTemplate(String),

    #[error("read structure `{0}` has {1} template segments, but at most two are supported")]
    TooManyTemplates(String, usize),
}

impl FromStr for ReadStructure {
    type Err = ReadStructureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // anchored, so embedded whitespace or stray characters fail outright
        let whole = Regex::new(r"^(?:[0-9]+[TBMS])+$").expect("static regex");
        if !whole.is_match(s) {
            return Err(ReadStructureError::Malformed(s.to_string()));
        }

        let token = Regex::new(r"([0-9]+)([TBMS])").expect("static regex");
        let mut segments = Vec::new();
        for cap in token.captures_iter(s) {
            let length: usize = cap[1]
                .parse()
                .map_err(|_| ReadStructureError::Malformed(s.to_string()))?;
            if length == 0 {
                return Err(ReadStructureError::ZeroLength(s.to_string()));
            }
            let kind = SegmentKind::from_symbol(cap[2].chars().next().expect("match is one char"))
                .expect("symbol class is anchored");
            segments.push(Segment { kind, length });
        }

        let templates = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Template)
            .count();
        if templates == 0 {
            return Err(ReadStructureError::NoTemplate(s.to_string()));
        }
        if templates > 2 {
            return Err(ReadStructureError::TooManyTemplates(s.to_string(), templates));
        }

        Ok(ReadStructure { segments })
    }
}

impl fmt::Display for ReadStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, "{}{}", seg.length, seg.kind.symbol())?;
        }
        Ok(())
    }
}

impl ReadStructure {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Ordered barcode segments as (segment index, length).
    pub fn barcodes(&self) -> Vec<(usize, usize)> {
        self.indices_of(SegmentKind::Barcode)
    }

    /// Ordered template segments as (segment index, length).
    pub fn templates(&self) -> Vec<(usize, usize)> {
        self.indices_of(SegmentKind::Template)
    }

    fn indices_of(&self, kind: SegmentKind) -> Vec<(usize, usize)> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == kind)
            .map(|(i, s)| (i, s.length))
            .collect()
    }

    /// The same structure with Skip segments removed. Clusters store one
    /// read segment per entry of this projection.
    pub fn output_projection(&self) -> ReadStructure {
        ReadStructure {
            segments: self
                .segments
                .iter()
                .copied()
                .filter(|s| s.kind != SegmentKind::Skip)
                .collect(),
        }
    }

    /// Indices into a cluster's segment list (one entry per non-skip
    /// segment) for each barcode segment, with the segment length.
    pub fn barcode_reads(&self) -> Vec<(usize, usize)> {
        self.cluster_indices_of(SegmentKind::Barcode)
    }

    /// As `barcode_reads`, for template segments.
    pub fn template_reads(&self) -> Vec<(usize, usize)> {
        self.cluster_indices_of(SegmentKind::Template)
    }

    fn cluster_indices_of(&self, kind: SegmentKind) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut cluster_idx = 0usize;
        for seg in &self.segments {
            if seg.kind == SegmentKind::Skip {
                continue;
            }
            if seg.kind == kind {
                out.push((cluster_idx, seg.length));
            }
            cluster_idx += 1;
        }
        out
    }

    /// 1 for single-end layouts, 2 for paired.
    pub fn num_records_per_cluster(&self) -> usize {
        self.templates().len()
    }

    /// Total bases across all barcode segments.
    pub fn total_barcode_length(&self) -> usize {
        self.barcodes().iter().map(|(_, len)| len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let rs: ReadStructure = "36T8B8S30T".parse().unwrap();
        assert_eq!(rs.segments().len(), 4);
        assert_eq!(rs.barcodes(), vec![(1, 8)]);
        assert_eq!(rs.templates(), vec![(0, 36), (3, 30)]);
        assert_eq!(rs.num_records_per_cluster(), 2);
        assert_eq!(rs.to_string(), "36T8B8S30T");
    }

    #[test]
    fn parse_dual_barcode() {
        let rs: ReadStructure = "151T8B8B151T".parse().unwrap();
        assert_eq!(rs.barcodes(), vec![(1, 8), (2, 8)]);
        assert_eq!(rs.total_barcode_length(), 16);
    }

    #[test]
    fn leading_zeroes_allowed() {
        let rs: ReadStructure = "036T08B".parse().unwrap();
        assert_eq!(rs.templates(), vec![(0, 36)]);
        assert_eq!(rs.barcodes(), vec![(1, 8)]);
    }

    #[test]
    fn rejects_whitespace() {
        assert_eq!(
            "36T 8B".parse::<ReadStructure>(),
            Err(ReadStructureError::Malformed("36T 8B".to_string()))
        );
    }

    #[test]
    fn rejects_zero_length() {
        assert_eq!(
            "36T0B".parse::<ReadStructure>(),
            Err(ReadStructureError::ZeroLength("36T0B".to_string()))
        );
    }

    #[test]
    fn rejects_no_template() {
        assert_eq!(
            "8B8B".parse::<ReadStructure>(),
            Err(ReadStructureError::NoTemplate("8B8B".to_string()))
        );
    }

    #[test]
    fn rejects_three_templates() {
        assert_eq!(
            "10T10T8B10T".parse::<ReadStructure>(),
            Err(ReadStructureError::TooManyTemplates(
                "10T10T8B10T".to_string(),
                3
            ))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ReadStructure>().is_err());
        assert!("T36".parse::<ReadStructure>().is_err());
        assert!("36X".parse::<ReadStructure>().is_err());
    }

    #[test]
    fn output_projection_drops_skips() {
        let rs: ReadStructure = "10T8B8S10T".parse().unwrap();
        let proj = rs.output_projection();
        assert_eq!(proj.to_string(), "10T8B10T");
        // cluster indices count only non-skip segments
        assert_eq!(rs.barcode_reads(), vec![(1, 8)]);
        assert_eq!(rs.template_reads(), vec![(0, 10), (2, 10)]);
    }
}
