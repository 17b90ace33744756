//! Genotype blocks and the narrow query interface used to obtain them.
use crate::annotation::FunctionalAnnotation;
use crate::error::{Result, StaarError};
use crate::VariantType;
use ndarray::{Array2, Axis};

/// Site-level metadata for one variant in a block.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRecord {
    pub chrom: String,
    /// 1-based position
    pub pos: u64,
    pub id: String,
    pub ref_allele: String,
    pub alt_allele: String,
    /// `true` when FILTER is PASS or missing
    pub filter_pass: bool,
    pub annotation: Option<FunctionalAnnotation>,
}

impl VariantRecord {
    fn is_base(allele: &str) -> bool {
        allele.len() == 1 && matches!(allele.as_bytes()[0].to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T')
    }

    pub fn is_star(&self) -> bool {
        self.alt_allele == "*"
    }

    pub fn is_snv(&self) -> bool {
        Self::is_base(&self.ref_allele) && Self::is_base(&self.alt_allele) && self.ref_allele != self.alt_allele
    }

    /// Pure insertion or deletion: one allele is a prefix of the other.
    pub fn is_indel(&self) -> bool {
        if self.is_star() || self.ref_allele.len() == self.alt_allele.len() {
            return false;
        }
        let (short, long) = if self.ref_allele.len() < self.alt_allele.len() {
            (&self.ref_allele, &self.alt_allele)
        } else {
            (&self.alt_allele, &self.ref_allele)
        };
        !short.is_empty() && long.starts_with(short.as_str())
    }

    pub fn matches_type(&self, variant_type: VariantType) -> bool {
        match variant_type {
            VariantType::Variant => true,
            VariantType::Snv => self.is_snv(),
            VariantType::Indel => self.is_indel(),
        }
    }
}

/// A region of genotype calls: subjects in rows, variants in columns.
///
/// Dosages count alternate alleles (0, 1, 2) with NaN for missing calls.
#[derive(Debug, Clone)]
pub struct GenotypeBlock {
    pub subject_ids: Vec<String>,
    pub variants: Vec<VariantRecord>,
    pub dosages: Array2<f64>,
}

impl GenotypeBlock {
    pub fn new(subject_ids: Vec<String>, variants: Vec<VariantRecord>, dosages: Array2<f64>) -> Result<Self> {
        if dosages.nrows() != subject_ids.len() || dosages.ncols() != variants.len() {
            return Err(StaarError::Input(format!(
                "genotype matrix is {} x {} but there are {} subjects and {} variants",
                dosages.nrows(),
                dosages.ncols(),
                subject_ids.len(),
                variants.len()
            )));
        }
        Ok(Self { subject_ids, variants, dosages })
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn n_subjects(&self) -> usize {
        self.subject_ids.len()
    }

    /// Keeps the variants whose mask entry is `true`.
    pub fn filter_variants(&self, keep: &[bool]) -> GenotypeBlock {
        let idx: Vec<usize> = keep.iter().enumerate().filter(|(_, &k)| k).map(|(i, _)| i).collect();
        self.select_variants(&idx)
    }

    pub fn select_variants(&self, idx: &[usize]) -> GenotypeBlock {
        GenotypeBlock {
            subject_ids: self.subject_ids.clone(),
            variants: idx.iter().map(|&i| self.variants[i].clone()).collect(),
            dosages: self.dosages.select(Axis(1), idx),
        }
    }

    /// Reorders/subsets subjects by row index.
    pub fn select_subjects(&self, idx: &[usize]) -> GenotypeBlock {
        GenotypeBlock {
            subject_ids: idx.iter().map(|&i| self.subject_ids[i].clone()).collect(),
            variants: self.variants.clone(),
            dosages: self.dosages.select(Axis(0), idx),
        }
    }

    /// Variants with `start <= pos <= end`.
    pub fn restrict_to(&self, start: u64, end: u64) -> GenotypeBlock {
        let keep: Vec<bool> = self.variants.iter().map(|v| v.pos >= start && v.pos <= end).collect();
        self.filter_variants(&keep)
    }

    /// Annotations for every variant, or an error naming the first one without.
    pub fn annotations(&self) -> Result<Vec<&FunctionalAnnotation>> {
        self.variants
            .iter()
            .map(|v| {
                v.annotation.as_ref().ok_or_else(|| {
                    StaarError::Input(format!(
                        "variant {}:{} has no functional annotation; annotate the genotype data first",
                        v.chrom, v.pos
                    ))
                })
            })
            .collect()
    }
}

/// Source of genotype blocks for genomic intervals.
pub trait GenotypeSource: Sync {
    /// Subject ordering of every block this source returns.
    fn subject_ids(&self) -> &[String];

    /// All variants on `chrom` with 1-based `start <= pos <= end`.
    fn fetch_region(&self, chrom: &str, start: u64, end: u64) -> Result<GenotypeBlock>;
}

/// A source backed by a single block held in memory.
pub struct InMemorySource {
    block: GenotypeBlock,
}

impl InMemorySource {
    pub fn new(block: GenotypeBlock) -> Self {
        Self { block }
    }
}

impl GenotypeSource for InMemorySource {
    fn subject_ids(&self) -> &[String] {
        &self.block.subject_ids
    }

    fn fetch_region(&self, chrom: &str, start: u64, end: u64) -> Result<GenotypeBlock> {
        let keep: Vec<bool> = self
            .block
            .variants
            .iter()
            .map(|v| v.chrom == chrom && v.pos >= start && v.pos <= end)
            .collect();
        Ok(self.block.filter_variants(&keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn record(pos: u64, r: &str, a: &str) -> VariantRecord {
        VariantRecord {
            chrom: "1".into(),
            pos,
            id: format!("v{}", pos),
            ref_allele: r.into(),
            alt_allele: a.into(),
            filter_pass: true,
            annotation: None,
        }
    }

    #[test]
    fn variant_type_predicates() {
        assert!(record(1, "A", "G").is_snv());
        assert!(!record(1, "A", "AT").is_snv());
        assert!(record(1, "A", "AT").is_indel());
        assert!(record(1, "ATG", "A").is_indel());
        assert!(!record(1, "AT", "GC").is_indel());
        assert!(record(1, "A", "*").is_star());
        assert!(!record(1, "A", "*").is_indel());
    }

    #[test]
    fn region_fetch_is_inclusive() {
        let block = GenotypeBlock::new(
            vec!["s1".into(), "s2".into()],
            vec![record(10, "A", "G"), record(20, "C", "T"), record(30, "G", "A")],
            array![[0.0, 1.0, 2.0], [1.0, 0.0, f64::NAN]],
        )
        .unwrap();
        let source = InMemorySource::new(block);
        let sub = source.fetch_region("1", 10, 20).unwrap();
        assert_eq!(sub.n_variants(), 2);
        assert_eq!(sub.dosages, array![[0.0, 1.0], [1.0, 0.0]]);
        assert_eq!(source.fetch_region("2", 0, 100).unwrap().n_variants(), 0);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = GenotypeBlock::new(vec!["s1".into()], vec![record(1, "A", "G")], array![[0.0, 1.0]]);
        assert!(err.is_err());
    }
}
