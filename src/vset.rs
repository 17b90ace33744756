//! Variant-set preparation: mean imputation, minor-allele coding, MAF and rarity.
use crate::error::{Result, StaarError};
use crate::genotype::GenotypeBlock;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Default minor allele count at or below which a variant is "very rare".
pub const DEFAULT_MAC_THRESH: u32 = 10;

/// A cleaned variant set ready for the set tests.
#[derive(Debug, Clone)]
pub struct VariantSet {
    /// Minor-allele dosage, subjects x variants, no missing values
    pub dosage: Array2<f64>,
    pub maf: Array1<f64>,
    pub is_rare: Vec<bool>,
}

impl VariantSet {
    pub fn n_variants(&self) -> usize {
        self.dosage.ncols()
    }

    pub fn n_subjects(&self) -> usize {
        self.dosage.nrows()
    }
}

/// Observed allele statistics of one variant, before imputation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlleleCounts {
    /// Alternate allele count over called genotypes
    pub ac: f64,
    /// Number of called alleles
    pub an: f64,
    pub n_called: usize,
}

impl AlleleCounts {
    pub fn from_dosages<'a>(column: impl Iterator<Item = &'a f64>) -> Self {
        let mut ac = 0.0;
        let mut n_called = 0usize;
        for &g in column {
            if !g.is_nan() {
                ac += g;
                n_called += 1;
            }
        }
        Self { ac, an: 2.0 * n_called as f64, n_called }
    }

    pub fn allele_freq(&self) -> f64 {
        if self.an > 0.0 {
            self.ac / self.an
        } else {
            f64::NAN
        }
    }

    pub fn mac(&self) -> f64 {
        self.ac.min(self.an - self.ac)
    }
}

/// Prepares raw calls (subjects x variants, NaN = missing).
///
/// `allele_freq` overrides the observed alternate allele frequency used for
/// flipping and MAF; the observed counts still decide rarity.
pub fn prepare_vset(
    raw: ArrayView2<f64>,
    allele_freq: Option<&[f64]>,
    mac_thresh: u32,
) -> Result<VariantSet> {
    let n_variants = raw.ncols();
    if n_variants == 0 {
        return Err(StaarError::EmptyResult("variant set has no variants".into()));
    }
    if let Some(af) = allele_freq {
        if af.len() != n_variants {
            return Err(StaarError::Input(format!(
                "{} allele frequencies for {} variants",
                af.len(),
                n_variants
            )));
        }
    }

    let mut dosage = raw.to_owned();
    let mut maf = Array1::zeros(n_variants);
    let mut is_rare = Vec::with_capacity(n_variants);
    let mac_thresh = mac_thresh as f64;

    for (j, mut col) in dosage.axis_iter_mut(Axis(1)).enumerate() {
        let counts = AlleleCounts::from_dosages(col.iter());
        if counts.n_called == 0 {
            return Err(StaarError::Input(format!("variant {} has no called genotypes", j)));
        }
        let mean = counts.ac / counts.n_called as f64;
        let af = allele_freq.map_or_else(|| counts.allele_freq(), |af| af[j]);

        let flip = af > 0.5;
        col.mapv_inplace(|g| {
            let g = if g.is_nan() { mean } else { g };
            if flip {
                2.0 - g
            } else {
                g
            }
        });

        maf[j] = af.min(1.0 - af);
        is_rare.push(counts.ac <= mac_thresh || counts.an - counts.ac <= mac_thresh);
        log::trace!(
            "variant {}: AF={:.4}, flipped={}, MAC={}, rare={}",
            j,
            af,
            flip,
            counts.mac(),
            is_rare[j]
        );
    }

    Ok(VariantSet { dosage, maf, is_rare })
}

/// Prepares every variant of a block.
pub fn prepare_block(block: &GenotypeBlock, mac_thresh: u32) -> Result<VariantSet> {
    prepare_vset(block.dosages.view(), None, mac_thresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn common_alternate_allele_is_flipped() {
        // AF = 0.7 -> coded dosage becomes 2 - g and MAF 0.3
        let raw = array![[2.0, 0.0], [1.0, 0.0], [2.0, 1.0], [1.0, 0.0], [1.0, 0.0]];
        let vset = prepare_vset(raw.view(), Some(&[0.7, 0.1]), 10).unwrap();
        assert_eq!(vset.dosage.column(0).to_vec(), vec![0.0, 1.0, 0.0, 1.0, 1.0]);
        assert_relative_eq!(vset.maf[0], 0.3, epsilon = 1e-12);
        assert_eq!(vset.dosage.column(1).to_vec(), vec![0.0, 0.0, 1.0, 0.0, 0.0]);
        assert_relative_eq!(vset.maf[1], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn observed_frequency_is_used_without_annotation() {
        let raw = array![[2.0], [2.0], [1.0], [2.0], [0.0]];
        let vset = prepare_vset(raw.view(), None, 10).unwrap();
        assert_relative_eq!(vset.maf[0], 0.3, epsilon = 1e-12);
        assert_eq!(vset.dosage.column(0).to_vec(), vec![0.0, 0.0, 1.0, 0.0, 2.0]);
    }

    #[test]
    fn missing_calls_take_the_mean_dosage() {
        let raw = array![[1.0], [f64::NAN], [0.0], [0.0]];
        let vset = prepare_vset(raw.view(), None, 10).unwrap();
        assert_relative_eq!(vset.dosage[[1, 0]], 1.0 / 3.0, epsilon = 1e-12);
        assert!(vset.dosage.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn rarity_uses_minor_allele_count() {
        let mut raw = Array2::zeros((20, 2));
        raw[[0, 0]] = 1.0;
        for i in 0..12 {
            raw[[i, 1]] = 1.0;
        }
        let vset = prepare_vset(raw.view(), None, 10).unwrap();
        assert_eq!(vset.is_rare, vec![true, false]);
    }

    #[test]
    fn empty_set_is_an_error() {
        let raw = Array2::<f64>::zeros((5, 0));
        let err = prepare_vset(raw.view(), None, 10).unwrap_err();
        assert!(matches!(err, StaarError::EmptyResult(_)));
    }
}
