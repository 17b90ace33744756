//! Variant quality-control pipeline.
//!
//! A pipeline is an ordered list of stages. Each stage is a pure mask over the
//! variants of a block and carries its own parameters.
use crate::error::{Result, StaarError};
use crate::genotype::GenotypeBlock;
use crate::vset::AlleleCounts;
use crate::VariantType;
use ndarray::Axis;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MafRange {
    /// Exclusive lower bound
    pub maf_min: f64,
    /// Inclusive upper bound
    pub maf_max: f64,
}

impl MafRange {
    pub fn new(maf_min: f64, maf_max: f64) -> Result<Self> {
        if maf_min >= maf_max {
            return Err(StaarError::Input(format!(
                "maf_min ({}) must be smaller than maf_max ({})",
                maf_min, maf_max
            )));
        }
        Ok(Self { maf_min, maf_max })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QcStage {
    /// FILTER is PASS or missing
    PassFilter,
    VariantType(VariantType),
    MafRange(MafRange),
    /// Minimum fraction of called genotypes
    CallRate(f64),
    /// Minimum exact Hardy-Weinberg p-value
    Hwe(f64),
    /// Drops spanning-deletion (`*`) alternate alleles
    MissingAlt,
}

impl QcStage {
    /// Per-variant keep mask.
    pub fn mask(&self, block: &GenotypeBlock) -> Vec<bool> {
        match self {
            QcStage::PassFilter => block.variants.iter().map(|v| v.filter_pass).collect(),
            QcStage::VariantType(vt) => block.variants.iter().map(|v| v.matches_type(*vt)).collect(),
            QcStage::MissingAlt => block.variants.iter().map(|v| !v.is_star()).collect(),
            QcStage::MafRange(range) => column_counts(block)
                .map(|c| {
                    let af = c.allele_freq();
                    let maf = af.min(1.0 - af);
                    maf > range.maf_min && maf <= range.maf_max
                })
                .collect(),
            QcStage::CallRate(min) => {
                let n = block.n_subjects().max(1) as f64;
                column_counts(block).map(|c| c.n_called as f64 / n >= *min).collect()
            }
            QcStage::Hwe(min_p) => block
                .dosages
                .axis_iter(Axis(1))
                .map(|col| {
                    let (hom_ref, het, hom_alt) = genotype_counts(col.iter());
                    hwe_exact_pvalue(het, hom_ref, hom_alt) >= *min_p
                })
                .collect(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            QcStage::PassFilter => "FILTER == PASS".to_string(),
            QcStage::VariantType(vt) => format!("variant type: {}", vt),
            QcStage::MafRange(r) => format!("{} < MAF <= {}", r.maf_min, r.maf_max),
            QcStage::CallRate(c) => format!("call rate >= {}", c),
            QcStage::Hwe(p) => format!("HWE p-value >= {}", p),
            QcStage::MissingAlt => "alternate allele is not '*'".to_string(),
        }
    }
}

fn column_counts(block: &GenotypeBlock) -> impl Iterator<Item = AlleleCounts> + '_ {
    block.dosages.axis_iter(Axis(1)).map(|col| AlleleCounts::from_dosages(col.iter()))
}

fn genotype_counts<'a>(column: impl Iterator<Item = &'a f64>) -> (u64, u64, u64) {
    let mut counts = (0, 0, 0);
    for &g in column {
        if g.is_nan() {
            continue;
        }
        match g.round() as i64 {
            0 => counts.0 += 1,
            1 => counts.1 += 1,
            _ => counts.2 += 1,
        }
    }
    counts
}

/// Which default stages an analysis runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcMode {
    Gwas,
    Wgs,
}

/// Optional thresholds; stages whose parameters are absent are skipped.
#[derive(Debug, Clone, Default)]
pub struct QcParams {
    pub variant_type: Option<VariantType>,
    pub maf_min: Option<f64>,
    pub maf_max: Option<f64>,
    pub call_rate: Option<f64>,
    pub hwe: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct QcPipeline {
    stages: Vec<QcStage>,
}

impl QcPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, stage: QcStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[QcStage] {
        &self.stages
    }

    /// Default stage order for a mode.
    ///
    /// WGS fills in `variant_type = variant`, `maf_min = 0` and
    /// `maf_max = 0.01` when they are not given; GWAS only defaults `maf_min`.
    pub fn for_mode(mode: QcMode, params: &QcParams) -> Result<Self> {
        let mut pipeline = QcPipeline::new();
        let (variant_type, maf_min, maf_max) = match mode {
            QcMode::Wgs => {
                pipeline = pipeline.push(QcStage::PassFilter);
                (
                    Some(params.variant_type.unwrap_or(VariantType::Variant)),
                    params.maf_min.unwrap_or(0.0),
                    Some(params.maf_max.unwrap_or(0.01)),
                )
            }
            QcMode::Gwas => (params.variant_type, params.maf_min.unwrap_or(0.0), params.maf_max),
        };

        if let Some(vt) = variant_type {
            pipeline = pipeline.push(QcStage::VariantType(vt));
        }
        if let Some(maf_max) = maf_max {
            pipeline = pipeline.push(QcStage::MafRange(MafRange::new(maf_min, maf_max)?));
        }
        if let Some(call_rate) = params.call_rate {
            pipeline = pipeline.push(QcStage::CallRate(call_rate));
        }
        if let Some(hwe) = params.hwe {
            pipeline = pipeline.push(QcStage::Hwe(hwe));
        }
        if mode == QcMode::Wgs {
            pipeline = pipeline.push(QcStage::MissingAlt);
        }
        Ok(pipeline)
    }

    pub fn log_parameters(&self) {
        log::info!("Variant QC parameters");
        log::info!("---------------------");
        for stage in &self.stages {
            log::info!("{}", stage.describe());
        }
        log::info!("---------------------");
    }

    /// Runs the stages in order; an empty result is an error.
    pub fn apply(&self, block: &GenotypeBlock) -> Result<GenotypeBlock> {
        let mut current = block.clone();
        for stage in &self.stages {
            let mask = stage.mask(&current);
            current = current.filter_variants(&mask);
            log::debug!("{}: {} variants remaining", stage.describe(), current.n_variants());
        }
        if current.n_variants() == 0 {
            return Err(StaarError::EmptyResult("no variant remaining after preprocessing".into()));
        }
        log::info!("{} variants included in analysis.", current.n_variants());
        Ok(current)
    }
}

/// Exact Hardy-Weinberg test (Wigginton, Cutler & Abecasis 2005).
pub fn hwe_exact_pvalue(obs_het: u64, obs_hom1: u64, obs_hom2: u64) -> f64 {
    let n = obs_het + obs_hom1 + obs_hom2;
    if n == 0 {
        return 1.0;
    }
    let obs_homr = obs_hom1.min(obs_hom2);
    let rare = 2 * obs_homr + obs_het;
    let genotypes = n;

    let mut probs = vec![0.0f64; rare as usize + 1];
    let mut mid = rare * (2 * genotypes - rare) / (2 * genotypes);
    if mid % 2 != rare % 2 {
        mid += 1;
    }
    probs[mid as usize] = 1.0;
    let mut sum = 1.0;

    let mut curr_hets = mid;
    let mut curr_homr = (rare - mid) / 2;
    let mut curr_homc = genotypes - curr_hets - curr_homr;
    while curr_hets >= 2 {
        let p = probs[curr_hets as usize] * (curr_hets as f64) * (curr_hets as f64 - 1.0)
            / (4.0 * (curr_homr as f64 + 1.0) * (curr_homc as f64 + 1.0));
        probs[curr_hets as usize - 2] = p;
        sum += p;
        curr_hets -= 2;
        curr_homr += 1;
        curr_homc += 1;
    }

    curr_hets = mid;
    curr_homr = (rare - mid) / 2;
    curr_homc = genotypes - curr_hets - curr_homr;
    while curr_hets + 2 <= rare {
        let p = probs[curr_hets as usize] * 4.0 * (curr_homr as f64) * (curr_homc as f64)
            / ((curr_hets as f64 + 2.0) * (curr_hets as f64 + 1.0));
        probs[curr_hets as usize + 2] = p;
        sum += p;
        curr_hets += 2;
        curr_homr -= 1;
        curr_homc -= 1;
    }

    let target = probs[obs_het as usize];
    let p: f64 = probs.iter().filter(|&&p| p <= target).sum::<f64>() / sum;
    p.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotype::VariantRecord;
    use ndarray::Array2;

    fn block_with(dosages: Array2<f64>, alts: &[&str]) -> GenotypeBlock {
        let variants = alts
            .iter()
            .enumerate()
            .map(|(i, a)| VariantRecord {
                chrom: "1".into(),
                pos: i as u64 + 1,
                id: format!("v{}", i),
                ref_allele: "A".into(),
                alt_allele: a.to_string(),
                filter_pass: i != 0,
                annotation: None,
            })
            .collect();
        let ids = (0..dosages.nrows()).map(|i| format!("s{}", i)).collect();
        GenotypeBlock::new(ids, variants, dosages).unwrap()
    }

    #[test]
    fn empty_maf_range_is_rejected() {
        assert!(MafRange::new(0.01, 0.01).is_err());
        let params = QcParams { maf_min: Some(0.05), maf_max: Some(0.01), ..Default::default() };
        assert!(QcPipeline::for_mode(QcMode::Gwas, &params).is_err());
    }

    #[test]
    fn wgs_defaults_build_the_full_stage_list() {
        let pipeline = QcPipeline::for_mode(QcMode::Wgs, &QcParams::default()).unwrap();
        assert_eq!(
            pipeline.stages(),
            &[
                QcStage::PassFilter,
                QcStage::VariantType(VariantType::Variant),
                QcStage::MafRange(MafRange { maf_min: 0.0, maf_max: 0.01 }),
                QcStage::MissingAlt,
            ]
        );
        let gwas = QcPipeline::for_mode(QcMode::Gwas, &QcParams::default()).unwrap();
        assert!(gwas.stages().is_empty());
    }

    #[test]
    fn stages_filter_in_order() {
        let mut dosages = Array2::zeros((100, 4));
        for j in 0..4 {
            dosages[[j, j]] = 1.0;
        }
        let block = block_with(dosages, &["G", "G", "*", "AT"]);
        let pipeline = QcPipeline::new()
            .push(QcStage::PassFilter)
            .push(QcStage::MissingAlt)
            .push(QcStage::MafRange(MafRange::new(0.0, 0.01).unwrap()));
        let out = pipeline.apply(&block).unwrap();
        let ids: Vec<&str> = out.variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v3"]);

        let snv_only = QcPipeline::new().push(QcStage::VariantType(VariantType::Snv));
        assert_eq!(snv_only.apply(&block).unwrap().n_variants(), 2);
    }

    #[test]
    fn filtering_everything_is_an_error() {
        let block = block_with(Array2::zeros((10, 1)), &["G"]);
        let err = QcPipeline::new().push(QcStage::PassFilter).apply(&block).unwrap_err();
        assert!(matches!(err, StaarError::EmptyResult(_)));
    }

    #[test]
    fn hwe_exact_test() {
        // perfect equilibrium for p = 0.5
        assert!(hwe_exact_pvalue(50, 25, 25) > 0.5);
        // no heterozygotes at all is a strong departure
        assert!(hwe_exact_pvalue(0, 50, 50) < 1e-20);
        assert_eq!(hwe_exact_pvalue(0, 100, 0), 1.0);
    }

    #[test]
    fn call_rate_stage() {
        let mut dosages = Array2::zeros((10, 2));
        for i in 0..3 {
            dosages[[i, 1]] = f64::NAN;
        }
        let block = block_with(dosages, &["G", "G"]);
        assert_eq!(QcStage::CallRate(0.9).mask(&block), vec![true, false]);
    }
}
