//! Region drivers: single gene, gene batches and sliding windows.
use crate::annotation::{phred_matrix, AnnotationChannel};
use crate::cauchy::CauchyOptions;
use crate::coding::{single_gene_analysis, Category, CodingOptions};
use crate::config::{AnalysisConfig, GeneRegion};
use crate::error::{Result, StaarError};
use crate::genotype::{GenotypeBlock, GenotypeSource};
use crate::null_model::{get_common_ids, LdrNullModel, NullContext};
use crate::qc::QcPipeline;
use crate::staar::VariantSetTest;
use crate::table::CategoryResult;
use crate::vset::prepare_block;
use crate::VariantType;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};

/// Per-category results of one gene.
pub type GeneResult = BTreeMap<Category, Option<CategoryResult>>;

/// Half-overlapping windows of `window_length / 2`, starting at `start`.
///
/// A window is emitted only if its right edge does not pass `end`.
pub fn sliding_windows(start: u64, end: u64, window_length: u64) -> Result<Vec<(u64, u64)>> {
    let step = window_length / 2;
    if step == 0 {
        return Err(StaarError::Input("--window-length must be at least 2".into()));
    }
    let mut windows = Vec::new();
    let (mut left, mut right) = (start, start + step);
    while right <= end {
        windows.push((left, right));
        left = right;
        right += step;
    }
    Ok(windows)
}

/// Subjects shared by the null model, the keep list and the genotypes,
/// with the model reordered to match them.
pub fn align_subjects(
    model: &LdrNullModel,
    keep: Option<&[String]>,
    geno_ids: &[String],
) -> Result<(LdrNullModel, Vec<String>)> {
    let common = get_common_ids(&model.ids, keep, Some(geno_ids));
    log::info!("{} common subjects in the null model and genotype data.", common.len());
    if common.len() <= model.covar.ncols() {
        return Err(StaarError::Input(format!(
            "only {} subjects overlap between the null model and the genotype data",
            common.len()
        )));
    }
    Ok((model.align_to(&common)?, common))
}

/// Everything a region analysis needs, shared read-only across threads.
pub struct Study<'a> {
    pub ctx: &'a NullContext,
    pub source: &'a dyn GenotypeSource,
    pub config: AnalysisConfig,
    pub qc: QcPipeline,
    pub extract: Option<HashSet<String>>,
    pub cauchy: CauchyOptions,
}

impl<'a> Study<'a> {
    pub fn new(ctx: &'a NullContext, source: &'a dyn GenotypeSource, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        if source.subject_ids().len() != ctx.n_subjects() {
            return Err(StaarError::Input(format!(
                "genotype source returns {} subjects but the null model has {}",
                source.subject_ids().len(),
                ctx.n_subjects()
            )));
        }
        let qc = config.qc_pipeline()?;
        Ok(Self { ctx, source, config, qc, extract: None, cauchy: CauchyOptions::default() })
    }

    /// Only variants with these IDs are analysed.
    pub fn with_extract(mut self, ids: Vec<String>) -> Self {
        log::info!("{} variants in --extract.", ids.len());
        self.extract = Some(ids.into_iter().collect());
        self
    }

    /// Fetches a region and runs the preprocessing pipeline.
    pub fn fetch_block(&self, region: &GeneRegion) -> Result<GenotypeBlock> {
        let mut block = self.source.fetch_region(&region.chrom, region.start, region.end)?;
        if let Some(extract) = &self.extract {
            let keep: Vec<bool> = block.variants.iter().map(|v| extract.contains(&v.id)).collect();
            block = block.filter_variants(&keep);
        }
        self.qc.apply(&block)
    }

    fn coding_options(&self) -> CodingOptions {
        CodingOptions {
            variant_type: self.config.variant_type,
            use_annotation_weights: self.config.use_annotation_weights,
            mac_thresh: self.config.mac_thresh,
            categories: self.config.categories.clone(),
            cauchy: self.cauchy,
        }
    }

    /// Category analysis of one gene.
    pub fn analyze_gene(&self, region: &GeneRegion) -> Result<GeneResult> {
        log::info!("Analyzing {} ...", region);
        let block = self.fetch_block(region)?;
        single_gene_analysis(&block, self.ctx, &self.coding_options())
    }

    /// Analyses genes in parallel. A gene that fails is logged and left out.
    pub fn analyze_genes(&self, genes: &[(String, GeneRegion)]) -> Vec<(String, GeneRegion, GeneResult)> {
        genes
            .par_iter()
            .filter_map(|(name, region)| match self.analyze_gene(region) {
                Ok(result) => Some((name.clone(), region.clone(), result)),
                Err(e) => {
                    log::warn!("Skipping gene {} ({}): {}", name, region, e);
                    None
                }
            })
            .collect()
    }

    /// Sliding-window analysis over `region`. Every window is an independent
    /// test; windows with fewer than two variants are skipped.
    pub fn analyze_windows(&self, region: &GeneRegion, window_length: u64) -> Result<Vec<(GeneRegion, CategoryResult)>> {
        let windows = sliding_windows(region.start, region.end, window_length)?;
        log::info!("{} windows of length {} in {}", windows.len(), window_length, region);
        let block = self.fetch_block(region)?;
        // SNV windows are always weighted by the annotation channels
        let use_annot = self.config.variant_type == VariantType::Snv;
        if use_annot {
            block.annotations()?;
            log::info!("Weighting SNV windows by {} annotation channels.", AnnotationChannel::ALL.len());
        }
        let channel_names = AnnotationChannel::names();

        let results: Vec<(GeneRegion, CategoryResult)> = windows
            .par_iter()
            .filter_map(|&(left, right)| {
                let window = GeneRegion { chrom: region.chrom.clone(), start: left, end: right };
                // half-open, except that the last base of the region is kept
                let keep: Vec<bool> = block
                    .variants
                    .iter()
                    .map(|v| v.pos >= left && (v.pos < right || (right == region.end && v.pos == right)))
                    .collect();
                let subset = block.filter_variants(&keep);
                if subset.n_variants() < 2 {
                    log::debug!("Less than 2 variants in window {}, skip.", window);
                    return None;
                }
                match self.test_window(&subset, use_annot, &channel_names) {
                    Ok(result) => Some((window, result)),
                    Err(e) => {
                        log::warn!("Skipping window {}: {}", window, e);
                        None
                    }
                }
            })
            .collect();
        log::info!("{} windows analysed.", results.len());
        Ok(results)
    }

    fn test_window(&self, subset: &GenotypeBlock, use_annot: bool, channel_names: &[String]) -> Result<CategoryResult> {
        let vset = prepare_block(subset, self.config.mac_thresh)?;
        let phred = if use_annot {
            Some(phred_matrix(&subset.annotations()?))
        } else {
            None
        };
        let mut vset_test = VariantSetTest::with_options(self.ctx, self.cauchy);
        vset_test.input_vset(&vset, phred.as_ref().map(|p| p.view()))?;
        vset_test.do_inference(use_annot.then_some(channel_names))
    }
}
