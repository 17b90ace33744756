//! Validated analysis parameters shared by the command-line tools.
use crate::coding::{Category, CategorySelection};
use crate::error::{Result, StaarError};
use crate::qc::{QcMode, QcParams, QcPipeline};
use crate::vset::DEFAULT_MAC_THRESH;
use crate::VariantType;
use std::collections::BTreeSet;

/// A genomic interval, 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneRegion {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl GeneRegion {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64) -> Result<Self> {
        let chrom = chrom.into();
        if chrom.is_empty() {
            return Err(StaarError::Input("chromosome must not be empty".into()));
        }
        if start > end {
            return Err(StaarError::Input(format!(
                "starting with {} while ending with position {} is not allowed",
                start, end
            )));
        }
        Ok(Self { chrom, start, end })
    }
}

impl std::fmt::Display for GeneRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chr{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// Parses `<CHR>:<POS1>,<CHR>:<POS2>`.
pub fn parse_range(range: &str) -> Result<GeneRegion> {
    let format_err = || StaarError::Input("--range should be in this format: <CHR>:<POS1>,<CHR>:<POS2>".into());
    let (start, end) = range.split_once(',').ok_or_else(format_err)?;
    let (start_chr, start_pos) = start.trim().split_once(':').ok_or_else(format_err)?;
    let (end_chr, end_pos) = end.trim().split_once(':').ok_or_else(format_err)?;
    let start_pos: u64 = start_pos.trim().parse().map_err(|_| format_err())?;
    let end_pos: u64 = end_pos.trim().parse().map_err(|_| format_err())?;

    let start_chr = normalize_chrom(start_chr);
    let end_chr = normalize_chrom(end_chr);
    if start_chr != end_chr {
        return Err(StaarError::Input(format!(
            "starting with chromosome {} while ending with chromosome {} is not allowed",
            start_chr, end_chr
        )));
    }
    GeneRegion::new(start_chr, start_pos, end_pos)
}

/// Strips a leading `chr` so `chr1` and `1` compare equal.
pub fn normalize_chrom(chrom: &str) -> String {
    let chrom = chrom.trim();
    chrom
        .strip_prefix("chr")
        .or_else(|| chrom.strip_prefix("CHR"))
        .unwrap_or(chrom)
        .to_string()
}

/// Parses a comma-separated category list.
///
/// `all` anywhere selects everything, unknown names are logged and ignored,
/// and `missense` pulls in `disruptive_missense`.
pub fn parse_categories(spec: Option<&str>) -> Result<CategorySelection> {
    let spec = match spec {
        None => {
            log::info!("Set --variant-category as default 'all'");
            return Ok(CategorySelection::All);
        }
        Some(s) => s,
    };

    let mut selected = BTreeSet::new();
    for name in spec.split(',').map(|s| s.trim().to_lowercase()) {
        if name == "all" {
            return Ok(CategorySelection::All);
        }
        match name.parse::<Category>() {
            Ok(category) => {
                selected.insert(category);
            }
            Err(_) => log::info!("Ignore invalid variant category {}.", name),
        }
    }
    if selected.is_empty() {
        return Err(StaarError::Input("no valid variant category provided".into()));
    }
    if selected.contains(&Category::Missense) {
        selected.insert(Category::DisruptiveMissense);
    }
    Ok(CategorySelection::Only(selected))
}

/// Analysis parameters after validation.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub variant_type: VariantType,
    pub maf_min: f64,
    pub maf_max: f64,
    pub mac_thresh: u32,
    pub use_annotation_weights: bool,
    pub categories: CategorySelection,
    pub n_ldrs: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            variant_type: VariantType::Snv,
            maf_min: 0.0,
            maf_max: 0.01,
            mac_thresh: DEFAULT_MAC_THRESH,
            use_annotation_weights: false,
            categories: CategorySelection::All,
            n_ldrs: None,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=0.5).contains(&self.maf_min) {
            return Err(StaarError::Input("--maf-min must be greater than 0 and less than 0.5".into()));
        }
        if self.maf_max > 0.5 || self.maf_max <= 0.0 || self.maf_max <= self.maf_min {
            return Err(StaarError::Input(
                "--maf-max must be greater than 0, less than 0.5, and greater than --maf-min".into(),
            ));
        }
        if self.n_ldrs == Some(0) {
            return Err(StaarError::Input("--n-ldrs should be greater than 0".into()));
        }
        Ok(())
    }

    /// The WGS preprocessing pipeline for these parameters.
    pub fn qc_pipeline(&self) -> Result<QcPipeline> {
        let params = QcParams {
            variant_type: Some(self.variant_type),
            maf_min: Some(self.maf_min),
            maf_max: Some(self.maf_max),
            call_rate: None,
            hwe: None,
        };
        QcPipeline::for_mode(QcMode::Wgs, &params)
    }

    /// Annotation channels are only used for SNV analyses.
    pub fn annotation_weights_active(&self) -> bool {
        self.use_annotation_weights && self.variant_type == VariantType::Snv
    }

    pub fn log_parameters(&self) {
        log::info!("Variant type: {}", self.variant_type);
        log::info!("MAF range: ({}, {}]", self.maf_min, self.maf_max);
        log::info!("MAC threshold for very rare variants: {}", self.mac_thresh);
        log::info!("Annotation weights: {}", self.annotation_weights_active());
        match &self.categories {
            CategorySelection::All => log::info!("Variant categories: all"),
            CategorySelection::Only(set) => log::info!(
                "Variant categories: {}",
                set.iter().map(|c| c.name()).collect::<Vec<_>>().join(",")
            ),
        }
    }
}
