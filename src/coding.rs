//! Coding-variant categories and the per-gene category analysis.
use crate::annotation::{phred_matrix, AnnotationChannel, FunctionalAnnotation};
use crate::cauchy::CauchyOptions;
use crate::error::{Result, StaarError};
use crate::genotype::GenotypeBlock;
use crate::null_model::NullContext;
use crate::staar::{add_omnibus, base_statistic_names, VariantSetTest};
use crate::table::{CategoryResult, PvalueTable};
use crate::vset::prepare_block;
use crate::VariantType;
use std::collections::{BTreeMap, BTreeSet};

const STOP_CHANGES: [&str; 2] = ["stopgain", "stoploss"];
const SPLICING_ALL: [&str; 4] = ["splicing", "exonic;splicing", "ncRNA_splicing", "ncRNA_exonic;splicing"];
const SPLICING_CODING: [&str; 2] = ["splicing", "exonic;splicing"];
const FRAMESHIFTS: [&str; 2] = ["frameshift deletion", "frameshift insertion"];
const CODING_EXONIC: [&str; 4] = ["stopgain", "stoploss", "nonsynonymous SNV", "synonymous SNV"];

/// Coding variant categories, in analysis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Plof,
    Synonymous,
    Missense,
    DisruptiveMissense,
    PlofDs,
    Ptv,
    PtvDs,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Plof,
        Category::Synonymous,
        Category::Missense,
        Category::DisruptiveMissense,
        Category::PlofDs,
        Category::Ptv,
        Category::PtvDs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::Plof => "plof",
            Category::Synonymous => "synonymous",
            Category::Missense => "missense",
            Category::DisruptiveMissense => "disruptive_missense",
            Category::PlofDs => "plof_ds",
            Category::Ptv => "ptv",
            Category::PtvDs => "ptv_ds",
        }
    }

    pub fn official_name(&self) -> &'static str {
        match self {
            Category::Plof => "predicted loss of function (pLoF) variants",
            Category::Synonymous => "synonymous variants",
            Category::Missense => "missense variants",
            Category::DisruptiveMissense => "disruptive missense variants",
            Category::PlofDs => "pLoF variants with deleterious score",
            Category::Ptv => "protein truncating variants (PTV)",
            Category::PtvDs => "PTV with deleterious score",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Category::ALL
            .iter()
            .find(|c| c.name() == lower)
            .copied()
            .ok_or_else(|| format!("unknown variant category '{}'", s))
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which categories a caller wants results for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategorySelection {
    All,
    Only(BTreeSet<Category>),
}

impl CategorySelection {
    pub fn contains(&self, category: Category) -> bool {
        match self {
            CategorySelection::All => true,
            CategorySelection::Only(set) => set.contains(&category),
        }
    }
}

/// Variants that are coding or touch a splice site.
pub fn is_coding(annot: &FunctionalAnnotation) -> bool {
    CODING_EXONIC.contains(&annot.gencode_exonic_category.as_str())
        || SPLICING_ALL.contains(&annot.gencode_category.as_str())
}

/// Membership of every variant in every category. Categories overlap.
pub fn classify(annotations: &[&FunctionalAnnotation], variant_type: VariantType) -> BTreeMap<Category, Vec<bool>> {
    let mut masks: BTreeMap<Category, Vec<bool>> = Category::ALL.iter().map(|&c| (c, Vec::new())).collect();
    for annot in annotations {
        let exonic = annot.gencode_exonic_category.as_str();
        let category = annot.gencode_category.as_str();

        let plof = STOP_CHANGES.contains(&exonic) || SPLICING_ALL.contains(&category);
        let missense = exonic == "nonsynonymous SNV";
        let disruptive = missense && annot.metasvm_pred == "D";
        let ptv_snv = STOP_CHANGES.contains(&exonic) || SPLICING_CODING.contains(&category);
        let ptv_indel = FRAMESHIFTS.contains(&exonic);
        let ptv = match variant_type {
            VariantType::Snv => ptv_snv,
            VariantType::Indel => ptv_indel,
            VariantType::Variant => ptv_snv || ptv_indel,
        };

        for (cat, member) in [
            (Category::Plof, plof),
            (Category::Synonymous, exonic == "synonymous SNV"),
            (Category::Missense, missense),
            (Category::DisruptiveMissense, disruptive),
            (Category::PlofDs, plof || disruptive),
            (Category::Ptv, ptv),
            (Category::PtvDs, ptv || disruptive),
        ] {
            if let Some(mask) = masks.get_mut(&cat) {
                mask.push(member);
            }
        }
    }
    masks
}

/// Settings shared by every gene in a category analysis.
#[derive(Debug, Clone)]
pub struct CodingOptions {
    pub variant_type: VariantType,
    pub use_annotation_weights: bool,
    pub mac_thresh: u32,
    pub categories: CategorySelection,
    pub cauchy: CauchyOptions,
}

/// Runs every requested category of one gene.
///
/// Categories that were not requested, or have fewer than two variants, map
/// to `None`. The missense result absorbs the disruptive-missense columns.
pub fn single_gene_analysis(
    block: &GenotypeBlock,
    ctx: &NullContext,
    opts: &CodingOptions,
) -> Result<BTreeMap<Category, Option<CategoryResult>>> {
    let annotations = block.annotations()?;
    let coding_mask: Vec<bool> = annotations.iter().map(|a| is_coding(a)).collect();
    let coding = block.filter_variants(&coding_mask);
    if coding.n_variants() == 0 {
        return Err(StaarError::EmptyResult("no coding variants in the region".into()));
    }

    let annotations = coding.annotations()?;
    let masks = classify(&annotations, opts.variant_type);
    let use_annot = opts.variant_type == VariantType::Snv && opts.use_annotation_weights;
    let channel_names = AnnotationChannel::names();

    let mut vset_test = VariantSetTest::with_options(ctx, opts.cauchy);
    let mut results = BTreeMap::new();
    for (&category, mask) in &masks {
        if !opts.categories.contains(category) {
            results.insert(category, None);
            continue;
        }
        let subset = coding.filter_variants(mask);
        if subset.n_variants() <= 1 {
            log::info!("Less than 2 variants for {}, skip.", category.official_name());
            results.insert(category, None);
            continue;
        }

        let vset = prepare_block(&subset, opts.mac_thresh)?;
        let phred = if use_annot {
            Some(phred_matrix(&subset.annotations()?))
        } else {
            None
        };
        vset_test.input_vset(&vset, phred.as_ref().map(|p| p.view()))?;
        log::info!(
            "Doing analysis for {} ({} variants) ...",
            category.official_name(),
            vset_test.n_variants()
        );
        let names = use_annot.then_some(channel_names.as_slice());
        results.insert(category, Some(vset_test.do_inference(names)?));
    }

    let disruptive = results.get(&Category::DisruptiveMissense).cloned().flatten();
    if let (Some(Some(missense)), Some(disruptive)) = (results.get_mut(&Category::Missense), disruptive) {
        *missense = process_missense(missense, &disruptive, &opts.cauchy)?;
    }
    Ok(results)
}

/// Folds the disruptive-missense tests into the missense result and
/// recomputes its omnibus columns over both.
pub fn process_missense(
    missense: &CategoryResult,
    disruptive: &CategoryResult,
    opts: &CauchyOptions,
) -> Result<CategoryResult> {
    let mut table = PvalueTable::new(missense.pvalues.n_voxels());
    for (name, values) in missense.pvalues.iter().filter(|(n, _)| !n.starts_with("STAAR-")) {
        table.insert(name, values.clone())?;
    }
    for name in base_statistic_names() {
        let values = disruptive.pvalues.get(&name).ok_or_else(|| {
            StaarError::Input(format!("disruptive missense result has no column '{}'", name))
        })?;
        table.insert(format!("{}-Disruptive", name), values.clone())?;
    }
    add_omnibus(&mut table, opts)?;
    Ok(CategoryResult { n_variants: missense.n_variants, pvalues: table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cauchy::cauchy_combination;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn annot(category: &str, exonic: &str, metasvm: &str) -> FunctionalAnnotation {
        FunctionalAnnotation {
            gencode_category: category.into(),
            gencode_exonic_category: exonic.into(),
            metasvm_pred: metasvm.into(),
            ..Default::default()
        }
    }

    #[test]
    fn stopgain_membership() {
        let a = annot("exonic", "stopgain", "");
        let masks = classify(&[&a], VariantType::Snv);
        for cat in [Category::Plof, Category::PlofDs, Category::Ptv, Category::PtvDs] {
            assert!(masks[&cat][0], "{} should contain stopgain", cat);
        }
        for cat in [Category::Synonymous, Category::Missense, Category::DisruptiveMissense] {
            assert!(!masks[&cat][0], "{} should not contain stopgain", cat);
        }
    }

    #[test]
    fn ptv_depends_on_variant_type() {
        let fs = annot("exonic", "frameshift deletion", "");
        let splice = annot("splicing", "", "");
        let nc_splice = annot("ncRNA_splicing", "", "");
        let all = [&fs, &splice, &nc_splice];
        assert_eq!(classify(&all, VariantType::Snv)[&Category::Ptv], vec![false, true, false]);
        assert_eq!(classify(&all, VariantType::Indel)[&Category::Ptv], vec![true, false, false]);
        assert_eq!(classify(&all, VariantType::Variant)[&Category::Ptv], vec![true, true, false]);
        assert_eq!(classify(&all, VariantType::Variant)[&Category::Plof], vec![false, true, true]);
    }

    #[test]
    fn disruptive_missense_needs_metasvm() {
        let d = annot("exonic", "nonsynonymous SNV", "D");
        let t = annot("exonic", "nonsynonymous SNV", "T");
        let masks = classify(&[&d, &t], VariantType::Snv);
        assert_eq!(masks[&Category::Missense], vec![true, true]);
        assert_eq!(masks[&Category::DisruptiveMissense], vec![true, false]);
        assert_eq!(masks[&Category::PlofDs], vec![true, false]);
        assert_eq!(masks[&Category::PtvDs], vec![true, false]);
    }

    #[test]
    fn coding_filter() {
        assert!(is_coding(&annot("exonic", "synonymous SNV", "")));
        assert!(is_coding(&annot("ncRNA_exonic;splicing", "", "")));
        assert!(!is_coding(&annot("intronic", "", "")));
        assert!(!is_coding(&annot("exonic", "frameshift deletion", "")));
    }

    #[test]
    fn category_names_parse() {
        assert_eq!("PLOF_DS".parse::<Category>().unwrap(), Category::PlofDs);
        assert!("nonsense".parse::<Category>().is_err());
    }

    fn base_table(values: [f64; 6]) -> CategoryResult {
        let mut t = PvalueTable::new(1);
        for (name, p) in base_statistic_names().into_iter().zip(values) {
            t.insert(name, array![p]).unwrap();
        }
        add_omnibus(&mut t, &CauchyOptions::default()).unwrap();
        CategoryResult { n_variants: 5, pvalues: t }
    }

    #[test]
    fn missense_merge() {
        let m = base_table([0.2, 0.3, 0.05, 0.6, 0.01, 0.9]);
        let d = base_table([0.4, 0.001, 0.7, 0.5, 0.08, 0.3]);
        assert_eq!(m.pvalues.n_columns(), 13);

        let merged = process_missense(&m, &d, &CauchyOptions::default()).unwrap();
        assert_eq!(merged.pvalues.n_columns(), 6 + 6 + 7);
        assert_eq!(merged.n_variants, 5);
        assert_eq!(merged.pvalues.get("SKAT(1,1)-Disruptive").unwrap()[0], 0.001);

        let all12 = [0.2, 0.3, 0.05, 0.6, 0.01, 0.9, 0.4, 0.001, 0.7, 0.5, 0.08, 0.3];
        assert_relative_eq!(
            merged.pvalues.get("STAAR-O").unwrap()[0],
            cauchy_combination(&all12).unwrap(),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            merged.pvalues.get("STAAR-S(1,1)").unwrap()[0],
            cauchy_combination(&[0.3, 0.001]).unwrap(),
            max_relative = 1e-12
        );
    }
}
