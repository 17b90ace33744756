//! Variant-set test engine: Burden, SKAT and ACAT-V under every MAF weighting
//! and annotation channel, folded into STAAR-S/B/A and STAAR-O by the Cauchy
//! combination.
//!
//! The phenotype side is the LDR model: voxel residuals are never formed. For
//! a variant set `G` with covariate-adjusted kernel `Phi` and half score
//! `H = G' resid_ldr`, the score of variant `j` at voxel `v` is
//! `S_jv = (H bases')_jv`, and every quadratic form in the scores reduces to an
//! `r x r` matrix sandwiched by the rows of `bases`.
use crate::annotation::phred_to_rank;
use crate::cauchy::{cauchy_combination_columns, cauchy_combination_weighted, CauchyOptions};
use crate::error::{Result, StaarError};
use crate::null_model::NullContext;
use crate::stats::{beta_weights, chisq1_sf, floor_pvalue, floor_underflow, mixture_chisq_pvalue, to_dmatrix};
use crate::table::{CategoryResult, PvalueTable};
use crate::vset::VariantSet;
use nalgebra::SymmetricEigen;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Beta(a, b) MAF weightings, in output order.
pub const WEIGHT_GRID: [(f64, f64); 2] = [(1.0, 25.0), (1.0, 1.0)];

/// Variants with a covariate-adjusted variance below this are dropped.
const MIN_KERNEL_DIAG: f64 = 1e-8;

/// Individual statistic classes and the omnibus name each one folds into.
const STATISTICS: [(&str, &str); 3] = [("SKAT", "STAAR-S"), ("Burden", "STAAR-B"), ("ACAT-V", "STAAR-A")];

/// `"(1,25)"` for the Beta(1, 25) weighting.
pub fn weight_label(a: f64, b: f64) -> String {
    format!("({},{})", a, b)
}

/// Names of the six individual statistics before any channel suffix.
pub fn base_statistic_names() -> Vec<String> {
    STATISTICS
        .iter()
        .flat_map(|(stat, _)| WEIGHT_GRID.iter().map(move |&(a, b)| format!("{}{}", stat, weight_label(a, b))))
        .collect()
}

/// Adds STAAR-S/B/A per weighting and STAAR-O to a table of individual tests.
///
/// Existing omnibus columns are recomputed in place.
pub fn add_omnibus(table: &mut PvalueTable, opts: &CauchyOptions) -> Result<()> {
    for (stat, omnibus) in STATISTICS.iter() {
        for &(a, b) in WEIGHT_GRID.iter() {
            let label = weight_label(a, b);
            let prefix = format!("{}{}", stat, label);
            let name = format!("{}{}", omnibus, label);
            let mut combined = cauchy_combination_columns(table.rows_with_prefix(&[&prefix]).view(), opts);
            floor_underflow(&mut combined, &name);
            table.insert(name, combined)?;
        }
    }
    let names = base_statistic_names();
    let prefixes: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let mut overall = cauchy_combination_columns(table.rows_with_prefix(&prefixes).view(), opts);
    floor_underflow(&mut overall, "STAAR-O");
    table.insert("STAAR-O", overall)?;
    Ok(())
}

/// Quantities of the bound variant set that every statistic reuses.
#[derive(Debug, Clone)]
struct BoundSet {
    maf: Array1<f64>,
    is_rare: Vec<bool>,
    /// Annotation ranks, variants x channels
    annot_rank: Option<Array2<f64>>,
    /// `G'G - G'X (X'X)^-1 X'G`
    kernel: Array2<f64>,
    /// `G' resid_ldr`, variants x LDRs
    half_score: Array2<f64>,
}

/// Per-variant weights of one (weighting, channel) combination.
struct Weights {
    burden: Array1<f64>,
    skat: Array1<f64>,
    acat: Array1<f64>,
}

/// The test engine. Holds a shared null context and at most one bound variant set.
pub struct VariantSetTest<'a> {
    ctx: &'a NullContext,
    cauchy: CauchyOptions,
    bound: Option<BoundSet>,
}

impl<'a> VariantSetTest<'a> {
    pub fn new(ctx: &'a NullContext) -> Self {
        Self::with_options(ctx, CauchyOptions::default())
    }

    pub fn with_options(ctx: &'a NullContext, cauchy: CauchyOptions) -> Self {
        Self { ctx, cauchy, bound: None }
    }

    /// Number of variants in the bound set (0 when nothing is bound).
    pub fn n_variants(&self) -> usize {
        self.bound.as_ref().map_or(0, |b| b.maf.len())
    }

    /// Binds a variant set, replacing any previous one.
    ///
    /// `phred` holds raw PHRED scores, variants x channels.
    pub fn input_vset(&mut self, vset: &VariantSet, phred: Option<ArrayView2<f64>>) -> Result<()> {
        self.bound = None;
        let g = &vset.dosage;
        if g.nrows() != self.ctx.n_subjects() {
            return Err(StaarError::Input(format!(
                "variant set has {} subjects but the null model has {}",
                g.nrows(),
                self.ctx.n_subjects()
            )));
        }
        if vset.maf.len() != g.ncols() || vset.is_rare.len() != g.ncols() {
            return Err(StaarError::Input("MAF and rarity flags do not match the genotypes".into()));
        }
        if let Some(ph) = &phred {
            if ph.nrows() != g.ncols() {
                return Err(StaarError::Input(format!(
                    "{} annotation rows for {} variants",
                    ph.nrows(),
                    g.ncols()
                )));
            }
        }

        let xtg = self.ctx.covar.t().dot(g);
        let kernel = g.t().dot(g) - xtg.t().dot(&self.ctx.xtx_inv).dot(&xtg);
        let keep: Vec<usize> = (0..g.ncols()).filter(|&j| kernel[[j, j]] > MIN_KERNEL_DIAG).collect();
        if keep.is_empty() {
            return Err(StaarError::EmptyResult(
                "every variant has zero variance after adjusting for covariates".into(),
            ));
        }
        if keep.len() < g.ncols() {
            log::warn!(
                "Dropped {} variant(s) with zero variance after adjusting for covariates",
                g.ncols() - keep.len()
            );
        }

        let half_score = g.t().dot(&self.ctx.resid_ldr);
        self.bound = Some(BoundSet {
            maf: vset.maf.select(Axis(0), &keep),
            is_rare: keep.iter().map(|&j| vset.is_rare[j]).collect(),
            annot_rank: phred.map(|ph| ph.select(Axis(0), &keep).mapv(phred_to_rank)),
            kernel: kernel.select(Axis(0), &keep).select(Axis(1), &keep),
            half_score: half_score.select(Axis(0), &keep),
        });
        Ok(())
    }

    /// Runs every test on the bound set.
    ///
    /// Channel columns are produced when annotations were bound; their names
    /// come from `annotation_names`.
    pub fn do_inference(&self, annotation_names: Option<&[String]>) -> Result<CategoryResult> {
        let bound = self
            .bound
            .as_ref()
            .ok_or_else(|| StaarError::Input("no variant set has been bound".into()))?;
        let channels: Vec<(Option<usize>, String)> = match (&bound.annot_rank, annotation_names) {
            (Some(rank), Some(names)) => {
                if names.len() != rank.ncols() {
                    return Err(StaarError::Input(format!(
                        "{} annotation names for {} annotation channels",
                        names.len(),
                        rank.ncols()
                    )));
                }
                std::iter::once((None, String::new()))
                    .chain(names.iter().enumerate().map(|(k, n)| (Some(k), format!("-{}", n))))
                    .collect()
            }
            (None, Some(_)) => {
                return Err(StaarError::Input("annotation names given without annotation scores".into()))
            }
            (Some(_), None) => {
                return Err(StaarError::Input("annotation scores bound without channel names".into()))
            }
            (None, None) => vec![(None, String::new())],
        };

        let n_voxels = self.ctx.n_voxels();
        let mut skat = Vec::new();
        let mut burden = Vec::new();
        let mut acat = Vec::new();
        let mafs = bound.maf.to_vec();
        let half_null = beta_weights(&mafs, 0.5, 0.5);

        for &(a, b) in WEIGHT_GRID.iter() {
            let label = weight_label(a, b);
            let maf_w = Array1::from(beta_weights(&mafs, a, b));
            for (channel, suffix) in &channels {
                let annot = match (channel, &bound.annot_rank) {
                    (Some(k), Some(rank)) => rank.column(*k).to_owned(),
                    _ => Array1::ones(maf_w.len()),
                };
                let weights = Weights {
                    burden: &annot * &maf_w,
                    skat: annot.mapv(f64::sqrt) * &maf_w,
                    acat: Array1::from_shape_fn(maf_w.len(), |j| annot[j] * (maf_w[j] / half_null[j]).powi(2)),
                };

                let name = format!("{}{}", label, suffix);
                skat.push((format!("SKAT{}", name), self.skat(bound, &weights.skat, &name)));
                burden.push((format!("Burden{}", name), self.burden(bound, &weights.burden, None)));
                acat.push((format!("ACAT-V{}", name), self.acat_v(bound, &weights)));
            }
        }

        let mut table = PvalueTable::new(n_voxels);
        for (name, mut pvalues) in skat.into_iter().chain(burden).chain(acat) {
            floor_underflow(&mut pvalues, &name);
            table.insert(name, pvalues)?;
        }
        add_omnibus(&mut table, &self.cauchy)?;

        Ok(CategoryResult { n_variants: bound.maf.len(), pvalues: table })
    }

    /// Burden test over `subset` (all variants when `None`).
    fn burden(&self, bound: &BoundSet, weights: &Array1<f64>, subset: Option<&[usize]>) -> Array1<f64> {
        let (half_score, kernel, w) = match subset {
            Some(idx) => (
                bound.half_score.select(Axis(0), idx),
                bound.kernel.select(Axis(0), idx).select(Axis(1), idx),
                weights.select(Axis(0), idx),
            ),
            None => (bound.half_score.clone(), bound.kernel.clone(), weights.clone()),
        };
        let variance = w.dot(&kernel.dot(&w));
        if !(variance > 0.0) {
            log::warn!("Burden statistic has zero variance; reporting NA");
            return Array1::from_elem(self.ctx.n_voxels(), f64::NAN);
        }
        let score = self.ctx.bases.dot(&half_score.t().dot(&w));
        Array1::from_shape_fn(score.len(), |v| {
            chisq1_sf(score[v].powi(2) / (self.ctx.voxel_var[v] * variance))
        })
    }

    fn skat(&self, bound: &BoundSet, weights: &Array1<f64>, name: &str) -> Array1<f64> {
        let n_voxels = self.ctx.n_voxels();
        let lambdas = match skat_eigenvalues(&bound.kernel, weights) {
            Some(l) => l,
            None => {
                log::warn!("SKAT{}: weighted kernel has no usable eigenvalues; reporting NA", name);
                return Array1::from_elem(n_voxels, f64::NAN);
            }
        };

        // Q_v = b_v' (H_w' H_w) b_v / sigma2_v
        let weighted = &bound.half_score * &weights.view().insert_axis(Axis(1));
        let inner = weighted.t().dot(&weighted);
        let q = (self.ctx.bases.dot(&inner) * &self.ctx.bases).sum_axis(Axis(1));
        Array1::from_shape_fn(n_voxels, |v| {
            let var = self.ctx.voxel_var[v];
            if var > 0.0 {
                mixture_chisq_pvalue(q[v] / var, &lambdas)
            } else {
                f64::NAN
            }
        })
    }

    /// Common variants enter individually; rare ones as a single burden term
    /// weighted by their mean ACAT-V weight.
    fn acat_v(&self, bound: &BoundSet, weights: &Weights) -> Array1<f64> {
        let n_voxels = self.ctx.n_voxels();
        let common: Vec<usize> = (0..bound.is_rare.len()).filter(|&j| !bound.is_rare[j]).collect();
        let rare: Vec<usize> = (0..bound.is_rare.len()).filter(|&j| bound.is_rare[j]).collect();

        let mut term_weights: Vec<f64> = common.iter().map(|&j| weights.acat[j]).collect();
        let mut term_pvalues: Vec<Array1<f64>> = Vec::with_capacity(common.len() + 1);

        if !common.is_empty() {
            let scores = bound.half_score.select(Axis(0), &common).dot(&self.ctx.bases.t());
            for (row, &j) in common.iter().enumerate() {
                let var_j = bound.kernel[[j, j]];
                term_pvalues.push(Array1::from_shape_fn(n_voxels, |v| {
                    floor_pvalue(chisq1_sf(scores[[row, v]].powi(2) / (self.ctx.voxel_var[v] * var_j)))
                }));
            }
        }
        if !rare.is_empty() {
            let rare_weight = rare.iter().map(|&j| weights.acat[j]).sum::<f64>() / rare.len() as f64;
            term_weights.push(rare_weight);
            term_pvalues.push(self.burden(bound, &weights.burden, Some(&rare)).mapv(floor_pvalue));
        }

        let mut column = vec![0.0; term_pvalues.len()];
        Array1::from_shape_fn(n_voxels, |v| {
            for (slot, p) in column.iter_mut().zip(&term_pvalues) {
                *slot = p[v];
            }
            cauchy_combination_weighted(&column, Some(&term_weights), &self.cauchy).unwrap_or(f64::NAN)
        })
    }
}

/// Eigenvalues of `W Phi W` above `mean / 1e5`, or `None` when the
/// decomposition fails or nothing is left.
fn skat_eigenvalues(kernel: &Array2<f64>, weights: &Array1<f64>) -> Option<Vec<f64>> {
    let w = weights.view();
    let wkw = kernel * &w.insert_axis(Axis(1)) * &w.insert_axis(Axis(0));
    let eig = SymmetricEigen::try_new(to_dmatrix(wkw.view()), 1e-12, 10_000)?;
    let all: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    let mean = all.iter().sum::<f64>() / all.len() as f64;
    if !(mean > 0.0) {
        return None;
    }
    let kept: Vec<f64> = all.into_iter().filter(|&l| l > mean / 1e5).collect();
    (!kept.is_empty()).then_some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cauchy::cauchy_combination;
    use crate::null_model::LdrNullModel;
    use crate::vset::prepare_vset;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    /// Centred noise with an optional effect of the first variant on voxel 0.
    fn simulate(n: usize, m: usize, effect: f64, seed: u64) -> (NullContext, VariantSet) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut raw = Array2::from_shape_fn((n, m), |_| if rng.gen::<f64>() < 0.05 { 1.0 } else { 0.0 });
        for j in 0..m {
            raw[[j, j]] = 1.0;
        }
        let mut resid = Array2::from_shape_fn((n, 2), |_| rng.gen::<f64>() - 0.5);
        for i in 0..n {
            resid[[i, 0]] += effect * raw[[i, 0]];
        }
        let mean = resid.mean_axis(Axis(0)).unwrap();
        resid -= &mean;
        let model = LdrNullModel::new(Array2::ones((n, 1)), resid, array![[1.0, 0.0], [0.0, 1.0]], ids(n)).unwrap();
        let vset = prepare_vset(raw.view(), None, 10).unwrap();
        (NullContext::new(&model).unwrap(), vset)
    }

    #[test]
    fn column_layout() {
        let (ctx, vset) = simulate(200, 4, 0.0, 1);
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        let result = test.do_inference(None).unwrap();
        assert_eq!(result.n_variants, 4);
        assert_eq!(
            result.pvalues.names(),
            vec![
                "SKAT(1,25)",
                "SKAT(1,1)",
                "Burden(1,25)",
                "Burden(1,1)",
                "ACAT-V(1,25)",
                "ACAT-V(1,1)",
                "STAAR-S(1,25)",
                "STAAR-S(1,1)",
                "STAAR-B(1,25)",
                "STAAR-B(1,1)",
                "STAAR-A(1,25)",
                "STAAR-A(1,1)",
                "STAAR-O"
            ]
        );
        for (_, col) in result.pvalues.iter() {
            assert!(col.iter().all(|&p| p > 0.0 && p <= 1.0));
        }
    }

    #[test]
    fn annotation_channels_add_columns() {
        let (ctx, vset) = simulate(200, 3, 0.0, 2);
        let phred = array![[10.0, 0.0], [20.0, 5.0], [30.0, 1.0]];
        let names = vec!["CADD".to_string(), "LINSIGHT".to_string()];
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, Some(phred.view())).unwrap();
        let result = test.do_inference(Some(&names)).unwrap();
        assert_eq!(result.pvalues.n_columns(), 3 * 2 * 3 + 7);
        assert!(result.pvalues.get("SKAT(1,25)-CADD").is_some());
        assert!(result.pvalues.get("ACAT-V(1,1)-LINSIGHT").is_some());
        assert!(test.do_inference(None).is_err());
    }

    #[test]
    fn staar_o_combines_the_individual_tests() {
        let (ctx, vset) = simulate(300, 2, 1.0, 3);
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        let table = test.do_inference(None).unwrap().pvalues;
        let names = base_statistic_names();
        for v in 0..2 {
            let individual: Vec<f64> = names.iter().map(|n| table.get(n).unwrap()[v]).collect();
            let min_p = individual.iter().cloned().fold(1.0, f64::min);
            let staar_o = table.get("STAAR-O").unwrap()[v];
            assert!(staar_o > 0.0 && staar_o < 1.0);
            assert_relative_eq!(staar_o, cauchy_combination(&individual).unwrap(), max_relative = 1e-10);
            if v == 0 {
                assert!(min_p < 1e-3);
                assert!(staar_o <= (individual.len() as f64 * min_p).min(1.0));
            }
        }
    }

    #[test]
    fn monomorphic_variants_are_dropped() {
        let (ctx, vset) = simulate(100, 3, 0.0, 4);
        let mut vset = vset;
        vset.dosage.column_mut(1).fill(0.0);
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        assert_eq!(test.n_variants(), 2);

        vset.dosage.fill(0.0);
        let err = test.input_vset(&vset, None).unwrap_err();
        assert!(matches!(err, StaarError::EmptyResult(_)));
        assert_eq!(test.n_variants(), 0);
    }

    #[test]
    fn inference_requires_a_bound_set() {
        let (ctx, _) = simulate(50, 2, 0.0, 5);
        let test = VariantSetTest::new(&ctx);
        assert!(test.do_inference(None).is_err());
    }

    #[test]
    fn acat_v_of_only_rare_variants_is_their_burden() {
        let (ctx, mut vset) = simulate(200, 4, 0.0, 7);
        vset.is_rare = vec![true; 4];
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        let table = test.do_inference(None).unwrap().pvalues;
        for &(a, b) in WEIGHT_GRID.iter() {
            let label = weight_label(a, b);
            let acat = table.get(&format!("ACAT-V{}", label)).unwrap();
            let burden = table.get(&format!("Burden{}", label)).unwrap();
            for v in 0..2 {
                assert_relative_eq!(acat[v], burden[v], max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn acat_v_combines_common_scores_with_rare_burden() {
        let (ctx, mut vset) = simulate(300, 4, 0.0, 8);
        vset.is_rare = vec![false, false, true, true];
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        let table = test.do_inference(None).unwrap().pvalues;

        // intercept-only covariates: the kernel is the centred Gram matrix
        let g = &vset.dosage;
        let centred = g - &g.mean_axis(Axis(0)).unwrap();
        let phi = centred.t().dot(&centred);
        let mafs = vset.maf.to_vec();
        let half_null = beta_weights(&mafs, 0.5, 0.5);

        for &(a, b) in WEIGHT_GRID.iter() {
            let w = beta_weights(&mafs, a, b);
            let w_acat: Vec<f64> = (0..4).map(|j| (w[j] / half_null[j]).powi(2)).collect();
            let acat = table.get(&format!("ACAT-V{}", weight_label(a, b))).unwrap();
            for v in 0..2 {
                // identity bases: voxel v is LDR v
                let resid = ctx.resid_ldr.column(v);
                let sigma2 = ctx.voxel_var[v];
                let score: Vec<f64> = (0..4).map(|j| g.column(j).dot(&resid)).collect();
                let p0 = chisq1_sf(score[0].powi(2) / (phi[[0, 0]] * sigma2));
                let p1 = chisq1_sf(score[1].powi(2) / (phi[[1, 1]] * sigma2));
                let rare_score = w[2] * score[2] + w[3] * score[3];
                let rare_var = w[2] * w[2] * phi[[2, 2]] + 2.0 * w[2] * w[3] * phi[[2, 3]] + w[3] * w[3] * phi[[3, 3]];
                let p_rare = chisq1_sf(rare_score.powi(2) / (rare_var * sigma2));
                let expected = cauchy_combination_weighted(
                    &[p0, p1, p_rare],
                    Some(&[w_acat[0], w_acat[1], (w_acat[2] + w_acat[3]) / 2.0]),
                    &CauchyOptions::default(),
                )
                .unwrap();
                assert_relative_eq!(acat[v], expected, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn omnibus_columns_never_underflow_to_zero() {
        let mut table = PvalueTable::new(1);
        // six statistics under twelve channels and the base weighting
        for name in base_statistic_names() {
            table.insert(name.clone(), array![f64::MIN_POSITIVE]).unwrap();
            for k in 0..12 {
                table.insert(format!("{}-channel{}", name, k), array![f64::MIN_POSITIVE]).unwrap();
            }
        }
        add_omnibus(&mut table, &CauchyOptions::default()).unwrap();
        for name in ["STAAR-S(1,25)", "STAAR-B(1,1)", "STAAR-A(1,25)", "STAAR-O"] {
            assert!(table.get(name).unwrap()[0] > 0.0, "{} is zero", name);
        }
    }

    #[test]
    fn single_variant_burden_matches_score_test() {
        let (ctx, vset) = simulate(200, 1, 0.0, 6);
        let mut test = VariantSetTest::new(&ctx);
        test.input_vset(&vset, None).unwrap();
        let table = test.do_inference(None).unwrap().pvalues;
        // with one variant the weights cancel and all three tests coincide
        let burden = table.get("Burden(1,25)").unwrap();
        let skat = table.get("SKAT(1,1)").unwrap();
        for v in 0..2 {
            assert_relative_eq!(burden[v], skat[v], max_relative = 1e-6);
        }
    }
}
