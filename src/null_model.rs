//! Module for the LDR null model and the quantities every set test reuses.
use crate::error::{Result, StaarError};
use crate::stats::{from_dmatrix, to_dmatrix};
use ndarray::{s, Array1, Array2, Axis};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Represents a null model fitted upstream.
/// This struct is serialized to disk with bincode and read by the analysis binaries.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct LdrNullModel {
    /// Covariates including the intercept (n x p)
    pub covar: Array2<f64>,
    /// LDR residuals after regressing out the covariates (n x r)
    pub resid_ldr: Array2<f64>,
    /// Functional bases mapping LDRs back to voxels (N x r)
    pub bases: Array2<f64>,
    /// Subject IDs, in row order of `covar` and `resid_ldr`
    pub ids: Vec<String>,
}

impl LdrNullModel {
    pub fn new(covar: Array2<f64>, resid_ldr: Array2<f64>, bases: Array2<f64>, ids: Vec<String>) -> Result<Self> {
        let model = Self { covar, resid_ldr, bases, ids };
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading null model from {:?}", path);
        let file = File::open(path)?;
        let model: LdrNullModel = bincode::deserialize_from(BufReader::new(file))?;
        model.validate()?;
        log::info!(
            "Null model: {} subjects, {} LDRs, {} voxels, {} covariates",
            model.n_subjects(),
            model.n_ldrs(),
            model.n_voxels(),
            model.covar.ncols()
        );
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let n = self.ids.len();
        if self.covar.nrows() != n || self.resid_ldr.nrows() != n {
            return Err(StaarError::Input(format!(
                "null model has {} IDs but covar has {} rows and resid_ldr has {} rows",
                n,
                self.covar.nrows(),
                self.resid_ldr.nrows()
            )));
        }
        if self.bases.ncols() != self.resid_ldr.ncols() {
            return Err(StaarError::Input(format!(
                "bases have {} columns but there are {} LDRs",
                self.bases.ncols(),
                self.resid_ldr.ncols()
            )));
        }
        Ok(())
    }

    pub fn n_subjects(&self) -> usize {
        self.ids.len()
    }

    pub fn n_ldrs(&self) -> usize {
        self.resid_ldr.ncols()
    }

    pub fn n_voxels(&self) -> usize {
        self.bases.nrows()
    }

    /// Keeps the top `n_ldrs` LDRs and their bases.
    pub fn keep_ldrs(mut self, n_ldrs: usize) -> Result<Self> {
        if n_ldrs == 0 {
            return Err(StaarError::Input("the number of LDRs should be greater than 0".into()));
        }
        if self.bases.ncols() < n_ldrs {
            return Err(StaarError::Input("the number of bases is less than --n-ldrs".into()));
        }
        if self.resid_ldr.ncols() < n_ldrs {
            return Err(StaarError::Input("LDR residuals are less than --n-ldrs".into()));
        }
        self.bases = self.bases.slice(s![.., ..n_ldrs]).to_owned();
        self.resid_ldr = self.resid_ldr.slice(s![.., ..n_ldrs]).to_owned();
        Ok(self)
    }

    /// Keeps a subset of voxels (0-based).
    pub fn select_voxels(mut self, voxels: &[usize]) -> Result<Self> {
        if let Some(&bad) = voxels.iter().find(|&&v| v >= self.n_voxels()) {
            return Err(StaarError::Input(format!(
                "voxel index {} out of range ({} voxels)",
                bad + 1,
                self.n_voxels()
            )));
        }
        self.bases = self.bases.select(Axis(0), voxels);
        Ok(self)
    }

    /// Reorders subjects so that row `i` matches `target_ids[i]`.
    pub fn align_to(&self, target_ids: &[String]) -> Result<Self> {
        let keep: HashSet<&str> = target_ids.iter().map(|s| s.as_str()).collect();
        let subset: Vec<usize> = (0..self.ids.len())
            .filter(|&i| keep.contains(self.ids[i].as_str()))
            .collect();
        let subset_ids: Vec<String> = subset.iter().map(|&i| self.ids[i].clone()).collect();
        let order = extract_align_subjects(&subset_ids, target_ids)?;
        let rows: Vec<usize> = order.iter().map(|&i| subset[i]).collect();

        Ok(Self {
            covar: self.covar.select(Axis(0), &rows),
            resid_ldr: self.resid_ldr.select(Axis(0), &rows),
            bases: self.bases.clone(),
            ids: target_ids.to_vec(),
        })
    }
}

/// IDs present in the null model, the keep list and the genotype data,
/// in null-model order.
pub fn get_common_ids(ids: &[String], keep: Option<&[String]>, geno_ids: Option<&[String]>) -> Vec<String> {
    let keep: Option<HashSet<&str>> = keep.map(|k| k.iter().map(|s| s.as_str()).collect());
    let geno: Option<HashSet<&str>> = geno_ids.map(|g| g.iter().map(|s| s.as_str()).collect());
    ids.iter()
        .filter(|id| keep.as_ref().map_or(true, |k| k.contains(id.as_str())))
        .filter(|id| geno.as_ref().map_or(true, |g| g.contains(id.as_str())))
        .cloned()
        .collect()
}

/// Index such that `current[index[i]] == target[i]`.
///
/// Both sides must contain the same subjects, in any order.
pub fn extract_align_subjects(current: &[String], target: &[String]) -> Result<Vec<usize>> {
    let position: HashMap<&str, usize> = current
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let target_set: HashSet<&str> = target.iter().map(|s| s.as_str()).collect();
    if position.len() != target_set.len() || target.len() != current.len() {
        return Err(StaarError::Input(
            "subjects in LDRs and covariates must be included in genetic data. \
             Use --keep when fitting the null model"
                .into(),
        ));
    }
    target
        .iter()
        .map(|id| {
            position.get(id.as_str()).copied().ok_or_else(|| {
                StaarError::Input(format!("subject '{}' is missing from the null model", id))
            })
        })
        .collect()
}

/// Drops linearly dependent covariate columns (|R_jj| <= 1e-10 in a QR).
pub fn remove_dependent_columns(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let (n, p) = matrix.dim();
    if n < p {
        return Err(StaarError::NumericalDegeneracy(format!(
            "{} covariates for only {} subjects",
            p, n
        )));
    }
    let r = to_dmatrix(matrix.view()).qr().r();
    let independent: Vec<usize> = (0..p).filter(|&j| r[(j, j)].abs() > 1e-10).collect();
    if independent.len() < p {
        log::info!(
            "Removed {} linearly dependent covariate column(s)",
            p - independent.len()
        );
        Ok(matrix.select(Axis(1), &independent))
    } else {
        Ok(matrix.clone())
    }
}

/// Null-side quantities shared by every variant set tested against one model.
///
/// Immutable once built, so analyses of different regions can share it.
#[derive(Debug, Clone)]
pub struct NullContext {
    pub(crate) covar: Array2<f64>,
    pub(crate) resid_ldr: Array2<f64>,
    pub(crate) bases: Array2<f64>,
    /// (X'X)^-1
    pub(crate) xtx_inv: Array2<f64>,
    /// Residual variance of every voxel
    pub(crate) voxel_var: Array1<f64>,
}

impl NullContext {
    pub fn new(model: &LdrNullModel) -> Result<Self> {
        let covar = remove_dependent_columns(&model.covar)?;
        let (n, p) = covar.dim();
        if n <= p {
            return Err(StaarError::NumericalDegeneracy(format!(
                "no residual degrees of freedom: {} subjects, {} covariates",
                n, p
            )));
        }

        let xtx = to_dmatrix(covar.t().dot(&covar).view());
        let xtx_inv = xtx
            .cholesky()
            .map(|c| c.inverse())
            .ok_or_else(|| StaarError::NumericalDegeneracy("X'X is not positive definite".into()))?;

        let inner_ldr = model.resid_ldr.t().dot(&model.resid_ldr);
        let voxel_var = (model.bases.dot(&inner_ldr) * &model.bases).sum_axis(Axis(1)) / (n - p) as f64;
        let n_bad = voxel_var.iter().filter(|&&v| !(v > 0.0)).count();
        if n_bad > 0 {
            log::warn!("{} voxel(s) have zero residual variance; their p-values are undefined", n_bad);
        }

        log::debug!("Null context: {} subjects, {} covariates, {} voxels", n, p, model.n_voxels());
        Ok(Self {
            covar,
            resid_ldr: model.resid_ldr.clone(),
            bases: model.bases.clone(),
            xtx_inv: from_dmatrix(&xtx_inv),
            voxel_var,
        })
    }

    pub fn n_subjects(&self) -> usize {
        self.covar.nrows()
    }

    pub fn n_covariates(&self) -> usize {
        self.covar.ncols()
    }

    pub fn n_voxels(&self) -> usize {
        self.bases.nrows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependent_columns_are_removed() {
        let x = array![[1.0, 1.0, 2.0], [1.0, 2.0, 4.0], [1.0, 3.0, 6.0], [1.0, 5.0, 10.0]];
        let reduced = remove_dependent_columns(&x).unwrap();
        assert_eq!(reduced.ncols(), 2);
        assert_eq!(reduced.column(1).to_vec(), vec![1.0, 2.0, 3.0, 5.0]);
    }

    #[test]
    fn alignment_index_reorders_current_to_target() {
        let current = ids(&["a", "b", "c"]);
        let target = ids(&["c", "a", "b"]);
        let idx = extract_align_subjects(&current, &target).unwrap();
        assert_eq!(idx, vec![2, 0, 1]);
        assert!(extract_align_subjects(&current, &ids(&["a", "b"])).is_err());
    }

    #[test]
    fn common_ids_keep_model_order() {
        let model = ids(&["a", "b", "c", "d"]);
        let keep = ids(&["d", "b", "a"]);
        let geno = ids(&["b", "d", "e"]);
        assert_eq!(get_common_ids(&model, Some(&keep), Some(&geno)), ids(&["b", "d"]));
        assert_eq!(get_common_ids(&model, None, None), model);
    }

    #[test]
    fn ldr_and_voxel_subsetting() {
        let model = LdrNullModel::new(
            Array2::ones((3, 1)),
            array![[1.0, 0.5], [-1.0, 0.0], [0.0, -0.5]],
            array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
            ids(&["a", "b", "c"]),
        )
        .unwrap();
        assert!(model.clone().keep_ldrs(3).is_err());
        let kept = model.clone().keep_ldrs(1).unwrap();
        assert_eq!(kept.n_ldrs(), 1);
        assert_eq!(kept.bases.ncols(), 1);
        assert!(model.clone().select_voxels(&[3]).is_err());
        assert_eq!(model.select_voxels(&[2, 0]).unwrap().bases, array![[1.0, 1.0], [1.0, 0.0]]);
    }

    #[test]
    fn model_rows_follow_genotype_order() {
        let model = LdrNullModel::new(
            array![[1.0, 0.1], [1.0, 0.2], [1.0, 0.3]],
            array![[1.0], [2.0], [3.0]],
            array![[1.0]],
            ids(&["a", "b", "c"]),
        )
        .unwrap();
        let aligned = model.align_to(&ids(&["c", "a"])).unwrap();
        assert_eq!(aligned.resid_ldr.column(0).to_vec(), vec![3.0, 1.0]);
        assert_eq!(aligned.covar.column(1).to_vec(), vec![0.3, 0.1]);
    }

    #[test]
    fn voxel_variance_from_ldrs() {
        // one LDR with residual sum of squares 2, voxel = 2 * LDR
        let model = LdrNullModel::new(
            Array2::ones((3, 1)),
            array![[1.0], [-1.0], [0.0]],
            array![[1.0], [2.0]],
            ids(&["a", "b", "c"]),
        )
        .unwrap();
        let ctx = NullContext::new(&model).unwrap();
        assert_relative_eq!(ctx.voxel_var[0], 2.0 / 2.0, epsilon = 1e-12);
        assert_relative_eq!(ctx.voxel_var[1], 8.0 / 2.0, epsilon = 1e-12);
        assert_relative_eq!(ctx.xtx_inv[[0, 0]], 1.0 / 3.0, epsilon = 1e-12);
    }
}
