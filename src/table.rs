//! Ordered p-value tables: one named column per statistic, one row per voxel.
use crate::error::{Result, StaarError};
use ndarray::{Array1, Array2};

#[derive(Debug, Clone, PartialEq)]
pub struct PvalueTable {
    n_voxels: usize,
    columns: Vec<(String, Array1<f64>)>,
}

impl PvalueTable {
    pub fn new(n_voxels: usize) -> Self {
        Self { n_voxels, columns: Vec::new() }
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Appends a column, or overwrites it in place when the name exists.
    pub fn insert(&mut self, name: impl Into<String>, values: Array1<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.n_voxels {
            return Err(StaarError::Input(format!(
                "column '{}' has {} values for {} voxels",
                name,
                values.len(),
                self.n_voxels
            )));
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = values,
            None => self.columns.push((name, values)),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Array1<f64>> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array1<f64>)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Stacks the columns whose name starts with any of `prefixes` into a
    /// `[n_matching x n_voxels]` matrix.
    pub fn rows_with_prefix(&self, prefixes: &[&str]) -> Array2<f64> {
        let selected: Vec<&Array1<f64>> = self
            .columns
            .iter()
            .filter(|(n, _)| prefixes.iter().any(|p| n.starts_with(p)))
            .map(|(_, v)| v)
            .collect();
        let mut out = Array2::from_elem((selected.len(), self.n_voxels), f64::NAN);
        for (i, col) in selected.iter().enumerate() {
            out.row_mut(i).assign(col);
        }
        out
    }

    /// p-value at `(voxel, column)`, NaN when the column does not exist.
    pub fn value(&self, voxel: usize, column: usize) -> f64 {
        self.columns.get(column).map_or(f64::NAN, |(_, v)| v[voxel])
    }
}

/// Result of one (region, category) analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub n_variants: usize,
    pub pvalues: PvalueTable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn insert_keeps_order_and_replaces() {
        let mut t = PvalueTable::new(2);
        t.insert("SKAT(1,25)", array![0.1, 0.2]).unwrap();
        t.insert("Burden(1,25)", array![0.3, 0.4]).unwrap();
        t.insert("SKAT(1,25)", array![0.5, 0.6]).unwrap();
        assert_eq!(t.names(), vec!["SKAT(1,25)", "Burden(1,25)"]);
        assert_eq!(t.get("SKAT(1,25)").unwrap(), &array![0.5, 0.6]);
        assert!(t.insert("bad", array![0.1]).is_err());
    }

    #[test]
    fn prefix_selection() {
        let mut t = PvalueTable::new(1);
        t.insert("SKAT(1,25)", array![0.1]).unwrap();
        t.insert("SKAT(1,25)-CADD", array![0.2]).unwrap();
        t.insert("SKAT(1,1)", array![0.3]).unwrap();
        let m = t.rows_with_prefix(&["SKAT(1,25)"]);
        assert_eq!(m, array![[0.1], [0.2]]);
    }
}
