//! Error types shared by the analysis core and its I/O collaborators.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StaarError {
    /// Malformed or missing configuration (bad variant type, empty MAF range, ...)
    #[error("Invalid input: {0}")]
    Input(String),
    /// A filtering stage left nothing to analyse
    #[error("No variants remaining: {0}")]
    EmptyResult(String),
    /// Rank-deficient covariates, eigendecomposition failure, all-NaN p-values
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("htslib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),
}

pub type Result<T> = std::result::Result<T, StaarError>;
