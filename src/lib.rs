//! # STAAR-LDR Crate
//!
//! This library contains the core statistical logic for rare-variant set
//! association testing against imaging phenotypes that are stored as
//! low-dimensional representations (LDRs) plus a functional basis.
//! The binaries `staar-coding` and `staar-window` call functions from this library.

pub mod annotation;
pub mod cauchy;
pub mod coding;
pub mod config;
pub mod error;
pub mod genotype;
pub mod io;
pub mod null_model;
pub mod qc;
pub mod region;
pub mod staar;
pub mod stats;
pub mod table;
pub mod vset;

pub use error::{Result, StaarError};

/// Which class of variants an analysis is restricted to.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantType {
    /// SNVs and indels together
    Variant,
    Snv,
    Indel,
}

impl std::str::FromStr for VariantType {
    type Err = &'static str;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "variant" => Ok(VariantType::Variant),
            "snv" => Ok(VariantType::Snv),
            "indel" => Ok(VariantType::Indel),
            _ => Err("Unknown variant type. Use 'variant', 'snv', or 'indel'."),
        }
    }
}

impl std::fmt::Display for VariantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VariantType::Variant => "variant",
            VariantType::Snv => "snv",
            VariantType::Indel => "indel",
        };
        f.write_str(s)
    }
}
