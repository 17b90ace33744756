//! Functional annotation catalog (FAVOR field names) and PHRED channel handling.
use ndarray::Array2;

pub const GENCODE_CATEGORY_FIELD: &str = "genecode_comprehensive_category";
pub const GENCODE_EXONIC_CATEGORY_FIELD: &str = "genecode_comprehensive_exonic_category";
pub const GENCODE_INFO_FIELD: &str = "genecode_comprehensive_info";
pub const METASVM_FIELD: &str = "metasvm_pred";

/// PHRED-scaled annotation channels used as STAAR weights, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnotationChannel {
    Cadd,
    Linsight,
    FathmmXf,
    EpigeneticActive,
    EpigeneticRepressed,
    EpigeneticTranscription,
    Conservation,
    LocalDiversity,
    /// Derived from `LocalDiversity`, never read from the source
    LocalDiversityNeg,
    Mappability,
    TranscriptionFactor,
    Protein,
}

impl AnnotationChannel {
    pub const ALL: [AnnotationChannel; 12] = [
        AnnotationChannel::Cadd,
        AnnotationChannel::Linsight,
        AnnotationChannel::FathmmXf,
        AnnotationChannel::EpigeneticActive,
        AnnotationChannel::EpigeneticRepressed,
        AnnotationChannel::EpigeneticTranscription,
        AnnotationChannel::Conservation,
        AnnotationChannel::LocalDiversity,
        AnnotationChannel::LocalDiversityNeg,
        AnnotationChannel::Mappability,
        AnnotationChannel::TranscriptionFactor,
        AnnotationChannel::Protein,
    ];

    /// Display name, used as the column suffix in result tables.
    pub fn name(&self) -> &'static str {
        match self {
            AnnotationChannel::Cadd => "CADD",
            AnnotationChannel::Linsight => "LINSIGHT",
            AnnotationChannel::FathmmXf => "FATHMM.XF",
            AnnotationChannel::EpigeneticActive => "aPC.EpigeneticActive",
            AnnotationChannel::EpigeneticRepressed => "aPC.EpigeneticRepressed",
            AnnotationChannel::EpigeneticTranscription => "aPC.EpigeneticTranscription",
            AnnotationChannel::Conservation => "aPC.Conservation",
            AnnotationChannel::LocalDiversity => "aPC.LocalDiversity",
            AnnotationChannel::LocalDiversityNeg => "aPC.LocalDiversity(-)",
            AnnotationChannel::Mappability => "aPC.Mappability",
            AnnotationChannel::TranscriptionFactor => "aPC.TF",
            AnnotationChannel::Protein => "aPC.Protein",
        }
    }

    /// Field name in the annotation source.
    pub fn field(&self) -> &'static str {
        match self {
            AnnotationChannel::Cadd => "cadd_phred",
            AnnotationChannel::Linsight => "linsight",
            AnnotationChannel::FathmmXf => "fathmm_xf",
            AnnotationChannel::EpigeneticActive => "apc_epigenetics_active",
            AnnotationChannel::EpigeneticRepressed => "apc_epigenetics_repressed",
            AnnotationChannel::EpigeneticTranscription => "apc_epigenetics_transcription",
            AnnotationChannel::Conservation => "apc_conservation",
            AnnotationChannel::LocalDiversity => "apc_local_nucleotide_diversity",
            AnnotationChannel::LocalDiversityNeg => "apc_local_nucleotide_diversity2",
            AnnotationChannel::Mappability => "apc_mappability",
            AnnotationChannel::TranscriptionFactor => "apc_transcription_factor",
            AnnotationChannel::Protein => "apc_protein_function",
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, AnnotationChannel::LocalDiversityNeg)
    }

    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|c| c.name().to_string()).collect()
    }
}

/// Per-variant annotation fields needed for category assignment and weighting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionalAnnotation {
    pub gencode_category: String,
    pub gencode_exonic_category: String,
    pub gencode_info: String,
    pub metasvm_pred: String,
    /// Raw channel values indexed like `AnnotationChannel::ALL`; NaN when missing
    pub phred: [f64; 12],
}

impl FunctionalAnnotation {
    pub fn phred(&self, channel: AnnotationChannel) -> f64 {
        self.phred[channel as usize]
    }

    pub fn set_phred(&mut self, channel: AnnotationChannel, value: f64) {
        self.phred[channel as usize] = value;
    }
}

/// Builds the `[n_variants x 12]` PHRED matrix.
///
/// Missing scores count as 0, and the reversed local-diversity channel is
/// computed as `-10 * log10(1 - 10^(-x / 10))`.
pub fn phred_matrix(annotations: &[&FunctionalAnnotation]) -> Array2<f64> {
    let n_channels = AnnotationChannel::ALL.len();
    let mut out = Array2::zeros((annotations.len(), n_channels));
    for (i, annot) in annotations.iter().enumerate() {
        for (k, channel) in AnnotationChannel::ALL.iter().enumerate() {
            let value = if channel.is_derived() {
                reversed_phred(annot.phred(AnnotationChannel::LocalDiversity))
            } else {
                annot.phred(*channel)
            };
            out[[i, k]] = if value.is_finite() { value } else { 0.0 };
        }
    }
    out
}

fn reversed_phred(x: f64) -> f64 {
    -10.0 * (1.0 - 10f64.powf(-x / 10.0)).log10()
}

/// Maps PHRED scores to the `[0, 1)` annotation rank `1 - 10^(-phred / 10)`.
pub fn phred_to_rank(phred: f64) -> f64 {
    if phred.is_finite() {
        (1.0 - 10f64.powf(-phred / 10.0)).max(0.0)
    } else {
        0.0
    }
}
