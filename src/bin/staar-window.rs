//! Sliding-window analysis
//!
//! Splits a region into half-overlapping windows and runs the STAAR tests on
//! the rare variants of every window. Each window is written to its own file.

use clap::Parser;
use staar_ldr::{
    config::{parse_range, AnalysisConfig},
    io::{format_output, output_path, read_extract, read_keep, write_table_gz, GenotypeField, VcfGenotypeSource},
    null_model::{LdrNullModel, NullContext},
    region::{align_subjects, Study},
    VariantType,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "staar-window",
    version,
    about = "Sliding-window rare-variant set tests (STAAR) against LDR-projected imaging phenotypes"
)]
struct Cli {
    /// Path to the indexed, annotated VCF/BCF file
    #[arg(long, required = true)]
    geno: PathBuf,

    /// FORMAT field to read genotypes from ('GT' or 'DS')
    #[arg(long, default_value = "GT")]
    geno_field: String,

    /// Path to the null model (bincode)
    #[arg(long, required = true)]
    null_model: PathBuf,

    /// Region to scan, <CHR>:<POS1>,<CHR>:<POS2>
    #[arg(long, required = true)]
    range: String,

    /// Window length in base pairs; windows step by half of it
    #[arg(long, default_value_t = 2000)]
    window_length: u64,

    /// Output prefix
    #[arg(long, required = true)]
    out: PathBuf,

    /// One of 'variant', 'snv', 'indel'
    #[arg(long, default_value = "snv")]
    variant_type: String,

    #[arg(long, default_value_t = 0.0)]
    maf_min: f64,

    #[arg(long, default_value_t = 0.01)]
    maf_max: f64,

    /// Minor allele count at or below which a variant is very rare
    #[arg(long, default_value_t = 10)]
    mac_thresh: u32,

    /// Number of top LDRs to use
    #[arg(long)]
    n_ldrs: Option<usize>,

    /// Subject list to keep
    #[arg(long)]
    keep: Option<PathBuf>,

    /// Variant ID list to extract
    #[arg(long)]
    extract: Option<PathBuf>,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()?;
    log::info!("Using {} threads", cli.threads);

    let config = AnalysisConfig {
        variant_type: cli.variant_type.parse::<VariantType>()?,
        maf_min: cli.maf_min,
        maf_max: cli.maf_max,
        mac_thresh: cli.mac_thresh,
        n_ldrs: cli.n_ldrs,
        ..Default::default()
    };
    config.validate()?;
    config.log_parameters();
    let region = parse_range(&cli.range)?;

    let mut model = LdrNullModel::load(&cli.null_model)?;
    if let Some(n_ldrs) = config.n_ldrs {
        model = model.keep_ldrs(n_ldrs)?;
        log::info!("Keep the top {} LDRs and bases.", n_ldrs);
    }

    let keep = cli.keep.as_deref().map(read_keep).transpose()?;
    let source = VcfGenotypeSource::open(&cli.geno, cli.geno_field.parse::<GenotypeField>()?)?;
    let (model, common) = align_subjects(&model, keep.as_deref(), source.vcf_samples())?;
    let source = source.with_subjects(&common)?;
    let ctx = NullContext::new(&model)?;

    let mut study = Study::new(&ctx, &source, config)?;
    if let Some(path) = &cli.extract {
        study = study.with_extract(read_extract(path)?);
    }
    study.qc.log_parameters();

    let results = study.analyze_windows(&region, cli.window_length)?;
    for (window, result) in &results {
        let path = output_path(&cli.out, window, "window");
        write_table_gz(&path, &format_output(result, "window", window, None))?;
        log::debug!("Saved {:?}", path);
    }

    log::info!("Sliding-window analysis completed, {} window(s) written.", results.len());
    Ok(())
}
