//! Coding-variant analysis
//!
//! Loads the LDR null model and an annotated VCF/BCF, classifies the coding
//! variants of one gene (or of every gene in a table) into functional
//! categories, and writes STAAR p-values for every voxel and category.

use clap::Parser;
use staar_ldr::{
    config::{parse_categories, parse_range, AnalysisConfig, GeneRegion},
    io::{
        format_output, output_path, read_extract, read_gene_list, read_keep, write_table_gz, GenotypeField,
        VcfGenotypeSource,
    },
    null_model::{LdrNullModel, NullContext},
    region::{align_subjects, GeneResult, Study},
    VariantType,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "staar-coding",
    version,
    about = "Rare coding-variant set tests (STAAR) against LDR-projected imaging phenotypes"
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

    /// Gene region, <CHR>:<POS1>,<CHR>:<POS2>
    #[arg(long, conflicts_with = "gene_list")]
    range: Option<String>,

    /// Tab-delimited gene table with columns gene, chr, start, end
    #[arg(long)]
    gene_list: Option<PathBuf>,

    /// Output prefix
    #[arg(long, required = true)]
    out: PathBuf,

    /// One of 'variant', 'snv', 'indel'
    #[arg(long, default_value = "snv")]
    variant_type: String,

    /// Comma-separated categories, or 'all'
    #[arg(long)]
    variant_category: Option<String>,

    #[arg(long, default_value_t = 0.0)]
    maf_min: f64,

    #[arg(long, default_value_t = 0.01)]
    maf_max: f64,

    /// Minor allele count at or below which a variant is very rare
    #[arg(long, default_value_t = 10)]
    mac_thresh: u32,

    /// Weight SNV tests by functional annotations
    #[arg(long, default_value_t = false)]
    use_annotation_weights: bool,

    /// Number of top LDRs to use
    #[arg(long)]
    n_ldrs: Option<usize>,

    /// One-based voxel indices to analyse (comma-separated)
    #[arg(long, value_delimiter = ',')]
    voxel: Option<Vec<usize>>,

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

fn write_gene(out: &Path, region: &GeneRegion, result: &GeneResult, voxels: Option<&[usize]>) -> Result<usize, Box<dyn std::error::Error>> {
    let mut n_written = 0;
    for (category, cate_result) in result {
        if let Some(cate_result) = cate_result {
            let path = output_path(out, region, category.name());
            write_table_gz(&path, &format_output(cate_result, category.name(), region, voxels))?;
            log::info!("Saved results for {} to {:?}", category.official_name(), path);
            n_written += 1;
        }
    }
    Ok(n_written)
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
        use_annotation_weights: cli.use_annotation_weights,
        categories: parse_categories(cli.variant_category.as_deref())?,
        n_ldrs: cli.n_ldrs,
    };
    config.validate()?;
    config.log_parameters();

    let genes: Vec<(String, GeneRegion)> = match (&cli.range, &cli.gene_list) {
        (Some(range), _) => {
            let region = parse_range(range)?;
            vec![(region.to_string(), region)]
        }
        (None, Some(path)) => read_gene_list(path)?,
        (None, None) => return Err("either --range or --gene-list is required".into()),
    };

    // ===================================================================
    // 1. Null model
    // ===================================================================
    let mut model = LdrNullModel::load(&cli.null_model)?;
    let voxels: Option<Vec<usize>> = match &cli.voxel {
        Some(v) if v.iter().any(|&i| i == 0) => return Err("--voxel index (one-based) out of range".into()),
        Some(v) => {
            model = model.select_voxels(&v.iter().map(|i| i - 1).collect::<Vec<_>>())?;
            log::info!("{} voxels included.", v.len());
            Some(v.clone())
        }
        None => None,
    };
    if let Some(n_ldrs) = config.n_ldrs {
        model = model.keep_ldrs(n_ldrs)?;
        log::info!("Keep the top {} LDRs and bases.", n_ldrs);
    }

    // ===================================================================
    // 2. Genotypes and subject alignment
    // ===================================================================
    let keep = cli.keep.as_deref().map(read_keep).transpose()?;
    if let Some(k) = &keep {
        log::info!("{} subjects in --keep.", k.len());
    }
    let source = VcfGenotypeSource::open(&cli.geno, cli.geno_field.parse::<GenotypeField>()?)?;
    let (model, common) = align_subjects(&model, keep.as_deref(), source.vcf_samples())?;
    let source = source.with_subjects(&common)?;
    let ctx = NullContext::new(&model)?;

    let mut study = Study::new(&ctx, &source, config)?;
    if let Some(path) = &cli.extract {
        study = study.with_extract(read_extract(path)?);
    }
    study.qc.log_parameters();

    // ===================================================================
    // 3. Analysis
    // ===================================================================
    let mut n_files = 0;
    if genes.len() == 1 {
        let (_, region) = &genes[0];
        let result = study.analyze_gene(region)?;
        n_files += write_gene(&cli.out, region, &result, voxels.as_deref())?;
    } else {
        for (name, region, result) in study.analyze_genes(&genes) {
            log::debug!("Writing results for {}", name);
            n_files += write_gene(&cli.out, &region, &result, voxels.as_deref())?;
        }
    }

    if n_files == 0 {
        log::warn!("No requested category had at least 2 variants; nothing was written.");
    }
    log::info!("Analysis completed, {} result file(s) written.", n_files);
    Ok(())
}
