//! Module for handling I/O: annotated VCF/BCF genotypes, ID lists, gene tables
//! and gzipped result tables.
use crate::annotation::{
    AnnotationChannel, FunctionalAnnotation, GENCODE_CATEGORY_FIELD, GENCODE_EXONIC_CATEGORY_FIELD,
    GENCODE_INFO_FIELD, METASVM_FIELD,
};
use crate::config::{normalize_chrom, GeneRegion};
use crate::error::{Result, StaarError};
use crate::genotype::{GenotypeBlock, GenotypeSource, VariantRecord};
use crate::table::CategoryResult;
use csv::WriterBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use rust_htslib::bcf::{self, Read};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Which FORMAT field the dosages are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeField {
    /// Hard calls, alternate allele count
    Gt,
    /// Imputed dosage
    Ds,
}

impl std::str::FromStr for GenotypeField {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GT" => Ok(GenotypeField::Gt),
            "DS" => Ok(GenotypeField::Ds),
            _ => Err(format!("VCF field '{}' not supported. Use 'DS' or 'GT'.", s)),
        }
    }
}

/// Genotypes from an indexed, annotated VCF/BCF.
///
/// Functional annotations are read from INFO fields named like the annotation
/// catalog. A reader is opened per query, so regions can be fetched from
/// several threads at once.
pub struct VcfGenotypeSource {
    path: PathBuf,
    field: GenotypeField,
    subject_ids: Vec<String>,
    /// VCF sample column of every subject
    sample_idx: Vec<usize>,
    vcf_samples: Vec<String>,
}

impl VcfGenotypeSource {
    pub fn open(path: &Path, field: GenotypeField) -> Result<Self> {
        let reader = bcf::IndexedReader::from_path(path)?;
        let vcf_samples: Vec<String> = reader
            .header()
            .samples()
            .iter()
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect();
        log::info!("{:?}: {} samples in the genotype data", path, vcf_samples.len());
        Ok(Self {
            path: path.to_path_buf(),
            field,
            subject_ids: vcf_samples.clone(),
            sample_idx: (0..vcf_samples.len()).collect(),
            vcf_samples,
        })
    }

    /// All samples in the file, in column order.
    pub fn vcf_samples(&self) -> &[String] {
        &self.vcf_samples
    }

    /// Restricts and reorders the returned subjects.
    pub fn with_subjects(mut self, ids: &[String]) -> Result<Self> {
        let position: HashMap<&str, usize> = self
            .vcf_samples
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let sample_idx = ids
            .iter()
            .map(|id| {
                position
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| StaarError::Input(format!("subject '{}' is not in the genotype data", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.sample_idx = sample_idx;
        self.subject_ids = ids.to_vec();
        Ok(self)
    }

    fn read_dosages(&self, record: &bcf::Record, out: &mut [f64]) -> Result<()> {
        match self.field {
            GenotypeField::Ds => {
                let ds = record.format(b"DS").float()?;
                for (slot, &i) in out.iter_mut().zip(&self.sample_idx) {
                    *slot = ds.get(i).and_then(|v| v.first()).map_or(f64::NAN, |&x| x as f64);
                }
            }
            GenotypeField::Gt => {
                let gts = record.genotypes()?;
                for (slot, &i) in out.iter_mut().zip(&self.sample_idx) {
                    let gt = gts.get(i);
                    let mut count = 0.0;
                    for allele in gt.iter() {
                        match allele.index() {
                            Some(0) => {}
                            Some(_) => count += 1.0,
                            None => {
                                count = f64::NAN;
                                break;
                            }
                        }
                    }
                    *slot = count;
                }
            }
        }
        Ok(())
    }
}

fn info_string(record: &bcf::Record, tag: &str) -> String {
    match record.info(tag.as_bytes()).string() {
        Ok(Some(values)) => values
            .first()
            .map(|v| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn info_float(record: &bcf::Record, tag: &str) -> f64 {
    match record.info(tag.as_bytes()).float() {
        Ok(Some(values)) => values.first().map_or(f64::NAN, |&x| x as f64),
        _ => f64::NAN,
    }
}

fn read_annotation(record: &bcf::Record) -> Option<FunctionalAnnotation> {
    let mut annot = FunctionalAnnotation {
        gencode_category: info_string(record, GENCODE_CATEGORY_FIELD),
        gencode_exonic_category: info_string(record, GENCODE_EXONIC_CATEGORY_FIELD),
        gencode_info: info_string(record, GENCODE_INFO_FIELD),
        metasvm_pred: info_string(record, METASVM_FIELD),
        phred: [f64::NAN; 12],
    };
    for channel in AnnotationChannel::ALL.iter().filter(|c| !c.is_derived()) {
        annot.set_phred(*channel, info_float(record, channel.field()));
    }
    let has_any = !annot.gencode_category.is_empty()
        || !annot.gencode_exonic_category.is_empty()
        || annot.phred.iter().any(|x| x.is_finite());
    has_any.then_some(annot)
}

impl GenotypeSource for VcfGenotypeSource {
    fn subject_ids(&self) -> &[String] {
        &self.subject_ids
    }

    fn fetch_region(&self, chrom: &str, start: u64, end: u64) -> Result<GenotypeBlock> {
        let mut reader = bcf::IndexedReader::from_path(&self.path)?;
        let header = reader.header().clone();
        let bare = normalize_chrom(chrom);
        let rid = match header
            .name2rid(bare.as_bytes())
            .or_else(|_| header.name2rid(format!("chr{}", bare).as_bytes()))
        {
            Ok(rid) => rid,
            Err(_) => {
                log::warn!("Chromosome {} is not in {:?}", chrom, self.path);
                return GenotypeBlock::new(self.subject_ids.clone(), Vec::new(), Array2::zeros((self.subject_ids.len(), 0)));
            }
        };
        reader.fetch(rid, start.saturating_sub(1), Some(end.saturating_sub(1)))?;

        let n = self.subject_ids.len();
        let mut variants = Vec::new();
        let mut columns: Vec<f64> = Vec::new();
        let mut dosage = vec![0.0; n];
        for record_result in reader.records() {
            let record = record_result?;
            let pos = record.pos() as u64 + 1;
            if pos < start || pos > end {
                continue;
            }
            let alleles: Vec<String> = record
                .alleles()
                .iter()
                .map(|a| String::from_utf8_lossy(a).to_string())
                .collect();
            if alleles.len() != 2 {
                log::debug!("Skipping non-biallelic site at {}:{}", chrom, pos);
                continue;
            }
            self.read_dosages(&record, &mut dosage)?;
            columns.extend_from_slice(&dosage);

            let id = String::from_utf8_lossy(&record.id()).to_string();
            let id = if id == "." {
                format!("{}:{}:{}:{}", bare, pos, alleles[0], alleles[1])
            } else {
                id
            };
            variants.push(VariantRecord {
                chrom: bare.clone(),
                pos,
                id,
                ref_allele: alleles[0].clone(),
                alt_allele: alleles[1].clone(),
                filter_pass: record.has_filter("PASS".as_bytes()) || record.has_filter(".".as_bytes()),
                annotation: read_annotation(&record),
            });
        }

        let n_variants = variants.len();
        // columns holds one variant after another
        let dosages = Array2::from_shape_vec((n_variants, n), columns)
            .map_err(|e| StaarError::Input(format!("genotype buffer: {}", e)))?
            .reversed_axes()
            .as_standard_layout()
            .to_owned();
        log::debug!("Fetched {} variants from {}:{}-{}", n_variants, chrom, start, end);
        GenotypeBlock::new(self.subject_ids.clone(), variants, dosages)
    }
}

/// Reads a subject list (`--keep`). With two or more columns the second (IID)
/// is used, as in PLINK files.
pub fn read_keep(path: &Path) -> Result<Vec<String>> {
    read_column(path, |record| record.get(1).or_else(|| record.get(0)))
}

/// Reads a variant ID list (`--extract`), one ID in the first column.
pub fn read_extract(path: &Path) -> Result<Vec<String>> {
    read_column(path, |record| record.get(0))
}

fn read_column<F>(path: &Path, pick: F) -> Result<Vec<String>>
where
    F: Fn(&csv::StringRecord) -> Option<&str>,
{
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut ids = Vec::new();
    for result in rdr.records() {
        let record = result?;
        // tolerate space-separated files
        let fields: csv::StringRecord = record.iter().flat_map(|f| f.split_whitespace()).collect();
        if let Some(id) = pick(&fields) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

#[derive(Debug, serde::Deserialize)]
struct GeneRow {
    gene: String,
    chr: String,
    start: u64,
    end: u64,
}

/// Reads a tab-delimited gene table with columns `gene`, `chr`, `start`, `end`.
pub fn read_gene_list(path: &Path) -> Result<Vec<(String, GeneRegion)>> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut genes = Vec::new();
    for result in rdr.deserialize() {
        let row: GeneRow = result?;
        genes.push((row.gene, GeneRegion::new(normalize_chrom(&row.chr), row.start, row.end)?));
    }
    log::info!("{} genes read from {:?}", genes.len(), path);
    Ok(genes)
}

/// Metadata columns written in front of the p-values.
pub const META_COLUMNS: [&str; 6] = ["INDEX", "VARIANT_CATEGORY", "CHR", "START", "END", "N_VARIANT"];

/// A result laid out for writing: one row per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// `%.5e` layout: signed exponent of at least two digits (`1.23457e-02`).
fn format_pvalue(p: f64) -> String {
    if !p.is_finite() {
        return "NA".to_string();
    }
    let raw = format!("{:.5e}", p);
    match raw.split_once('e').map(|(m, e)| (m, e.parse::<i32>())) {
        Some((mantissa, Ok(exp))) => {
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        _ => raw,
    }
}

/// Prepends voxel index and region metadata to a category result.
///
/// `voxel_index` holds the 1-based voxel labels; `None` numbers rows 1..=N.
pub fn format_output(
    result: &CategoryResult,
    category: &str,
    region: &GeneRegion,
    voxel_index: Option<&[usize]>,
) -> OutputTable {
    let mut header: Vec<String> = META_COLUMNS.iter().map(|s| s.to_string()).collect();
    header.extend(result.pvalues.names().into_iter().map(String::from));

    let n_columns = result.pvalues.n_columns();
    let rows = (0..result.pvalues.n_voxels())
        .map(|v| {
            let index = voxel_index.and_then(|idx| idx.get(v).copied()).unwrap_or(v + 1);
            let mut row = vec![
                index.to_string(),
                category.to_string(),
                region.chrom.clone(),
                region.start.to_string(),
                region.end.to_string(),
                result.n_variants.to_string(),
            ];
            row.extend((0..n_columns).map(|c| format_pvalue(result.pvalues.value(v, c))));
            row
        })
        .collect();
    OutputTable { header, rows }
}

/// `<prefix>_chr<c>_start<s>_end<e>_<suffix>.txt.gz`
pub fn output_path(prefix: &Path, region: &GeneRegion, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("_chr{}_start{}_end{}_{}.txt.gz", region.chrom, region.start, region.end, suffix));
    PathBuf::from(name)
}

/// Writes a table as tab-delimited gzip.
pub fn write_table_gz(path: &Path, table: &OutputTable) -> Result<()> {
    let out_file = File::create(path)?;
    let out_writer_gz = GzEncoder::new(out_file, Compression::default());
    let mut csv_writer = WriterBuilder::new().delimiter(b'\t').from_writer(out_writer_gz);
    csv_writer.write_record(&table.header)?;
    for row in &table.rows {
        csv_writer.write_record(row)?;
    }
    let gz = csv_writer
        .into_inner()
        .map_err(|e| StaarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    gz.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::PvalueTable;
    use flate2::read::GzDecoder;
    use ndarray::array;
    use std::io::{Read as _, Write as _};

    fn result() -> CategoryResult {
        let mut t = PvalueTable::new(2);
        t.insert("SKAT(1,25)", array![0.012345678, f64::NAN]).unwrap();
        t.insert("STAAR-O", array![1.0, 2.5e-10]).unwrap();
        CategoryResult { n_variants: 7, pvalues: t }
    }

    #[test]
    fn output_layout() {
        let region = GeneRegion::new("2", 100, 200).unwrap();
        let out = format_output(&result(), "plof", &region, None);
        assert_eq!(
            out.header,
            vec!["INDEX", "VARIANT_CATEGORY", "CHR", "START", "END", "N_VARIANT", "SKAT(1,25)", "STAAR-O"]
        );
        assert_eq!(out.rows[0], vec!["1", "plof", "2", "100", "200", "7", "1.23457e-02", "1.00000e+00"]);
        assert_eq!(out.rows[1][6], "NA");
        assert_eq!(out.rows[1][7], "2.50000e-10");
        assert_eq!(format_pvalue(f64::MIN_POSITIVE), "2.22507e-308");
        assert_eq!(format_pvalue(0.5), "5.00000e-01");

        let relabelled = format_output(&result(), "plof", &region, Some(&[5, 9]));
        assert_eq!(relabelled.rows[1][0], "9");
    }

    #[test]
    fn file_naming() {
        let region = GeneRegion::new("2", 100, 200).unwrap();
        let path = output_path(Path::new("/tmp/out/gene"), &region, "missense");
        assert_eq!(path, PathBuf::from("/tmp/out/gene_chr2_start100_end200_missense.txt.gz"));
    }

    #[test]
    fn gz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("res.txt.gz");
        let region = GeneRegion::new("2", 100, 200).unwrap();
        write_table_gz(&path, &format_output(&result(), "window", &region, None)).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap()).read_to_string(&mut text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("INDEX\tVARIANT_CATEGORY"));
        assert!(lines[2].contains("\tNA\t"));
    }

    #[test]
    fn id_lists() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.txt");
        let mut f = File::create(&keep).unwrap();
        writeln!(f, "fam1\tid1\nfam2 id2\nid3").unwrap();
        assert_eq!(read_keep(&keep).unwrap(), vec!["id1", "id2", "id3"]);
        assert_eq!(read_extract(&keep).unwrap(), vec!["fam1", "fam2", "id3"]);
    }

    #[test]
    fn gene_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "gene\tchr\tstart\tend\nBRCA2\tchr13\t100\t500\nTP53\t17\t7\t9").unwrap();
        let genes = read_gene_list(&path).unwrap();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[0].0, "BRCA2");
        assert_eq!(genes[0].1, GeneRegion::new("13", 100, 500).unwrap());
    }

    #[test]
    fn genotype_field_parsing() {
        assert_eq!("ds".parse::<GenotypeField>().unwrap(), GenotypeField::Ds);
        assert!("AD".parse::<GenotypeField>().is_err());
    }
}
