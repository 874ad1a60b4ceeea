//! Sample-major intensity stores.
//!
//! A GDAT directory holds `attrs.json` plus one file per column. Each column
//! file is `sample_count` rows of `snp_count` little-endian values, so a row
//! is one sample and can be read without touching any other sample.

use crate::error::{RenormError, Result};
use crate::genotype::{decode_row, Genotype};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const ATTRS_FILE: &str = "attrs.json";
pub const X_COLUMN: &str = "X";
pub const Y_COLUMN: &str = "Y";
pub const QUALITY_COLUMN: &str = "GC";
pub const GENOTYPE_COLUMN: &str = "Genotype";
pub const MANIFEST_ATTR: &str = "ManifestName";

/// One sample's raw data, materialized for the duration of one pass step.
#[derive(Clone, Debug)]
pub struct SampleRecord {
    pub index: usize,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub genotypes: Vec<Genotype>,
    pub quality: Option<Array1<f64>>,
}

pub type SampleIter<'a> = Box<dyn Iterator<Item = Result<SampleRecord>> + Send + 'a>;

/// Read side of the intensity store: counts, attributes and a sequential sample stream.
pub trait IntensityStore: Sync {
    fn sample_count(&self) -> usize;
    fn snp_count(&self) -> usize;
    fn attribute(&self, key: &str) -> Option<String>;
    fn has_quality(&self) -> bool;

    /// Streams samples in index order. Quality scores are read only when requested.
    fn samples(&self, with_quality: bool) -> Result<SampleIter<'_>>;

    fn manifest_name(&self) -> Option<String> {
        self.attribute(MANIFEST_ATTR)
    }
}

pub fn column_path(root: &Path, name: &str, extension: &str) -> PathBuf {
    root.join(format!("{}.{}", name, extension))
}

fn read_attrs(root: &Path) -> Result<Map<String, Value>> {
    let path = root.join(ATTRS_FILE);
    let text = fs::read_to_string(&path).map_err(|e| {
        RenormError::invalid_data(format!("Cannot read store attributes {}: {}", path.display(), e))
    })?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(RenormError::invalid_data(format!(
            "{} must contain a JSON object",
            path.display()
        ))),
    }
}

fn write_attrs(root: &Path, attrs: &Map<String, Value>) -> Result<()> {
    let path = root.join(ATTRS_FILE);
    let tmp = root.join(format!("{}.tmp", ATTRS_FILE));
    fs::write(&tmp, serde_json::to_string_pretty(attrs)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Records a finished output column under `"columns"` in the store attributes.
pub fn register_column(root: &Path, name: &str) -> Result<()> {
    let mut attrs = read_attrs(root)?;
    let columns = attrs
        .entry("columns".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = columns {
        if !list.iter().any(|v| v.as_str() == Some(name)) {
            list.push(Value::String(name.to_string()));
        }
    }
    write_attrs(root, &attrs)
}

/// Drops `name` from the store's `"columns"` list, if present.
pub fn unregister_column(root: &Path, name: &str) -> Result<()> {
    let mut attrs = read_attrs(root)?;
    if let Some(Value::Array(list)) = attrs.get_mut("columns") {
        list.retain(|v| v.as_str() != Some(name));
    }
    write_attrs(root, &attrs)
}

fn count_attr(attrs: &Map<String, Value>, key: &str) -> Result<usize> {
    attrs
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| RenormError::invalid_data(format!("Store attribute '{}' is missing or not a count", key)))
}

/// Directory-backed store.
#[derive(Debug)]
pub struct GdatStore {
    root: PathBuf,
    attrs: Map<String, Value>,
    sample_count: usize,
    snp_count: usize,
    has_quality: bool,
}

impl GdatStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let attrs = read_attrs(&root)?;
        let sample_count = count_attr(&attrs, "sample_count")?;
        let snp_count = count_attr(&attrs, "snp_count")?;

        let expected = |width: usize| (sample_count * snp_count * width) as u64;
        for (name, ext, width) in [(X_COLUMN, "f32", 4), (Y_COLUMN, "f32", 4), (GENOTYPE_COLUMN, "u8", 1)] {
            check_column_len(&column_path(&root, name, ext), expected(width))?;
        }
        let quality_path = column_path(&root, QUALITY_COLUMN, "f32");
        let has_quality = quality_path.is_file();
        if has_quality {
            check_column_len(&quality_path, expected(4))?;
        }

        info!(
            "Opened store {}: SNPs={}, samples={}, quality scores {}.",
            root.display(),
            snp_count,
            sample_count,
            if has_quality { "present" } else { "absent" }
        );
        Ok(Self {
            root,
            attrs,
            sample_count,
            snp_count,
            has_quality,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open_column(&self, name: &str, ext: &str, width: usize) -> Result<RowReader> {
        RowReader::open(&column_path(&self.root, name, ext), self.snp_count * width)
    }
}

fn check_column_len(path: &Path, expected: u64) -> Result<()> {
    let actual = fs::metadata(path)
        .map_err(|e| RenormError::invalid_data(format!("Missing column file {}: {}", path.display(), e)))?
        .len();
    if actual != expected {
        return Err(RenormError::invalid_data(format!(
            "Column file {} has {} bytes, expected {}",
            path.display(),
            actual,
            expected
        )));
    }
    Ok(())
}

impl IntensityStore for GdatStore {
    fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn snp_count(&self) -> usize {
        self.snp_count
    }

    fn attribute(&self, key: &str) -> Option<String> {
        self.attrs.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn has_quality(&self) -> bool {
        self.has_quality
    }

    fn samples(&self, with_quality: bool) -> Result<SampleIter<'_>> {
        let quality = if with_quality && self.has_quality {
            Some(self.open_column(QUALITY_COLUMN, "f32", 4)?)
        } else {
            None
        };
        Ok(Box::new(GdatSamples {
            x: self.open_column(X_COLUMN, "f32", 4)?,
            y: self.open_column(Y_COLUMN, "f32", 4)?,
            genotypes: self.open_column(GENOTYPE_COLUMN, "u8", 1)?,
            quality,
            next: 0,
            sample_count: self.sample_count,
        }))
    }
}

/// Sequential reader of fixed-width rows.
struct RowReader {
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl RowReader {
    fn open(path: &Path, row_bytes: usize) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            buf: vec![0u8; row_bytes],
        })
    }

    fn read_row(&mut self) -> Result<&[u8]> {
        self.reader.read_exact(&mut self.buf)?;
        Ok(&self.buf)
    }

    fn read_f32_row(&mut self) -> Result<Array1<f64>> {
        let bytes = self.read_row()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect())
    }
}

struct GdatSamples {
    x: RowReader,
    y: RowReader,
    genotypes: RowReader,
    quality: Option<RowReader>,
    next: usize,
    sample_count: usize,
}

impl GdatSamples {
    fn read_sample(&mut self) -> Result<SampleRecord> {
        let index = self.next;
        let x = self.x.read_f32_row()?;
        let y = self.y.read_f32_row()?;
        let genotypes = decode_row(self.genotypes.read_row()?)
            .map_err(|e| RenormError::invalid_data(format!("Sample {}: {}", index, e)))?;
        let quality = match self.quality.as_mut() {
            Some(reader) => Some(reader.read_f32_row()?),
            None => None,
        };
        Ok(SampleRecord {
            index,
            x,
            y,
            genotypes,
            quality,
        })
    }
}

impl Iterator for GdatSamples {
    type Item = Result<SampleRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.sample_count {
            return None;
        }
        let record = self.read_sample();
        self.next += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.sample_count - self.next;
        (remaining, Some(remaining))
    }
}

/// Writes a new GDAT directory one sample at a time.
pub struct StoreBuilder {
    root: PathBuf,
    snp_count: usize,
    samples: usize,
    manifest: Option<String>,
    x: BufWriter<File>,
    y: BufWriter<File>,
    genotypes: BufWriter<File>,
    quality: Option<BufWriter<File>>,
}

impl StoreBuilder {
    pub fn create(root: impl AsRef<Path>, snp_count: usize, with_quality: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let open = |name: &str, ext: &str| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(column_path(&root, name, ext))?))
        };
        let quality = if with_quality {
            Some(open(QUALITY_COLUMN, "f32")?)
        } else {
            None
        };
        Ok(Self {
            x: open(X_COLUMN, "f32")?,
            y: open(Y_COLUMN, "f32")?,
            genotypes: open(GENOTYPE_COLUMN, "u8")?,
            quality,
            root,
            snp_count,
            samples: 0,
            manifest: None,
        })
    }

    pub fn manifest(mut self, name: impl Into<String>) -> Self {
        self.manifest = Some(name.into());
        self
    }

    pub fn push_sample(
        &mut self,
        x: ArrayView1<f64>,
        y: ArrayView1<f64>,
        genotypes: &[Genotype],
        quality: Option<ArrayView1<f64>>,
    ) -> Result<()> {
        let s = self.snp_count;
        if x.len() != s || y.len() != s || genotypes.len() != s {
            return Err(RenormError::invalid_data(format!(
                "Sample {} has X={}, Y={}, genotypes={} values for {} SNPs",
                self.samples,
                x.len(),
                y.len(),
                genotypes.len(),
                s
            )));
        }
        write_f32_row(&mut self.x, x)?;
        write_f32_row(&mut self.y, y)?;
        let codes: Vec<u8> = genotypes.iter().map(|g| g.code()).collect();
        self.genotypes.write_all(&codes)?;
        match (self.quality.as_mut(), quality) {
            (Some(writer), Some(q)) if q.len() == s => write_f32_row(writer, q)?,
            (Some(_), _) => {
                return Err(RenormError::invalid_data(format!(
                    "Sample {} needs {} quality scores",
                    self.samples, s
                )))
            }
            (None, _) => {}
        }
        self.samples += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<GdatStore> {
        self.x.flush()?;
        self.y.flush()?;
        self.genotypes.flush()?;
        if let Some(q) = self.quality.as_mut() {
            q.flush()?;
        }
        let mut attrs = Map::new();
        attrs.insert("sample_count".into(), json!(self.samples));
        attrs.insert("snp_count".into(), json!(self.snp_count));
        if let Some(manifest) = &self.manifest {
            attrs.insert(MANIFEST_ATTR.into(), json!(manifest));
        }
        write_attrs(&self.root, &attrs)?;
        debug!("Wrote store {} with {} samples.", self.root.display(), self.samples);
        GdatStore::open(&self.root)
    }
}

fn write_f32_row(writer: &mut impl Write, row: ArrayView1<f64>) -> Result<()> {
    for &v in row.iter() {
        writer.write_all(&(v as f32).to_le_bytes())?;
    }
    Ok(())
}

/// Whole-matrix store held in memory (`samples x SNPs`).
#[derive(Clone, Debug)]
pub struct MemoryStore {
    x: Array2<f64>,
    y: Array2<f64>,
    genotypes: Vec<Vec<Genotype>>,
    quality: Option<Array2<f64>>,
    attrs: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new(
        x: Array2<f64>,
        y: Array2<f64>,
        genotypes: Vec<Vec<Genotype>>,
        quality: Option<Array2<f64>>,
    ) -> Result<Self> {
        let shape = x.dim();
        let quality_ok = quality.as_ref().map_or(true, |q| q.dim() == shape);
        if y.dim() != shape
            || genotypes.len() != shape.0
            || genotypes.iter().any(|g| g.len() != shape.1)
            || !quality_ok
        {
            return Err(RenormError::invalid_data(format!(
                "In-memory store columns do not share the {} x {} shape",
                shape.0, shape.1
            )));
        }
        Ok(Self {
            x,
            y,
            genotypes,
            quality,
            attrs: HashMap::new(),
        })
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

impl IntensityStore for MemoryStore {
    fn sample_count(&self) -> usize {
        self.x.nrows()
    }

    fn snp_count(&self) -> usize {
        self.x.ncols()
    }

    fn attribute(&self, key: &str) -> Option<String> {
        self.attrs.get(key).cloned()
    }

    fn has_quality(&self) -> bool {
        self.quality.is_some()
    }

    fn samples(&self, with_quality: bool) -> Result<SampleIter<'_>> {
        Ok(Box::new((0..self.sample_count()).map(move |i| {
            Ok(SampleRecord {
                index: i,
                x: self.x.row(i).to_owned(),
                y: self.y.row(i).to_owned(),
                genotypes: self.genotypes[i].clone(),
                quality: if with_quality {
                    self.quality.as_ref().map(|q| q.row(i).to_owned())
                } else {
                    None
                },
            })
        })))
    }
}
