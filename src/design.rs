//! Per-SNP design matrix for the intensity regression.
//!
//! Column 0 is the intercept, columns `1..=k` are reserved for the sample's own
//! intensity terms (filled in per sample by the corrector), and any further
//! columns hold GC-model covariates.

use crate::config::RegressionModel;
use crate::error::{RenormError, Result};
use log::{info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct DesignMatrix {
    matrix: Array2<f64>,
    mask: Array1<bool>,
    rmodel: RegressionModel,
}

impl DesignMatrix {
    /// No covariates: the regression only uses the intercept and intensity terms.
    pub fn intercept_only(snp_count: usize, rmodel: RegressionModel) -> Self {
        Self {
            matrix: Array2::ones((snp_count, 1 + rmodel.extra_terms())),
            mask: Array1::from_elem(snp_count, true),
            rmodel,
        }
    }

    /// Builds a design from an `s x m` covariate table. Rows with `mask == false`
    /// are excluded from fitting and yield no corrected intensity.
    pub fn with_covariates(
        covariates: ArrayView2<f64>,
        mask: Array1<bool>,
        rmodel: RegressionModel,
    ) -> Result<Self> {
        let snp_count = covariates.nrows();
        if mask.len() != snp_count {
            return Err(RenormError::invalid_data(format!(
                "Covariate mask has {} entries for {} SNPs",
                mask.len(),
                snp_count
            )));
        }
        let reserved = 1 + rmodel.extra_terms();
        let mut matrix = Array2::ones((snp_count, reserved + covariates.ncols()));
        matrix.slice_mut(s![.., reserved..]).assign(&covariates);
        Ok(Self {
            matrix,
            mask,
            rmodel,
        })
    }

    pub fn snp_count(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn columns(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn rmodel(&self) -> RegressionModel {
        self.rmodel
    }

    pub fn covariate_columns(&self) -> usize {
        self.columns() - 1 - self.rmodel.extra_terms()
    }

    pub fn matrix(&self) -> ArrayView2<f64> {
        self.matrix.view()
    }

    pub fn mask(&self) -> ArrayView1<bool> {
        self.mask.view()
    }

    /// Copy of the design with the intensity columns set from one sample's channels.
    pub fn for_sample(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Array2<f64> {
        let mut design = self.matrix.clone();
        match self.rmodel {
            RegressionModel::Linear => {
                design.column_mut(1).assign(&x);
                design.column_mut(2).assign(&y);
            }
            RegressionModel::Quadratic => {
                design.column_mut(1).assign(&x);
                design.column_mut(2).assign(&x.mapv(|v| v * v));
                design.column_mut(3).assign(&y);
                design.column_mut(4).assign(&y.mapv(|v| v * v));
            }
        }
        design
    }

    /// Reads a GC model: whitespace-separated covariates, one row per SNP.
    /// `NA`, `nan` and `.` mark undefined covariates; `#` lines are skipped.
    pub fn load_gcm(path: &Path, snp_count: usize, rmodel: RegressionModel) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            RenormError::invalid_data(format!("Failed to open GC model '{}': {}", path.display(), e))
        })?;
        let reader = BufReader::new(file);

        let mut values: Vec<f64> = Vec::with_capacity(snp_count * 2);
        let mut mask: Vec<bool> = Vec::with_capacity(snp_count);
        let mut width: Option<usize> = None;

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            match width {
                None => width = Some(fields.len()),
                Some(w) if w != fields.len() => {
                    return Err(RenormError::invalid_data(format!(
                        "GC model line {}: expected {} covariates, found {}",
                        line_num + 1,
                        w,
                        fields.len()
                    )));
                }
                Some(_) => {}
            }

            let mut defined = true;
            for field in fields {
                if matches!(field, "NA" | "nan" | "NaN" | ".") {
                    defined = false;
                    values.push(0.0);
                    continue;
                }
                let value = field.parse::<f64>().map_err(|e| {
                    RenormError::invalid_data(format!(
                        "GC model line {}: cannot parse '{}': {}",
                        line_num + 1,
                        field,
                        e
                    ))
                })?;
                if !value.is_finite() {
                    defined = false;
                    values.push(0.0);
                } else {
                    values.push(value);
                }
            }
            mask.push(defined);
        }

        if mask.len() != snp_count {
            return Err(RenormError::invalid_data(format!(
                "GC model '{}' has {} rows but the store has {} SNPs",
                path.display(),
                mask.len(),
                snp_count
            )));
        }
        let width = width.unwrap_or(0);
        let covariates = Array2::from_shape_vec((snp_count, width), values)
            .map_err(|e| RenormError::invalid_data(format!("GC model shape error: {}", e)))?;

        let defined = mask.iter().filter(|&&m| m).count();
        info!(
            "Loaded GC model {}: {} covariates, {} / {} SNPs defined.",
            path.display(),
            width,
            defined,
            snp_count
        );
        Self::with_covariates(covariates.view(), Array1::from_vec(mask), rmodel)
    }
}

/// Where covariates come from.
#[derive(Clone, Debug, Default)]
pub enum DesignSource {
    /// No GC correction.
    #[default]
    None,
    /// An explicit model file; failing to read it is fatal.
    File(PathBuf),
    /// A directory of `<manifest>.gcm` models keyed by the store's manifest name.
    Directory(PathBuf),
}

impl DesignSource {
    pub fn from_options(gcmodel: Option<PathBuf>, gcmodeldir: Option<PathBuf>) -> Self {
        match (gcmodel, gcmodeldir) {
            (Some(file), _) => DesignSource::File(file),
            (None, Some(dir)) => DesignSource::Directory(dir),
            (None, None) => DesignSource::None,
        }
    }

    /// Loads the design for a store, falling back to intercept-only when no model applies.
    pub fn resolve(
        &self,
        manifest: Option<&str>,
        snp_count: usize,
        rmodel: RegressionModel,
    ) -> Result<DesignMatrix> {
        match self {
            DesignSource::None => Ok(DesignMatrix::intercept_only(snp_count, rmodel)),
            DesignSource::File(path) => DesignMatrix::load_gcm(path, snp_count, rmodel),
            DesignSource::Directory(dir) => {
                let stem = manifest.and_then(|m| Path::new(m).file_stem()).map(|s| s.to_string_lossy().into_owned());
                let Some(stem) = stem else {
                    warn!("Store has no ManifestName attribute; GC correction disabled.");
                    return Ok(DesignMatrix::intercept_only(snp_count, rmodel));
                };
                let path = dir.join(format!("{}.gcm", stem));
                if !path.is_file() {
                    warn!(
                        "No GC model for manifest '{}' at {}; GC correction disabled.",
                        stem,
                        path.display()
                    );
                    return Ok(DesignMatrix::intercept_only(snp_count, rmodel));
                }
                info!("Loading GC/CpG model for {}...", stem);
                DesignMatrix::load_gcm(&path, snp_count, rmodel)
            }
        }
    }
}
