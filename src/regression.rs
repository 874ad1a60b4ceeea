//! Per-sample intensity bias correction.
//!
//! The regression target at each SNP is the pass-1 cluster center `r` matching
//! the sample's own call there. The fitted model is evaluated on every
//! design-valid SNP, so the corrected `R` covers SNPs that were never fitted.

use crate::centers::ClusterCenters;
use crate::config::RenormConfig;
use crate::design::DesignMatrix;
use crate::error::{RenormError, Result};
use crate::genotype::Genotype;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::LeastSquaresSvd;

/// How a sample's total intensity was obtained.
#[derive(Clone, Debug, PartialEq)]
pub enum Correction {
    /// Least-squares fit on `points` SNPs taken every `thin`-th usable SNP.
    Fitted {
        beta: Array1<f64>,
        points: usize,
        thin: usize,
    },
    /// Too few usable SNPs; `R = X + Y` unchanged.
    Uncorrected { usable: usize },
}

#[derive(Clone, Debug)]
pub struct CorrectedIntensity {
    pub r: Array1<f64>,
    pub correction: Correction,
}

impl CorrectedIntensity {
    pub fn is_fallback(&self) -> bool {
        matches!(self.correction, Correction::Uncorrected { .. })
    }
}

/// Fits and applies one regression per sample. Holds no per-sample state.
pub struct IntensityCorrector<'a> {
    design: &'a DesignMatrix,
    centers: &'a ClusterCenters,
    min_points: usize,
    thin: Option<usize>,
}

impl<'a> IntensityCorrector<'a> {
    pub fn new(design: &'a DesignMatrix, centers: &'a ClusterCenters, config: &RenormConfig) -> Result<Self> {
        if design.rmodel() != config.rmodel {
            return Err(RenormError::config(format!(
                "Design matrix was built for the {} model but the run uses {}",
                design.rmodel(),
                config.rmodel
            )));
        }
        if design.snp_count() != centers.len() {
            return Err(RenormError::invalid_data(format!(
                "Design matrix covers {} SNPs but cluster centers cover {}",
                design.snp_count(),
                centers.len()
            )));
        }
        Ok(Self {
            design,
            centers,
            min_points: config.min_points,
            thin: config.thin,
        })
    }

    pub fn correct(
        &self,
        sample: usize,
        x: ArrayView1<f64>,
        y: ArrayView1<f64>,
        genotypes: &[Genotype],
    ) -> Result<CorrectedIntensity> {
        let s = self.design.snp_count();
        if x.len() != s || y.len() != s || genotypes.len() != s {
            return Err(RenormError::invalid_data(format!(
                "Sample {} has X={}, Y={}, genotypes={} values for {} SNPs",
                sample,
                x.len(),
                y.len(),
                genotypes.len(),
                s
            )));
        }
        let dmask = self.design.mask();

        let mut usable: Vec<usize> = Vec::new();
        let mut target: Vec<f64> = Vec::new();
        for i in 0..s {
            if !dmask[i] || !(x[i] + y[i]).is_finite() {
                continue;
            }
            if let Some(r_geno) = self.centers.r_for(i, genotypes[i]) {
                if r_geno.is_finite() {
                    usable.push(i);
                    target.push(r_geno);
                }
            }
        }

        let n = usable.len();
        if n < self.min_points {
            debug!(
                "Sample {}: {} usable SNPs < {}; using uncorrected X+Y.",
                sample, n, self.min_points
            );
            return Ok(self.uncorrected(x, y, n));
        }

        let thin = match self.thin {
            Some(thin) if (n as f64 / thin as f64) < self.min_points as f64 => (n / self.min_points).max(1),
            Some(thin) => thin,
            None => 1,
        };

        let design = self.design.for_sample(x, y);
        let columns = design.ncols();
        let picked: Vec<usize> = (0..n).step_by(thin).collect();
        if picked.len() < columns {
            debug!(
                "Sample {}: {} fitting points for {} design columns; using uncorrected X+Y.",
                sample,
                picked.len(),
                columns
            );
            return Ok(self.uncorrected(x, y, n));
        }

        let mut a = Array2::<f64>::zeros((picked.len(), columns));
        let mut b = Array1::<f64>::zeros(picked.len());
        for (row, &k) in picked.iter().enumerate() {
            a.row_mut(row).assign(&design.row(usable[k]));
            b[row] = target[k];
        }

        let fit = a.least_squares(&b)?;
        let rank = numerical_rank(fit.singular_values.view(), a.nrows(), columns);
        if rank < columns {
            return Err(RenormError::RankDeficient {
                sample,
                rank,
                columns,
            });
        }
        let beta = fit.solution;

        let mut r = Array1::from_elem(s, f64::NAN);
        for i in 0..s {
            if dmask[i] && (x[i] + y[i]).is_finite() {
                r[i] = design.row(i).dot(&beta);
            }
        }

        debug!(
            "Sample {}: intensity regression on {} of {} usable SNPs (thin={}).",
            sample,
            picked.len(),
            n,
            thin
        );
        Ok(CorrectedIntensity {
            r,
            correction: Correction::Fitted {
                beta,
                points: picked.len(),
                thin,
            },
        })
    }
}

impl IntensityCorrector<'_> {
    /// `X + Y` on design-valid SNPs, NaN elsewhere.
    fn uncorrected(&self, x: ArrayView1<f64>, y: ArrayView1<f64>, usable: usize) -> CorrectedIntensity {
        let mut r = &x + &y;
        for (value, &valid) in r.iter_mut().zip(self.design.mask().iter()) {
            if !valid {
                *value = f64::NAN;
            }
        }
        CorrectedIntensity {
            r,
            correction: Correction::Uncorrected { usable },
        }
    }
}

/// Singular values above `max(m, n) * eps * s_max` count toward the rank.
fn numerical_rank(singular_values: ArrayView1<f64>, rows: usize, columns: usize) -> usize {
    let s_max = singular_values.iter().copied().fold(0.0_f64, f64::max);
    if s_max <= 0.0 || !s_max.is_finite() {
        return 0;
    }
    let tolerance = s_max * rows.max(columns) as f64 * f64::EPSILON;
    singular_values.iter().filter(|&&sv| sv > tolerance).count()
}
