//! LRR and BAF from a sample's polar intensities and the pass-1 cluster centers.

use crate::centers::{ClusterCenters, SnpClusters};
use crate::error::{RenormError, Result};
use ndarray::{Array1, ArrayView1};

/// Added to the expected intensity so that `r_expected == 0` does not divide by zero.
pub const LRR_EPSILON: f64 = 1e-6;

/// One sample's output rows. Undefined values are `NaN`.
#[derive(Clone, Debug)]
pub struct SampleMetrics {
    pub lrr: Array1<f64>,
    pub baf: Array1<f64>,
}

/// LRR and BAF at a single SNP, or `None` for each value that is undefined.
#[inline]
pub fn snp_metrics(r: f64, t: f64, clusters: Option<&SnpClusters>) -> (Option<f64>, Option<f64>) {
    let Some(c) = clusters else {
        return (None, None);
    };
    if t.is_nan() {
        return (None, None);
    }

    let (r_expected, baf) = if t <= c.aa.t {
        (c.aa.r, 0.0)
    } else if t <= c.ab.t {
        let f = (t - c.aa.t) / (c.ab.t - c.aa.t);
        (c.aa.r + f * (c.ab.r - c.aa.r), f / 2.0)
    } else if t < c.bb.t {
        let f = (t - c.ab.t) / (c.bb.t - c.ab.t);
        (c.ab.r + f * (c.bb.r - c.ab.r), (f + 1.0) / 2.0)
    } else {
        (c.bb.r, 1.0)
    };

    let lrr = (r / (r_expected + LRR_EPSILON)).log2();
    (lrr.is_finite().then_some(lrr), baf.is_finite().then_some(baf))
}

/// Computes both metrics for every SNP of one sample.
pub fn compute_lrr_baf(r: ArrayView1<f64>, t: ArrayView1<f64>, centers: &ClusterCenters) -> Result<SampleMetrics> {
    if r.len() != centers.len() || t.len() != centers.len() {
        return Err(RenormError::invalid_data(format!(
            "LRR/BAF inputs have r={}, t={} values for {} SNPs",
            r.len(),
            t.len(),
            centers.len()
        )));
    }
    let mut lrr = Array1::from_elem(r.len(), f64::NAN);
    let mut baf = Array1::from_elem(r.len(), f64::NAN);
    for i in 0..r.len() {
        let (l, b) = snp_metrics(r[i], t[i], centers.get(i));
        if let Some(l) = l {
            lrr[i] = l;
        }
        if let Some(b) = b {
            baf[i] = b;
        }
    }
    Ok(SampleMetrics { lrr, baf })
}
