//! Per-SNP genotype cluster centers in (total intensity, angle) space.
//!
//! Centers are built in two stages. A [`CenterAccumulator`] holds running sums
//! while pass 1 streams samples through it; [`CenterAccumulator::finalize`]
//! consumes it and yields immutable [`ClusterCenters`], so the transition can
//! only happen once and nothing can be accumulated after it.

use crate::error::{RenormError, Result};
use crate::genotype::Genotype;
use log::debug;
use ndarray::{Array1, ArrayView1};

/// Mean position of one genotype class at one SNP.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Center {
    pub r: f64,
    pub t: f64,
}

impl Center {
    fn midpoint(a: Center, b: Center) -> Center {
        Center {
            r: (a.r + b.r) / 2.0,
            t: (a.t + b.t) / 2.0,
        }
    }
}

/// Running sums for a single genotype class across all SNPs.
#[derive(Clone, Debug)]
pub struct ClassSums {
    class: Genotype,
    r_sum: Array1<f64>,
    t_sum: Array1<f64>,
    n: Array1<u64>,
}

impl ClassSums {
    pub fn new(class: Genotype, snp_count: usize) -> Self {
        Self {
            class,
            r_sum: Array1::zeros(snp_count),
            t_sum: Array1::zeros(snp_count),
            n: Array1::zeros(snp_count),
        }
    }

    pub fn class(&self) -> Genotype {
        self.class
    }

    pub fn counts(&self) -> ArrayView1<u64> {
        self.n.view()
    }

    /// Adds `r` and `t` at every SNP whose call matches this class and whose mask is set.
    pub fn update(
        &mut self,
        r: ArrayView1<f64>,
        t: ArrayView1<f64>,
        genotypes: &[Genotype],
        mask: ArrayView1<bool>,
    ) {
        for i in 0..genotypes.len() {
            if mask[i] && genotypes[i] == self.class {
                self.r_sum[i] += r[i];
                self.t_sum[i] += t[i];
                self.n[i] += 1;
            }
        }
    }

    fn merge(&mut self, other: &ClassSums) {
        self.r_sum += &other.r_sum;
        self.t_sum += &other.t_sum;
        self.n += &other.n;
    }

    /// Divides sums by counts. SNPs never observed in this class have no center.
    pub fn finalize(&self) -> Vec<Option<Center>> {
        (0..self.n.len())
            .map(|i| match self.n[i] {
                0 => None,
                n => Some(Center {
                    r: self.r_sum[i] / n as f64,
                    t: self.t_sum[i] / n as f64,
                }),
            })
            .collect()
    }
}

/// Pass-1 state: sums for AA, AB and BB at every SNP.
#[derive(Clone, Debug)]
pub struct CenterAccumulator {
    aa: ClassSums,
    ab: ClassSums,
    bb: ClassSums,
    samples: usize,
}

impl CenterAccumulator {
    pub fn new(snp_count: usize) -> Self {
        Self {
            aa: ClassSums::new(Genotype::AA, snp_count),
            ab: ClassSums::new(Genotype::AB, snp_count),
            bb: ClassSums::new(Genotype::BB, snp_count),
            samples: 0,
        }
    }

    pub fn snp_count(&self) -> usize {
        self.aa.r_sum.len()
    }

    /// Number of samples that contributed.
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn class_sums(&self, class: Genotype) -> Option<&ClassSums> {
        match class {
            Genotype::AA => Some(&self.aa),
            Genotype::AB => Some(&self.ab),
            Genotype::BB => Some(&self.bb),
            Genotype::Missing => None,
        }
    }

    /// Folds one admitted sample into all three classes.
    pub fn add_sample(
        &mut self,
        r: ArrayView1<f64>,
        t: ArrayView1<f64>,
        genotypes: &[Genotype],
        mask: ArrayView1<bool>,
    ) -> Result<()> {
        let s = self.snp_count();
        if r.len() != s || t.len() != s || genotypes.len() != s || mask.len() != s {
            return Err(RenormError::invalid_data(format!(
                "Sample vectors do not match SNP count {}: r={}, t={}, genotypes={}, mask={}",
                s,
                r.len(),
                t.len(),
                genotypes.len(),
                mask.len()
            )));
        }
        self.aa.update(r, t, genotypes, mask);
        self.ab.update(r, t, genotypes, mask);
        self.bb.update(r, t, genotypes, mask);
        self.samples += 1;
        Ok(())
    }

    /// Combines two partial accumulators over disjoint sample sets.
    pub fn merge(&mut self, other: CenterAccumulator) {
        self.aa.merge(&other.aa);
        self.ab.merge(&other.ab);
        self.bb.merge(&other.bb);
        self.samples += other.samples;
    }

    /// Ends accumulation: computes means, imputes missing heterozygote
    /// centers and drops SNPs whose centers are not strictly ordered in angle.
    pub fn finalize(self) -> ClusterCenters {
        let aa = self.aa.finalize();
        let ab = self.ab.finalize();
        let bb = self.bb.finalize();

        let mut imputed_het = 0;
        let mut undefined = 0;
        let mut invalid = 0;

        let snps: Vec<Option<SnpClusters>> = aa
            .into_iter()
            .zip(ab)
            .zip(bb)
            .map(|((aa, ab), bb)| {
                let (aa, bb) = match (aa, bb) {
                    (Some(aa), Some(bb)) => (aa, bb),
                    _ => {
                        undefined += 1;
                        return None;
                    }
                };
                let ab = ab.unwrap_or_else(|| {
                    imputed_het += 1;
                    Center::midpoint(aa, bb)
                });
                let clusters = SnpClusters { aa, ab, bb };
                if clusters.is_ordered() {
                    Some(clusters)
                } else {
                    invalid += 1;
                    None
                }
            })
            .collect();

        debug!(
            "Finalized centers for {} SNPs from {} samples: {} undefined, {} non-monotonic, {} imputed heterozygotes.",
            snps.len(),
            self.samples,
            undefined,
            invalid,
            imputed_het
        );

        ClusterCenters {
            snps,
            counts: [self.aa.n, self.ab.n, self.bb.n],
            samples: self.samples,
            undefined,
            invalid,
            imputed_het,
        }
    }
}

/// The three centers of one SNP.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnpClusters {
    pub aa: Center,
    pub ab: Center,
    pub bb: Center,
}

impl SnpClusters {
    /// `t_AA < t_AB < t_BB`; false whenever any angle is NaN.
    pub fn is_ordered(&self) -> bool {
        self.aa.t < self.ab.t && self.ab.t < self.bb.t && self.aa.t < self.bb.t
    }

    pub fn center(&self, genotype: Genotype) -> Option<Center> {
        match genotype {
            Genotype::AA => Some(self.aa),
            Genotype::AB => Some(self.ab),
            Genotype::BB => Some(self.bb),
            Genotype::Missing => None,
        }
    }
}

/// Pass-1 result, read-only for the rest of the run.
#[derive(Clone, Debug)]
pub struct ClusterCenters {
    snps: Vec<Option<SnpClusters>>,
    counts: [Array1<u64>; 3],
    samples: usize,
    undefined: usize,
    invalid: usize,
    imputed_het: usize,
}

impl ClusterCenters {
    /// Finalized centers built from per-SNP clusters without accumulation.
    /// Entries that are not strictly ordered in angle are dropped.
    pub fn from_clusters(snps: Vec<Option<SnpClusters>>) -> Self {
        let s = snps.len();
        let mut undefined = 0;
        let mut invalid = 0;
        let snps = snps
            .into_iter()
            .map(|c| match c {
                None => {
                    undefined += 1;
                    None
                }
                Some(c) if !c.is_ordered() => {
                    invalid += 1;
                    None
                }
                Some(c) => Some(c),
            })
            .collect();
        Self {
            snps,
            counts: [Array1::zeros(s), Array1::zeros(s), Array1::zeros(s)],
            samples: 0,
            undefined,
            invalid,
            imputed_het: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.snps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snps.is_empty()
    }

    /// Centers for `snp`, or `None` when they are undefined for every sample.
    #[inline(always)]
    pub fn get(&self, snp: usize) -> Option<&SnpClusters> {
        self.snps.get(snp).and_then(Option::as_ref)
    }

    /// Expected total intensity for a sample called `genotype` at `snp`.
    #[inline(always)]
    pub fn r_for(&self, snp: usize, genotype: Genotype) -> Option<f64> {
        self.get(snp)
            .and_then(|clusters| clusters.center(genotype))
            .map(|center| center.r)
    }

    /// Per-SNP observation counts for one class.
    pub fn counts(&self, class: Genotype) -> Option<ArrayView1<u64>> {
        match class {
            Genotype::AA => Some(self.counts[0].view()),
            Genotype::AB => Some(self.counts[1].view()),
            Genotype::BB => Some(self.counts[2].view()),
            Genotype::Missing => None,
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// SNPs lacking a homozygote center.
    pub fn undefined_count(&self) -> usize {
        self.undefined
    }

    /// SNPs whose centers were not strictly ordered in angle.
    pub fn invalid_count(&self) -> usize {
        self.invalid
    }

    pub fn imputed_het_count(&self) -> usize {
        self.imputed_het
    }

    pub fn valid_count(&self) -> usize {
        self.snps.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn all(n: usize) -> Array1<bool> {
        Array1::from_elem(n, true)
    }

    #[test]
    fn three_sample_centers_match_hand_computation() {
        let mut acc = CenterAccumulator::new(1);
        let mask = all(1);
        acc.add_sample(array![1.0].view(), array![0.0].view(), &[Genotype::AA], mask.view())
            .unwrap();
        acc.add_sample(array![1.0].view(), array![0.5].view(), &[Genotype::AB], mask.view())
            .unwrap();
        acc.add_sample(array![1.0].view(), array![1.0].view(), &[Genotype::BB], mask.view())
            .unwrap();

        let centers = acc.finalize();
        let snp = centers.get(0).copied().unwrap();
        assert_eq!(snp.aa, Center { r: 1.0, t: 0.0 });
        assert_eq!(snp.ab, Center { r: 1.0, t: 0.5 });
        assert_eq!(snp.bb, Center { r: 1.0, t: 1.0 });
        assert_eq!(centers.samples(), 3);
    }

    #[test]
    fn update_respects_class_and_mask() {
        let mut sums = ClassSums::new(Genotype::AB, 3);
        let genotypes = [Genotype::AB, Genotype::AB, Genotype::AA];
        sums.update(
            array![1.0, 2.0, 3.0].view(),
            array![0.4, 0.5, 0.1].view(),
            &genotypes,
            array![true, false, true].view(),
        );
        assert_eq!(sums.counts(), array![1u64, 0, 0].view());
        let finalized = sums.finalize();
        assert_eq!(finalized[0], Some(Center { r: 1.0, t: 0.4 }));
        assert_eq!(finalized[1], None);
        assert_eq!(finalized[2], None);
    }

    #[test]
    fn zero_counts_never_produce_non_finite_centers() {
        let centers = CenterAccumulator::new(4).finalize();
        for snp in 0..4 {
            assert!(centers.get(snp).is_none());
            assert_eq!(centers.r_for(snp, Genotype::AA), None);
        }
        assert_eq!(centers.undefined_count(), 4);
        assert_eq!(centers.valid_count(), 0);
    }

    #[test]
    fn missing_heterozygote_is_imputed_from_homozygotes() {
        let mut acc = CenterAccumulator::new(1);
        let mask = all(1);
        acc.add_sample(array![2.0].view(), array![0.1].view(), &[Genotype::AA], mask.view())
            .unwrap();
        acc.add_sample(array![1.0].view(), array![0.9].view(), &[Genotype::BB], mask.view())
            .unwrap();
        let centers = acc.finalize();
        let snp = centers.get(0).copied().unwrap();
        assert_abs_diff_eq!(snp.ab.r, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.ab.t, 0.5, epsilon = 1e-12);
        assert_eq!(centers.imputed_het_count(), 1);
    }

    #[test]
    fn non_monotonic_snps_are_nulled_together() {
        let mut acc = CenterAccumulator::new(2);
        let mask = all(2);
        let r = array![1.0, 1.0];
        // SNP 0 has AB to the left of AA; SNP 1 is well ordered.
        acc.add_sample(r.view(), array![0.3, 0.1].view(), &[Genotype::AA, Genotype::AA], mask.view())
            .unwrap();
        acc.add_sample(r.view(), array![0.2, 0.5].view(), &[Genotype::AB, Genotype::AB], mask.view())
            .unwrap();
        acc.add_sample(r.view(), array![0.9, 0.9].view(), &[Genotype::BB, Genotype::BB], mask.view())
            .unwrap();
        let centers = acc.finalize();
        assert!(centers.get(0).is_none());
        assert_eq!(centers.r_for(0, Genotype::BB), None);
        assert_eq!(centers.invalid_count(), 1);

        for snp in 0..centers.len() {
            if let Some(c) = centers.get(snp) {
                assert!(c.aa.t < c.ab.t && c.ab.t < c.bb.t);
            }
        }
    }

    #[test]
    fn merged_shards_equal_a_single_accumulator() {
        let samples = [
            (array![1.0, 2.0], array![0.1, 0.2], [Genotype::AA, Genotype::AB]),
            (array![1.5, 2.5], array![0.5, 0.9], [Genotype::AB, Genotype::BB]),
            (array![0.8, 2.1], array![0.05, 0.1], [Genotype::AA, Genotype::AA]),
            (array![1.2, 1.9], array![0.95, 0.45], [Genotype::BB, Genotype::AB]),
        ];
        let mask = all(2);

        let mut single = CenterAccumulator::new(2);
        for (r, t, g) in &samples {
            single.add_sample(r.view(), t.view(), g, mask.view()).unwrap();
        }

        let mut left = CenterAccumulator::new(2);
        let mut right = CenterAccumulator::new(2);
        for (i, (r, t, g)) in samples.iter().enumerate() {
            let shard = if i % 2 == 0 { &mut left } else { &mut right };
            shard.add_sample(r.view(), t.view(), g, mask.view()).unwrap();
        }
        left.merge(right);
        let merged = left;

        assert_eq!(merged.samples(), single.samples());
        for class in Genotype::CALLED {
            let a = merged.class_sums(class).unwrap();
            let b = single.class_sums(class).unwrap();
            assert_eq!(a.counts(), b.counts());
            assert_eq!(a.finalize(), b.finalize());
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut acc = CenterAccumulator::new(2);
        let err = acc
            .add_sample(array![1.0].view(), array![0.0].view(), &[Genotype::AA], all(1).view())
            .unwrap_err();
        assert!(matches!(err, RenormError::InvalidData { .. }));
    }

    #[test]
    fn direct_clusters_drop_unordered_snps() {
        let c = |r: f64, t: f64| Center { r, t };
        let ordered = SnpClusters {
            aa: c(1.0, 0.1),
            ab: c(1.0, 0.5),
            bb: c(1.0, 0.9),
        };
        let swapped = SnpClusters {
            aa: c(1.0, 0.1),
            ab: c(1.0, 0.95),
            bb: c(1.0, 0.9),
        };
        let centers = ClusterCenters::from_clusters(vec![Some(ordered), Some(swapped), None]);
        assert_eq!(centers.len(), 3);
        assert_eq!(centers.get(0), Some(&ordered));
        assert!(centers.get(1).is_none());
        assert_eq!(centers.invalid_count(), 1);
        assert_eq!(centers.undefined_count(), 1);
        assert_eq!(centers.valid_count(), 1);
    }
}
