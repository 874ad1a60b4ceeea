//! Two-pass LRR/BAF re-estimation.
//!
//! Pass 1 streams every sample once to build cluster centers; pass 2 streams
//! them again to correct intensities and write LRR and BAF. A reader thread
//! prefetches samples over a bounded channel, so at most `batch_size` samples
//! are resident while rayon works through the current batch.

use crate::centers::{CenterAccumulator, ClusterCenters};
use crate::config::RenormConfig;
use crate::design::DesignMatrix;
use crate::error::{RenormError, Result};
use crate::genotype::{missing_rate, Genotype};
use crate::lrr_baf::{compute_lrr_baf, SampleMetrics};
use crate::regression::IntensityCorrector;
use crate::store::{IntensityStore, SampleRecord};
use crate::transform::{polar_angle, polar_coordinates, quantile, quantile_normalize};
use crate::writer::RowWriter;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use std::thread;

/// Pass-1 result.
#[derive(Clone, Debug)]
pub struct CenterEstimate {
    pub centers: ClusterCenters,
    pub admitted: usize,
    /// Samples left out of the centers for exceeding the missing-rate limit.
    pub skipped: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub samples: usize,
    pub snps: usize,
    pub skipped_samples: usize,
    /// SNPs lacking a homozygote center.
    pub undefined_snps: usize,
    /// SNPs whose centers were not ordered in angle.
    pub invalid_snps: usize,
    /// Samples whose intensities were left uncorrected.
    pub fallback_samples: usize,
}

fn progress_bar(len: usize, label: &str, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::default_bar()
        .template("{prefix}{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} samples ({percent}%) ETA: {eta}")
        .map_err(|e| RenormError::config(format!("Failed to create progress bar style: {}", e)))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(len as u64)
        .with_style(style)
        .with_prefix(label.to_string()))
}

/// Feeds the store's samples to `process` in order, `batch_size` at a time.
/// Returns the number of samples seen.
/// The bar is cleared on return, whether or not streaming succeeded.
fn stream_batches<S, F>(
    store: &S,
    with_quality: bool,
    batch_size: usize,
    bar: &ProgressBar,
    mut process: F,
) -> Result<usize>
where
    S: IntensityStore,
    F: FnMut(Vec<SampleRecord>) -> Result<()>,
{
    let expected = store.sample_count();
    let batch_size = batch_size.max(1);
    let (tx, rx) = flume::bounded::<Result<SampleRecord>>(batch_size);

    let outcome = thread::scope(|scope| -> Result<usize> {
        let producer = scope.spawn(move || {
            let samples = match store.samples(with_quality) {
                Ok(samples) => samples,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            for sample in samples {
                let failed = sample.is_err();
                if tx.send(sample).is_err() || failed {
                    break;
                }
            }
        });

        // `rx` is dropped when this returns, unblocking the producer on early errors.
        let consumed = drain_batches(rx, batch_size, bar, &mut process);
        producer
            .join()
            .map_err(|_| RenormError::Producer("Sample reader thread panicked.".to_string()))?;
        consumed
    });

    bar.finish_and_clear();
    let seen = outcome?;
    if seen != expected {
        return Err(RenormError::invalid_data(format!(
            "Store reported {} samples but {} were read",
            expected, seen
        )));
    }
    Ok(seen)
}

fn drain_batches<F>(
    rx: flume::Receiver<Result<SampleRecord>>,
    batch_size: usize,
    bar: &ProgressBar,
    process: &mut F,
) -> Result<usize>
where
    F: FnMut(Vec<SampleRecord>) -> Result<()>,
{
    let mut seen = 0;
    loop {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match rx.recv() {
                Ok(sample) => {
                    let sample = sample?;
                    let expected_index = seen + batch.len();
                    if sample.index != expected_index {
                        return Err(RenormError::invalid_data(format!(
                            "Samples out of order: expected {}, got {}",
                            expected_index, sample.index
                        )));
                    }
                    batch.push(sample);
                }
                Err(flume::RecvError::Disconnected) => break,
            }
        }
        if batch.is_empty() {
            return Ok(seen);
        }
        let len = batch.len();
        process(batch)?;
        seen += len;
        bar.inc(len as u64);
    }
}

fn check_lengths(record: &SampleRecord, snp_count: usize) -> Result<()> {
    let quality_ok = record.quality.as_ref().map_or(true, |q| q.len() == snp_count);
    if record.x.len() != snp_count || record.y.len() != snp_count || record.genotypes.len() != snp_count || !quality_ok {
        return Err(RenormError::invalid_data(format!(
            "Sample {} does not have {} values in every column",
            record.index, snp_count
        )));
    }
    Ok(())
}

/// What pass 1 does with one sample.
enum Admission {
    Admitted {
        genotypes: Vec<Genotype>,
        r: Array1<f64>,
        t: Array1<f64>,
        mask: Array1<bool>,
    },
    Skipped,
}

fn admit_sample(record: SampleRecord, dmask: ArrayView1<bool>, config: &RenormConfig) -> Result<Admission> {
    check_lengths(&record, dmask.len())?;
    let SampleRecord {
        index,
        mut x,
        mut y,
        genotypes,
        quality,
    } = record;

    let missing = missing_rate(&genotypes);
    if missing > config.max_missing {
        debug!(
            "  Sample {} skipped: missing rate {:.2}% > {:.2}%",
            index,
            missing * 100.0,
            config.max_missing * 100.0
        );
        return Ok(Admission::Skipped);
    }

    let min_qual = quality.as_ref().and_then(|q| quantile(q.view(), config.min_qual));
    if quality.is_some() && min_qual.is_none() {
        debug!("  Sample {} has no finite quality scores; not quality-gated.", index);
    }

    if config.quantile_normalize {
        quantile_normalize(&mut x, &mut y, config.qnorm_max_threshold, config.qnorm_min_threshold)?;
    }
    let (r, t) = polar_coordinates(x.view(), y.view());

    let mask = Array1::from_shape_fn(dmask.len(), |i| {
        let passes_quality = match (&quality, min_qual) {
            (Some(q), Some(threshold)) => q[i] >= threshold,
            _ => true,
        };
        dmask[i] && passes_quality && r[i].is_finite() && t[i].is_finite()
    });

    Ok(Admission::Admitted { genotypes, r, t, mask })
}

/// Pass 1: accumulates cluster centers over every admitted sample and finalizes them.
pub fn estimate_centers<S: IntensityStore>(
    store: &S,
    design: &DesignMatrix,
    config: &RenormConfig,
) -> Result<CenterEstimate> {
    let s = store.snp_count();
    let n = store.sample_count();
    let dmask = design.mask();
    info!("PASS 1: Re-estimate cluster centers...");

    // One shard per worker for the whole pass, merged once at the end.
    let shard_count = rayon::current_num_threads().min(config.batch_size).max(1);
    let mut shards: Vec<(CenterAccumulator, usize)> =
        (0..shard_count).map(|_| (CenterAccumulator::new(s), 0)).collect();

    let bar = progress_bar(n, "PASS 1: ", config.progress)?;
    stream_batches(store, true, config.batch_size, &bar, |batch| {
        debug!(
            "  Samples {}-{} / {}",
            batch[0].index + 1,
            batch[0].index + batch.len(),
            n
        );
        let groups = split_owned(batch, shards.len());
        shards
            .par_iter_mut()
            .zip(groups)
            .try_for_each(|((acc, skipped), group)| -> Result<()> {
                for record in group {
                    match admit_sample(record, dmask, config)? {
                        Admission::Admitted { genotypes, r, t, mask } => {
                            acc.add_sample(r.view(), t.view(), &genotypes, mask.view())?;
                        }
                        Admission::Skipped => *skipped += 1,
                    }
                }
                Ok(())
            })
    })?;

    let (accumulator, skipped) = shards
        .into_iter()
        .reduce(|(mut a, a_skipped), (b, b_skipped)| {
            a.merge(b);
            (a, a_skipped + b_skipped)
        })
        .unwrap_or_else(|| (CenterAccumulator::new(s), 0));

    let admitted = accumulator.samples();
    let centers = accumulator.finalize();

    if skipped > 0 {
        info!(
            "  Skipped {} samples ({:.2}%) for missing rate > {:.2}%",
            skipped,
            skipped as f64 / n.max(1) as f64 * 100.0,
            config.max_missing * 100.0
        );
    }
    if admitted == 0 && n > 0 {
        warn!("No samples were admitted to pass 1; every SNP will be undefined.");
    }
    info!(
        "  Cluster centers: {} valid, {} without homozygote centers, {} non-monotonic, {} imputed heterozygotes.",
        centers.valid_count(),
        centers.undefined_count(),
        centers.invalid_count(),
        centers.imputed_het_count()
    );

    Ok(CenterEstimate {
        centers,
        admitted,
        skipped,
    })
}

/// LRR and BAF for one sample plus whether its regression fell back.
fn sample_metrics(
    record: SampleRecord,
    corrector: &IntensityCorrector<'_>,
    centers: &ClusterCenters,
    config: &RenormConfig,
) -> Result<(SampleMetrics, bool)> {
    check_lengths(&record, centers.len())?;
    let SampleRecord {
        index,
        mut x,
        mut y,
        genotypes,
        ..
    } = record;

    if config.quantile_normalize {
        quantile_normalize(&mut x, &mut y, config.qnorm_max_threshold, config.qnorm_min_threshold)?;
    }
    let t = polar_angle(x.view(), y.view());
    let corrected = corrector.correct(index, x.view(), y.view(), &genotypes)?;
    let metrics = compute_lrr_baf(corrected.r.view(), t.view(), centers)?;
    Ok((metrics, corrected.is_fallback()))
}

/// Pass 2: writes one LRR row and one BAF row per sample, in sample order.
/// Returns the number of samples whose intensities were left uncorrected.
pub fn write_metrics<S, L, B>(
    store: &S,
    design: &DesignMatrix,
    centers: &ClusterCenters,
    config: &RenormConfig,
    lrr_writer: &mut L,
    baf_writer: &mut B,
) -> Result<usize>
where
    S: IntensityStore,
    L: RowWriter + ?Sized,
    B: RowWriter + ?Sized,
{
    let n = store.sample_count();
    let corrector = IntensityCorrector::new(design, centers, config)?;
    info!("PASS 2: Updating LRR and BAF...");

    let mut fallback = 0usize;
    let bar = progress_bar(n, "PASS 2: ", config.progress)?;
    stream_batches(store, false, config.batch_size, &bar, |batch| {
        debug!(
            "  Samples {}-{} / {}",
            batch[0].index + 1,
            batch[0].index + batch.len(),
            n
        );
        let outputs: Vec<(SampleMetrics, bool)> = batch
            .into_par_iter()
            .map(|record| sample_metrics(record, &corrector, centers, config))
            .collect::<Result<Vec<_>>>()?;
        for (metrics, was_fallback) in outputs {
            lrr_writer.write(metrics.lrr.view())?;
            baf_writer.write(metrics.baf.view())?;
            fallback += usize::from(was_fallback);
        }
        Ok(())
    })?;

    if fallback > 0 {
        info!(
            "  {} samples had too few usable SNPs (< {}) for intensity correction.",
            fallback, config.min_points
        );
    }
    Ok(fallback)
}

/// Runs both passes. Writers are closed only after every row is written, and
/// both are prepared before either is closed. On any error, including a failed
/// close, both are aborted so neither column remains.
pub fn run<S, L, B>(
    store: &S,
    design: &DesignMatrix,
    config: &RenormConfig,
    lrr_writer: &mut L,
    baf_writer: &mut B,
) -> Result<RunSummary>
where
    S: IntensityStore,
    L: RowWriter + ?Sized,
    B: RowWriter + ?Sized,
{
    let outcome = match run_passes(store, design, config, lrr_writer, baf_writer) {
        Ok(summary) => commit(lrr_writer, baf_writer).map(|()| summary),
        Err(e) => Err(e),
    };
    if outcome.is_err() {
        for writer_result in [lrr_writer.abort(), baf_writer.abort()] {
            if let Err(abort_err) = writer_result {
                warn!("Failed to discard output: {}", abort_err);
            }
        }
    }
    outcome
}

fn commit<L, B>(lrr_writer: &mut L, baf_writer: &mut B) -> Result<()>
where
    L: RowWriter + ?Sized,
    B: RowWriter + ?Sized,
{
    lrr_writer.prepare()?;
    baf_writer.prepare()?;
    lrr_writer.close()?;
    baf_writer.close()
}

/// Splits `items` into at most `parts` runs of consecutive items.
fn split_owned<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let chunk = items.len().div_ceil(parts.max(1)).max(1);
    let mut groups = Vec::with_capacity(parts);
    let mut items = items.into_iter();
    loop {
        let group: Vec<T> = items.by_ref().take(chunk).collect();
        if group.is_empty() {
            return groups;
        }
        groups.push(group);
    }
}

fn run_passes<S, L, B>(
    store: &S,
    design: &DesignMatrix,
    config: &RenormConfig,
    lrr_writer: &mut L,
    baf_writer: &mut B,
) -> Result<RunSummary>
where
    S: IntensityStore,
    L: RowWriter + ?Sized,
    B: RowWriter + ?Sized,
{
    config.validate()?;
    if design.snp_count() != store.snp_count() {
        return Err(RenormError::invalid_data(format!(
            "Design matrix covers {} SNPs but the store has {}",
            design.snp_count(),
            store.snp_count()
        )));
    }
    info!(
        "SNPs={}, samples={}, model={}",
        store.snp_count(),
        store.sample_count(),
        config.rmodel
    );

    let estimate = estimate_centers(store, design, config)?;
    let fallback_samples = write_metrics(store, design, &estimate.centers, config, lrr_writer, baf_writer)?;

    Ok(RunSummary {
        samples: store.sample_count(),
        snps: store.snp_count(),
        skipped_samples: estimate.skipped,
        undefined_snps: estimate.centers.undefined_count(),
        invalid_snps: estimate.centers.invalid_count(),
        fallback_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegressionModel;
    use crate::store::MemoryStore;
    use crate::writer::MemoryWriter;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn plain_config() -> RenormConfig {
        RenormConfig {
            rmodel: RegressionModel::Linear,
            quantile_normalize: false,
            batch_size: 2,
            ..RenormConfig::default()
        }
    }

    fn three_genotype_store() -> MemoryStore {
        MemoryStore::new(
            array![[1.0], [0.5], [0.0]],
            array![[0.0], [0.5], [1.0]],
            vec![vec![Genotype::AA], vec![Genotype::AB], vec![Genotype::BB]],
            Some(array![[0.9], [0.9], [0.9]]),
        )
        .unwrap()
    }

    #[test]
    fn single_snp_three_samples_end_to_end() {
        let store = three_genotype_store();
        let config = plain_config();
        let design = DesignMatrix::intercept_only(1, config.rmodel);

        let estimate = estimate_centers(&store, &design, &config).unwrap();
        let snp = estimate.centers.get(0).copied().unwrap();
        assert_abs_diff_eq!(snp.aa.r, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.aa.t, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.ab.r, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.ab.t, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.bb.r, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(snp.bb.t, 1.0, epsilon = 1e-12);

        let mut lrr = MemoryWriter::new();
        let mut baf = MemoryWriter::new();
        let summary = run(&store, &design, &config, &mut lrr, &mut baf).unwrap();
        assert!(lrr.is_closed() && baf.is_closed());
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.fallback_samples, 3);

        assert_abs_diff_eq!(lrr.rows()[1][0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(baf.rows()[1][0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(baf.rows()[0][0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(baf.rows()[2][0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn high_missing_samples_are_skipped_in_pass_one_only() {
        // Sample 3 is an AB call at SNP 0 but is missing everywhere else.
        let x = array![[1.0, 1.0], [0.5, 0.0], [0.0, 0.5], [0.2, f64::NAN]];
        let y = array![[0.0, 0.0], [0.5, 1.0], [1.0, 0.5], [0.8, f64::NAN]];
        let g = vec![
            vec![Genotype::AA, Genotype::AA],
            vec![Genotype::AB, Genotype::BB],
            vec![Genotype::BB, Genotype::AB],
            vec![Genotype::AB, Genotype::Missing],
        ];
        let store = MemoryStore::new(x, y, g, None).unwrap();
        let config = plain_config();
        let design = DesignMatrix::intercept_only(2, config.rmodel);

        let estimate = estimate_centers(&store, &design, &config).unwrap();
        assert_eq!(estimate.skipped, 1);
        assert_eq!(estimate.admitted, 3);
        // Had sample 3 been admitted, the AB angle at SNP 0 would not be 0.5.
        assert_abs_diff_eq!(estimate.centers.get(0).unwrap().ab.t, 0.5, epsilon = 1e-12);

        let mut lrr = MemoryWriter::new();
        let mut baf = MemoryWriter::new();
        let summary = run(&store, &design, &config, &mut lrr, &mut baf).unwrap();
        assert_eq!(summary.skipped_samples, 1);
        assert_eq!(lrr.rows().len(), 4);
        assert!(baf.rows()[3][0].is_finite());
        assert!(baf.rows()[3][1].is_nan());
    }

    #[test]
    fn low_quality_snps_do_not_shape_centers() {
        // SNP 1 of sample 1 has the lowest quality score and is left out.
        let x = array![[1.0, 1.0], [1.0, 3.0], [0.5, 0.5], [0.0, 0.0]];
        let y = array![[0.0, 0.0], [0.0, 0.0], [0.5, 0.5], [1.0, 1.0]];
        let g = vec![
            vec![Genotype::AA, Genotype::AA],
            vec![Genotype::AA, Genotype::AA],
            vec![Genotype::AB, Genotype::AB],
            vec![Genotype::BB, Genotype::BB],
        ];
        let q = array![[0.9, 0.9], [0.9, 0.1], [0.9, 0.9], [0.9, 0.9]];
        let store = MemoryStore::new(x, y, g, Some(q)).unwrap();
        let config = RenormConfig {
            min_qual: 0.5,
            ..plain_config()
        };
        let design = DesignMatrix::intercept_only(2, config.rmodel);

        let estimate = estimate_centers(&store, &design, &config).unwrap();
        let aa = estimate.centers.counts(Genotype::AA).unwrap();
        assert_eq!(aa[0], 2);
        assert_eq!(aa[1], 1);
        assert_abs_diff_eq!(estimate.centers.get(1).unwrap().aa.r, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn non_monotonic_snp_is_undefined_for_every_sample() {
        // At SNP 1 the AB samples sit further toward B than the BB samples.
        let x = array![[1.0, 1.0], [0.5, 0.05], [0.0, 0.4]];
        let y = array![[0.0, 0.0], [0.5, 0.95], [1.0, 0.6]];
        let g = vec![
            vec![Genotype::AA, Genotype::AA],
            vec![Genotype::AB, Genotype::AB],
            vec![Genotype::BB, Genotype::BB],
        ];
        let store = MemoryStore::new(x, y, g, None).unwrap();
        let config = plain_config();
        let design = DesignMatrix::intercept_only(2, config.rmodel);

        let mut lrr = MemoryWriter::new();
        let mut baf = MemoryWriter::new();
        let summary = run(&store, &design, &config, &mut lrr, &mut baf).unwrap();
        assert_eq!(summary.invalid_snps, 1);
        for row in lrr.rows().iter().chain(baf.rows()) {
            assert!(row[0].is_finite());
            assert!(row[1].is_nan());
        }
    }

    #[test]
    fn fatal_regression_error_aborts_both_writers() {
        let s = 12;
        let x = Array2::from_shape_fn((3, s), |(i, j)| [1.0, 0.5, 0.05][i] + 0.01 * j as f64);
        let y = Array2::from_shape_fn((3, s), |(i, j)| [0.05, 0.5, 1.0][i] + 0.02 * ((j * 3) % 5) as f64);
        let g = vec![vec![Genotype::AA; s], vec![Genotype::AB; s], vec![Genotype::BB; s]];
        let store = MemoryStore::new(x, y, g, None).unwrap();
        let config = RenormConfig {
            min_points: 4,
            thin: None,
            ..plain_config()
        };
        // Constant covariate: collinear with the intercept.
        let design = DesignMatrix::with_covariates(
            Array2::from_elem((s, 1), 1.0).view(),
            Array1::from_elem(s, true),
            config.rmodel,
        )
        .unwrap();

        let mut lrr = MemoryWriter::new();
        let mut baf = MemoryWriter::new();
        let err = run(&store, &design, &config, &mut lrr, &mut baf).unwrap_err();
        assert!(matches!(err, RenormError::RankDeficient { .. }));
        assert!(lrr.is_aborted() && baf.is_aborted());
        assert!(!lrr.is_closed());
        assert!(lrr.rows().is_empty());
    }

    #[test]
    fn invalid_config_writes_nothing() {
        let store = three_genotype_store();
        let config = RenormConfig {
            max_missing: -0.1,
            ..plain_config()
        };
        let design = DesignMatrix::intercept_only(1, config.rmodel);
        let mut lrr = MemoryWriter::new();
        let mut baf = MemoryWriter::new();
        let err = run(&store, &design, &config, &mut lrr, &mut baf).unwrap_err();
        assert!(matches!(err, RenormError::Config { .. }));
        assert!(lrr.is_aborted() && baf.is_aborted());
    }

    #[test]
    fn batch_size_does_not_change_results() {
        let store = three_genotype_store();
        let design = DesignMatrix::intercept_only(1, RegressionModel::Linear);
        let mut rows = Vec::new();
        for batch_size in [1, 2, 8] {
            let config = RenormConfig {
                batch_size,
                ..plain_config()
            };
            let mut lrr = MemoryWriter::new();
            let mut baf = MemoryWriter::new();
            run(&store, &design, &config, &mut lrr, &mut baf).unwrap();
            rows.push(baf.rows().to_vec());
        }
        assert_eq!(rows[0], rows[1]);
        assert_eq!(rows[1], rows[2]);
    }

    /// Accepts rows but refuses to close.
    #[derive(Default)]
    struct UnclosableWriter {
        inner: MemoryWriter,
    }

    impl RowWriter for UnclosableWriter {
        fn write(&mut self, row: ArrayView1<f64>) -> Result<()> {
            self.inner.write(row)
        }

        fn close(&mut self) -> Result<()> {
            Err(RenormError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn abort(&mut self) -> Result<()> {
            self.inner.abort()
        }

        fn rows_written(&self) -> usize {
            self.inner.rows_written()
        }
    }

    #[test]
    fn failed_baf_close_withdraws_the_closed_lrr_column() {
        let store = three_genotype_store();
        let config = plain_config();
        let design = DesignMatrix::intercept_only(1, config.rmodel);
        let mut lrr = MemoryWriter::new();
        let mut baf = UnclosableWriter::default();

        let err = run(&store, &design, &config, &mut lrr, &mut baf).unwrap_err();
        assert!(matches!(err, RenormError::Io(_)));
        assert!(!lrr.is_closed());
        assert!(lrr.is_aborted());
        assert!(lrr.rows().is_empty());
        assert!(baf.inner.is_aborted());
    }

    #[test]
    fn failed_lrr_close_aborts_the_baf_column() {
        let store = three_genotype_store();
        let config = plain_config();
        let design = DesignMatrix::intercept_only(1, config.rmodel);
        let mut lrr = UnclosableWriter::default();
        let mut baf = MemoryWriter::new();

        assert!(run(&store, &design, &config, &mut lrr, &mut baf).is_err());
        assert!(lrr.inner.is_aborted());
        assert!(!baf.is_closed());
        assert!(baf.is_aborted());
        assert!(baf.rows().is_empty());
    }

    #[test]
    fn progress_bar_is_cleared_when_a_batch_fails() {
        let store = three_genotype_store();
        let bar = ProgressBar::hidden();
        let err = stream_batches(&store, false, 1, &bar, |_| {
            Err(RenormError::invalid_data("bad batch"))
        })
        .unwrap_err();
        assert!(matches!(err, RenormError::InvalidData { .. }));
        assert!(bar.is_finished());
    }

    #[test]
    fn many_samples_over_few_shards_match_one_at_a_time() {
        // Twelve copies of the three canonical samples.
        let x = Array2::from_shape_fn((12, 1), |(i, _)| [1.0, 0.5, 0.0][i % 3]);
        let y = Array2::from_shape_fn((12, 1), |(i, _)| [0.0, 0.5, 1.0][i % 3]);
        let g = (0..12)
            .map(|i| vec![[Genotype::AA, Genotype::AB, Genotype::BB][i % 3]])
            .collect();
        let store = MemoryStore::new(x, y, g, None).unwrap();
        let design = DesignMatrix::intercept_only(1, RegressionModel::Linear);

        let wide = estimate_centers(&store, &design, &RenormConfig { batch_size: 5, ..plain_config() }).unwrap();
        let narrow = estimate_centers(&store, &design, &RenormConfig { batch_size: 1, ..plain_config() }).unwrap();
        assert_eq!(wide.admitted, 12);
        assert_eq!(narrow.admitted, 12);
        for class in Genotype::CALLED {
            assert_eq!(wide.centers.counts(class).unwrap()[0], 4);
        }
        let (a, b) = (wide.centers.get(0).unwrap(), narrow.centers.get(0).unwrap());
        assert_abs_diff_eq!(a.ab.t, b.ab.t, epsilon = 1e-12);
        assert_abs_diff_eq!(a.aa.r, b.aa.r, epsilon = 1e-12);
    }

    #[test]
    fn split_owned_keeps_order_and_every_item() {
        let groups = split_owned((0..7).collect::<Vec<_>>(), 3);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(split_owned(vec![1, 2], 8), vec![vec![1], vec![2]]);
        assert!(split_owned(Vec::<u8>::new(), 4).is_empty());
    }
}
