// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use intensity_renorm::{
    pipeline, BatchTableWriter, DesignSource, GdatStore, IntensityStore, RegressionModel,
    RenormConfig,
};
use log::{info, warn};
use std::time::Instant;

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting intensity_renorm with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Open the store and assemble the run configuration ---
    info!("Opening genotype store: {}", cli_args.gdat.display());
    let store = GdatStore::open(&cli_args.gdat)
        .with_context(|| format!("Failed to open genotype store {}", cli_args.gdat.display()))?;
    info!(
        "Store holds {} samples x {} SNPs{}.",
        store.sample_count(),
        store.snp_count(),
        if store.has_quality() { "" } else { " (no quality scores)" }
    );

    let rmodel: RegressionModel = cli_args.rmodel.parse()?;
    let config = RenormConfig {
        rmodel,
        max_missing: cli_args.maxmissing,
        min_qual: cli_args.minqual,
        quantile_normalize: !cli_args.no_qnorm,
        min_points: cli_args.min_points,
        thin: Some(cli_args.thin),
        batch_size: cli_args.batch_size.unwrap_or(num_threads).max(1),
        progress: cli_args.progress,
        ..RenormConfig::default()
    };
    config.validate()?;

    if cli_args.lrr_column == cli_args.baf_column {
        return Err(anyhow!(
            "LRR and BAF output columns must differ (both are '{}').",
            cli_args.lrr_column
        ));
    }

    // --- 2. Covariate design ---
    let source = DesignSource::from_options(cli_args.gcmodel.clone(), cli_args.gcmodeldir.clone());
    let manifest = store.manifest_name();
    let design = source.resolve(manifest.as_deref(), store.snp_count(), rmodel)?;
    if design.covariate_columns() == 0 {
        info!("Intensity regression uses the {} model without GC covariates.", rmodel);
    } else {
        info!(
            "Intensity regression uses the {} model with {} GC covariates.",
            rmodel,
            design.covariate_columns()
        );
    }

    // --- 3. Both passes ---
    let mut lrr_writer =
        BatchTableWriter::create(store.root(), &cli_args.lrr_column, store.snp_count(), config.batch_size)?;
    let mut baf_writer =
        BatchTableWriter::create(store.root(), &cli_args.baf_column, store.snp_count(), config.batch_size)?;

    let summary = pipeline::run(&store, &design, &config, &mut lrr_writer, &mut baf_writer)?;

    if summary.undefined_snps + summary.invalid_snps == summary.snps && summary.snps > 0 {
        warn!("No SNP has usable cluster centers; every LRR and BAF value is undefined.");
    }
    info!(
        "Wrote {} and {} for {} samples x {} SNPs ({} samples skipped in pass 1, {} uncorrected).",
        lrr_writer.name(),
        baf_writer.name(),
        summary.samples,
        summary.snps,
        summary.skipped_samples,
        summary.fallback_samples
    );

    info!(
        "intensity_renorm finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use std::path::PathBuf;
    use clap::Parser; // For the derive macro to find Parser

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Re-estimate LRR and BAF from raw microarray intensities.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Genotype store directory
        pub(crate) gdat: PathBuf,

        /// Intensity regression model: linear or quadratic
        #[arg(long, default_value = "quadratic")]
        pub(crate) rmodel: String,

        /// GC/CpG model file (.gcm)
        #[arg(long, conflicts_with = "gcmodeldir")]
        pub(crate) gcmodel: Option<PathBuf>,

        /// Directory holding <manifest>.gcm files
        #[arg(long)]
        pub(crate) gcmodeldir: Option<PathBuf>,

        /// Samples with a higher missing-genotype rate are left out of cluster estimation
        #[arg(long, default_value_t = 0.02)]
        pub(crate) maxmissing: f64,

        /// Quality-score quantile below which SNPs are left out of cluster estimation
        #[arg(long, default_value_t = 0.10)]
        pub(crate) minqual: f64,

        #[arg(long)]
        pub(crate) no_qnorm: bool,

        #[arg(long, default_value_t = 10_000)]
        pub(crate) min_points: usize,

        #[arg(long, default_value_t = 11)]
        pub(crate) thin: usize,

        #[arg(long, default_value = "LRR_QN")]
        pub(crate) lrr_column: String,

        #[arg(long, default_value = "BAF_QN")]
        pub(crate) baf_column: String,

        #[arg(short = 'P', long)]
        pub(crate) progress: bool,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        /// Samples held in memory at once (defaults to the thread count)
        #[arg(long)]
        pub(crate) batch_size: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
