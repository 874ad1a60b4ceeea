// lib.rs

//! Re-estimates Log R Ratio and B-Allele Frequency from two-channel
//! microarray intensities in two streaming passes over a genotype store.

pub mod centers;
pub mod config;
pub mod design;
pub mod error;
pub mod genotype;
pub mod lrr_baf;
pub mod pipeline;
pub mod regression;
pub mod store;
pub mod transform;
pub mod writer;

pub use centers::{CenterAccumulator, ClusterCenters, SnpClusters};
pub use config::{RegressionModel, RenormConfig};
pub use design::{DesignMatrix, DesignSource};
pub use error::{RenormError, Result};
pub use genotype::Genotype;
pub use pipeline::{run, RunSummary};
pub use store::{GdatStore, IntensityStore, MemoryStore, StoreBuilder};
pub use writer::{BatchTableWriter, MemoryWriter, RowWriter};
