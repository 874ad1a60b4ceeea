//! Genotype calls as stored in the `Genotype` column.

use crate::error::{RenormError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Genotype {
    Missing,
    AA,
    AB,
    BB,
}

impl Genotype {
    /// The three called classes, in angular order.
    pub const CALLED: [Genotype; 3] = [Genotype::AA, Genotype::AB, Genotype::BB];

    #[inline(always)]
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Genotype::Missing),
            1 => Ok(Genotype::AA),
            2 => Ok(Genotype::AB),
            3 => Ok(Genotype::BB),
            other => Err(RenormError::invalid_data(format!(
                "Unknown genotype code {} (expected 0-3)",
                other
            ))),
        }
    }

    #[inline(always)]
    pub fn code(self) -> u8 {
        match self {
            Genotype::Missing => 0,
            Genotype::AA => 1,
            Genotype::AB => 2,
            Genotype::BB => 3,
        }
    }

    #[inline(always)]
    pub fn is_called(self) -> bool {
        self != Genotype::Missing
    }
}

/// Fraction of SNPs with a missing call. An empty slice counts as fully missing.
pub fn missing_rate(genotypes: &[Genotype]) -> f64 {
    if genotypes.is_empty() {
        return 1.0;
    }
    let missing = genotypes.iter().filter(|g| !g.is_called()).count();
    missing as f64 / genotypes.len() as f64
}

pub fn decode_row(codes: &[u8]) -> Result<Vec<Genotype>> {
    codes.iter().map(|&c| Genotype::from_code(c)).collect()
}
