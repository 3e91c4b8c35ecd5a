//! # ContigForge - Iterative Contigging Engine
//!
//! A de novo short-read assembly core built in Rust. Implements the
//! iterative de Bruijn graph contigging loop: distributed k-mer counting
//! with extension consensus, parallel graph traversal into uutig fragments,
//! fragment linking and connection into contigs, and read shuffling for
//! downstream locality. Runs as an SPMD job over a rank fabric so the same
//! code drives one rank or many.

pub mod config;
pub mod contigging;
pub mod contigs;
pub mod fabric;
pub mod kcount;
pub mod kmer;
pub mod kmer_dht;
pub mod reads;
pub mod shuffle;
pub mod traversal;
pub mod utils;

// Re-export commonly used types at crate level
pub use crate::config::AssemblerConfig;
pub use crate::contigs::{Contig, Contigs};
pub use crate::fabric::{run_spmd, RankCtx};
pub use crate::reads::{PackedRead, PackedReads};

/// Result type used throughout the crate
pub type Result<T> = anyhow::Result<T>;

/// Error type used throughout the crate
pub type Error = anyhow::Error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_result_type() -> Result<()> {
        let success: Result<i32> = Ok(42);
        assert_eq!(success?, 42);
        Ok(())
    }

    #[test]
    fn test_single_rank_fabric_roundtrip() -> Result<()> {
        let sums = run_spmd(1, |ctx| {
            let total = ctx.reduce(7u64, |a, b| a + b)?;
            Ok(total)
        })?;
        assert_eq!(sums, vec![7]);
        Ok(())
    }
}
