//! Assembler configuration: CLI-driven with an optional JSON file, the
//! knobs the contigging engine honors and their validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::kmer::MAX_KMER_WORDS;
use crate::utils::{free_mem_bytes, ONE_MB};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("qual_offset must be 33 or 64, got {0}")]
    BadQualOffset(u8),
    #[error("kmer_lens must be a non-empty ascending list")]
    BadKmerLens,
    #[error("k = {0} exceeds the compiled maximum of {max}", max = MAX_KMER_WORDS * 32)]
    KmerTooLong(usize),
    #[error("k = {0} is too short to seed a de Bruijn graph")]
    KmerTooShort(usize),
    #[error("dmin_thres must be at least 1")]
    BadDminThres,
    #[error("use_qf defers singleton k-mers and needs dmin_thres >= 2")]
    QfNeedsDmin,
    #[error("ranks must be at least 1")]
    BadRanks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Ascending k values, one contigging round each.
    pub kmer_lens: Vec<usize>,
    /// Phred encoding offset (33 or 64).
    pub qual_offset: u8,
    /// Minimum k-mer occurrence to participate in consensus.
    pub dmin_thres: u16,
    /// Per-rank cap on aggregation buffers, in MB.
    pub max_kmer_store_mb: usize,
    /// Advisory bound on outstanding cross-rank requests.
    pub max_rpcs_in_flight: usize,
    /// Combine repeated updates to hot k-mers before routing.
    pub use_heavy_hitters: bool,
    /// Defer singleton k-mer updates until a second local sighting.
    pub use_qf: bool,
    /// Dump contigs-<k>.fasta after every round.
    pub checkpoint: bool,
    /// Resume from a previously dumped contig FASTA.
    pub ctgs_fname: Option<String>,
    /// Minimum contig length written to the final assembly.
    pub min_ctg_print_len: usize,
    /// Relocate read pairs to the rank owning their best contig.
    pub shuffle_reads: bool,
    /// Number of SPMD ranks to run.
    pub ranks: usize,
    /// Directory for all output files.
    pub output_dir: PathBuf,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            kmer_lens: vec![21, 33, 55, 77, 99],
            qual_offset: 33,
            dmin_thres: 2,
            max_kmer_store_mb: 50,
            max_rpcs_in_flight: 100,
            use_heavy_hitters: false,
            use_qf: false,
            checkpoint: false,
            ctgs_fname: None,
            min_ctg_print_len: 500,
            shuffle_reads: false,
            ranks: 1,
            output_dir: PathBuf::from("."),
        }
    }
}

impl AssemblerConfig {
    pub fn from_json(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open config file {}", path.display()))?;
        let cfg: Self = serde_json::from_reader(file)
            .with_context(|| format!("malformed config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qual_offset != 33 && self.qual_offset != 64 {
            return Err(ConfigError::BadQualOffset(self.qual_offset));
        }
        if self.kmer_lens.is_empty() || self.kmer_lens.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::BadKmerLens);
        }
        for &k in &self.kmer_lens {
            if k > MAX_KMER_WORDS * 32 {
                return Err(ConfigError::KmerTooLong(k));
            }
            if k < 3 {
                return Err(ConfigError::KmerTooShort(k));
            }
        }
        if self.dmin_thres < 1 {
            return Err(ConfigError::BadDminThres);
        }
        if self.use_qf && self.dmin_thres < 2 {
            return Err(ConfigError::QfNeedsDmin);
        }
        if self.ranks < 1 {
            return Err(ConfigError::BadRanks);
        }
        Ok(())
    }

    /// Byte budget for one aggregation store: roughly 10% of free memory
    /// split across ranks, capped by `max_kmer_store_mb`.
    pub fn kmer_store_bytes(&self) -> usize {
        let auto = (free_mem_bytes() as f64 * 0.10 / self.ranks as f64) as usize;
        auto.min(self.max_kmer_store_mb * ONE_MB).max(ONE_MB)
    }

    pub fn output_path(&self, fname: &str) -> PathBuf {
        self.output_dir.join(fname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AssemblerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_qual_offset() {
        let cfg = AssemblerConfig { qual_offset: 40, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BadQualOffset(40))));
    }

    #[test]
    fn test_rejects_unsorted_kmer_lens() {
        let cfg = AssemblerConfig { kmer_lens: vec![33, 21], ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BadKmerLens)));
    }

    #[test]
    fn test_rejects_oversized_k() {
        let cfg = AssemblerConfig { kmer_lens: vec![21, 161], ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::KmerTooLong(161))));
    }

    #[test]
    fn test_qf_requires_dmin() {
        let cfg = AssemblerConfig { use_qf: true, dmin_thres: 1, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::QfNeedsDmin)));
    }

    #[test]
    fn test_json_roundtrip() {
        let cfg = AssemblerConfig { kmer_lens: vec![21, 33], checkpoint: true, ..Default::default() };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AssemblerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kmer_lens, vec![21, 33]);
        assert!(back.checkpoint);
    }
}
