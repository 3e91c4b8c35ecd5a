//! Shared helpers: nucleotide arithmetic, formatting, memory detection and
//! FASTQ ingestion into packed read banks.

use anyhow::{anyhow, bail, Context, Result};
use bio::io::fastq;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::reads::PackedRead;

pub const ONE_MB: usize = 1024 * 1024;

/// Complement a single nucleotide, preserving case. Unknown characters map
/// to 'N'.
pub fn comp_base(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        b'a' => b't',
        b'c' => b'g',
        b'g' => b'c',
        b't' => b'a',
        _ => b'N',
    }
}

/// Reverse complement of a byte sequence.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| comp_base(b)).collect()
}

/// Reverse complement of a string sequence.
pub fn revcomp_str(seq: &str) -> String {
    String::from_utf8(revcomp(seq.as_bytes())).expect("reverse complement is ASCII")
}

/// Format a count with its percentage of a total, e.g. `123 (45.67%)`.
pub fn perc_str(num: i64, total: i64) -> String {
    if total == 0 {
        return format!("{num} (0.00%)");
    }
    format!("{} ({:.2}%)", num, num as f64 * 100.0 / total as f64)
}

/// Best-effort free memory in bytes. Reads `/proc/meminfo`, honoring a
/// `CONTIG_FORGE_MEM_MB` override for systems where that is unavailable.
pub fn free_mem_bytes() -> u64 {
    if let Ok(mb) = std::env::var("CONTIG_FORGE_MEM_MB") {
        if let Ok(mb) = mb.parse::<u64>() {
            return mb * ONE_MB as u64;
        }
    }
    if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok())
                {
                    return kb * 1024;
                }
            }
        }
    }
    // conservative default for unknown systems
    4 * 1024 * ONE_MB as u64
}

/// Load FASTQ read files into packed reads with pair-aware signed ids
/// (pair 1 positive, pair 2 negative).
///
/// An even number of files is interpreted as consecutive (R1, R2) pairs;
/// otherwise every file is treated as interleaved pairs.
pub fn load_read_pairs(files: &[PathBuf], qual_offset: u8) -> Result<Vec<PackedRead>> {
    let mut raw: Vec<(i64, Vec<u8>, Vec<u8>)> = Vec::new();
    let mut pair_idx: i64 = 0;
    if !files.is_empty() && files.len() % 2 == 0 {
        info!("📖 Reading {} files as (R1, R2) pairs", files.len());
        for pair in files.chunks(2) {
            let r1 = read_fastq(&pair[0])?;
            let r2 = read_fastq(&pair[1])?;
            if r1.len() != r2.len() {
                bail!(
                    "paired files {} and {} have mismatched read counts ({} vs {})",
                    pair[0].display(),
                    pair[1].display(),
                    r1.len(),
                    r2.len()
                );
            }
            for (s1, s2) in r1.into_iter().zip(r2) {
                pair_idx += 1;
                raw.push((pair_idx, s1.0, s1.1));
                raw.push((-pair_idx, s2.0, s2.1));
            }
        }
    } else {
        info!("📖 Reading {} file(s) as interleaved pairs", files.len());
        for fname in files {
            let recs = read_fastq(fname)?;
            if recs.len() % 2 != 0 {
                bail!(
                    "interleaved file {} has an odd number of reads ({})",
                    fname.display(),
                    recs.len()
                );
            }
            for pair in recs.chunks(2) {
                pair_idx += 1;
                raw.push((pair_idx, pair[0].0.clone(), pair[0].1.clone()));
                raw.push((-pair_idx, pair[1].0.clone(), pair[1].1.clone()));
            }
        }
    }
    // packing is pure per read, so spread it over the pool
    let packed = raw
        .par_iter()
        .map(|(id, seq, quals)| PackedRead::new(*id, seq, quals, qual_offset))
        .collect::<Result<Vec<_>>>()?;
    info!("📖 Packed {} reads ({} pairs)", packed.len(), packed.len() / 2);
    Ok(packed)
}

fn read_fastq(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let reader = fastq::Reader::from_file(path)
        .map_err(|e| anyhow!("could not open read file {}: {e}", path.display()))?;
    let mut out = Vec::new();
    for rec in reader.records() {
        let rec = rec.with_context(|| format!("malformed FASTQ record in {}", path.display()))?;
        out.push((rec.seq().to_vec(), rec.qual().to_vec()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comp_base_preserves_case() {
        assert_eq!(comp_base(b'A'), b'T');
        assert_eq!(comp_base(b'g'), b'c');
        assert_eq!(comp_base(b'N'), b'N');
    }

    #[test]
    fn test_revcomp() {
        assert_eq!(revcomp(b"ACGT"), b"ACGT".to_vec());
        assert_eq!(revcomp(b"AACC"), b"GGTT".to_vec());
        assert_eq!(revcomp_str("AAACCCTTTGGG"), "CCCAAAGGGTTT");
    }

    #[test]
    fn test_perc_str() {
        assert_eq!(perc_str(1, 4), "1 (25.00%)");
        assert_eq!(perc_str(0, 0), "0 (0.00%)");
    }
}
