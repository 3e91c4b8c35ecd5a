//! Per-rank contig collection with global statistics and shared-file I/O.
//!
//! Contigs are dumped as FASTA records `>Contig<id> <depth>` into one
//! logical file whose contents are the concatenation of every rank's
//! records in unspecified order. Loading partitions the same file into
//! disjoint byte ranges, one per rank, so every record is read exactly
//! once and ranks balance by bytes rather than record count.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

use crate::fabric::RankCtx;
use crate::utils::perc_str;

const CTG_PREFIX: &str = ">Contig";

/// Thresholds for the assembled-length tiers, in kbp.
const LENGTH_TIERS_KBP: [u64; 5] = [1, 5, 10, 25, 50];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contig {
    pub id: i64,
    pub seq: String,
    /// Average per-base coverage.
    pub depth: f64,
}

impl Contig {
    /// Depth clamped into a 16-bit occurrence weight.
    pub fn depth_u16(&self) -> u16 {
        (self.depth.round() as i64).clamp(1, u16::MAX as i64) as u16
    }
}

#[derive(Default)]
pub struct Contigs {
    contigs: Vec<Contig>,
}

impl Contigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, contig: Contig) {
        self.contigs.push(contig);
    }

    pub fn clear(&mut self) {
        self.contigs.clear();
        self.contigs.shrink_to_fit();
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.contigs.reserve(capacity);
    }

    pub fn len(&self) -> usize {
        self.contigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contigs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contig> {
        self.contigs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Contig> {
        self.contigs.iter_mut()
    }

    /// Write every rank's records of length >= `min_ctg_len` into one
    /// shared file. Record order across ranks is unspecified.
    pub fn dump(&self, ctx: &RankCtx, path: &Path, min_ctg_len: usize) -> Result<()> {
        let path_buf = path.to_path_buf();
        let file = ctx.share(|| {
            File::create(&path_buf)
                .map(Mutex::new)
                .with_context(|| format!("could not create {}", path_buf.display()))
        })?;
        let mut buf = String::new();
        for ctg in &self.contigs {
            if ctg.seq.len() < min_ctg_len {
                continue;
            }
            buf.push_str(&format!("{}{} {}\n{}\n", CTG_PREFIX, ctg.id, ctg.depth, ctg.seq));
        }
        file.lock().write_all(buf.as_bytes())?;
        ctx.barrier()?;
        let all_num = ctx.reduce(self.contigs.len() as i64, |a, b| a + b)?;
        if ctx.rank_me() == 0 {
            info!("💾 Dumped {} contigs to {}", all_num, path.display());
        }
        Ok(())
    }

    /// Load this rank's byte-range partition of a dumped contig file.
    pub fn load(&mut self, ctx: &RankCtx, path: &Path) -> Result<()> {
        self.contigs.clear();
        let file_size = std::fs::metadata(path)
            .with_context(|| format!("could not stat contig file {}", path.display()))?
            .len();
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("could not open {}", path.display()))?,
        );
        let start = offset_for_rank(&mut reader, ctx.rank_me(), ctx.rank_n(), file_size)?;
        let stop = offset_for_rank(&mut reader, ctx.rank_me() + 1, ctx.rank_n(), file_size)?;
        reader.seek(SeekFrom::Start(start))?;
        let mut pos = start;
        let mut tot_len: u64 = 0;
        while pos < stop {
            let mut name = String::new();
            if reader.read_line(&mut name)? == 0 {
                break;
            }
            let mut seq = String::new();
            if reader.read_line(&mut seq)? == 0 {
                break;
            }
            let name = name.trim_end();
            let seq = seq.trim_end();
            let Some(rest) = name.strip_prefix(CTG_PREFIX) else {
                bail!("malformed contig header '{}' in {}", name, path.display());
            };
            let (id_str, depth_str) = rest
                .split_once(' ')
                .with_context(|| format!("contig header '{name}' missing depth"))?;
            let id: i64 = id_str
                .parse()
                .with_context(|| format!("bad contig id in header '{name}'"))?;
            let depth: f64 = depth_str
                .parse()
                .with_context(|| format!("bad contig depth in header '{name}'"))?;
            tot_len += seq.len() as u64;
            self.add(Contig { id, seq: seq.to_string(), depth });
            pos = reader.stream_position()?;
        }
        if pos < stop {
            bail!(
                "short read of contig file {}: stopped at {} before {}",
                path.display(),
                pos,
                stop
            );
        }
        ctx.barrier()?;
        let all_num = ctx.reduce(self.contigs.len() as i64, |a, b| a + b)?;
        let all_len = ctx.reduce(tot_len, |a, b| a + b)?;
        if ctx.rank_me() == 0 {
            info!("Loaded {} contigs ({} bp) from {}", all_num, all_len, path.display());
        }
        Ok(())
    }

    /// Aggregate and print assembly statistics for contigs at or above
    /// `min_ctg_len`.
    pub fn print_stats(&self, ctx: &RankCtx, min_ctg_len: usize) -> Result<()> {
        let local = self
            .contigs
            .par_iter()
            .filter(|ctg| ctg.seq.len() >= min_ctg_len)
            .map(|ctg| {
                let len = ctg.seq.len() as u64;
                let mut tiers = [0u64; LENGTH_TIERS_KBP.len()];
                for (tier, &kbp) in tiers.iter_mut().zip(&LENGTH_TIERS_KBP) {
                    if len >= kbp * 1000 {
                        *tier = len;
                    }
                }
                let num_ns = ctg.seq.bytes().filter(|&b| b == b'N').count() as u64;
                LocalStats { num: 1, tot_len: len, tot_depth: ctg.depth, max_len: len, num_ns, tiers }
            })
            .reduce(LocalStats::default, LocalStats::merge);

        let num = ctx.reduce(local.num, |a, b| a + b)?;
        let tot_len = ctx.reduce(local.tot_len, |a, b| a + b)?;
        let tot_depth = ctx.reduce(local.tot_depth, |a, b| a + b)?;
        let max_len = ctx.reduce(local.max_len, |a, b| a.max(b))?;
        let num_ns = ctx.reduce(local.num_ns, |a, b| a + b)?;
        let tiers = ctx.reduce(local.tiers, |a, b| {
            let mut out = [0u64; LENGTH_TIERS_KBP.len()];
            for i in 0..out.len() {
                out[i] = a[i] + b[i];
            }
            out
        })?;
        if ctx.rank_me() == 0 {
            println!("Assembly statistics (contig lengths >= {min_ctg_len})");
            println!("    Number of contigs:       {num}");
            println!("    Total assembled length:  {tot_len}");
            println!(
                "    Average contig depth:    {:.2}",
                if num > 0 { tot_depth / num as f64 } else { 0.0 }
            );
            println!(
                "    Number of Ns/100kbp:     {:.2} ({})",
                if tot_len > 0 { num_ns as f64 * 100_000.0 / tot_len as f64 } else { 0.0 },
                num_ns
            );
            println!("    Max. contig length:      {max_len}");
            println!("    Contig lengths:");
            for (i, &kbp) in LENGTH_TIERS_KBP.iter().enumerate() {
                println!(
                    "        > {:<6} {}",
                    format!("{kbp}kbp:"),
                    perc_str(tiers[i] as i64, tot_len as i64)
                );
            }
        }
        ctx.barrier()
    }
}

#[derive(Clone, Copy)]
struct LocalStats {
    num: u64,
    tot_len: u64,
    tot_depth: f64,
    max_len: u64,
    num_ns: u64,
    tiers: [u64; LENGTH_TIERS_KBP.len()],
}

impl Default for LocalStats {
    fn default() -> Self {
        Self {
            num: 0,
            tot_len: 0,
            tot_depth: 0.0,
            max_len: 0,
            num_ns: 0,
            tiers: [0; LENGTH_TIERS_KBP.len()],
        }
    }
}

impl LocalStats {
    fn merge(a: Self, b: Self) -> Self {
        let mut tiers = [0u64; LENGTH_TIERS_KBP.len()];
        for i in 0..tiers.len() {
            tiers[i] = a.tiers[i] + b.tiers[i];
        }
        Self {
            num: a.num + b.num,
            tot_len: a.tot_len + b.tot_len,
            tot_depth: a.tot_depth + b.tot_depth,
            max_len: a.max_len.max(b.max_len),
            num_ns: a.num_ns + b.num_ns,
            tiers,
        }
    }
}

/// Deterministic byte offset where `rank`'s partition of the file starts:
/// seek to the proportional offset, then advance past the next record
/// header and its sequence line.
fn offset_for_rank(
    reader: &mut BufReader<File>,
    rank: usize,
    n_ranks: usize,
    file_size: u64,
) -> Result<u64> {
    if rank == 0 {
        return Ok(0);
    }
    if rank >= n_ranks {
        return Ok(file_size);
    }
    let target = file_size * rank as u64 / n_ranks as u64;
    reader.seek(SeekFrom::Start(target))?;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(file_size);
        }
        if line.starts_with(CTG_PREFIX) {
            line.clear();
            reader.read_line(&mut line)?;
            return Ok(reader.stream_position()?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_clamps_to_u16() {
        let ctg = Contig { id: 0, seq: "ACGT".into(), depth: 1e9 };
        assert_eq!(ctg.depth_u16(), u16::MAX);
        let ctg = Contig { id: 0, seq: "ACGT".into(), depth: 0.2 };
        assert_eq!(ctg.depth_u16(), 1);
        let ctg = Contig { id: 0, seq: "ACGT".into(), depth: 2.6 };
        assert_eq!(ctg.depth_u16(), 3);
    }

    #[test]
    fn test_collection_basics() {
        let mut ctgs = Contigs::new();
        assert!(ctgs.is_empty());
        ctgs.set_capacity(10);
        ctgs.add(Contig { id: 0, seq: "ACGTACGT".into(), depth: 2.0 });
        ctgs.add(Contig { id: 1, seq: "TTTT".into(), depth: 1.0 });
        assert_eq!(ctgs.len(), 2);
        assert_eq!(ctgs.iter().map(|c| c.seq.len()).sum::<usize>(), 12);
        ctgs.clear();
        assert!(ctgs.is_empty());
    }
}
