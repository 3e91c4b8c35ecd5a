//! Contigging driver: one round per configured k, each round building a
//! fresh k-mer index from the reads plus the previous round's contigs,
//! traversing it, and carrying the resulting contigs forward.

use anyhow::{bail, Result};
use chrono::Local;
use std::time::Instant;
use tracing::info;

use crate::config::AssemblerConfig;
use crate::contigs::Contigs;
use crate::fabric::RankCtx;
use crate::kcount;
use crate::kmer::words_for_k;
use crate::kmer_dht::KmerDht;
use crate::reads::PackedReads;
use crate::traversal;

/// Longest minimizer used for home-rank routing.
const MAX_MINIMIZER_LEN: usize = 15;

/// Run the full ascending-k contigging loop.
pub fn contigging(
    ctx: &RankCtx,
    cfg: &AssemblerConfig,
    reads: &mut PackedReads,
    ctgs: &mut Contigs,
) -> Result<()> {
    for &kmer_len in &cfg.kmer_lens {
        match words_for_k(kmer_len) {
            1 => contigging_round::<1>(ctx, cfg, kmer_len, reads, ctgs)?,
            2 => contigging_round::<2>(ctx, cfg, kmer_len, reads, ctgs)?,
            3 => contigging_round::<3>(ctx, cfg, kmer_len, reads, ctgs)?,
            4 => contigging_round::<4>(ctx, cfg, kmer_len, reads, ctgs)?,
            5 => contigging_round::<5>(ctx, cfg, kmer_len, reads, ctgs)?,
            _ => bail!("k = {} exceeds the compiled maximum", kmer_len),
        }
    }
    Ok(())
}

/// One contigging round at a fixed k, monomorphized on the word bucket.
pub fn contigging_round<const W: usize>(
    ctx: &RankCtx,
    cfg: &AssemblerConfig,
    kmer_len: usize,
    reads: &mut PackedReads,
    ctgs: &mut Contigs,
) -> Result<()> {
    let round_start = Instant::now();
    if ctx.rank_me() == 0 {
        println!("_________________________");
        println!("🧬 Contig generation k = {kmer_len}");
    }
    let my_estimate = kcount::estimate_num_kmers(ctx, kmer_len, reads)?;
    // size every rank's shard for the worst-case load
    let my_num_kmers = ctx.reduce(my_estimate, |a, b| a.max(b))?;
    let minimizer_len = kmer_len.min(MAX_MINIMIZER_LEN);
    let mut kmer_dht =
        KmerDht::<W>::new(ctx, kmer_len, minimizer_len, my_num_kmers as usize, cfg)?;
    ctx.barrier()?;
    kcount::analyze_kmers(ctx, &mut kmer_dht, reads, ctgs, cfg)?;
    traversal::traverse_debruijn_graph(ctx, &kmer_dht, ctgs)?;

    if cfg!(debug_assertions) {
        ctgs.dump(ctx, &cfg.output_path(&format!("uutigs-{kmer_len}.fasta")), 0)?;
    }
    if cfg!(debug_assertions) || cfg.checkpoint {
        ctgs.dump(ctx, &cfg.output_path(&format!("contigs-{kmer_len}.fasta")), 0)?;
    }
    ctgs.print_stats(ctx, 500)?;
    if ctx.rank_me() == 0 {
        info!(
            "✅ Completed contig round k = {} in {:.2} s at {}",
            kmer_len,
            round_start.elapsed().as_secs_f64(),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
    }
    ctx.barrier()
}
