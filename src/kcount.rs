//! K-mer counting pipeline: reads first, then the previous round's
//! contigs, then finalization of the index.

use anyhow::Result;
use std::time::Instant;
use tracing::info;

use crate::config::AssemblerConfig;
use crate::contigs::Contigs;
use crate::fabric::RankCtx;
use crate::kmer_dht::KmerDht;
use crate::reads::PackedReads;
use crate::utils::perc_str;

/// Phred score below which a base is masked (lowercased) before counting.
pub const QUAL_CUTOFF: u8 = 20;

/// How many reads per rank the capacity estimator samples.
const ESTIMATE_SAMPLE_READS: usize = 100_000;

/// Estimate this rank's k-mer population by sampling the read bank and
/// extrapolating linearly.
pub fn estimate_num_kmers(ctx: &RankCtx, kmer_len: usize, reads: &mut PackedReads) -> Result<u64> {
    let tot_num_reads = reads.get_local_num_reads() as u64;
    reads.reset();
    let mut num_kmers: u64 = 0;
    let mut num_sampled: u64 = 0;
    for _ in 0..ESTIMATE_SAMPLE_READS {
        let Some((_, seq, _)) = reads.get_next_read() else { break };
        num_sampled += 1;
        if seq.len() >= kmer_len {
            num_kmers += (seq.len() - kmer_len + 1) as u64;
        }
    }
    let estimate = if num_sampled > 0 { num_kmers * tot_num_reads / num_sampled } else { 0 };
    let all_sampled = ctx.reduce(num_sampled, |a, b| a + b)?;
    let all_total = ctx.reduce(tot_num_reads, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!(
            "Sampled {} to estimate k-mer load",
            perc_str(all_sampled as i64, all_total as i64)
        );
    }
    Ok(estimate)
}

/// Count k-mers from every read of length >= k, masking low-quality
/// positions first. Masked bases still contribute occurrences but cannot
/// cast high-quality extension votes.
fn count_kmers<const W: usize>(
    ctx: &RankCtx,
    dht: &mut KmerDht<W>,
    reads: &mut PackedReads,
    qual_offset: u8,
) -> Result<()> {
    let kmer_len = dht.kmer_len();
    let mut num_reads: i64 = 0;
    let mut num_bad_quals: i64 = 0;
    let mut tot_read_len: i64 = 0;
    reads.reset();
    while let Some((_, mut seq, quals)) = reads.get_next_read() {
        num_reads += 1;
        if seq.len() < kmer_len {
            continue;
        }
        tot_read_len += seq.len() as i64;
        for (base, &q) in seq.iter_mut().zip(&quals) {
            if q < qual_offset + QUAL_CUTOFF {
                base.make_ascii_lowercase();
                num_bad_quals += 1;
            }
        }
        dht.add_seq_kmers(&seq, 1, false)?;
    }
    dht.flush_updates()?;
    let all_num_reads = ctx.reduce(num_reads, |a, b| a + b)?;
    let all_bad_quals = ctx.reduce(num_bad_quals, |a, b| a + b)?;
    let all_read_len = ctx.reduce(tot_read_len, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!("Processed a total of {} reads", all_num_reads);
        if all_bad_quals > 0 {
            info!(
                "Found {} low quality positions",
                perc_str(all_bad_quals, all_read_len)
            );
        }
    }
    Ok(())
}

/// Add k-mers from the previous round's contigs, weighted by contig depth.
/// Contigs shorter than k + 2 carry no new adjacency information and are
/// skipped.
fn add_ctg_kmers<const W: usize>(
    ctx: &RankCtx,
    dht: &mut KmerDht<W>,
    ctgs: &Contigs,
) -> Result<()> {
    let kmer_len = dht.kmer_len();
    let mut max_kmers: usize = 0;
    for ctg in ctgs.iter() {
        if ctg.seq.len() > kmer_len {
            max_kmers += ctg.seq.len() - kmer_len + 1;
        }
    }
    let all_max_kmers = ctx.reduce(max_kmers, |a, b| a + b)?;
    // allow for hash table load factor
    dht.init_ctg_kmers(all_max_kmers * 3 / 2 / ctx.rank_n());
    for ctg in ctgs.iter() {
        if ctg.seq.len() < kmer_len + 2 {
            continue;
        }
        dht.add_seq_kmers(ctg.seq.as_bytes(), ctg.depth_u16(), true)?;
    }
    dht.flush_updates()?;
    let all_num_ctgs = ctx.reduce(ctgs.len() as i64, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!("Processed a total of {} contigs", all_num_ctgs);
    }
    Ok(())
}

/// Full counting phase for one round: reads, then contigs if any rank has
/// some, then index finalization.
pub fn analyze_kmers<const W: usize>(
    ctx: &RankCtx,
    dht: &mut KmerDht<W>,
    reads: &mut PackedReads,
    ctgs: &Contigs,
    cfg: &AssemblerConfig,
) -> Result<()> {
    let start = Instant::now();
    count_kmers(ctx, dht, reads, cfg.qual_offset)?;
    let any_ctgs = ctx.reduce(ctgs.len(), |a, b| a.max(b))? > 0;
    if any_ctgs {
        add_ctg_kmers(ctx, dht, ctgs)?;
    }
    let stats = dht.finish_updates(cfg.dmin_thres)?;
    dht.report_counts(&stats)?;
    dht.clear_stores();
    if ctx.rank_me() == 0 {
        info!("🧮 K-mer analysis took {:.2} s", start.elapsed().as_secs_f64());
    }
    ctx.barrier()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::run_spmd;

    fn test_cfg(dmin: u16) -> AssemblerConfig {
        AssemblerConfig { dmin_thres: dmin, kmer_lens: vec![5], ..Default::default() }
    }

    fn bank_of(reads: &[&[u8]]) -> PackedReads {
        let mut bank = PackedReads::new(33);
        for (i, seq) in reads.iter().enumerate() {
            let quals = vec![b'I'; seq.len()];
            bank.add_read(i as i64 + 1, seq, &quals).unwrap();
        }
        bank
    }

    #[test]
    fn test_read_below_k_contributes_no_kmers() -> Result<()> {
        run_spmd(1, |ctx| {
            let cfg = test_cfg(1);
            let mut dht = KmerDht::<1>::new(&ctx, 5, 5, 100, &cfg)?;
            let mut reads = bank_of(&[b"ACG"]);
            analyze_kmers(&ctx, &mut dht, &mut reads, &Contigs::new(), &cfg)?;
            assert_eq!(dht.get_local_num_kmers(), 0);
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn test_counting_respects_dmin_threshold() -> Result<()> {
        run_spmd(1, |ctx| {
            let cfg = test_cfg(2);
            let mut dht = KmerDht::<1>::new(&ctx, 5, 5, 100, &cfg)?;
            // one read seen twice, another seen once
            let mut reads = bank_of(&[b"AAACCCTTT", b"AAACCCTTT", b"GGGGGAAAT"]);
            analyze_kmers(&ctx, &mut dht, &mut reads, &Contigs::new(), &cfg)?;
            let keys = dht.local_kmer_keys();
            assert!(!keys.is_empty());
            for kmer in keys {
                let count = dht.with_local_kmer(&kmer, |kc| kc.count).unwrap();
                assert!(count >= 2, "kmer {} below dmin survived", kmer);
            }
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn test_low_quality_masking_suppresses_hi_q_votes() -> Result<()> {
        run_spmd(1, |ctx| {
            let cfg = test_cfg(1);
            let mut dht = KmerDht::<1>::new(&ctx, 5, 5, 100, &cfg)?;
            let mut bank = PackedReads::new(33);
            // last base is low quality ('#' is phred 2)
            bank.add_read(1, b"AAACCCT", b"IIIIII#").unwrap();
            analyze_kmers(&ctx, &mut dht, &mut bank, &Contigs::new(), &cfg)?;
            // AACCC has right neighbor 'T' at the masked position
            let (canon, _) = crate::kmer::Kmer::<1>::from_seq(b"AACCC")?.canonical();
            let (hi, total) = dht
                .with_local_kmer(&canon, |kc| {
                    (kc.right_votes.hi_q.get(b'T'), kc.right_votes.total.get(b'T'))
                })
                .expect("kmer must exist");
            assert_eq!(hi, 0);
            assert_eq!(total, 1);
            Ok(())
        })?;
        Ok(())
    }
}
