//! Multi-rank behavior: cross-rank fragment bridging, link reciprocity
//! pruning and read shuffling.

use anyhow::Result;
use contig_forge::config::AssemblerConfig;
use contig_forge::contigs::{Contig, Contigs};
use contig_forge::fabric::run_spmd;
use contig_forge::kcount::analyze_kmers;
use contig_forge::kmer_dht::{FragPtr, KmerDht};
use contig_forge::reads::PackedReads;
use contig_forge::shuffle::shuffle_reads;
use contig_forge::traversal::{clean_frag_links, new_frag_arena, traverse_debruijn_graph, FragElem};
use contig_forge::utils::revcomp_str;

fn random_dna(len: usize, seed: u64) -> String {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| ['A', 'C', 'G', 'T'][rng.usize(0..4)]).collect()
}

/// A uutig whose k-mers are homed on different ranks must come out as one
/// contig: the fragments bridge across ranks, link cleaning keeps the
/// bridge, and exactly one rank's connection walk survives the tie break.
#[test]
fn cross_rank_fragments_connect_to_one_contig() -> Result<()> {
    let genome = random_dna(60, 7);
    let genome_c = genome.clone();
    run_spmd(2, move |ctx| {
        let cfg = AssemblerConfig { kmer_lens: vec![21], dmin_thres: 1, ..Default::default() };
        let mut dht = KmerDht::<1>::new(&ctx, 21, 15, 1000, &cfg)?;
        // rank 0 holds the reads, homes spread the k-mers across both ranks
        let mut bank = PackedReads::new(33);
        if ctx.rank_me() == 0 {
            let quals = vec![b'I'; genome_c.len()];
            bank.add_read(1, genome_c.as_bytes(), &quals)?;
        }
        analyze_kmers(&ctx, &mut dht, &mut bank, &Contigs::new(), &cfg)?;
        let mut ctgs = Contigs::new();
        traverse_debruijn_graph(&ctx, &dht, &mut ctgs)?;

        let total = ctx.reduce(ctgs.len(), |a, b| a + b)?;
        assert_eq!(total, 1, "fragment chain must emit exactly one contig");
        let seqs = ctx.all_gather(ctgs.iter().next().map(|c| c.seq.clone()))?;
        let seq = seqs.into_iter().flatten().next().expect("one rank emitted the contig");
        assert!(
            seq == genome_c || revcomp_str(&seq) == genome_c,
            "assembled {seq} does not match the genome"
        );
        Ok(())
    })?;
    Ok(())
}

/// Non-reciprocating links are cleared on the claiming side only: if A
/// names B as right neighbor but B's left neighbor is C, cleaning drops
/// A's claim and leaves B's link to C alone.
#[test]
fn non_reciprocal_link_is_pruned() -> Result<()> {
    run_spmd(1, |ctx| {
        let k = 5;
        let arena = new_frag_arena(&ctx)?;
        let a = FragPtr { owner: 0, idx: 0 };
        let b = FragPtr { owner: 0, idx: 1 };
        let c = FragPtr { owner: 0, idx: 2 };
        {
            let mut frags = arena[0].lock();
            // A overlaps B by k-1 but B reciprocates toward C
            frags.push(FragElem {
                right: Some(b),
                seq: "AAAACCCC".into(),
                sum_depths: 8,
                ..Default::default()
            });
            frags.push(FragElem {
                left: Some(c),
                seq: "CCCCGGGG".into(),
                sum_depths: 8,
                ..Default::default()
            });
            frags.push(FragElem {
                right: Some(b),
                seq: "TTTTCCCC".into(),
                sum_depths: 8,
                ..Default::default()
            });
        }
        clean_frag_links(&ctx, k, &arena)?;
        let frags = arena[0].lock();
        assert_eq!(frags[a.idx as usize].right, None, "A's non-reciprocated link must drop");
        assert_eq!(frags[b.idx as usize].left, Some(c), "B's reciprocated link must survive");
        assert_eq!(frags[c.idx as usize].right, Some(b));
        Ok(())
    })?;
    Ok(())
}

/// Shuffling preserves the global read count and keeps pairs adjacent.
#[test]
fn shuffle_preserves_pairs_and_counts() -> Result<()> {
    run_spmd(2, |ctx| {
        // two well-separated contigs and reads drawn from each
        let ctg_a = random_dna(60, 3);
        let ctg_b = random_dna(60, 4);
        let mut ctgs = Contigs::new();
        if ctx.rank_me() == 0 {
            ctgs.add(Contig { id: 0, seq: ctg_a.clone(), depth: 2.0 });
        } else {
            ctgs.add(Contig { id: 1, seq: ctg_b.clone(), depth: 2.0 });
        }
        let mut bank = PackedReads::new(33);
        let sources = [&ctg_a, &ctg_b];
        for pair in 0..10i64 {
            let src = sources[(pair % 2) as usize];
            let offset = (pair as usize * 3) % 20;
            let r1 = &src[offset..offset + 30];
            let r2 = &src[offset + 10..offset + 40];
            let id = ctx.rank_me() as i64 * 100 + pair + 1;
            bank.add_read(id, r1.as_bytes(), &vec![b'I'; 30])?;
            bank.add_read(-id, r2.as_bytes(), &vec![b'I'; 30])?;
        }
        let before = ctx.reduce(bank.get_local_num_reads() as i64, |a, b| a + b)?;
        shuffle_reads(&ctx, &mut bank, &ctgs)?;
        let after = ctx.reduce(bank.get_local_num_reads() as i64, |a, b| a + b)?;
        assert_eq!(before, after, "shuffle must move every read exactly once");
        // pairs stay adjacent with matched ids
        assert_eq!(bank.get_local_num_reads() % 2, 0);
        for i in (0..bank.get_local_num_reads()).step_by(2) {
            assert_eq!(bank.get(i).id(), -bank.get(i + 1).id());
        }
        Ok(())
    })?;
    Ok(())
}

/// The whole pipeline still works with one rank and no cross-rank traffic.
#[test]
fn single_rank_end_to_end() -> Result<()> {
    let genome = random_dna(80, 11);
    let genome_c = genome.clone();
    run_spmd(1, move |ctx| {
        let cfg = AssemblerConfig { kmer_lens: vec![21], dmin_thres: 1, ..Default::default() };
        let mut dht = KmerDht::<1>::new(&ctx, 21, 15, 1000, &cfg)?;
        let mut bank = PackedReads::new(33);
        let quals = vec![b'I'; genome_c.len()];
        bank.add_read(1, genome_c.as_bytes(), &quals)?;
        bank.add_read(-1, genome_c.as_bytes(), &quals)?;
        analyze_kmers(&ctx, &mut dht, &mut bank, &Contigs::new(), &cfg)?;
        let mut ctgs = Contigs::new();
        traverse_debruijn_graph(&ctx, &dht, &mut ctgs)?;
        assert_eq!(ctgs.len(), 1);
        let seq = &ctgs.iter().next().unwrap().seq;
        assert!(seq == &genome_c || revcomp_str(seq) == genome_c);
        Ok(())
    })?;
    Ok(())
}
