//! End-to-end contigging scenarios on a single rank: straight lines,
//! forks, cycles and multi-round contig extension.

use anyhow::Result;
use contig_forge::config::AssemblerConfig;
use contig_forge::contigs::{Contig, Contigs};
use contig_forge::fabric::{run_spmd, RankCtx};
use contig_forge::kcount::analyze_kmers;
use contig_forge::kmer::get_kmers;
use contig_forge::kmer_dht::KmerDht;
use contig_forge::reads::PackedReads;
use contig_forge::traversal::traverse_debruijn_graph;
use contig_forge::utils::revcomp_str;

fn scenario_cfg(k: usize) -> AssemblerConfig {
    AssemblerConfig { kmer_lens: vec![k], dmin_thres: 1, ..Default::default() }
}

fn bank_of(reads: &[&str]) -> PackedReads {
    let mut bank = PackedReads::new(33);
    for (i, seq) in reads.iter().enumerate() {
        let quals = vec![b'I'; seq.len()];
        bank.add_read(i as i64 + 1, seq.as_bytes(), &quals).unwrap();
    }
    bank
}

/// Run one full round (count + finalize + traverse) on one rank.
fn assemble_round<const W: usize>(
    ctx: &RankCtx,
    k: usize,
    reads: &[&str],
    prev_ctgs: &Contigs,
    dmin: u16,
) -> Result<(KmerDht<W>, Contigs)> {
    let cfg = AssemblerConfig { dmin_thres: dmin, ..scenario_cfg(k) };
    let mut dht = KmerDht::<W>::new(ctx, k, k.min(15), 10_000, &cfg)?;
    let mut bank = bank_of(reads);
    analyze_kmers(ctx, &mut dht, &mut bank, prev_ctgs, &cfg)?;
    let mut ctgs = Contigs::new();
    traverse_debruijn_graph(ctx, &dht, &mut ctgs)?;
    Ok((dht, ctgs))
}

/// Orientation-insensitive comparison.
fn matches_either_strand(seq: &str, expected: &str) -> bool {
    seq == expected || revcomp_str(seq) == expected
}

#[test]
fn straight_line_read_reassembles_exactly() -> Result<()> {
    run_spmd(1, |ctx| {
        let read = "AAACCCTTTGGG";
        let (dht, ctgs) = assemble_round::<1>(&ctx, 5, &[read], &Contigs::new(), 1)?;
        assert_eq!(ctgs.len(), 1, "expected a single uutig");
        let uutig = &ctgs.iter().next().unwrap().seq;
        assert!(
            matches_either_strand(uutig, read),
            "uutig {uutig} does not match read {read}"
        );
        // every k-mer of the emitted uutig must be present in the index
        for (_, kmer) in get_kmers::<1>(uutig.as_bytes(), 5) {
            assert!(dht.kmer_exists(&kmer));
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn fork_produces_two_uutigs_with_shared_prefix() -> Result<()> {
    run_spmd(1, |ctx| {
        let (_, ctgs) = assemble_round::<1>(&ctx, 3, &["AAACCC", "AAACGG"], &Contigs::new(), 1)?;
        assert_eq!(ctgs.len(), 2, "expected two uutigs branching at the fork");
        let mut seqs: Vec<String> = ctgs
            .iter()
            .map(|c| {
                let rc = revcomp_str(&c.seq);
                if c.seq < rc { c.seq.clone() } else { rc }
            })
            .collect();
        seqs.sort();
        assert_eq!(seqs, vec!["AACCC".to_string(), "AACGG".to_string()]);
        // the two walks stop at the fork k-mer, sharing its prefix
        assert!(seqs[0][..3] == seqs[1][..3]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn cycle_terminates_with_one_bounded_uutig() -> Result<()> {
    run_spmd(1, |ctx| {
        let read = "ACGTACGTACGT";
        let (_, ctgs) = assemble_round::<1>(&ctx, 4, &[read], &Contigs::new(), 1)?;
        assert_eq!(ctgs.len(), 1, "a cycle must emit exactly one uutig");
        let uutig = &ctgs.iter().next().unwrap().seq;
        assert!(uutig.len() >= 4 && uutig.len() <= read.len());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn contig_ids_are_gapless_from_zero() -> Result<()> {
    run_spmd(1, |ctx| {
        let (_, ctgs) = assemble_round::<1>(&ctx, 3, &["AAACCC", "AAACGG"], &Contigs::new(), 1)?;
        let mut ids: Vec<i64> = ctgs.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..ctgs.len() as i64).collect::<Vec<_>>());
        Ok(())
    })?;
    Ok(())
}

fn random_dna(len: usize, seed: u64) -> String {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| ['A', 'C', 'G', 'T'][rng.usize(0..4)]).collect()
}

#[test]
fn contig_kmers_extend_previous_round() -> Result<()> {
    run_spmd(1, |ctx| {
        // round 1 produced a 40 bp contig; round 2 reads extend it by 10
        let c1 = random_dna(40, 17);
        let extension = random_dna(10, 99);
        let extended = format!("{c1}{extension}");
        let mut prev = Contigs::new();
        prev.add(Contig { id: 0, seq: c1.clone(), depth: 2.0 });

        let k = 33;
        // reads cover the junction and the new bases
        let read = &extended[extended.len() - 43..];
        let (_, ctgs) = assemble_round::<2>(&ctx, k, &[read, read], &prev, 1)?;

        let best = ctgs
            .iter()
            .max_by_key(|c| c.seq.len())
            .expect("round 2 must emit at least one contig");
        assert!(
            best.seq.len() >= 50,
            "expected an extended contig, got {} bp",
            best.seq.len()
        );
        assert!(
            best.seq.starts_with(&c1) || revcomp_str(&best.seq).starts_with(&c1),
            "extended contig does not begin with the previous round's contig"
        );
        Ok(())
    })?;
    Ok(())
}

#[test]
fn short_read_and_short_contig_are_skipped_quietly() -> Result<()> {
    run_spmd(1, |ctx| {
        let mut prev = Contigs::new();
        // below k + 2, contributes no contig k-mers
        prev.add(Contig { id: 0, seq: "ACGTACG".into(), depth: 1.0 });
        let (dht, ctgs) = assemble_round::<1>(&ctx, 7, &["ACGTA"], &prev, 1)?;
        assert_eq!(dht.get_local_num_kmers(), 0);
        assert_eq!(ctgs.len(), 0);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn two_round_driver_preserves_assembly() -> Result<()> {
    use contig_forge::contigging::contigging;
    let dir = tempfile::tempdir()?;
    run_spmd(1, |ctx| {
        let cfg = AssemblerConfig {
            kmer_lens: vec![5, 7],
            dmin_thres: 1,
            checkpoint: true,
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let read = "AAACCCTTTGGG";
        let mut bank = bank_of(&[read, read]);
        let mut ctgs = Contigs::new();
        contigging(&ctx, &cfg, &mut bank, &mut ctgs)?;
        assert_eq!(ctgs.len(), 1);
        let seq = &ctgs.iter().next().unwrap().seq;
        assert!(matches_either_strand(seq, read));
        assert!(dir.path().join("contigs-5.fasta").exists());
        assert!(dir.path().join("contigs-7.fasta").exists());
        Ok(())
    })?;
    Ok(())
}
