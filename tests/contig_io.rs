//! Contig FASTA dump and byte-range partitioned load.

use anyhow::Result;
use contig_forge::contigs::{Contig, Contigs};
use contig_forge::fabric::run_spmd;

fn random_dna(len: usize, seed: u64) -> String {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| ['A', 'C', 'G', 'T'][rng.usize(0..4)]).collect()
}

#[test]
fn dump_then_load_is_bag_equal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ctgs.fasta");
    run_spmd(3, |ctx| {
        let mut ctgs = Contigs::new();
        // globally unique ids, varied lengths so the byte partition is uneven
        for i in 0..5i64 {
            let id = ctx.rank_me() as i64 * 5 + i;
            ctgs.add(Contig {
                id,
                seq: random_dna(20 + (id as usize * 13) % 200, id as u64),
                depth: 1.5 + id as f64,
            });
        }
        ctgs.dump(&ctx, &path, 0)?;

        let mut loaded = Contigs::new();
        loaded.load(&ctx, &path)?;
        // every record is read by exactly one rank
        let mine: Vec<(i64, String, String)> = loaded
            .iter()
            .map(|c| (c.id, c.seq.clone(), format!("{}", c.depth)))
            .collect();
        let gathered = ctx.all_gather(mine)?;
        let mut all: Vec<(i64, String, String)> = gathered.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all.len(), 15, "dump/load must preserve the record count");
        for (i, (id, seq, depth)) in all.iter().enumerate() {
            assert_eq!(*id, i as i64);
            assert_eq!(seq, &random_dna(20 + (*id as usize * 13) % 200, *id as u64));
            assert_eq!(depth, &format!("{}", 1.5 + *id as f64));
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn dump_filters_by_min_length() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("filtered.fasta");
    run_spmd(1, |ctx| {
        let mut ctgs = Contigs::new();
        ctgs.add(Contig { id: 0, seq: random_dna(300, 1), depth: 2.0 });
        ctgs.add(Contig { id: 1, seq: random_dna(30, 2), depth: 2.0 });
        ctgs.dump(&ctx, &path, 100)?;
        let mut loaded = Contigs::new();
        loaded.load(&ctx, &path)?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.iter().next().unwrap().id, 0);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn load_with_more_ranks_than_records_is_clean() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sparse.fasta");
    run_spmd(4, |ctx| {
        let mut ctgs = Contigs::new();
        if ctx.rank_me() == 0 {
            ctgs.add(Contig { id: 0, seq: random_dna(500, 9), depth: 3.0 });
        }
        ctgs.dump(&ctx, &path, 0)?;
        let mut loaded = Contigs::new();
        loaded.load(&ctx, &path)?;
        let total = ctx.reduce(loaded.len(), |a, b| a + b)?;
        assert_eq!(total, 1, "the single record must be read exactly once");
        Ok(())
    })?;
    Ok(())
}
