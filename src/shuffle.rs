//! Read shuffling: relocate each read pair to the rank that owns the
//! contig it most likely extends, so downstream per-contig work finds its
//! reads locally.
//!
//! Four steps, each ending at a barrier: build a seed-k-mer to contig-id
//! map from the contigs, map read pairs to contig ids by sampling their
//! seed k-mers, assign every mapped pair a destination slot through one
//! global fetch-add counter, then move the pairs. Unmapped pairs go to a
//! uniformly random rank. The k-mer to cid map is first-writer-wins per
//! key; any consistent winner is acceptable.

use ahash::AHashMap;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contigs::Contigs;
use crate::fabric::aggr_store::AggrStore;
use crate::fabric::RankCtx;
use crate::kmer::{get_kmers, Kmer};
use crate::reads::{PackedRead, PackedReads};
use crate::utils::perc_str;

/// Seed k-mer length for read-to-contig mapping. Short enough to fit one
/// packed word, long enough to be specific.
pub const SHUFFLE_KMER_LEN: usize = 17;

/// Sample every Nth k-mer of a read when looking up contig ids.
const READ_KMER_STRIDE: usize = 32;

type ShardVec<T> = Arc<Vec<Mutex<T>>>;

fn share_shards<T: Default + Send + Sync + 'static>(ctx: &RankCtx) -> Result<ShardVec<T>> {
    let n = ctx.rank_n();
    ctx.share(|| Ok((0..n).map(|_| Mutex::new(T::default())).collect::<Vec<_>>()))
}

fn target_rank_of_id(ctx: &RankCtx, id: i64) -> usize {
    (fxhash::hash64(&id) % ctx.rank_n() as u64) as usize
}

fn kmer_home(ctx: &RankCtx, kmer: &Kmer<1>) -> usize {
    (kmer.hash64() % ctx.rank_n() as u64) as usize
}

/// Step 1: seed k-mer to contig id, first writer wins.
fn compute_kmer_to_cid_map(
    ctx: &RankCtx,
    ctgs: &Contigs,
) -> Result<ShardVec<AHashMap<Kmer<1>, i64>>> {
    let shards = share_shards::<AHashMap<Kmer<1>, i64>>(ctx)?;
    let mut store = AggrStore::<(Kmer<1>, i64)>::new(ctx);
    let shards_dest = Arc::clone(&shards);
    store.set_update_func(Arc::new(move |target, (kmer, cid)| {
        shards_dest[target].lock().entry(kmer).or_insert(cid);
        Ok(())
    }));
    store.set_size("kmer cid store", 16 * 1024 * 1024);
    for ctg in ctgs.iter() {
        for (_, kmer) in get_kmers::<1>(ctg.seq.as_bytes(), SHUFFLE_KMER_LEN) {
            let (canon, _) = kmer.canonical();
            store.update(kmer_home(ctx, &canon), (canon, ctg.id))?;
        }
    }
    store.flush_updates()?;
    ctx.barrier()?;
    Ok(shards)
}

/// Step 2: contig id to the read pairs that seed onto it.
fn compute_cid_to_reads_map(
    ctx: &RankCtx,
    reads: &PackedReads,
    kmer_to_cid: &ShardVec<AHashMap<Kmer<1>, i64>>,
    num_ctgs: usize,
) -> Result<ShardVec<AHashMap<i64, Vec<i64>>>> {
    let shards = share_shards::<AHashMap<i64, Vec<i64>>>(ctx)?;
    shards[ctx.rank_me()].lock().reserve(num_ctgs);
    let mut store = AggrStore::<(i64, i64)>::new(ctx);
    let shards_dest = Arc::clone(&shards);
    store.set_update_func(Arc::new(move |target, (cid, read_id)| {
        shards_dest[target].lock().entry(cid).or_default().push(read_id);
        Ok(())
    }));
    store.set_size("cid reads store", 16 * 1024 * 1024);
    let qual_offset = reads.get_qual_offset();
    let num_local = reads.get_local_num_reads();
    if num_local % 2 != 0 {
        bail!("read bank holds {} reads, not a whole number of pairs", num_local);
    }
    for i in (0..num_local).step_by(2) {
        let read1 = reads.get(i);
        let read2 = reads.get(i + 1);
        if read1.id() != -read2.id() {
            bail!(
                "mismatched pair ids {} and {} at bank indices {} and {}",
                read1.id(),
                read2.id(),
                i,
                i + 1
            );
        }
        let read_id = read1.id().abs();
        for read in [read1, read2] {
            let (seq, _) = read.unpack(qual_offset);
            if seq.len() < SHUFFLE_KMER_LEN {
                continue;
            }
            let kmers = get_kmers::<1>(&seq, SHUFFLE_KMER_LEN);
            for (_, kmer) in kmers.iter().step_by(READ_KMER_STRIDE) {
                let (canon, _) = kmer.canonical();
                let home = kmer_home(ctx, &canon);
                let cid = { kmer_to_cid[home].lock().get(&canon).copied() };
                if let Some(cid) = cid {
                    store.update(target_rank_of_id(ctx, cid), (cid, read_id))?;
                }
            }
        }
    }
    store.flush_updates()?;
    ctx.barrier()?;
    Ok(shards)
}

/// Step 3: pick a destination rank for every mapped pair by claiming a
/// contiguous slot range off the global counter.
fn compute_read_locations(
    ctx: &RankCtx,
    cid_to_reads: &ShardVec<AHashMap<i64, Vec<i64>>>,
    all_num_reads: i64,
) -> Result<ShardVec<AHashMap<i64, u32>>> {
    let num_mapped: i64 =
        cid_to_reads[ctx.rank_me()].lock().values().map(|v| v.len() as i64 * 2).sum();
    let all_num_mapped = ctx.reduce(num_mapped, |a, b| a + b)?;
    let max_num_mapped = ctx.reduce(num_mapped, |a, b| a.max(b))?;
    if ctx.rank_me() == 0 && max_num_mapped > 0 {
        info!(
            "Mapped reads per rank: avg {} max {} (balance {:.3})",
            all_num_mapped / ctx.rank_n() as i64,
            max_num_mapped,
            all_num_mapped as f64 / ctx.rank_n() as f64 / max_num_mapped as f64
        );
    }
    let shards = share_shards::<AHashMap<i64, u32>>(ctx)?;
    if all_num_mapped == 0 {
        ctx.barrier()?;
        return Ok(shards);
    }
    ctx.reset_global_counter()?;
    let mut read_slot = ctx.fetch_add_global(num_mapped);
    let block = (all_num_mapped + ctx.rank_n() as i64 - 1) / ctx.rank_n() as i64;
    let mut store = AggrStore::<(i64, u32)>::new(ctx);
    let shards_dest = Arc::clone(&shards);
    store.set_update_func(Arc::new(move |target, (read_id, dest)| {
        shards_dest[target].lock().insert(read_id, dest);
        Ok(())
    }));
    store.set_size("read location store", 16 * 1024 * 1024);
    // holding this shard's lock is safe: destination shards are only ever
    // locked transiently by the update function
    let my_map = cid_to_reads[ctx.rank_me()].lock();
    for read_ids in my_map.values() {
        for &read_id in read_ids {
            store.update(
                target_rank_of_id(ctx, read_id),
                (read_id, (read_slot / block) as u32),
            )?;
            // each slot entry covers a pair
            read_slot += 2;
        }
    }
    drop(my_map);
    store.flush_updates()?;
    ctx.barrier()?;
    let mapped_pairs = ctx.reduce(shards[ctx.rank_me()].lock().len() as i64, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!(
            "Read pairs mapping to contigs: {}",
            perc_str(mapped_pairs, all_num_reads / 2)
        );
    }
    Ok(shards)
}

/// Step 4: move every pair to its destination rank, both mates together.
fn move_reads_to_targets(
    ctx: &RankCtx,
    reads: &PackedReads,
    read_to_target: &ShardVec<AHashMap<i64, u32>>,
) -> Result<Vec<PackedRead>> {
    let new_banks = share_shards::<Vec<PackedRead>>(ctx)?;
    let mut store = AggrStore::<(PackedRead, PackedRead)>::new(ctx);
    let banks_dest = Arc::clone(&new_banks);
    store.set_update_func(Arc::new(move |target, (read1, read2)| {
        let mut bank = banks_dest[target].lock();
        bank.push(read1);
        bank.push(read2);
        Ok(())
    }));
    store.set_size("read seq store", 32 * 1024 * 1024);
    let mut num_not_found: i64 = 0;
    for i in (0..reads.get_local_num_reads()).step_by(2) {
        let read1 = reads.get(i);
        let read2 = reads.get(i + 1);
        let read_id = read1.id().abs();
        let home = target_rank_of_id(ctx, read_id);
        let target = { read_to_target[home].lock().get(&read_id).copied() };
        let target = match target {
            Some(t) => t as usize,
            None => {
                num_not_found += 1;
                fastrand::usize(0..ctx.rank_n())
            }
        };
        store.update(target, (read1.clone(), read2.clone()))?;
    }
    store.flush_updates()?;
    ctx.barrier()?;
    let all_not_found = ctx.reduce(num_not_found, |a, b| a + b)?;
    let all_pairs = ctx.reduce(reads.get_local_num_reads() as i64 / 2, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!(
            "No contig destination for {} pairs, placed randomly",
            perc_str(all_not_found, all_pairs)
        );
    }
    let mine = std::mem::take(&mut *new_banks[ctx.rank_me()].lock());
    ctx.barrier()?;
    Ok(mine)
}

/// Relocate every read pair to the rank owning its best-seeded contig and
/// replace the bank in place.
pub fn shuffle_reads(ctx: &RankCtx, reads: &mut PackedReads, ctgs: &Contigs) -> Result<()> {
    let qual_offset = reads.get_qual_offset();
    let all_num_reads = ctx.reduce(reads.get_local_num_reads() as i64, |a, b| a + b)?;

    let kmer_to_cid = compute_kmer_to_cid_map(ctx, ctgs)?;
    let cid_to_reads = compute_cid_to_reads_map(ctx, reads, &kmer_to_cid, ctgs.len())?;
    let read_to_target = compute_read_locations(ctx, &cid_to_reads, all_num_reads)?;
    let new_reads = move_reads_to_targets(ctx, reads, &read_to_target)?;

    *reads = PackedReads::from_reads(qual_offset, new_reads);
    reads.report_balance(ctx, "After shuffle")?;
    let all_new_reads = ctx.reduce(reads.get_local_num_reads() as i64, |a, b| a + b)?;
    if all_new_reads != all_num_reads && ctx.rank_me() == 0 {
        warn!(
            "Not all reads shuffled, expected {} but moved {}",
            all_num_reads, all_new_reads
        );
    }
    ctx.barrier()
}
