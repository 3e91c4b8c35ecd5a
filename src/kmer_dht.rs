//! Distributed k-mer hash table.
//!
//! A sharded map from canonical k-mer to `KmerCounts`. Every canonical
//! k-mer has one home rank, chosen by its minimizer hash, and only that
//! rank's shard ever stores it. Updates flow through an aggregated update
//! store and are applied under the home shard's lock; lookups either hit
//! the local shard or take the same lock remotely.
//!
//! Lifecycle per contigging round: accumulate read k-mers, accumulate
//! contig k-mers into a separate sub-store, finalize (`finish_updates`,
//! which prunes below the depth threshold and fixes `left`/`right`
//! extensions), then serve the frozen table to the traversal engine.

use ahash::AHashMap;
use anyhow::Result;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AssemblerConfig;
use crate::fabric::aggr_store::AggrStore;
use crate::fabric::RankCtx;
use crate::kmer::{get_kmers, Kmer};
use crate::utils::{comp_base, perc_str};

/// Ratings at or below this never produce a base extension.
pub const EXT_RATING_THRES: u8 = 0;
const MIN_VIABLE_FRAC: f64 = 0.2;
const MIN_EXPECTED_FRAC: f64 = 0.5;

/// How many combined updates the heavy-hitters cache holds before draining.
const HH_CACHE_MAX: usize = 32 * 1024;

/// Global pointer to a uutig fragment: owning rank plus arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragPtr {
    pub owner: u32,
    pub idx: u32,
}

/// Per-base vote tally, saturating at 16 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtCounts {
    counts: [u16; 4],
}

impl ExtCounts {
    fn inc(&mut self, base: u8, n: u16) {
        let slot = match base {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => return,
        };
        self.counts[slot] = self.counts[slot].saturating_add(n);
    }

    pub fn get(&self, base: u8) -> u16 {
        match base {
            b'A' => self.counts[0],
            b'C' => self.counts[1],
            b'G' => self.counts[2],
            b'T' => self.counts[3],
            _ => 0,
        }
    }

    fn merge(&mut self, other: &ExtCounts) {
        for i in 0..4 {
            self.counts[i] = self.counts[i].saturating_add(other.counts[i]);
        }
    }
}

/// Votes for one side of a k-mer: all votes plus the high-quality subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtVotes {
    pub total: ExtCounts,
    pub hi_q: ExtCounts,
}

impl ExtVotes {
    /// Record one vote. A lowercase base is a low-quality position and
    /// counts only toward the total tally.
    pub fn add(&mut self, raw_base: u8, weight: u16) {
        let upper = raw_base.to_ascii_uppercase();
        self.total.inc(upper, weight);
        if !raw_base.is_ascii_lowercase() {
            self.hi_q.inc(upper, weight);
        }
    }

    fn merge(&mut self, other: &ExtVotes) {
        self.total.merge(&other.total);
        self.hi_q.merge(&other.hi_q);
    }
}

/// Value stored per canonical k-mer.
#[derive(Debug, Clone, Default)]
pub struct KmerCounts {
    pub count: u16,
    /// Finalized extensions: A/C/G/T, 'F' for a fork, 'X' for a dead end.
    pub left: u8,
    pub right: u8,
    /// Set at most once per traversal round by the first walk to claim
    /// this k-mer.
    pub uutig_frag: Option<FragPtr>,
    pub left_votes: ExtVotes,
    pub right_votes: ExtVotes,
}

/// One routed update record. Carries full vote tallies so repeated updates
/// to the same k-mer can be combined before they travel.
#[derive(Debug, Clone)]
pub struct KmerUpdate<const W: usize> {
    pub kmer: Kmer<W>,
    pub count: u16,
    pub left: ExtVotes,
    pub right: ExtVotes,
    pub from_ctg: bool,
}

impl<const W: usize> KmerUpdate<W> {
    fn single(kmer: Kmer<W>, left_raw: u8, right_raw: u8, weight: u16, from_ctg: bool) -> Self {
        let mut left = ExtVotes::default();
        let mut right = ExtVotes::default();
        if left_raw != 0 {
            left.add(left_raw, weight);
        }
        if right_raw != 0 {
            right.add(right_raw, weight);
        }
        Self { kmer, count: weight, left, right, from_ctg }
    }

    fn merge(&mut self, other: &KmerUpdate<W>) {
        self.count = self.count.saturating_add(other.count);
        self.left.merge(&other.left);
        self.right.merge(&other.right);
    }
}

#[derive(Default)]
pub struct KmerShard<const W: usize> {
    pub kmers: AHashMap<Kmer<W>, KmerCounts>,
    pub ctg_kmers: AHashMap<Kmer<W>, KmerCounts>,
}

pub struct FinishStats {
    pub num_kmers: usize,
    pub num_purged: usize,
    pub num_ctg_kmers_added: usize,
    pub num_ctg_merged: usize,
}

pub struct KmerDht<const W: usize> {
    ctx: RankCtx,
    kmer_len: usize,
    minimizer_len: usize,
    shards: Arc<Vec<Mutex<KmerShard<W>>>>,
    store: AggrStore<KmerUpdate<W>>,
    /// Local combining cache for hot k-mers (`use_heavy_hitters`).
    hh_cache: Option<AHashMap<Kmer<W>, KmerUpdate<W>>>,
    /// First-occurrence filter (`use_qf`): singleton updates are deferred
    /// and promoted on the second local sighting. The first sighting's
    /// extension votes are sacrificed, which only matters for k-mers that
    /// would be pruned as sub-threshold anyway.
    singleton_filter: Option<AHashMap<Kmer<W>, bool>>,
}

impl<const W: usize> KmerDht<W> {
    pub fn new(
        ctx: &RankCtx,
        kmer_len: usize,
        minimizer_len: usize,
        initial_capacity: usize,
        cfg: &AssemblerConfig,
    ) -> Result<Self> {
        let n_ranks = ctx.rank_n();
        let shards = ctx.share(|| {
            Ok((0..n_ranks)
                .map(|_| {
                    Mutex::new(KmerShard {
                        kmers: AHashMap::with_capacity(initial_capacity),
                        ctg_kmers: AHashMap::new(),
                    })
                })
                .collect::<Vec<_>>())
        })?;

        let mut store = AggrStore::new(ctx);
        let shards_dest = Arc::clone(&shards);
        store.set_update_func(Arc::new(move |target, up: KmerUpdate<W>| {
            let mut shard = shards_dest[target].lock();
            let map = if up.from_ctg { &mut shard.ctg_kmers } else { &mut shard.kmers };
            let entry = map.entry(up.kmer).or_default();
            entry.count = entry.count.saturating_add(up.count);
            entry.left_votes.merge(&up.left);
            entry.right_votes.merge(&up.right);
            Ok(())
        }));
        store.set_size("kmer store", cfg.kmer_store_bytes());

        debug!(
            "KmerDht k={} minimizer={} capacity={} per rank",
            kmer_len, minimizer_len, initial_capacity
        );
        Ok(Self {
            ctx: ctx.clone(),
            kmer_len,
            minimizer_len,
            shards,
            store,
            hh_cache: cfg.use_heavy_hitters.then(AHashMap::new),
            singleton_filter: cfg.use_qf.then(AHashMap::new),
        })
    }

    pub fn kmer_len(&self) -> usize {
        self.kmer_len
    }

    pub fn rank_me(&self) -> usize {
        self.ctx.rank_me()
    }

    pub fn minimizer_len(&self) -> usize {
        self.minimizer_len
    }

    /// Home rank of a canonical k-mer.
    pub fn home_of(&self, canonical: &Kmer<W>) -> usize {
        (canonical.minimizer_hash(self.minimizer_len) % self.ctx.rank_n() as u64) as usize
    }

    pub(crate) fn lock_shard(&self, rank: usize) -> MutexGuard<'_, KmerShard<W>> {
        self.shards[rank].lock()
    }

    /// Add every k-mer of `seq` with one occurrence vote of `weight` and
    /// extension votes from the flanking bases. Lowercase flanking bases
    /// vote low-quality only; 'N' neighbors do not vote at all.
    pub fn add_seq_kmers(&mut self, seq: &[u8], weight: u16, from_ctg: bool) -> Result<()> {
        let k = self.kmer_len;
        for (pos, kmer) in get_kmers::<W>(seq, k) {
            let left_raw = if pos > 0 { vote_base(seq[pos - 1]) } else { 0 };
            let right_raw = if pos + k < seq.len() { vote_base(seq[pos + k]) } else { 0 };
            let (canon, is_rc) = kmer.canonical();
            // votes are stored in canonical orientation
            let (left, right) = if is_rc {
                (comp_vote(right_raw), comp_vote(left_raw))
            } else {
                (left_raw, right_raw)
            };
            self.route_update(KmerUpdate::single(canon, left, right, weight, from_ctg))?;
        }
        Ok(())
    }

    fn route_update(&mut self, mut up: KmerUpdate<W>) -> Result<()> {
        use std::collections::hash_map::Entry;
        if !up.from_ctg && up.count == 1 {
            if let Some(filter) = &mut self.singleton_filter {
                match filter.entry(up.kmer) {
                    Entry::Occupied(mut e) => {
                        if !*e.get() {
                            // second sighting: promote, restoring the
                            // deferred occurrence
                            *e.get_mut() = true;
                            up.count = 2;
                        }
                    }
                    Entry::Vacant(e) => {
                        e.insert(false);
                        return Ok(());
                    }
                }
            }
        }
        if self.hh_cache.is_some() {
            let cache_len = {
                let cache = self.hh_cache.as_mut().expect("cache checked above");
                match cache.entry(up.kmer) {
                    Entry::Occupied(mut e) => e.get_mut().merge(&up),
                    Entry::Vacant(e) => {
                        e.insert(up);
                    }
                }
                cache.len()
            };
            if cache_len >= HH_CACHE_MAX {
                self.drain_hh_cache()?;
            }
            return Ok(());
        }
        let target = self.home_of(&up.kmer);
        self.store.update(target, up)
    }

    fn drain_hh_cache(&mut self) -> Result<()> {
        let pending: Vec<KmerUpdate<W>> = match &mut self.hh_cache {
            Some(cache) => cache.drain().map(|(_, up)| up).collect(),
            None => return Ok(()),
        };
        for up in pending {
            let target = self.home_of(&up.kmer);
            self.store.update(target, up)?;
        }
        Ok(())
    }

    /// Drain all buffered updates and synchronize. After this returns, all
    /// updates enqueued anywhere before the call are visible.
    pub fn flush_updates(&mut self) -> Result<()> {
        self.drain_hh_cache()?;
        self.store.flush_updates()?;
        self.ctx.barrier()
    }

    /// Reserve space in the contig k-mer sub-store.
    pub fn init_ctg_kmers(&mut self, capacity: usize) {
        self.shards[self.ctx.rank_me()].lock().ctg_kmers.reserve(capacity);
    }

    /// Finalize the local shard: prune sub-threshold k-mers, fold the
    /// contig sub-store into the main table, and fix the `left`/`right`
    /// extensions from the accumulated votes. Deterministic: a pure
    /// function of the accumulated tallies.
    pub fn finish_updates(&mut self, dmin_thres: u16) -> Result<FinishStats> {
        self.ctx.barrier()?;
        let stats = {
            let mut shard = self.shards[self.ctx.rank_me()].lock();
            let before = shard.kmers.len();
            shard.kmers.retain(|_, kc| kc.count >= dmin_thres);
            let num_purged = before - shard.kmers.len();
            let ctg_kmers = std::mem::take(&mut shard.ctg_kmers);
            let mut num_ctg_kmers_added = 0;
            let mut num_ctg_merged = 0;
            for (kmer, kc) in ctg_kmers {
                if kc.count < dmin_thres {
                    continue;
                }
                match shard.kmers.entry(kmer) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        // the contig's votes fill in sides no read covers,
                        // e.g. the interior-facing side of a junction k-mer;
                        // counts take the max since contig depth restates
                        // read coverage rather than adding to it
                        let entry = e.get_mut();
                        entry.left_votes.merge(&kc.left_votes);
                        entry.right_votes.merge(&kc.right_votes);
                        entry.count = entry.count.max(kc.count);
                        num_ctg_merged += 1;
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(kc);
                        num_ctg_kmers_added += 1;
                    }
                }
            }
            for kc in shard.kmers.values_mut() {
                kc.left = choose_ext(kc.count, &kc.left_votes);
                kc.right = choose_ext(kc.count, &kc.right_votes);
            }
            FinishStats {
                num_kmers: shard.kmers.len(),
                num_purged,
                num_ctg_kmers_added,
                num_ctg_merged,
            }
        };
        self.ctx.barrier()?;
        Ok(stats)
    }

    pub fn get_local_num_kmers(&self) -> usize {
        self.shards[self.ctx.rank_me()].lock().kmers.len()
    }

    pub fn get_num_kmers(&self) -> Result<usize> {
        self.ctx.reduce(self.get_local_num_kmers(), |a, b| a + b)
    }

    /// Whether a k-mer (in any orientation) is present in the index. May
    /// take the home shard's lock remotely.
    pub fn kmer_exists(&self, kmer: &Kmer<W>) -> bool {
        let (canon, _) = kmer.canonical();
        let home = self.home_of(&canon);
        self.shards[home].lock().kmers.contains_key(&canon)
    }

    /// Snapshot of this rank's canonical k-mer keys, for iteration that
    /// must not hold the shard lock.
    pub fn local_kmer_keys(&self) -> Vec<Kmer<W>> {
        self.shards[self.ctx.rank_me()].lock().kmers.keys().copied().collect()
    }

    /// Run `f` on the local entry for a canonical k-mer, if present.
    pub fn with_local_kmer<R>(
        &self,
        canonical: &Kmer<W>,
        f: impl FnOnce(&mut KmerCounts) -> R,
    ) -> Option<R> {
        let mut shard = self.shards[self.ctx.rank_me()].lock();
        shard.kmers.get_mut(canonical).map(f)
    }

    /// Log aggregate counting statistics.
    pub fn report_counts(&self, stats: &FinishStats) -> Result<()> {
        let all_kmers = self.ctx.reduce(stats.num_kmers as i64, |a, b| a + b)?;
        let all_purged = self.ctx.reduce(stats.num_purged as i64, |a, b| a + b)?;
        let all_ctg = self.ctx.reduce(stats.num_ctg_kmers_added as i64, |a, b| a + b)?;
        let all_merged = self.ctx.reduce(stats.num_ctg_merged as i64, |a, b| a + b)?;
        if self.ctx.rank_me() == 0 {
            info!(
                "📊 K-mer index: {} kmers, purged {}, {} new from contigs, {} merged",
                all_kmers,
                perc_str(all_purged, all_kmers + all_purged),
                all_ctg,
                all_merged
            );
        }
        Ok(())
    }

    /// Release accumulation-side memory once the table is frozen.
    pub fn clear_stores(&mut self) {
        self.store.clear();
        if let Some(cache) = &mut self.hh_cache {
            cache.clear();
        }
        if let Some(filter) = &mut self.singleton_filter {
            filter.clear();
            filter.shrink_to_fit();
        }
    }
}

/// A base eligible to vote, or 0. 'N' and other ambiguity codes do not
/// vote; case is preserved so low-quality votes stay distinguishable.
fn vote_base(b: u8) -> u8 {
    match b {
        b'A' | b'C' | b'G' | b'T' | b'a' | b'c' | b'g' | b't' => b,
        _ => 0,
    }
}

fn comp_vote(b: u8) -> u8 {
    if b == 0 {
        0
    } else {
        comp_base(b)
    }
}

/// Rate one candidate base 0..=7 against the k-mer's aggregate depth.
fn base_rating(nvotes: u16, nvotes_hi_q: u16, depth: u16) -> u8 {
    let min_viable = (MIN_VIABLE_FRAC * depth as f64).max(2.0);
    let min_expected = (MIN_EXPECTED_FRAC * depth as f64).max(2.0);
    let nv = nvotes as f64;
    let hq = nvotes_hi_q as f64;
    if nvotes == 0 {
        0
    } else if nvotes == 1 {
        1
    } else if nv < min_viable {
        2
    } else if nv < min_expected {
        if hq < min_viable {
            3
        } else {
            4
        }
    } else if hq < min_viable {
        5
    } else if min_viable < hq && hq < min_expected {
        6
    } else {
        7
    }
}

/// Choose a side's extension from its votes: the winning base, 'F' for a
/// fork between comparably supported candidates, or 'X' when nothing has
/// viable support.
pub fn choose_ext(depth: u16, votes: &ExtVotes) -> u8 {
    #[derive(Clone, Copy)]
    struct MerBase {
        base: u8,
        nvotes: u16,
        hi_q: u16,
        rating: u8,
    }
    let mut candidates = [b'A', b'C', b'G', b'T'].map(|base| {
        let nvotes = votes.total.get(base);
        let hi_q = votes.hi_q.get(base);
        MerBase { base, nvotes, hi_q, rating: base_rating(nvotes, hi_q, depth) }
    });
    candidates.sort_by(|a, b| {
        (b.rating, b.hi_q, b.nvotes).cmp(&(a.rating, a.hi_q, a.nvotes))
    });
    let top = candidates[0];
    let runner_up = candidates[1];
    if top.rating <= EXT_RATING_THRES {
        return b'X';
    }
    let unambiguous = match top.rating {
        1..=3 => runner_up.rating == 0,
        4 | 5 => runner_up.rating < 3,
        6 => runner_up.rating < 4,
        _ => runner_up.rating < 7,
    };
    if unambiguous {
        return top.base;
    }
    if top.rating == 7 {
        // strongest rating: raw vote count breaks the tie unless a third
        // candidate is just as strong
        if candidates[2].rating == 7 || top.nvotes == runner_up.nvotes {
            return b'F';
        }
        return if top.nvotes > runner_up.nvotes { top.base } else { runner_up.base };
    }
    b'F'
}
