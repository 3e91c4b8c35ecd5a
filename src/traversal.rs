//! Parallel de Bruijn graph traversal.
//!
//! Runs once per round against the frozen k-mer index, in three phases:
//!
//! 1. **Fragment construction**: every rank scans its local shard and, for
//!    each unclaimed k-mer with clean extensions on both sides, walks left
//!    and right claiming k-mers as it goes. Claims use the fragment-owner
//!    pointer on `KmerCounts`, mutated only under the home shard's lock, so
//!    competing walks resolve race-free. A walk that runs into another
//!    fragment's claim records a link to that fragment.
//! 2. **Link cleaning**: overlap and reciprocity checks prune bogus links.
//! 3. **Connection**: chains of linked fragments are stitched into uutigs;
//!    a rank-order tie break keeps each chain emitted exactly once across
//!    ranks.

use ahash::AHashSet;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::contigs::{Contig, Contigs};
use crate::fabric::RankCtx;
use crate::kmer::{get_kmers, Kmer};
use crate::kmer_dht::{FragPtr, KmerDht};
use crate::utils::{comp_base, perc_str, revcomp_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dirn {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    Running,
    Deadend,
    Fork,
    Conflict,
    Repeat,
    Visited,
}

/// One uutig fragment, owned by the rank that walked it. Remote ranks
/// address it through a `FragPtr` into the owner's arena.
#[derive(Debug, Clone, Default)]
pub struct FragElem {
    pub left: Option<FragPtr>,
    pub right: Option<FragPtr>,
    pub left_is_rc: bool,
    pub right_is_rc: bool,
    pub seq: String,
    pub sum_depths: i64,
    pub visited: bool,
}

/// Per-rank fragment arenas, indexed by `FragPtr { owner, idx }`.
pub type FragArena = Arc<Vec<Mutex<Vec<FragElem>>>>;

pub fn new_frag_arena(ctx: &RankCtx) -> Result<FragArena> {
    let n = ctx.rank_n();
    ctx.share(|| Ok((0..n).map(|_| Mutex::new(Vec::new())).collect::<Vec<_>>()))
}

fn fetch_frag(arena: &FragArena, ptr: FragPtr) -> FragElem {
    arena[ptr.owner as usize].lock()[ptr.idx as usize].clone()
}

#[derive(Default)]
struct WalkTermStats {
    deadends: i64,
    forks: i64,
    conflicts: i64,
    repeats: i64,
    visited: i64,
}

impl WalkTermStats {
    fn update(&mut self, status: WalkStatus) {
        match status {
            WalkStatus::Deadend => self.deadends += 1,
            WalkStatus::Fork => self.forks += 1,
            WalkStatus::Conflict => self.conflicts += 1,
            WalkStatus::Repeat => self.repeats += 1,
            WalkStatus::Visited => self.visited += 1,
            WalkStatus::Running => unreachable!("walks never terminate RUNNING"),
        }
    }

    fn print(&self, ctx: &RankCtx) -> Result<()> {
        let sum = |v: i64| ctx.reduce(v, |a, b| a + b);
        let deadends = sum(self.deadends)?;
        let forks = sum(self.forks)?;
        let conflicts = sum(self.conflicts)?;
        let repeats = sum(self.repeats)?;
        let visited = sum(self.visited)?;
        let total = deadends + forks + conflicts + repeats + visited;
        if ctx.rank_me() == 0 {
            info!("Walk statistics:");
            info!("  deadends:  {}", perc_str(deadends, total));
            info!("  forks:     {}", perc_str(forks, total));
            info!("  conflicts: {}", perc_str(conflicts, total));
            info!("  repeats:   {}", perc_str(repeats, total));
            info!("  visited:   {}", perc_str(visited, total));
        }
        Ok(())
    }
}

struct StepInfo<const W: usize> {
    status: WalkStatus,
    sum_depths: i64,
    prev_ext: u8,
    next_ext: u8,
    visited_frag: Option<FragPtr>,
    uutig: String,
    kmer: Kmer<W>,
    is_rc: bool,
}

/// Advance a walk over the k-mers homed on `home`, claiming each one for
/// `token`. Loops locally while the next k-mer stays on the same rank and
/// returns as soon as it would leave, or on any terminal condition.
///
/// The entire invocation holds the home shard's lock, making the
/// claim-compare-and-set atomic with respect to every other walk.
#[allow(clippy::too_many_arguments)]
fn get_next_step<const W: usize>(
    dht: &KmerDht<W>,
    home: usize,
    start: Kmer<W>,
    dirn: Dirn,
    start_prev_ext: u8,
    start_next_ext: u8,
    mut revisit_allowed: bool,
    mut is_rc: bool,
    token: FragPtr,
) -> StepInfo<W> {
    let mut step = StepInfo {
        status: WalkStatus::Running,
        sum_depths: 0,
        prev_ext: start_prev_ext,
        next_ext: start_next_ext,
        visited_frag: None,
        uutig: String::new(),
        kmer: start,
        is_rc,
    };
    let mut shard = dht.lock_shard(home);
    loop {
        let Some(kc) = shard.kmers.get_mut(&step.kmer) else {
            // k-mer was pruned below threshold: stop without extending
            step.status = WalkStatus::Deadend;
            break;
        };
        let mut left = kc.left;
        let mut right = kc.right;
        if left == b'X' || right == b'X' {
            // the dead-end k-mer itself stays unclaimed but the base that
            // leads into it is solid evidence, so keep it
            step.uutig.push(step.next_ext as char);
            step.status = WalkStatus::Deadend;
            break;
        }
        if left == b'F' || right == b'F' {
            step.uutig.push(step.next_ext as char);
            step.status = WalkStatus::Fork;
            break;
        }
        if is_rc {
            let tmp = comp_base(left);
            left = comp_base(right);
            right = tmp;
        }
        if step.prev_ext != 0 {
            let expected = if dirn == Dirn::Left { right } else { left };
            if step.prev_ext != expected {
                step.status = WalkStatus::Conflict;
                break;
            }
        }
        match kc.uutig_frag {
            Some(owner) if owner != token => {
                step.status = WalkStatus::Visited;
                step.visited_frag = Some(owner);
                break;
            }
            Some(_) if !revisit_allowed => {
                step.status = WalkStatus::Repeat;
                break;
            }
            _ => {}
        }
        // claim and extend
        kc.uutig_frag = Some(token);
        step.sum_depths += kc.count as i64;
        step.uutig.push(step.next_ext as char);
        step.next_ext = if dirn == Dirn::Left { left } else { right };
        let mut kmer = if is_rc { step.kmer.revcomp() } else { step.kmer };
        if dirn == Dirn::Left {
            step.prev_ext = kmer.back();
            kmer = kmer.backward_base(step.next_ext);
        } else {
            step.prev_ext = kmer.front();
            kmer = kmer.forward_base(step.next_ext);
        }
        revisit_allowed = false;
        let (canon, canon_is_rc) = kmer.canonical();
        step.kmer = canon;
        is_rc = canon_is_rc;
        step.is_rc = canon_is_rc;
        let target = dht.home_of(&canon);
        if target != home {
            // next k-mer is remote, hand back to the walk loop
            break;
        }
    }
    step
}

/// Walk outward from `start` in one direction, accumulating sequence and
/// depth, and return the neighbor fragment pointer if the walk ended on
/// another fragment's claim.
#[allow(clippy::too_many_arguments)]
fn traverse_dirn<const W: usize>(
    dht: &KmerDht<W>,
    start: Kmer<W>,
    token: FragPtr,
    dirn: Dirn,
    uutig: &mut String,
    sum_depths: &mut i64,
    term_stats: &mut WalkTermStats,
    hops: &mut (i64, i64),
) -> Option<FragPtr> {
    let mut prev_ext = 0u8;
    let mut next_ext = if dirn == Dirn::Left { start.front() } else { start.back() };
    let mut revisit_allowed = dirn == Dirn::Right;
    if dirn == Dirn::Right {
        // the left walk covered the start k-mer's front base and the right
        // walk will append its back base, so seed with the middle
        let start_str = start.to_string();
        uutig.push_str(&start_str[1..start_str.len() - 1]);
    }
    let mut kmer = start;
    let mut is_rc = false;
    let mut walk = String::new();
    let result = loop {
        let home = dht.home_of(&kmer);
        hops.0 += 1;
        if home == dht.rank_me() {
            hops.1 += 1;
        }
        let step = get_next_step(
            dht, home, kmer, dirn, prev_ext, next_ext, revisit_allowed, is_rc, token,
        );
        revisit_allowed = false;
        *sum_depths += step.sum_depths;
        walk.push_str(&step.uutig);
        if step.status != WalkStatus::Running {
            term_stats.update(step.status);
            break step.visited_frag;
        }
        prev_ext = step.prev_ext;
        next_ext = step.next_ext;
        kmer = step.kmer;
        is_rc = step.is_rc;
    };
    if dirn == Dirn::Left {
        // walked backwards, so the accumulated bases are reversed
        uutig.insert_str(0, &walk.chars().rev().collect::<String>());
    } else {
        uutig.push_str(&walk);
    }
    result
}

/// Phase 1: walk every eligible local k-mer into a uutig fragment.
fn construct_frags<const W: usize>(
    ctx: &RankCtx,
    dht: &KmerDht<W>,
    arena: &FragArena,
) -> Result<()> {
    let me = ctx.rank_me();
    let mut term_stats = WalkTermStats::default();
    let mut hops = (0i64, 0i64);
    let mut num_walks: i64 = 0;
    ctx.barrier()?;
    for kmer in dht.local_kmer_keys() {
        let eligible = dht
            .with_local_kmer(&kmer, |kc| {
                kc.uutig_frag.is_none()
                    && kc.left != b'X'
                    && kc.left != b'F'
                    && kc.right != b'X'
                    && kc.right != b'F'
            })
            .unwrap_or(false);
        if !eligible {
            continue;
        }
        let idx = {
            let mut frags = arena[me].lock();
            frags.push(FragElem::default());
            (frags.len() - 1) as u32
        };
        let token = FragPtr { owner: me as u32, idx };
        let mut uutig = String::new();
        let mut sum_depths: i64 = 0;
        let left =
            traverse_dirn(dht, kmer, token, Dirn::Left, &mut uutig, &mut sum_depths, &mut term_stats, &mut hops);
        let right =
            traverse_dirn(dht, kmer, token, Dirn::Right, &mut uutig, &mut sum_depths, &mut term_stats, &mut hops);
        {
            let mut frags = arena[me].lock();
            let elem = &mut frags[idx as usize];
            elem.seq = uutig;
            elem.sum_depths = sum_depths;
            elem.left = left;
            elem.right = right;
        }
        num_walks += 1;
    }
    ctx.barrier()?;
    let all_hops = ctx.reduce(hops.0, |a, b| a + b)?;
    let all_local = ctx.reduce(hops.1, |a, b| a + b)?;
    let all_walks = ctx.reduce(num_walks, |a, b| a + b)?;
    if ctx.rank_me() == 0 {
        info!(
            "Constructed fragments from {} walks, {} same-rank of {} step dispatches",
            all_walks,
            perc_str(all_local, all_hops),
            all_hops
        );
    }
    term_stats.print(ctx)
}

#[derive(Default)]
struct CleanStats {
    num_frags: i64,
    num_short: i64,
    num_equal_links: i64,
    num_links: i64,
    num_overlaps: i64,
    num_overlaps_rc: i64,
    num_non_recip: i64,
    num_no_overlap: i64,
}

fn is_overlap(left_seq: &str, right_seq: &str, olen: usize) -> bool {
    left_seq.len() >= olen
        && right_seq.len() >= olen
        && left_seq.as_bytes()[left_seq.len() - olen..] == right_seq.as_bytes()[..olen]
}

/// Validate one side's link: the k-1 overlap must hold in forward or
/// reverse-complement orientation and the neighbor must reciprocate on the
/// matching side. Returns the surviving link and its orientation.
fn clean_side(
    arena: &FragArena,
    dirn: Dirn,
    my_gptr: FragPtr,
    my_seq: &str,
    nb_gptr: Option<FragPtr>,
    kmer_len: usize,
    stats: &mut CleanStats,
) -> (Option<FragPtr>, bool) {
    let Some(nb) = nb_gptr else { return (None, false) };
    stats.num_links += 1;
    let nb_elem = fetch_frag(arena, nb);
    let olen = kmer_len - 1;

    let (s1, s2) = match dirn {
        Dirn::Left => (nb_elem.seq.as_str(), my_seq),
        Dirn::Right => (my_seq, nb_elem.seq.as_str()),
    };
    if is_overlap(s1, s2, olen) {
        let recip = match dirn {
            Dirn::Left => nb_elem.right,
            Dirn::Right => nb_elem.left,
        };
        if recip != Some(my_gptr) {
            stats.num_non_recip += 1;
            return (None, false);
        }
        stats.num_overlaps += 1;
        return (Some(nb), false);
    }

    let nb_rc = revcomp_str(&nb_elem.seq);
    let (s1, s2) = match dirn {
        Dirn::Left => (nb_rc.as_str(), my_seq),
        Dirn::Right => (my_seq, nb_rc.as_str()),
    };
    if is_overlap(s1, s2, olen) {
        // neighbor is attached in reverse complement, so it reciprocates
        // on the same-named side
        let recip = match dirn {
            Dirn::Left => nb_elem.left,
            Dirn::Right => nb_elem.right,
        };
        if recip != Some(my_gptr) {
            stats.num_non_recip += 1;
            return (None, false);
        }
        stats.num_overlaps_rc += 1;
        return (Some(nb), true);
    }

    stats.num_no_overlap += 1;
    (None, false)
}

/// Phase 2: prune short fragments' participation, self-pairs, failed
/// overlaps and non-reciprocating links.
pub fn clean_frag_links(ctx: &RankCtx, kmer_len: usize, arena: &FragArena) -> Result<()> {
    let me = ctx.rank_me();
    let mut stats = CleanStats::default();
    let num_local = arena[me].lock().len();
    stats.num_frags = num_local as i64;
    for idx in 0..num_local {
        let my_gptr = FragPtr { owner: me as u32, idx: idx as u32 };
        let elem = { arena[me].lock()[idx].clone() };
        if elem.seq.len() < kmer_len {
            stats.num_short += 1;
            continue;
        }
        if elem.left.is_some() && elem.left == elem.right {
            // a fragment linked to the same neighbor on both sides carries
            // no orientation information
            stats.num_equal_links += 1;
            let mut frags = arena[me].lock();
            frags[idx].left = None;
            frags[idx].right = None;
            continue;
        }
        let (left, left_is_rc) =
            clean_side(arena, Dirn::Left, my_gptr, &elem.seq, elem.left, kmer_len, &mut stats);
        let (right, right_is_rc) =
            clean_side(arena, Dirn::Right, my_gptr, &elem.seq, elem.right, kmer_len, &mut stats);
        let mut frags = arena[me].lock();
        let e = &mut frags[idx];
        e.left = left;
        e.left_is_rc = left_is_rc;
        e.right = right;
        e.right_is_rc = right_is_rc;
    }
    ctx.barrier()?;
    let sum = |v: i64| ctx.reduce(v, |a, b| a + b);
    let all_frags = sum(stats.num_frags)?;
    let all_short = sum(stats.num_short)?;
    let all_links = sum(stats.num_links)?;
    let all_overlaps = sum(stats.num_overlaps)?;
    let all_overlaps_rc = sum(stats.num_overlaps_rc)?;
    let all_equal = sum(stats.num_equal_links)?;
    let all_non_recip = sum(stats.num_non_recip)?;
    let all_no_overlap = sum(stats.num_no_overlap)?;
    if ctx.rank_me() == 0 {
        info!(
            "Found {} uutig fragments of which {} are short",
            all_frags,
            perc_str(all_short, all_frags)
        );
        info!(
            "Checked {} links: {} overlaps, {} revcomped overlaps",
            all_links,
            perc_str(all_overlaps, all_links),
            perc_str(all_overlaps_rc, all_links)
        );
        info!(
            "Dropped {} equal, {} non-reciprocating, {} non-overlapping links",
            all_equal, all_non_recip, all_no_overlap
        );
    }
    Ok(())
}

fn get_other_side(elem: &FragElem, prev: FragPtr) -> Option<FragPtr> {
    if elem.left == Some(prev) {
        elem.right
    } else {
        elem.left
    }
}

#[derive(Default)]
struct ConnectStats {
    num_steps: i64,
    max_steps: i64,
    num_drops: i64,
    num_repeats: i64,
    num_prev_visited: i64,
}

/// Follow the fragment chain in one direction, splicing neighbor sequences
/// onto the growing uutig. Returns false if the walk must be dropped
/// because a higher-rank owner will emit this chain instead.
#[allow(clippy::too_many_arguments)]
fn walk_frags_dirn(
    ctx: &RankCtx,
    kmer_len: usize,
    arena: &FragArena,
    my_gptr: FragPtr,
    first: Option<FragPtr>,
    uutig: &mut String,
    depths: &mut f64,
    stats: &mut ConnectStats,
    local_visited: &mut Vec<u32>,
) -> Result<bool> {
    let me = ctx.rank_me() as u32;
    let mut next_opt = first;
    let mut prev_gptr = my_gptr;
    let mut visited: AHashSet<FragPtr> = AHashSet::new();
    visited.insert(my_gptr);
    let mut dirn: Option<Dirn> = None;
    let olen = kmer_len - 1;
    while let Some(next_gptr) = next_opt {
        if next_gptr.owner > me {
            stats.num_drops += 1;
            return Ok(false);
        }
        if !visited.insert(next_gptr) {
            stats.num_repeats += 1;
            return Ok(true);
        }
        let next_elem = fetch_frag(arena, next_gptr);
        if next_gptr.owner == me {
            if next_elem.visited {
                bail!(
                    "fragment {}:{} was already consumed by another connection walk",
                    next_gptr.owner,
                    next_gptr.idx
                );
            }
            local_visited.push(next_gptr.idx);
        }
        let next_rc = revcomp_str(&next_elem.seq);
        if dirn.is_none() {
            dirn = if is_overlap(uutig, &next_elem.seq, olen) || is_overlap(uutig, &next_rc, olen) {
                Some(Dirn::Right)
            } else if is_overlap(&next_elem.seq, uutig, olen) || is_overlap(&next_rc, uutig, olen) {
                Some(Dirn::Left)
            } else {
                bail!("no overlap between linked fragments at connection start");
            };
        }
        match dirn.expect("direction set above") {
            Dirn::Left => {
                if is_overlap(&next_elem.seq, uutig, olen) {
                    uutig.insert_str(0, &next_elem.seq[..next_elem.seq.len() - olen]);
                } else if is_overlap(&next_rc, uutig, olen) {
                    uutig.insert_str(0, &next_rc[..next_rc.len() - olen]);
                } else {
                    bail!("left-side overlap vanished during connection walk");
                }
            }
            Dirn::Right => {
                if is_overlap(uutig, &next_elem.seq, olen) {
                    uutig.push_str(&next_elem.seq[olen..]);
                } else if is_overlap(uutig, &next_rc, olen) {
                    uutig.push_str(&next_rc[olen..]);
                } else {
                    bail!("right-side overlap vanished during connection walk");
                }
            }
        }
        // discount the shared overlap so it is not double counted
        *depths += next_elem.sum_depths as f64
            * (1.0 - (kmer_len - 1) as f64 / next_elem.seq.len() as f64);
        let other = get_other_side(&next_elem, prev_gptr);
        prev_gptr = next_gptr;
        next_opt = other;
        stats.num_steps += 1;
    }
    Ok(true)
}

/// Phase 3: stitch fragment chains into uutigs and free the fragments.
fn connect_frags<const W: usize>(
    ctx: &RankCtx,
    kmer_len: usize,
    arena: &FragArena,
    uutigs: &mut Contigs,
) -> Result<()> {
    let me = ctx.rank_me();
    let mut stats = ConnectStats::default();
    let num_local = arena[me].lock().len();
    for idx in 0..num_local {
        let my_gptr = FragPtr { owner: me as u32, idx: idx as u32 };
        let elem = { arena[me].lock()[idx].clone() };
        if elem.seq.len() < kmer_len {
            continue;
        }
        if elem.visited {
            stats.num_prev_visited += 1;
            continue;
        }
        let mut local_visited: Vec<u32> = Vec::new();
        let mut uutig = elem.seq.clone();
        let mut depths = elem.sum_depths as f64;
        let steps_before = stats.num_steps;
        let mut ok = walk_frags_dirn(
            ctx, kmer_len, arena, my_gptr, elem.left, &mut uutig, &mut depths, &mut stats,
            &mut local_visited,
        )?;
        if ok {
            ok = walk_frags_dirn(
                ctx, kmer_len, arena, my_gptr, elem.right, &mut uutig, &mut depths, &mut stats,
                &mut local_visited,
            )?;
        }
        let walk_steps = 1 + stats.num_steps - steps_before;
        if !ok {
            continue;
        }
        stats.max_steps = stats.max_steps.max(walk_steps);
        let depth = depths / (uutig.len() - kmer_len + 2) as f64;
        uutigs.add(Contig { id: 0, seq: uutig, depth });
        let mut frags = arena[me].lock();
        for vidx in local_visited {
            frags[vidx as usize].visited = true;
        }
    }
    ctx.barrier()?;
    let all_steps = ctx.reduce(stats.num_steps, |a, b| a + b)?;
    let all_max_steps = ctx.reduce(stats.max_steps, |a, b| a.max(b))?;
    let all_drops = ctx.reduce(stats.num_drops, |a, b| a + b)?;
    let all_repeats = ctx.reduce(stats.num_repeats, |a, b| a + b)?;
    let all_prev_visited = ctx.reduce(stats.num_prev_visited, |a, b| a + b)?;
    let all_uutigs = ctx.reduce(uutigs.len() as i64, |a, b| a + b)?;
    if ctx.rank_me() == 0 && all_uutigs > 0 {
        info!(
            "Constructed {} uutigs with {:.2} avg path steps (max {}), dropped {}",
            all_uutigs,
            all_steps as f64 / all_uutigs as f64,
            all_max_steps,
            perc_str(all_drops, all_uutigs + all_drops)
        );
        debug!(
            "Skipped {} already visited fragments, found {} repeats",
            all_prev_visited, all_repeats
        );
    }
    // all chains are emitted, the fragments can go
    arena[me].lock().clear();
    ctx.barrier()
}

/// Audit that every k-mer of every emitted uutig survives in the index.
fn check_uutig_kmers<const W: usize>(
    dht: &KmerDht<W>,
    kmer_len: usize,
    uutigs: &Contigs,
) -> Result<()> {
    for ctg in uutigs.iter() {
        for (_, kmer) in get_kmers::<W>(ctg.seq.as_bytes(), kmer_len) {
            if !dht.kmer_exists(&kmer) {
                bail!("uutig {} contains k-mer {} missing from the index", ctg.id, kmer);
            }
        }
    }
    Ok(())
}

/// Traverse the frozen index into this round's uutig set, with globally
/// unique gapless ids.
pub fn traverse_debruijn_graph<const W: usize>(
    ctx: &RankCtx,
    dht: &KmerDht<W>,
    uutigs: &mut Contigs,
) -> Result<()> {
    let kmer_len = dht.kmer_len();
    let arena = new_frag_arena(ctx)?;
    construct_frags(ctx, dht, &arena)?;
    clean_frag_links(ctx, kmer_len, &arena)?;
    uutigs.clear();
    connect_frags::<W>(ctx, kmer_len, &arena, uutigs)?;

    // assign ids so the union across ranks is 0..N with no gaps
    let my_count = uutigs.len();
    let my_offset = ctx.prefix_sum_excl(my_count)? as i64;
    for (i, ctg) in uutigs.iter_mut().enumerate() {
        ctg.id = my_offset + i as i64;
    }
    ctx.barrier()?;

    if cfg!(debug_assertions) {
        check_uutig_kmers(dht, kmer_len, uutigs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_overlap() {
        assert!(is_overlap("AACCG", "CCGTT", 3));
        assert!(!is_overlap("AACCG", "CGGTT", 3));
        assert!(!is_overlap("AA", "CC", 3));
    }

    #[test]
    fn test_get_other_side() {
        let a = FragPtr { owner: 0, idx: 1 };
        let b = FragPtr { owner: 0, idx: 2 };
        let elem = FragElem { left: Some(a), right: Some(b), ..Default::default() };
        assert_eq!(get_other_side(&elem, a), Some(b));
        assert_eq!(get_other_side(&elem, b), Some(a));
    }
}
