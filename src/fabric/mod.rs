//! SPMD rank fabric.
//!
//! The engine runs as a fixed set of ranks executing the same program. Each
//! rank owns a partition of every distributed structure (k-mer shards,
//! fragment arenas, shuffle maps) and all cross-rank mutation goes through
//! the owner's lock, which stands in for the owning event loop of a
//! one-sided communication runtime. The fabric itself provides the
//! collective plumbing: an abortable barrier, an all-gather blackboard that
//! reductions and broadcasts are built from, and a single global counter
//! cell for one-sided fetch-add.
//!
//! A failure on any rank aborts the whole job: the failing rank trips the
//! barrier's abort flag and every peer's next suspension point returns an
//! error instead of blocking forever.

pub mod aggr_store;

use anyhow::{anyhow, bail, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct BarrierState {
    count: usize,
    generation: u64,
    aborted: bool,
}

/// Barrier that can be torn down when a rank fails, releasing all waiters
/// with an error.
struct AbortableBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl AbortableBarrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState { count: 0, generation: 0, aborted: false }),
            cv: Condvar::new(),
        }
    }

    fn wait(&self, n_ranks: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            bail!("job aborted by another rank");
        }
        state.count += 1;
        if state.count == n_ranks {
            state.count = 0;
            state.generation += 1;
            self.cv.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cv.wait(&mut state);
        }
        if state.aborted {
            bail!("job aborted by another rank");
        }
        Ok(())
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.cv.notify_all();
    }
}

/// Shared state backing one SPMD job.
pub struct Fabric {
    n_ranks: usize,
    barrier: AbortableBarrier,
    board: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
    counter: AtomicI64,
}

impl Fabric {
    pub fn new(n_ranks: usize) -> Self {
        assert!(n_ranks > 0, "need at least one rank");
        Self {
            n_ranks,
            barrier: AbortableBarrier::new(),
            board: Mutex::new((0..n_ranks).map(|_| None).collect()),
            counter: AtomicI64::new(0),
        }
    }
}

/// Per-rank handle onto the fabric. Cheap to clone and pass around.
#[derive(Clone)]
pub struct RankCtx {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl RankCtx {
    pub fn rank_me(&self) -> usize {
        self.rank
    }

    pub fn rank_n(&self) -> usize {
        self.fabric.n_ranks
    }

    /// Block until every rank arrives.
    pub fn barrier(&self) -> Result<()> {
        self.fabric.barrier.wait(self.fabric.n_ranks)
    }

    /// Collective: every rank contributes one value and receives all of
    /// them, indexed by rank.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>> {
        {
            let mut board = self.fabric.board.lock();
            board[self.rank] = Some(Box::new(value));
        }
        self.barrier()?;
        let gathered = {
            let board = self.fabric.board.lock();
            board
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .and_then(|v| v.downcast_ref::<T>())
                        .cloned()
                        .ok_or_else(|| anyhow!("fabric blackboard slot missing or mistyped"))
                })
                .collect::<Result<Vec<T>>>()?
        };
        self.barrier()?;
        {
            let mut board = self.fabric.board.lock();
            board[self.rank] = None;
        }
        Ok(gathered)
    }

    /// Collective all-reduce over a binary combining function.
    pub fn reduce<T, F>(&self, value: T, combine: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let all = self.all_gather(value)?;
        let mut it = all.into_iter();
        let first = it.next().ok_or_else(|| anyhow!("reduce over empty fabric"))?;
        Ok(it.fold(first, combine))
    }

    /// Collective exclusive prefix sum: the sum of the values contributed by
    /// ranks strictly below this one.
    pub fn prefix_sum_excl(&self, value: usize) -> Result<usize> {
        let all = self.all_gather(value)?;
        Ok(all[..self.rank].iter().sum())
    }

    /// Collective: rank 0 produces a value, every rank receives a clone.
    pub fn bcast_root<T: Clone + Send + 'static>(
        &self,
        make: impl FnOnce() -> T,
    ) -> Result<T> {
        if self.rank == 0 {
            let mut board = self.fabric.board.lock();
            board[0] = Some(Box::new(make()));
        }
        self.barrier()?;
        let value = {
            let board = self.fabric.board.lock();
            board[0]
                .as_ref()
                .and_then(|v| v.downcast_ref::<T>())
                .cloned()
                .ok_or_else(|| anyhow!("broadcast slot missing or mistyped"))?
        };
        self.barrier()?;
        if self.rank == 0 {
            self.fabric.board.lock()[0] = None;
        }
        Ok(value)
    }

    /// Collective: rank 0 constructs a shared object, every rank gets an
    /// `Arc` to it. Used to stand up the per-rank shard vectors.
    pub fn share<T: Send + Sync + 'static>(
        &self,
        init: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        let shared: std::result::Result<Arc<T>, String> =
            self.bcast_root(|| init().map(Arc::new).map_err(|e| format!("{e:#}")))?;
        shared.map_err(|e| anyhow!(e))
    }

    /// One-sided fetch-add on the job-wide counter cell.
    pub fn fetch_add_global(&self, n: i64) -> i64 {
        self.fabric.counter.fetch_add(n, Ordering::Relaxed)
    }

    /// Collective: reset the job-wide counter cell to zero.
    pub fn reset_global_counter(&self) -> Result<()> {
        self.barrier()?;
        if self.rank == 0 {
            self.fabric.counter.store(0, Ordering::Relaxed);
        }
        self.barrier()
    }
}

/// Run `f` as an SPMD program across `n_ranks` rank threads and collect the
/// per-rank results in rank order. The first error aborts the job.
pub fn run_spmd<F, R>(n_ranks: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(RankCtx) -> Result<R> + Sync,
    R: Send,
{
    let fabric = Arc::new(Fabric::new(n_ranks));
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(n_ranks);
        for rank in 0..n_ranks {
            let ctx = RankCtx { rank, fabric: Arc::clone(&fabric) };
            let f = &f;
            handles.push(scope.spawn(move || {
                // a panicking rank must still trip the abort flag, or its
                // peers would wait on the barrier forever
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx.clone())))
                        .unwrap_or_else(|_| Err(anyhow!("rank {} panicked", ctx.rank_me())));
                if result.is_err() {
                    ctx.fabric.barrier.abort();
                }
                result
            }));
        }
        let mut results = Vec::with_capacity(n_ranks);
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(r)) => results.push(r),
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    fabric.barrier.abort();
                    if first_err.is_none() {
                        first_err = Some(anyhow!("rank thread panicked"));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_gather_orders_by_rank() -> Result<()> {
        let results = run_spmd(4, |ctx| ctx.all_gather(ctx.rank_me() * 10))?;
        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20, 30]);
        }
        Ok(())
    }

    #[test]
    fn test_reduce_and_prefix_sum() -> Result<()> {
        let results = run_spmd(3, |ctx| {
            let sum = ctx.reduce(ctx.rank_me() + 1, |a, b| a + b)?;
            let prefix = ctx.prefix_sum_excl(ctx.rank_me() + 1)?;
            Ok((sum, prefix))
        })?;
        assert_eq!(results[0], (6, 0));
        assert_eq!(results[1], (6, 1));
        assert_eq!(results[2], (6, 3));
        Ok(())
    }

    #[test]
    fn test_share_publishes_one_object() -> Result<()> {
        let results = run_spmd(3, |ctx| {
            let shared = ctx.share(|| Ok(42usize))?;
            Ok(Arc::as_ptr(&shared) as usize)
        })?;
        assert!(results.iter().all(|&p| p == results[0]));
        Ok(())
    }

    #[test]
    fn test_global_counter_hands_out_disjoint_slots() -> Result<()> {
        let results = run_spmd(4, |ctx| {
            ctx.reset_global_counter()?;
            Ok(ctx.fetch_add_global(2))
        })?;
        let mut slots = results;
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 2, 4, 6]);
        Ok(())
    }

    #[test]
    fn test_rank_error_aborts_peers() {
        let result = run_spmd(2, |ctx| {
            if ctx.rank_me() == 1 {
                anyhow::bail!("simulated failure");
            }
            // rank 0 would otherwise wait here forever
            ctx.barrier()?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
