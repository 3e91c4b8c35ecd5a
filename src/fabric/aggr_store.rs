//! Aggregated update store.
//!
//! The one communication primitive shared by every distributed map in the
//! engine. Callers enqueue update records keyed by target rank; the store
//! batches them per destination and applies a registered merge function at
//! the destination shard when flushed. A byte budget bounds the outstanding
//! buffered volume; exceeding it drains the largest buffer synchronously
//! (backpressure) rather than growing without limit.
//!
//! Delivery is exactly-once per enqueued record. Between flush barriers the
//! application order at a destination is unspecified, so merge functions
//! must be commutative or the destination map must be insert-only.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::RankCtx;

pub type UpdateFn<T> = Arc<dyn Fn(usize, T) -> Result<()> + Send + Sync>;

pub struct AggrStore<T> {
    name: String,
    ctx: RankCtx,
    update_fn: Option<UpdateFn<T>>,
    buffers: Vec<Vec<T>>,
    buffered_bytes: usize,
    max_store_bytes: usize,
    num_updates: u64,
    num_drains: u64,
}

impl<T> AggrStore<T> {
    pub fn new(ctx: &RankCtx) -> Self {
        let n = ctx.rank_n();
        Self {
            name: String::from("aggr store"),
            ctx: ctx.clone(),
            update_fn: None,
            buffers: (0..n).map(|_| Vec::new()).collect(),
            buffered_bytes: 0,
            max_store_bytes: usize::MAX,
            num_updates: 0,
            num_drains: 0,
        }
    }

    /// Register the destination-side merge function.
    pub fn set_update_func(&mut self, f: UpdateFn<T>) {
        self.update_fn = Some(f);
    }

    /// Set the aggregate byte budget for buffered records.
    pub fn set_size(&mut self, name: &str, max_bytes: usize) {
        self.name = name.to_string();
        self.max_store_bytes = max_bytes.max(std::mem::size_of::<T>() * 16);
        debug!(
            "{}: buffer budget {:.1} MB",
            self.name,
            self.max_store_bytes as f64 / (1024.0 * 1024.0)
        );
    }

    /// Enqueue one record for `target`, draining synchronously if the byte
    /// budget is exceeded.
    pub fn update(&mut self, target: usize, record: T) -> Result<()> {
        self.buffers[target].push(record);
        self.buffered_bytes += std::mem::size_of::<T>();
        self.num_updates += 1;
        if self.buffered_bytes >= self.max_store_bytes {
            self.drain_largest()?;
        }
        Ok(())
    }

    fn drain_largest(&mut self) -> Result<()> {
        let target = (0..self.buffers.len())
            .max_by_key(|&t| self.buffers[t].len())
            .ok_or_else(|| anyhow!("{}: no buffers", self.name))?;
        if self.buffers[target].is_empty() {
            warn!("{}: byte budget too small to buffer a single record", self.name);
            return Ok(());
        }
        self.drain_target(target)
    }

    fn drain_target(&mut self, target: usize) -> Result<()> {
        let records = std::mem::take(&mut self.buffers[target]);
        if records.is_empty() {
            return Ok(());
        }
        self.buffered_bytes -= records.len() * std::mem::size_of::<T>();
        self.num_drains += 1;
        let apply = self
            .update_fn
            .as_ref()
            .ok_or_else(|| anyhow!("{}: no update function registered", self.name))?
            .clone();
        for record in records {
            apply(target, record)?;
        }
        Ok(())
    }

    /// Drain every buffered record to its destination. Callers must follow
    /// with a fabric barrier before reading destination state.
    pub fn flush_updates(&mut self) -> Result<()> {
        for target in 0..self.buffers.len() {
            self.drain_target(target)?;
        }
        debug!(
            "{}: flushed ({} updates, {} drains)",
            self.name, self.num_updates, self.num_drains
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        for buf in &mut self.buffers {
            buf.clear();
            buf.shrink_to_fit();
        }
        self.buffered_bytes = 0;
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn rank_n(&self) -> usize {
        self.ctx.rank_n()
    }
}
