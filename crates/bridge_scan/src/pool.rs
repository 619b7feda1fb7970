//! Bounded worker pool: at most `size` units of work in flight.
//!
//! Units must not share mutable state. Results are handed to the caller's sink
//! on the driving task in completion order, so a single writer can persist them.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: usize,
    pub panicked: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Apply `work` to every item. Tasks are spawned lazily, so long item
    /// lists never hold more than `size` pending futures.
    pub async fn run<I, T, R, F, Fut>(&self, items: I, mut work: F, mut sink: impl FnMut(R)) -> PoolStats
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let mut items = items.into_iter();
        let mut tasks = JoinSet::new();
        let mut stats = PoolStats::default();
        loop {
            while tasks.len() < self.size {
                let Some(item) = items.next() else { break };
                tasks.spawn(work(item));
            }
            match tasks.join_next().await {
                Some(Ok(result)) => {
                    stats.completed += 1;
                    sink(result);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "worker task panicked");
                    stats.panicked += 1;
                }
                None => break,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_item_once() {
        let pool = WorkerPool::new(3);
        let mut out = Vec::new();
        let stats = pool
            .run(0..20u64, |i| async move { i * 2 }, |r| out.push(r))
            .await;
        out.sort();
        assert_eq!(out, (0..20u64).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(stats, PoolStats { completed: 20, panicked: 0 });
    }

    #[tokio::test]
    async fn never_exceeds_pool_size() {
        let pool = WorkerPool::new(4);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        pool.run(
            0..32,
            |_| {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                }
            },
            |_| {},
        )
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn panics_are_counted() {
        let pool = WorkerPool::new(2);
        let stats = pool
            .run(
                0..4,
                |i| async move {
                    if i == 2 {
                        panic!("boom");
                    }
                    i
                },
                |_| {},
            )
            .await;
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.panicked, 1);
    }

    #[tokio::test]
    async fn zero_size_still_makes_progress() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        let stats = pool.run(vec![1, 2], |i| async move { i }, |_| {}).await;
        assert_eq!(stats.completed, 2);
    }
}
