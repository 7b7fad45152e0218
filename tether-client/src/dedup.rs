//! # Request deduplication
//!
//! Collapses concurrent executions of the same operation into one. The first caller for a
//! key starts the operation; callers arriving while it is pending join it and observe the
//! same outcome. The record is dropped the moment the operation settles, so outcomes are
//! never reused by later callers.
//!
//! The table only holds weak handles to pending operations. If every caller stops waiting
//! (e.g. all of them timed out) the operation itself is dropped and cancelled.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures03::future::{BoxFuture, FutureExt, Shared, WeakShared};
use metrics::counter;
use parking_lot::Mutex;
use tracing::trace;

type PendingFuture<T, E> = BoxFuture<'static, Result<T, E>>;

struct Pending<T, E> {
    generation: u64,
    future: WeakShared<PendingFuture<T, E>>,
}

struct PendingTable<T, E> {
    entries: HashMap<String, Pending<T, E>>,
    next_generation: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Calls that started a new execution.
    pub executed: u64,
    /// Calls that joined an execution already in flight.
    pub joined: u64,
}

pub struct Deduplicator<T, E> {
    pending: Arc<Mutex<PendingTable<T, E>>>,
    executed: AtomicU64,
    joined: AtomicU64,
}

impl<T, E> Default for Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(PendingTable {
                entries: HashMap::new(),
                next_generation: 0,
            })),
            executed: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Runs `operation` unless an execution for `key` is already pending, in which case its
    /// outcome is awaited instead. `operation` is only invoked when a new execution starts.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = self.join_or_start(key, operation);
        shared.await
    }

    fn join_or_start<F, Fut>(&self, key: &str, operation: F) -> Shared<PendingFuture<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut table = self.pending.lock();
        if let Some(existing) = table
            .entries
            .get(key)
            .and_then(|pending| pending.future.upgrade())
        {
            self.joined.fetch_add(1, Ordering::Relaxed);
            counter!("tether_dedup_joined").increment(1);
            trace!(key, "JoinedInFlight");
            return existing;
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        let registry = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let execution = operation();
        let shared = async move {
            let outcome = execution.await;
            let mut table = registry.lock();
            // a newer execution may have replaced ours after it was abandoned
            if table
                .entries
                .get(&owned_key)
                .is_some_and(|pending| pending.generation == generation)
            {
                table.entries.remove(&owned_key);
            }
            outcome
        }
        .boxed()
        .shared();

        // drop records of executions nobody waits for anymore
        table
            .entries
            .retain(|_, pending| pending.future.upgrade().is_some());
        if let Some(future) = shared.downgrade() {
            table
                .entries
                .insert(key.to_string(), Pending { generation, future });
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        counter!("tether_dedup_executed").increment(1);
        trace!(key, "StartedExecution");
        shared
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .entries
            .values()
            .filter(|pending| pending.future.upgrade().is_some())
            .count()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executed: self.executed.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use futures03::future::join_all;
    use pretty_assertions::assert_eq;

    use super::*;

    fn counted(
        calls: &Arc<AtomicUsize>,
        outcome: Result<u32, String>,
    ) -> impl Future<Output = Result<u32, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            outcome
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_concurrent_calls_share_one_execution() {
        let dedup = Deduplicator::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..5).map(|_| dedup.execute("k", || counted(&calls, Ok(7))))).await;

        assert_eq!(results, vec![Ok(7); 5]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.stats(), DedupStats { executed: 1, joined: 4 });
        assert_eq!(dedup.in_flight(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_failure_is_shared_and_not_reused() {
        let dedup = Deduplicator::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all(
            (0..3).map(|_| dedup.execute("k", || counted(&calls, Err("boom".to_string())))),
        )
        .await;
        assert_eq!(results, vec![Err("boom".to_string()); 3]);

        // settled: the next call executes again
        let again = dedup
            .execute("k", || counted(&calls, Ok(1)))
            .await;
        assert_eq!(again, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let dedup = Deduplicator::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            dedup.execute("a", || counted(&calls, Ok(1))),
            dedup.execute("b", || counted(&calls, Ok(2)))
        );

        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_execution_is_cancelled() {
        let dedup = Deduplicator::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let slow = {
            let finished = Arc::clone(&finished);
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, String>(1)
            }
        };
        let res = tokio::time::timeout(Duration::from_secs(1), dedup.execute("k", slow)).await;
        assert!(res.is_err());
        assert_eq!(dedup.in_flight(), 0);

        // the abandoned execution is gone, a new caller starts over
        let again = dedup
            .execute("k", || counted(&calls, Ok(2)))
            .await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(again, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_timeout_does_not_cancel_others() {
        let dedup = Deduplicator::<u32, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let impatient =
            tokio::time::timeout(Duration::from_millis(10), dedup.execute("k", || counted(&calls, Ok(3))));
        let patient = dedup.execute("k", || counted(&calls, Ok(4)));

        let (impatient, patient) = tokio::join!(impatient, patient);

        assert!(impatient.is_err());
        assert_eq!(patient, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
