//! The per-batch request runner: a priority queue drained by a bounded
//! worker set.
//!
//! The runner sits below the global request pool, so effective
//! parallelism for a batch is the smaller of the runner's worker count
//! and the permits the pool has left.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Worker and retry configuration for one batch invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Bounded worker count.
    pub concurrency: usize,
    /// Times a failed task is re-run before its error is recorded.
    pub retries: u32,
    /// Delay between task retries.
    pub retry_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            retries: 0,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Lifecycle events emitted while a batch drains.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A task was picked up by a worker
    TaskStart {
        /// Task identifier
        id: String,
    },
    /// A task finished successfully
    TaskComplete {
        /// Task identifier
        id: String,
    },
    /// A task failed; its error is recorded in the result slot
    TaskError {
        /// Task identifier
        id: String,
        /// Error description
        message: String,
    },
    /// Batch progress after each settled task
    Progress {
        /// Tasks settled so far
        completed: usize,
        /// Tasks submitted in this batch
        total: usize,
    },
    /// Every task of a batch has settled
    Drained,
}

/// Observer for [`RunnerEvent`]s.
pub type RunnerEventSink = Arc<dyn Fn(&RunnerEvent) + Send + Sync>;

/// Batch statistics returned by [`RequestRunner::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerStats {
    /// Tasks submitted
    pub total: usize,
    /// Tasks that settled `Ok`
    pub successful: usize,
    /// Tasks that settled `Err`
    pub failed: usize,
    /// Wall clock for the whole batch
    pub duration: Duration,
}

/// Results plus statistics for one batch.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Per-item outcomes in submission order. Errors are values here,
    /// never propagated out of [`RequestRunner::run`].
    pub results: Vec<Result<T>>,
    /// Aggregate statistics.
    pub stats: RunnerStats,
}

struct QueuedTask {
    priority: i32,
    seq: u64,
    work: BoxFuture<'static, ()>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RunnerInner {
    config: RunnerConfig,
    heap: Mutex<BinaryHeap<QueuedTask>>,
    active: AtomicUsize,
    seq: AtomicU64,
    events: Option<RunnerEventSink>,
}

impl RunnerInner {
    fn emit(&self, event: &RunnerEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }
}

/// Priority queue with a bounded worker count.
#[derive(Clone)]
pub struct RequestRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for RequestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queued =
            self.inner.heap.lock().map(|heap| heap.len()).unwrap_or(0);
        f.debug_struct("RequestRunner")
            .field("concurrency", &self.inner.config.concurrency)
            .field("queued", &queued)
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for RequestRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl RequestRunner {
    /// Create a runner with the given configuration.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_events(config, None)
    }

    /// Create a runner that reports lifecycle events to `events`.
    #[must_use]
    pub fn with_events(
        config: RunnerConfig,
        events: Option<RunnerEventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                config: RunnerConfig {
                    concurrency: config.concurrency.max(1),
                    ..config
                },
                heap: Mutex::new(BinaryHeap::new()),
                active: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Enqueue one task. Higher priority runs first; ties break by
    /// submission order. Returns a handle resolving to the task's result.
    pub fn add<T, F>(
        &self,
        priority: i32,
        id: impl Into<String>,
        task: F,
    ) -> impl std::future::Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = id.into();
        let inner = Arc::clone(&self.inner);
        let work = async move {
            inner.emit(&RunnerEvent::TaskStart { id: id.clone() });
            let outcome = task.await;
            match &outcome {
                Ok(_) => {
                    inner.emit(&RunnerEvent::TaskComplete { id: id.clone() });
                }
                Err(err) => inner.emit(&RunnerEvent::TaskError {
                    id: id.clone(),
                    message: err.to_string(),
                }),
            }
            let _ = tx.send(outcome);
        }
        .boxed();

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        self.inner
            .heap
            .lock()
            .expect("runner queue poisoned")
            .push(QueuedTask { priority, seq, work });
        pump(&self.inner);

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Cancelled),
            }
        }
    }

    /// Run `processor` over `items` at one priority, catching per-task
    /// errors as values and collecting stats. Failed tasks are re-run up
    /// to the configured retry count.
    pub async fn run<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        processor: F,
        priority: i32,
    ) -> BatchOutcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let processor = Arc::new(processor);
        let retries = self.inner.config.retries;
        let retry_delay = self.inner.config.retry_delay;

        let mut handles = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let processor = Arc::clone(&processor);
            let task = async move {
                let mut attempt = 0;
                loop {
                    match processor(item.clone()).await {
                        Ok(value) => break Ok(value),
                        Err(err) if attempt < retries => {
                            attempt += 1;
                            log::debug!(
                                "runner task {index} attempt {attempt} failed: {err}"
                            );
                            tokio::time::sleep(retry_delay).await;
                        }
                        Err(err) => break Err(err),
                    }
                }
            };
            handles.push(self.add(priority, index.to_string(), task));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            results.push(handle.await);
            self.inner.emit(&RunnerEvent::Progress {
                completed: results.len(),
                total,
            });
        }
        self.inner.emit(&RunnerEvent::Drained);

        let successful = results.iter().filter(|r| r.is_ok()).count();
        BatchOutcome {
            stats: RunnerStats {
                total,
                successful,
                failed: total - successful,
                duration: started.elapsed(),
            },
            results,
        }
    }
}

fn pump(inner: &Arc<RunnerInner>) {
    loop {
        let active = inner.active.load(Ordering::SeqCst);
        if active >= inner.config.concurrency {
            return;
        }
        if inner.heap.lock().expect("runner queue poisoned").is_empty() {
            return;
        }
        if inner
            .active
            .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }
        let worker = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                let task =
                    worker.heap.lock().expect("runner queue poisoned").pop();
                let Some(task) = task else { break };
                task.work.await;
            }
            worker.active.fetch_sub(1, Ordering::SeqCst);
            // A task enqueued while this worker was exiting must not strand.
            if !worker.heap.lock().expect("runner queue poisoned").is_empty() {
                pump(&worker);
            }
        });
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn runner(concurrency: usize) -> RequestRunner {
        RequestRunner::new(RunnerConfig {
            concurrency,
            ..RunnerConfig::default()
        })
    }

    #[tokio::test]
    async fn results_preserve_submission_order() {
        let outcome = runner(4)
            .run(
                vec![3u64, 1, 2],
                |n| async move {
                    tokio::time::sleep(Duration::from_millis(n * 5)).await;
                    Ok(n * 10)
                },
                0,
            )
            .await;
        let values: Vec<u64> =
            outcome.results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn errors_are_values_not_thrown() {
        let outcome = runner(2)
            .run(
                vec![1u32, 2, 3],
                |n| async move {
                    if n == 2 {
                        Err(Error::network("boom"))
                    } else {
                        Ok(n)
                    }
                },
                0,
            )
            .await;
        assert!(outcome.results[0].is_ok());
        assert!(outcome.results[1].is_err());
        assert!(outcome.results[2].is_ok());
        assert_eq!(outcome.stats.total, 3);
        assert_eq!(outcome.stats.successful, 2);
        assert_eq!(outcome.stats.failed, 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak_in = Arc::clone(&peak);
        let current_in = Arc::clone(&current);
        let outcome = runner(3)
            .run(
                (0..12).collect::<Vec<u32>>(),
                move |_| {
                    let peak = Arc::clone(&peak_in);
                    let current = Arc::clone(&current_in);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                0,
            )
            .await;
        assert_eq!(outcome.stats.successful, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn higher_priority_runs_first_with_single_worker() {
        let order: Arc<StdMutex<Vec<&'static str>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let runner = runner(1);

        // Occupy the single worker so the queue builds up.
        let gate = runner.add(0, "gate", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let o1 = Arc::clone(&order);
        let low = runner.add(1, "low", async move {
            o1.lock().unwrap().push("low");
            Ok(())
        });
        let o2 = Arc::clone(&order);
        let high = runner.add(9, "high", async move {
            o2.lock().unwrap().push("high");
            Ok(())
        });

        let (_, _, _) = tokio::join!(gate, low, high);
        assert_eq!(*order.lock().unwrap(), ["high", "low"]);
    }

    #[tokio::test]
    async fn ties_break_by_submission_order() {
        let order: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let runner = runner(1);
        let gate = runner.add(0, "gate", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut handles = Vec::new();
        for n in 0..4u32 {
            let order = Arc::clone(&order);
            handles.push(runner.add(5, n.to_string(), async move {
                order.lock().unwrap().push(n);
                Ok(())
            }));
        }
        gate.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn retries_rerun_failed_tasks() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = Arc::clone(&attempts);
        let runner = RequestRunner::new(RunnerConfig {
            concurrency: 1,
            retries: 2,
            retry_delay: Duration::from_millis(1),
        });
        let outcome = runner
            .run(
                vec![()],
                move |()| {
                    let attempts = Arc::clone(&attempts_in);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(Error::network("flaky"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                0,
            )
            .await;
        assert_eq!(outcome.results[0].as_ref().unwrap(), &"done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn events_fire_in_lifecycle_order() {
        let events: Arc<StdMutex<Vec<String>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: RunnerEventSink = Arc::new(move |event| {
            let label = match event {
                RunnerEvent::TaskStart { .. } => "start".to_string(),
                RunnerEvent::TaskComplete { .. } => "complete".to_string(),
                RunnerEvent::TaskError { .. } => "error".to_string(),
                RunnerEvent::Progress { completed, total } => {
                    format!("progress {completed}/{total}")
                }
                RunnerEvent::Drained => "drained".to_string(),
            };
            sink_events.lock().unwrap().push(label);
        });
        let runner =
            RequestRunner::with_events(RunnerConfig::default(), Some(sink));
        runner
            .run(vec![()], |()| async { Ok(()) }, 0)
            .await
            .results
            .into_iter()
            .for_each(|r| r.unwrap());
        let seen = events.lock().unwrap();
        assert_eq!(
            *seen,
            ["start", "complete", "progress 1/1", "drained"]
                .map(String::from)
        );
    }
}
