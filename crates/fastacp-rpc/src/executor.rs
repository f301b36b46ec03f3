//! Single-worker execution domain for handlers.
//!
//! Every incoming request and notification handler of one engine runs on a
//! dedicated OS thread driving a current-thread tokio runtime. Handlers
//! interleave at their await points, but CPU-bound stretches never run in
//! parallel with each other or with the message pump.

use std::sync::Mutex;

use fastacp_core::logging::targets;
use tokio::sync::mpsc;

use crate::handler::BoxFuture;

type Job = BoxFuture<'static, ()>;

pub(crate) struct HandlerExecutor {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl HandlerExecutor {
    /// Spawns the worker thread.
    pub(crate) fn spawn(thread_name: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                // Dropping the runtime drops any handler still suspended,
                // which runs its cleanup guards.
                drop(runtime);
                log::debug!(target: targets::HANDLER, "handler worker stopped");
            })?;

        Ok(Self {
            jobs: Mutex::new(Some(tx)),
        })
    }

    /// Queues a job. Returns false once the executor is shut down.
    pub(crate) fn submit(&self, job: Job) -> bool {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match jobs.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs; the worker exits once the queue is empty.
    pub(crate) fn shutdown(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn jobs_run_on_the_named_worker() {
        let executor = HandlerExecutor::spawn("acp-test-worker").unwrap();
        let (tx, rx) = oneshot::channel();
        assert!(executor.submit(Box::pin(async move {
            let name = std::thread::current().name().map(str::to_owned);
            let _ = tx.send(name);
        })));
        assert_eq!(rx.await.unwrap().as_deref(), Some("acp-test-worker"));
    }

    #[tokio::test]
    async fn suspended_jobs_interleave() {
        let executor = HandlerExecutor::spawn("acp-test-interleave").unwrap();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let count = Arc::new(AtomicUsize::new(0));

        // The first job parks until the second one opens the gate.
        let first = Arc::clone(&count);
        executor.submit(Box::pin(async move {
            let _ = gate_rx.await;
            first.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        }));
        let second = Arc::clone(&count);
        executor.submit(Box::pin(async move {
            second.fetch_add(1, Ordering::SeqCst);
            let _ = gate_tx.send(());
        }));

        done_rx.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let executor = HandlerExecutor::spawn("acp-test-shutdown").unwrap();
        executor.shutdown();
        assert!(!executor.submit(Box::pin(async {})));
    }
}
