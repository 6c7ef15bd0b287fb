//! Fixed size thread pool running [DhtTask]s.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, error};

use crate::concurrent::{DhtFuture, DhtTask};
use crate::{Error, Result};

/// Default number of threads of [TaskExecutor::shared].
pub const DEFAULT_POOL_SIZE: usize = 4;

type Job = Box<dyn FnOnce() + Send>;

static SHARED: OnceLock<Arc<TaskExecutor>> = OnceLock::new();

#[derive(Debug)]
/// Runs submitted jobs on a fixed pool of threads, threads exit once the
/// executor is dropped.
pub struct TaskExecutor {
    sender: Sender<Job>,
    size: usize,
}

impl TaskExecutor {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = flume::unbounded::<Job>();

        for i in 0..size {
            let receiver: Receiver<Job> = receiver.clone();

            thread::Builder::new()
                .name(format!("mojito-executor-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
        }

        debug!(size, "Started task executor");

        Ok(TaskExecutor { sender, size })
    }

    /// Process wide executor, created on first use.
    ///
    /// Handed to each [crate::Dht] by its builder unless another one is given.
    pub fn shared() -> Arc<TaskExecutor> {
        SHARED
            .get_or_init(|| match TaskExecutor::new(DEFAULT_POOL_SIZE) {
                Ok(executor) => Arc::new(executor),
                Err(error) => {
                    error!(?error, "Failed to start the shared task executor");
                    Arc::new(TaskExecutor::closed())
                }
            })
            .clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a pool thread.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender.send(Box::new(job)).map_err(|_| Error::Shutdown)
    }

    /// Start `task` on a pool thread, cancelling `future` cancels the task.
    pub fn execute<T, K>(&self, task: Arc<K>, future: DhtFuture<T>)
    where
        T: Clone + Send + 'static,
        K: DhtTask<T> + 'static,
    {
        let cancelled = task.clone();
        future.on_cancel(move || cancelled.cancel());

        let pending = future.clone();
        let submitted = self.submit(move || {
            if !pending.is_done() {
                task.start(pending);
            }
        });

        if let Err(error) = submitted {
            future.set_exception(error);
        }
    }

    /// Run a long lived job on its own thread instead of the pool.
    pub fn spawn_dedicated(
        &self,
        name: impl Into<String>,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        Ok(thread::Builder::new().name(name.into()).spawn(job)?)
    }

    /// An executor rejecting every job.
    fn closed() -> Self {
        let (sender, _) = flume::unbounded();
        TaskExecutor { sender, size: 0 }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct Echo {
        value: u32,
        cancelled: AtomicBool,
    }

    impl DhtTask<u32> for Echo {
        fn wait_on_lock(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn start(self: Arc<Self>, future: DhtFuture<u32>) {
            future.set_value(self.value);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn executes_tasks() {
        let executor = TaskExecutor::new(2).unwrap();

        let task = Arc::new(Echo {
            value: 3,
            cancelled: AtomicBool::new(false),
        });
        let future = DhtFuture::new(task.wait_on_lock());
        executor.execute(task, future.clone());

        assert_eq!(future.get_on_lock().unwrap(), 3);
    }

    #[test]
    fn cancel_reaches_task() {
        let executor = TaskExecutor::closed();

        let task = Arc::new(Echo {
            value: 3,
            cancelled: AtomicBool::new(false),
        });
        let future = DhtFuture::new(task.wait_on_lock());

        future.cancel();
        executor.execute(task.clone(), future.clone());

        assert!(task.cancelled.load(Ordering::SeqCst));
        assert!(matches!(future.get(), Err(Error::Cancelled)));
    }

    #[test]
    fn closed_executor_fails_futures() {
        let executor = TaskExecutor::closed();

        let task = Arc::new(Echo {
            value: 1,
            cancelled: AtomicBool::new(false),
        });
        let future = DhtFuture::new(Duration::ZERO);
        executor.execute(task, future.clone());

        assert!(matches!(future.get(), Err(Error::Shutdown)));
    }

    #[test]
    fn shared_is_a_singleton() {
        let a = TaskExecutor::shared();
        let b = TaskExecutor::shared();
        assert!(Arc::ptr_eq(&a, &b));

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let (tx, rx) = flume::bounded(1);
        a.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
