use std::sync::Arc;
use std::time::Duration;

use crate::concurrent::DhtFuture;

/// A cancellable unit of asynchronous DHT work that reports through a
/// [DhtFuture].
pub trait DhtTask<T>: Send + Sync {
    /// How long synchronous callers should block on the future of this task.
    fn wait_on_lock(&self) -> Duration;

    /// Start the work, completing `future` eventually. Called at most once.
    fn start(self: Arc<Self>, future: DhtFuture<T>);

    /// Stop the work and every sub-task, must be idempotent.
    fn cancel(&self);
}
