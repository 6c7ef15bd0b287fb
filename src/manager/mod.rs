//! Managers start [crate::concurrent::DhtTask]s and keep one in-flight
//! future per key.

mod bootstrap;
mod find_node;
mod find_value;
mod ping;
mod store;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::trace;

pub use bootstrap::*;
pub use find_node::*;
pub use find_value::*;
pub use ping::*;
pub use store::*;

use crate::concurrent::DhtFuture;

#[derive(Debug)]
/// In-flight futures by key, an entry is removed as soon as its future
/// completes.
pub(crate) struct FutureMap<K, T> {
    futures: Arc<Mutex<HashMap<K, DhtFuture<T>>>>,
}

impl<K, T> FutureMap<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        FutureMap {
            futures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the in-flight future for `key`, or the one `start` creates.
    pub fn get_or_start(&self, key: K, start: impl FnOnce() -> DhtFuture<T>) -> DhtFuture<T> {
        let future = {
            let mut futures = self.futures.lock().expect("mutex");

            if let Some(existing) = futures.get(&key) {
                if !existing.is_done() {
                    trace!(?key, "Joining in-flight operation");
                    return existing.clone();
                }
            }

            let future = start();
            futures.insert(key.clone(), future.clone());

            future
        };

        let futures = Arc::downgrade(&self.futures);
        let inserted = future.clone();

        future.add_listener(move |_| {
            if let Some(futures) = futures.upgrade() {
                let mut futures = futures.lock().expect("mutex");

                if futures
                    .get(&key)
                    .is_some_and(|current| current.ptr_eq(&inserted))
                {
                    futures.remove(&key);
                }
            }
        });

        future
    }

    pub fn len(&self) -> usize {
        self.futures.lock().expect("mutex").len()
    }

    /// Cancel every in-flight future.
    pub fn cancel_all(&self) {
        let futures: Vec<DhtFuture<T>> = self
            .futures
            .lock()
            .expect("mutex")
            .values()
            .cloned()
            .collect();

        for future in futures {
            future.cancel();
        }
    }
}
