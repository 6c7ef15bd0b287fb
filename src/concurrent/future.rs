//! Listenable, cancellable future shared by every asynchronous DHT operation.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::concurrent::{Failure, OnewayExchanger};
use crate::{Error, Result};

/// Terminal event delivered to every listener exactly once.
#[derive(Debug, Clone)]
pub enum FutureEvent<T> {
    Success(T),
    Exception(Error),
    Cancelled,
}

type Listener<T> = Box<dyn FnOnce(FutureEvent<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct Inner<T> {
    exchanger: OnewayExchanger<T, Error>,
    /// `None` once the listeners were flushed.
    listeners: Mutex<Option<Vec<Listener<T>>>>,
    cancel_hooks: Mutex<Vec<CancelHook>>,
    wait_on_lock: Duration,
}

/// A one shot future, clones observe the same completion.
pub struct DhtFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> DhtFuture<T> {
    /// Create a pending future, `wait_on_lock` is the timeout hint for
    /// synchronous callers, see [DhtFuture::get_on_lock].
    pub fn new(wait_on_lock: Duration) -> Self {
        DhtFuture {
            inner: Arc::new(Inner {
                exchanger: OnewayExchanger::new(true),
                listeners: Mutex::new(Some(Vec::new())),
                cancel_hooks: Mutex::new(Vec::new()),
                wait_on_lock,
            }),
        }
    }

    /// A future that already holds `value`.
    pub fn completed(value: T) -> Self {
        let future = Self::new(Duration::ZERO);
        future.set_value(value);
        future
    }

    /// A future that already failed with `error`.
    pub fn failed(error: Error) -> Self {
        let future = Self::new(Duration::ZERO);
        future.set_exception(error);
        future
    }

    // === Getters ===

    pub fn wait_on_lock(&self) -> Duration {
        self.inner.wait_on_lock
    }

    pub fn is_done(&self) -> bool {
        self.inner.exchanger.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.exchanger.is_cancelled()
    }

    /// Returns `true` if both handles point to the same future.
    pub fn ptr_eq(&self, other: &DhtFuture<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === Public Methods ===

    /// Block until the future completes.
    pub fn get(&self) -> Result<T> {
        self.inner.exchanger.get().map_err(Error::from)
    }

    /// Block until the future completes or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        self.inner
            .exchanger
            .get_timeout(timeout)
            .map_err(Error::from)
    }

    /// Block for at most the wait-on-lock hint of the task behind this future.
    pub fn get_on_lock(&self) -> Result<T> {
        if self.inner.wait_on_lock.is_zero() {
            return self.get();
        }

        self.get_timeout(self.inner.wait_on_lock)
    }

    pub fn try_get(&self) -> Result<Option<T>> {
        self.inner.exchanger.try_get().map_err(Error::from)
    }

    pub fn set_value(&self, value: T) -> bool {
        let set = self.inner.exchanger.set_value(value);
        if set {
            self.fire_listeners();
        }
        set
    }

    pub fn set_exception(&self, error: Error) -> bool {
        let set = self.inner.exchanger.set_exception(error);
        if set {
            self.fire_listeners();
        }
        set
    }

    /// Cancel this future and the task behind it, returns `false` if it was
    /// already done.
    pub fn cancel(&self) -> bool {
        if !self.inner.exchanger.cancel() {
            return false;
        }

        self.run_cancel_hooks();
        self.fire_listeners();

        true
    }

    /// Register a hook that runs once if this future gets cancelled, runs
    /// immediately if it already is. Hooks run in registration order.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            hook();
            return;
        }

        self.inner
            .cancel_hooks
            .lock()
            .expect("mutex")
            .push(Box::new(hook));

        // Cancelled between the check and the registration.
        if self.is_cancelled() {
            self.run_cancel_hooks();
        }
    }

    /// Call `listener` with the terminal event, immediately if the future is
    /// already complete.
    pub fn add_listener(&self, listener: impl FnOnce(FutureEvent<T>) + Send + 'static) {
        {
            let mut listeners = self.inner.listeners.lock().expect("mutex");
            if let Some(pending) = listeners.as_mut() {
                pending.push(Box::new(listener));
                return;
            }
        }

        listener(self.event());
    }

    /// A future completing with `f` applied to this future's value.
    ///
    /// Cancelling the returned future cancels this one.
    pub fn map_result<U, F>(&self, f: F) -> DhtFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let mapped = DhtFuture::new(self.inner.wait_on_lock);

        let source = self.clone();
        mapped.on_cancel(move || {
            source.cancel();
        });

        let target = mapped.clone();
        self.add_listener(move |event| match event {
            FutureEvent::Success(value) => match f(value) {
                Ok(value) => {
                    target.set_value(value);
                }
                Err(error) => {
                    target.set_exception(error);
                }
            },
            FutureEvent::Exception(error) => {
                target.set_exception(error);
            }
            FutureEvent::Cancelled => {
                target.cancel();
            }
        });

        mapped
    }

    /// A future with `f` applied to this future's error.
    pub fn map_error<F>(&self, f: F) -> DhtFuture<T>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        let mapped = DhtFuture::new(self.inner.wait_on_lock);

        let source = self.clone();
        mapped.on_cancel(move || {
            source.cancel();
        });

        let target = mapped.clone();
        self.add_listener(move |event| match event {
            FutureEvent::Success(value) => {
                target.set_value(value);
            }
            FutureEvent::Exception(error) => {
                target.set_exception(f(error));
            }
            FutureEvent::Cancelled => {
                target.cancel();
            }
        });

        mapped
    }

    // === Private Methods ===

    fn event(&self) -> FutureEvent<T> {
        match self.inner.exchanger.try_get() {
            Ok(Some(value)) => FutureEvent::Success(value),
            Err(Failure::Exception(error)) => FutureEvent::Exception(error),
            Err(Failure::Timeout(duration)) => FutureEvent::Exception(Error::Timeout(duration)),
            Ok(None) | Err(Failure::Cancelled) => FutureEvent::Cancelled,
        }
    }

    fn run_cancel_hooks(&self) {
        let hooks = std::mem::take(&mut *self.inner.cancel_hooks.lock().expect("mutex"));

        for hook in hooks {
            hook();
        }
    }

    fn fire_listeners(&self) {
        let listeners = self.inner.listeners.lock().expect("mutex").take();

        if let Some(listeners) = listeners {
            trace!(count = listeners.len(), "Firing future listeners");

            let event = self.event();
            for listener in listeners {
                listener(event.clone());
            }
        }
    }
}

impl<T> Clone for DhtFuture<T> {
    fn clone(&self) -> Self {
        DhtFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for DhtFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtFuture")
            .field("wait_on_lock", &self.inner.wait_on_lock)
            .finish_non_exhaustive()
    }
}

impl From<Failure<Error>> for Error {
    fn from(failure: Failure<Error>) -> Self {
        match failure {
            Failure::Cancelled => Error::Cancelled,
            Failure::Timeout(duration) => Error::Timeout(duration),
            Failure::Exception(error) => error,
        }
    }
}
