//! One-way value or error exchange between one writer and many readers.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why [OnewayExchanger::get] did not return a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    Cancelled,
    /// Nothing was exchanged within the given timeout.
    Timeout(Duration),
    Exception(E),
}

#[derive(Debug)]
struct State<V, E> {
    done: bool,
    cancelled: bool,
    value: Option<V>,
    exception: Option<E>,
}

impl<V, E> State<V, E> {
    fn pending() -> Self {
        State {
            done: false,
            cancelled: false,
            value: None,
            exception: None,
        }
    }
}

#[derive(Debug)]
/// A blocking exchange point: readers wait in [OnewayExchanger::get] until a
/// writer sets a value, sets an exception, or cancels.
///
/// A one shot exchanger never changes after the first completion, otherwise
/// later writes overwrite and [OnewayExchanger::reset] is allowed.
pub struct OnewayExchanger<V, E> {
    state: Mutex<State<V, E>>,
    condvar: Condvar,
    one_shot: bool,
}

impl<V: Clone, E: Clone> OnewayExchanger<V, E> {
    pub fn new(one_shot: bool) -> Self {
        OnewayExchanger {
            state: Mutex::new(State::pending()),
            condvar: Condvar::new(),
            one_shot,
        }
    }

    // === Getters ===

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_done(&self) -> bool {
        let state = self.lock();
        state.done || state.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Returns `true` if the exchanger completed with an exception.
    pub fn throws_exception(&self) -> bool {
        let state = self.lock();
        !state.cancelled && state.exception.is_some()
    }

    // === Public Methods ===

    /// Blocks until a value, an exception or a cancellation arrives.
    pub fn get(&self) -> Result<V, Failure<E>> {
        let state = self
            .condvar
            .wait_while(self.lock(), |state| !(state.done || state.cancelled))
            .expect("mutex");

        Self::outcome(&state)
    }

    /// Like [Self::get] but fails with [Failure::Timeout] once `timeout` elapsed.
    pub fn get_timeout(&self, timeout: Duration) -> Result<V, Failure<E>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while !(state.done || state.cancelled) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Failure::Timeout(timeout));
            }

            state = self
                .condvar
                .wait_timeout(state, deadline - now)
                .expect("mutex")
                .0;
        }

        Self::outcome(&state)
    }

    /// Returns `Ok(None)` instead of blocking while pending.
    pub fn try_get(&self) -> Result<Option<V>, Failure<E>> {
        let state = self.lock();

        if !(state.done || state.cancelled) {
            return Ok(None);
        }

        Self::outcome(&state).map(Some)
    }

    pub fn set_value(&self, value: V) -> bool {
        let mut state = self.lock();
        if !self.writable(&state) {
            return false;
        }

        state.done = true;
        state.value = Some(value);
        self.condvar.notify_all();

        true
    }

    pub fn set_exception(&self, exception: E) -> bool {
        let mut state = self.lock();
        if !self.writable(&state) {
            return false;
        }

        state.done = true;
        state.exception = Some(exception);
        self.condvar.notify_all();

        true
    }

    /// Cancels a pending exchanger, returns `false` if it was already done.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.done || state.cancelled {
            return false;
        }

        state.cancelled = true;
        self.condvar.notify_all();

        true
    }

    /// Returns a reusable exchanger to pending, one shot exchangers refuse.
    pub fn reset(&self) -> bool {
        if self.one_shot {
            return false;
        }

        *self.lock() = State::pending();

        true
    }

    // === Private Methods ===

    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        self.state.lock().expect("mutex")
    }

    fn writable(&self, state: &State<V, E>) -> bool {
        !(state.cancelled || (self.one_shot && state.done))
    }

    fn outcome(state: &State<V, E>) -> Result<V, Failure<E>> {
        if state.cancelled {
            return Err(Failure::Cancelled);
        }

        if let Some(exception) = &state.exception {
            return Err(Failure::Exception(exception.clone()));
        }

        match &state.value {
            Some(value) => Ok(value.clone()),
            None => Err(Failure::Cancelled),
        }
    }
}

impl<V: Clone, E: Clone> Default for OnewayExchanger<V, E> {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn one_shot_first_write_wins() {
        let exchanger = OnewayExchanger::<u32, String>::new(true);

        assert!(exchanger.set_value(1));
        assert!(!exchanger.set_value(2));
        assert!(!exchanger.set_exception("late".into()));
        assert!(!exchanger.cancel());
        assert!(!exchanger.reset());

        assert_eq!(exchanger.get(), Ok(1));
    }

    #[test]
    fn one_shot_exception_wins() {
        let exchanger = OnewayExchanger::<u32, String>::new(true);

        assert!(exchanger.set_exception("boom".into()));
        assert!(!exchanger.set_value(2));

        assert!(exchanger.throws_exception());
        assert_eq!(exchanger.get(), Err(Failure::Exception("boom".into())));
        assert_eq!(exchanger.get(), Err(Failure::Exception("boom".into())));
    }

    #[test]
    fn cancelled_rejects_writes() {
        let exchanger = OnewayExchanger::<u32, String>::new(false);

        assert!(exchanger.cancel());
        assert!(!exchanger.set_value(1));
        assert!(!exchanger.set_exception("x".into()));

        assert!(exchanger.is_cancelled());
        assert_eq!(exchanger.get(), Err(Failure::Cancelled));
        assert_eq!(exchanger.try_get(), Err(Failure::Cancelled));
    }

    #[test]
    fn reusable_overwrites_and_resets() {
        let exchanger = OnewayExchanger::<u32, String>::new(false);

        assert_eq!(exchanger.try_get(), Ok(None));

        assert!(exchanger.set_value(1));
        assert!(exchanger.set_value(2));
        assert_eq!(exchanger.get(), Ok(2));

        // Exceptions take priority over values.
        assert!(exchanger.set_exception("e".into()));
        assert_eq!(exchanger.get(), Err(Failure::Exception("e".into())));

        assert!(exchanger.reset());
        assert!(!exchanger.is_done());
        assert_eq!(exchanger.try_get(), Ok(None));
    }

    #[test]
    fn get_timeout() {
        let exchanger = OnewayExchanger::<u32, String>::new(true);
        let timeout = Duration::from_millis(20);

        assert_eq!(exchanger.get_timeout(timeout), Err(Failure::Timeout(timeout)));
        assert!(!exchanger.is_done());
    }

    #[test]
    fn wakes_blocked_readers() {
        let exchanger = Arc::new(OnewayExchanger::<u32, String>::new(true));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let exchanger = exchanger.clone();
                thread::spawn(move || exchanger.get_timeout(Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        exchanger.set_value(7);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), Ok(7));
        }
    }
}
