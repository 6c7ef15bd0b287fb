//! Futures, tasks and the executor running them.

mod exchanger;
mod executor;
mod future;
mod task;

pub use exchanger::*;
pub use executor::*;
pub use future::*;
pub use task::*;
