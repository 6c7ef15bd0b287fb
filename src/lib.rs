#![doc = include_str!("../README.md")]

// Public modules
pub mod altloc;
pub mod common;
pub mod concurrent;
pub mod dispatcher;
pub mod handler;
pub mod manager;
pub mod result;

mod config;
mod context;
mod dht;
mod error;

pub use bytes::Bytes;
pub use common::{Contact, ContactState, DhtValueEntity, DhtValueType, EntityKey, Kuid};
pub use concurrent::DhtFuture;
pub use config::*;
pub use dht::{Dht, DhtBuilder};
pub use dispatcher::sim;
pub use error::Error;

/// Alias for `Result<T, mojito::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
