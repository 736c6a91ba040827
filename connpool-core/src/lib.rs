//! connpool core primitives.
//!
//! This crate contains the concurrency building blocks the pool is assembled
//! from: the bounded container used for both idle connections and admission
//! tokens, the hot-swappable slot that holds the current container, the
//! cancellation context, and the endpoint model.

pub mod bounded;
pub mod context;
pub mod domain;

pub use bounded::{Bounded, ContainerError};
pub use context::{Context, ContextError};
pub use domain::endpoint::{Endpoint, Network, UnknownNetwork};
pub use domain::slot::BoundedSlot;
