//! Shared domain models.

pub mod endpoint;
pub mod slot;
