//! Pending outputs and chain resolution.

mod pending;
mod resolver;

pub use pending::PendingSet;
pub use resolver::{ChainResolver, Resolution};
