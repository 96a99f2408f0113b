//! Blockio Store - Typed gateway to the distributed object store
//!
//! The [`StoreGateway`] trait is the seam between the image layer and the
//! object store client: one asynchronous method per named-object operation or
//! class-method call, each completing exactly once. [`MemoryStore`] is the
//! in-process implementation used by tests and embedded deployments.

pub mod gateway;
pub mod memory;

pub use gateway::StoreGateway;
pub use memory::{MemoryStore, PoolSnapshot, StoreOp};
