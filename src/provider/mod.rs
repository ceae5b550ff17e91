//! Provider module for Stackform.
//!
//! This module contains everything that talks to the cloud control plane:
//! - The `Provider` trait the planner and executor depend on
//! - The resource catalog (required, force-new, updatable and computed attributes)
//! - An HTTP client and an in-memory implementation
//! - The retry policy wrapped around every provider call

mod catalog;
mod client;
mod memory;
mod retry;
mod traits;

pub use catalog::{schema_for, KindSchema, CATALOG};
pub use client::{HttpProvider, DEFAULT_ENDPOINT};
pub use memory::{Fault, FaultKind, MemoryProvider, Operation, ProviderCall};
pub use retry::RetryPolicy;
#[cfg(test)]
pub use traits::MockProvider;
pub use traits::{Attributes, Provider, ProviderResource};
