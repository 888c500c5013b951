//! Testing utilities and mock implementations
//!
//! Mocks for the broker transport, the image executor and storage, the LLM
//! provider and the idempotency store, so the dispatch pipeline can be
//! exercised without external services.

pub mod mocks;

pub use mocks::*;
