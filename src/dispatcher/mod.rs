//! Request dispatch: the per-delivery state machine and the worker loop
//! around it

pub mod consumer;
pub mod lifecycle;

pub use consumer::{DispatchOutcome, DispatchReason, Dispatcher};
pub use lifecycle::{LifecycleError, WorkerLifecycle};
