//! Idempotent image-task dispatch worker
//!
//! Consumes image requests from an MQTT broker, resolves each one into a
//! single operation with a deterministic rule cascade, executes it through an
//! injected image executor, and publishes exactly one terminal response per
//! request id no matter how often the broker redelivers it.
//!
//! # Overview
//!
//! - [`protocol`] - inbound request parsing and the outbound message shapes
//! - [`idempotency`] - atomic per-request claims backed by SQLite
//! - [`resolution`] - image indexing, the rule cascade, the optional LLM fallback
//! - [`executor`] / [`storage`] - image generation and result storage capabilities
//! - [`publisher`] - bounded-retry response publishing
//! - [`dispatcher`] - the per-delivery state machine and worker loop
//! - [`transport`] - broker abstraction with an MQTT v5 binding
//!
//! # Quick Start
//!
//! ```rust
//! use imagetask_worker::protocol::ImageTaskRequest;
//! use imagetask_worker::resolution::{index_request, resolve, OperationKind};
//!
//! let raw = br#"{"requestId":"r1","prompt":"","imagesPath":["u/a.png"],"chat":[]}"#;
//! let request = ImageTaskRequest::from_slice(raw).unwrap();
//! let index = index_request(&request);
//! let descriptor = resolve(&request, &index).unwrap();
//!
//! assert_eq!(descriptor.kind, Some(OperationKind::StyleTransfer));
//! assert!(descriptor.apply_style_transfer);
//! assert!(!descriptor.needs_clarification);
//! assert_eq!(descriptor.base.unwrap().locator, "u/a.png");
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod llm;
pub mod observability;
pub mod protocol;
pub mod publisher;
pub mod resolution;
pub mod storage;
pub mod testing;
pub mod transport;

pub use config::{FailurePolicy, WorkerConfig};
pub use dispatcher::{DispatchOutcome, DispatchReason, Dispatcher, WorkerLifecycle};
pub use error::{WorkerError, WorkerResult};
pub use idempotency::{ClaimOutcome, IdempotencyStore};
pub use protocol::{ImageTaskRequest, OutboundResponse};
pub use publisher::ResponsePublisher;
pub use resolution::{OperationDescriptor, OperationKind};
