//! Wire protocol for the image-task worker
//!
//! Inbound request validation, outbound response shapes, the running chat
//! summary and topic helpers.

pub mod messages;
pub mod summary;
pub mod topics;

pub use messages::*;
pub use summary::*;
pub use topics::*;
