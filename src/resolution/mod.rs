//! Task resolution: from a request and its chat history to one operation
//!
//! The indexer projects the request into addressable images, the resolver
//! runs the rule cascade over them, and the optional fallback classifier
//! refines only the cascade's last-resort outcome.

pub mod descriptor;
pub mod fallback;
pub mod indexer;
pub mod references;
pub mod resolver;
pub mod vocabulary;

pub use descriptor::{OperationDescriptor, OperationKind, ResolutionRule};
pub use fallback::{ClassifierDecision, FallbackClassifier};
pub use indexer::{index_request, ImageIndex, IndexedImage, SourceKind};
pub use resolver::{resolve, Signals};

use thiserror::Error;

/// Structurally invalid explicit image references
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Unknown image source in reference '{token}' (expected upload#N or chat#N)")]
    UnknownSource { token: String },
    #[error("Reference {kind}#{index} is out of range ({available} {kind} images)")]
    IndexOutOfRange {
        kind: SourceKind,
        index: usize,
        available: usize,
    },
}
