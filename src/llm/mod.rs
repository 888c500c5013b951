//! LLM provider layer used by the fallback classifier

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
