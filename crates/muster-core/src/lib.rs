//! muster-core — shared types, wire format, and the sealed envelope codec.
//! All other muster crates depend on this one.

pub mod config;
pub mod error;
pub mod identity;
pub mod sealed;
pub mod wire;

pub use error::{DispatchError, JoinError};
pub use identity::{Credential, Identity};
