//! # nbdloop-proto
//!
//! Protocol types and constants for the nbdloop NBD loopback server.
//!
//! This crate defines the NBD transmission-phase wire format (the only
//! phase spoken on the kernel socket-pair path), the kernel device flag
//! bits, operational defaults, and the unified error type shared by all
//! nbdloop components.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod wire;

// Re-export commonly used types at the crate root
pub use error::{NbdError, NbdResult};
pub use wire::{ReplyHeader, RequestHeader};
