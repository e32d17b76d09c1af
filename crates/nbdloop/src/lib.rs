//! # nbdloop
//!
//! Expose a user-supplied block-device backend as a local `/dev/nbdN` node.
//!
//! One end of a Unix socket pair is handed to the kernel through the NBD
//! control ioctls; the other end is driven by a per-connection engine
//! ([`NbdServer`]) that turns NBD wire requests into calls on a [`Backend`]
//! and streams the completions back. The [`Loopback`] multiplexer owns the
//! kernel attachment: device selection, the binding ioctls, the kernel-side
//! service thread, and the shared poll entry point.
//!
//! The engine has no executor. Host threads drive it by calling
//! [`NbdServer::data_poll`] (often) and [`NbdServer::config_poll`] (about
//! once a second); any number of threads may call concurrently, and
//! try-only exclusion gates keep at most one thread in each pipeline.

pub mod backend;
pub mod cache;
mod cmd;
pub mod list;
pub mod loopback;
pub mod server;

pub use backend::{Backend, BufAlloc, DeviceParams, HeapAlloc};
pub use cmd::CmdOp;
pub use loopback::Loopback;
pub use server::{IoRequest, NbdServer};
