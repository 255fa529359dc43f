//! Remote-node lifecycle and RPC/trace supervisor.
//!
//! The daemon owns a pool of SSH clients to remote hosts, tracks managed
//! BEAM nodes and their state machines, executes short-lived remote
//! evaluations through ephemeral bootstrap nodes, and runs the
//! message-trace pollers. An outer command framework drives it through the
//! typed operation surface on [`core::Core`].

pub mod core;
pub mod hosts;
pub mod nodes;
pub mod ops;
pub mod rpc;
pub mod shutdown;
pub mod ssh;
pub mod trace;

pub use crate::core::Core;
pub use beamctl_core::error::CoreError;
