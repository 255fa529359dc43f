//! Core types and schemas for the beamctl control-plane.
//!
//! This crate provides the foundations shared by the daemon and any outer
//! command framework embedding it:
//!
//! - environment configuration (host list, key material)
//! - the operation error taxonomy
//! - shell-word quoting and atom-name validation for generated remote
//!   commands
//! - serializable view payloads consumed by dashboard widgets

pub mod config;
pub mod error;
pub mod logging;
pub mod schema;
pub mod text;

pub use config::{Config, HostSpec};
pub use error::CoreError;
pub use schema::{NodeKind, NodeStatus};
