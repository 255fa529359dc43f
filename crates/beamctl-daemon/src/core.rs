//! The control-plane core: configuration, registries, and shared services.

use std::sync::Arc;

use beamctl_core::config::Config;
use beamctl_core::error::CoreError;

use crate::hosts::{HostEntry, HostRegistry};
use crate::nodes::{SharedNodeRegistry, new_node_registry};
use crate::trace::TraceSupervisor;

/// Explicit store for everything the operation surface needs.
///
/// Initialised once from the environment and passed by reference thereafter;
/// there are no ambient singletons. The operation surface (start/stop/
/// inspect/deploy/gen-server/trace) lives in [`crate::ops`] and
/// [`crate::trace`] as methods on this type.
pub struct Core {
    config: Config,
    hosts: HostRegistry,
    pub(crate) nodes: SharedNodeRegistry,
    pub(crate) tracer: TraceSupervisor,
}

impl Core {
    pub fn new(config: Config) -> Self {
        let hosts = HostRegistry::new(config.hosts.clone());
        Self {
            config,
            hosts,
            nodes: new_node_registry(),
            tracer: TraceSupervisor::new(),
        }
    }

    /// Build a core from the process environment.
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    /// Configuration guard shared by every operation; returns the key
    /// material on success.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigMissing`] when no host or key is configured.
    pub(crate) fn ensure_operational(&self) -> Result<&str, CoreError> {
        if self.hosts.is_empty() {
            return Err(CoreError::ConfigMissing("no ssh hosts configured"));
        }
        self.config.ensure_operational()
    }

    /// Resolve an optional host label to an entry; `None` selects the first
    /// configured host.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownHost`] for a label not in the registry;
    /// [`CoreError::ConfigMissing`] when no hosts exist at all.
    pub(crate) fn host(&self, label: Option<&str>) -> Result<Arc<HostEntry>, CoreError> {
        match label {
            Some(label) => self.hosts.get(label),
            None => self
                .hosts
                .default_host()
                .ok_or(CoreError::ConfigMissing("no ssh hosts configured")),
        }
    }
}
