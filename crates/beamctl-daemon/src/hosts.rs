//! Host registry: per-host configuration, cached short hostname, cached
//! client.
//!
//! Populated once at startup and never reloaded. The only fields that mutate
//! after init are the cached remote short hostname and the cached SSH
//! client, both guarded by the host's own lock so that concurrent callers
//! await a single in-flight dial.

use std::collections::HashMap;
use std::sync::Arc;

use beamctl_core::config::HostSpec;
use beamctl_core::error::CoreError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ssh::{self, DEFAULT_EXEC_TIMEOUT, SshClient};

/// Mutable per-host state.
#[derive(Default)]
struct HostState {
    /// Remote `hostname -s`, resolved on first successful connect and then
    /// constant until process exit.
    remote_short_host: Option<String>,
    client: Option<Arc<SshClient>>,
}

/// One configured host.
pub struct HostEntry {
    spec: HostSpec,
    state: Mutex<HostState>,
}

impl HostEntry {
    fn new(spec: HostSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Return the cached client, dialing when absent or broken.
    ///
    /// The first successful connect also resolves the remote short hostname;
    /// if that probe fails the leftmost label of the configured hostname is
    /// used instead.
    ///
    /// # Errors
    ///
    /// [`CoreError::SshDial`] when the host cannot be reached or refuses the
    /// key.
    pub async fn connection(&self, key_pem: &str) -> Result<Arc<SshClient>, CoreError> {
        let mut state = self.state.lock().await;
        if let Some(client) = &state.client
            && !client.is_broken()
        {
            return Ok(Arc::clone(client));
        }
        state.client = None;

        let client = ssh::dial(&self.spec, key_pem).await?;
        if state.remote_short_host.is_none() {
            let short = match client.exec_simple("hostname -s", DEFAULT_EXEC_TIMEOUT).await {
                Ok(out) if !out.is_empty() => out,
                Ok(_) | Err(_) => {
                    let fallback = fallback_short_host(&self.spec.hostname);
                    warn!(
                        host = %self.spec.label,
                        fallback = %fallback,
                        "hostname probe failed, using configured hostname label"
                    );
                    fallback.to_string()
                }
            };
            debug!(host = %self.spec.label, short = %short, "remote short hostname resolved");
            state.remote_short_host = Some(short);
        }
        state.client = Some(Arc::clone(&client));
        Ok(client)
    }

    /// The remote short hostname, dialing on first use.
    pub async fn remote_short_host(&self, key_pem: &str) -> Result<String, CoreError> {
        {
            let state = self.state.lock().await;
            if let Some(short) = &state.remote_short_host {
                return Ok(short.clone());
            }
        }
        self.connection(key_pem).await?;
        let state = self.state.lock().await;
        state
            .remote_short_host
            .clone()
            .ok_or_else(|| CoreError::SshDial {
                host: self.spec.label.clone(),
                message: "short hostname unresolved".to_string(),
            })
    }

    /// Take the cached client out of the entry, if any. Used by shutdown.
    pub async fn take_client(&self) -> Option<Arc<SshClient>> {
        self.state.lock().await.client.take()
    }
}

/// The leftmost dot-separated label of a hostname.
fn fallback_short_host(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Keyed host map with stable configuration order.
pub struct HostRegistry {
    entries: HashMap<String, Arc<HostEntry>>,
    order: Vec<String>,
}

impl HostRegistry {
    pub fn new(specs: Vec<HostSpec>) -> Self {
        let mut entries = HashMap::new();
        let mut order = Vec::new();
        for spec in specs {
            let label = spec.label.clone();
            if entries.insert(label.clone(), Arc::new(HostEntry::new(spec))).is_none() {
                order.push(label);
            }
        }
        Self { entries, order }
    }

    /// # Errors
    ///
    /// [`CoreError::UnknownHost`] when no host carries this label.
    pub fn get(&self, label: &str) -> Result<Arc<HostEntry>, CoreError> {
        self.entries
            .get(label)
            .cloned()
            .ok_or_else(|| CoreError::UnknownHost(label.to_string()))
    }

    /// First configured host, used when an operation names none.
    pub fn default_host(&self) -> Option<Arc<HostEntry>> {
        self.order.first().and_then(|label| self.entries.get(label)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All entries, in configuration order.
    pub fn entries(&self) -> Vec<Arc<HostEntry>> {
        self.order
            .iter()
            .filter_map(|label| self.entries.get(label).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamctl_core::config::parse_hosts;

    #[test]
    fn fallback_takes_leftmost_label() {
        assert_eq!(fallback_short_host("build1.example.com"), "build1");
        assert_eq!(fallback_short_host("localhost"), "localhost");
    }

    #[test]
    fn unknown_label_errors() {
        let registry = HostRegistry::new(parse_hosts("a:u@h"));
        assert!(registry.get("a").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(CoreError::UnknownHost(_))
        ));
    }

    #[test]
    fn default_host_is_first_configured() {
        let registry = HostRegistry::new(parse_hosts("b:u@h2,a:u@h1"));
        let default = registry.default_host().unwrap();
        assert_eq!(default.spec().label, "b");
    }

    #[test]
    fn duplicate_labels_keep_latest_entry_once() {
        let registry = HostRegistry::new(parse_hosts("a:u@h1,a:v@h2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().spec().user, "v");
    }

    #[test]
    fn entries_follow_configuration_order() {
        let registry = HostRegistry::new(parse_hosts("x:u@h1,y:u@h2,z:u@h3"));
        let labels: Vec<String> = registry
            .entries()
            .iter()
            .map(|e| e.spec().label.clone())
            .collect();
        assert_eq!(labels, ["x", "y", "z"]);
    }
}
