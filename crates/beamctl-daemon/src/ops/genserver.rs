//! Generic-server operations on managed nodes.
//!
//! Term-valued inputs (`args`, `message`) are Erlang-term source supplied by
//! the caller and pass through verbatim; only the atoms (module, registered
//! name) are validated here.

use std::time::Duration;

use beamctl_core::error::CoreError;
use beamctl_core::text;
use tracing::info;

use crate::core::Core;
use crate::rpc::{self, DEFAULT_RPC_TIMEOUT, RpcTarget};

/// Bounds and default of the gen_server:call timeout, milliseconds.
pub(crate) const CALL_TIMEOUT_MIN_MS: u64 = 1;
pub(crate) const CALL_TIMEOUT_MAX_MS: u64 = 60_000;
pub(crate) const CALL_TIMEOUT_DEFAULT_MS: u64 = 5_000;

/// Inputs of the start-genserver operation.
#[derive(Debug, Clone)]
pub struct StartGenServerRequest {
    pub node: String,
    /// Callback module atom.
    pub module: String,
    /// Init argument as Erlang-term source; defaults to `[]`.
    pub args: Option<String>,
    /// Optional `{local, Name}` registration atom.
    pub register_as: Option<String>,
}

/// Inputs of the call-genserver operation.
#[derive(Debug, Clone)]
pub struct CallGenServerRequest {
    pub node: String,
    /// Registered server atom.
    pub server: String,
    /// Message as Erlang-term source.
    pub message: String,
    /// Call timeout, clamped to `[1, 60000]` ms; defaults to 5000.
    pub timeout_ms: Option<u64>,
}

/// Clamp a requested call timeout into the documented bounds.
pub(crate) fn clamp_call_timeout(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(CALL_TIMEOUT_DEFAULT_MS)
        .clamp(CALL_TIMEOUT_MIN_MS, CALL_TIMEOUT_MAX_MS)
}

/// Outer SSH deadline for a call: the transport must never terminate the
/// RPC before the callee's own timeout fires.
pub(crate) fn call_ssh_timeout(call_timeout_ms: u64) -> Duration {
    Duration::from_millis(std::cmp::max(call_timeout_ms + 5_000, 10_000))
}

impl Core {
    /// Start a generic server on a running node.
    ///
    /// Uses `gen_server:start`, never `start_link`, so the ephemeral
    /// bootstrap's exit does not take the new server down with it.
    ///
    /// # Errors
    ///
    /// `BadAtomName` before any I/O for an invalid module or registration
    /// atom; `NodeUnknown` / `NodeBadState`; transport errors otherwise.
    pub async fn start_genserver(&self, req: StartGenServerRequest) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        if !text::is_valid_atom(&req.module) {
            return Err(CoreError::BadAtomName(req.module));
        }
        if let Some(register_as) = &req.register_as
            && !text::is_valid_atom(register_as)
        {
            return Err(CoreError::BadAtomName(register_as.clone()));
        }
        let node = self.running_node(&req.node)?;

        let args = req.args.as_deref().unwrap_or("[]");
        let expr = match &req.register_as {
            Some(register_as) => format!(
                "gen_server:start({{local, {register_as}}}, {}, {args}, [])",
                req.module
            ),
            None => format!("gen_server:start({}, {args}, [])", req.module),
        };

        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        let result =
            rpc::rpc_printed(&client, host.spec(), &target, &expr, DEFAULT_RPC_TIMEOUT).await?;
        info!(node = %req.node, module = %req.module, "gen_server started");
        Ok(result)
    }

    /// Synchronous call to a registered server.
    ///
    /// # Errors
    ///
    /// `BadAtomName`, `NodeUnknown` / `NodeBadState` before any I/O;
    /// [`CoreError::RemoteEvalError`] when the call itself failed remotely
    /// (including callee timeouts, which surface as `{badrpc, ...}` terms).
    pub async fn call_genserver(&self, req: CallGenServerRequest) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        if !text::is_valid_atom(&req.server) {
            return Err(CoreError::BadAtomName(req.server));
        }
        let node = self.running_node(&req.node)?;

        let timeout_ms = clamp_call_timeout(req.timeout_ms);
        let expr = format!(
            "gen_server:call({}, {}, {timeout_ms})",
            req.server, req.message
        );

        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        let output = rpc::rpc_printed(
            &client,
            host.spec(),
            &target,
            &expr,
            call_ssh_timeout(timeout_ms),
        )
        .await?;

        if output.trim_start().starts_with("{badrpc") {
            return Err(CoreError::RemoteEvalError(output));
        }
        Ok(output)
    }

    /// Stop a registered server with reason `normal` and a 5 s grace.
    ///
    /// # Errors
    ///
    /// Same precheck surface as [`Core::call_genserver`].
    pub async fn stop_genserver(&self, node_name: &str, server: &str) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        if !text::is_valid_atom(server) {
            return Err(CoreError::BadAtomName(server.to_string()));
        }
        let node = self.running_node(node_name)?;

        let expr = format!("gen_server:stop({server}, normal, 5000)");
        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        let result =
            rpc::rpc_printed(&client, host.spec(), &target, &expr, DEFAULT_RPC_TIMEOUT).await?;
        info!(node = %node_name, server = %server, "gen_server stopped");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_timeout_defaults_to_five_seconds() {
        assert_eq!(clamp_call_timeout(None), 5_000);
    }

    #[test]
    fn call_timeout_clamps_into_bounds() {
        assert_eq!(clamp_call_timeout(Some(0)), 1);
        assert_eq!(clamp_call_timeout(Some(1)), 1);
        assert_eq!(clamp_call_timeout(Some(90_000)), 60_000);
        assert_eq!(clamp_call_timeout(Some(250)), 250);
    }

    #[test]
    fn ssh_timeout_never_undercuts_the_callee() {
        // Short call timeouts still get the 10 s transport floor.
        assert_eq!(call_ssh_timeout(1), Duration::from_millis(10_000));
        assert_eq!(call_ssh_timeout(5_000), Duration::from_millis(10_000));
        // Long ones get the full callee timeout plus headroom.
        assert_eq!(call_ssh_timeout(60_000), Duration::from_millis(65_000));
    }
}
