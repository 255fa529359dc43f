//! Module deployment: upload, compile, hot-load, cleanup.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use beamctl_core::error::CoreError;
use beamctl_core::schema::NodeKind;
use beamctl_core::text;
use tracing::{debug, info};

use crate::core::Core;
use crate::rpc::{self, DEFAULT_RPC_TIMEOUT, RpcTarget};
use crate::ssh::DEFAULT_EXEC_TIMEOUT;

impl Core {
    /// Compile and hot-load `code` on a running node.
    ///
    /// The source travels through a base64 round-trip into a temp file on
    /// the remote host; the file is removed again whether or not the
    /// compile succeeds. Compile errors come back as the rendered
    /// `{error, ...}` term, not as an operation failure.
    ///
    /// # Errors
    ///
    /// `NodeUnknown` / `NodeBadState` before any I/O; transport and
    /// reachability errors from the upload or the evaluation.
    pub async fn deploy_module(
        &self,
        name: &str,
        code: &str,
        language: NodeKind,
    ) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        let node = self.running_node(name)?;
        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;

        let extension = match language {
            NodeKind::Erlang => "erl",
            NodeKind::Elixir => "ex",
        };
        let remote_path = format!("/tmp/mcp_deploy_{}.{extension}", rpc::epoch_millis());
        let encoded = BASE64.encode(code.as_bytes());
        let upload = format!(
            "printf %s {} | base64 -d > {}",
            text::quote(&encoded),
            text::quote(&remote_path),
        );
        client.exec_simple(&upload, DEFAULT_EXEC_TIMEOUT).await?;

        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        let result = rpc::rpc_printed(
            &client,
            host.spec(),
            &target,
            &compile_expr(language, &remote_path),
            DEFAULT_RPC_TIMEOUT,
        )
        .await;

        // Cleanup runs regardless of the compile outcome; its own failure is
        // logged, never reported.
        let cleanup = format!("rm -f {}", text::quote(&remote_path));
        if let Err(err) = client.exec_simple(&cleanup, DEFAULT_EXEC_TIMEOUT).await {
            debug!(path = %remote_path, error = %err, "deploy temp file cleanup failed");
        }

        if result.is_ok() {
            info!(node = %name, language = %language, "module deployed");
        }
        result
    }
}

/// Compile-and-load expression for the given language.
///
/// Erlang loads the compiled binary into the running node; Elixir compiles
/// through `Code.compile_file/1`, with exceptions folded into an error
/// tuple.
fn compile_expr(language: NodeKind, path: &str) -> String {
    match language {
        NodeKind::Erlang => format!(
            "case compile:file(\"{path}\", [binary, return_errors]) of \
             {{ok, Mod, Bin}} -> code:load_binary(Mod, \"{path}\", Bin); \
             Other -> Other end"
        ),
        NodeKind::Elixir => format!(
            "try 'Elixir.Code':compile_file(<<\"{path}\">>) of \
             Compiled -> {{ok, Compiled}} \
             catch Class:Reason -> {{error, {{Class, Reason}}}} end"
        ),
    }
}
