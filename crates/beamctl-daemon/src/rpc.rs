//! Remote evaluation through ephemeral bootstrap nodes.
//!
//! The control-plane has no BEAM runtime of its own. To evaluate an
//! expression "on node N" it launches a short-lived bootstrap node on the
//! remote host that connects to the target over distribution, performs one
//! `rpc:call`, prints the result, and exits. Nothing persistent is installed
//! on the target, and a crash there cannot corrupt the control-plane.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use beamctl_core::config::HostSpec;
use beamctl_core::error::CoreError;
use beamctl_core::text;
use rand::Rng;
use tracing::debug;

use crate::ssh::SshClient;

/// Default deadline for a bootstrap evaluation.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Printed by the bootstrap when the target does not answer pings.
pub const UNREACHABLE_SENTINEL: &str = "error:node_unreachable";
/// Bootstrap name prefix for regular evaluations.
const EVAL_PREFIX: &str = "mcptmp";
/// Bootstrap name prefix for start probes, so remote process listings can
/// tell them apart.
const PROBE_PREFIX: &str = "mcpchk";

/// Target of a remote evaluation.
#[derive(Debug, Clone)]
pub struct RpcTarget {
    /// Fully-qualified `name@shortHost` identifier.
    pub qualified_name: String,
    /// Distribution cookie shared with the target.
    pub cookie: String,
}

/// Current wall clock as epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fresh bootstrap short name: `<prefix>_<ms-epoch>_<6 base-36 chars>`.
fn bootstrap_name(prefix: &str) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{prefix}_{}_{suffix}", epoch_millis())
}

/// How the bootstrap renders the call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Render {
    /// Pretty-print the result term (`~p`).
    Printed,
    /// Let the evaluated expression control output itself.
    Raw,
}

/// Erlang source evaluated by the bootstrap node.
///
/// Pings the target first; `pang` prints the unreachable sentinel and exits
/// nonzero so the caller can tell "target gone" from "expression failed".
/// The whole body is wrapped in try/catch with an explicit halt: a crashed
/// `-eval` would otherwise leave the bootstrap running until the transport
/// timeout fires.
fn eval_source(target: &str, expr: &str, render: Render) -> String {
    let call = format!("rpc:call('{target}', erlang, apply, [fun() -> {expr} end, []])");
    let on_pong = match render {
        Render::Printed => {
            format!("Result = {call}, io:format(\"~p~n\", [Result]), erlang:halt(0)")
        }
        Render::Raw => format!("{call}, erlang:halt(0)"),
    };
    format!(
        "try case net_adm:ping('{target}') of \
         pang -> io:format(\"{UNREACHABLE_SENTINEL}~n\"), erlang:halt(1); \
         pong -> {on_pong} end \
         catch Class:Reason -> io:format(\"error:~p~n\", [{{Class, Reason}}]), erlang:halt(1) end."
    )
}

/// `PATH=` prefix making sibling launchers findable when the configured
/// `erl` path is absolute (`elixir` needs it to locate its own `erl`).
pub(crate) fn path_prefix(erl_path: &str) -> String {
    match erl_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => format!("PATH={}:$PATH ", text::quote(dir)),
        _ => String::new(),
    }
}

/// Full shell command launching the bootstrap on `spec`.
fn bootstrap_command(
    spec: &HostSpec,
    name: &str,
    target: &RpcTarget,
    expr: &str,
    render: Render,
) -> String {
    let source = eval_source(&target.qualified_name, expr, render);
    format!(
        "{prefix}{erl} -sname {name} -setcookie {cookie} -noshell -eval {source}",
        prefix = path_prefix(&spec.erl_path),
        erl = spec.erl_path,
        cookie = text::quote(&target.cookie),
        source = text::quote(&source),
    )
}

async fn run(
    client: &Arc<SshClient>,
    spec: &HostSpec,
    target: &RpcTarget,
    expr: &str,
    render: Render,
    timeout: Duration,
    prefix: &str,
) -> Result<String, CoreError> {
    let name = bootstrap_name(prefix);
    let command = bootstrap_command(spec, &name, target, expr, render);
    debug!(host = %spec.label, bootstrap = %name, target = %target.qualified_name, "remote evaluation");
    let output = client.exec_simple(&command, timeout).await?;
    if output
        .lines()
        .any(|line| line.trim() == UNREACHABLE_SENTINEL)
    {
        return Err(CoreError::NodeUnreachable(target.qualified_name.clone()));
    }
    Ok(output)
}

/// Evaluate `expr` on the target and return its pretty-printed result.
///
/// # Errors
///
/// [`CoreError::NodeUnreachable`] when the target does not answer pings;
/// transport errors from the underlying execution otherwise.
pub async fn rpc_printed(
    client: &Arc<SshClient>,
    spec: &HostSpec,
    target: &RpcTarget,
    expr: &str,
    timeout: Duration,
) -> Result<String, CoreError> {
    run(client, spec, target, expr, Render::Printed, timeout, EVAL_PREFIX).await
}

/// Evaluate `expr` on the target; the expression owns its output format.
///
/// # Errors
///
/// Same surface as [`rpc_printed`].
pub async fn rpc_raw(
    client: &Arc<SshClient>,
    spec: &HostSpec,
    target: &RpcTarget,
    expr: &str,
    timeout: Duration,
) -> Result<String, CoreError> {
    run(client, spec, target, expr, Render::Raw, timeout, EVAL_PREFIX).await
}

/// Reachability probe: ping the target from a `mcpchk_`-named bootstrap.
///
/// Any failure (pang, timeout, transport) reads as unreachable; the probe
/// never propagates an error.
pub async fn probe(
    client: &Arc<SshClient>,
    spec: &HostSpec,
    target: &RpcTarget,
    timeout: Duration,
) -> bool {
    let expr = format!("net_adm:ping('{}')", target.qualified_name);
    match run(client, spec, target, &expr, Render::Printed, timeout, PROBE_PREFIX).await {
        Ok(output) => output.contains("pong"),
        Err(err) => {
            debug!(target = %target.qualified_name, error = %err, "probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> HostSpec {
        beamctl_core::config::parse_hosts("a:u@h:/opt/erlang/bin/erl")
            .pop()
            .unwrap()
    }

    fn target() -> RpcTarget {
        RpcTarget {
            qualified_name: "w1@build1".to_string(),
            cookie: "secret".to_string(),
        }
    }

    #[test]
    fn bootstrap_names_are_well_formed() {
        let name = bootstrap_name("mcptmp");
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "mcptmp");
        assert!(parts[1].bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[test]
    fn bootstrap_names_differ() {
        assert_ne!(bootstrap_name("mcptmp"), bootstrap_name("mcptmp"));
    }

    #[test]
    fn path_prefix_for_absolute_launcher() {
        assert_eq!(path_prefix("/opt/erlang/bin/erl"), "PATH='/opt/erlang/bin':$PATH ");
    }

    #[test]
    fn path_prefix_empty_for_bare_name() {
        assert_eq!(path_prefix("erl"), "");
    }

    #[test]
    fn eval_source_pings_before_calling() {
        let source = eval_source("w1@build1", "erlang:node()", Render::Printed);
        let ping_pos = source.find("net_adm:ping('w1@build1')").unwrap();
        let call_pos = source.find("rpc:call('w1@build1'").unwrap();
        assert!(ping_pos < call_pos);
        assert!(source.contains(UNREACHABLE_SENTINEL));
        assert!(source.contains("erlang:halt(1)"));
    }

    #[test]
    fn eval_source_halts_even_when_the_expression_crashes() {
        let source = eval_source("w1@build1", "erlang:error(boom)", Render::Printed);
        assert!(source.starts_with("try "));
        assert!(source.contains("catch Class:Reason ->"));
        assert!(source.trim_end().ends_with("end."));
    }

    #[test]
    fn printed_render_formats_result() {
        let source = eval_source("w1@build1", "ok", Render::Printed);
        assert!(source.contains("io:format(\"~p~n\", [Result])"));
    }

    #[test]
    fn raw_render_leaves_output_to_expression() {
        let source = eval_source("w1@build1", "io:format(\"x\")", Render::Raw);
        assert!(!source.contains("[Result]"));
    }

    #[test]
    fn bootstrap_command_shape() {
        let command = bootstrap_command(&spec(), "mcptmp_1_abcdef", &target(), "ok", Render::Printed);
        assert!(command.starts_with("PATH='/opt/erlang/bin':$PATH /opt/erlang/bin/erl "));
        assert!(command.contains("-sname mcptmp_1_abcdef"));
        assert!(command.contains("-setcookie 'secret'"));
        assert!(command.contains("-noshell -eval '"));
    }

    #[test]
    fn bootstrap_command_quotes_embedded_quotes() {
        let command = bootstrap_command(
            &spec(),
            "mcptmp_1_abcdef",
            &target(),
            "gen_server:call(x, hello)",
            Render::Printed,
        );
        // The generated Erlang source contains single quotes around the
        // target atom; they must arrive shell-escaped.
        assert!(command.contains("'\\''"));
    }
}
