//! Node lifecycle: start, stop, restart, list, inspect.

use std::sync::Arc;
use std::time::Duration;

use beamctl_core::error::CoreError;
use beamctl_core::schema::{NodeInspect, NodeKind, NodeStatus, NodeSummary, ProcessInfo};
use beamctl_core::text;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::hosts::HostEntry;
use crate::nodes::{NodeConfig, NodeSnapshot};
use crate::rpc::{self, DEFAULT_RPC_TIMEOUT, RpcTarget};
use crate::ssh::{self, DEFAULT_EXEC_TIMEOUT, NodeChannel};

/// Delay before the start probe. Short-name registration is not instant
/// after process spawn; probing earlier yields spurious errors.
pub(crate) const START_PROBE_DELAY: Duration = Duration::from_secs(2);

/// Cookie used when neither the caller nor the remote `~/.erlang.cookie`
/// provides one.
pub(crate) const DEFAULT_COOKIE: &str = "beamctl_cookie";

/// Fold over registered processes printing one pipe-delimited record each.
/// A process that disappears or misbehaves mid-fold is skipped, not fatal.
const INSPECT_EXPR: &str = "lists:foreach(fun(Name) -> \
 try \
   Pid = erlang:whereis(Name), \
   true = is_pid(Pid), \
   Info = erlang:process_info(Pid, [status, message_queue_len, memory, current_function]), \
   {status, St} = lists:keyfind(status, 1, Info), \
   {message_queue_len, Q} = lists:keyfind(message_queue_len, 1, Info), \
   {memory, Mem} = lists:keyfind(memory, 1, Info), \
   {current_function, {M, F, A}} = lists:keyfind(current_function, 1, Info), \
   io:format(\"~s|~p|~p|~p|~p:~p/~p~n\", [Name, St, Q, Mem, M, F, A]) \
 catch _:_ -> ok end \
end, erlang:registered())";

/// Inputs of the start-node operation.
#[derive(Debug, Clone)]
pub struct StartNodeRequest {
    pub name: String,
    pub kind: NodeKind,
    pub cookie: Option<String>,
    pub host: Option<String>,
}

impl Core {
    /// Launch a fresh named BEAM node.
    ///
    /// Returns immediately after the remote process is spawned; the node
    /// sits in `starting` until the probe resolves it roughly two seconds
    /// later.
    ///
    /// # Errors
    ///
    /// `ConfigMissing`, `BadAtomName`, `UnknownHost`, `NameTaken`, and the
    /// transport errors of the spawn itself.
    pub async fn start_node(&self, req: StartNodeRequest) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        if !text::is_valid_atom(&req.name) {
            return Err(CoreError::BadAtomName(req.name));
        }
        let host = self.host(req.host.as_deref())?;

        // Claim before any I/O so a concurrent start on the same name fails
        // fast with NameTaken.
        self.nodes.lock().unwrap().claim(&req.name)?;
        match self.launch(&host, &key, &req).await {
            Ok(message) => Ok(message),
            Err(err) => {
                self.nodes.lock().unwrap().release(&req.name);
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        host: &Arc<HostEntry>,
        key: &str,
        req: &StartNodeRequest,
    ) -> Result<String, CoreError> {
        let client = host.connection(key).await?;
        let short_host = host.remote_short_host(key).await?;
        let cookie = match &req.cookie {
            Some(cookie) => cookie.clone(),
            None => resolve_remote_cookie(&client).await,
        };

        let command = launch_command(host.spec(), req.kind, &req.name, &cookie);
        let channel = ssh::exec_stream(host.spec(), key, &command).await?;

        let config = NodeConfig {
            host_label: host.spec().label.clone(),
            kind: req.kind,
            cookie: cookie.clone(),
        };
        let generation = self.nodes.lock().unwrap().fulfill(
            &req.name,
            config,
            short_host.clone(),
            rpc::epoch_millis(),
            channel.clone(),
        );

        let qualified = format!("{}@{short_host}", req.name);
        self.spawn_close_watcher(req.name.clone(), generation, channel);
        self.spawn_start_probe(
            req.name.clone(),
            generation,
            Arc::clone(host),
            key.to_string(),
            RpcTarget {
                qualified_name: qualified.clone(),
                cookie,
            },
        );

        info!(node = %qualified, kind = %req.kind, "node launched");
        Ok(format!(
            "Node {qualified} launched; status will update after the first probe."
        ))
    }

    /// Wire the channel's close event into the registry. The flip happens
    /// exactly once; stale generations are discarded by the registry.
    fn spawn_close_watcher(&self, name: String, generation: u64, channel: NodeChannel) {
        let nodes = Arc::clone(&self.nodes);
        tokio::spawn(async move {
            channel.wait_closed().await;
            if nodes.lock().unwrap().mark_closed(&name, generation) {
                info!(node = %name, "remote channel closed, node stopped");
            }
        });
    }

    fn spawn_start_probe(
        &self,
        name: String,
        generation: u64,
        host: Arc<HostEntry>,
        key: String,
        target: RpcTarget,
    ) {
        let nodes = Arc::clone(&self.nodes);
        tokio::spawn(async move {
            tokio::time::sleep(START_PROBE_DELAY).await;
            let reachable = match host.connection(&key).await {
                Ok(client) => rpc::probe(&client, host.spec(), &target, DEFAULT_RPC_TIMEOUT).await,
                Err(err) => {
                    warn!(node = %name, error = %err, "start probe could not connect");
                    false
                }
            };
            if let Some(status) = nodes.lock().unwrap().resolve_probe(&name, generation, reachable)
            {
                info!(node = %name, status = %status, "start probe resolved");
            }
        });
    }

    /// Stop a managed node: remove the entry, then close its channel.
    ///
    /// Closing the stream terminates the remote BEAM through loss of its
    /// standard-input holder. The name is free for reuse as soon as this
    /// returns; a probe still in flight for the old launch is discarded.
    ///
    /// # Errors
    ///
    /// [`CoreError::NodeUnknown`] when no entry exists.
    pub async fn stop_node(&self, name: &str) -> Result<String, CoreError> {
        self.ensure_operational()?;
        let node = self
            .nodes
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| CoreError::NodeUnknown(name.to_string()))?;
        // A poller for a node that no longer exists has nothing to report.
        self.tracer.cancel(name).await;
        node.channel.close().await;
        info!(node = %name, "node stopped");
        Ok(format!("Node {name} stopped."))
    }

    /// Stop and relaunch under the same name with the same
    /// `(host, type, cookie)`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NodeUnknown`] when the node does not exist, plus the
    /// error surface of start-node for the relaunch.
    pub async fn restart_node(&self, name: &str) -> Result<String, CoreError> {
        self.ensure_operational()?;
        let config = {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get(name)
                .ok_or_else(|| CoreError::NodeUnknown(name.to_string()))?;
            node.config.clone()
        };
        self.stop_node(name).await?;
        self.start_node(StartNodeRequest {
            name: name.to_string(),
            kind: config.kind,
            cookie: Some(config.cookie),
            host: Some(config.host_label),
        })
        .await
    }

    /// The list-nodes view: every managed node, with a live process count
    /// for the running ones.
    ///
    /// A transient RPC failure leaves `process_count` null; it is not
    /// authoritative enough to flip the node's status.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigMissing`] only; per-node query failures are
    /// swallowed.
    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>, CoreError> {
        let key = self.ensure_operational()?.to_string();
        let snapshot = self.nodes.lock().unwrap().snapshot();

        let mut summaries = Vec::with_capacity(snapshot.len());
        for node in snapshot {
            let process_count = if node.status == NodeStatus::Running {
                self.query_process_count(&key, &node).await
            } else {
                None
            };
            summaries.push(NodeSummary {
                name: node.name,
                kind: node.config.kind,
                status: node.status,
                started_at: node.started_at,
                process_count,
            });
        }
        Ok(summaries)
    }

    async fn query_process_count(&self, key: &str, node: &NodeSnapshot) -> Option<u64> {
        let host = self.hosts().get(&node.config.host_label).ok()?;
        let client = host.connection(key).await.ok()?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        match rpc::rpc_printed(
            &client,
            host.spec(),
            &target,
            "erlang:system_info(process_count)",
            DEFAULT_RPC_TIMEOUT,
        )
        .await
        {
            Ok(output) => output.trim().parse().ok(),
            Err(err) => {
                debug!(node = %node.name, error = %err, "process count unavailable this tick");
                None
            }
        }
    }

    /// The inspect-node view: one record per registered process.
    ///
    /// # Errors
    ///
    /// `NodeUnknown` / `NodeBadState` before any I/O; transport and
    /// reachability errors from the evaluation.
    pub async fn inspect_node(&self, name: &str) -> Result<NodeInspect, CoreError> {
        let key = self.ensure_operational()?.to_string();
        let node = self.running_node(name)?;
        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        let output = rpc::rpc_raw(&client, host.spec(), &target, INSPECT_EXPR, DEFAULT_RPC_TIMEOUT)
            .await?;
        Ok(NodeInspect {
            node_name: node.name,
            node_type: node.config.kind,
            uptime: rpc::epoch_millis().saturating_sub(node.started_at),
            processes: parse_process_lines(&output),
        })
    }
}

/// Shell command launching a node of the given kind.
///
/// Both kinds carry the `PATH` prefix derived from the `erl` path: `elixir`
/// needs it to locate its own `erl`.
pub(crate) fn launch_command(
    spec: &beamctl_core::config::HostSpec,
    kind: NodeKind,
    name: &str,
    cookie: &str,
) -> String {
    let prefix = rpc::path_prefix(&spec.erl_path);
    match kind {
        NodeKind::Erlang => format!(
            "{prefix}{} -sname {name} -setcookie {} -noshell",
            spec.erl_path,
            text::quote(cookie),
        ),
        NodeKind::Elixir => format!(
            "{prefix}{} --sname {name} --cookie {} --no-halt",
            spec.elixir_path,
            text::quote(cookie),
        ),
    }
}

/// Cookie precedence below an explicit argument: the remote user's
/// `~/.erlang.cookie`, then the hard-coded fallback.
async fn resolve_remote_cookie(client: &Arc<crate::ssh::SshClient>) -> String {
    match client
        .exec_simple("cat ~/.erlang.cookie 2>/dev/null", DEFAULT_EXEC_TIMEOUT)
        .await
    {
        Ok(output) => match output.lines().next().map(str::trim) {
            Some(cookie) if !cookie.is_empty() => cookie.to_string(),
            _ => DEFAULT_COOKIE.to_string(),
        },
        Err(err) => {
            debug!(error = %err, "could not read remote cookie, using fallback");
            DEFAULT_COOKIE.to_string()
        }
    }
}

/// Parse the inspect output; rows that do not carry exactly five fields are
/// silently dropped.
fn parse_process_lines(output: &str) -> Vec<ProcessInfo> {
    output.lines().filter_map(parse_process_line).collect()
}

fn parse_process_line(line: &str) -> Option<ProcessInfo> {
    let mut fields = line.split('|');
    let name = fields.next()?.trim();
    let status = fields.next()?.trim();
    let message_queue_len = fields.next()?.trim().parse().ok()?;
    let memory = fields.next()?.trim().parse().ok()?;
    let current_function = fields.next()?.trim();
    if fields.next().is_some() || name.is_empty() {
        return None;
    }
    Some(ProcessInfo {
        name: name.to_string(),
        status: status.to_string(),
        message_queue_len,
        memory,
        current_function: current_function.to_string(),
    })
}
