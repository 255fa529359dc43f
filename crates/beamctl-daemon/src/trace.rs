//! Per-node message-trace pollers and the merged edge view.
//!
//! start-trace installs a registered collector process on the target node
//! that counts `send` trace events per `(from, to)` pair and resets its
//! counters on every flush. A per-node poller flushes the collector every
//! three seconds and replaces the local edge view with the per-poll deltas;
//! accumulating across polls is the consumer's job. A failed poll is logged
//! and the next tick proceeds, without back-off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beamctl_core::error::CoreError;
use beamctl_core::schema::{TraceEdge, TraceView};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::hosts::HostEntry;
use crate::rpc::{self, DEFAULT_RPC_TIMEOUT, RpcTarget};

/// Poll cadence for active traces.
pub(crate) const TRACE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Installs the collector unless one is already registered. The collector
/// labels endpoints by registered name where one exists, pid otherwise.
const INSTALL_COLLECTOR_EXPR: &str = "case erlang:whereis(mcp_trace_agent) of \
 undefined -> \
   Collector = spawn(fun() -> \
     Label = fun(E) when is_pid(E) -> \
         case erlang:process_info(E, registered_name) of \
           {registered_name, N} -> N; \
           _ -> E \
         end; \
       (E) -> E end, \
     erlang:trace(all, true, [send]), \
     Loop = fun Self(Acc) -> \
       receive \
         {trace, From, send, _Msg, To} -> \
           Self(maps:update_with({Label(From), Label(To)}, fun(C) -> C + 1 end, 1, Acc)); \
         {flush, Caller} -> \
           Caller ! {trace_edges, Acc}, \
           Self(#{}); \
         stop -> \
           erlang:trace(all, false, [send]) \
       end \
     end, \
     Loop(#{}) \
   end), \
   register(mcp_trace_agent, Collector), \
   ok; \
 _ -> \
   already_started \
end";

/// Flushes the collector and prints one `from|to|count` line per edge.
const FLUSH_COLLECTOR_EXPR: &str = "case erlang:whereis(mcp_trace_agent) of \
 undefined -> io:format(\"error:trace_not_running~n\"); \
 Collector -> \
   Collector ! {flush, self()}, \
   receive \
     {trace_edges, Edges} -> \
       maps:fold(fun({From, To}, Count, ok) -> \
         io:format(\"~p|~p|~p~n\", [From, To, Count]), ok \
       end, ok, Edges) \
   after 2000 -> io:format(\"error:trace_flush_timeout~n\") \
   end \
end";

/// Tells the collector to disable tracing and exit; its registration dies
/// with it.
const STOP_COLLECTOR_EXPR: &str = "case erlang:whereis(mcp_trace_agent) of \
 undefined -> ok; \
 Collector -> Collector ! stop, ok \
end";

struct TraceEntry {
    edges: Arc<Mutex<HashMap<(String, String), u64>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one poller per traced node.
#[derive(Default)]
pub struct TraceSupervisor {
    entries: Mutex<HashMap<String, TraceEntry>>,
}

impl TraceSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Current view for a node: `active = false` with no edges when no
    /// trace is running.
    pub fn view(&self, name: &str) -> TraceView {
        let entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(entry) => {
                let mut edges: Vec<TraceEdge> = entry
                    .edges
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|((from, to), count)| TraceEdge {
                        from: from.clone(),
                        to: to.clone(),
                        count: *count,
                    })
                    .collect();
                edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
                TraceView {
                    active: true,
                    edges,
                }
            }
            None => TraceView {
                active: false,
                edges: Vec::new(),
            },
        }
    }

    fn install(&self, name: &str, entry: TraceEntry) {
        self.entries.lock().unwrap().insert(name.to_string(), entry);
    }

    /// Cancel a node's poller and await its exit. Returns `false` when no
    /// trace was active.
    pub async fn cancel(&self, name: &str) -> bool {
        let entry = self.entries.lock().unwrap().remove(name);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                let _ = entry.task.await;
                true
            }
            None => false,
        }
    }

    /// Cancel every poller. Used by the shutdown coordinator.
    pub async fn cancel_all(&self) {
        let names: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.cancel(&name).await;
        }
    }
}

impl Core {
    /// Turn message tracing on for a running node.
    ///
    /// Idempotent: a second start on an already-traced node is a no-op.
    ///
    /// # Errors
    ///
    /// `NodeUnknown` / `NodeBadState` before any I/O; transport and
    /// reachability errors from installing the collector.
    pub async fn start_trace(&self, name: &str) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        let node = self.running_node(name)?;
        if self.tracer.is_active(name) {
            return Ok(format!("Trace already active for {name}."));
        }

        let host = self.hosts().get(&node.config.host_label)?;
        let client = host.connection(&key).await?;
        let target = RpcTarget {
            qualified_name: node.qualified_name.clone(),
            cookie: node.config.cookie.clone(),
        };
        rpc::rpc_printed(
            &client,
            host.spec(),
            &target,
            INSTALL_COLLECTOR_EXPR,
            DEFAULT_RPC_TIMEOUT,
        )
        .await?;

        let entry = spawn_poller(name.to_string(), host, key, target);
        self.tracer.install(name, entry);
        info!(node = %name, "trace started");
        Ok(format!("Trace started for {name}."))
    }

    /// Turn tracing off: remote un-register, poller cancellation, view
    /// cleared.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigMissing`] only; stopping a trace that is not
    /// active is a no-op, and the remote un-register is best-effort (the
    /// node may already be gone).
    pub async fn stop_trace(&self, name: &str) -> Result<String, CoreError> {
        let key = self.ensure_operational()?.to_string();
        if !self.tracer.cancel(name).await {
            return Ok(format!("No trace active for {name}."));
        }

        if let Ok(node) = self.running_node(name)
            && let Ok(host) = self.hosts().get(&node.config.host_label)
        {
            let target = RpcTarget {
                qualified_name: node.qualified_name.clone(),
                cookie: node.config.cookie.clone(),
            };
            let result = match host.connection(&key).await {
                Ok(client) => {
                    rpc::rpc_printed(
                        &client,
                        host.spec(),
                        &target,
                        STOP_COLLECTOR_EXPR,
                        DEFAULT_RPC_TIMEOUT,
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(node = %name, error = %err, "collector un-register failed");
            }
        }

        info!(node = %name, "trace stopped");
        Ok(format!("Trace stopped for {name}."))
    }

    /// The poll-trace view: edges observed in the most recent poll window.
    ///
    /// # Errors
    ///
    /// [`CoreError::NodeUnknown`] when the node does not exist.
    pub fn poll_trace(&self, name: &str) -> Result<TraceView, CoreError> {
        if !self.nodes.lock().unwrap().contains(name) {
            return Err(CoreError::NodeUnknown(name.to_string()));
        }
        Ok(self.tracer.view(name))
    }
}

fn spawn_poller(
    name: String,
    host: Arc<HostEntry>,
    key: String,
    target: RpcTarget,
) -> TraceEntry {
    let edges: Arc<Mutex<HashMap<(String, String), u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let cancel = CancellationToken::new();

    let poll_edges = Arc::clone(&edges);
    let poll_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = interval(TRACE_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = poll_cancel.cancelled() => {
                    debug!(node = %name, "trace poller cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    poll_once(&name, &host, &key, &target, &poll_edges).await;
                }
            }
        }
    });

    TraceEntry {
        edges,
        cancel,
        task,
    }
}

async fn poll_once(
    name: &str,
    host: &Arc<HostEntry>,
    key: &str,
    target: &RpcTarget,
    edges: &Arc<Mutex<HashMap<(String, String), u64>>>,
) {
    let client = match host.connection(key).await {
        Ok(client) => client,
        Err(err) => {
            warn!(node = %name, error = %err, "trace poll could not connect");
            return;
        }
    };
    match rpc::rpc_raw(
        &client,
        host.spec(),
        target,
        FLUSH_COLLECTOR_EXPR,
        DEFAULT_RPC_TIMEOUT,
    )
    .await
    {
        Ok(output) => {
            *edges.lock().unwrap() = parse_edge_lines(&output);
        }
        Err(err) => {
            warn!(node = %name, error = %err, "trace poll failed");
        }
    }
}

/// Parse `from|to|count` lines; malformed lines are dropped.
fn parse_edge_lines(output: &str) -> HashMap<(String, String), u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            let from = fields.next()?.trim();
            let to = fields.next()?.trim();
            let count: u64 = fields.next()?.trim().parse().ok()?;
            if fields.next().is_some() || from.is_empty() || to.is_empty() {
                return None;
            }
            Some(((from.to_string(), to.to_string()), count))
        })
        .collect()
}
