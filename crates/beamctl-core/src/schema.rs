//! View payload schemas consumed by dashboard widgets.
//!
//! Widgets receive these as JSON; integer fields that can be unavailable for
//! a tick are `Option` and serialise to `null` rather than a sentinel value.

use serde::{Deserialize, Serialize};

/// Which BEAM launcher backs a managed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Erlang,
    Elixir,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Erlang => "erlang",
            Self::Elixir => "elixir",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erlang" => Ok(Self::Erlang),
            "elixir" => Ok(Self::Elixir),
            other => Err(format!("unknown node type: {other:?}")),
        }
    }
}

/// Lifecycle status of a managed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Launched; awaiting the first reachability probe.
    Starting,
    /// Probe answered `pong`.
    Running,
    /// Probe failed or timed out.
    Error,
    /// Remote channel observed closed, or explicit stop in flight.
    Stopped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One row of the list-nodes view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Launch wall-clock time, epoch milliseconds.
    pub started_at: u64,
    /// `null` when the count was not queryable this tick.
    pub process_count: Option<u64>,
}

/// One registered process in the inspect-node view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub status: String,
    pub message_queue_len: u64,
    pub memory: u64,
    /// Rendered as `M:F/A`.
    pub current_function: String,
}

/// The inspect-node view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInspect {
    pub node_name: String,
    pub node_type: NodeKind,
    /// Milliseconds since launch.
    pub uptime: u64,
    pub processes: Vec<ProcessInfo>,
}

/// One message-flow edge observed in the most recent poll window.
///
/// Counts are per-poll deltas; accumulating across polls is the consumer's
/// job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEdge {
    pub from: String,
    pub to: String,
    pub count: u64,
}

/// The poll-trace view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceView {
    pub active: bool,
    pub edges: Vec<TraceEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_summary_serialises_camel_case_with_null_count() {
        let summary = NodeSummary {
            name: "w1".into(),
            kind: NodeKind::Erlang,
            status: NodeStatus::Running,
            started_at: 1_700_000_000_000,
            process_count: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["name"], "w1");
        assert_eq!(json["type"], "erlang");
        assert_eq!(json["status"], "running");
        assert_eq!(json["startedAt"], 1_700_000_000_000_u64);
        assert!(json["processCount"].is_null());
    }

    #[test]
    fn process_info_field_names() {
        let info = ProcessInfo {
            name: "code_server".into(),
            status: "waiting".into(),
            message_queue_len: 0,
            memory: 42_000,
            current_function: "code_server:loop/1".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["messageQueueLen"], 0);
        assert_eq!(json["currentFunction"], "code_server:loop/1");
    }

    #[test]
    fn node_kind_round_trips_from_str() {
        assert_eq!("erlang".parse::<NodeKind>().unwrap(), NodeKind::Erlang);
        assert_eq!("elixir".parse::<NodeKind>().unwrap(), NodeKind::Elixir);
        assert!("ruby".parse::<NodeKind>().is_err());
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(NodeStatus::Starting.to_string(), "starting");
        assert_eq!(NodeStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn trace_view_serialises_edges() {
        let view = TraceView {
            active: true,
            edges: vec![TraceEdge {
                from: "shell".into(),
                to: "code_server".into(),
                count: 3,
            }],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["active"], true);
        assert_eq!(json["edges"][0]["count"], 3);
    }
}
