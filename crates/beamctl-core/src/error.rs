//! Error taxonomy for control-plane operations.

use thiserror::Error;

/// Errors surfaced by control-plane operations.
///
/// Every operation reports failure through one of these variants; none of
/// them is fatal to the daemon process. Transient SSH errors during
/// background polling are swallowed at the call site and never reach the
/// caller as a status change.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No usable host list or private key was configured.
    #[error("configuration missing: {0}")]
    ConfigMissing(&'static str),

    /// The requested host label is not in the registry.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// TCP connect, handshake, or authentication failure.
    #[error("ssh dial failed for host {host}: {message}")]
    SshDial { host: String, message: String },

    /// A remote execution exceeded its deadline.
    #[error("ssh command timed out after {timeout_secs}s: {command_prefix}")]
    SshTimeout {
        timeout_secs: u64,
        /// First 80 characters of the offending command.
        command_prefix: String,
    },

    /// Opening a channel or starting the remote command failed.
    #[error("ssh spawn failed: {0}")]
    SshSpawn(String),

    /// The RPC bootstrap could not reach the target over distribution.
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    /// No managed node with this name.
    #[error("unknown node: {0}")]
    NodeUnknown(String),

    /// The node exists but is not in the status the operation requires.
    #[error("node {name} is {status}, expected {expected}")]
    NodeBadState {
        name: String,
        status: String,
        expected: &'static str,
    },

    /// A node with this name is already managed.
    #[error("node name already taken: {0}")]
    NameTaken(String),

    /// A caller-supplied atom failed validation.
    #[error("invalid atom name: {0:?}")]
    BadAtomName(String),

    /// The remote evaluation returned an error term.
    #[error("remote evaluation failed: {0}")]
    RemoteEvalError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_one_line() {
        let errors = [
            CoreError::ConfigMissing("no ssh hosts configured"),
            CoreError::UnknownHost("build1".into()),
            CoreError::SshTimeout {
                timeout_secs: 10,
                command_prefix: "erl -sname".into(),
            },
            CoreError::NodeBadState {
                name: "w1".into(),
                status: "stopped".into(),
                expected: "running",
            },
            CoreError::BadAtomName("has space".into()),
        ];
        for err in errors {
            assert!(!err.to_string().contains('\n'), "multi-line: {err}");
        }
    }

    #[test]
    fn bad_state_names_both_statuses() {
        let err = CoreError::NodeBadState {
            name: "w1".into(),
            status: "starting".into(),
            expected: "running",
        };
        let msg = err.to_string();
        assert!(msg.contains("starting"));
        assert!(msg.contains("running"));
    }
}
