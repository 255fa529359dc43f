//! Environment configuration for the control-plane.
//!
//! The host list comes from `SSH_HOSTS`, a comma-separated list of entries
//! shaped `label:user@host[:port][:erlPath[:elixirPath]]`. Malformed entries
//! are skipped, not fatal: a fleet definition with one bad line should not
//! take the whole control-plane down.
//!
//! Key material comes from `SSH_PRIVATE_KEY` (PEM content) or
//! `SSH_PRIVATE_KEY_B64` (the same, base64-encoded). One of the two must be
//! non-empty for any operation to proceed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::error::CoreError;

/// SSH port used when an entry does not carry one.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Launcher paths used when an entry does not carry them.
pub const DEFAULT_ERL_PATH: &str = "erl";
pub const DEFAULT_ELIXIR_PATH: &str = "elixir";

/// One configured SSH host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Unique label used to address the host in operations.
    pub label: String,
    pub user: String,
    pub hostname: String,
    pub port: u16,
    /// Path to the `erl` launcher, absolute or `$PATH`-resolvable.
    pub erl_path: String,
    /// Path to the `elixir` launcher, absolute or `$PATH`-resolvable.
    pub elixir_path: String,
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub hosts: Vec<HostSpec>,
    /// PEM contents of the private key used for every host.
    pub private_key_pem: Option<String>,
    /// Forwarded to the outer command framework; unused by the core.
    pub port: Option<u16>,
    /// Forwarded to the outer command framework; unused by the core.
    pub mcp_url: Option<String>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let hosts = std::env::var("SSH_HOSTS")
            .map(|raw| parse_hosts(&raw))
            .unwrap_or_default();
        let private_key_pem = resolve_private_key(
            non_empty_env("SSH_PRIVATE_KEY"),
            non_empty_env("SSH_PRIVATE_KEY_B64"),
        );
        let port = non_empty_env("PORT").and_then(|p| p.parse().ok());
        let mcp_url = non_empty_env("MCP_URL");
        Self {
            hosts,
            private_key_pem,
            port,
            mcp_url,
        }
    }

    /// Configuration guard shared by all operations: at least one host and a
    /// non-empty private key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigMissing`] naming the absent piece.
    pub fn ensure_operational(&self) -> Result<&str, CoreError> {
        if self.hosts.is_empty() {
            return Err(CoreError::ConfigMissing("no ssh hosts configured"));
        }
        match self.private_key_pem.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(CoreError::ConfigMissing("no ssh private key configured")),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse the `SSH_HOSTS` value. Malformed entries are silently skipped.
pub fn parse_hosts(raw: &str) -> Vec<HostSpec> {
    raw.split(',')
        .filter_map(parse_host_entry)
        .collect()
}

/// Parse one `label:user@host[:port][:erlPath[:elixirPath]]` entry.
///
/// Entries with no `:` or no `@` yield `None`. A port is recognised as a
/// run of digits in the first segment after the hostname; anything else in
/// that position is treated as the `erl` path.
fn parse_host_entry(entry: &str) -> Option<HostSpec> {
    let entry = entry.trim();
    let (label, rest) = entry.split_once(':')?;
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    let (user, tail) = rest.split_once('@')?;
    if user.is_empty() || tail.is_empty() {
        return None;
    }

    let mut segments = tail.split(':');
    let hostname = segments.next()?.to_string();
    if hostname.is_empty() {
        return None;
    }

    let mut rest: Vec<&str> = segments.collect();
    let mut port = DEFAULT_SSH_PORT;
    if let Some(first) = rest.first()
        && !first.is_empty()
        && first.bytes().all(|b| b.is_ascii_digit())
    {
        port = first.parse().ok()?;
        rest.remove(0);
    }

    let mut paths = rest.into_iter();
    let erl_path = paths
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_ERL_PATH)
        .to_string();
    let elixir_path = paths
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_ELIXIR_PATH)
        .to_string();

    Some(HostSpec {
        label: label.to_string(),
        user: user.to_string(),
        hostname,
        port,
        erl_path,
        elixir_path,
    })
}

/// Resolve key material from the plain or base64 environment variant.
///
/// The plain variant wins when both are set. A base64 value that does not
/// decode to UTF-8 text is dropped with a warning.
pub fn resolve_private_key(pem: Option<String>, b64: Option<String>) -> Option<String> {
    if let Some(pem) = pem {
        return Some(pem);
    }
    let encoded = b64?;
    match BASE64.decode(encoded.trim().as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(pem) => Some(pem),
            Err(_) => {
                warn!("SSH_PRIVATE_KEY_B64 did not decode to UTF-8 text; ignoring");
                None
            }
        },
        Err(err) => {
            warn!(error = %err, "SSH_PRIVATE_KEY_B64 is not valid base64; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn parses_minimal_entry() {
        let hosts = parse_hosts("a:u@h");
        assert_eq!(hosts.len(), 1);
        let host = &hosts[0];
        assert_eq!(host.label, "a");
        assert_eq!(host.user, "u");
        assert_eq!(host.hostname, "h");
        assert_eq!(host.port, DEFAULT_SSH_PORT);
        assert_eq!(host.erl_path, "erl");
        assert_eq!(host.elixir_path, "elixir");
    }

    #[test]
    fn parses_entry_with_port_and_paths() {
        let hosts = parse_hosts("build:deploy@build.example.com:2222:/opt/erl/bin/erl:/opt/elixir/bin/elixir");
        assert_eq!(hosts.len(), 1);
        let host = &hosts[0];
        assert_eq!(host.port, 2222);
        assert_eq!(host.erl_path, "/opt/erl/bin/erl");
        assert_eq!(host.elixir_path, "/opt/elixir/bin/elixir");
    }

    #[test]
    fn non_digit_segment_after_host_is_erl_path() {
        let hosts = parse_hosts("a:u@h:/usr/local/bin/erl");
        assert_eq!(hosts[0].port, DEFAULT_SSH_PORT);
        assert_eq!(hosts[0].erl_path, "/usr/local/bin/erl");
    }

    #[test]
    fn skips_entry_without_colon() {
        assert!(parse_hosts("foo").is_empty());
    }

    #[test]
    fn skips_entry_with_empty_rest() {
        assert!(parse_hosts("foo:").is_empty());
    }

    #[test]
    fn skips_entry_without_at() {
        assert!(parse_hosts("foo:nohost").is_empty());
    }

    #[test]
    fn well_formed_entry_survives_a_malformed_neighbour() {
        let hosts = parse_hosts("garbage,a:u@h,also-bad:");
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].label, "a");
    }

    #[test]
    fn parses_multiple_entries() {
        let hosts = parse_hosts("a:u@h,b:v@i:2200");
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].label, "b");
        assert_eq!(hosts[1].port, 2200);
    }

    #[test]
    fn private_key_plain_wins_over_b64() {
        let resolved = resolve_private_key(
            Some("PLAIN".into()),
            Some(STANDARD.encode("ENCODED")),
        );
        assert_eq!(resolved.as_deref(), Some("PLAIN"));
    }

    #[test]
    fn private_key_decodes_b64() {
        let resolved = resolve_private_key(None, Some(STANDARD.encode("-----BEGIN KEY-----")));
        assert_eq!(resolved.as_deref(), Some("-----BEGIN KEY-----"));
    }

    #[test]
    fn private_key_rejects_bad_b64() {
        assert!(resolve_private_key(None, Some("%%%not-base64%%%".into())).is_none());
    }

    #[test]
    fn ensure_operational_requires_hosts_and_key() {
        let empty = Config::default();
        assert!(matches!(
            empty.ensure_operational(),
            Err(CoreError::ConfigMissing(_))
        ));

        let hosts_only = Config {
            hosts: parse_hosts("a:u@h"),
            ..Default::default()
        };
        assert!(matches!(
            hosts_only.ensure_operational(),
            Err(CoreError::ConfigMissing(_))
        ));

        let complete = Config {
            hosts: parse_hosts("a:u@h"),
            private_key_pem: Some("-----BEGIN KEY-----".into()),
            ..Default::default()
        };
        assert_eq!(complete.ensure_operational().unwrap(), "-----BEGIN KEY-----");
    }
}
