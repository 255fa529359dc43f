//! Logging initialization for beamctl binaries.

use std::sync::OnceLock;

/// Environment variable controlling the log level when the caller passes no
/// explicit level.
pub const LOG_ENV_VAR: &str = "BEAMCTL_LOG";

static INIT: OnceLock<()> = OnceLock::new();

fn env_level() -> tracing::Level {
    std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(tracing::Level::INFO)
}

/// Install the process-wide tracing subscriber.
///
/// An explicit `level` (e.g. resolved from a `--verbose` flag) wins;
/// otherwise the level comes from [`LOG_ENV_VAR`], defaulting to `info`.
/// Safe to call multiple times: only the first call installs the
/// subscriber, and installation failure (another subscriber already active)
/// is ignored.
pub fn init(level: Option<tracing::Level>) {
    INIT.get_or_init(|| {
        let level = level.unwrap_or_else(env_level);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init(Some(tracing::Level::WARN));
        init(None);
        init(Some(tracing::Level::TRACE));
    }
}
