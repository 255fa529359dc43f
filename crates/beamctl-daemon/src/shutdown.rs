//! Graceful teardown on termination signals.

use tracing::{debug, info};

use crate::core::Core;

/// Tear the control-plane down: cancel trace pollers, close every managed
/// node's channel, then end every cached SSH client.
///
/// Everything is best-effort; individual failures are ignored. No RPC is
/// sent to the remote BEAMs: closing the streamed channels terminates them
/// through loss of their standard-input holder, which is the desired
/// semantics for a control-plane restart.
pub async fn shutdown(core: &Core) {
    core.tracer.cancel_all().await;

    let names = core.nodes.lock().unwrap().names();
    info!(nodes = names.len(), "closing node channels");
    for name in names {
        let node = core.nodes.lock().unwrap().remove(&name);
        let Some(node) = node else { continue };
        node.channel.close().await;
        debug!(node = %name, "channel closed");
    }

    for host in core.hosts().entries() {
        if let Some(client) = host.take_client().await {
            client.disconnect().await;
            debug!(host = %host.spec().label, "ssh client closed");
        }
    }
    info!("shutdown complete");
}
