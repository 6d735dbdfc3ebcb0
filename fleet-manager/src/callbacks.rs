use tracing::{info, instrument};

use crate::registry::{EventReceiver, RegistryEvent};

/// Drains registry lifecycle events off the lock-holding path (§5). A real
/// deployment might also fan these out to a webhook or the broker's
/// `agents.commands` path; here they are logged, which is itself the
/// ambient behavior the teacher's services show for comparable event
/// streams.
#[instrument(skip_all)]
pub async fn run(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::NodeConnected(node) => {
                info!(node_id = %node.node_id, node_type = %node.node_type, "OnNodeConnected");
            }
            RegistryEvent::NodeDisconnected(node) => {
                info!(node_id = %node.node_id, "OnNodeDisconnected");
            }
            RegistryEvent::NodeStatusUpdated(node) => {
                info!(node_id = %node.node_id, health = %node.health_status, "OnNodeStatusUpdate");
            }
        }
    }
}
