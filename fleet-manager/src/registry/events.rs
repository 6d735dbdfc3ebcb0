use fleet_primitives::NodeSnapshot;
use tokio::sync::mpsc;

/// Registry lifecycle events. Emitted off the lock-holding path: a mutation
/// method builds the event after releasing its lock guard and pushes it
/// onto an unbounded channel, which a separate task drains (§5: "the
/// registry lock is never held across a callback").
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    NodeConnected(NodeSnapshot),
    NodeDisconnected(NodeSnapshot),
    NodeStatusUpdated(NodeSnapshot),
}

pub type EventSender = mpsc::UnboundedSender<RegistryEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RegistryEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
