//! Shared fixtures for the Relay benchmarks.

use relay_protocol::{NodeId, PresenceData};
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_core::{
    ChannelManager, ConnectionHandle, CoordinatorConfig, ManagerConfig, Message,
    ReplicationCoordinator,
};
use tenvis_relay_transport::{MemoryHub, StaticPeers};
use tokio::sync::mpsc;

/// Receiving ends kept alive so deliveries are not skipped as closed.
pub type Inboxes = Vec<mpsc::Receiver<Arc<Message>>>;

/// Subscribe `count` fresh connections to `channel`.
///
/// Presence channels get one distinct user per connection.
///
/// # Panics
///
/// Panics if the channel name is rejected.
pub fn populate(manager: &ChannelManager, app_id: &str, channel: &str, count: usize) -> Inboxes {
    let presence = channel.starts_with("presence-");
    (0..count)
        .map(|i| {
            let (handle, inbox) = ConnectionHandle::channel(format!("{channel}-conn-{i}"), 1024);
            let data = presence.then(|| PresenceData {
                user_id: format!("user-{i}"),
                user_info: None,
            });
            manager
                .subscribe(app_id, &handle, channel, data)
                .expect("benchmark channel is valid");
            inbox
        })
        .collect()
}

/// Drop everything queued so far.
pub fn drain(inboxes: &mut Inboxes) {
    for inbox in inboxes {
        while inbox.try_recv().is_ok() {}
    }
}

/// Start `nodes` replicating managers on one in-memory hub.
///
/// Must be called from within a tokio runtime.
///
/// # Panics
///
/// Panics if the hub refuses a subscription.
pub async fn cluster(nodes: usize, app_id: &str) -> Vec<Arc<ChannelManager>> {
    let hub = MemoryHub::new();
    let mut managers = Vec::with_capacity(nodes);
    for n in 0..nodes {
        let coordinator = ReplicationCoordinator::start(
            CoordinatorConfig {
                node_id: NodeId::new(format!("bench-node-{n}")),
                topic_prefix: "bench".to_string(),
                query_timeout: Duration::from_secs(2),
            },
            Arc::new(hub.transport()),
            Arc::new(StaticPeers::exactly(nodes - 1)),
        );
        let manager = Arc::new(ChannelManager::with_replication(ManagerConfig::default(), coordinator));
        manager
            .start_replication(&[app_id.to_string()])
            .await
            .expect("memory hub accepts subscriptions");
        managers.push(manager);
    }
    managers
}
