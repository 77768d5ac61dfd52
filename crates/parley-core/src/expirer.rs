//! Pending-queue expiration.
//!
//! Buffered messages that have waited longer than the TTL are discarded so a
//! peer reconnecting late never receives stale signaling. Optionally the
//! original sender is told with an `EXPIRE` message naming the destination.

use crate::realm::Realm;
use crate::router::{Delivery, Router};
use crate::schedule::Schedule;
use parley_protocol::Message;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info};

/// Queue expirer configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExpirerConfig {
    /// Delay between passes.
    pub cleanup_interval: Duration,
    /// Maximum time a message may wait in a queue.
    pub ttl: Duration,
    /// Send `EXPIRE` notices to the senders of dropped messages.
    pub notify_expired: bool,
}

impl Default for ExpirerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(1),
            ttl: Duration::from_secs(5),
            notify_expired: true,
        }
    }
}

/// Periodically prunes pending queues.
pub struct QueueExpirer {
    realm: Arc<Realm>,
    router: Arc<Router>,
    ttl: Duration,
    notify_expired: bool,
    schedule: Schedule,
}

impl QueueExpirer {
    #[must_use]
    pub fn new(realm: Arc<Realm>, router: Arc<Router>, config: ExpirerConfig) -> Arc<Self> {
        Arc::new(Self {
            realm,
            router,
            ttl: config.ttl,
            notify_expired: config.notify_expired,
            schedule: Schedule::new("expirer", config.cleanup_interval),
        })
    }

    /// Start expiring. Restarts cleanly if already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        info!(
            interval_ms = self.schedule.interval().as_millis() as u64,
            ttl_ms = self.ttl.as_millis() as u64,
            "Starting queue expirer"
        );
        self.schedule.start(self, |expirer| {
            expirer.sweep();
        });
    }

    pub fn stop(&self) {
        self.schedule.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.schedule.is_running()
    }

    /// Run one pass now. Returns the number of messages discarded.
    pub fn sweep(&self) -> usize {
        let ids = self.realm.lock().queued_ids();
        let mut discarded = 0;
        // (original sender, dropped destination), one notice per pair.
        let mut notices = BTreeSet::new();

        for id in ids {
            let expired = self.realm.expire_queue(&id, self.ttl);
            if expired.is_empty() {
                continue;
            }

            debug!(client = %id, count = expired.len(), "Expired queued messages");
            discarded += expired.len();

            if self.notify_expired {
                notices.extend(
                    expired
                        .into_iter()
                        .filter_map(|m| m.src)
                        .map(|src| (src, id.clone())),
                );
            }
        }

        for (sender, dst) in notices {
            if self.router.route(Message::expire(&dst, &sender)) == Delivery::Forwarded {
                debug!(client = %sender, dst = %dst, "Sent expiry notice");
            }
        }

        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Identity;
    use crate::socket::Socket;
    use crate::testing::MockSocket;
    use parley_protocol::MessageType;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(5);

    fn setup(notify_expired: bool) -> (Arc<Realm>, Arc<Router>, Arc<QueueExpirer>) {
        let realm = Arc::new(Realm::new());
        let router = Arc::new(Router::new(Arc::clone(&realm)));
        let expirer = QueueExpirer::new(
            Arc::clone(&realm),
            Arc::clone(&router),
            ExpirerConfig {
                cleanup_interval: Duration::from_secs(1),
                ttl: TTL,
                notify_expired,
            },
        );
        (realm, router, expirer)
    }

    fn offer(n: u64) -> Message {
        Message::routed(MessageType::Offer, "bob", json!(n)).with_src("alice")
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_never_delivered() {
        let (realm, router, expirer) = setup(false);
        realm.register_or_get("bob", "t");
        router.route(offer(0));

        tokio::time::advance(Duration::from_secs(3)).await;
        router.route(offer(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(expirer.sweep(), 1);

        let socket = MockSocket::new();
        realm.attach_transport("bob", socket.clone()).unwrap();
        router.on_connection(&Identity::new("bob", Some(socket.id())));

        let delivered: Vec<_> = socket.sent().into_iter().filter_map(|m| m.payload).collect();
        assert_eq!(delivered, vec![json!(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_is_notified_once_per_destination() {
        let (realm, router, expirer) = setup(true);
        realm.register_or_get("alice", "t");
        let alice = MockSocket::new();
        realm.attach_transport("alice", alice.clone()).unwrap();
        realm.register_or_get("bob", "t");

        router.route(offer(0));
        router.route(offer(1));

        tokio::time::advance(TTL).await;
        assert_eq!(expirer.sweep(), 2);

        let notices = alice.sent();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].kind, MessageType::Expire);
        assert_eq!(notices[0].src.as_deref(), Some("bob"));
        assert_eq!(notices[0].dst.as_deref(), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_messages_survive() {
        let (realm, router, expirer) = setup(true);
        realm.register_or_get("bob", "t");
        router.route(offer(0));

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(expirer.sweep(), 0);
        assert_eq!(realm.queue_ages("bob").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_expiry() {
        let (realm, router, expirer) = setup(false);
        realm.register_or_get("bob", "t");
        router.route(offer(0));

        expirer.start();
        tokio::time::sleep(TTL + Duration::from_millis(1500)).await;
        expirer.stop();

        assert!(realm.queue_ages("bob").is_empty());
        assert!(!expirer.is_running());
    }
}
