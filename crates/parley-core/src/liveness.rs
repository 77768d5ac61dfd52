//! Liveness sweeper.
//!
//! Periodically evicts identities whose last inbound activity is older than
//! the alive timeout: their transport is closed, their record and queue are
//! removed, and the close callback is invoked.

use crate::client::Identity;
use crate::realm::Realm;
use crate::schedule::Schedule;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Callback invoked once per evicted identity.
pub type CloseCallback = Arc<dyn Fn(&Identity) + Send + Sync>;

/// Liveness sweeper configuration.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Delay between the end of one pass and the start of the next.
    pub check_interval: Duration,
    /// Idle time after which an identity is considered dead.
    pub alive_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(300),
            alive_timeout: Duration::from_secs(60),
        }
    }
}

/// Evicts identities that stopped talking.
pub struct LivenessSweeper {
    realm: Arc<Realm>,
    alive_timeout: Duration,
    on_close: CloseCallback,
    schedule: Schedule,
}

impl LivenessSweeper {
    #[must_use]
    pub fn new(
        realm: Arc<Realm>,
        config: LivenessConfig,
        on_close: impl Fn(&Identity) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            realm,
            alive_timeout: config.alive_timeout,
            on_close: Arc::new(on_close),
            schedule: Schedule::new("liveness", config.check_interval),
        })
    }

    /// Start sweeping. Restarts cleanly if already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        info!(
            interval_ms = self.schedule.interval().as_millis() as u64,
            timeout_ms = self.alive_timeout.as_millis() as u64,
            "Starting liveness sweeper"
        );
        self.schedule.start(self, |sweeper| {
            sweeper.sweep();
        });
    }

    /// Stop sweeping.
    pub fn stop(&self) {
        self.schedule.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.schedule.is_running()
    }

    /// Run one pass now. Returns the evicted identities.
    pub fn sweep(&self) -> Vec<Identity> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for id in self.realm.all_ids() {
            let identity = {
                let mut registry = self.realm.lock();
                let Some(client) = registry.lookup(&id) else {
                    continue;
                };
                if client.idle_for(now) < self.alive_timeout {
                    continue;
                }

                let identity = client.identity();
                if let Some(socket) = client.socket() {
                    if let Err(e) = socket.close() {
                        trace!(client = %id, error = %e, "Close of stale socket failed");
                    }
                }
                registry.remove(&id);
                identity
            };

            debug!(client = %identity.id, "Evicted stale client");
            (self.on_close)(&identity);
            evicted.push(identity);
        }

        evicted
    }
}
