//! Watch subscriber
//!
//! Pulls instance-change events from the registry watcher and folds them
//! into the [`InstanceCache`]. Events are applied one at a time; the next
//! frame is not read until the previous event has been applied.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{ChangeOutcome, InstanceCache};
use crate::client::RegistryClient;
use crate::error::RegistryError;
use crate::model::{ServiceIdentity, WatchAction, WatchEvent};

/// Reconnection behavior after the watch stream ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive reconnect attempts before giving up (0 = never reconnect)
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Keeps the cached instances of one target service current
pub struct WatchSubscriber {
    client: Arc<RegistryClient>,
    cache: Arc<InstanceCache>,
    target: ServiceIdentity,
    policy: ReconnectPolicy,
}

impl WatchSubscriber {
    pub fn new(
        client: Arc<RegistryClient>,
        cache: Arc<InstanceCache>,
        target: ServiceIdentity,
    ) -> Self {
        Self {
            client,
            cache,
            target,
            policy: ReconnectPolicy::disabled(),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply one event to the cache; returns false if it was ignored
    ///
    /// Events match the target by app and name only. The registry reports
    /// the concrete version, which may differ from a configured version rule.
    pub fn apply(&self, event: WatchEvent) -> bool {
        if event.key.app_id != self.target.app_id || event.key.name != self.target.name {
            debug!(
                key = %event.key,
                target = %self.target,
                "Ignoring watch event for other service"
            );
            return false;
        }

        let instance_id = event.instance.instance_id.clone();
        match event.action {
            WatchAction::Delete => {
                let removed = self.cache.remove_instance(&self.target, &instance_id);
                info!(
                    service = %self.target,
                    instance_id = %instance_id,
                    removed,
                    "Instance deleted"
                );
            }
            action => {
                let status = event.instance.status.clone();
                let outcome = self.cache.apply_change(&self.target, event.instance);
                info!(
                    service = %self.target,
                    instance_id = %instance_id,
                    action = ?action,
                    status = ?status,
                    replaced = outcome == ChangeOutcome::Replaced,
                    "Applied instance change"
                );
            }
        }
        true
    }

    /// Watch on behalf of `service_id` until cancelled or the stream ends
    ///
    /// Returns `Ok(())` when cancelled through `shutdown`, otherwise the
    /// error that ended the last subscription once the reconnect policy is
    /// exhausted.
    pub async fn run(
        &self,
        service_id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RegistryError> {
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let (received, error) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                ended = self.subscribe_once(service_id) => ended,
            };

            if received > 0 {
                attempt = 0;
            }
            if attempt >= self.policy.max_retries {
                warn!(service_id, error = %error, "Watch subscription ended");
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            attempt += 1;
            warn!(
                service_id,
                error = %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Watch subscription ended, reconnecting"
            );

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One subscription; returns the number of events applied and the
    /// error that ended it
    async fn subscribe_once(&self, service_id: &str) -> (usize, RegistryError) {
        let mut stream = match self.client.watch(service_id).await {
            Ok(stream) => stream,
            Err(e) => return (0, e),
        };

        let mut received = 0;
        loop {
            match stream.next_event().await {
                Ok(event) => {
                    debug!(service_id, "Reply from watch service");
                    self.apply(event);
                    received += 1;
                }
                Err(e) => return (received, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceDescriptor, InstanceStatus};

    fn target() -> ServiceIdentity {
        ServiceIdentity::new("hello-server", "0.0.1", "demo")
    }

    fn subscriber(cache: Arc<InstanceCache>) -> WatchSubscriber {
        let client = RegistryClient::new("http://127.0.0.1:1", "", Duration::from_secs(1)).unwrap();
        WatchSubscriber::new(Arc::new(client), cache, target())
    }

    fn event(
        action: WatchAction,
        key: ServiceIdentity,
        id: &str,
        status: InstanceStatus,
    ) -> WatchEvent {
        WatchEvent {
            action,
            key,
            instance: InstanceDescriptor {
                instance_id: id.to_string(),
                endpoints: vec!["rest://10.0.0.1:80".to_string()],
                status,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_apply_updates_and_deletes() {
        let cache = Arc::new(InstanceCache::new());
        let sub = subscriber(cache.clone());

        assert!(sub.apply(event(WatchAction::Create, target(), "a", InstanceStatus::Up)));
        assert!(sub.apply(event(WatchAction::Update, target(), "a", InstanceStatus::Down)));
        assert_eq!(cache.get(&target()).unwrap()[0].status, InstanceStatus::Down);

        assert!(sub.apply(event(WatchAction::Delete, target(), "a", InstanceStatus::Down)));
        assert!(cache.get(&target()).unwrap().is_empty());
    }

    #[test]
    fn test_apply_ignores_other_services() {
        let cache = Arc::new(InstanceCache::new());
        let sub = subscriber(cache.clone());
        let other = ServiceIdentity::new("billing", "1.0.0", "demo");

        assert!(!sub.apply(event(WatchAction::Create, other.clone(), "x", InstanceStatus::Up)));
        assert!(cache.get(&target()).is_none());
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn test_apply_accepts_other_versions_of_target() {
        let cache = Arc::new(InstanceCache::new());
        let sub = subscriber(cache.clone());
        let released = ServiceIdentity::new("hello-server", "0.0.2", "demo");

        assert!(sub.apply(event(WatchAction::Create, released, "b", InstanceStatus::Up)));
        assert_eq!(cache.get(&target()).unwrap()[0].instance_id, "b");

        let other_app = ServiceIdentity::new("hello-server", "0.0.1", "other");
        assert!(!sub.apply(event(WatchAction::Create, other_app, "c", InstanceStatus::Up)));
        assert_eq!(cache.get(&target()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_error_without_reconnect() {
        let cache = Arc::new(InstanceCache::new());
        let sub = subscriber(cache);
        let (_tx, rx) = watch::channel(false);

        let err = sub.run("svc-1", rx).await.unwrap_err();
        assert!(matches!(err, RegistryError::Transport { op: "WatchService", .. }));
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_cancelled() {
        let cache = Arc::new(InstanceCache::new());
        let sub = subscriber(cache);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(sub.run("svc-1", rx).await.is_ok());
    }
}
