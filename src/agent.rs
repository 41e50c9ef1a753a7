//! Process lifecycle against the registry
//!
//! [`RegistryContext`] is built once at startup from the loaded config and
//! handed to every component; nothing here lives in global state.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cache::InstanceCache;
use crate::client::{RegistryApi, RegistryClient};
use crate::config::Config;
use crate::error::{RegistryError, StartError};
use crate::heartbeat::{HeartbeatHandle, HeartbeatScheduler};
use crate::model::{InstanceConfig, Registration, ServiceIdentity};
use crate::selector::EndpointSelector;
use crate::watch::WatchSubscriber;

/// Pause between removing the instance and removing its service
pub const DEREGISTER_GRACE: Duration = Duration::from_secs(3);

/// Shared dependencies of the registry components
pub struct RegistryContext {
    pub config: Config,
    pub client: Arc<RegistryClient>,
    pub cache: Arc<InstanceCache>,
}

impl RegistryContext {
    pub fn new(config: Config) -> Result<Self, RegistryError> {
        let client = RegistryClient::new(
            &config.registry.address,
            &config.tenant.domain,
            config.registry.timeout(),
        )?;
        Ok(Self {
            config,
            client: Arc::new(client),
            cache: Arc::new(InstanceCache::new()),
        })
    }

    pub fn selector(&self) -> EndpointSelector {
        EndpointSelector::new(Arc::clone(&self.cache))
    }

    pub fn heartbeat_scheduler(&self) -> HeartbeatScheduler {
        HeartbeatScheduler::new(self.client.clone()).with_interval(self.config.heartbeat.interval())
    }

    pub fn watch_subscriber(&self, target: ServiceIdentity) -> WatchSubscriber {
        WatchSubscriber::new(Arc::clone(&self.client), Arc::clone(&self.cache), target)
            .with_reconnect(self.config.watch.reconnect_policy())
    }
}

/// Bind the instance's listen address, then register and start heartbeats
///
/// Nothing is registered when the address cannot be bound.
pub async fn bind_and_register(
    scheduler: HeartbeatScheduler,
    service: &ServiceIdentity,
    instance: &InstanceConfig,
) -> Result<(TcpListener, HeartbeatHandle), StartError> {
    let listener = TcpListener::bind(&instance.listen_address)
        .await
        .map_err(|source| StartError::Bind {
            address: instance.listen_address.clone(),
            source,
        })?;
    let heartbeat = scheduler.start(service, instance).await?;
    Ok((listener, heartbeat))
}

/// Discover `target` on behalf of `consumer_id` and seed the cache
///
/// An empty result is a `DiscoveryEmpty` error, and a first instance without
/// endpoints is `EndpointsEmpty`: either way the consumer has nothing to route to.
pub async fn discover_and_cache(
    api: &dyn RegistryApi,
    cache: &InstanceCache,
    consumer_id: &str,
    target: &ServiceIdentity,
) -> Result<usize, RegistryError> {
    let instances = api.discovery(consumer_id, target).await?;
    if instances.is_empty() {
        return Err(RegistryError::DiscoveryEmpty {
            op: "Discovery",
            service: target.clone(),
        });
    }

    if instances[0].endpoints.iter().all(|e| e.is_empty()) {
        return Err(RegistryError::EndpointsEmpty {
            op: "Discovery",
            service: target.clone(),
        });
    }

    let count = instances.len();
    cache.seed(target, instances);
    info!(service = %target, count, "Cached provider instances");
    Ok(count)
}

/// Remove the instance, wait `grace`, then remove the service
///
/// The service is left in place if the instance could not be removed.
pub async fn deregister(
    api: &dyn RegistryApi,
    registration: &Registration,
    grace: Duration,
) -> Result<(), RegistryError> {
    api.unregister_instance(&registration.service_id, &registration.instance_id)
        .await?;
    info!(instance_id = %registration.instance_id, "Instance unregistered");

    tokio::time::sleep(grace).await;

    api.unregister_service(&registration.service_id).await?;
    info!(service_id = %registration.service_id, "Service unregistered");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
