//! registry-agent: service registry client
//!
//! Lets a service register itself with a `/registry/v3` service registry,
//! keep the registration alive with heartbeats, discover its providers and
//! keep a local view of their instances current through the registry's
//! watch subscription.
//!
//! - [`client`]: RPC facade over the registry API
//! - [`cache`] / [`selector`]: cached instances and endpoint selection
//! - [`heartbeat`]: keep-alive scheduler
//! - [`watch`]: change subscription feeding the cache
//! - [`agent`]: shared context and startup/shutdown sequences

pub mod agent;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod model;
pub mod selector;
pub mod watch;

#[cfg(test)]
mod testing;

pub use agent::{
    bind_and_register, deregister, discover_and_cache, RegistryContext, DEREGISTER_GRACE,
};
pub use cache::{ChangeOutcome, InstanceCache};
pub use client::{RegistryApi, RegistryClient, WatchStream};
pub use config::Config;
pub use error::{ConfigError, RegistryError, StartError};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler, SchedulerState, StopReason};
pub use model::{
    InstanceConfig, InstanceDescriptor, InstanceStatus, Registration, ServiceIdentity,
    WatchAction, WatchEvent,
};
pub use selector::{EndpointSelector, Unavailable};
pub use watch::{ReconnectPolicy, WatchSubscriber};
