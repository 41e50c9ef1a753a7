//! Heartbeat scheduler
//!
//! Registers this instance, then keeps the registration alive with one
//! heartbeat per interval.
//!
//! ## States
//!
//! - `Running`: heartbeats are being sent
//! - `Stopped`: the loop has exited, either because a heartbeat failed or
//!   because the scheduler was cancelled
//!
//! A failed heartbeat is not retried and the instance is not re-registered;
//! the owner decides what to do once the scheduler reports `Stopped`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::RegistryApi;
use crate::error::RegistryError;
use crate::model::{InstanceConfig, Registration, ServiceIdentity};

/// Default heartbeat interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// Why the heartbeat loop exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    HeartbeatFailed(String),
}

pub struct HeartbeatScheduler {
    api: Arc<dyn RegistryApi>,
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(api: Arc<dyn RegistryApi>) -> Self {
        Self {
            api,
            interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Override the interval; a zero interval is ignored
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!(
                interval_secs = self.interval.as_secs(),
                "Ignoring zero heartbeat interval"
            );
        } else {
            self.interval = interval;
        }
        self
    }

    /// Register the service (if absent) and the instance, then start beating
    pub async fn start(
        self,
        service: &ServiceIdentity,
        instance: &InstanceConfig,
    ) -> Result<HeartbeatHandle, RegistryError> {
        let registration = self.api.register_self(service, instance).await?;
        Ok(self.spawn(registration))
    }

    /// Start beating for an existing registration
    pub fn spawn(self, registration: Registration) -> HeartbeatHandle {
        let (state_tx, state_rx) = watch::channel(SchedulerState::Running);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            service_id = %registration.service_id,
            instance_id = %registration.instance_id,
            interval_secs = self.interval.as_secs(),
            "Starting heartbeat scheduler"
        );

        let task = tokio::spawn(run_heartbeat_loop(
            self.api,
            self.interval,
            registration.clone(),
            state_tx,
            shutdown_rx,
        ));

        HeartbeatHandle {
            registration,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running scheduler
///
/// Dropping the handle cancels the scheduler.
#[derive(Debug)]
pub struct HeartbeatHandle {
    registration: Registration,
    state: watch::Receiver<SchedulerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<StopReason>,
}

impl HeartbeatHandle {
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Ask the loop to stop; an in-flight heartbeat is allowed to finish
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the loop to exit; `None` if the task panicked
    pub async fn join(self) -> Option<StopReason> {
        let HeartbeatHandle { task, shutdown, .. } = self;
        let reason = task.await.ok();
        drop(shutdown);
        reason
    }
}

async fn run_heartbeat_loop(
    api: Arc<dyn RegistryApi>,
    period: Duration,
    registration: Registration,
    state: watch::Sender<SchedulerState>,
    mut shutdown: watch::Receiver<bool>,
) -> StopReason {
    // First heartbeat goes out one full period after registration
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        if *shutdown.borrow() {
            break StopReason::Cancelled;
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break StopReason::Cancelled;
                }
            }
            _ = ticker.tick() => {
                match api
                    .heartbeat(&registration.service_id, &registration.instance_id)
                    .await
                {
                    Ok(()) => debug!(
                        instance_id = %registration.instance_id,
                        "Send heartbeat success"
                    ),
                    Err(e) => {
                        error!(
                            service_id = %registration.service_id,
                            instance_id = %registration.instance_id,
                            error = %e,
                            "Heartbeat failed, stopping scheduler"
                        );
                        break StopReason::HeartbeatFailed(e.to_string());
                    }
                }
            }
        }
    };

    if reason == StopReason::Cancelled {
        info!(instance_id = %registration.instance_id, "Heartbeat scheduler cancelled");
    }
    state.send_replace(SchedulerState::Stopped);
    reason
}
