//! In-memory registry double for unit tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::client::RegistryApi;
use crate::error::RegistryError;
use crate::model::{InstanceConfig, InstanceDescriptor, ServiceIdentity};

/// Records every call by operation name and replays scripted answers
#[derive(Default)]
pub(crate) struct FakeRegistry {
    existing_service: Option<String>,
    instances: Vec<InstanceDescriptor>,
    heartbeat_results: Mutex<VecDeque<Result<(), RegistryError>>>,
    fail_unregister_instance: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeats(results: Vec<Result<(), RegistryError>>) -> Self {
        Self {
            heartbeat_results: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn with_existing_service(mut self, service_id: &str) -> Self {
        self.existing_service = Some(service_id.to_string());
        self
    }

    pub fn with_instances(mut self, instances: Vec<InstanceDescriptor>) -> Self {
        self.instances = instances;
        self
    }

    pub fn failing_unregister(mut self) -> Self {
        self.fail_unregister_instance = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == op).count()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

pub(crate) fn heartbeat_rejected() -> RegistryError {
    RegistryError::heartbeat(
        "Heartbeat",
        RegistryError::Status {
            op: "Heartbeat",
            status: 400,
            body: r#"{"errorCode":"400017","errorMessage":"Instance does not exist."}"#.to_string(),
        },
    )
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn get_service_id(
        &self,
        _identity: &ServiceIdentity,
    ) -> Result<Option<String>, RegistryError> {
        self.record("GetServiceID");
        Ok(self.existing_service.clone())
    }

    async fn register_service(&self, _identity: &ServiceIdentity) -> Result<String, RegistryError> {
        self.record("RegisterService");
        Ok("svc-new".to_string())
    }

    async fn register_instance(
        &self,
        service_id: &str,
        _instance: &InstanceConfig,
    ) -> Result<String, RegistryError> {
        self.record("RegisterInstance");
        Ok(format!("{}-ins", service_id))
    }

    async fn heartbeat(&self, _service_id: &str, _instance_id: &str) -> Result<(), RegistryError> {
        self.record("Heartbeat");
        self.heartbeat_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn discovery(
        &self,
        _consumer_id: &str,
        _identity: &ServiceIdentity,
    ) -> Result<Vec<InstanceDescriptor>, RegistryError> {
        self.record("Discovery");
        Ok(self.instances.clone())
    }

    async fn unregister_instance(
        &self,
        service_id: &str,
        _instance_id: &str,
    ) -> Result<(), RegistryError> {
        self.record("UnRegisterInstance");
        if self.fail_unregister_instance {
            return Err(RegistryError::Status {
                op: "UnRegisterInstance",
                status: 500,
                body: format!("cannot remove instance of {}", service_id),
            });
        }
        Ok(())
    }

    async fn unregister_service(&self, _service_id: &str) -> Result<(), RegistryError> {
        self.record("UnRegisterService");
        Ok(())
    }
}
