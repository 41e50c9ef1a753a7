//! Registry data model
//!
//! Identities, instances and the typed request/response bodies exchanged
//! with the registry's `/registry/v3` API.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status string the registry uses for a healthy instance
pub const STATUS_UP: &str = "UP";

/// Lookup key for a logical service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// `serviceName` on the wire, `name` in config files
    #[serde(rename = "serviceName", alias = "name")]
    pub name: String,
    pub version: String,
    #[serde(rename = "appId")]
    pub app_id: String,
}

impl ServiceIdentity {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            app_id: app_id.into(),
        }
    }

    /// Query parameters identifying this service on discovery/existence calls
    pub(crate) fn query(&self) -> [(&'static str, &str); 3] {
        [
            ("appId", self.app_id.as_str()),
            ("serviceName", self.name.as_str()),
            ("version", self.version.as_str()),
        ]
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.app_id, self.name, self.version)
    }
}

/// Health status of an instance as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Testing,
    /// Any status this client does not know about
    Other(String),
}

impl InstanceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, InstanceStatus::Up)
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Other(String::new())
    }
}

impl From<String> for InstanceStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            STATUS_UP => InstanceStatus::Up,
            "DOWN" => InstanceStatus::Down,
            "STARTING" => InstanceStatus::Starting,
            "OUTOFSERVICE" => InstanceStatus::OutOfService,
            "TESTING" => InstanceStatus::Testing,
            _ => InstanceStatus::Other(value),
        }
    }
}

impl From<InstanceStatus> for String {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Up => STATUS_UP.to_string(),
            InstanceStatus::Down => "DOWN".to_string(),
            InstanceStatus::Starting => "STARTING".to_string(),
            InstanceStatus::OutOfService => "OUTOFSERVICE".to_string(),
            InstanceStatus::Testing => "TESTING".to_string(),
            InstanceStatus::Other(s) => s,
        }
    }
}

/// One running process of a service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    #[serde(default, rename = "hostName")]
    pub hostname: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub status: InstanceStatus,
}

/// The local instance as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub listen_address: String,
}

fn default_protocol() -> String {
    "rest".to_string()
}

impl InstanceConfig {
    /// Endpoint advertised to the registry: `protocol://listenAddress`
    pub fn endpoint(&self) -> String {
        format!("{}://{}", self.protocol, self.listen_address)
    }
}

/// Session handle returned by a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub service_id: String,
    pub instance_id: String,
}

/// Request bodies sent to the registry
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestBody {
    CreateService {
        service: ServiceIdentity,
    },
    RegisterInstance {
        instance: InstanceDescriptor,
    },
    HeartbeatSet {
        #[serde(rename = "Instances")]
        instances: Vec<HeartbeatElement>,
    },
}

impl RequestBody {
    pub fn create_service(identity: &ServiceIdentity) -> Self {
        RequestBody::CreateService {
            service: identity.clone(),
        }
    }

    pub fn register_instance(instance: &InstanceConfig) -> Self {
        RequestBody::RegisterInstance {
            instance: InstanceDescriptor {
                hostname: instance.hostname.clone(),
                endpoints: vec![instance.endpoint()],
                status: InstanceStatus::Up,
                ..Default::default()
            },
        }
    }

    pub fn heartbeat(service_id: &str, instance_id: &str) -> Self {
        RequestBody::HeartbeatSet {
            instances: vec![HeartbeatElement {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatElement {
    pub service_id: String,
    pub instance_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExistenceResponse {
    #[serde(default)]
    pub service_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateServiceResponse {
    #[serde(default)]
    pub service_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterInstanceResponse {
    #[serde(default)]
    pub instance_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InstancesResponse {
    #[serde(default)]
    pub instances: Option<Vec<InstanceDescriptor>>,
}

/// Kind of change carried by a watch frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WatchAction {
    Create,
    Update,
    Delete,
    Other(String),
}

impl From<String> for WatchAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CREATE" => WatchAction::Create,
            "UPDATE" => WatchAction::Update,
            "DELETE" => WatchAction::Delete,
            _ => WatchAction::Other(value),
        }
    }
}

impl From<WatchAction> for String {
    fn from(action: WatchAction) -> Self {
        match action {
            WatchAction::Create => "CREATE".to_string(),
            WatchAction::Update => "UPDATE".to_string(),
            WatchAction::Delete => "DELETE".to_string(),
            WatchAction::Other(s) => s,
        }
    }
}

/// Instance-change event pushed by the registry watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: ServiceIdentity,
    pub instance: InstanceDescriptor,
}
