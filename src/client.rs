//! Registry RPC client
//!
//! Thin facade over the registry's `/registry/v3` HTTP and websocket API.
//! Calls never retry; every failure is returned tagged with the operation
//! that produced it.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_DOMAIN;
use crate::error::RegistryError;
use crate::model::{
    CreateServiceResponse, ExistenceResponse, InstanceConfig, InstanceDescriptor,
    InstancesResponse, RegisterInstanceResponse, Registration, RequestBody, ServiceIdentity,
    WatchEvent,
};

const MICROSERVICES: &str = "/registry/v3/microservices";
const DISCOVERY: &str = "/registry/v3/instances";
const EXISTENCE: &str = "/registry/v3/existence";
const HEARTBEATS: &str = "/registry/v3/heartbeats";

const DOMAIN_HEADER: &str = "x-domain-name";
const CONSUMER_HEADER: &str = "x-consumerid";

/// Registry operations used by the scheduler and the process lifecycle
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Look up a service id; `None` means the service must be registered
    async fn get_service_id(
        &self,
        identity: &ServiceIdentity,
    ) -> Result<Option<String>, RegistryError>;

    async fn register_service(&self, identity: &ServiceIdentity) -> Result<String, RegistryError>;

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceConfig,
    ) -> Result<String, RegistryError>;

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<(), RegistryError>;

    async fn discovery(
        &self,
        consumer_id: &str,
        identity: &ServiceIdentity,
    ) -> Result<Vec<InstanceDescriptor>, RegistryError>;

    async fn unregister_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<(), RegistryError>;

    async fn unregister_service(&self, service_id: &str) -> Result<(), RegistryError>;

    /// Return the existing service id, registering the service if absent
    async fn ensure_service(&self, identity: &ServiceIdentity) -> Result<String, RegistryError> {
        if let Some(service_id) = self.get_service_id(identity).await? {
            debug!(service = %identity, service_id = %service_id, "Service already registered");
            return Ok(service_id);
        }
        let service_id = self.register_service(identity).await?;
        info!(service = %identity, service_id = %service_id, "Registered service");
        Ok(service_id)
    }

    /// Register the service (if absent) and then this instance
    async fn register_self(
        &self,
        identity: &ServiceIdentity,
        instance: &InstanceConfig,
    ) -> Result<Registration, RegistryError> {
        let service_id = self.ensure_service(identity).await?;
        let instance_id = self.register_instance(&service_id, instance).await?;
        info!(
            service_id = %service_id,
            instance_id = %instance_id,
            endpoint = %instance.endpoint(),
            "Registered instance"
        );
        Ok(Registration {
            service_id,
            instance_id,
        })
    }
}

/// HTTP client for one registry and tenant domain
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    domain: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Create a client for `address` scoped to `domain`
    ///
    /// Connections are not kept alive between calls and server certificates
    /// are not verified.
    pub fn new(address: &str, domain: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Transport {
                op: "NewClient",
                reason: e.to_string(),
            })?;

        let domain = if domain.is_empty() { DEFAULT_DOMAIN } else { domain };

        Ok(Self {
            base_url: address.trim_end_matches('/').to_string(),
            domain: domain.to_string(),
            timeout,
            http,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(DOMAIN_HEADER, &self.domain)
    }

    /// Send a request and return the raw status and body
    async fn execute(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), RegistryError> {
        let response = request.send().await.map_err(|e| RegistryError::Transport {
            op,
            reason: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| RegistryError::Transport {
            op,
            reason: format!("read response failed: {}", e),
        })?;
        debug!(op, status = status.as_u16(), body = %body, "Registry response");
        Ok((status, body))
    }

    /// Send a request, requiring a 2xx/3xx status
    async fn expect_success(
        &self,
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<String, RegistryError> {
        let (status, body) = self.execute(op, request).await?;
        if is_success(status) {
            Ok(body)
        } else {
            Err(RegistryError::Status {
                op,
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Open the instance-change subscription for `service_id`
    pub async fn watch(&self, service_id: &str) -> Result<WatchStream, RegistryError> {
        const OP: &str = "WatchService";

        let url = self.watch_url(service_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RegistryError::InvalidAddress {
                op: OP,
                reason: e.to_string(),
            })?;
        let headers = request.headers_mut();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(
            DOMAIN_HEADER,
            HeaderValue::from_str(&self.domain).map_err(|e| RegistryError::InvalidAddress {
                op: OP,
                reason: e.to_string(),
            })?,
        );

        let (ws, _) = tokio::time::timeout(
            self.timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| RegistryError::Transport {
            op: OP,
            reason: "timeout opening websocket".to_string(),
        })?
        .map_err(|e| RegistryError::Transport {
            op: OP,
            reason: format!("start websocket failed: {}", e),
        })?;

        info!(service_id, url = %url, "Watch subscription opened");
        Ok(WatchStream {
            ws,
            terminated: false,
        })
    }

    /// Deliver watch events to `on_event` until the subscription ends
    ///
    /// Each frame is handed to the handler before the next one is read.
    /// Always returns the error that ended the subscription.
    pub async fn watch_service<F>(&self, service_id: &str, mut on_event: F) -> RegistryError
    where
        F: FnMut(WatchEvent),
    {
        let mut stream = match self.watch(service_id).await {
            Ok(stream) => stream,
            Err(e) => return e,
        };
        loop {
            match stream.next_event().await {
                Ok(event) => on_event(event),
                Err(e) => return e,
            }
        }
    }

    fn watch_url(&self, service_id: &str) -> Result<Url, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidAddress {
            op: "WatchService",
            reason,
        };
        let mut url = Url::parse(&format!(
            "{}{}/{}/watcher",
            self.base_url, MICROSERVICES, service_id
        ))
        .map_err(|e| invalid(format!("parse registry url failed: {}", e)))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot use scheme {} for {}", scheme, url)))?;
        Ok(url)
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn get_service_id(
        &self,
        identity: &ServiceIdentity,
    ) -> Result<Option<String>, RegistryError> {
        const OP: &str = "GetServiceID";

        let request = self
            .request(Method::GET, EXISTENCE)
            .query(&[("type", "microservice")])
            .query(&identity.query());
        let (status, body) = self.execute(OP, request).await?;

        // The registry answers an unknown service with a client error
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            debug!(service = %identity, status = status.as_u16(), "Service not found");
            return Ok(None);
        }
        if !is_success(status) {
            return Err(RegistryError::Status {
                op: OP,
                status: status.as_u16(),
                body,
            });
        }

        let existence: ExistenceResponse = decode(OP, &body)?;
        Ok(Some(existence.service_id).filter(|id| !id.is_empty()))
    }

    async fn register_service(&self, identity: &ServiceIdentity) -> Result<String, RegistryError> {
        const OP: &str = "RegisterService";

        let request = self
            .request(Method::POST, MICROSERVICES)
            .json(&RequestBody::create_service(identity));
        let result = async {
            let body = self.expect_success(OP, request).await?;
            let created: CreateServiceResponse = decode(OP, &body)?;
            non_empty(OP, "serviceId", created.service_id)
        }
        .await;
        result.map_err(|e| RegistryError::registration(OP, e))
    }

    async fn register_instance(
        &self,
        service_id: &str,
        instance: &InstanceConfig,
    ) -> Result<String, RegistryError> {
        const OP: &str = "RegisterInstance";

        let request = self
            .request(Method::POST, &format!("{}/{}/instances", MICROSERVICES, service_id))
            .json(&RequestBody::register_instance(instance));
        let result = async {
            let body = self.expect_success(OP, request).await?;
            let registered: RegisterInstanceResponse = decode(OP, &body)?;
            non_empty(OP, "instanceId", registered.instance_id)
        }
        .await;
        result.map_err(|e| RegistryError::registration(OP, e))
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<(), RegistryError> {
        const OP: &str = "Heartbeat";

        let request = self
            .request(Method::PUT, HEARTBEATS)
            .json(&RequestBody::heartbeat(service_id, instance_id));
        self.expect_success(OP, request)
            .await
            .map(|_| ())
            .map_err(|e| RegistryError::heartbeat(OP, e))
    }

    async fn discovery(
        &self,
        consumer_id: &str,
        identity: &ServiceIdentity,
    ) -> Result<Vec<InstanceDescriptor>, RegistryError> {
        const OP: &str = "Discovery";

        let request = self
            .request(Method::GET, DISCOVERY)
            .query(&identity.query())
            .header(CONSUMER_HEADER, consumer_id);
        let body = self.expect_success(OP, request).await?;
        let found: InstancesResponse = decode(OP, &body)?;
        let instances = found.instances.unwrap_or_default();
        debug!(service = %identity, count = instances.len(), "Discovered instances");
        Ok(instances)
    }

    async fn unregister_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<(), RegistryError> {
        let request = self.request(
            Method::DELETE,
            &format!("{}/{}/instances/{}", MICROSERVICES, service_id, instance_id),
        );
        self.expect_success("UnRegisterInstance", request)
            .await
            .map(|_| ())
    }

    async fn unregister_service(&self, service_id: &str) -> Result<(), RegistryError> {
        let request = self
            .request(Method::DELETE, &format!("{}/{}", MICROSERVICES, service_id))
            .query(&[("force", "true")]);
        self.expect_success("UnRegisterService", request)
            .await
            .map(|_| ())
    }
}

/// Pull-based stream of watch events
///
/// A frame is read from the socket only when [`WatchStream::next_event`] is
/// called, so a slow consumer slows the subscription down.
pub struct WatchStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    terminated: bool,
}

impl WatchStream {
    /// Read the next instance-change event
    ///
    /// Returns `WatchTerminated` once the connection closes, drops, or a
    /// frame fails to decode; the stream stays terminated afterwards.
    pub async fn next_event(&mut self) -> Result<WatchEvent, RegistryError> {
        const OP: &str = "WatchService";

        let terminated = |reason: String| RegistryError::WatchTerminated { op: OP, reason };

        if self.terminated {
            return Err(terminated("stream already terminated".to_string()));
        }

        let result = loop {
            match self.ws.next().await {
                None => break Err(terminated("connection closed".to_string())),
                Some(Err(e)) => break Err(terminated(format!("receive message failed: {}", e))),
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<WatchEvent>(&text).map_err(|e| {
                        warn!(error = %e, frame = %text, "Undecodable watch frame");
                        terminated(format!("decode frame failed: {}", e))
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by registry: {} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by registry".to_string());
                    break Err(terminated(reason));
                }
                // ping/pong are answered by tungstenite; binary frames carry no events
                Some(Ok(_)) => continue,
            }
        };

        if result.is_err() {
            self.terminated = true;
        }
        result
    }

    /// Close the underlying connection
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

fn decode<T: DeserializeOwned>(op: &'static str, body: &str) -> Result<T, RegistryError> {
    serde_json::from_str(body).map_err(|e| RegistryError::Decode {
        op,
        reason: format!("unmarshal response body {:?} failed: {}", body, e),
    })
}

fn non_empty(op: &'static str, field: &str, value: String) -> Result<String, RegistryError> {
    if value.is_empty() {
        Err(RegistryError::Decode {
            op,
            reason: format!("response has no {}", field),
        })
    } else {
        Ok(value)
    }
}
