//! Shipped configuration files load and validate

use std::path::PathBuf;
use std::time::Duration;

use registry_agent::{Config, ServiceIdentity};

fn conf(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("conf").join(file)
}

#[test]
fn test_provider_config_loads() {
    let config = Config::load(conf("microservice.yaml")).unwrap();

    assert_eq!(
        config.service,
        ServiceIdentity::new("hello-server", "0.0.1", "helloworld")
    );
    assert_eq!(config.registry.address, "http://127.0.0.1:30100");
    assert_eq!(config.tenant.domain, "default");
    assert_eq!(config.heartbeat.interval(), Duration::from_secs(30));
    assert!(config.provider().is_err());

    let instance = config.instance().unwrap();
    assert_eq!(instance.listen_address, "127.0.0.1:8080");
    assert_eq!(instance.endpoint(), "rest://127.0.0.1:8080");
}

#[test]
fn test_consumer_config_loads() {
    let config = Config::load(conf("consumer.yaml")).unwrap();

    assert_eq!(config.service.name, "hello-client");
    assert_eq!(
        config.provider().unwrap(),
        &ServiceIdentity::new("hello-server", "0.0.1", "helloworld")
    );
    assert_eq!(config.instance().unwrap().listen_address, "127.0.0.1:8090");
    assert_eq!(config.watch.max_retries, 0);
}
