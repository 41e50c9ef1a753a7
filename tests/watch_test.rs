//! Watch subscription integration tests
//!
//! Serves scripted frames from a local websocket server and checks delivery,
//! termination and cache updates.

use futures::SinkExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use registry_agent::{
    EndpointSelector, InstanceCache, InstanceDescriptor, InstanceStatus, ReconnectPolicy,
    RegistryClient, RegistryError, ServiceIdentity, WatchAction, WatchSubscriber,
};

#[derive(Debug, Default, Clone)]
struct Handshake {
    path: String,
    domain: Option<String>,
}

type Handshakes = Arc<Mutex<Vec<Handshake>>>;

/// Accept one websocket connection per script, send its frames, then close
async fn serve(scripts: Vec<Vec<Message>>) -> (String, Handshakes, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    let task = tokio::spawn(async move {
        for frames in scripts {
            let (stream, _) = listener.accept().await.unwrap();
            let recorded = recorded.clone();
            let callback = move |req: &Request, resp: Response| {
                recorded.lock().unwrap().push(Handshake {
                    path: req.uri().path().to_string(),
                    domain: req
                        .headers()
                        .get("x-domain-name")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                });
                Ok::<_, ErrorResponse>(resp)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            for frame in frames {
                ws.send(frame).await.unwrap();
            }
            let _ = ws.close(None).await;
        }
    });

    (address, seen, task)
}

fn accept_all(_: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    Ok(resp)
}

fn provider() -> ServiceIdentity {
    ServiceIdentity::new("hello-server", "0.0.1", "helloworld")
}

fn frame(action: &str, key: &ServiceIdentity, id: &str, host: &str, status: &str) -> Message {
    Message::Text(
        json!({
            "action": action,
            "key": key,
            "instance": {
                "instanceId": id,
                "serviceId": "svc-1",
                "hostName": host,
                "endpoints": [format!("rest://{}:8080", host)],
                "status": status
            }
        })
        .to_string(),
    )
}

fn client(address: &str) -> Arc<RegistryClient> {
    Arc::new(RegistryClient::new(address, "acme", Duration::from_secs(2)).unwrap())
}

fn descriptor(id: &str, host: &str, status: InstanceStatus) -> InstanceDescriptor {
    InstanceDescriptor {
        instance_id: id.to_string(),
        service_id: "svc-1".to_string(),
        hostname: host.to_string(),
        endpoints: vec![format!("rest://{}:8080", host)],
        status,
    }
}

#[tokio::test]
async fn test_watch_service_delivers_events_in_order() {
    let (address, seen, task) = serve(vec![vec![
        frame("CREATE", &provider(), "ins-1", "10.0.0.1", "UP"),
        Message::Ping(vec![1, 2, 3]),
        Message::Binary(vec![0xde, 0xad]),
        frame("UPDATE", &provider(), "ins-1", "10.0.0.1", "DOWN"),
    ]])
    .await;

    let mut events = Vec::new();
    let err = client(&address)
        .watch_service("svc-1", |event| events.push(event))
        .await;
    task.await.unwrap();

    assert!(matches!(err, RegistryError::WatchTerminated { op: "WatchService", .. }));
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action, WatchAction::Create);
    assert_eq!(events[1].action, WatchAction::Update);
    assert_eq!(events[1].instance.status, InstanceStatus::Down);

    let handshakes = seen.lock().unwrap().clone();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].path, "/registry/v3/microservices/svc-1/watcher");
    assert_eq!(handshakes[0].domain.as_deref(), Some("acme"));
}

#[tokio::test]
async fn test_stream_terminates_on_undecodable_frame() {
    let (address, _, task) = serve(vec![vec![
        frame("CREATE", &provider(), "ins-1", "10.0.0.1", "UP"),
        Message::Text("not json".to_string()),
        frame("CREATE", &provider(), "ins-2", "10.0.0.2", "UP"),
    ]])
    .await;

    let mut stream = client(&address).watch("svc-1").await.unwrap();
    let first = stream.next_event().await.unwrap();
    assert_eq!(first.instance.instance_id, "ins-1");

    let err = stream.next_event().await.unwrap_err();
    assert!(err.to_string().contains("decode frame failed"));

    // terminated streams stay terminated
    let again = stream.next_event().await.unwrap_err();
    assert!(matches!(again, RegistryError::WatchTerminated { .. }));

    stream.close().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_stream_terminates_on_close() {
    let (address, _, task) = serve(vec![vec![]]).await;

    let mut stream = client(&address).watch("svc-1").await.unwrap();
    let err = stream.next_event().await.unwrap_err();
    assert!(matches!(err, RegistryError::WatchTerminated { .. }));
    task.await.unwrap();
}

#[tokio::test]
async fn test_subscriber_keeps_cache_current() {
    let (address, _, task) = serve(vec![vec![
        frame("UPDATE", &provider(), "ins-1", "10.0.0.1", "DOWN"),
        frame(
            "CREATE",
            &ServiceIdentity::new("billing", "1.0.0", "helloworld"),
            "ins-9",
            "10.0.0.9",
            "UP",
        ),
        frame("CREATE", &provider(), "ins-2", "10.0.0.2", "UP"),
        frame(
            "CREATE",
            &ServiceIdentity::new("hello-server", "0.0.2", "helloworld"),
            "ins-3",
            "10.0.0.3",
            "UP",
        ),
    ]])
    .await;

    let cache = Arc::new(InstanceCache::new());
    cache.seed(&provider(), vec![descriptor("ins-1", "10.0.0.1", InstanceStatus::Up)]);
    let selector = EndpointSelector::new(cache.clone());
    assert_eq!(selector.select(&provider()).unwrap(), "http://10.0.0.1:8080");

    let subscriber = WatchSubscriber::new(client(&address), cache.clone(), provider());
    let (_tx, rx) = watch::channel(false);
    let err = subscriber.run("svc-1", rx).await.unwrap_err();
    task.await.unwrap();

    assert!(matches!(err, RegistryError::WatchTerminated { .. }));
    let instances = cache.get(&provider()).unwrap();
    assert_eq!(instances.len(), 3);
    assert_eq!(instances[0].status, InstanceStatus::Down);
    // a newer version of the provider still lands in its entry
    assert_eq!(instances[2].instance_id, "ins-3");
    assert_eq!(selector.select(&provider()).unwrap(), "http://10.0.0.2:8080");
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_subscriber_reconnects_after_stream_ends() {
    let (address, seen, task) = serve(vec![
        vec![frame("CREATE", &provider(), "ins-1", "10.0.0.1", "UP")],
        vec![frame("CREATE", &provider(), "ins-2", "10.0.0.2", "UP")],
    ])
    .await;

    let cache = Arc::new(InstanceCache::new());
    let subscriber = WatchSubscriber::new(client(&address), cache.clone(), provider())
        .with_reconnect(ReconnectPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
        });
    let (_tx, rx) = watch::channel(false);

    // the third connection attempt finds nobody listening
    let err = subscriber.run("svc-1", rx).await.unwrap_err();
    task.await.unwrap();

    assert!(matches!(err, RegistryError::Transport { op: "WatchService", .. }));
    assert_eq!(seen.lock().unwrap().len(), 2);
    let ids: Vec<String> = cache
        .get(&provider())
        .unwrap()
        .iter()
        .map(|i| i.instance_id.clone())
        .collect();
    assert_eq!(ids, vec!["ins-1".to_string(), "ins-2".to_string()]);
}

#[tokio::test]
async fn test_subscriber_stops_on_cancel() {
    // accepted but never answered, so the subscription just hangs
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = accept_hdr_async(stream, accept_all).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let cache = Arc::new(InstanceCache::new());
    let subscriber = WatchSubscriber::new(client(&address), cache, provider());
    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { subscriber.run("svc-1", rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    hold.abort();
}
