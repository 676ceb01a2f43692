//! §4.8 BrokerHub: a pool of MQTT clients keyed by connection-credential
//! tuple, one background event-loop task per pooled client, topic-filter
//! dispatch with the specific-device-suppresses-wildcard rule, and handler
//! execution parallelized over a bounded worker pool.

use domain::{topic_matches, BrokerConn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A message handler: given the concrete topic and the decoded payload,
/// returns a future that performs the (database-writing) work. Dispatched
/// onto the shared worker pool, never run inline on the network loop task.
pub type Handler = Arc<dyn Fn(String, serde_json::Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Decodes a raw MQTT payload per §4.8: UTF-8 then JSON, falling back to a
/// permissive YAML-like parse, then finally a raw string.
pub fn decode_payload(bytes: &[u8]) -> serde_json::Value {
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => return serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
    };
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text) {
        return v;
    }
    if let Ok(v) = serde_yaml::from_str::<serde_json::Value>(text) {
        return v;
    }
    serde_json::Value::String(text.to_string())
}

/// Identifies a shared client connection: same credentials, same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    ca_cert_path: Option<String>,
}

impl ClientKey {
    fn from_conn(conn: &BrokerConn) -> Self {
        Self {
            host: conn.host.clone(),
            port: conn.port,
            username: conn.username.clone(),
            password: conn.password.clone(),
            ca_cert_path: conn.ca_cert_path.clone(),
        }
    }
}

struct Registration {
    topic_filter: String,
    /// `None` means this registration is the wildcard (`*`) device rule for
    /// its topic; `Some(id)` means it is bound to one literal device id.
    device_id: Option<String>,
    handler: Handler,
}

/// One pooled MQTT connection: the client handle, its background network
/// loop, and the handlers registered against it.
struct BrokerClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subscriptions: RwLock<Vec<(String, QoS)>>,
    registrations: RwLock<Vec<Registration>>,
    loop_handle: JoinHandle<()>,
}

impl BrokerClient {
    async fn connect(key: &ClientKey, keepalive_seconds: u16, worker_permits: Arc<Semaphore>) -> anyhow::Result<Arc<Self>> {
        let client_id = format!("ingest-{}-{}", key.host, uuid_like());
        let mut options = MqttOptions::new(client_id, key.host.clone(), key.port);
        options.set_keep_alive(Duration::from_secs(keepalive_seconds as u64));

        if let (Some(username), Some(password)) = (&key.username, &key.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(ca_path) = &key.ca_cert_path {
            let ca = std::fs::read(ca_path)
                .map_err(|e| anyhow::anyhow!("failed to read CA certificate at {ca_path}: {e}"))?;
            options.set_transport(Transport::tls(ca, None, None));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 250);
        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions: Arc<RwLock<Vec<(String, QoS)>>> = Arc::new(RwLock::new(Vec::new()));
        let registrations: Arc<RwLock<Vec<Registration>>> = Arc::new(RwLock::new(Vec::new()));

        let connected_clone = connected.clone();
        let subscriptions_clone = subscriptions.clone();
        let registrations_clone = registrations.clone();
        let resub_client = client.clone();
        let host = key.host.clone();

        let loop_handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected_clone.store(true, Ordering::SeqCst);
                        info!(host = %host, "mqtt broker connected");
                        let subs = subscriptions_clone.read().expect("lock poisoned").clone();
                        for (filter, qos) in subs {
                            if let Err(e) = resub_client.subscribe(&filter, qos).await {
                                error!(host = %host, filter = %filter, error = %e, "re-subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&registrations_clone, &worker_permits, publish.topic, publish.payload.to_vec());
                    }
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        connected_clone.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected_clone.store(false, Ordering::SeqCst);
                        warn!(host = %host, error = %e, "mqtt connection error; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Arc::new(Self { client, connected, subscriptions, registrations, loop_handle }))
    }

    async fn add_sub(&self, topic_filter: &str, device_id: Option<&str>, handler: Handler, qos: QoS) -> anyhow::Result<()> {
        {
            let mut subs = self.subscriptions.write().expect("lock poisoned");
            if !subs.iter().any(|(f, _)| f == topic_filter) {
                subs.push((topic_filter.to_string(), qos));
            }
        }
        self.registrations.write().expect("lock poisoned").push(Registration {
            topic_filter: topic_filter.to_string(),
            device_id: device_id.map(str::to_string),
            handler,
        });
        self.client
            .subscribe(topic_filter, qos)
            .await
            .map_err(|e| anyhow::anyhow!("failed to subscribe to {topic_filter}: {e}"))
    }

    async fn clear(&self) {
        let filters: Vec<String> = {
            let subs = self.subscriptions.read().expect("lock poisoned");
            subs.iter().map(|(f, _)| f.clone()).collect()
        };
        for filter in filters {
            if let Err(e) = self.client.unsubscribe(&filter).await {
                warn!(filter = %filter, error = %e, "unsubscribe failed during clear");
            }
        }
        self.subscriptions.write().expect("lock poisoned").clear();
        self.registrations.write().expect("lock poisoned").clear();
    }

    async fn stop(&self) {
        self.loop_handle.abort();
        let _ = self.client.disconnect().await;
    }
}

/// §4.8 dispatch: finds every registration whose filter matches `topic`,
/// applies the specific-device-suppresses-wildcard rule, then spawns each
/// surviving handler on the worker pool.
fn dispatch(registrations: &RwLock<Vec<Registration>>, worker_permits: &Arc<Semaphore>, topic: String, payload: Vec<u8>) {
    let regs = registrations.read().expect("lock poisoned");
    let candidates: Vec<&Registration> = regs.iter().filter(|r| topic_matches(&r.topic_filter, &topic)).collect();
    if candidates.is_empty() {
        debug!(topic = %topic, "no handler registered for topic");
        return;
    }

    let has_specific = candidates.iter().any(|r| r.device_id.is_some());
    let surviving: Vec<Handler> = candidates
        .into_iter()
        .filter(|r| !has_specific || r.device_id.is_some())
        .map(|r| r.handler.clone())
        .collect();
    drop(regs);

    let value = decode_payload(&payload);
    for handler in surviving {
        let permits = worker_permits.clone();
        let topic = topic.clone();
        let value = value.clone();
        // tokio isolates panics at the task boundary, so one handler panicking
        // cannot bring down the network loop or any other dispatched handler.
        let join = tokio::spawn(async move {
            let _permit = permits.acquire().await;
            handler(topic, value).await;
        });
        tokio::spawn(async move {
            if let Err(e) = join.await {
                error!(error = %e, "handler task panicked; message dropped");
            }
        });
    }
}

fn uuid_like() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos)
}

/// The pool of MQTT client connections, keyed by connection-credential
/// tuple. One client per distinct tuple is shared across every route that
/// uses those credentials.
pub struct BrokerHub {
    clients: RwLock<HashMap<ClientKey, Arc<BrokerClient>>>,
    worker_permits: Arc<Semaphore>,
}

impl BrokerHub {
    /// `worker_count` bounds how many handler futures may run concurrently
    /// per process (shared across all pooled clients), per §4.8's "shared
    /// worker pool of N threads" (default 4).
    pub fn new(worker_count: usize) -> Self {
        Self { clients: RwLock::new(HashMap::new()), worker_permits: Arc::new(Semaphore::new(worker_count.max(1))) }
    }

    async fn client_for(&self, conn: &BrokerConn) -> anyhow::Result<Arc<BrokerClient>> {
        let key = ClientKey::from_conn(conn);
        if let Some(existing) = self.clients.read().expect("lock poisoned").get(&key) {
            return Ok(existing.clone());
        }
        let client = BrokerClient::connect(&key, conn.keepalive_seconds, self.worker_permits.clone()).await?;
        self.clients.write().expect("lock poisoned").insert(key, client.clone());
        Ok(client)
    }

    /// Registers a handler for `topic_filter` on the client identified by
    /// `conn`'s credentials, bound to a literal `device_id` or `None` for
    /// the wildcard rule.
    pub async fn add_sub(
        &self,
        conn: &BrokerConn,
        topic_filter: &str,
        device_id: Option<&str>,
        handler: Handler,
        qos: QoS,
    ) -> anyhow::Result<()> {
        let client = self.client_for(conn).await?;
        client.add_sub(topic_filter, device_id, handler, qos).await
    }

    /// Publishes `payload` to `topic` on the client identified by `conn`'s
    /// credentials, pooling/connecting that client first if needed. Used by
    /// the alert monitor to republish violation notices.
    pub async fn publish(&self, conn: &BrokerConn, topic: &str, qos: QoS, payload: Vec<u8>) -> anyhow::Result<()> {
        let client = self.client_for(conn).await?;
        client
            .client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish to {topic}: {e}"))
    }

    /// Whether the pooled client for `conn` is currently connected, if one
    /// exists at all.
    pub fn is_connected(&self, conn: &BrokerConn) -> bool {
        let key = ClientKey::from_conn(conn);
        self.clients
            .read()
            .expect("lock poisoned")
            .get(&key)
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Unsubscribes and clears every registered handler on every pooled
    /// client, ahead of a full subscription rebuild (§4.9 Supervisor).
    pub async fn clear_all(&self) {
        let clients: Vec<Arc<BrokerClient>> = self.clients.read().expect("lock poisoned").values().cloned().collect();
        for client in clients {
            client.clear().await;
        }
    }

    /// Halts every pooled client's network loop, disconnects, and drops the
    /// pool. Pending dispatched work is allowed to complete (no deadline).
    pub async fn stop_all(&self) {
        let clients: Vec<Arc<BrokerClient>> = {
            let mut map = self.clients.write().expect("lock poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_payload_parses_json() {
        let v = decode_payload(br#"{"a": 1}"#);
        assert_eq!(v, serde_json::json!({"a": 1}));
    }

    #[test]
    fn decode_payload_falls_back_to_raw_string() {
        let v = decode_payload(b"not json: not yaml either: [");
        assert!(v.is_string());
    }

    #[test]
    fn decode_payload_handles_non_utf8() {
        let v = decode_payload(&[0xff, 0xfe, 0xfd]);
        assert!(v.is_string());
    }
}
