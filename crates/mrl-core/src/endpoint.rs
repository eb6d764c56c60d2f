//! Client endpoint: one connection to a remote runtime.
//!
//! An [`Endpoint`] is a cheap, cloneable handle. Connecting spawns one driver
//! task that owns the transport and performs all dispatch in order; callers
//! send through an unbounded queue and wait for blocking replies on a timer,
//! so a pending call never stalls inbound processing.
//!
//! # Example
//!
//! ```rust,ignore
//! use mrl_core::{Args, Endpoint};
//!
//! let endpoint = Endpoint::builder()
//!     .url("ws://127.0.0.1:8888/api/messages")
//!     .build()?;
//! endpoint.connect().await?;
//! endpoint.wait_ready(std::time::Duration::from_secs(5)).await?;
//!
//! endpoint.send_to("servo1", "moveTo", Args::new().arg(90))?;
//! let reply = endpoint.send_to_blocking("python", "exec", Args::new().arg("print(1)")).await?;
//! ```

use crate::config::{EndpointConfig, ProtocolConfig};
use crate::correlation::{self, PollPolicy};
use crate::envelope::{self, Args, Envelope, MsgType};
use crate::error::{MrlError, Result};
use crate::identity::{ConnectionState, Identity, Platform};
use crate::naming::{self, Resolved};
use crate::proxy::{ProxyShared, ServiceProxy};
use crate::registry::ServiceRecord;
use crate::router::Router;
use crate::subscriptions::{Callback, Listeners};
use crate::transport::{Transport, TransportEvent, WebSocketTransport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Builder for an [`Endpoint`].
///
/// ```rust,ignore
/// let endpoint = Endpoint::builder()
///     .local_id("E1")
///     .blocking_poll(Duration::from_millis(250), 40)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
    platform: Option<Platform>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Fix the local id instead of generating one.
    pub fn local_id(mut self, id: impl Into<String>) -> Self {
        self.config = self.config.with_local_id(id);
        self
    }

    /// WebSocket URL used by [`Endpoint::connect`].
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config = self.config.with_url(url);
        self
    }

    /// Poll interval and poll budget of blocking calls.
    ///
    /// Default: 1000 ms, 20 polls
    pub fn blocking_poll(mut self, interval: Duration, max_polls: u32) -> Self {
        self.config = self
            .config
            .with_poll_interval(interval)
            .with_max_polls(max_polls);
        self
    }

    pub fn reply_ttl(mut self, ttl: Duration) -> Self {
        self.config = self.config.with_reply_ttl(ttl);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_sweep_interval(interval);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_connect_timeout(timeout);
        self
    }

    /// Platform descriptor announced in the hello.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Validate the configuration and create the endpoint.
    pub fn build(self) -> Result<Endpoint> {
        self.config.validate()?;

        let local_id = self
            .config
            .local_id
            .clone()
            .unwrap_or_else(Identity::generate_id);
        let router = Arc::new(Router::new(local_id));
        if let Some(platform) = self.platform {
            router.set_platform(platform);
        }
        debug!("Created endpoint {}", router.runtime_name());

        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                config: self.config,
                router,
                connectivity: Arc::new(Listeners::new("connectivity")),
                link: Mutex::new(None),
                proxies: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Handle to a running connection driver. Dropping it stops the driver.
struct Link {
    outbound: mpsc::UnboundedSender<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EndpointInner {
    config: EndpointConfig,
    router: Arc<Router>,
    connectivity: Arc<Listeners<bool>>,
    link: Mutex<Option<Link>>,
    proxies: Mutex<HashMap<String, Arc<ProxyShared>>>,
}

/// Client endpoint of a remote runtime.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("runtime", &self.inner.router.runtime_name())
            .field("remote_id", &self.inner.router.remote_id())
            .field("state", &self.inner.router.connection_state())
            .finish()
    }
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Create an endpoint from a config.
    pub fn new(config: EndpointConfig) -> Result<Self> {
        EndpointBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// The router behind this endpoint.
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    // ========================================
    // Connection
    // ========================================

    /// Connect to the configured URL over WebSocket.
    pub async fn connect(&self) -> Result<()> {
        let transport =
            WebSocketTransport::new(&self.inner.config.url, self.inner.config.connect_timeout);
        self.connect_with(transport).await
    }

    /// Connect over the given transport.
    ///
    /// The registry and local subscriptions survive earlier connections.
    /// Connecting while a connection is up is a no-op.
    pub async fn connect_with<T: Transport>(&self, mut transport: T) -> Result<()> {
        let router = &self.inner.router;
        if router.connection_state() != ConnectionState::Disconnected {
            info!(
                "{} is already connected ({:?})",
                router.runtime_name(),
                router.connection_state()
            );
            return Ok(());
        }

        router.begin_connect()?;
        info!("Connecting {} via {}", router.runtime_name(), transport.describe());
        if let Err(e) = transport.open().await {
            warn!("Failed to open {}: {}", transport.describe(), e);
            router.on_close();
            self.inner.connectivity.notify(&false);
            return Err(e);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            router: Arc::clone(router),
            connectivity: Arc::clone(&self.inner.connectivity),
            reply_ttl: self.inner.config.reply_ttl,
            sweep_interval: self.inner.config.sweep_interval,
        };
        let task = tokio::spawn(driver.run(transport, outbound_rx, shutdown_rx));

        *self.lock_link() = Some(Link {
            outbound: outbound_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        });
        Ok(())
    }

    /// Close the connection after flushing queued messages.
    pub async fn close(&self) -> Result<()> {
        let link = self.lock_link().take();
        let Some(mut link) = link else {
            return Ok(());
        };

        link.shutdown();
        if let Some(task) = link.task.take() {
            task.await
                .map_err(|e| MrlError::Other(format!("connection driver failed: {}", e)))?;
        }
        Ok(())
    }

    /// Wait until the hello exchange has completed.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut state = self.inner.router.subscribe_state();
        let ready = tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Ready))
            .await
            .map_err(|_| MrlError::Timeout {
                what: "hello from the remote runtime".to_string(),
                after: timeout,
            })?
            .is_ok();

        if ready {
            Ok(())
        } else {
            Err(MrlError::NotConnected)
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.router.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================
    // Sending
    // ========================================

    /// Build an envelope from this endpoint's runtime to `name`.
    pub fn create_message(&self, name: &str, method: &str, args: impl Into<Args>) -> Result<Envelope> {
        self.inner.router.create_message(name, method, args)
    }

    /// Queue an envelope for sending.
    pub fn send_message(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope::encode(envelope)?;
        let link = self.lock_link();
        let link = link.as_ref().ok_or(MrlError::NotConnected)?;
        link.outbound
            .send(payload)
            .map_err(|_| MrlError::NotConnected)
    }

    /// Fire-and-forget call of `method` on `name`.
    pub fn send_to(&self, name: &str, method: &str, args: impl Into<Args>) -> Result<()> {
        let mut envelope = self.create_message(name, method, args)?;
        envelope.sending_method = Some(ProtocolConfig::SENDING_METHOD_SEND_TO.to_string());
        self.send_message(&envelope)
    }

    /// Send `envelope` as a blocking call and wait for the correlated reply.
    pub async fn send_blocking(&self, mut envelope: Envelope) -> Result<Envelope> {
        envelope.msg_type = Some(MsgType::Blocking);
        if envelope.sending_method.is_none() {
            envelope.sending_method = Some(ProtocolConfig::SENDING_METHOD_BLOCKING.to_string());
        }
        let policy = PollPolicy::new(
            self.inner.config.poll_interval,
            self.inner.config.max_polls,
        );
        let reply = correlation::wait_for_reply(self.inner.router.correlation(), &envelope, policy);
        self.send_message(&envelope)?;
        reply.await
    }

    /// Blocking call of `method` on `name`.
    pub async fn send_to_blocking(
        &self,
        name: &str,
        method: &str,
        args: impl Into<Args>,
    ) -> Result<Envelope> {
        let envelope = self.create_message(name, method, args)?;
        self.send_blocking(envelope).await
    }

    /// Ask `name` to publish `topic` to this endpoint's runtime.
    pub fn subscribe(&self, name: &str, topic: &str) -> Result<()> {
        self.listener_control(name, ProtocolConfig::ADD_LISTENER, topic)
    }

    /// Withdraw a subscription made with [`Endpoint::subscribe`].
    pub fn unsubscribe(&self, name: &str, topic: &str) -> Result<()> {
        self.listener_control(name, ProtocolConfig::REMOVE_LISTENER, topic)
    }

    fn listener_control(&self, name: &str, control: &str, topic: &str) -> Result<()> {
        let subscriber = self.runtime_name();
        self.send_to(name, control, Args::new().arg(topic).arg(subscriber))
    }

    /// Report a problem to the remote runtime's maintainers.
    pub fn no_worky(&self, user_id: &str) -> Result<()> {
        self.send_to(
            ProtocolConfig::RUNTIME_SERVICE,
            ProtocolConfig::NO_WORKY,
            Args::new().arg(user_id),
        )
    }

    // ========================================
    // Local subscriptions
    // ========================================

    /// Receive every message sent by `name`.
    pub fn subscribe_by_name(&self, name: &str, cb: Callback) {
        let full_name = self.full_name(name);
        self.inner.router.subscriptions().subscribe_by_name(full_name, cb);
    }

    pub fn unsubscribe_by_name(&self, name: &str, cb: &Callback) -> bool {
        let full_name = self.full_name(name);
        self.inner
            .router
            .subscriptions()
            .unsubscribe_by_name(&full_name, cb)
    }

    /// Receive every message with `method`, whatever the sender.
    pub fn subscribe_by_method(&self, method: &str, cb: Callback) {
        self.inner.router.subscriptions().subscribe_by_method(method, cb);
    }

    pub fn unsubscribe_by_method(&self, method: &str, cb: &Callback) -> bool {
        self.inner
            .router
            .subscriptions()
            .unsubscribe_by_method(method, cb)
    }

    /// Receive `method` (topic or notification name) from `name` only.
    pub fn subscribe_by_name_method(&self, name: &str, method: &str, cb: Callback) {
        let full_name = self.full_name(name);
        self.inner
            .router
            .subscriptions()
            .subscribe_by_name_method(&full_name, method, cb);
    }

    pub fn unsubscribe_by_name_method(&self, name: &str, method: &str, cb: &Callback) -> bool {
        let full_name = self.full_name(name);
        self.inner
            .router
            .subscriptions()
            .unsubscribe_by_name_method(&full_name, method, cb)
    }

    /// Called with `true` when a connection opens and `false` when it closes.
    pub fn subscribe_connected<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.connectivity.add(move |connected: &bool| f(*connected));
    }

    /// Called with every service the remote runtime registers.
    pub fn subscribe_registered<F>(&self, f: F)
    where
        F: Fn(&ServiceRecord) + Send + Sync + 'static,
    {
        self.inner.router.registered_listeners().add(f);
    }

    /// Called with the full name of every released service.
    pub fn subscribe_released<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.router.released_listeners().add(f);
    }

    // ========================================
    // Registry
    // ========================================

    pub fn get_service(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.inner.router.registry().get(&self.full_name(name))
    }

    /// All known services, sorted by full name.
    pub fn services(&self) -> Vec<Arc<ServiceRecord>> {
        let registry = self.inner.router.registry();
        registry
            .names()
            .iter()
            .filter_map(|name| registry.get(name))
            .collect()
    }

    pub fn services_with_capability(&self, capability: &str) -> Vec<Arc<ServiceRecord>> {
        self.inner.router.registry().by_capability(capability)
    }

    pub fn registry_snapshot(&self) -> HashMap<String, Arc<ServiceRecord>> {
        self.inner.router.registry().snapshot()
    }

    pub fn set_registry(&self, records: impl IntoIterator<Item = ServiceRecord>) {
        self.inner.router.registry().replace_all(records);
    }

    /// Replace the record of a service with a new snapshot.
    pub fn update_state(&self, record: ServiceRecord) -> Arc<ServiceRecord> {
        self.inner.router.registry().register(record)
    }

    pub fn remove_service(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.inner.router.registry().remove(&self.full_name(name))
    }

    /// Service types the remote runtime can create, by simple type name.
    pub fn possible_services(&self) -> HashMap<String, Value> {
        self.inner.router.registry().service_types()
    }

    pub fn set_possible_services(&self, service_types: HashMap<String, Value>) {
        self.inner.router.registry().set_service_types(service_types);
    }

    // ========================================
    // Identity
    // ========================================

    /// Full name of `name`, or `name` itself while it cannot be qualified.
    pub fn full_name(&self, name: &str) -> String {
        self.resolve(name).into_string()
    }

    pub fn short_name(&self, name: &str) -> String {
        naming::short_name(name).to_string()
    }

    pub fn resolve(&self, name: &str) -> Resolved {
        self.inner.router.resolve(name)
    }

    pub fn local_id(&self) -> String {
        self.inner.router.local_id()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.inner.router.remote_id()
    }

    /// `runtime@<local id>`, the sender of every outbound message.
    pub fn runtime_name(&self) -> String {
        self.inner.router.runtime_name()
    }

    pub fn platform(&self) -> Platform {
        self.inner.router.platform()
    }

    pub fn set_platform(&self, platform: Platform) {
        self.inner.router.set_platform(platform);
    }

    pub fn remote_platform(&self) -> Option<Platform> {
        self.inner.router.remote_platform()
    }

    // ========================================
    // Proxies
    // ========================================

    /// Addressable proxy of the remote service `name`.
    ///
    /// Proxies for the same full name share their state. A proxy created
    /// before the hello is shared with later proxies of the qualified name.
    pub fn proxy(&self, name: &str) -> ServiceProxy {
        let full_name = self.full_name(name);
        let mut proxies = self
            .inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if naming::is_full_name(&full_name) && !proxies.contains_key(&full_name) {
            if let Some(early) = proxies.remove(naming::short_name(&full_name)) {
                proxies.insert(full_name.clone(), early);
            }
        }
        let shared = Arc::clone(
            proxies
                .entry(full_name.clone())
                .or_insert_with(|| Arc::new(ProxyShared::new(full_name))),
        );
        ServiceProxy::new(self.clone(), shared)
    }
}

/// Connection driver: owns the transport for one connection.
struct Driver {
    router: Arc<Router>,
    connectivity: Arc<Listeners<bool>>,
    reply_ttl: Duration,
    sweep_interval: Duration,
}

impl Driver {
    async fn run<T: Transport>(
        self,
        mut transport: T,
        mut outbound: mpsc::UnboundedReceiver<String>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let describe = transport.describe();

        // The opening event comes first so the hello precedes queued messages
        let first = transport.next_event().await;
        let mut running = self.handle_event(&mut transport, first).await;

        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);

        while running {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Closing {}", describe);
                    while let Ok(payload) = outbound.try_recv() {
                        self.send_raw(&mut transport, &payload).await;
                    }
                    if let Err(e) = transport.close().await {
                        debug!("Closing {} failed: {}", describe, e);
                    }
                    running = false;
                }
                event = transport.next_event() => {
                    running = self.handle_event(&mut transport, event).await;
                }
                payload = outbound.recv() => match payload {
                    Some(payload) => self.send_raw(&mut transport, &payload).await,
                    None => {
                        let _ = transport.close().await;
                        running = false;
                    }
                },
                _ = sweep.tick() => {
                    self.router.correlation().sweep(self.reply_ttl);
                }
            }
        }

        if self.router.on_close() {
            info!("Disconnected from {}", describe);
            self.connectivity.notify(&false);
        }
    }

    /// Returns false once the connection is gone.
    async fn handle_event<T: Transport>(
        &self,
        transport: &mut T,
        event: Option<TransportEvent>,
    ) -> bool {
        match event {
            Some(TransportEvent::Open) => {
                match self.router.on_open() {
                    Ok(hello) => self.send_envelope(transport, &hello).await,
                    Err(e) => warn!("Unexpected open event: {}", e),
                }
                self.connectivity.notify(&true);
                true
            }
            Some(TransportEvent::Message(raw)) => {
                match self.router.dispatch(&raw) {
                    Ok(outcome) => {
                        for envelope in &outcome.outbound {
                            self.send_envelope(transport, envelope).await;
                        }
                    }
                    Err(e) => error!("Dropping inbound payload: {}", e),
                }
                true
            }
            Some(TransportEvent::Error(message)) => {
                warn!("Transport error on {}: {}", transport.describe(), message);
                true
            }
            Some(TransportEvent::Close(reason)) => {
                info!(
                    "{} closed: {}",
                    transport.describe(),
                    reason.as_deref().unwrap_or("no reason")
                );
                false
            }
            None => false,
        }
    }

    async fn send_envelope<T: Transport>(&self, transport: &mut T, envelope: &Envelope) {
        match envelope::encode(envelope) {
            Ok(payload) => self.send_raw(transport, &payload).await,
            Err(e) => error!("Failed to encode {}.{}: {}", envelope.name, envelope.method, e),
        }
    }

    async fn send_raw<T: Transport>(&self, transport: &mut T, payload: &str) {
        if let Err(e) = transport.send(payload).await {
            warn!("Send on {} failed: {}", transport.describe(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_generates_local_id() {
        let endpoint = Endpoint::builder().build().unwrap();
        assert!(endpoint
            .local_id()
            .starts_with(ProtocolConfig::LOCAL_ID_PREFIX));
        assert_eq!(
            endpoint.runtime_name(),
            format!("runtime@{}", endpoint.local_id())
        );
        assert_eq!(endpoint.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        assert!(Endpoint::builder().url("http://nope").build().is_err());
        assert!(Endpoint::builder()
            .blocking_poll(Duration::from_millis(10), 0)
            .build()
            .is_err());
    }

    #[test]
    fn test_send_without_connection_fails() {
        let endpoint = Endpoint::builder().local_id("E1").build().unwrap();
        assert!(matches!(
            endpoint.send_to("logger", "info", Args::new().arg("hi")),
            Err(MrlError::NotConnected)
        ));
    }

    #[test]
    fn test_names_before_hello() {
        let endpoint = Endpoint::builder().local_id("E1").build().unwrap();
        assert_eq!(endpoint.full_name("logger"), "logger");
        assert_eq!(endpoint.full_name("logger@R9"), "logger@R9");
        assert_eq!(endpoint.short_name("logger@R9"), "logger");
        assert!(!endpoint.resolve("logger").is_full());
    }

    #[test]
    fn test_proxies_share_state_per_name() {
        let endpoint = Endpoint::builder().local_id("E1").build().unwrap();
        let a = endpoint.proxy("servo1@R9");
        let b = endpoint.proxy("servo1@R9");
        assert!(a.shares_state_with(&b));
        assert!(!a.shares_state_with(&endpoint.proxy("servo2@R9")));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let endpoint = Endpoint::builder().build().unwrap();
        endpoint.close().await.unwrap();
        assert!(!endpoint.is_connected());
    }
}
