//! Inbound dispatch.
//!
//! The router owns the identity, registry, subscription index and correlation
//! table of one endpoint. Every inbound payload goes through
//! [`Router::dispatch`]:
//!
//! 1. replies (`msgType = "R"`) are parked in the correlation table and
//!    dispatch stops there
//! 2. framework handlers (hello, registration, release) keyed by
//!    `sender.method` or bare method
//! 3. subscribers by sender full name, except method map announcements
//! 4. subscribers by sender and notification name
//! 5. subscribers by bare method
//!
//! The router never writes to the transport. Messages a handler wants to send
//! (the listener registrations that follow the hello) come back in
//! [`DispatchOutcome::outbound`] and the connection driver sends them.

use crate::config::ProtocolConfig;
use crate::correlation::CorrelationTable;
use crate::envelope::{self, Args, Envelope, Inbound, MsgIdGenerator};
use crate::error::{MrlError, Result};
use crate::identity::{ConnectionState, Hello, Identity, Platform};
use crate::naming::{self, Resolved};
use crate::registry::{Registration, ServiceRecord, ServiceRegistry};
use crate::subscriptions::{self, Callback, Listeners, SubscriptionIndex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Endpoint-local handlers that run before any subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkEvent {
    Hello,
    Registered,
    Released,
}

/// What an inbound payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Heartbeat,
    /// A reply, parked under its `msgId`.
    Reply(u64),
    Message,
}

/// Result of dispatching one inbound payload.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub kind: DispatchKind,
    /// Subscribers that completed successfully.
    pub delivered: usize,
    /// Subscribers and framework handlers that failed.
    pub failures: usize,
    /// Follow-up messages to send to the peer.
    pub outbound: Vec<Envelope>,
}

impl DispatchOutcome {
    fn new(kind: DispatchKind) -> Self {
        Self {
            kind,
            delivered: 0,
            failures: 0,
            outbound: Vec::new(),
        }
    }
}

/// Routing and correlation state of one endpoint.
#[derive(Debug)]
pub struct Router {
    identity: RwLock<Identity>,
    state: watch::Sender<ConnectionState>,
    registry: Arc<ServiceRegistry>,
    subscriptions: Arc<SubscriptionIndex>,
    correlation: Arc<CorrelationTable>,
    framework: RwLock<HashMap<String, FrameworkEvent>>,
    registered: Listeners<ServiceRecord>,
    released: Listeners<str>,
    ids: MsgIdGenerator,
}

impl Router {
    pub fn new(local_id: impl Into<String>) -> Self {
        let identity = Identity::new(local_id);

        let mut framework = HashMap::new();
        framework.insert(
            ProtocolConfig::HELLO_METHOD.to_string(),
            FrameworkEvent::Hello,
        );
        framework.insert(
            ProtocolConfig::HELLO_REPLY_METHOD.to_string(),
            FrameworkEvent::Hello,
        );
        // Registrations relayed to our own runtime name
        framework.insert(
            naming::name_method_key(&identity.runtime_name(), ProtocolConfig::REGISTERED_TOPIC),
            FrameworkEvent::Registered,
        );

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            identity: RwLock::new(identity),
            state,
            registry: Arc::new(ServiceRegistry::new()),
            subscriptions: Arc::new(SubscriptionIndex::new()),
            correlation: Arc::new(CorrelationTable::new()),
            framework: RwLock::new(framework),
            registered: Listeners::new("registered"),
            released: Listeners::new("released"),
            ids: MsgIdGenerator::new(),
        }
    }

    // ========================================
    // Identity and connection state
    // ========================================

    pub fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn local_id(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .local_id()
            .to_string()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .remote_id()
            .map(str::to_string)
    }

    pub fn runtime_name(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .runtime_name()
    }

    pub fn platform(&self) -> Platform {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .platform()
            .clone()
    }

    pub fn set_platform(&self, platform: Platform) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_platform(platform);
    }

    pub fn remote_platform(&self) -> Option<Platform> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .remote_platform()
            .cloned()
    }

    /// Resolve a possibly short name against the remote id.
    pub fn resolve(&self, name: &str) -> Resolved {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(name)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, to: ConnectionState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state == to {
                return false;
            }
            if state.can_transition_to(to) {
                debug!("Connection state {:?} -> {:?}", *state, to);
                *state = to;
                true
            } else {
                result = Err(MrlError::InvalidTransition { from: *state, to });
                false
            }
        });
        result
    }

    /// A connection attempt starts. Fails unless the endpoint is disconnected.
    pub fn begin_connect(&self) -> Result<()> {
        let from = self.connection_state();
        if from != ConnectionState::Disconnected {
            return Err(MrlError::InvalidTransition {
                from,
                to: ConnectionState::Connecting,
            });
        }
        self.transition(ConnectionState::Connecting)
    }

    /// The transport opened. Returns the hello to send.
    pub fn on_open(&self) -> Result<Envelope> {
        self.transition(ConnectionState::AwaitingHello)?;
        self.hello_envelope()
    }

    /// The transport closed or failed. Registry and subscriptions are kept.
    ///
    /// Returns true if the endpoint had been connected.
    pub fn on_close(&self) -> bool {
        let was_connected = self.connection_state().is_connected();
        // Disconnected is reachable from every state
        let _ = self.transition(ConnectionState::Disconnected);
        was_connected
    }

    // ========================================
    // Outbound messages
    // ========================================

    /// Next message id of this endpoint.
    pub fn next_msg_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Build an envelope from this endpoint's runtime to `name`.
    ///
    /// A short name used before the hello completed is reported as an
    /// addressing error and sent unqualified.
    pub fn create_message(
        &self,
        name: &str,
        method: &str,
        args: impl Into<Args>,
    ) -> Result<Envelope> {
        let target = match self.resolve(name) {
            Resolved::Full(full) => full,
            Resolved::Unresolved(short) => {
                warn!(
                    "{}; sending {}.{} unqualified",
                    MrlError::Addressing {
                        name: short.clone()
                    },
                    short,
                    method
                );
                short
            }
        };

        let mut envelope = Envelope::new(self.next_msg_id(), target, self.runtime_name(), method);
        envelope.data = args.into().encode()?;
        Ok(envelope)
    }

    /// The hello this endpoint sends right after the transport opened.
    pub fn hello_envelope(&self) -> Result<Envelope> {
        let hello = serde_json::to_value(
            self.identity
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .hello(),
        )?;
        let args = Args::new()
            .arg(ProtocolConfig::HELLO_PLACEHOLDER)
            .arg(hello)
            .encode()?;

        let mut envelope = Envelope::new(
            self.next_msg_id(),
            ProtocolConfig::RUNTIME_SERVICE,
            self.runtime_name(),
            ProtocolConfig::HELLO_METHOD,
        );
        envelope.data = args;
        envelope.sending_method = Some(ProtocolConfig::SENDING_METHOD_SEND_TO.to_string());
        Ok(envelope)
    }

    // ========================================
    // Shared state
    // ========================================

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionIndex> {
        &self.subscriptions
    }

    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    /// Listeners notified with every newly registered record.
    pub fn registered_listeners(&self) -> &Listeners<ServiceRecord> {
        &self.registered
    }

    /// Listeners notified with the full name of every released service.
    pub fn released_listeners(&self) -> &Listeners<str> {
        &self.released
    }

    /// Bare-method entries only match a runtime sender during the handshake.
    fn framework_event(&self, sender: &str, method: &str) -> Option<FrameworkEvent> {
        let table = self.framework.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(event) = table.get(&naming::name_method_key(sender, method)) {
            return Some(*event);
        }
        let handshake = naming::short_name(sender) == ProtocolConfig::RUNTIME_SERVICE
            && self.connection_state() == ConnectionState::AwaitingHello;
        if handshake {
            table.get(method).copied()
        } else {
            None
        }
    }

    // ========================================
    // Dispatch
    // ========================================

    /// Decode and dispatch one raw transport payload.
    ///
    /// Only a decode failure is returned as an error; failures of handlers
    /// and subscribers are logged and counted in the outcome.
    pub fn dispatch(&self, raw: &str) -> Result<DispatchOutcome> {
        match envelope::decode(raw)? {
            Inbound::Heartbeat => {
                trace!("Heartbeat");
                Ok(DispatchOutcome::new(DispatchKind::Heartbeat))
            }
            Inbound::Message(envelope) => Ok(self.dispatch_envelope(&envelope)),
        }
    }

    /// Dispatch a decoded envelope.
    pub fn dispatch_envelope(&self, envelope: &Envelope) -> DispatchOutcome {
        if envelope.is_reply() {
            debug!(
                "Reply {} from {}.{}",
                envelope.msg_id, envelope.sender, envelope.method
            );
            self.correlation.insert(envelope.clone());
            return DispatchOutcome::new(DispatchKind::Reply(envelope.msg_id));
        }

        let mut outcome = DispatchOutcome::new(DispatchKind::Message);
        let sender = self.resolve(&envelope.sender).into_string();
        let method = envelope.method.as_str();

        if let Some(event) = self.framework_event(&sender, method) {
            match self.handle_framework(event, envelope) {
                Ok(mut outbound) => outcome.outbound.append(&mut outbound),
                Err(e) => {
                    warn!("{:?} handling of {}.{} failed: {}", event, sender, method, e);
                    outcome.failures += 1;
                }
            }
        }

        if method != ProtocolConfig::METHOD_MAP_NOTIFICATION {
            let key = sender.as_str();
            self.deliver(key, self.subscriptions.by_name(key), envelope, &mut outcome);
        }

        let key = naming::name_method_key(&sender, method);
        self.deliver(
            &key,
            self.subscriptions.by_name_method(&sender, method),
            envelope,
            &mut outcome,
        );

        self.deliver(
            method,
            self.subscriptions.by_method(method),
            envelope,
            &mut outcome,
        );

        if outcome.delivered == 0 && outcome.failures == 0 {
            trace!("No subscriber for {}.{}", sender, method);
        }
        outcome
    }

    fn deliver(
        &self,
        key: &str,
        callbacks: Vec<Callback>,
        envelope: &Envelope,
        outcome: &mut DispatchOutcome,
    ) {
        for cb in &callbacks {
            match subscriptions::invoke(key, cb, envelope) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!("{}", e);
                    outcome.failures += 1;
                }
            }
        }
    }

    fn handle_framework(&self, event: FrameworkEvent, envelope: &Envelope) -> Result<Vec<Envelope>> {
        match event {
            FrameworkEvent::Hello => self.on_hello(envelope),
            FrameworkEvent::Registered => self.on_registered(envelope).map(|_| Vec::new()),
            FrameworkEvent::Released => self.on_released(envelope).map(|_| Vec::new()),
        }
    }

    fn on_hello(&self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        // The reply echoes the placeholder first when it carries two arguments
        let index = if envelope.arity() > 1 { 1 } else { 0 };
        let hello: Hello = envelope.arg(index)?;

        let remote_runtime = self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .accept_hello(hello)?;
        info!("Hello from {}", remote_runtime);

        if let Some(remote_id) = naming::id_of(&remote_runtime) {
            let moved = self.subscriptions.qualify(remote_id);
            if moved > 0 {
                debug!("Qualified {} subscriptions made before the hello", moved);
            }
        }

        {
            let mut table = self.framework.write().unwrap_or_else(PoisonError::into_inner);
            table.insert(
                naming::name_method_key(&remote_runtime, ProtocolConfig::REGISTERED_TOPIC),
                FrameworkEvent::Registered,
            );
            table.insert(
                naming::name_method_key(&remote_runtime, ProtocolConfig::RELEASED_TOPIC),
                FrameworkEvent::Released,
            );
        }

        if let Err(e) = self.transition(ConnectionState::Ready) {
            debug!("Hello outside of the handshake: {}", e);
        }

        let subscriber = self.runtime_name();
        [
            ProtocolConfig::REGISTERED_TOPIC,
            ProtocolConfig::RELEASED_TOPIC,
        ]
        .into_iter()
        .map(|topic| {
            self.create_message(
                &remote_runtime,
                ProtocolConfig::ADD_LISTENER,
                Args::new().arg(topic).arg(subscriber.as_str()),
            )
        })
        .collect()
    }

    fn on_registered(&self, envelope: &Envelope) -> Result<()> {
        let registration: Registration = envelope.arg(0)?;
        let service_type = registration.service_type.clone();
        let record = registration.into_record()?;

        if !service_type.is_null() && !record.type_key.is_empty() {
            self.registry
                .set_service_type(record.simple_type_name(), service_type);
        }

        let record = self.registry.register(record);
        info!("Registered {} ({})", record.full_name(), record.type_key);
        self.registered.notify(&record);
        Ok(())
    }

    fn on_released(&self, envelope: &Envelope) -> Result<()> {
        let full_name = match envelope.arg_value(0) {
            Some(Value::String(name)) => self.resolve(&name).into_string(),
            Some(Value::Object(map)) => {
                let name = map.get("name").and_then(Value::as_str).unwrap_or_default();
                match map.get("id").and_then(Value::as_str) {
                    Some(id) => naming::full_name_of(name, id),
                    None => self.resolve(name).into_string(),
                }
            }
            _ => {
                return Err(MrlError::decode(
                    format!("release from {} names no service", envelope.sender),
                    None,
                ))
            }
        };

        if self.registry.remove(&full_name).is_some() {
            info!("Released {}", full_name);
        } else {
            debug!("Release of unknown service {}", full_name);
        }
        self.released.notify(full_name.as_str());
        Ok(())
    }
}
