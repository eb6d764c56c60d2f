//! Addressable proxies of remote services.
//!
//! A [`ServiceProxy`] binds an endpoint to one remote service name. Attaching
//! a proxy subscribes to the framework topics of the service (status, state,
//! method map), keeps the registry record current from `onState`
//! notifications and caches the service's method map.

use crate::config::ProtocolConfig;
use crate::endpoint::Endpoint;
use crate::envelope::{Args, Envelope};
use crate::error::{MrlError, Result};
use crate::naming;
use crate::registry::{ServiceRecord, ServiceRegistry};
use crate::subscriptions::{callback, Callback};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// One invocable method of a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameter_type_names: Vec<String>,
    #[serde(default)]
    pub return_type: Option<String>,
}

/// Method map of a remote service, keyed by method signature.
pub type MethodMap = BTreeMap<String, MethodDescriptor>;

/// State shared by every proxy of the same service.
#[derive(Debug)]
pub(crate) struct ProxyShared {
    name: String,
    method_map: watch::Sender<Option<Arc<MethodMap>>>,
    attached: AtomicBool,
}

impl ProxyShared {
    pub(crate) fn new(name: String) -> Self {
        let (method_map, _) = watch::channel(None);
        Self {
            name,
            method_map,
            attached: AtomicBool::new(false),
        }
    }
}

/// Framework handler of an attached proxy.
fn framework_handler(shared: Arc<ProxyShared>, registry: Arc<ServiceRegistry>) -> Callback {
    callback(move |envelope: &Envelope| {
        match naming::callback_name(&envelope.method).as_str() {
            ProtocolConfig::STATE_NOTIFICATION => {
                let state = envelope.arg_value(0).ok_or_else(|| {
                    MrlError::decode(format!("{} sent onState without data", envelope.sender), None)
                })?;
                registry.register(ServiceRecord::from_state(state)?);
            }
            ProtocolConfig::METHOD_MAP_NOTIFICATION => {
                let map: MethodMap = envelope.arg(0)?;
                debug!("{} has {} methods", shared.name, map.len());
                shared.method_map.send_replace(Some(Arc::new(map)));
            }
            _ => {}
        }
        Ok(())
    })
}

/// Values of an arguments object in positional order.
fn positional_args(object: &Map<String, Value>) -> Vec<Value> {
    let mut entries: Vec<(&String, &Value)> = object.iter().collect();
    entries.sort_by_key(|(key, _)| match key.parse::<u32>() {
        Ok(index) => (0, index),
        Err(_) => (1, 0),
    });
    entries.into_iter().map(|(_, value)| value.clone()).collect()
}

/// Handle to one remote service.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    endpoint: Endpoint,
    shared: Arc<ProxyShared>,
}

impl ServiceProxy {
    pub(crate) fn new(endpoint: Endpoint, shared: Arc<ProxyShared>) -> Self {
        Self { endpoint, shared }
    }

    /// Name this proxy addresses.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current full name, qualified with the remote id once known.
    pub fn full_name(&self) -> String {
        self.endpoint.full_name(&self.shared.name)
    }

    /// Last known registry record of the service.
    pub fn state(&self) -> Option<Arc<ServiceRecord>> {
        self.endpoint.get_service(&self.shared.name)
    }

    /// Returns true if both proxies address the same service state.
    pub fn shares_state_with(&self, other: &ServiceProxy) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Fire-and-forget call of `method` on this service.
    pub fn send(&self, method: &str, args: impl Into<Args>) -> Result<()> {
        self.endpoint.send_to(&self.shared.name, method, args)
    }

    /// Call `method` with the values of `object` as positional arguments.
    ///
    /// Integer keys come first in numeric order, then the remaining keys in
    /// map order.
    pub fn send_args(&self, method: &str, object: &Map<String, Value>) -> Result<()> {
        self.send(method, positional_args(object))
    }

    /// Blocking call of `method` on this service.
    pub async fn send_blocking(&self, method: &str, args: impl Into<Args>) -> Result<Envelope> {
        self.endpoint
            .send_to_blocking(&self.shared.name, method, args)
            .await
    }

    /// Fire-and-forget call of `method` on another service.
    pub fn send_to(&self, name: &str, method: &str, args: impl Into<Args>) -> Result<()> {
        self.endpoint.send_to(name, method, args)
    }

    /// Ask the service to publish `topic` to this endpoint.
    pub fn subscribe_topic(&self, topic: &str) -> Result<()> {
        self.endpoint.subscribe(&self.shared.name, topic)
    }

    pub fn unsubscribe_topic(&self, topic: &str) -> Result<()> {
        self.endpoint.unsubscribe(&self.shared.name, topic)
    }

    /// Attach `cb` to everything the service sends.
    ///
    /// Subscribes to the status, state and method map topics, asks for a state
    /// broadcast and the method map. The framework handler is installed once
    /// per service; every call adds `cb`.
    pub fn attach(&self, cb: Callback) -> Result<()> {
        let full_name = self.full_name();
        self.endpoint.subscribe_by_name(&full_name, cb);

        if !self.shared.attached.swap(true, Ordering::SeqCst) {
            let handler = framework_handler(
                Arc::clone(&self.shared),
                Arc::clone(self.endpoint.router().registry()),
            );
            for topic in [
                ProtocolConfig::PUBLISH_STATE,
                ProtocolConfig::METHOD_MAP_TOPIC,
            ] {
                self.endpoint
                    .subscribe_by_name_method(&full_name, topic, Arc::clone(&handler));
            }
        }

        for topic in [
            ProtocolConfig::PUBLISH_STATUS,
            ProtocolConfig::PUBLISH_STATE,
            ProtocolConfig::METHOD_MAP_TOPIC,
        ] {
            self.subscribe_topic(topic)?;
        }
        self.send(ProtocolConfig::BROADCAST_STATE, ())?;
        self.request_method_map()
    }

    /// Ask the service for its method map.
    pub fn request_method_map(&self) -> Result<()> {
        self.send(ProtocolConfig::METHOD_MAP_TOPIC, ())
    }

    /// Method map received so far.
    pub fn method_map(&self) -> Option<Arc<MethodMap>> {
        self.shared.method_map.borrow().clone()
    }

    /// Wait for the method map to arrive.
    pub async fn wait_method_map(&self, timeout: Duration) -> Result<Arc<MethodMap>> {
        let mut rx = self.shared.method_map.subscribe();
        let received = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| MrlError::Timeout {
                what: format!("method map of {}", self.shared.name),
                after: timeout,
            })?
            .map(|map| map.clone());

        match received {
            Ok(Some(map)) => Ok(map),
            _ => {
                warn!("Method map channel of {} closed", self.shared.name);
                Err(MrlError::NotConnected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_map_parsing() {
        let map: MethodMap = serde_json::from_value(json!({
            "moveTo(java.lang.Double)": {
                "name": "moveTo",
                "parameterTypeNames": ["java.lang.Double"],
                "returnType": "java.lang.Boolean"
            },
            "enable()": {"name": "enable", "parameterTypeNames": []}
        }))
        .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map["moveTo(java.lang.Double)"].parameter_type_names.len(), 1);
        assert_eq!(map["enable()"].return_type, None);
    }

    #[test]
    fn test_positional_args_numeric_key_order() {
        let mut object = Map::new();
        for index in 0..12 {
            object.insert(index.to_string(), json!(index));
        }
        object.insert("extra".to_string(), json!("x"));

        let args = positional_args(&object);
        let expected: Vec<Value> = (0..12)
            .map(|index| json!(index))
            .chain([json!("x")])
            .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_framework_handler_updates_state_and_method_map() {
        let shared = Arc::new(ProxyShared::new("servo1@R9".to_string()));
        let registry = Arc::new(ServiceRegistry::new());
        let handler = framework_handler(Arc::clone(&shared), Arc::clone(&registry));

        let state = Envelope::new(1, "runtime@E1", "servo1@R9", "onState").with_data(vec![
            json!("{\"name\":\"servo1\",\"id\":\"R9\",\"typeKey\":\"org.myrobotlab.service.Servo\",\"pos\":45}"),
        ]);
        handler(&state).unwrap();
        assert_eq!(registry.get("servo1@R9").unwrap().state["pos"], 45);

        let methods = Envelope::new(2, "runtime@E1", "servo1@R9", "onMethodMap")
            .with_data(vec![json!({"enable()": {"name": "enable"}})]);
        handler(&methods).unwrap();
        let map = shared.method_map.borrow().clone().unwrap();
        assert!(map.contains_key("enable()"));

        let broken = Envelope::new(3, "runtime@E1", "servo1@R9", "onState");
        assert!(handler(&broken).is_err());
    }
}
