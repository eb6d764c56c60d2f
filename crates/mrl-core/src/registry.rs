//! Registry of known remote services.
//!
//! Records are keyed by full name and replaced wholesale on every update.
//! Callers get shared read references; changes to a remote service go back
//! out as messages, never through the record.

use crate::error::{MrlError, Result};
use crate::naming;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Last known snapshot of a remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub type_key: String,
    /// Opaque state as published by the service.
    #[serde(default)]
    pub state: Value,
}

impl ServiceRecord {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        type_key: impl Into<String>,
        state: Value,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            type_key: type_key.into(),
            state,
        }
    }

    /// Build a record from a published state snapshot.
    ///
    /// The snapshot must carry `name` and `id`; the type key is taken from
    /// `typeKey` or, for older runtimes, `serviceClass`.
    pub fn from_state(state: Value) -> Result<Self> {
        let field = |key: &str| state.get(key).and_then(Value::as_str).map(str::to_string);

        let name = field("name")
            .ok_or_else(|| MrlError::decode("service state has no name", None))?;
        let id = field("id").ok_or_else(|| MrlError::decode("service state has no id", None))?;
        let type_key = field("typeKey")
            .or_else(|| field("serviceClass"))
            .unwrap_or_default();

        Ok(Self {
            name: naming::short_name(&name).to_string(),
            id,
            type_key,
            state,
        })
    }

    /// The registry key of this record.
    pub fn full_name(&self) -> String {
        naming::full_name_of(&self.name, &self.id)
    }

    /// `org.myrobotlab.service.Servo` -> `Servo`
    pub fn simple_type_name(&self) -> &str {
        naming::simple_type_name(&self.type_key)
    }

    /// Declared capabilities (the interface set of the service).
    pub fn capabilities(&self) -> Vec<String> {
        match self.state.get("interfaceSet") {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returns true if the service declares `capability`.
    ///
    /// Matches either the fully qualified interface name or its simple name.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities()
            .iter()
            .any(|c| c == capability || naming::simple_type_name(c) == capability)
    }
}

/// Registration broadcast payload of the remote runtime.
///
/// `state` usually arrives as a JSON-encoded string holding the full
/// snapshot; it is re-parsed before the record enters the registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub type_key: String,
    /// Type descriptor, kept as the "possible service" entry for its type.
    #[serde(default, rename = "type")]
    pub service_type: Value,
    #[serde(default)]
    pub state: Value,
}

impl Registration {
    /// Convert into a registry record, parsing an encoded state.
    pub fn into_record(self) -> Result<ServiceRecord> {
        let state = match self.state {
            Value::String(encoded) => serde_json::from_str(&encoded).map_err(|e| {
                MrlError::decode(
                    format!("state of {}@{} is not valid JSON: {}", self.name, self.id, e),
                    Some(e),
                )
            })?,
            other => other,
        };

        Ok(ServiceRecord {
            name: naming::short_name(&self.name).to_string(),
            id: self.id,
            type_key: self.type_key,
            state,
        })
    }
}

/// Mapping from full service name to its last known record.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    records: RwLock<HashMap<String, Arc<ServiceRecord>>>,
    /// Service types the remote runtime can create, by simple type name.
    service_types: RwLock<HashMap<String, Value>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record under its full name.
    pub fn register(&self, record: ServiceRecord) -> Arc<ServiceRecord> {
        let full_name = record.full_name();
        let record = Arc::new(record);
        let replaced = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(full_name.clone(), Arc::clone(&record));
        debug!(
            "{} {}",
            if replaced.is_some() { "Replaced" } else { "Registered" },
            full_name
        );
        record
    }

    pub fn get(&self, full_name: &str) -> Option<Arc<ServiceRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(full_name)
            .cloned()
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(full_name)
    }

    /// Remove a record, returning it if it was present.
    pub fn remove(&self, full_name: &str) -> Option<Arc<ServiceRecord>> {
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(full_name);
        if removed.is_some() {
            debug!("Removed {}", full_name);
        }
        removed
    }

    /// All records declaring `capability`, sorted by full name.
    pub fn by_capability(&self, capability: &str) -> Vec<Arc<ServiceRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<_> = records
            .values()
            .filter(|record| record.has_capability(capability))
            .cloned()
            .collect();
        matches.sort_by_key(|record| record.full_name());
        matches
    }

    /// Sorted full names of all records.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Copy of the whole registry.
    pub fn snapshot(&self) -> HashMap<String, Arc<ServiceRecord>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole registry. Records are keyed by their own full name.
    pub fn replace_all(&self, records: impl IntoIterator<Item = ServiceRecord>) {
        let records: HashMap<_, _> = records
            .into_iter()
            .map(|record| (record.full_name(), Arc::new(record)))
            .collect();
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records;
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_service_type(&self, simple_name: impl Into<String>, service_type: Value) {
        self.service_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(simple_name.into(), service_type);
    }

    pub fn service_types(&self) -> HashMap<String, Value> {
        self.service_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_service_types(&self, service_types: HashMap<String, Value>) {
        *self
            .service_types
            .write()
            .unwrap_or_else(PoisonError::into_inner) = service_types;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, id: &str, state: Value) -> ServiceRecord {
        ServiceRecord::new(name, id, "org.myrobotlab.service.Servo", state)
    }

    #[test]
    fn test_register_then_get() {
        let registry = ServiceRegistry::new();
        registry.register(record("A", "1", json!({"pos": 10})));

        let found = registry.get("A@1").unwrap();
        assert_eq!(found.name, "A");
        assert_eq!(found.state, json!({"pos": 10}));
        assert!(registry.get("A").is_none());
    }

    #[test]
    fn test_register_replaces_without_merging() {
        let registry = ServiceRegistry::new();
        registry.register(record("A", "1", json!({"pos": 10, "speed": 3})));
        registry.register(record("A", "1", json!({"pos": 20})));

        let found = registry.get("A@1").unwrap();
        assert_eq!(found.state, json!({"pos": 20}));
        assert!(found.state.get("speed").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = ServiceRegistry::new();
        registry.register(record("motor", "R9", Value::Null));

        assert!(registry.remove("motor@R9").is_some());
        assert!(registry.get("motor@R9").is_none());
        assert!(registry.remove("motor@R9").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_by_capability_scans_interface_sets() {
        let registry = ServiceRegistry::new();
        registry.register(record(
            "servo1",
            "R9",
            json!({"interfaceSet": {"org.myrobotlab.service.interfaces.ServoControl": {}}}),
        ));
        registry.register(record(
            "servo2",
            "R9",
            json!({"interfaceSet": ["org.myrobotlab.service.interfaces.ServoControl"]}),
        ));
        registry.register(record("python", "R9", json!({})));

        let names: Vec<_> = registry
            .by_capability("ServoControl")
            .iter()
            .map(|r| r.full_name())
            .collect();
        assert_eq!(names, vec!["servo1@R9", "servo2@R9"]);

        let qualified = registry.by_capability("org.myrobotlab.service.interfaces.ServoControl");
        assert_eq!(qualified.len(), 2);
        assert!(registry.by_capability("SpeechSynthesis").is_empty());
    }

    #[test]
    fn test_registration_parses_encoded_state() {
        let registration: Registration = serde_json::from_value(json!({
            "name": "servo1",
            "id": "R9",
            "typeKey": "org.myrobotlab.service.Servo",
            "type": {"name": "org.myrobotlab.service.Servo", "available": true},
            "state": "{\"name\":\"servo1\",\"id\":\"R9\",\"pos\":90}"
        }))
        .unwrap();
        assert_eq!(registration.service_type["available"], true);

        let record = registration.into_record().unwrap();
        assert_eq!(record.full_name(), "servo1@R9");
        assert_eq!(record.simple_type_name(), "Servo");
        assert_eq!(record.state["pos"], 90);
    }

    #[test]
    fn test_registration_rejects_bad_state() {
        let registration: Registration = serde_json::from_value(json!({
            "name": "servo1", "id": "R9", "state": "{broken"
        }))
        .unwrap();
        assert!(matches!(
            registration.into_record(),
            Err(MrlError::Decode { .. })
        ));
    }

    #[test]
    fn test_record_from_state() {
        let record = ServiceRecord::from_state(json!({
            "name": "arduino", "id": "R9", "serviceClass": "org.myrobotlab.service.Arduino"
        }))
        .unwrap();
        assert_eq!(record.full_name(), "arduino@R9");
        assert_eq!(record.type_key, "org.myrobotlab.service.Arduino");

        assert!(ServiceRecord::from_state(json!({"name": "x"})).is_err());
    }

    #[test]
    fn test_replace_all_and_service_types() {
        let registry = ServiceRegistry::new();
        registry.register(record("old", "R1", Value::Null));
        registry.replace_all(vec![
            record("b", "R9", Value::Null),
            record("a", "R9", Value::Null),
        ]);
        assert_eq!(registry.names(), vec!["a@R9", "b@R9"]);

        registry.set_service_type("Servo", json!({"available": true}));
        assert!(registry.service_types().contains_key("Servo"));
        registry.set_service_types(HashMap::new());
        assert!(registry.service_types().is_empty());
    }
}
