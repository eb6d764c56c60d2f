//! Wire envelope and codec.
//!
//! One JSON envelope travels per transport message:
//!
//! ```text
//! {"msgId":1718000000000,"name":"servo1@R9","sender":"runtime@E1",
//!  "method":"moveTo","data":["90"],"msgType":"B","sendingMethod":"sendTo"}
//! ```
//!
//! Outbound `data` elements are JSON-encoded strings. Inbound elements may be
//! encoded strings or plain JSON values; [`Envelope::arg`] accepts both.

use crate::config::ProtocolConfig;
use crate::error::{MrlError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation marker of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// The sender expects a correlated reply.
    #[serde(rename = "B")]
    Blocking,
    /// This envelope is such a reply.
    #[serde(rename = "R")]
    Return,
}

/// The structured message unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub msg_id: u64,
    /// Target full service name.
    #[serde(default)]
    pub name: String,
    /// Originating full service name.
    #[serde(default)]
    pub sender: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<MsgType>,
    /// Provenance tag, diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sending_method: Option<String>,
}

impl Envelope {
    pub fn new(
        msg_id: u64,
        name: impl Into<String>,
        sender: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            msg_id,
            name: name.into(),
            sender: sender.into(),
            method: method.into(),
            data: None,
            msg_type: None,
            sending_method: None,
        }
    }

    /// Attach already-encoded data.
    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns true if this envelope answers a blocking call.
    pub fn is_reply(&self) -> bool {
        self.msg_type == Some(MsgType::Return)
    }

    /// Returns true if the sender waits for a correlated reply.
    pub fn is_blocking(&self) -> bool {
        self.msg_type == Some(MsgType::Blocking)
    }

    /// Number of data elements.
    pub fn arity(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Raw data element at `index`.
    pub fn raw_arg(&self, index: usize) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(index))
    }

    /// Decoded data element at `index`.
    ///
    /// A string element is first parsed as JSON; if it is not valid JSON it
    /// is used as a plain string value.
    pub fn arg_value(&self, index: usize) -> Option<Value> {
        self.raw_arg(index).map(|raw| match raw {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| raw.clone()),
            other => other.clone(),
        })
    }

    /// Decode the data element at `index` into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.arg_value(index).ok_or_else(|| {
            MrlError::decode(
                format!(
                    "{}.{} has no argument at index {} (arity {})",
                    self.sender,
                    self.method,
                    index,
                    self.arity()
                ),
                None,
            )
        })?;
        serde_json::from_value(value).map_err(|e| {
            MrlError::decode(
                format!("argument {} of {}.{}: {}", index, self.sender, self.method, e),
                Some(e),
            )
        })
    }

    /// Build the reply a remote peer sends for this blocking envelope.
    pub fn reply(&self, data: Vec<Value>) -> Envelope {
        Envelope {
            msg_id: self.msg_id,
            name: self.sender.clone(),
            sender: self.name.clone(),
            method: self.method.clone(),
            data: Some(data),
            msg_type: Some(MsgType::Return),
            sending_method: None,
        }
    }
}

/// Outbound positional arguments.
///
/// `None` marks an argument the caller left undefined. Trailing undefined
/// arguments are dropped on encoding rather than sent as `null`, which
/// changes the arity the remote side uses for overload resolution:
/// `getResponse(null, undefined)` arrives as a one-argument call. Interior
/// undefined arguments are encoded as `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Option<Value>>);

impl Args {
    /// An empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a defined argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.0.push(Some(value.into()));
        self
    }

    /// Append an undefined argument.
    pub fn undefined(mut self) -> Self {
        self.0.push(None);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode into envelope `data`.
    ///
    /// Returns `None` when the envelope should carry no data at all: an empty
    /// list, a list of only undefined arguments, or the single-`null` list a
    /// no-argument call is often expressed as.
    pub fn encode(&self) -> Result<Option<Vec<Value>>> {
        let defined = self
            .0
            .iter()
            .rposition(Option::is_some)
            .map(|last| last + 1)
            .unwrap_or(0);
        if defined == 0 || (defined == 1 && self.0[0] == Some(Value::Null)) {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(defined);
        for arg in &self.0[..defined] {
            let encoded = match arg {
                Some(value) => serde_json::to_string(value)?,
                None => "null".to_string(),
            };
            data.push(Value::String(encoded));
        }
        Ok(Some(data))
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<Value>>> for Args {
    fn from(values: Vec<Option<Value>>) -> Self {
        Self(values)
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// A decoded transport payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    Message(Envelope),
}

/// Encode an envelope for the transport.
pub fn encode(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one transport payload.
///
/// The heartbeat payload is recognized before any JSON parsing is attempted.
pub fn decode(raw: &str) -> Result<Inbound> {
    if raw == ProtocolConfig::HEARTBEAT {
        return Ok(Inbound::Heartbeat);
    }

    let envelope: Option<Envelope> = serde_json::from_str(raw)
        .map_err(|e| MrlError::decode(format!("malformed envelope: {}", e), Some(e)))?;

    envelope
        .map(Inbound::Message)
        .ok_or_else(|| MrlError::decode("null envelope", None))
}

/// Time-based message id source.
///
/// Ids are milliseconds since the UNIX epoch, bumped past the previous id
/// when the clock has not advanced, so they strictly increase per generator.
#[derive(Debug, Default)]
pub struct MsgIdGenerator {
    last: AtomicU64,
}

impl MsgIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_omits_absent_fields() {
        let envelope = Envelope::new(7, "servo1@R9", "runtime@E1", "moveTo");
        let json = encode(&envelope).unwrap();

        assert!(json.contains("\"msgId\":7"));
        assert!(!json.contains("data"));
        assert!(!json.contains("msgType"));
        assert!(!json.contains("sendingMethod"));
    }

    #[test]
    fn test_msg_type_wire_names() {
        let mut envelope = Envelope::new(1, "a@R", "b@E", "m");
        envelope.msg_type = Some(MsgType::Blocking);
        assert!(encode(&envelope).unwrap().contains("\"msgType\":\"B\""));

        let reply = envelope.reply(vec![]);
        assert!(reply.is_reply());
        assert_eq!(reply.name, "b@E");
        assert_eq!(reply.sender, "a@R");
        assert!(encode(&reply).unwrap().contains("\"msgType\":\"R\""));
    }

    #[test]
    fn test_args_trailing_undefined_are_dropped() {
        let args = Args::new().arg(Value::Null).arg("hello").undefined().undefined();
        assert_eq!(
            args.encode().unwrap(),
            Some(vec![json!("null"), json!("\"hello\"")])
        );

        let args = Args::new().arg(Value::Null).undefined();
        assert_eq!(args.encode().unwrap(), None);
    }

    #[test]
    fn test_args_interior_undefined_become_null() {
        let args = Args::new().arg(1).undefined().arg(true);
        assert_eq!(
            args.encode().unwrap(),
            Some(vec![json!("1"), json!("null"), json!("true")])
        );
    }

    #[test]
    fn test_args_without_data() {
        assert_eq!(Args::new().encode().unwrap(), None);
        assert_eq!(Args::from(vec![Value::Null]).encode().unwrap(), None);
        assert_eq!(Args::from(()).encode().unwrap(), None);
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(decode("X").unwrap(), Inbound::Heartbeat);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(decode("{not json"), Err(MrlError::Decode { .. })));
        assert!(matches!(decode("null"), Err(MrlError::Decode { .. })));
        assert!(matches!(
            decode(r#"{"msgId":1,"name":"a"}"#),
            Err(MrlError::Decode { .. })
        ));
    }

    #[test]
    fn test_decode_message() {
        let raw = r#"{"msgId":42,"name":"runtime@E1","sender":"servo1@R9",
            "method":"publishServoEvent","data":["{\"pos\":90}"],"msgType":"R"}"#;
        match decode(raw).unwrap() {
            Inbound::Message(envelope) => {
                assert_eq!(envelope.msg_id, 42);
                assert!(envelope.is_reply());
                assert_eq!(envelope.arg_value(0), Some(json!({"pos": 90})));
            }
            other => panic!("Expected message, got: {:?}", other),
        }
    }

    #[test]
    fn test_arg_accepts_encoded_and_raw_values() {
        let envelope = Envelope::new(1, "a", "b", "m").with_data(vec![
            json!("{\"pos\":90}"),
            json!({"pos": 45}),
            json!("fill-uuid"),
        ]);

        let first: Value = envelope.arg(0).unwrap();
        let second: Value = envelope.arg(1).unwrap();
        let third: String = envelope.arg(2).unwrap();

        assert_eq!(first["pos"], 90);
        assert_eq!(second["pos"], 45);
        assert_eq!(third, "fill-uuid");
        assert!(envelope.arg::<Value>(3).is_err());
    }

    #[test]
    fn test_msg_ids_strictly_increase() {
        let ids = MsgIdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
        assert!(last > 1_600_000_000_000);
    }
}
