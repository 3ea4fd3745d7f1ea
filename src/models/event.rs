// src/models/event.rs
//! Signed key events as returned by the agent.
//!
//! The agent owns event construction and signing; this crate only needs the
//! serialized body, a few header fields, and the signature list so it can
//! forward the event to peers.

use crate::models::key_state::parse_hex;
use crate::models::operation::Operation;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A serialized event body together with its parsed field map.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    ked: Value,
    raw: String,
}

impl EventMessage {
    pub fn new(ked: Value) -> Result<Self, serde_json::Error> {
        let raw = serde_json::to_string(&ked)?;
        Ok(Self { ked, raw })
    }

    pub fn ked(&self) -> &Value {
        &self.ked
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    fn field(&self, label: &str) -> &str {
        self.ked.get(label).and_then(Value::as_str).unwrap_or_default()
    }

    /// Self-addressing digest of the event (`d`).
    pub fn said(&self) -> &str {
        self.field("d")
    }

    /// Identifier prefix the event belongs to (`i`).
    pub fn prefix(&self) -> &str {
        self.field("i")
    }

    /// Event type, e.g. `icp`, `rot`, `rpy`, `exn`.
    pub fn ilk(&self) -> &str {
        self.field("t")
    }

    /// Sequence number (`s`); 0 for events that carry none, such as `exn`.
    pub fn sn(&self) -> u64 {
        parse_hex(self.field("s")).unwrap_or_default()
    }
}

impl Serialize for EventMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ked.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ked = Value::deserialize(deserializer)?;
        EventMessage::new(ked).map_err(serde::de::Error::custom)
    }
}

/// Anchor to a specific establishment event of an identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SealEvent {
    pub i: String,
    pub s: String,
    pub d: String,
}

/// Result of a create/rotate/end-role call: the locally signed event plus the
/// operation that tracks its remote acceptance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventResult {
    pub serder: EventMessage,
    pub sigs: Vec<String>,
    pub op: Operation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_header_fields() {
        let evt = EventMessage::new(json!({"v": "KERI10JSON0000fd_", "t": "rot", "d": "ERot", "i": "EGroup", "s": "1f"}))
            .unwrap();
        assert_eq!(evt.ilk(), "rot");
        assert_eq!(evt.said(), "ERot");
        assert_eq!(evt.prefix(), "EGroup");
        assert_eq!(evt.sn(), 31);
        assert_eq!(evt.size(), evt.raw().len());
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let evt = EventMessage::new(json!({"t": "exn"})).unwrap();
        assert_eq!(evt.said(), "");
        assert_eq!(evt.sn(), 0);
    }
}
