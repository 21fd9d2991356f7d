//! Message types relayed between the child process and transport clients.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// One decoded unit of the child's line protocol.
///
/// Opaque to the bridge: any JSON value is accepted and forwarded untouched.
/// Object key order survives a decode/encode cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolMessage(serde_json::Value);

impl ProtocolMessage {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Correlation id of a JSON-RPC style message, if the top level carries one.
    ///
    /// Only used for logging. Delivery is always a broadcast.
    pub fn id(&self) -> Option<&serde_json::Value> {
        self.0.as_object().and_then(|obj| obj.get("id"))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for ProtocolMessage {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bytes of a single line with its terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord(Bytes);

impl RawRecord {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy text view for diagnostics.
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for RawRecord {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_read_from_object() {
        let msg = ProtocolMessage::new(json!({"jsonrpc": "2.0", "id": 7, "method": "x"}));
        assert_eq!(msg.id(), Some(&json!(7)));
    }

    #[test]
    fn id_absent_for_notifications_and_scalars() {
        let notification = ProtocolMessage::new(json!({"method": "notify"}));
        assert!(notification.id().is_none());

        let scalar = ProtocolMessage::new(json!(42));
        assert!(scalar.id().is_none());
    }

    #[test]
    fn serializes_transparently() {
        let msg = ProtocolMessage::new(json!({"id": "abc"}));
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"id":"abc"}"#);
    }

    #[test]
    fn raw_record_lossy_text() {
        let record = RawRecord::new(Bytes::from_static(b"ok \xff"));
        assert_eq!(record.to_text_lossy(), "ok \u{fffd}");
        assert_eq!(record.len(), 4);
    }
}
