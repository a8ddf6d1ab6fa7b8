//! Envelope exchanged over a node's command stream.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Nudge: a node task is waiting, pull sooner.
pub const CODE_NEW_NODE_TASK: &str = "newNodeTask";
/// Generic request/response exchange.
pub const CODE_COMMAND: &str = "command";
/// Liveness round trip.
pub const CODE_PING: &str = "ping";

/// A single message in either direction.
///
/// Requests carry a control-plane generated `request_id`; the node echoes it
/// in the response so the waiting caller can be found.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    #[serde(default)]
    pub request_id: i64,
    pub code: String,
    #[serde(
        default,
        rename = "dataJSON",
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub data_json: Vec<u8>,
    #[serde(default)]
    pub is_ok: bool,
    #[serde(default)]
    pub message: String,
}

impl CommandMessage {
    pub fn request(request_id: i64, code: impl Into<String>, data_json: Vec<u8>) -> Self {
        Self {
            request_id,
            code: code.into(),
            data_json,
            is_ok: false,
            message: String::new(),
        }
    }

    pub fn new_node_task() -> Self {
        Self::request(0, CODE_NEW_NODE_TASK, Vec::new())
    }

    /// Build the reply to `request`.
    pub fn reply(request: &CommandMessage, is_ok: bool, message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id,
            code: request.code.clone(),
            data_json: Vec::new(),
            is_ok,
            message: message.into(),
        }
    }

    /// Decode the payload as JSON; an empty payload decodes as `null`.
    pub fn data(&self) -> crate::Result<serde_json::Value> {
        if self.data_json.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.data_json)
            .map_err(|e| crate::Error::InvalidCommand(format!("invalid data JSON: {e}")))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    pub fn from_json(s: &str) -> crate::Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| crate::Error::InvalidCommand(format!("malformed envelope: {e}")))
    }
}

fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let msg = CommandMessage::request(7, CODE_COMMAND, br#"{"op":"reload"}"#.to_vec());
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["requestId"], 7);
        assert_eq!(json["code"], "command");
        assert_eq!(json["dataJSON"], STANDARD.encode(br#"{"op":"reload"}"#));
        assert_eq!(json["isOk"], false);
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let request = CommandMessage::request(42, CODE_PING, Vec::new());
        let reply = CommandMessage::reply(&request, true, "pong");
        let decoded = CommandMessage::from_json(&reply.to_json().unwrap()).unwrap();

        assert_eq!(decoded.request_id, 42);
        assert!(decoded.is_ok);
        assert_eq!(decoded.message, "pong");
        assert_eq!(decoded.data().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_malformed_envelope_is_rejected() {
        assert!(CommandMessage::from_json(r#"{"requestId": 1}"#).is_err());
        assert!(CommandMessage::from_json(r#"{"code":"ping","dataJSON":"%%%"}"#).is_err());
    }
}
