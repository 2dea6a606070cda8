//! Frames exchanged over a crossover connection, as JSON text.

use serde::{Deserialize, Serialize};

use pipelet_core::id::RequestId;
use pipelet_core::operation::Operation;
use pipelet_core::value::Value;
use pipelet_query::{Query, Term};

use crate::error::Result;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client: the session id it had (if any). Server: the session id it
    /// assigns.
    Handshake {
        #[serde(default)]
        id: Option<String>,
        protocol_version: u32,
    },
    Operation {
        operation: Operation,
    },
    QueryUpdate {
        #[serde(default)]
        removes: Vec<Term>,
        #[serde(default)]
        adds: Vec<Term>,
    },
    Fetch {
        request: RequestId,
        query: Query,
    },
    FetchChunk {
        request: RequestId,
        values: Vec<Value>,
        no_more: bool,
    },
}

impl Message {
    pub fn handshake(id: Option<String>) -> Self {
        Message::Handshake {
            id,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Buffered while disconnected and replayed on reconnect.
    pub fn is_replayable(&self) -> bool {
        matches!(self, Message::Operation { .. } | Message::QueryUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_tagged_json() {
        let msg = Message::Operation {
            operation: Operation::clear(),
        };
        let frame = msg.encode().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&frame).unwrap(),
            json!({"type": "operation", "operation": {"operation": "clear"}})
        );

        let hs = Message::decode(r#"{"type":"handshake","protocol_version":1}"#).unwrap();
        assert_eq!(hs, Message::handshake(None));
        assert!(Message::decode(r#"{"type":"nope"}"#).is_err());
    }
}
