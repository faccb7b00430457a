//! CDP wire framing
//!
//! Only the envelope lives here: outbound commands, and the two inbound
//! shapes (replies carrying an `id`, events carrying a `method`). Payloads
//! stay as raw `Value`s for their consumers to interpret.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request ID - monotonically increasing
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// Session ID for attached targets
pub type SessionId = String;

/// Outbound command, serialized straight from borrowed parts
#[derive(Debug, Serialize)]
pub(crate) struct Command<'a> {
    pub id: RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
}

/// Error object carried in a failed reply
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
}

/// Reply to one command
#[derive(Debug)]
pub(crate) struct Reply {
    pub id: RequestId,
    pub outcome: std::result::Result<Value, ProtocolError>,
}

/// CDP Event from browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl CDPEvent {
    /// Domain part of the method name (`"DOM"` for `"DOM.setChildNodes"`)
    pub fn domain(&self) -> &str {
        self.method
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.method)
    }

    /// Whether a stream scoped to `session` should see this event
    pub fn visible_to(&self, session: Option<&str>) -> bool {
        session.is_none() || session == self.session_id.as_deref()
    }
}

/// Every field either inbound shape may carry
#[derive(Deserialize)]
struct Envelope {
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ProtocolError>,
}

/// One decoded inbound frame
#[derive(Debug)]
pub(crate) enum Inbound {
    Reply(Reply),
    Event(CDPEvent),
}

impl Inbound {
    /// Decode a text frame; `Ok(None)` for frames that are neither shape
    pub fn parse(text: &str) -> serde_json::Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let inbound = match (envelope.id, envelope.method) {
            (Some(id), _) => Inbound::Reply(Reply {
                id,
                outcome: match envelope.error {
                    Some(error) => Err(error),
                    None => Ok(envelope.result.unwrap_or(Value::Null)),
                },
            }),
            (None, Some(method)) => Inbound::Event(CDPEvent {
                method,
                params: envelope.params,
                session_id: envelope.session_id,
            }),
            (None, None) => return Ok(None),
        };
        Ok(Some(inbound))
    }
}
