//! Tool-initiated initialize handshake.
//!
//! Tools behind the bridge open the protocol themselves: after the bridge
//! sends a priming `ping`, the tool sends an `initialize` request with its
//! own id. The connection answers it in-line with a fixed payload and only
//! then starts forwarding caller requests.
//!
//! ```json
//! { "jsonrpc": "2.0", "id": <tool id>, "result": {
//!     "protocolVersion": "2024-11-05",
//!     "capabilities": { "roots": { "listChanged": false }, "sampling": {} },
//!     "clientInfo": { "name": "stdio-bridge", "version": "<crate version>" } } }
//! ```

use serde_json::{json, Value};
use uuid::Uuid;

/// Method name of the tool's handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Protocol version advertised in the handshake reply.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Prefix of the id carried by the priming ping.
pub const PRIME_ID_PREFIX: &str = "bridge-prime-";

/// Return the id of `value` if it is an `initialize` request.
#[must_use]
pub fn initialize_request_id(value: &Value) -> Option<&Value> {
    let object = value.as_object()?;
    if object.get("method").and_then(Value::as_str) != Some(INITIALIZE_METHOD) {
        return None;
    }
    object.get("id").filter(|id| !id.is_null())
}

/// Build the reply to the tool's `initialize` request.
#[must_use]
pub fn initialize_reply(id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "roots": { "listChanged": false },
                "sampling": {}
            },
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        }
    })
}

/// Build the no-op ping that prompts a tool to start its handshake.
///
/// Its id is never registered, so the tool's reply is dropped as unsolicited.
#[must_use]
pub fn priming_ping() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": format!("{PRIME_ID_PREFIX}{}", Uuid::new_v4()),
        "method": "ping"
    })
}
