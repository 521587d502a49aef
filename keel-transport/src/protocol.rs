//! JSON-RPC 2.0 wire frames as the venue speaks them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request frame.
#[derive(Clone, Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error object attached to a failed reply.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Reply to a request we issued, matched by `id`.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// Server-initiated frame; no `id`.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Payload of a `subscription` notification.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionParams {
    pub channel: String,
    pub data: Value,
}

/// Any frame the server can send. Replies carry an `id`, notifications carry
/// a `method`; the two field sets are disjoint so untagged decoding is safe.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RpcFrame {
    Reply(RpcReply),
    Notification(RpcNotification),
}

impl RpcNotification {
    /// True for the server heartbeat probe that must be answered with an
    /// immediate `public/test` call.
    pub fn is_test_request(&self) -> bool {
        self.method == "heartbeat"
            && self
                .params
                .get("type")
                .and_then(Value::as_str)
                .map_or(false, |kind| kind == "test_request")
    }

    /// Decode a `subscription` push, if this notification is one.
    pub fn subscription(&self) -> Option<SubscriptionParams> {
        if self.method != "subscription" {
            return None;
        }
        serde_json::from_value(self.params.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_and_notification_decode_untagged() {
        let reply: RpcFrame =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(reply, RpcFrame::Reply(RpcReply { id: 7, .. })));

        let frame: RpcFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"user.orders.BTC-PERPETUAL","data":{}}}"#,
        )
        .unwrap();
        let RpcFrame::Notification(notification) = frame else {
            panic!("expected notification");
        };
        let params = notification.subscription().unwrap();
        assert_eq!(params.channel, "user.orders.BTC-PERPETUAL");
    }

    #[test]
    fn error_reply_decodes() {
        let frame: RpcFrame = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":10009,"message":"not_enough_funds"}}"#,
        )
        .unwrap();
        let RpcFrame::Reply(reply) = frame else {
            panic!("expected reply");
        };
        assert_eq!(reply.error.unwrap().code, 10009);
    }

    #[test]
    fn heartbeat_test_request_is_recognized() {
        let frame: RpcFrame = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "heartbeat",
            "params": {"type": "test_request"},
        }))
        .unwrap();
        let RpcFrame::Notification(notification) = frame else {
            panic!("expected notification");
        };
        assert!(notification.is_test_request());
    }
}
