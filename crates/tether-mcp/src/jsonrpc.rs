//! JSON-RPC 2.0 envelopes and incoming-message classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response, as written by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {method}"))
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// What an incoming message turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Carries an id and a result or error. `id` is `None` when the id is not
    /// one this client could have issued.
    Response {
        id: Option<u64>,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Carries a method and no id.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Anything else, including provider-to-client requests.
    Ignored,
}

/// Classify a parsed message by its envelope fields.
///
/// Field presence is what matters: `"result": null` is still a response.
pub fn classify(message: &Value) -> Incoming {
    let Some(obj) = message.as_object() else {
        return Incoming::Ignored;
    };

    let id = obj.get("id").filter(|id| !id.is_null());
    let has_result = obj.contains_key("result");
    let error = obj.get("error");

    if let Some(id) = id {
        if let Some(error) = error.filter(|e| !e.is_null()) {
            let error = serde_json::from_value::<JsonRpcError>(error.clone()).unwrap_or_else(|e| {
                JsonRpcError::new(-32603, format!("Malformed error object: {e}"))
            });
            return Incoming::Response {
                id: request_id(id),
                outcome: Err(error),
            };
        }
        if has_result {
            let result = obj.get("result").cloned().unwrap_or(Value::Null);
            return Incoming::Response {
                id: request_id(id),
                outcome: Ok(result),
            };
        }
        return Incoming::Ignored;
    }

    match obj.get("method").and_then(Value::as_str) {
        Some(method) => Incoming::Notification {
            method: method.to_string(),
            params: obj.get("params").cloned(),
        },
        None => Incoming::Ignored,
    }
}

/// Ids are issued as integers; tolerate providers that echo them as strings.
fn request_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_with_params() {
        let req = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "read", "arguments": {}})));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/call");
        assert!(json["params"].is_object());
    }

    #[test]
    fn serialize_request_without_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 2);
        assert!(json.get("params").is_none());
    }

    #[test]
    fn serialize_notification() {
        let notif = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["method"], "notifications/initialized");
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn classify_result_response() {
        let msg = json!({"jsonrpc":"2.0","id":7,"result":{"tools":[]}});
        assert_eq!(
            classify(&msg),
            Incoming::Response {
                id: Some(7),
                outcome: Ok(json!({"tools": []}))
            }
        );
    }

    #[test]
    fn classify_null_result_is_still_a_response() {
        let msg = json!({"jsonrpc":"2.0","id":3,"result":null});
        assert_eq!(
            classify(&msg),
            Incoming::Response {
                id: Some(3),
                outcome: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn classify_error_response() {
        let msg = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}});
        match classify(&msg) {
            Incoming::Response { id, outcome } => {
                assert_eq!(id, Some(1));
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "Method not found");
                assert!(err.data.is_none());
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_string_id() {
        let msg = json!({"jsonrpc":"2.0","id":"12","result":{}});
        assert!(matches!(classify(&msg), Incoming::Response { id: Some(12), .. }));
    }

    #[test]
    fn classify_foreign_id_is_unmatched() {
        let msg = json!({"jsonrpc":"2.0","id":"abc","result":{}});
        assert!(matches!(classify(&msg), Incoming::Response { id: None, .. }));
    }

    #[test]
    fn classify_notification() {
        let msg = json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"});
        assert_eq!(
            classify(&msg),
            Incoming::Notification {
                method: "notifications/tools/list_changed".into(),
                params: None
            }
        );
    }

    #[test]
    fn classify_provider_request_is_ignored() {
        let msg = json!({"jsonrpc":"2.0","id":5,"method":"sampling/createMessage"});
        assert_eq!(classify(&msg), Incoming::Ignored);
    }

    #[test]
    fn classify_non_object_is_ignored() {
        assert_eq!(classify(&json!([1, 2, 3])), Incoming::Ignored);
        assert_eq!(classify(&json!({"jsonrpc":"2.0"})), Incoming::Ignored);
    }
}
