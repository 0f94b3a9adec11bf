//! JSON-RPC 2.0 envelope types and the wire codec.

use crate::capability::Capabilities;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSON-RPC version literal required on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Latest protocol revision this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Every protocol revision this implementation accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-06-18", "2025-03-26", "2024-11-05", "2024-10-07"];

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";

/// Pick the protocol version to use given the one the peer proposed.
///
/// Unrecognized versions fall back to [`LATEST_PROTOCOL_VERSION`].
pub fn negotiate_version(proposed: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == proposed)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

/// JSON-RPC request identifier: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    /// An explicit `"data": null` decodes as `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<Value>,
}

/// Keeps a present-but-null field distinct from an absent one.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Known error code, if the numeric value is one of ours.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("code".to_string(), Value::from(self.code));
        obj.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(data) = &self.data {
            obj.insert("data".to_string(), data.clone());
        }
        Value::Object(obj)
    }
}

/// One JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    /// `id` is `None` only when the failing request's id could not be read.
    ErrorResponse {
        id: Option<RequestId>,
        error: RpcError,
    },
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Envelope::Response { id, result }
    }

    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Envelope::ErrorResponse { id, error }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request { method, .. } | Envelope::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    /// Id for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } => Some(id),
            Envelope::ErrorResponse { id, .. } => id.as_ref(),
            Envelope::Notification { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Envelope::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Envelope::Response { .. } | Envelope::ErrorResponse { .. }
        )
    }

    /// Wire form as a JSON value.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Envelope::Request { id, method, params } => {
                obj.insert("id".to_string(), id.to_value());
                obj.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Envelope::Notification { method, params } => {
                obj.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Envelope::Response { id, result } => {
                obj.insert("id".to_string(), id.to_value());
                obj.insert("result".to_string(), result.clone());
            }
            Envelope::ErrorResponse { id, error } => {
                obj.insert(
                    "id".to_string(),
                    id.as_ref().map_or(Value::Null, RequestId::to_value),
                );
                obj.insert("error".to_string(), error.to_value());
            }
        }
        Value::Object(obj)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(Envelope),
    Batch(Vec<Envelope>),
}

impl Frame {
    pub fn into_envelopes(self) -> Vec<Envelope> {
        match self {
            Frame::Single(envelope) => vec![envelope],
            Frame::Batch(envelopes) => envelopes,
        }
    }

    pub fn envelopes(&self) -> &[Envelope] {
        match self {
            Frame::Single(envelope) => std::slice::from_ref(envelope),
            Frame::Batch(envelopes) => envelopes,
        }
    }
}

/// A frame that could not be decoded into envelopes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    /// `ParseError` for malformed JSON, `InvalidRequest` for well-formed JSON
    /// that is not a valid envelope.
    pub code: ErrorCode,
    pub message: String,
    /// Id of the offending request, when one could be read.
    pub id: Option<RequestId>,
}

impl ParseError {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ParseError,
            message: message.into(),
            id: None,
        }
    }

    fn invalid(message: impl Into<String>, id: Option<RequestId>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
            id,
        }
    }

    /// Error response to send back to the peer.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error_response(self.id.clone(), RpcError::new(self.code, &self.message))
    }
}

/// Decode one inbound frame (a single envelope or a batch).
pub fn decode(bytes: &[u8]) -> Result<Frame, ParseError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ParseError::malformed(format!("Invalid JSON: {}", e)))?;
    decode_value(value)
}

/// Decode an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Frame, ParseError> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ParseError::invalid("Empty batch", None));
            }
            let envelopes = items
                .into_iter()
                .map(|item| {
                    if item.is_array() {
                        Err(ParseError::invalid("Nested batch", None))
                    } else {
                        classify(item)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Frame::Batch(envelopes))
        }
        other => classify(other).map(Frame::Single),
    }
}

/// Decode a frame that must hold exactly one envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ParseError> {
    match decode(bytes)? {
        Frame::Single(envelope) => Ok(envelope),
        Frame::Batch(_) => Err(ParseError::invalid("Expected a single message", None)),
    }
}

/// Encode one envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.to_value().to_string().into_bytes()
}

/// Encode a batch of envelopes as a JSON array.
pub fn encode_batch(envelopes: &[Envelope]) -> Vec<u8> {
    Value::Array(envelopes.iter().map(Envelope::to_value).collect())
        .to_string()
        .into_bytes()
}

fn classify(value: Value) -> Result<Envelope, ParseError> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(ParseError::malformed("Message is not a JSON object")),
    };

    let raw_id = obj.remove("id");
    let id = match &raw_id {
        None | Some(Value::Null) => None,
        Some(v) => match RequestId::from_value(v) {
            Some(id) => Some(id),
            None => return Err(ParseError::invalid("Invalid id", None)),
        },
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        _ => return Err(ParseError::invalid("jsonrpc must be \"2.0\"", id)),
    }

    if let Some(method) = obj.remove("method") {
        let method = match method {
            Value::String(m) => m,
            _ => return Err(ParseError::invalid("method must be a string", id)),
        };
        let params = obj.remove("params");
        return match (raw_id, id) {
            (None, _) => Ok(Envelope::Notification { method, params }),
            (Some(_), Some(id)) => Ok(Envelope::Request { id, method, params }),
            (Some(_), None) => Err(ParseError::invalid("Request id must not be null", None)),
        };
    }

    let result = obj.remove("result");
    let error = obj.remove("error");
    match (result, error) {
        (Some(_), Some(_)) => Err(ParseError::invalid(
            "Response carries both result and error",
            id,
        )),
        (Some(result), None) => match id {
            Some(id) => Ok(Envelope::Response { id, result }),
            None => Err(ParseError::invalid("Response without id", None)),
        },
        (None, Some(error)) => {
            if raw_id.is_none() {
                return Err(ParseError::invalid("Error response without id", None));
            }
            let error: RpcError = serde_json::from_value(error)
                .map_err(|e| ParseError::invalid(format!("Invalid error object: {}", e), id.clone()))?;
            Ok(Envelope::ErrorResponse { id, error })
        }
        (None, None) => Err(ParseError::malformed(
            "Message is neither a request, notification nor response",
        )),
    }
}

/// Name and version of a peer implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Initialize request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub client_info: Implementation,
}

/// Initialize response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// `notifications/cancelled` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `notifications/progress` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: RequestId,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(envelope: Envelope) {
        let bytes = encode(&envelope);
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_round_trip_variants() {
        round_trip(Envelope::request(
            RequestId::Number(1),
            "tools/list",
            Some(json!({"cursor": "abc"})),
        ));
        round_trip(Envelope::request(RequestId::from("req-1"), "ping", None));
        round_trip(Envelope::notification("notifications/initialized", None));
        round_trip(Envelope::response(RequestId::Number(9), json!({})));
        round_trip(Envelope::error_response(
            Some(RequestId::Number(3)),
            RpcError::method_not_found("nope").with_data(json!({"hint": 1})),
        ));
        round_trip(Envelope::error_response(None, RpcError::parse_error("bad")));
    }

    #[test]
    fn test_null_error_data_is_kept() {
        let envelope = decode_envelope(
            br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"x","data":null}}"#,
        )
        .unwrap();
        let Envelope::ErrorResponse { error, .. } = &envelope else {
            panic!("expected an error response");
        };
        assert_eq!(error.data, Some(Value::Null));

        let value: Value = serde_json::from_slice(&encode(&envelope)).unwrap();
        assert!(value["error"].get("data").is_some_and(Value::is_null));

        let absent = decode_envelope(br#"{"jsonrpc":"2.0","id":4,"error":{"code":1,"message":""}}"#)
            .unwrap();
        assert!(matches!(absent, Envelope::ErrorResponse { error, .. } if error.data.is_none()));
    }

    #[test]
    fn test_absent_fields_omitted() {
        let bytes = encode(&Envelope::notification("notifications/initialized", None));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );

        let bytes = encode(&Envelope::error_response(
            Some(RequestId::Number(1)),
            RpcError::internal_error("boom"),
        ));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["error"].get("data").is_none());
    }

    #[test]
    fn test_null_id_error_response() {
        let bytes = encode(&Envelope::error_response(None, RpcError::parse_error("x")));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("id").unwrap().is_null());
    }

    #[test]
    fn test_classification() {
        let req = decode_envelope(br#"{"jsonrpc":"2.0","id":"a","method":"m"}"#).unwrap();
        assert!(matches!(req, Envelope::Request { .. }));

        let note = decode_envelope(br#"{"jsonrpc":"2.0","method":"m","params":{}}"#).unwrap();
        assert!(matches!(note, Envelope::Notification { .. }));

        let resp = decode_envelope(br#"{"jsonrpc":"2.0","id":2,"result":null}"#).unwrap();
        assert_eq!(resp, Envelope::response(RequestId::Number(2), Value::Null));

        let err = decode_envelope(
            br#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(err, Envelope::ErrorResponse { id: Some(_), .. }));
    }

    #[test]
    fn test_decode_failures() {
        let err = decode(b"{not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);

        let err = decode(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);

        let err = decode(br#"{"jsonrpc":"1.0","id":4,"method":"m"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.id, Some(RequestId::Number(4)));

        let err = decode(br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":""}}"#)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = decode(br#"{"jsonrpc":"2.0","id":1.5,"method":"m"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_batch_decoding() {
        let frame = decode(
            br#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","method":"b"}]"#,
        )
        .unwrap();
        let envelopes = frame.into_envelopes();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].method(), Some("a"));
        assert_eq!(envelopes[1].method(), Some("b"));

        assert_eq!(decode(b"[]").unwrap_err().code, ErrorCode::InvalidRequest);
        assert_eq!(
            decode(br#"[[{"jsonrpc":"2.0","method":"a"}]]"#)
                .unwrap_err()
                .code,
            ErrorCode::InvalidRequest
        );
    }

    #[test]
    fn test_encode_batch() {
        let bytes = encode_batch(&[
            Envelope::response(RequestId::Number(1), json!(1)),
            Envelope::response(RequestId::Number(2), json!(2)),
        ]);
        let frame = decode(&bytes).unwrap();
        assert!(matches!(frame, Frame::Batch(ref items) if items.len() == 2));
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn test_initialize_payload_shape() {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::new(),
            client_info: Implementation::new("tether", "0.1.0"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(value["clientInfo"]["name"], "tether");
        assert_eq!(value["capabilities"], json!({}));

        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "srv", "version": "1"}
        }))
        .unwrap();
        assert!(result.instructions.is_none());
        assert_eq!(result.server_info.name, "srv");
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::from("x-1").to_string(), "x-1");
        let id: RequestId = serde_json::from_value(json!("s")).unwrap();
        assert_eq!(id, RequestId::String("s".to_string()));
        let id: RequestId = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(id, RequestId::Number(5));
    }
}
