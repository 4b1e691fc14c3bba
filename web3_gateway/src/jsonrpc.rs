//! JSON-RPC 2.0 types shared by the frontend, the dispatcher, and the backends.
//!
//! Ids are kept as raw bytes so that whatever a client sends (number, string,
//! null) round-trips unmodified.

use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::value::RawValue;
use std::borrow::Cow;
use std::fmt;

pub fn default_jsonrpc() -> String {
    "2.0".to_string()
}

pub fn null_id() -> Box<RawValue> {
    RawValue::from_string("null".to_string()).expect("null is valid json")
}

#[derive(Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// id could be a stricter type, but many rpcs are non-conformant with the spec.
    /// so we just pass the bytes through
    #[serde(default = "null_id")]
    pub id: Box<RawValue>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Box<RawValue>, method: String, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            method,
            params,
        }
    }

    /// a request the proxy makes for itself (pollers, probes)
    pub fn internal(id: u64, method: &str, params: serde_json::Value) -> Self {
        let id = RawValue::from_string(id.to_string()).expect("numbers are valid json");

        Self::new(id, method.to_string(), Some(params))
    }

    /// ids must be scalars. objects and arrays break response matching
    pub fn id_is_scalar(&self) -> bool {
        !matches!(
            self.id.get().trim_start().as_bytes().first(),
            Some(b'{') | Some(b'[')
        )
    }

    pub fn validate(&self) -> Result<(), Cow<'static, str>> {
        if self.jsonrpc != "2.0" {
            return Err("invalid json-rpc version".into());
        }

        if self.method.is_empty() || self.method.len() > 100 {
            return Err("invalid method".into());
        }

        if !self.id_is_scalar() {
            return Err("invalid id".into());
        }

        Ok(())
    }

    pub fn num_bytes(&self) -> usize {
        serde_json::to_string(self)
            .expect("this should always be valid json")
            .len()
    }
}

impl fmt::Debug for JsonRpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Requests can come in multiple formats
#[derive(Debug, From, Serialize)]
#[serde(untagged)]
pub enum JsonRpcRequestEnum {
    Batch(Vec<JsonRpcRequest>),
    Single(JsonRpcRequest),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct JsonRpcErrorData {
    /// The error code
    pub code: i64,
    /// The error message
    pub message: Cow<'static, str>,
    /// Additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcErrorData {
    pub fn new<S: Into<Cow<'static, str>>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC response from a backend, or one the proxy built itself.
#[derive(Clone, Deserialize, Serialize)]
pub struct JsonRpcForwardedResponse {
    pub jsonrpc: String,
    #[serde(default = "null_id")]
    pub id: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcForwardedResponse {
    pub fn from_value(result: serde_json::Value, id: Box<RawValue>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_response_data(data: JsonRpcErrorData, id: Box<RawValue>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(data),
        }
    }

    pub fn from_str(message: &str, code: Option<i64>, id: Box<RawValue>) -> Self {
        Self::from_string(message.to_string(), code, id)
    }

    pub fn from_string(message: String, code: Option<i64>, id: Box<RawValue>) -> Self {
        Self::from_response_data(
            JsonRpcErrorData {
                code: code.unwrap_or(-32000),
                message: message.into(),
                data: None,
            },
            id,
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// replace the envelope id. needed when serving one cached result to many requests
    pub fn with_id(mut self, id: Box<RawValue>) -> Self {
        self.id = id;
        self
    }

    /// wrap the result so callers can see which vendor method actually served it
    pub fn tag_with_method(&mut self, method: &str) {
        if let Some(result) = self.result.take() {
            self.result = Some(json!({
                "method": method,
                "result": result,
            }));
        }
    }
}

impl fmt::Debug for JsonRpcForwardedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcForwardedResponse")
            .field("id", &self.id)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// JSON-RPC Responses can include one or many response objects.
#[derive(Clone, Debug, From, Serialize)]
#[serde(untagged)]
pub enum JsonRpcForwardedResponseEnum {
    Single(JsonRpcForwardedResponse),
    Batch(Vec<JsonRpcForwardedResponse>),
}

impl JsonRpcForwardedResponseEnum {
    pub fn num_responses(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(inner) => inner.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_single() {
        let json = r#"{"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":7}"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "eth_chainId");
        assert_eq!(req.id.get(), "7");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn missing_id_defaults_to_null() {
        let json = r#"{"jsonrpc":"2.0","method":"eth_chainId","params":[]}"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.id.get(), "null");
    }

    #[test]
    fn object_ids_are_rejected() {
        let json = r#"{"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":{"a":1}}"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();

        assert!(req.validate().is_err());

        let json = r#"{"jsonrpc":"2.0","method":"eth_chainId","params":[],"id":[1]}"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();

        assert!(req.validate().is_err());
    }

    #[test]
    fn string_ids_round_trip() {
        let json = r#"{"jsonrpc":"2.0","method":"net_version","id":"abc-1"}"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();

        assert!(req.validate().is_ok());

        let res = JsonRpcForwardedResponse::from_value(serde_json::json!("1"), req.id.clone());

        let out = serde_json::to_string(&res).unwrap();

        assert!(out.contains(r#""id":"abc-1""#));
    }

    #[test]
    fn error_responses_serialize_without_result() {
        let res = JsonRpcForwardedResponse::from_str("nope", Some(-32601), null_id());

        let out = serde_json::to_string(&res).unwrap();

        assert!(out.contains(r#""error""#));
        assert!(!out.contains(r#""result""#));
    }
}
