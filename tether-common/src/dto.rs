//! Data Transfer Objects (or structs)
//!
//! These structs serve to serialise and deserialize messages between the client and the
//! remote graph API. They are the request/response bodies of the HTTP channel and the
//! envelopes multiplexed over every push transport.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// The kind of a graph operation. Used to namespace keys so that identical texts of
/// different kinds never share cache entries or in-flight executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a request/response operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Value,
    #[serde(rename = "operationName", default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphRequest {
    pub fn new(query: impl Into<String>, variables: Value) -> Self {
        Self { query: query.into(), variables, operation_name: None }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// One element of an error path: either a field name or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// An error reported by the server inside an otherwise well formed response.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct GraphError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), locations: Vec::new(), path: Vec::new(), extensions: None }
    }
}

/// Body of a request/response reply. A reply may carry data, errors or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphResponse {
    pub fn from_data(data: Value) -> Self {
        Self { data: Some(data), ..Default::default() }
    }

    pub fn from_errors(errors: Vec<GraphError>) -> Self {
        Self { errors, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Subscribe,
    Unsubscribe,
    Data,
    Error,
    Ping,
    Pong,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Data => "data",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// Envelope exchanged over push transports.
///
/// Subscription frames carry the subscription id in `id`; ping and pong frames carry the
/// probe id. Servers that support resumable delivery stamp `eventId` on outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "eventId", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Frame {
    fn new(frame_type: FrameType, id: &str, payload: Option<Value>) -> Self {
        Self { frame_type, id: Some(id.to_string()), payload, event_id: None }
    }

    /// A subscribe frame. The payload carries the operation and its variables.
    pub fn subscribe(id: &str, request: &GraphRequest) -> Self {
        let payload = json!({ "query": request.query, "variables": request.variables });
        Self::new(FrameType::Subscribe, id, Some(payload))
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(FrameType::Unsubscribe, id, None)
    }

    pub fn data(id: &str, payload: Value) -> Self {
        Self::new(FrameType::Data, id, Some(payload))
    }

    pub fn error(id: &str, payload: Value) -> Self {
        Self::new(FrameType::Error, id, Some(payload))
    }

    pub fn ping(id: &str) -> Self {
        Self::new(FrameType::Ping, id, None)
    }

    pub fn pong(id: &str) -> Self {
        Self::new(FrameType::Pong, id, None)
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let request = GraphRequest::new("subscription { ticks }", json!({"symbol": "ABC"}));
        let frame = Frame::subscribe("sub-1", &request).with_event_id("17");

        let encoded: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({
                "type": "subscribe",
                "id": "sub-1",
                "payload": {"query": "subscription { ticks }", "variables": {"symbol": "ABC"}},
                "eventId": "17"
            })
        );
    }

    #[test]
    fn test_parse_server_frame() {
        let frame = Frame::from_json(r#"{"type":"data","id":"S","payload":{"n":1}}"#).unwrap();

        assert_eq!(frame, Frame::data("S", json!({"n": 1})));
    }

    #[test]
    fn test_parse_ping_without_payload() {
        let frame = Frame::from_json(r#"{"type":"ping","id":"p-3"}"#).unwrap();

        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.payload, None);
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        assert!(Frame::from_json(r#"{"type":"hello","id":"x"}"#).is_err());
    }

    #[test]
    fn test_parse_response_with_errors() {
        let body = r#"{
            "data": null,
            "errors": [{
                "message": "field not found",
                "locations": [{"line": 1, "column": 3}],
                "path": ["user", 0, "name"]
            }]
        }"#;

        let response: GraphResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.data, None);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].to_string(), "field not found");
        assert_eq!(
            response.errors[0].path,
            vec![
                PathSegment::Field("user".to_string()),
                PathSegment::Index(0),
                PathSegment::Field("name".to_string())
            ]
        );
    }

    #[test]
    fn test_request_omits_missing_operation_name() {
        let request = GraphRequest::new("{ me { id } }", json!({}));

        let encoded = serde_json::to_value(&request).unwrap();

        assert_eq!(encoded, json!({"query": "{ me { id } }", "variables": {}}));
    }
}
