//! Publish messages and the payloads delivered to subscribers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Header carrying the request/response correlation id
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// What the payload of a publish message is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Plain event, delivered through the subscriber's callback
    Event,

    /// Query against the subscriber's entity set
    DataRequest { query: String },
}

/// A message published under a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub id: Uuid,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,

    /// Queue failed deliveries for retry
    pub republish: bool,

    pub kind: MessageKind,
}

impl PublishMessage {
    /// Create an event message
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        PublishMessage {
            id: Uuid::new_v4(),
            key: key.into(),
            payload,
            headers: BTreeMap::new(),
            republish: true,
            kind: MessageKind::Event,
        }
    }

    /// Create a data request message
    pub fn data_request(key: impl Into<String>, query: impl Into<String>) -> Self {
        PublishMessage {
            kind: MessageKind::DataRequest {
                query: query.into(),
            },
            ..Self::new(key, Vec::new())
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_republish(mut self, republish: bool) -> Self {
        self.republish = republish;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_HEADER)
    }

    pub fn is_data_request(&self) -> bool {
        matches!(self.kind, MessageKind::DataRequest { .. })
    }
}

/// Payload of the Callback RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackMessage {
    /// Topic of the subscription being served
    pub topic: String,

    /// Name of the subscriber's registered callback
    pub callback: String,

    pub message: PublishMessage,
}

/// Payload of the ExecuteDataRequest RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub message_id: Uuid,
    pub entity_set: String,
    pub query: String,
    pub headers: BTreeMap<String, String>,
}

impl DataRequest {
    /// Build the request a subscriber with `entity_set` receives for `message`
    pub fn for_message(message: &PublishMessage, entity_set: &str) -> Result<Self> {
        match &message.kind {
            MessageKind::DataRequest { query } => Ok(DataRequest {
                message_id: message.id,
                entity_set: entity_set.to_string(),
                query: query.clone(),
                headers: message.headers.clone(),
            }),
            MessageKind::Event => Err(ProtocolError::MissingField("query".to_string())),
        }
    }
}

/// Rows returned by a data request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataResponse {
    pub entity_set: String,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl DataResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_headers() {
        let msg = PublishMessage::new("orders", b"hello".to_vec())
            .with_header(CORRELATION_HEADER, "abc")
            .with_republish(false);

        assert_eq!(msg.correlation_id(), Some("abc"));
        assert!(!msg.republish);
        assert!(!msg.is_data_request());
    }

    #[test]
    fn test_data_request_for_message() {
        let msg = PublishMessage::data_request("customers", "name = 'x'");
        let req = DataRequest::for_message(&msg, "customers_v1").unwrap();
        assert_eq!(req.entity_set, "customers_v1");
        assert_eq!(req.query, "name = 'x'");
        assert_eq!(req.message_id, msg.id);

        let event = PublishMessage::new("customers", vec![]);
        assert!(DataRequest::for_message(&event, "customers_v1").is_err());
    }

    #[test]
    fn test_data_response_codec() {
        let mut row = BTreeMap::new();
        row.insert("name".to_string(), "x".to_string());
        let response = DataResponse {
            entity_set: "customers".to_string(),
            rows: vec![row],
        };

        let decoded = DataResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }
}
