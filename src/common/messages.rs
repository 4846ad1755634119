//! Serialize and deserialize DHT messages.
//!
//! Messages are JSON objects. Requests carry `id`, responses `requestId`, and both
//! carry a `type`, the `sender` contact and type specific `params`. The `params`
//! are resolved into typed variants during decoding, so nothing past this module
//! ever sees an untyped payload.

mod internal;

use std::net::{IpAddr, SocketAddr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Contact, Id};
use crate::{Error, Result};

use internal::{
    FindNodeRequestParams, FindValueRequestParams, NodesResponseParams, StoreRequestParams,
    StoreResponseParams, ValueResponseParams, WireContact, WireCorrelation, WireMessage,
};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Correlation id, echoed by the response to a request.
    pub transaction_id: String,

    /// The node that sent this message.
    pub sender: Contact,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    Store(StoreRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ResponseSpecific {
    pub status: Status,
    pub response_type: ResponseTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseTypeSpecific {
    Pong,
    StoreAck(StoreResponseArguments),
    Nodes(NodesResponseArguments),
    Value(ValueResponseArguments),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// The possible statuses of a response.
pub enum Status {
    Ok,
    /// For example, if storage failed.
    Failed,
    /// The key (or node) is not held by the responder.
    NotFound,
    InternalError,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: String,
    /// `None` deletes the key.
    pub value: Option<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StoreResponseArguments {
    /// The value replaced (or deleted) by the store request, if any.
    pub previous_value: Option<String>,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NodesResponseArguments {
    pub contacts: Vec<Contact>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ValueResponseArguments {
    pub key: String,
    pub value: Option<String>,
}

/// The kind of a request, used to check that a response matches it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestType {
    Ping,
    Store,
    FindNode,
    FindValue,
}

impl RequestSpecific {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestSpecific::Ping => RequestType::Ping,
            RequestSpecific::Store(_) => RequestType::Store,
            RequestSpecific::FindNode(_) => RequestType::FindNode,
            RequestSpecific::FindValue(_) => RequestType::FindValue,
        }
    }
}

impl RequestType {
    /// Returns true if `response` is a valid answer to this kind of request.
    pub fn accepts(&self, response: &ResponseTypeSpecific) -> bool {
        matches!(
            (self, response),
            (RequestType::Ping, ResponseTypeSpecific::Pong)
                | (RequestType::Store, ResponseTypeSpecific::StoreAck(_))
                | (RequestType::FindNode, ResponseTypeSpecific::Nodes(_))
                | (RequestType::FindValue, ResponseTypeSpecific::Value(_))
                | (RequestType::FindValue, ResponseTypeSpecific::Nodes(_))
        )
    }
}

impl Message {
    pub fn request(transaction_id: String, sender: Contact, request: RequestSpecific) -> Self {
        Message {
            transaction_id,
            sender,
            message_type: MessageType::Request(request),
        }
    }

    pub fn response(
        transaction_id: String,
        sender: Contact,
        status: Status,
        response_type: ResponseTypeSpecific,
    ) -> Self {
        Message {
            transaction_id,
            sender,
            message_type: MessageType::Response(ResponseSpecific {
                status,
                response_type,
            }),
        }
    }

    /// Decode a message.
    ///
    /// Unknown `type` values are [Error::UnsupportedType], anything else that
    /// does not fit the declared type is [Error::MalformedMessage].
    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire: WireMessage = serde_json::from_slice(bytes).map_err(malformed)?;

        let sender = wire.sender.into_contact()?;

        match (wire.id, wire.request_id) {
            (Some(transaction_id), None) => {
                let request = decode_request(&wire.message_type, wire.params)?;

                Ok(Message::request(transaction_id, sender, request))
            }
            (None, Some(transaction_id)) => {
                let response_type = decode_response(&wire.message_type, wire.params)?;
                let status = wire.status.ok_or_else(|| {
                    Error::MalformedMessage("response without status".to_string())
                })?;

                Ok(Message::response(
                    transaction_id,
                    sender,
                    status,
                    response_type,
                ))
            }
            _ => Err(Error::MalformedMessage(
                "expected exactly one of `id` or `requestId`".to_string(),
            )),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire()?)?)
    }

    /// Correlation id and sender id of a response, even if the rest of it
    /// fails to decode.
    pub fn peek_response_id(bytes: &[u8]) -> Option<(String, Id)> {
        let WireCorrelation { request_id, sender } = serde_json::from_slice(bytes).ok()?;
        let sender: Id = sender?.id.parse().ok()?;

        Some((request_id?, sender))
    }

    fn to_wire(&self) -> Result<WireMessage> {
        let sender = WireContact::from(&self.sender);

        Ok(match &self.message_type {
            MessageType::Request(request) => {
                let (message_type, params) = match request {
                    RequestSpecific::Ping => ("ping", None),
                    RequestSpecific::Store(StoreRequestArguments { key, value }) => (
                        "store",
                        Some(serde_json::to_value(StoreRequestParams {
                            key: key.clone(),
                            value: Some(value.clone()),
                        })?),
                    ),
                    RequestSpecific::FindNode(FindNodeRequestArguments { target }) => (
                        "findNode",
                        Some(serde_json::to_value(FindNodeRequestParams {
                            id: target.to_string(),
                        })?),
                    ),
                    RequestSpecific::FindValue(FindValueRequestArguments { key }) => (
                        "findValue",
                        Some(serde_json::to_value(FindValueRequestParams {
                            key: key.clone(),
                        })?),
                    ),
                };

                WireMessage {
                    id: Some(self.transaction_id.clone()),
                    request_id: None,
                    message_type: message_type.to_string(),
                    status: None,
                    sender,
                    params,
                }
            }
            MessageType::Response(ResponseSpecific {
                status,
                response_type,
            }) => {
                let (message_type, params) = match response_type {
                    ResponseTypeSpecific::Pong => ("pong", None),
                    ResponseTypeSpecific::StoreAck(StoreResponseArguments { previous_value }) => (
                        "store",
                        Some(serde_json::to_value(StoreResponseParams {
                            previous_value: Some(previous_value.clone()),
                        })?),
                    ),
                    ResponseTypeSpecific::Nodes(NodesResponseArguments { contacts }) => (
                        "node",
                        Some(serde_json::to_value(NodesResponseParams {
                            nodes: contacts.iter().map(WireContact::from).collect(),
                        })?),
                    ),
                    ResponseTypeSpecific::Value(ValueResponseArguments { key, value }) => (
                        "value",
                        Some(serde_json::to_value(ValueResponseParams {
                            key: key.clone(),
                            value: Some(value.clone()),
                        })?),
                    ),
                };

                WireMessage {
                    id: None,
                    request_id: Some(self.transaction_id.clone()),
                    message_type: message_type.to_string(),
                    status: Some(*status),
                    sender,
                    params,
                }
            }
        })
    }
}

fn decode_request(message_type: &str, params: Option<Value>) -> Result<RequestSpecific> {
    Ok(match message_type {
        // no parameters for ping
        "ping" => RequestSpecific::Ping,
        "store" => {
            let StoreRequestParams { key, value } = params_as(params)?;
            let value = value.ok_or_else(|| {
                Error::MalformedMessage("store request without a value field".to_string())
            })?;

            RequestSpecific::Store(StoreRequestArguments { key, value })
        }
        "findNode" => {
            let FindNodeRequestParams { id } = params_as(params)?;

            RequestSpecific::FindNode(FindNodeRequestArguments {
                target: parse_id(&id)?,
            })
        }
        "findValue" => {
            let FindValueRequestParams { key } = params_as(params)?;

            RequestSpecific::FindValue(FindValueRequestArguments { key })
        }
        other => return Err(Error::UnsupportedType(other.to_string())),
    })
}

fn decode_response(message_type: &str, params: Option<Value>) -> Result<ResponseTypeSpecific> {
    Ok(match message_type {
        "pong" => ResponseTypeSpecific::Pong,
        "store" => {
            let StoreResponseParams { previous_value } = params_as(params)?;
            let previous_value = previous_value.ok_or_else(|| {
                Error::MalformedMessage("store response without previousValue".to_string())
            })?;

            ResponseTypeSpecific::StoreAck(StoreResponseArguments { previous_value })
        }
        "node" => {
            let NodesResponseParams { nodes } = params_as(params)?;

            ResponseTypeSpecific::Nodes(NodesResponseArguments {
                contacts: nodes
                    .into_iter()
                    .map(WireContact::into_contact)
                    .collect::<Result<_>>()?,
            })
        }
        "value" => {
            let ValueResponseParams { key, value } = params_as(params)?;
            let value = value.ok_or_else(|| {
                Error::MalformedMessage("value response without a value field".to_string())
            })?;

            ResponseTypeSpecific::Value(ValueResponseArguments { key, value })
        }
        other => return Err(Error::UnsupportedType(other.to_string())),
    })
}

fn params_as<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(malformed)
}

fn parse_id(id: &str) -> Result<Id> {
    id.parse()
        .map_err(|error| Error::MalformedMessage(format!("bad node id: {}", error)))
}

fn malformed(error: serde_json::Error) -> Error {
    Error::MalformedMessage(error.to_string())
}

impl From<&Contact> for WireContact {
    fn from(contact: &Contact) -> Self {
        WireContact {
            id: contact.id().to_string(),
            ip_address: contact.address().ip().to_string(),
            port: contact.address().port(),
        }
    }
}

impl WireContact {
    fn into_contact(self) -> Result<Contact> {
        let ip: IpAddr = self.ip_address.parse().map_err(|_| {
            Error::MalformedMessage(format!("bad ip address: {:?}", self.ip_address))
        })?;

        Ok(Contact::new(
            parse_id(&self.id)?,
            SocketAddr::new(ip, self.port),
        ))
    }
}
