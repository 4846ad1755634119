use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::Status;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Correlation id of a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Correlation id of the request a response answers.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    pub sender: WireContact,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Only the correlation fields, readable even when the rest is malformed.
#[derive(Deserialize, Debug)]
pub struct WireCorrelation {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub sender: Option<WireSenderId>,
}

#[derive(Deserialize, Debug)]
pub struct WireSenderId {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireContact {
    pub id: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreRequestParams {
    pub key: String,
    /// `Some(None)` is an explicit `null` (delete), `None` a missing field.
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Option<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeRequestParams {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindValueRequestParams {
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreResponseParams {
    #[serde(
        rename = "previousValue",
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_value: Option<Option<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodesResponseParams {
    pub nodes: Vec<WireContact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValueResponseParams {
    pub key: String,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Option<String>>,
}

/// Present fields (including `null`) become `Some`, missing ones stay `None` via `default`.
fn nullable<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}
