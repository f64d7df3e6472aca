//! Network domain: request/response lifecycle observation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Command, Method, MethodId, MethodType};

/// Unique request identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn inner(&self) -> &String {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId(id)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Enables network tracking, network events will now be delivered to the
/// client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableParams {}

impl EnableParams {
    pub const IDENTIFIER: &'static str = "Network.enable";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableReturns {}

impl Method for EnableParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl MethodType for EnableParams {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

impl Command for EnableParams {
    type Response = EnableReturns;
}

/// HTTP request data.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, serde_json::Value>,
}

/// HTTP response data.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub url: String,
    pub status: i64,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, serde_json::Value>,
    pub mime_type: String,
}

/// Fired when page is about to send HTTP request.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRequestWillBeSent {
    pub request_id: RequestId,
    pub request: Request,
    /// Resource type as it was perceived by the rendering engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

impl EventRequestWillBeSent {
    pub const IDENTIFIER: &'static str = "Network.requestWillBeSent";
}

impl MethodType for EventRequestWillBeSent {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}

/// Fired when HTTP response is available.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventResponseReceived {
    pub request_id: RequestId,
    pub response: Response,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

impl EventResponseReceived {
    pub const IDENTIFIER: &'static str = "Network.responseReceived";
}

impl MethodType for EventResponseReceived {
    fn method_id() -> MethodId {
        Self::IDENTIFIER.into()
    }
}
