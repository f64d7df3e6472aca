//! Typed message plumbing for the [Chrome DevTools Protocol](https://chromedevtools.github.io/devtools-protocol/).
//!
//! This crate carries the wire-level types (`MethodCall`, `Response`,
//! `Message`) plus hand-maintained params/returns pairs for the protocol
//! domains the recorder drives: `Target`, `Page`, `Runtime`, `Network` and
//! `Input`. Everything else stays behind the raw-JSON escape hatch on
//! [`cdp::events::CdpEvent::Other`].

#![warn(missing_debug_implementations, rust_2018_idioms)]

use std::borrow::Cow;
use std::fmt;
use std::fmt::Debug;
use std::ops::Deref;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod cdp;

pub type MethodId = Cow<'static, str>;

/// A Request sent by the client, identified by the `id`
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct MethodCall {
    /// Identifier for this method call
    ///
    /// [`MethodCall`] id's must be unique for every session
    pub id: CallId,
    /// The method identifier
    pub method: MethodId,
    /// The CDP session id if any
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The payload of the request
    pub params: serde_json::Value,
}

/// Identifier for a request sent to the browser.
///
/// All requests (`MethodCall`) must contain a unique identifier per
/// connection. Connections that multiplex beside the browser socket start
/// their counter in a disjoint numeric range so log lines never collide.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(usize);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl CallId {
    /// Create a new id
    pub fn new(id: usize) -> Self {
        CallId(id)
    }

    /// The raw numeric value of this id.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Trait that all the request types have to implement.
pub trait Command: serde::ser::Serialize + Method {
    /// The type of the response this request triggers on the browser side
    type Response: serde::de::DeserializeOwned + fmt::Debug;

    /// deserialize the response from json
    fn response_from_value(response: serde_json::Value) -> serde_json::Result<Self::Response> {
        serde_json::from_value(response)
    }
}

/// A generic, successful, response of a request where the `result` has been
/// deserialized into the `Command::Response` type.
pub struct CommandResponse<T>
where
    T: fmt::Debug,
{
    pub id: CallId,
    pub result: T,
    pub method: MethodId,
}

impl<T: fmt::Debug> Deref for CommandResponse<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl<T: fmt::Debug> fmt::Debug for CommandResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResponse")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("result", &self.result)
            .finish()
    }
}

/// A received `Event` from the websocket where the `params` is kept as json
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct CdpJsonEventMessage {
    /// Name of the method
    pub method: MethodId,
    /// The session this event is meant for.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    /// Json payload of the event
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Method for CdpJsonEventMessage {
    fn identifier(&self) -> MethodId {
        self.method.clone()
    }
}

impl EventMessage for CdpJsonEventMessage {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// A trait for deserialized event frames that know which session they belong
/// to.
pub trait EventMessage: Method + DeserializeOwned + Debug {
    /// The identifier of the session this event was meant for.
    fn session_id(&self) -> Option<&str>;
}

/// `Method`s are message types that contain the field `method =
/// Self::identifier()` in their json body.
pub trait Method {
    /// The whole string identifier for this method like: `Target.setAutoAttach`
    fn identifier(&self) -> MethodId;

    /// The name of the domain this method belongs to: `Target`
    fn domain_name(&self) -> MethodId {
        self.split().0
    }

    /// The standalone identifier of the method inside the domain:
    /// `setAutoAttach`
    fn method_name(&self) -> MethodId {
        self.split().1
    }

    /// Tuple of (`domain_name`, `method_name`)
    fn split(&self) -> (MethodId, MethodId) {
        match self.identifier() {
            Cow::Borrowed(id) => {
                let mut iter = id.split('.');
                (iter.next().unwrap().into(), iter.next().unwrap().into())
            }
            Cow::Owned(id) => {
                let mut iter = id.split('.');
                (
                    Cow::Owned(iter.next().unwrap().into()),
                    Cow::Owned(iter.next().unwrap().into()),
                )
            }
        }
    }
}

/// A trait that identifies a method on type level
pub trait MethodType {
    /// The identifier for this event's `method` field
    fn method_id() -> MethodId
    where
        Self: Sized;
}

/// A Wrapper for json serialized requests
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Request {
    /// The identifier for the type of this request.
    pub method: MethodId,
    /// The session this request targets
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The serialized `Command` payload
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(method: MethodId, params: serde_json::Value) -> Self {
        Self {
            method,
            params,
            session_id: None,
        }
    }

    pub fn with_session(
        method: MethodId,
        params: serde_json::Value,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            method,
            params,
            session_id: Some(session_id.into()),
        }
    }
}

/// A response to a [`MethodCall`] from the browser instance
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Response {
    /// Numeric identifier for the exact request
    pub id: CallId,
    /// The response payload
    pub result: Option<serde_json::Value>,
    /// The reason why the [`MethodCall`] failed.
    pub error: Option<Error>,
}

/// An incoming message read from the web socket can either be a response to a
/// previously submitted `Request`, identified by an identifier `id`, or an
/// `Event` emitted by the server.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum Message<T = CdpJsonEventMessage> {
    /// A response for a request
    Response(Response),
    /// An emitted event from the server
    Event(T),
}

/// Represents the error type emitted by the browser for failed requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    /// Error code
    pub code: i64,
    /// Error Message
    pub message: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_serializes_session_id_only_when_present() {
        let call = MethodCall {
            id: CallId::new(7),
            method: "Page.enable".into(),
            session_id: None,
            params: serde_json::json!({}),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert!(json.get("sessionId").is_none());

        let call = MethodCall {
            session_id: Some("SESS".to_string()),
            ..call
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["sessionId"], "SESS");
    }

    #[test]
    fn message_distinguishes_responses_from_events() {
        let msg: Message = serde_json::from_str(r#"{"id":3,"result":{}}"#).unwrap();
        assert!(matches!(msg, Message::Response(_)));

        let msg: Message =
            serde_json::from_str(r#"{"method":"Page.loadEventFired","params":{}}"#).unwrap();
        match msg {
            Message::Event(ev) => assert_eq!(ev.method, "Page.loadEventFired"),
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn method_split() {
        let ev = CdpJsonEventMessage {
            method: "Runtime.bindingCalled".into(),
            session_id: None,
            params: serde_json::Value::Null,
        };
        assert_eq!(ev.domain_name(), "Runtime");
        assert_eq!(ev.method_name(), "bindingCalled");
    }
}
