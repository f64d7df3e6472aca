//! Typed view over incoming protocol events.
//!
//! Incoming frames carry a `method` plus arbitrary `params`. Events the
//! recorder reacts to are deserialized into their typed structs; everything
//! else is retained verbatim under [`CdpEvent::Other`] so observers can still
//! see the raw traffic.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::cdp::browser_protocol::network::{EventRequestWillBeSent, EventResponseReceived};
use crate::cdp::browser_protocol::page::EventScreencastFrame;
use crate::cdp::browser_protocol::target::{
    EventAttachedToTarget, EventDetachedFromTarget, EventTargetCreated, EventTargetDestroyed,
    EventTargetInfoChanged,
};
use crate::cdp::js_protocol::runtime::{EventBindingCalled, EventConsoleApiCalled};
use crate::{CdpJsonEventMessage, EventMessage, Method, MethodId};

/// All protocol events the coordinator consumes, plus the raw escape hatch.
#[derive(Debug, Clone, PartialEq)]
pub enum CdpEvent {
    TargetTargetCreated(EventTargetCreated),
    TargetAttachedToTarget(Box<EventAttachedToTarget>),
    TargetDetachedFromTarget(EventDetachedFromTarget),
    TargetTargetInfoChanged(EventTargetInfoChanged),
    TargetTargetDestroyed(EventTargetDestroyed),
    NetworkRequestWillBeSent(Box<EventRequestWillBeSent>),
    NetworkResponseReceived(Box<EventResponseReceived>),
    RuntimeBindingCalled(EventBindingCalled),
    RuntimeConsoleApiCalled(EventConsoleApiCalled),
    PageScreencastFrame(Box<EventScreencastFrame>),
    /// Any event without a typed mapping, kept as raw json.
    Other(serde_json::Value),
}

/// An event frame read from the websocket.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEventMessage {
    /// Name of the method
    pub method: MethodId,
    /// The session this event is meant for.
    pub session_id: Option<String>,
    /// The typed (or raw) payload
    pub params: CdpEvent,
}

impl Method for CdpEventMessage {
    fn identifier(&self) -> MethodId {
        self.method.clone()
    }
}

impl EventMessage for CdpEventMessage {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl<'de> Deserialize<'de> for CdpEventMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = CdpJsonEventMessage::deserialize(deserializer)?;
        let params = parse_event(raw.method.as_ref(), raw.params).map_err(D::Error::custom)?;
        Ok(CdpEventMessage {
            method: raw.method,
            session_id: raw.session_id,
            params,
        })
    }
}

fn parse_event(method: &str, params: serde_json::Value) -> serde_json::Result<CdpEvent> {
    let event = match method {
        EventTargetCreated::IDENTIFIER => {
            CdpEvent::TargetTargetCreated(serde_json::from_value(params)?)
        }
        EventAttachedToTarget::IDENTIFIER => {
            CdpEvent::TargetAttachedToTarget(Box::new(serde_json::from_value(params)?))
        }
        EventDetachedFromTarget::IDENTIFIER => {
            CdpEvent::TargetDetachedFromTarget(serde_json::from_value(params)?)
        }
        EventTargetInfoChanged::IDENTIFIER => {
            CdpEvent::TargetTargetInfoChanged(serde_json::from_value(params)?)
        }
        EventTargetDestroyed::IDENTIFIER => {
            CdpEvent::TargetTargetDestroyed(serde_json::from_value(params)?)
        }
        EventRequestWillBeSent::IDENTIFIER => {
            CdpEvent::NetworkRequestWillBeSent(Box::new(serde_json::from_value(params)?))
        }
        EventResponseReceived::IDENTIFIER => {
            CdpEvent::NetworkResponseReceived(Box::new(serde_json::from_value(params)?))
        }
        EventBindingCalled::IDENTIFIER => {
            CdpEvent::RuntimeBindingCalled(serde_json::from_value(params)?)
        }
        EventConsoleApiCalled::IDENTIFIER => {
            CdpEvent::RuntimeConsoleApiCalled(serde_json::from_value(params)?)
        }
        EventScreencastFrame::IDENTIFIER => {
            CdpEvent::PageScreencastFrame(Box::new(serde_json::from_value(params)?))
        }
        _ => CdpEvent::Other(params),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_to_target_parses_typed() {
        let json = serde_json::json!({
            "method": "Target.attachedToTarget",
            "params": {
                "sessionId": "SESS1",
                "targetInfo": {
                    "targetId": "T1",
                    "type": "page",
                    "title": "t",
                    "url": "https://example.test/",
                    "attached": true
                },
                "waitingForDebugger": true
            }
        });
        let msg: CdpEventMessage = serde_json::from_value(json).unwrap();
        match msg.params {
            CdpEvent::TargetAttachedToTarget(ev) => {
                assert!(ev.waiting_for_debugger);
                assert_eq!(ev.target_info.url, "https://example.test/");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn session_scoped_events_keep_their_session() {
        let json = serde_json::json!({
            "method": "Runtime.bindingCalled",
            "sessionId": "SESS9",
            "params": {
                "name": "__turnstileSolvedBinding",
                "payload": "solved",
                "executionContextId": 4
            }
        });
        let msg: CdpEventMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.session_id.as_deref(), Some("SESS9"));
        assert!(matches!(msg.params, CdpEvent::RuntimeBindingCalled(_)));
    }

    #[test]
    fn unknown_events_fall_through_raw() {
        let json = serde_json::json!({
            "method": "Page.loadEventFired",
            "params": {"timestamp": 1.0}
        });
        let msg: CdpEventMessage = serde_json::from_value(json).unwrap();
        match msg.params {
            CdpEvent::Other(raw) => assert_eq!(raw["timestamp"], 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }
}
