//! Rewrites CDP events observed on cross-origin challenge iframe sessions
//! into synthetic recording events for the parent page's buffer.
//!
//! The iframe document cannot be instrumented with the full recorder, so the
//! protocol-level view is the only one available. The synthetic events keep
//! the replay timeline coherent and double as a liveness heartbeat for
//! external clients.

use serde_json::json;

use replaymux_cdp::cdp::browser_protocol::network::{
    EventRequestWillBeSent, EventResponseReceived,
};
use replaymux_cdp::cdp::js_protocol::runtime::EventConsoleApiCalled;

/// A synthetic recording event destined for the parent buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BridgedEvent {
    pub tag: &'static str,
    pub payload: serde_json::Value,
}

/// Outcome of bridging a network response: the event plus `/pat/` bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BridgedResponse {
    pub event: BridgedEvent,
    /// `Some(success)` when the response belongs to a `/pat/` exchange.
    pub pat: Option<bool>,
}

pub(crate) fn bridge_request(ev: &EventRequestWillBeSent) -> BridgedEvent {
    BridgedEvent {
        tag: "network.request",
        payload: json!({
            "id": format!("iframe-{}", ev.request_id),
            "url": ev.request.url,
            "method": ev.request.method,
            "type": "iframe",
            "resourceType": ev.r#type,
        }),
    }
}

/// Whether this request should bump the challenge CDN activity heartbeat.
pub(crate) fn is_challenge_cdn(ev: &EventRequestWillBeSent, challenge_host: &str) -> bool {
    ev.request.url.contains(challenge_host)
}

pub(crate) fn bridge_response(ev: &EventResponseReceived) -> BridgedResponse {
    let pat = if ev.response.url.contains("/pat/") {
        Some((200..300).contains(&ev.response.status))
    } else {
        None
    };
    BridgedResponse {
        event: BridgedEvent {
            tag: "network.response",
            payload: json!({
                "id": format!("iframe-{}", ev.request_id),
                "url": ev.response.url,
                "status": ev.response.status,
                "statusText": ev.response.status_text,
                "contentType": ev.response.mime_type,
                "type": "iframe",
            }),
        },
        pat,
    }
}

/// Console calls from the iframe become rrweb console-plugin records: the
/// first few args stringified, a truncated trace, and an iframe source tag.
pub(crate) fn bridge_console(ev: &EventConsoleApiCalled) -> serde_json::Value {
    let args: Vec<serde_json::Value> = ev
        .args
        .iter()
        .take(6)
        .map(|arg| {
            arg.value.clone().unwrap_or_else(|| {
                serde_json::Value::String(
                    arg.description
                        .clone()
                        .unwrap_or_else(|| arg.r#type.clone()),
                )
            })
        })
        .collect();
    let trace: Vec<String> = ev
        .stack_trace
        .as_ref()
        .map(|st| {
            st.call_frames
                .iter()
                .take(4)
                .map(|f| format!("{} ({}:{})", f.function_name, f.url, f.line_number))
                .collect()
        })
        .unwrap_or_default();
    json!({
        "level": ev.r#type,
        "payload": args,
        "trace": trace,
        "source": "iframe",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use replaymux_cdp::cdp::browser_protocol::network::{Request, Response};
    use replaymux_cdp::cdp::js_protocol::runtime::{CallFrame, RemoteObject, StackTrace};

    fn request_event(url: &str) -> EventRequestWillBeSent {
        EventRequestWillBeSent {
            request_id: "55.9".to_string().into(),
            request: Request {
                url: url.to_string(),
                method: "GET".to_string(),
                headers: Default::default(),
            },
            r#type: Some("Fetch".to_string()),
        }
    }

    fn response_event(url: &str, status: i64) -> EventResponseReceived {
        EventResponseReceived {
            request_id: "55.9".to_string().into(),
            response: Response {
                url: url.to_string(),
                status,
                status_text: "OK".to_string(),
                headers: Default::default(),
                mime_type: "application/json".to_string(),
            },
            r#type: Some("Fetch".to_string()),
        }
    }

    #[test]
    fn request_gets_iframe_prefix_and_tag() {
        let bridged = bridge_request(&request_event("https://challenges.example/turnstile/api"));
        assert_eq!(bridged.tag, "network.request");
        assert_eq!(bridged.payload["id"], "iframe-55.9");
        assert_eq!(bridged.payload["type"], "iframe");
    }

    #[test]
    fn cdn_match_uses_configured_host() {
        let ev = request_event("https://challenges.example/cdn-cgi/challenge-platform/x.js");
        assert!(is_challenge_cdn(&ev, "challenges.example"));
        assert!(!is_challenge_cdn(&ev, "other.example"));
    }

    #[test]
    fn pat_responses_report_success_by_status() {
        let ok = bridge_response(&response_event("https://challenges.example/pat/token", 204));
        assert_eq!(ok.pat, Some(true));
        let bad = bridge_response(&response_event("https://challenges.example/pat/token", 403));
        assert_eq!(bad.pat, Some(false));
        let other = bridge_response(&response_event("https://challenges.example/js/x.js", 200));
        assert_eq!(other.pat, None);
        assert_eq!(other.event.payload["contentType"], "application/json");
    }

    #[test]
    fn console_truncates_args_and_trace() {
        let ev = EventConsoleApiCalled {
            r#type: "warning".to_string(),
            args: (0..10)
                .map(|i| RemoteObject {
                    r#type: "number".to_string(),
                    subtype: None,
                    value: Some(serde_json::json!(i)),
                    description: None,
                })
                .collect(),
            stack_trace: Some(StackTrace {
                description: None,
                call_frames: (0..8)
                    .map(|i| CallFrame {
                        function_name: format!("f{i}"),
                        url: "https://challenges.example/x.js".to_string(),
                        line_number: i,
                        column_number: 0,
                    })
                    .collect(),
            }),
        };
        let payload = bridge_console(&ev);
        assert_eq!(payload["level"], "warning");
        assert_eq!(payload["payload"].as_array().unwrap().len(), 6);
        assert_eq!(payload["trace"].as_array().unwrap().len(), 4);
        assert_eq!(payload["source"], "iframe");
    }
}
