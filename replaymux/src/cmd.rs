use std::collections::VecDeque;
use std::iter::FromIterator;
use std::time::{Duration, Instant};

use futures::channel::oneshot::Sender as OneshotSender;
use serde::Serialize;

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};
use replaymux_cdp::{Command, CommandResponse, Method, MethodId, Request, Response};

use crate::coordinator::REQUEST_TIMEOUT;
use crate::error::{CdpError, Result};

/// Deserialize a response
pub(crate) fn to_command_response<T: Command>(
    resp: Response,
    method: MethodId,
) -> Result<CommandResponse<T::Response>> {
    if let Some(res) = resp.result {
        let result = serde_json::from_value(res)?;
        Ok(CommandResponse {
            id: resp.id,
            result,
            method,
        })
    } else if let Some(err) = resp.error {
        Err(err.into())
    } else {
        Err(CdpError::NoResponse)
    }
}

/// Messages used internally to communicate with the connection, which is
/// executed in the background task.
#[derive(Debug, Serialize)]
pub struct CommandMessage<T = Result<Response>> {
    pub method: MethodId,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub params: serde_json::Value,
    /// Route over this target's dedicated socket when eligible.
    #[serde(skip_serializing)]
    pub page_route: Option<TargetId>,
    /// Overrides the default response deadline.
    #[serde(skip_serializing)]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing)]
    pub sender: OneshotSender<T>,
}

impl<T> CommandMessage<T> {
    pub fn new<C: Command>(cmd: C, sender: OneshotSender<T>) -> serde_json::Result<Self> {
        Ok(Self {
            method: cmd.identifier(),
            session_id: None,
            params: serde_json::to_value(cmd)?,
            page_route: None,
            timeout: None,
            sender,
        })
    }

    pub fn with_session<C: Command>(
        cmd: C,
        sender: OneshotSender<T>,
        session_id: Option<SessionId>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            method: cmd.identifier(),
            session_id,
            params: serde_json::to_value(cmd)?,
            page_route: None,
            timeout: None,
            sender,
        })
    }

    pub fn split(self) -> (Request, OneshotSender<T>) {
        (
            Request {
                method: self.method,
                session_id: self.session_id.map(Into::into),
                params: self.params,
            },
            self.sender,
        )
    }
}

impl Method for CommandMessage {
    fn identifier(&self) -> MethodId {
        self.method.clone()
    }
}

#[derive(Debug)]
pub struct CommandChain {
    /// The commands to process: (method identifier, params)
    cmds: VecDeque<(MethodId, serde_json::Value)>,
    /// The last issued command we are currently waiting on
    waiting: Option<(MethodId, Instant)>,
    /// The window a response after issuing a request must arrive in
    timeout: Duration,
}

pub type NextCommand = std::task::Poll<Option<Result<(MethodId, serde_json::Value), ChainExpired>>>;

/// The chain gave up waiting on a response.
#[derive(Debug, Clone)]
pub struct ChainExpired {
    pub method: MethodId,
}

impl CommandChain {
    /// Creates a new `CommandChain` from an `Iterator`.
    ///
    /// The order of the commands corresponds to the iterator's
    pub fn new<I>(cmds: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = (MethodId, serde_json::Value)>,
    {
        Self {
            cmds: VecDeque::from_iter(cmds),
            waiting: None,
            timeout,
        }
    }

    /// queue in another request
    pub fn push_back(&mut self, method: MethodId, params: serde_json::Value) {
        self.cmds.push_back((method, params))
    }

    /// Removes the waiting state if the identifier matches that of the last
    /// issued command
    pub fn received_response(&mut self, identifier: &str) -> bool {
        if self.waiting.as_ref().map(|(c, _)| c.as_ref()) == Some(identifier) {
            self.waiting.take();
            true
        } else {
            false
        }
    }

    /// Whether all commands have been issued and answered.
    pub fn is_done(&self) -> bool {
        self.cmds.is_empty() && self.waiting.is_none()
    }

    /// Return the next command to process or `None` if done.
    /// If the response timed out an error is returned instead
    pub fn poll(&mut self, now: Instant) -> NextCommand {
        use std::task::Poll;
        if let Some((cmd, deadline)) = self.waiting.as_ref() {
            if now > *deadline {
                tracing::error!(
                    "Command {:?} exceeded deadline by {:?}",
                    cmd,
                    now - *deadline
                );
                Poll::Ready(Some(Err(ChainExpired {
                    method: cmd.clone(),
                })))
            } else {
                Poll::Pending
            }
        } else if let Some((method, val)) = self.cmds.pop_front() {
            self.waiting = Some((method.clone(), now + self.timeout));
            Poll::Ready(Some(Ok((method, val))))
        } else {
            Poll::Ready(None)
        }
    }
}

impl Default for CommandChain {
    fn default() -> Self {
        Self {
            cmds: Default::default(),
            waiting: None,
            timeout: Duration::from_millis(REQUEST_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(method: &'static str) -> (MethodId, serde_json::Value) {
        (method.into(), serde_json::json!({}))
    }

    #[test]
    fn chain_issues_in_order_and_waits() {
        use std::task::Poll;

        let mut chain = CommandChain::new(
            vec![cmd("Page.enable"), cmd("Runtime.addBinding")],
            Duration::from_secs(5),
        );
        let now = Instant::now();

        match chain.poll(now) {
            Poll::Ready(Some(Ok((method, _)))) => assert_eq!(method, "Page.enable"),
            other => panic!("unexpected {other:?}"),
        }
        // waiting on a response, nothing new is issued
        assert!(matches!(chain.poll(now), Poll::Pending));

        assert!(chain.received_response("Page.enable"));
        match chain.poll(now) {
            Poll::Ready(Some(Ok((method, _)))) => assert_eq!(method, "Runtime.addBinding"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(chain.received_response("Runtime.addBinding"));
        assert!(matches!(chain.poll(now), Poll::Ready(None)));
        assert!(chain.is_done());
    }

    #[test]
    fn chain_expires_after_timeout() {
        use std::task::Poll;

        let mut chain = CommandChain::new(vec![cmd("Page.enable")], Duration::from_millis(10));
        let start = Instant::now();
        assert!(matches!(chain.poll(start), Poll::Ready(Some(Ok(_)))));
        let late = start + Duration::from_millis(50);
        match chain.poll(late) {
            Poll::Ready(Some(Err(expired))) => assert_eq!(expired.method, "Page.enable"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatched_response_does_not_clear_waiting() {
        let mut chain = CommandChain::new(vec![cmd("Page.enable")], Duration::from_secs(5));
        let _ = chain.poll(Instant::now());
        assert!(!chain.received_response("Network.enable"));
        assert!(!chain.is_done());
    }
}
