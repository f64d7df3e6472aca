use std::io;

use futures::channel::mpsc::SendError;
use futures::channel::oneshot::Canceled;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;

use replaymux_cdp::cdp::js_protocol::runtime::ExceptionDetails;

pub type Result<T, E = CdpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("{0}")]
    Ws(#[from] tungstenite::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Chrome(#[from] replaymux_cdp::Error),
    #[error("Received no response from the browser instance.")]
    NoResponse,
    #[error("Received unexpected ws message: {0:?}")]
    UnexpectedWsMessage(Message),
    #[error("{0}")]
    ChannelSendError(#[from] ChannelError),
    #[error("Request timed out.")]
    Timeout,
    #[error("No pong within the keepalive window.")]
    PingTimeout,
    #[error("The websocket transport closed before the response arrived.")]
    SessionClosed,
    /// Error message related to a cdp response that is not a protocol error
    #[error("{0}")]
    ChromeMessage(String),
    #[error("Requested value not found.")]
    NotFound,
    /// Detailed information about exception (or error) that was thrown during
    /// script compilation or execution
    #[error("{0:?}")]
    JavascriptException(Box<ExceptionDetails>),
    #[error("{0}")]
    Url(#[from] url::ParseError),
}

impl CdpError {
    pub fn msg(msg: impl Into<String>) -> Self {
        CdpError::ChromeMessage(msg.into())
    }

    /// True when the underlying transport is gone and retrying on the same
    /// socket is pointless.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            CdpError::SessionClosed | CdpError::Ws(_) | CdpError::PingTimeout
        )
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Send(#[from] SendError),
}

impl From<SendError> for CdpError {
    fn from(err: SendError) -> Self {
        ChannelError::from(err).into()
    }
}

impl From<Canceled> for CdpError {
    fn from(_: Canceled) -> Self {
        // the responder was dropped, which only happens on teardown
        CdpError::SessionClosed
    }
}

/// Failure surface of the replay metadata store.
///
/// Store failures are data, never panics; non-critical writes are logged and
/// ignored by the callers.
#[derive(Debug, Error)]
pub enum ReplayStoreError {
    #[error("connection_failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),
    #[error("query_failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
    #[error("transaction_failed: {0}")]
    TransactionFailed(#[source] sqlx::Error),
}
