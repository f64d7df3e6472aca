use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::ready;
use std::time::Duration;

use futures::stream::Stream;
use futures::task::{Context, Poll};
use futures::{Future, SinkExt, StreamExt};
use futures_timer::Delay;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use replaymux_cdp::cdp::browser_protocol::target::SessionId;
use replaymux_cdp::{CallId, EventMessage, Message, MethodCall, MethodId};

use crate::error::CdpError;
use crate::error::Result;

/// Send a ping this often on an otherwise healthy socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A ping without a pong within this window means the peer is gone.
const PONG_DEADLINE: Duration = Duration::from_secs(5);

/// Exchanges the messages with the websocket
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Connection<T: EventMessage> {
    /// Queue of commands to send.
    pending_commands: VecDeque<MethodCall>,
    /// The websocket to the browser instance
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// The identifier for the next command
    next_id: usize,
    needs_flush: bool,
    /// The message that is currently being processed
    pending_flush: Option<MethodCall>,
    /// Interval until the next keepalive ping is due
    ping_interval: Delay,
    /// Armed after a ping went out; a pong disarms it
    pong_deadline: Option<Delay>,
    /// A ping is queued but not yet written
    ping_pending: bool,
    _marker: PhantomData<T>,
}

impl<T: EventMessage + Unpin> Connection<T> {
    pub async fn connect(debug_ws_url: impl AsRef<str>) -> Result<Self> {
        Self::connect_with_base(debug_ws_url, 0).await
    }

    /// Connect with the command id counter starting at `id_base`.
    ///
    /// Sockets multiplexed beside the browser connection start in a disjoint
    /// range so ids never collide in logs.
    pub async fn connect_with_base(debug_ws_url: impl AsRef<str>, id_base: usize) -> Result<Self> {
        let config = WebSocketConfig::default()
            .max_message_size(None)
            .max_frame_size(None);
        let (ws, _) =
            connect_async_with_config(debug_ws_url.as_ref(), Some(config), false).await?;

        Ok(Self {
            pending_commands: Default::default(),
            ws,
            next_id: id_base,
            needs_flush: false,
            pending_flush: None,
            ping_interval: Delay::new(PING_INTERVAL),
            pong_deadline: None,
            ping_pending: false,
            _marker: Default::default(),
        })
    }
}

impl<T: EventMessage> Connection<T> {
    fn next_call_id(&mut self) -> CallId {
        let id = CallId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Queue in the command to send over the socket and return the id for
    /// this command
    pub fn submit_command(
        &mut self,
        method: MethodId,
        session_id: Option<SessionId>,
        params: serde_json::Value,
    ) -> serde_json::Result<CallId> {
        let id = self.next_call_id();
        let call = MethodCall {
            id,
            method,
            session_id: session_id.map(Into::into),
            params,
        };
        self.pending_commands.push_back(call);
        Ok(id)
    }

    /// flush any processed message and start sending the next over the conn
    /// sink
    fn start_send_next(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if self.needs_flush {
            if let Poll::Ready(Ok(())) = self.ws.poll_flush_unpin(cx) {
                self.needs_flush = false;
            }
        }
        if self.pending_flush.is_none() && !self.needs_flush {
            if self.ping_pending {
                if self.ws.poll_ready_unpin(cx).is_ready() {
                    self.ws.start_send_unpin(WsMessage::Ping(Vec::new().into()))?;
                    self.ping_pending = false;
                    self.needs_flush = true;
                }
                return Ok(());
            }
            if let Some(cmd) = self.pending_commands.pop_front() {
                tracing::trace!("Sending {:?}", cmd);
                let msg = serde_json::to_string(&cmd)?;
                self.ws.start_send_unpin(msg.into())?;
                self.pending_flush = Some(cmd);
            }
        }
        Ok(())
    }

    /// Advance the keepalive state; errors mean the peer stopped answering.
    fn poll_keepalive(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if let Some(deadline) = self.pong_deadline.as_mut() {
            if Future::poll(Pin::new(deadline), cx).is_ready() {
                return Err(CdpError::PingTimeout);
            }
        }
        if Future::poll(Pin::new(&mut self.ping_interval), cx).is_ready() {
            self.ping_interval.reset(PING_INTERVAL);
            self.ping_pending = true;
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(Delay::new(PONG_DEADLINE));
            }
        }
        Ok(())
    }
}

impl<T: EventMessage + Unpin> Stream for Connection<T> {
    type Item = Result<Message<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        if let Err(err) = pin.poll_keepalive(cx) {
            return Poll::Ready(Some(Err(err)));
        }

        loop {
            // queue in the next message if not currently flushing
            if let Err(err) = pin.start_send_next(cx) {
                return Poll::Ready(Some(Err(err)));
            }

            // send the message
            if let Some(call) = pin.pending_flush.take() {
                if pin.ws.poll_ready_unpin(cx).is_ready() {
                    pin.needs_flush = true;
                    // try another flush
                    continue;
                } else {
                    pin.pending_flush = Some(call);
                }
            }

            break;
        }

        // read from the ws
        match ready!(pin.ws.poll_next_unpin(cx)) {
            Some(Ok(WsMessage::Text(text))) => {
                let ready = match serde_json::from_str::<Message<T>>(&text) {
                    Ok(msg) => {
                        tracing::trace!("Received {:?}", msg);
                        Ok(msg)
                    }
                    Err(err) => {
                        tracing::debug!(target: "replaymux::conn::raw_ws::parse_errors", msg = %text, "Failed to parse raw WS message");
                        tracing::error!("Failed to deserialize WS response {}", err);
                        Err(err.into())
                    }
                };
                Poll::Ready(Some(ready))
            }
            Some(Ok(WsMessage::Close(_))) => Poll::Ready(None),
            Some(Ok(WsMessage::Pong(_))) => {
                pin.pong_deadline = None;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(Ok(WsMessage::Ping(_))) => {
                // tungstenite queues the matching pong internally
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(Ok(msg)) => Poll::Ready(Some(Err(CdpError::UnexpectedWsMessage(msg)))),
            Some(Err(err)) => Poll::Ready(Some(Err(CdpError::Ws(err)))),
            None => {
                // ws connection closed
                Poll::Ready(None)
            }
        }
    }
}
