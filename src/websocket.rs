//! WebSocket relay with per-message hooks
//!
//! After a `101 Switching Protocols` both legs are re-framed with
//! `tokio-tungstenite`. Messages flow one at a time per direction through the
//! frame interceptors.

use crate::conn::ProxyConn;
use crate::error::{Error, Result};
use crate::interceptor::{FrameKind, WsDirection, WsFrame};
use crate::server::Shared;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// View a codec message as a frame. Raw frames never surface on read.
pub(crate) fn to_frame(direction: WsDirection, message: &Message) -> Option<WsFrame> {
  let (kind, payload) = match message {
    Message::Text(text) => (FrameKind::Text, Bytes::copy_from_slice(text.as_bytes())),
    Message::Binary(data) => (FrameKind::Binary, Bytes::copy_from_slice(data)),
    Message::Ping(data) => (FrameKind::Ping, Bytes::copy_from_slice(data)),
    Message::Pong(data) => (FrameKind::Pong, Bytes::copy_from_slice(data)),
    Message::Close(close) => {
      let mut payload = Vec::new();
      if let Some(close) = close {
        payload.extend_from_slice(&u16::from(close.code).to_be_bytes());
        payload.extend_from_slice(close.reason.as_bytes());
      }
      (FrameKind::Close, Bytes::from(payload))
    }
    Message::Frame(_) => return None,
  };
  Some(WsFrame {
    direction,
    kind,
    payload,
  })
}

/// Turn a (possibly rewritten) frame back into a codec message
pub(crate) fn to_message(frame: WsFrame) -> Result<Message> {
  let payload = frame.payload;
  let message = match frame.kind {
    FrameKind::Text => {
      let text = String::from_utf8(payload.to_vec())
        .map_err(|_| Error::protocol("text frame rewritten with invalid UTF-8"))?;
      Message::Text(text.into())
    }
    FrameKind::Binary => Message::Binary(payload.to_vec().into()),
    FrameKind::Ping => Message::Ping(payload.to_vec().into()),
    FrameKind::Pong => Message::Pong(payload.to_vec().into()),
    FrameKind::Close if payload.len() >= 2 => {
      let code = u16::from_be_bytes([payload[0], payload[1]]);
      let reason = String::from_utf8_lossy(&payload[2..]).to_string();
      Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
      }))
    }
    FrameKind::Close => Message::Close(None),
  };
  Ok(message)
}

async fn pump<R, W>(
  shared: Arc<Shared>,
  direction: WsDirection,
  mut rx: R,
  mut tx: W,
  token: CancellationToken,
  idle: Duration,
) -> Result<()>
where
  R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  W: Sink<Message, Error = WsError> + Unpin,
{
  let result: Result<()> = async {
    loop {
      let next = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        next = tokio::time::timeout(idle, rx.next()) => next.map_err(|_| Error::Timeout)?,
      };
      let Some(message) = next else {
        return Ok(());
      };
      let Some(frame) = to_frame(direction, &message?) else {
        continue;
      };
      let closing = frame.kind == FrameKind::Close;
      if let Some(frame) = shared.handler.process_frame(frame).await? {
        tx.send(to_message(frame)?).await?;
      }
      if closing {
        return Ok(());
      }
    }
  }
  .await;
  token.cancel();
  let _ = tx.close().await;
  match result {
    Err(e) if e.is_closed() => Ok(()),
    other => other,
  }
}

/// Relay messages both ways until either side closes or a hook fails
pub(crate) async fn relay(shared: &Arc<Shared>, client: ProxyConn, server: ProxyConn) -> Result<()> {
  let token = client.token().clone();
  let idle = client.idle_timeout();
  tracing::debug!(peer = ?client.peer_addr(), target = ?client.option().target(), "relaying WebSocket messages");
  let (client_io, _) = client.into_parts();
  let (server_io, _) = server.into_parts();
  let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
  let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Client, None).await;
  let (client_tx, client_rx) = client_ws.split();
  let (server_tx, server_rx) = server_ws.split();

  let (send, recv) = tokio::join!(
    pump(
      shared.clone(),
      WsDirection::Send,
      client_rx,
      server_tx,
      token.clone(),
      idle
    ),
    pump(
      shared.clone(),
      WsDirection::Recv,
      server_rx,
      client_tx,
      token.clone(),
      idle
    ),
  );
  send.and(recv)
}
