//! WebSocket transport: the mesh listener, outbound dials and the
//! per-connection reader/writer pair.
//!
//! Every connection gets its own writer task draining the link's command
//! queue, so a stalled peer never holds up the others. Inbound text frames
//! go through [`Mesh::process_frame`] in arrival order.

use super::link::{LinkCommand, PeerLink, CLOSE_NORMAL, CLOSE_TOO_LARGE};
use crate::network::{ConnectionState, FrameOutcome, Mesh};
use crate::utils::{MeshConfig, NetworkError, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// How long a closing connection waits for its writer to flush
const WRITER_DRAIN: Duration = Duration::from_secs(2);

fn ws_config(config: &MeshConfig) -> WebSocketConfig {
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(config.network.max_frame_bytes);
    ws.max_frame_size = Some(config.network.max_frame_bytes);
    ws
}

/// Accept mesh connections until the listener fails
pub async fn serve(mesh: Arc<Mesh>, listener: TcpListener) -> Result<()> {
    info!("Mesh listener on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {e}");
                continue;
            }
        };

        let mesh = Arc::clone(&mesh);
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async_with_config(
                stream,
                Some(ws_config(mesh.config())),
            )
            .await
            {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket handshake with {addr} failed: {e}");
                    return;
                }
            };

            let (link, rx) = PeerLink::channel(mesh.next_link_id(), None);
            debug!("Accepted {addr} as link {}", link.id());
            let conn = ConnectionState::inbound(link, &mesh.config().limits);
            run_connection(mesh, ws, conn, rx).await;
        });
    }
}

/// Open a connection to `url`.
///
/// The connection starts past the handshake gate, since we are the side
/// that says hello. `key_hint` verifies frames from a sender whose key is
/// not known yet (an introducer's welcome).
pub async fn dial(mesh: &Arc<Mesh>, url: &str, key_hint: Option<String>) -> Result<Arc<PeerLink>> {
    let timeout = Duration::from_secs(mesh.config().network.connect_timeout_secs.max(1));
    let connecting =
        tokio_tungstenite::connect_async_with_config(url, Some(ws_config(mesh.config())), false);

    let (ws, _response) = tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: format!("connect to {url}"),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            peer: url.to_string(),
            reason: e.to_string(),
        })?;

    let (link, rx) = PeerLink::channel(mesh.next_link_id(), Some(url.to_string()));
    debug!("Connected to {url} as link {}", link.id());
    let conn = ConnectionState::outbound(Arc::clone(&link), &mesh.config().limits, key_hint);
    tokio::spawn(run_connection(Arc::clone(mesh), ws, conn, rx));
    Ok(link)
}

async fn run_connection<S>(
    mesh: Arc<Mesh>,
    ws: WebSocketStream<S>,
    mut conn: ConnectionState,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link = Arc::clone(&conn.link);
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(write_loop(sink, rx, link.id()));

    loop {
        tokio::select! {
            () = link.closed() => break,
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    if let FrameOutcome::Close { code, reason } = mesh.process_frame(&mut conn, &text).await {
                        info!("Closing link {} ({code}: {reason})", link.id());
                        link.close(code, reason);
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Link {} closed by peer: {frame:?}", link.id());
                    break;
                }
                Some(Ok(other)) => trace!("Ignoring non-text message on link {}: {other:?}", link.id()),
                Some(Err(e)) => {
                    debug!("Link {} read error: {e}", link.id());
                    if let Some((code, reason)) = close_for_read_error(&e) {
                        link.close(code, reason);
                    }
                    break;
                }
                None => break,
            }
        }
    }

    mesh.unregister_link(link.id()).await;
    link.close(CLOSE_NORMAL, "closing");
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!("Writer for link {} did not finish in time", link.id());
    }
}

/// Close code owed to the peer for a read error, if any
fn close_for_read_error(error: &WsError) -> Option<(u16, &'static str)> {
    match error {
        WsError::Capacity(CapacityError::MessageTooLong { .. }) => Some((CLOSE_TOO_LARGE, "payload too large")),
        _ => None,
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
    link_id: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            LinkCommand::Send(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("Link {link_id} write error: {e}");
                    break;
                }
            }
            LinkCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    trace!("Link {link_id} close frame not sent: {e}");
                }
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        trace!("Link {link_id} sink close: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::node;
    use crate::crypto::signing::test_keys;

    #[test]
    fn test_ws_config_uses_frame_limit() {
        let mut config = MeshConfig::default();
        config.network.max_frame_bytes = 4096;
        let ws = ws_config(&config);
        assert_eq!(ws.max_message_size, Some(4096));
        assert_eq!(ws.max_frame_size, Some(4096));
    }

    #[test]
    fn test_oversized_read_closes_with_too_large() {
        let too_long = WsError::Capacity(CapacityError::MessageTooLong { size: 8192, max_size: 4096 });
        assert_eq!(close_for_read_error(&too_long), Some((CLOSE_TOO_LARGE, "payload too large")));
        assert_eq!(close_for_read_error(&WsError::ConnectionClosed), None);
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_failed() {
        let (a, _) = node(test_keys::key_a());
        let err = dial(&a, "ws://127.0.0.1:1", None).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
