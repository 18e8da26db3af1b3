//! `WebSocket` session lifecycle: one client from upgrade through teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_frame;
use super::heartbeat::HealthMonitor;
use crate::gateway::Gateway;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Outbound frames buffered per connection before sends start dropping.
const OUTBOUND_QUEUE: usize = 1024;

/// How long a fresh connection may stay unidentified.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a `WebSocket` session for a connected client.
///
/// 1. Spawns a writer task that drains the outbound queue and sends
///    transport pings at the bot or human cadence
/// 2. Decodes inbound frames and dispatches them through the gateway
/// 3. Closes unidentified connections after [`IDENTIFY_TIMEOUT`]
/// 4. Tears the connection down through [`Gateway::disconnect`]
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(ws: WebSocket, gateway: Arc<Gateway>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(OUTBOUND_QUEUE);
    let conn = Arc::new(ClientConnection::new(send_tx));
    let _ = tracing::Span::current().record("conn_id", conn.id.as_str());

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(run_writer(
        ws_tx,
        send_rx,
        conn.clone(),
        gateway.health().clone(),
    ));

    let shutdown = gateway.shutdown().token();
    let identify_deadline = sleep_until(Instant::now() + IDENTIFY_TIMEOUT);
    tokio::pin!(identify_deadline);

    let reason = loop {
        tokio::select! {
            () = conn.closed() => break "closed",
            () = shutdown.cancelled() => break "shutdown",
            () = &mut identify_deadline, if conn.identity().is_none() => {
                info!("no identify before deadline");
                break "identify_timeout";
            }
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "read failed");
                        break "read_error";
                    }
                    None => break "eof",
                };
                let text = match msg {
                    Message::Text(ref t) => Some(t.to_string()),
                    Message::Binary(ref data) => {
                        if let Ok(s) = std::str::from_utf8(data) {
                            Some(s.to_owned())
                        } else {
                            info!(len = data.len(), "received non-UTF8 binary frame");
                            None
                        }
                    }
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break "client_close";
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        conn.mark_alive();
                        None
                    }
                };
                let Some(text) = text else { continue };

                let outcome = handle_frame(&gateway, &conn, &text).await;
                if let Some(reply) = outcome.reply
                    && !conn.send(Arc::new(reply))
                {
                    warn!("failed to enqueue reply (channel full or closed)");
                }
                if outcome.close {
                    break "rejected";
                }
            }
        }
    };

    gateway.disconnect(&conn, reason);

    // Let the writer flush what is queued and send the close frame
    let write_timeout = gateway.health().ping_write_timeout();
    if tokio::time::timeout(write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(reason, user_id = ?conn.user_id(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
}

/// Drain the outbound queue onto the socket, pinging on the connection's
/// cadence. On close, flush what is queued and send a close frame.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<ClientConnection>,
    health: HealthMonitor,
) {
    let mut last_ping = Instant::now();

    loop {
        // Re-read every turn: the cadence changes once a bot identifies
        let next_ping = next_ping_at(last_ping, &health, &conn);
        tokio::select! {
            biased;
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text((*text).clone().into())).await.is_err() {
                    conn.close();
                    break;
                }
            }
            () = conn.closed() => {
                while let Ok(text) = send_rx.try_recv() {
                    if ws_tx.send(Message::Text((*text).clone().into())).await.is_err() {
                        return;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            () = sleep_until(next_ping) => {
                let sent = tokio::time::timeout(
                    health.ping_write_timeout(),
                    ws_tx.send(Message::Ping(Bytes::new())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    warn!(conn_id = %conn.id, "ping write failed, closing");
                    conn.close();
                    break;
                }
                last_ping = Instant::now();
            }
        }
    }
}

/// When the next transport ping is due after one sent at `last_ping`.
fn next_ping_at(last_ping: Instant, health: &HealthMonitor, conn: &ClientConnection) -> Instant {
    last_ping + health.ping_interval(conn.is_bot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_connection, identity};
    use parlor_settings::GatewaySettings;

    #[test]
    fn ping_cadence_follows_identity() {
        let settings = GatewaySettings::default();
        let health = HealthMonitor::new(&settings);
        let (conn, _rx) = fake_connection();
        let start = Instant::now();

        assert_eq!(
            next_ping_at(start, &health, &conn),
            start + Duration::from_millis(settings.human_ping_interval_ms)
        );

        assert!(conn.bind_identity(identity("dicebot", true)));
        assert_eq!(
            next_ping_at(start, &health, &conn),
            start + Duration::from_millis(settings.bot_ping_interval_ms)
        );
    }
}
