use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use tokio::time::{interval, timeout};
use tracing::debug;

use crate::{
    api::guard,
    service::{
        hub::session::{Session, Transport},
        rate_limiter::Restriction,
    },
    services, Result,
};

/// One protocol message per text frame, capped well below anything a sane
/// SDP or candidate blob needs.
pub const FRAME_SIZE_LIMIT: usize = 64 * 1024;

/// Just under the read deadline so a silent but healthy peer always has a
/// ping to answer before it would be considered dead.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// # `GET /ws`
///
/// The full-duplex transport: one persistent socket per session.
pub async fn socket_route(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let ip = guard(Restriction::SocketUpgrade, &headers, peer)?;

    Ok(ws
        .max_message_size(FRAME_SIZE_LIMIT)
        .max_frame_size(FRAME_SIZE_LIMIT)
        .on_upgrade(move |socket| handle_socket(socket, ip)))
}

async fn handle_socket(socket: WebSocket, ip: IpAddr) {
    let sid = services().ids.mint_session_id();
    let session = Session::new(sid, Transport::Socket, ip);
    services().hub.register(Arc::clone(&session));

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the session queue onto the wire and owns the heartbeat.
    // Frames go out one message per frame with a hard per-frame deadline.
    let (_, mut kicked) = session.attach_epoch();
    let outbound = session.outbound();
    let writer = tokio::spawn(async move {
        let mut queue = outbound.lock_owned().await;
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                frame = queue.recv() => {
                    let Some(frame) = frame else { break };
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(frame))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
                _ = kicked.changed() => break,
            }
        }
    });

    // Read loop: every frame (including the pong answering our ping) pushes
    // the deadline out again.
    loop {
        match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(sid = %session.sid, "socket read deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                debug!(sid = %session.sid, %error, "socket read failed");
                break;
            }
            Ok(Some(Ok(Message::Text(raw)))) => services().hub.deliver(&session, &raw),
            Ok(Some(Ok(Message::Close(_)))) => break,
            // Pings are answered by axum itself; pongs and binary frames
            // only count as liveness.
            Ok(Some(Ok(_))) => {}
        }
    }

    // Exactly one hub disconnect per session, whichever way the socket died.
    // The epoch bump inside wakes the writer if it is still parked.
    services().hub.disconnect(&session);
    writer.await.ok();
}
