use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Query},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::stream::{self, Stream};
use http::{header, HeaderMap, StatusCode};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};

use crate::{
    api::guard,
    service::{
        hub::{
            self,
            message::{self, ErrorCode},
            session::{Session, Transport},
        },
        rate_limiter::Restriction,
    },
    services, utils, Error, Result,
};

/// Comment pings keep proxies and browsers convinced the stream is alive.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Same cap as a socket frame; one message per POST.
pub const BODY_SIZE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    pub sid: Option<String>,
}

/// # `GET /events`
///
/// The half-duplex downlink. Without a `sid` this creates a fresh session;
/// with one it re-attaches to that session, kicking whatever stream held the
/// queue before. Either way the stream's first event announces the sid.
pub async fn event_stream_route(
    Query(query): Query<EventStreamQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    // The long-lived downlink is origin-gated like the socket upgrade; the
    // rate limiter sits on the POST uplink, which is the hot path.
    let ip = utils::client_ip(&headers, peer);
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !services().origin.permitted(origin, host) {
        return Err(Error::Forbidden("origin is not allowed"));
    }

    let session = match query.sid.as_deref().and_then(|sid| services().hub.resume(sid)) {
        Some(session) => session,
        None => {
            let sid = services().ids.mint_session_id();
            let session = Session::new(sid, Transport::EventStream, ip);
            services().hub.register(Arc::clone(&session));
            session
        }
    };
    session.touch();

    // The client needs its sid to address POSTs, so announce it first thing.
    session.enqueue(message::session_frame(&session.sid));

    let (epoch, kicked) = session.attach_epoch();
    let state = StreamState {
        queue: None,
        outbound: session.outbound(),
        kicked,
        _guard: GraceGuard {
            sid: session.sid.clone(),
            epoch,
        },
    };

    let sse = Sse::new(drain_queue(state))
        .keep_alive(KeepAlive::new().interval(PING_INTERVAL).text("ping"));

    Ok((
        [
            ("cache-control", "no-cache"),
            ("x-accel-buffering", "no"),
        ],
        sse,
    ))
}

struct StreamState {
    /// Held for the lifetime of the stream once acquired; a reattach takes
    /// the same receiver, so undelivered frames survive the swap.
    queue: Option<OwnedMutexGuard<mpsc::Receiver<String>>>,
    outbound: Arc<Mutex<mpsc::Receiver<String>>>,
    kicked: watch::Receiver<u64>,
    _guard: GraceGuard,
}

fn drain_queue(state: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(state, |mut state| async move {
        if state.queue.is_none() {
            let locked = {
                let outbound = Arc::clone(&state.outbound);
                tokio::select! {
                    guard = outbound.lock_owned() => Some(guard),
                    _ = state.kicked.changed() => None,
                }
            };
            match locked {
                Some(guard) => state.queue = Some(guard),
                None => return None,
            }
        }

        enum Step {
            Frame(Option<String>),
            Kicked,
        }

        let step = {
            let queue = state.queue.as_mut().expect("queue was locked above");
            tokio::select! {
                frame = queue.recv() => Step::Frame(frame),
                _ = state.kicked.changed() => Step::Kicked,
            }
        };

        match step {
            Step::Frame(Some(frame)) => {
                Some((Ok::<_, Infallible>(Event::default().data(frame)), state))
            }
            Step::Frame(None) | Step::Kicked => None,
        }
    })
}

/// Dropped when the response stream ends for any reason. The session is not
/// torn down immediately: the same sid gets a grace window to re-attach, and
/// only an unanswered window disconnects it.
struct GraceGuard {
    sid: String,
    epoch: u64,
}

impl Drop for GraceGuard {
    fn drop(&mut self) {
        let sid = std::mem::take(&mut self.sid);
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(hub::GRACE_WINDOW).await;
            services().hub.grace_expired(&sid, epoch);
        });
    }
}

/// # `POST /events`
///
/// The half-duplex uplink: one protocol message per request, dispatched as
/// if it had arrived on the bound session's own wire.
pub async fn event_stream_post_route(
    Query(query): Query<EventStreamQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode> {
    guard(Restriction::EventStreamPost, &headers, peer)?;

    let sid = headers
        .get("x-sse-sid")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query.sid.clone());
    let Some(sid) = sid else {
        return Err(Error::BadRequest(ErrorCode::BadRequest, "missing session id"));
    };

    let Some(session) = services().hub.session(&sid) else {
        return Err(Error::Gone("unknown or expired session id"));
    };
    if session.transport != Transport::EventStream {
        return Err(Error::BadRequest(
            ErrorCode::BadRequest,
            "session is not an event-stream session",
        ));
    }

    services().hub.deliver(&session, &body);
    Ok(StatusCode::NO_CONTENT)
}
