use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{service::ids::RoomIdError, service::tokens::TokenKind, services};

pub mod message;
pub mod room;
pub mod session;

use message::{Envelope, ErrorCode, JoinPayload, WatchRoomsPayload};
use room::Room;
use session::{Membership, Session, Transport};

/// A lost event-stream keeps its session (and room slot) this long, waiting
/// for the same sid to reattach.
pub const GRACE_WINDOW: Duration = Duration::from_secs(5);

/// Event-stream sessions idle longer than this are evicted by the reaper.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Reaper cadence.
pub const REAP_INTERVAL: Duration = Duration::from_secs(15);

/// The signaling hub: the global session registry, the rooms, the watch-sets,
/// and the message loop every transport feeds into.
///
/// Locking is two-tier: the registry locks below are taken before any
/// per-room lock, never the other way around, and nothing is ever enqueued
/// while either is held.
pub struct Service {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    watchers: RwLock<HashMap<String, HashSet<String>>>,
}

impl Service {
    pub fn build() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, session: Arc<Session>) {
        debug!(sid = %session.sid, transport = ?session.transport, "session registered");
        self.sessions
            .write()
            .unwrap()
            .insert(session.sid.clone(), session);
    }

    pub fn session(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(sid).cloned()
    }

    /// An event-stream client re-attaching under its old sid. The previous
    /// stream is kicked off the queue by the epoch bump; the queue itself is
    /// untouched, so nothing enqueued meanwhile is lost.
    pub fn resume(&self, sid: &str) -> Option<Arc<Session>> {
        let session = self.session(sid)?;
        if session.transport != Transport::EventStream {
            return None;
        }

        info!(sid = %session.sid, "event-stream session resumed");
        session.bump_epoch();
        session.touch();
        Some(session)
    }

    /// The message loop entry point: one raw frame from one session.
    #[tracing::instrument(skip_all, fields(sid = %session.sid))]
    pub fn deliver(&self, session: &Arc<Session>, raw: &str) {
        session.touch();

        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(%error, "dropping non-JSON message");
                session.enqueue(message::error_frame(
                    ErrorCode::BadRequest,
                    "message is not valid JSON",
                ));
                return;
            }
        };

        if envelope.v != Some(message::PROTOCOL_VERSION) {
            session.enqueue(message::error_frame(
                ErrorCode::UnsupportedVersion,
                "only protocol version 1 is supported",
            ));
            return;
        }

        match envelope.kind.as_deref() {
            Some("join") => self.join(session, &envelope),
            Some("leave") => self.leave(session),
            Some("end_room") => self.end_room(session),
            Some(kind @ ("offer" | "answer" | "ice")) => self.relay(session, kind, &envelope),
            Some("watch_rooms") => self.watch_rooms(session, &envelope),
            // Advances server-side liveness, which deliver() already did.
            Some("ping") => {}
            Some(kind) => debug!(kind, "dropping message of unknown type"),
            None => session.enqueue(message::error_frame(
                ErrorCode::BadRequest,
                "message has no type",
            )),
        }
    }

    fn join(&self, session: &Arc<Session>, envelope: &Envelope) {
        let Some(rid) = envelope.rid.as_deref() else {
            session.enqueue(message::error_frame(
                ErrorCode::BadRequest,
                "join requires a rid",
            ));
            return;
        };
        let payload: JoinPayload = message::parse_payload(envelope);

        // Graceful switch: joining while in a room leaves the old room first.
        if session.membership().is_some() {
            self.remove_from_room(session);
        }

        match services().ids.validate_room_id(rid) {
            Ok(()) => {}
            Err(RoomIdError::NotConfigured) => {
                session.enqueue(message::error_frame(
                    ErrorCode::ServerNotConfigured,
                    "no room id secret is configured",
                ));
                return;
            }
            Err(RoomIdError::Invalid) => {
                session.enqueue(message::error_frame(
                    ErrorCode::InvalidRoomId,
                    "room id failed validation",
                ));
                return;
            }
        }

        let room = {
            let mut rooms = self.rooms.write().unwrap();
            Arc::clone(rooms.entry(rid.to_owned()).or_insert_with(Room::new))
        };

        // Phase one: evict the ghost this client claims to have been. Its
        // cid is reused below so host identity and offer/answer roles
        // survive the reconnect.
        let mut reuse_cid = None;
        if let Some(reconnect_cid) = payload.reconnect_cid.as_deref() {
            let ghost_sid = {
                let mut state = room.lock();
                let ghost = state
                    .participants
                    .iter()
                    .position(|(sid, cid)| cid == reconnect_cid && *sid != session.sid);
                ghost.map(|index| {
                    let (sid, cid) = state.participants.remove(index);
                    reuse_cid = Some(cid);
                    sid
                })
            };

            if let Some(ghost_sid) = ghost_sid {
                info!(ghost = %ghost_sid, cid = ?reuse_cid, "evicted ghost participant");
                if let Some(ghost) = self.session(&ghost_sid) {
                    ghost.mark_replaced();
                    *ghost.membership.lock().unwrap() = None;
                }
            }
        }

        // Phase two: the room lock was released above, so capacity must be
        // re-checked under a fresh acquisition; another join may have raced
        // into the freed slot.
        let (cid, host_cid, participants) = {
            let mut state = room.lock();
            if state.is_full() {
                // If the ghost we evicted was the host, the racing join left
                // the host slot orphaned; hand it to a live participant.
                if let Some(host) = state.host_cid.clone() {
                    if !state.participants.iter().any(|(_, cid)| *cid == host) {
                        state.host_cid = state.participants.first().map(|(_, cid)| cid.clone());
                    }
                }
                drop(state);
                session.enqueue(message::error_frame(
                    ErrorCode::RoomFull,
                    "room already has two participants",
                ));
                return;
            }

            let cid = reuse_cid.unwrap_or_else(|| services().ids.mint_client_id());
            state.participants.push((session.sid.clone(), cid.clone()));
            let host_missing = state
                .host_cid
                .as_ref()
                .map_or(true, |host| !state.participants.iter().any(|(_, cid)| cid == host));
            if host_missing {
                state.host_cid = Some(cid.clone());
            }
            let host_cid = state.host_cid.clone().expect("host was just set");
            (cid, host_cid, state.cids())
        };

        *session.membership.lock().unwrap() = Some(Membership {
            rid: rid.to_owned(),
            cid: cid.clone(),
        });

        // Relay access is gated by having actually joined a room.
        let turn_token = services()
            .globals
            .turn()
            .map(|_| services().tokens.issue(session.ip, TokenKind::Call));

        info!(rid, cid = %cid, "session joined room");

        // `joined` first, then the broadcast: the joiner observes its own
        // `joined` before any `room_state` listing it.
        session.enqueue(message::joined_frame(
            rid,
            &session.sid,
            &cid,
            &host_cid,
            &participants,
            turn_token.as_ref(),
        ));
        self.broadcast_room_state(rid, &room);
        self.notify_watchers(rid);
    }

    /// Idempotent: leaving twice removes once and then does nothing.
    fn leave(&self, session: &Arc<Session>) {
        self.remove_from_room(session);
    }

    fn end_room(&self, session: &Arc<Session>) {
        let Some(Membership { rid, cid }) = session.membership() else {
            session.enqueue(message::error_frame(
                ErrorCode::NotHost,
                "only the host of a room can end it",
            ));
            return;
        };
        let Some(room) = self.rooms.read().unwrap().get(&rid).cloned() else {
            return;
        };

        let members = {
            let mut state = room.lock();
            if state.host_cid.as_deref() != Some(cid.as_str()) {
                drop(state);
                session.enqueue(message::error_frame(
                    ErrorCode::NotHost,
                    "only the host of a room can end it",
                ));
                return;
            }
            state.host_cid = None;
            std::mem::take(&mut state.participants)
        };

        {
            let mut rooms = self.rooms.write().unwrap();
            if let Some(current) = rooms.get(&rid) {
                if Arc::ptr_eq(current, &room) {
                    rooms.remove(&rid);
                }
            }
        }

        info!(rid = %rid, by = %cid, "room ended by host");

        let frame = message::room_ended_frame(&rid, &cid);
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            members
                .iter()
                .filter_map(|(sid, _)| sessions.get(sid).cloned())
                .collect()
        };
        for target in targets {
            *target.membership.lock().unwrap() = None;
            target.enqueue(frame.clone());
        }

        self.notify_watchers(&rid);
    }

    /// `offer`/`answer`/`ice` pass through untouched apart from the injected
    /// `payload.from`. Senders outside a room are dropped with a log only.
    fn relay(&self, session: &Arc<Session>, kind: &str, envelope: &Envelope) {
        let Some(Membership { rid, cid }) = session.membership() else {
            debug!(kind, "dropping relay from session outside any room");
            return;
        };
        let Some(room) = self.rooms.read().unwrap().get(&rid).cloned() else {
            debug!(kind, rid = %rid, "dropping relay into a room that no longer exists");
            return;
        };

        let peers: Vec<(String, String)> = {
            let state = room.lock();
            if state.cid_of(&session.sid).is_none() {
                debug!(kind, rid = %rid, "dropping relay from a non-participant");
                return;
            }
            state
                .participants
                .iter()
                .filter(|(sid, _)| *sid != session.sid)
                .cloned()
                .collect()
        };

        let mut payload = match envelope.payload.clone() {
            Some(payload @ Value::Object(_)) => payload,
            _ => Value::Object(serde_json::Map::new()),
        };
        payload
            .as_object_mut()
            .expect("payload was made an object above")
            .insert("from".to_owned(), json!(cid));

        let frame = message::relay_frame(kind, &rid, payload);

        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            peers
                .iter()
                .filter(|(_, peer_cid)| match envelope.to.as_deref() {
                    Some(to) => peer_cid == to,
                    None => true,
                })
                .filter_map(|(sid, _)| sessions.get(sid).cloned())
                .collect()
        };
        for target in targets {
            target.enqueue(frame.clone());
        }
    }

    fn watch_rooms(&self, session: &Arc<Session>, envelope: &Envelope) {
        let payload: WatchRoomsPayload = message::parse_payload(envelope);

        let valid: Vec<String> = payload
            .rids
            .into_iter()
            .filter(|rid| {
                let ok = services().ids.validate_room_id(rid).is_ok();
                if !ok {
                    debug!(rid = %rid, "skipping invalid rid in watch_rooms");
                }
                ok
            })
            .collect();

        {
            let mut watchers = self.watchers.write().unwrap();
            for rid in &valid {
                watchers
                    .entry(rid.clone())
                    .or_default()
                    .insert(session.sid.clone());
            }
        }

        let counts: BTreeMap<String, usize> = valid
            .into_iter()
            .map(|rid| {
                let count = self.room_count(&rid);
                (rid, count)
            })
            .collect();

        session.enqueue(message::room_statuses_frame(&counts));
    }

    /// Transport teardown. Runs the full cleanup exactly once no matter how
    /// many paths race into it.
    #[tracing::instrument(skip_all, fields(sid = %session.sid))]
    pub fn disconnect(&self, session: &Arc<Session>) {
        if session.mark_closed() {
            return;
        }

        info!("session disconnected");
        session.bump_epoch();

        self.sessions.write().unwrap().remove(&session.sid);
        self.watchers.write().unwrap().retain(|_, watching| {
            watching.remove(&session.sid);
            !watching.is_empty()
        });

        self.remove_from_room(session);
    }

    /// The lost-stream grace window ran out. If the sid has not re-attached
    /// in the meantime (which bumps the epoch), the session is gone for good.
    pub fn grace_expired(&self, sid: &str, epoch: u64) {
        let Some(session) = self.session(sid) else {
            return;
        };
        if session.current_epoch() == epoch {
            info!(sid, "grace window elapsed without reattach");
            self.disconnect(&session);
        }
    }

    /// Evicts event-stream sessions whose client has stopped reading and
    /// posting. Socket sessions have their own keepalive and are left alone.
    pub fn reap_stale_sessions(&self) {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| {
                session.transport == Transport::EventStream && session.idle_for() > STALE_AFTER
            })
            .cloned()
            .collect();

        for session in stale {
            info!(sid = %session.sid, "evicting stale event-stream session");
            self.disconnect(&session);
        }
    }

    fn room_count(&self, rid: &str) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(rid)
            .map_or(0, |room| room.lock().participants.len())
    }

    /// Removal per the shared contract of `leave`, disconnect, and the
    /// graceful switch in `join`: host transfer, empty-room deletion,
    /// `room_state` to whoever remains, watcher fan-out always.
    fn remove_from_room(&self, session: &Arc<Session>) {
        let Some(Membership { rid, .. }) = session.membership.lock().unwrap().take() else {
            return;
        };
        let Some(room) = self.rooms.read().unwrap().get(&rid).cloned() else {
            return;
        };

        let now_empty = {
            let mut state = room.lock();
            state.remove(&session.sid);
            state.participants.is_empty()
        };

        if now_empty {
            // Empty rooms are not retained. Re-check under both locks: a
            // concurrent join may have repopulated the room meanwhile.
            let mut rooms = self.rooms.write().unwrap();
            if let Some(current) = rooms.get(&rid) {
                if Arc::ptr_eq(current, &room) && current.lock().participants.is_empty() {
                    rooms.remove(&rid);
                }
            }
        } else {
            self.broadcast_room_state(&rid, &room);
        }

        self.notify_watchers(&rid);
    }

    /// Snapshot under the room lock, send with it released.
    fn broadcast_room_state(&self, rid: &str, room: &Arc<Room>) {
        let (host_cid, members, cids) = {
            let state = room.lock();
            let members: Vec<String> = state.participants.iter().map(|(sid, _)| sid.clone()).collect();
            (state.host_cid.clone(), members, state.cids())
        };
        let Some(host_cid) = host_cid else {
            return;
        };

        let frame = message::room_state_frame(rid, &host_cid, &cids);
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            members
                .iter()
                .filter_map(|sid| sessions.get(sid).cloned())
                .collect()
        };
        for target in targets {
            target.enqueue(frame.clone());
        }
    }

    /// Occupancy fan-out, also snapshot-then-send so a slow watcher cannot
    /// hold up a membership change.
    fn notify_watchers(&self, rid: &str) {
        let watching: Vec<String> = self
            .watchers
            .read()
            .unwrap()
            .get(rid)
            .map(|watching| watching.iter().cloned().collect())
            .unwrap_or_default();
        if watching.is_empty() {
            return;
        }

        let frame = message::room_status_update_frame(rid, self.room_count(rid));
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            watching
                .iter()
                .filter_map(|sid| sessions.get(sid).cloned())
                .collect()
        };
        for target in targets {
            target.enqueue(frame.clone());
        }
    }
}
