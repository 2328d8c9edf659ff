//! The wire protocol: a flat JSON envelope whose `type` selects the payload.
//! The envelope is validated strictly; payloads are parsed tolerantly so
//! unknown inner fields never abort a message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u64 = 1;

/// Everything a client may put at the top level. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub v: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub rid: Option<String>,
    pub sid: Option<String>,
    pub cid: Option<String>,
    pub to: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default)]
    pub capabilities: Option<Value>,
    #[serde(default)]
    pub reconnect_cid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchRoomsPayload {
    #[serde(default)]
    pub rids: Vec<String>,
}

/// Tolerant payload extraction: a missing or malformed payload degrades to
/// the default rather than rejecting the whole message.
pub fn parse_payload<T: Default + for<'de> Deserialize<'de>>(envelope: &Envelope) -> T {
    envelope
        .payload
        .as_ref()
        .and_then(|payload| serde_json::from_value(payload.clone()).ok())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    BadRequest,
    UnsupportedVersion,
    InvalidRoomId,
    ServerNotConfigured,
    RoomFull,
    NotHost,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::InvalidRoomId => "INVALID_ROOM_ID",
            ErrorCode::ServerNotConfigured => "SERVER_NOT_CONFIGURED",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NotHost => "NOT_HOST",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    fn retryable(self) -> Option<bool> {
        matches!(self, ErrorCode::Internal).then_some(true)
    }
}

#[derive(Debug, Serialize)]
struct ServerEnvelope<'a, P: Serialize> {
    v: u64,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<P>,
}

impl<'a, P: Serialize> ServerEnvelope<'a, P> {
    fn new(kind: &'a str, payload: P) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            rid: None,
            sid: None,
            cid: None,
            payload: Some(payload),
        }
    }

    fn rid(mut self, rid: &'a str) -> Self {
        self.rid = Some(rid);
        self
    }

    fn frame(&self) -> String {
        serde_json::to_string(self).expect("message is valid, we just created it")
    }
}

#[derive(Debug, Serialize)]
pub struct Participant<'a> {
    pub cid: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinedPayload<'a> {
    host_cid: &'a str,
    participants: Vec<Participant<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_token_expires_at: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomStatePayload<'a> {
    host_cid: &'a str,
    participants: Vec<Participant<'a>>,
}

#[derive(Debug, Serialize)]
struct RoomEndedPayload<'a> {
    by: &'a str,
    reason: &'static str,
}

#[derive(Debug, Serialize)]
struct CountPayload {
    count: usize,
}

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

/// Announces the server-minted `sid` as the first event on a fresh
/// event-stream attach, so the client can address its POSTs.
pub fn session_frame(sid: &str) -> String {
    ServerEnvelope::<'_, ()> {
        v: PROTOCOL_VERSION,
        kind: "session",
        rid: None,
        sid: Some(sid),
        cid: None,
        payload: None,
    }
    .frame()
}

pub fn error_frame(code: ErrorCode, message: &str) -> String {
    ServerEnvelope::new(
        "error",
        ErrorPayload {
            code: code.as_str(),
            message,
            retryable: code.retryable(),
        },
    )
    .frame()
}

pub fn joined_frame(
    rid: &str,
    sid: &str,
    cid: &str,
    host_cid: &str,
    participants: &[String],
    turn_token: Option<&(String, u64)>,
) -> String {
    let mut envelope = ServerEnvelope::new(
        "joined",
        JoinedPayload {
            host_cid,
            participants: participant_list(participants),
            turn_token: turn_token.map(|(token, _)| token.as_str()),
            turn_token_expires_at: turn_token.map(|(_, expires_at)| *expires_at),
        },
    )
    .rid(rid);
    envelope.sid = Some(sid);
    envelope.cid = Some(cid);
    envelope.frame()
}

pub fn room_state_frame(rid: &str, host_cid: &str, participants: &[String]) -> String {
    ServerEnvelope::new(
        "room_state",
        RoomStatePayload {
            host_cid,
            participants: participant_list(participants),
        },
    )
    .rid(rid)
    .frame()
}

pub fn room_ended_frame(rid: &str, by: &str) -> String {
    ServerEnvelope::new(
        "room_ended",
        RoomEndedPayload {
            by,
            reason: "host_ended",
        },
    )
    .rid(rid)
    .frame()
}

pub fn room_statuses_frame(counts: &BTreeMap<String, usize>) -> String {
    ServerEnvelope::new("room_statuses", counts).frame()
}

pub fn room_status_update_frame(rid: &str, count: usize) -> String {
    ServerEnvelope::new("room_status_update", CountPayload { count })
        .rid(rid)
        .frame()
}

/// Forwarded `offer`/`answer`/`ice` keep their payload verbatim apart from
/// the injected `from`.
pub fn relay_frame(kind: &str, rid: &str, payload: Value) -> String {
    ServerEnvelope::new(kind, payload).rid(rid).frame()
}

fn participant_list(cids: &[String]) -> Vec<Participant<'_>> {
    cids.iter().map(|cid| Participant { cid }).collect()
}
