use std::net::SocketAddr;

use axum::{extract::ConnectInfo, Json};
use http::HeaderMap;
use serde::Serialize;

use crate::{api::guard, service::rate_limiter::Restriction, services, Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomIdResponse {
    pub room_id: String,
}

/// # `POST /api/room-id`
///
/// Mints a fresh self-authenticating room id. No auth: the id itself is the
/// capability, and the rate limiter bounds how fast anyone can collect them.
pub async fn mint_room_id_route(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<RoomIdResponse>> {
    guard(Restriction::RoomIdMint, &headers, peer)?;

    let room_id = services()
        .ids
        .mint_room_id()
        .map_err(|_| Error::bad_config("room id secret is not configured"))?;

    Ok(Json(RoomIdResponse { room_id }))
}
