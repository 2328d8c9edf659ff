mod device_check;
mod event_stream;
mod room_id;
mod socket;
mod turn;

pub use device_check::*;
pub use event_stream::*;
pub use room_id::*;
pub use socket::*;
pub use turn::*;

use std::net::{IpAddr, SocketAddr};

use http::{header, HeaderMap};

use crate::{service::rate_limiter::Restriction, services, utils, Error, Result};

/// Shared entry check: origin gate first, then the per-IP token bucket.
/// Returns the client address the rest of the handler should attribute the
/// request to.
pub(crate) fn guard(
    restriction: Restriction,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Result<IpAddr> {
    let ip = utils::client_ip(headers, peer);

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !services().origin.permitted(origin, host) {
        return Err(Error::Forbidden("origin is not allowed"));
    }

    services().rate_limiter.check(restriction, ip)?;
    Ok(ip)
}
