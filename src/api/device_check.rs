use axum::response::Html;

/// # `GET /device-check`
///
/// Static diagnostic page: camera/microphone permission probe plus a TURN
/// reachability check driven by a diagnostic token.
pub async fn device_check_route() -> Html<&'static str> {
    Html(include_str!("device_check.html"))
}
