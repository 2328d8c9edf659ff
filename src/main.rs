use std::{io, net::SocketAddr, sync::atomic, time::Duration};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_server::{bind, Handle as ServerHandle};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use http::{
    header::{self, HeaderName},
    Method, StatusCode, Uri,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

pub use parley::*; // Re-export everything from the library crate

/// The environment variables the server is configured through; a
/// `parley.toml` next to the binary (or wherever `PARLEY_CONFIG` points) can
/// set anything else.
static ENV_KEYS: [&str; 6] = [
    "PORT",
    "ROOM_ID_SECRET",
    "ROOM_ID_ENV",
    "TURN_HOST",
    "TURN_SECRET",
    "ALLOWED_ORIGINS",
];

#[tokio::main]
async fn main() {
    clap::parse();

    // Initialize config
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("PARLEY_CONFIG").unwrap_or_else(|| "parley.toml".to_owned()),
        ))
        .merge(Env::raw().only(&ENV_KEYS));

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").unwrap()
        }
    };
    tracing::subscriber::set_global_default(registry.with(filter_layer).with(fmt_layer)).unwrap();

    // Without the MAC secret no room can be minted or joined. That is a
    // deployment mistake, surfaced at startup rather than per request.
    if config.room_id_secret.as_deref().map_or(true, str::is_empty) {
        eprintln!("ROOM_ID_SECRET is not set. Refusing to start.");
        std::process::exit(1);
    }

    info!("{config}");

    match Services::build(config) {
        Ok(services) => {
            *SERVICES.write().unwrap() = Some(Box::leak(Box::new(services)));
        }
        Err(e) => {
            eprintln!("The service container couldn't be built: {e}");
            std::process::exit(1);
        }
    }

    services().start_sweepers();

    info!("Starting server");
    run_server().await.unwrap();
}

async fn run_server() -> io::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let x_turn_token = HeaderName::from_static("x-turn-token");
    let x_sse_sid = HeaderName::from_static("x-sse-sid");

    let middlewares = ServiceBuilder::new()
        .layer(axum::middleware::from_fn(spawn_task))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
                let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                tracing::info_span!("http_request", %path)
            }),
        )
        .layer(
            // Browsers still need CORS headers to read our responses; the
            // origin gate is what actually rejects.
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::ORIGIN,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    x_turn_token,
                    x_sse_sid,
                ])
                .max_age(Duration::from_secs(86400)),
        );

    let app = routes()
        .layer(middlewares)
        .into_make_service_with_connect_info::<SocketAddr>();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    bind(addr).handle(handle).serve(app).await?;

    Ok(())
}

fn routes() -> Router {
    let facade = Router::new()
        .route("/api/room-id", post(api::mint_room_id_route))
        .route("/api/turn-credentials", post(api::turn_credentials_route))
        .route("/api/diagnostic-token", post(api::diagnostic_token_route))
        .route("/device-check", get(api::device_check_route))
        .route("/events", post(api::event_stream_post_route))
        .route("/healthz", get(healthz))
        .route("/", get(it_works))
        .layer(TimeoutLayer::new(Duration::from_secs(15)))
        .layer(DefaultBodyLimit::max(api::BODY_SIZE_LIMIT));

    // Long-lived responses: neither the socket nor the event stream gets a
    // whole-request deadline.
    let streams = Router::new()
        .route("/ws", get(api::socket_route))
        .route("/events", get(api::event_stream_route));

    facade.merge(streams).fallback(not_found)
}

async fn spawn_task(
    req: http::Request<Body>,
    next: axum::middleware::Next,
) -> std::result::Result<Response, StatusCode> {
    if services().globals.shutdown.load(atomic::Ordering::Relaxed) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    tokio::spawn(next.run(req))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    services().globals.shutdown();
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    (StatusCode::NOT_FOUND, "Unknown route")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn it_works() -> &'static str {
    "Hello from Parley!"
}
