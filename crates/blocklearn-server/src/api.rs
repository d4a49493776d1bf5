use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method},
    middleware,
    routing::get,
    Json, Router,
};
use blocklearn_shared::constants::{PROTOCOL_VERSION, SIGNALING_PATH};
use blocklearn_shared::{PeerId, RoomKey};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, Quota, RateLimiter};
use crate::rooms::{RoomRegistry, RoomStats};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomRegistry,
    pub http_limiter: RateLimiter,
    pub frame_limiter: RateLimiter<PeerId>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: RoomRegistry::new(config.max_room_size, config.relay_echo),
            http_limiter: RateLimiter::new(Quota {
                rate: config.http_rate,
                burst: config.http_burst,
            }),
            frame_limiter: RateLimiter::new(Quota {
                rate: config.frame_rate,
                burst: config.frame_burst,
            }),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

fn cors(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);
    if config.allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(SIGNALING_PATH, get(ws_handler))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/rooms", get(list_rooms))
        .route("/rooms/:room", get(room_detail))
        .layer(middleware::from_fn_with_state(
            state.http_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    max_room_size: usize,
    relay_echo: bool,
    rooms: usize,
    connections: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct RoomsResponse {
    rooms: Vec<RoomStats>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        max_room_size: state.config.max_room_size,
        relay_echo: state.config.relay_echo,
        rooms: state.rooms.stats().await.len(),
        connections: state.rooms.connection_count().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn list_rooms(State(state): State<AppState>) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.rooms.stats().await,
    })
}

async fn room_detail(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<RoomStats>, ServerError> {
    let room = RoomKey::from_raw(room);
    state
        .rooms
        .room_stats(&room)
        .await
        .map(Json)
        .ok_or(ServerError::UnknownRoom(room))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting signaling relay");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
