//! Listener setup.
//!
//! Two independent listeners share the same handlers and differ in two
//! places only: the admin profile skips payment verification (and accepts
//! dev tx hashes), and the bot/dev HTTP routes exist only there.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

use arena_core::protocol::MAX_FRAME_BYTES;

use crate::context::ApplicationContext;
use crate::http;
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProfile {
    Public,
    Admin,
}

impl PortProfile {
    pub fn is_admin(&self) -> bool {
        matches!(self, PortProfile::Admin)
    }

    /// Dev and bot tx hashes are accepted on the admin profile only.
    pub fn allows_dev_tx(&self) -> bool {
        self.is_admin()
    }

    /// Payment verification is skipped for admin joins.
    pub fn verifies_payment(&self) -> bool {
        !self.is_admin()
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub app: Arc<ApplicationContext>,
    pub profile: PortProfile,
}

pub fn router(state: GatewayState) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws_handler))
        .merge(http::routes());
    if state.profile.is_admin() {
        router = router.merge(http::admin_routes());
    }
    router.with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| session::handle_socket(socket, state, addr))
}

pub async fn serve(
    state: GatewayState,
    port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("{:?} listener started at {}", state.profile, addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await?;
    Ok(())
}
