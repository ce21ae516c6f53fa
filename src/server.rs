//! HTTP endpoint serving rendered frpc configuration to tunnel-client sidecars.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{info, warn};
use tokio::net::TcpListener;

use crate::{
    Result,
    render::{ApiError, RenderSettings, render_ingress},
    store::ClusterStore,
};

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<dyn ClusterStore>,
    pub settings: Arc<RenderSettings>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST);
        (status, Json(self)).into_response()
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/v1/namespaces/:namespace/ingress/:name", get(ingress_config))
        .with_state(state)
}

async fn ingress_config(
    State(state): State<ServerState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match render_ingress(state.store.as_ref(), &state.settings, &namespace, &name) {
        Ok(config) => {
            info!(
                "Rendered {} section(s) for ingress `{namespace}/{name}`",
                config.proxies.len()
            );
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], config.to_string()).into_response()
        }
        Err(e) => {
            warn!("Failed rendering ingress `{namespace}/{name}`: {} ({})", e.message, e.reason);
            e.into_response()
        }
    }
}

/// Serves the router on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving tunnel configuration on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
