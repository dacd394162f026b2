// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Main server implementation

use crate::auth::{auth_middleware, AuthConfig};
use crate::error::{ServerError, ServerResult};
use crate::handlers;
use crate::state::AppState;
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use relay_core::{DeviceSigner, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// OpenAI-compatible relay server
pub struct Server {
    config: RelayConfig,
    state: AppState,
    app: Router,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: RelayConfig, signer: Arc<dyn DeviceSigner>) -> ServerResult<Self> {
        config.validate()?;
        let state = AppState::new(config.clone(), signer);
        Ok(Self::with_state(config, state))
    }

    /// Construct a server from an already-built app state
    pub fn with_state(config: RelayConfig, state: AppState) -> Self {
        let app = Self::build_app(state.clone(), &config);
        Self {
            config,
            state,
            app,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the Axum application with routes and middleware
    fn build_app(state: AppState, config: &RelayConfig) -> Router {
        let middleware_stack = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http());

        let auth = AuthConfig {
            api_key: config.server.api_key.clone(),
        };
        if auth.requires_auth() {
            info!("Client API key required on /v1 routes");
        }

        let api_routes = Router::new()
            .route("/chat/completions", post(handlers::chat::chat_completions))
            .route("/models", get(handlers::models::list_models))
            .route_layer(from_fn(move |req, next| {
                auth_middleware(auth.clone(), req, next)
            }));

        let app = Router::new()
            .route("/healthz", get(handlers::health::health_check))
            .route("/readyz", get(handlers::health::readiness_check))
            .nest("/v1", api_routes)
            .with_state(state)
            .layer(middleware_stack);

        if config.server.enable_cors {
            app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        } else {
            app
        }
    }

    /// Token that triggers graceful shutdown when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(self) -> ServerResult<()> {
        let addr: SocketAddr = self.config.server.bind_addr.parse().map_err(|e| {
            ServerError::Internal(format!(
                "invalid bind address '{}': {e}",
                self.config.server.bind_addr
            ))
        })?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Run on an already-bound listener until the shutdown token fires.
    ///
    /// Starts the gateway supervisor and the session maintenance task, and
    /// stops both once the HTTP server has drained.
    pub async fn serve(self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, gateway = %self.config.gateway.url, "Starting agent relay server");

        self.state.gateway.start();
        let maintenance = self
            .state
            .sessions
            .spawn_maintenance(self.config.relay.maintenance_interval(), self.shutdown.child_token());

        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|err| ServerError::Internal(format!("HTTP server error: {err}")));

        self.shutdown.cancel();
        self.state.gateway.stop().await;
        if let Err(e) = maintenance.await {
            warn!(error = %e, "Session maintenance task exited abnormally");
        }
        info!("Agent relay server stopped");
        result
    }
}
