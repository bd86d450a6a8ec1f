use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::proxy::session::SessionRegistry;
use crate::proxy::upstream::UpstreamClient;

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub upstream: Arc<UpstreamClient>,
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AxumServer {
    /// Start the proxy server.
    pub async fn start(
        host: String,
        port: u16,
        registry: Arc<SessionRegistry>,
        upstream: Arc<UpstreamClient>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let state = AppState { registry, upstream };

        use crate::proxy::handlers;

        let app = Router::new()
            // System
            .route("/health-check", get(handlers::health::health_check))
            // Session lifecycle
            .route("/subscribe", post(handlers::session::subscribe))
            .route("/unsubscribe", post(handlers::session::unsubscribe))
            // Session state
            .route("/set-headers", post(handlers::session::set_headers))
            .route("/get-headers", post(handlers::session::get_headers))
            .route("/get-cookies", post(handlers::session::get_cookies))
            .route("/get-session-info", post(handlers::session::get_session_info))
            .route("/clear-session", post(handlers::session::clear_session))
            // Proxy
            .route("/forward", post(handlers::proxy::forward))
            .route("/download", post(handlers::proxy::download))
            .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::proxy::middleware::session_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            // CORS must sit outside session validation so preflight
            // requests are answered without a session id
            .layer(crate::proxy::middleware::cors_layer())
            .with_state(state);

        // Bind address
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;

        tracing::info!("Session proxy server started at http://{}", addr);

        // Create shutdown channel
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let server_instance = Self {
            shutdown_tx: Some(shutdown_tx),
        };

        // Start server in a new task
        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, peer)) => {
                                let io = TokioIo::new(stream);
                                // The peer address rides along as an extension
                                // so /subscribe can record the client ip
                                let service =
                                    TowerToHyperService::new(app.clone().layer(Extension(peer)));

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Connection handling ended or error: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Session proxy server stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((server_instance, handle))
    }

    /// Stop the server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
