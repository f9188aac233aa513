use crate::controller::PoolController;
use crate::error::{json_error_response, ErrorCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API exposing the pool controller over HTTP
pub struct AdminServer {
    bind_addr: SocketAddr,
    controller: Arc<PoolController>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<PoolController>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, controller, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    controller: Arc<PoolController>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let controller = Arc::clone(&controller);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, controller, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    controller: Arc<PoolController>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let public = method == Method::GET && (path == "/health" || path == "/version");
    if !public && !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(ErrorCode::Unauthorized, "missing or invalid admin token"));
    }

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Current proxy endpoint, activating or rotating first when needed
        (&Method::GET, "/endpoint") => match controller.get_endpoint().await {
            Ok(endpoint) => {
                let body = serde_json::json!({
                    "scheme": endpoint.scheme,
                    "endpoint": endpoint.endpoint,
                    "url": endpoint.url(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Failed to get endpoint");
                json_error_response(e.code(), e.to_string())
            }
        },

        (&Method::POST, "/rotate") => match controller.rotate().await {
            Ok(()) => response(StatusCode::OK, "ok"),
            Err(e) => {
                warn!(error = %e, "Rotation failed");
                json_error_response(e.code(), e.to_string())
            }
        },

        (&Method::POST, "/teardown") => {
            controller.teardown_all().await;
            response(StatusCode::OK, "ok")
        }

        (&Method::GET, "/status") => {
            let status = controller.status();
            let body = serde_json::json!({
                "provider": controller.provider_name(),
                "status": status,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}
