//! Listing and control API
//!
//! Plain HTTP on the daemon's API port. Every mutating route returns the
//! registry's result as JSON, including any routing warning.

use crate::error::{json_error_response, ApiErrorCode, SupervisorError};
use crate::process::ProcessRegistry;
use crate::routing::RoutingSync;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVERS_PREFIX: &str = "/api/servers/";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ApiErrorCode::InternalError, e.to_string()),
    }
}

fn supervisor_error(e: SupervisorError) -> Response<Full<Bytes>> {
    debug!(error = %e, "Request failed");
    json_error_response(e.code(), e.to_string())
}

/// State shared by every API connection
pub struct ApiState {
    pub registry: ProcessRegistry,
    pub routing: Arc<RoutingSync>,
    /// Lines returned by a log read without `lines=`
    pub log_tail_lines: usize,
}

pub struct ApiServer {
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    /// Serve on an already bound listener
    pub fn new(listener: TcpListener, state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            listener,
            state,
            shutdown_rx,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(addr = %self.local_addr()?, "API server listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, state: Arc<ApiState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    let query = match parse_query(req.uri().query()) {
        Ok(query) => query,
        Err(message) => return Ok(json_error_response(ApiErrorCode::BadRequest, message)),
    };

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_ok(&serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        })),

        (&Method::GET, "/api/servers") => match state.registry.all_status().await {
            Ok(servers) => json_ok(&serde_json::json!({
                "count": servers.len(),
                "servers": servers,
            })),
            Err(e) => supervisor_error(e),
        },

        (&Method::GET, "/api/routes") => json_ok(&serde_json::json!({
            "routes": state.routing.current(),
            "enabled": state.routing.is_enabled(),
            "in_sync": state.routing.in_sync(),
        })),

        (_, path) if path.starts_with(SERVERS_PREFIX) => match parse_server_path(path) {
            Ok(Some((name, action))) => server_action(&method, &name, &action, &query, &state).await,
            Ok(None) => json_error_response(ApiErrorCode::NotFound, "not found"),
            Err(message) => json_error_response(ApiErrorCode::BadRequest, message),
        },

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn server_action(
    method: &Method,
    name: &str,
    action: &str,
    query: &HashMap<String, String>,
    state: &ApiState,
) -> Response<Full<Bytes>> {
    let registry = &state.registry;
    let variant = query.get("variant").map(String::as_str).filter(|v| !v.is_empty());

    match (method, action) {
        (&Method::POST, "start") => match variant {
            Some(v) => registry.start(name, Some(v)).await.map_or_else(supervisor_error, |r| json_ok(&r)),
            None => registry
                .start_all_variants(name)
                .await
                .map_or_else(supervisor_error, |r| json_ok(&bulk(name, r))),
        },

        (&Method::POST, "stop") => match variant {
            Some(v) => registry.stop(name, Some(v)).await.map_or_else(supervisor_error, |r| json_ok(&r)),
            None => registry
                .stop_all_variants(name)
                .await
                .map_or_else(supervisor_error, |r| json_ok(&bulk(name, r))),
        },

        (&Method::POST, "restart") => match variant {
            Some(v) => registry.restart(name, Some(v)).await.map_or_else(supervisor_error, |r| json_ok(&r)),
            None => registry
                .restart_all_variants(name)
                .await
                .map_or_else(supervisor_error, |r| json_ok(&bulk(name, r))),
        },

        (&Method::GET, "log") => {
            // Counts past the end of the file return the whole file
            let lines = match query.get("lines").map(|l| l.parse::<usize>()) {
                None => state.log_tail_lines,
                Some(Ok(lines)) => lines,
                Some(Err(_)) => {
                    return json_error_response(ApiErrorCode::BadRequest, "lines must be a non-negative integer")
                }
            };
            match registry.read_log(name, variant, lines).await {
                Ok(log) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/plain; charset=utf-8")
                    .body(Full::new(Bytes::from(log)))
                    .expect("valid response with StatusCode enum and static header"),
                Err(e) => supervisor_error(e),
            }
        }

        _ => json_error_response(ApiErrorCode::NotFound, format!("no route for {} {}", method, action)),
    }
}

#[derive(Serialize)]
struct Bulk<'a, T> {
    server: &'a str,
    results: Vec<T>,
}

fn bulk<T>(server: &str, results: Vec<T>) -> Bulk<'_, T> {
    Bulk { server, results }
}

/// `/api/servers/{name}/{action}` → decoded `(name, action)`
fn parse_server_path(path: &str) -> Result<Option<(String, String)>, String> {
    let Some(rest) = path.strip_prefix(SERVERS_PREFIX) else {
        return Ok(None);
    };
    let mut segments = rest.split('/');
    let (Some(name), Some(action), None) = (segments.next(), segments.next(), segments.next()) else {
        return Ok(None);
    };
    if name.is_empty() || action.is_empty() {
        return Ok(None);
    }

    let name = urlencoding::decode(name).map_err(|e| format!("invalid server name: {}", e))?;
    Ok(Some((name.into_owned(), action.to_string())))
}

fn parse_query(query: Option<&str>) -> Result<HashMap<String, String>, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return Ok(params);
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|v| v.into_owned())
                .map_err(|e| format!("invalid query parameter '{}': {}", key, e))
        };
        params.insert(decode(key)?, decode(value)?);
    }
    Ok(params)
}
