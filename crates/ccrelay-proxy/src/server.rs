//! Actix Web HTTP frontend.
//!
//! Exposes the Anthropic-compatible surface the assistant talks to:
//! - `POST /v1/messages`
//! - `POST /v1/messages/count_tokens`
//! - `GET /status` (authenticated snapshot)
//! - `GET /health` (unauthenticated liveness)
//! - `POST /leases`, `DELETE /leases/{id}` (launchers sharing this proxy)

use crate::error::{ProxyError, Result};
use crate::service::{ProxyBody, ProxyResponse, ProxyService};
use crate::singleton::{LeaseGrant, LeaseRequest};
use crate::transform::InboundHeaders;
use actix_web::dev::ServerHandle;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use futures::StreamExt;
use serde_json::Value;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Response header naming the endpoint that served the request.
pub const ENDPOINT_HEADER: &str = "x-ccrelay-endpoint";

/// A listening frontend.
pub struct RunningProxy {
    addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and let in-flight requests finish within
    /// the configured grace period.
    pub async fn shutdown(self) {
        self.handle.stop(true).await;
        match self.task.await {
            Ok(Ok(())) => debug!("frontend stopped"),
            Ok(Err(e)) => debug!(error = %e, "frontend exited with error"),
            Err(e) => debug!(error = %e, "frontend task failed"),
        }
    }
}

/// Serve `service` on an already bound listener.
///
/// Signals are left to the caller, which drains through
/// [`RunningProxy::shutdown`].
pub fn start(service: Arc<ProxyService>, listener: TcpListener) -> Result<RunningProxy> {
    let addr = listener.local_addr()?;
    let grace = service.settings().proxy.shutdown_grace_secs;
    let state = web::Data::from(service);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(32 * 1024 * 1024))
            .route("/health", web::get().to(health_check))
            .route("/status", web::get().to(handle_status))
            .route("/leases", web::post().to(handle_acquire_lease))
            .route("/leases/{id}", web::delete().to(handle_release_lease))
            .route("/v1/messages", web::post().to(handle_messages))
            .route(
                "/v1/messages/count_tokens",
                web::post().to(handle_count_tokens),
            )
    })
    .workers(2)
    .disable_signals()
    .shutdown_timeout(grace)
    .listen(listener)?
    .run();

    let handle = server.handle();
    let task = tokio::spawn(server);
    info!(addr = %addr, "ccrelay proxy listening");

    Ok(RunningProxy { addr, handle, task })
}

async fn health_check() -> &'static str {
    "OK"
}

/// Credential from `x-api-key` or `Authorization: Bearer`.
fn authorize(service: &ProxyService, req: &HttpRequest) -> Result<()> {
    let headers = req.headers();
    let x_api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim);

    if service.authorize(x_api_key) || service.authorize(bearer) {
        Ok(())
    } else {
        debug!(path = %req.path(), "rejected unauthenticated request");
        Err(ProxyError::Unauthorized)
    }
}

fn inbound_headers(req: &HttpRequest) -> InboundHeaders {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    InboundHeaders {
        anthropic_version: header("anthropic-version"),
        anthropic_beta: header("anthropic-beta"),
    }
}

fn parse_body(body: &web::Bytes) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| ProxyError::BadRequest(e.to_string()))
}

async fn handle_messages(
    service: web::Data<ProxyService>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse> {
    authorize(&service, &req)?;
    let body = parse_body(&body)?;
    let response = service.forward_messages(body, &inbound_headers(&req)).await?;
    Ok(into_http(response))
}

async fn handle_count_tokens(
    service: web::Data<ProxyService>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse> {
    authorize(&service, &req)?;
    let body = parse_body(&body)?;
    let response = service.count_tokens(body, &inbound_headers(&req)).await?;
    Ok(into_http(response))
}

async fn handle_status(service: web::Data<ProxyService>, req: HttpRequest) -> Result<HttpResponse> {
    authorize(&service, &req)?;
    Ok(HttpResponse::Ok().json(service.status()))
}

async fn handle_acquire_lease(
    service: web::Data<ProxyService>,
    req: HttpRequest,
    body: web::Json<LeaseRequest>,
) -> Result<HttpResponse> {
    authorize(&service, &req)?;
    let lease = service.leases().acquire(body.pid);
    info!(lease, pid = body.pid, "launcher joined shared proxy");
    Ok(HttpResponse::Created().json(LeaseGrant { lease }))
}

async fn handle_release_lease(
    service: web::Data<ProxyService>,
    req: HttpRequest,
    id: web::Path<u64>,
) -> Result<HttpResponse> {
    authorize(&service, &req)?;
    if service.leases().release(id.into_inner()) {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Ok(HttpResponse::NotFound().finish())
    }
}

fn into_http(response: ProxyResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    builder.content_type(response.content_type.as_str());
    if let Some(endpoint) = &response.endpoint {
        builder.insert_header((ENDPOINT_HEADER, endpoint.as_str()));
    }

    match response.body {
        ProxyBody::Full(bytes) => builder.body(bytes),
        ProxyBody::Stream(stream) => builder
            .insert_header(("cache-control", "no-cache"))
            .streaming(stream.map(|chunk| {
                chunk.map_err(|e| actix_web::error::ErrorBadGateway(e.to_string()))
            })),
    }
}
