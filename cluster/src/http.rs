//! HTTP API: cluster membership, status and metrics.
//!
//! | route | call |
//! |---|---|
//! | `POST /join` `{"id", "addr"}` | [`ConsensusServer::add_voter`] |
//! | `DELETE /remove/<id>` | [`ConsensusServer::remove_server`] |
//! | `GET /info` | [`ConsensusServer::cluster_status`] as JSON |
//! | `GET /metrics` | prometheus text |
//!
//! Anything else is a 404.

use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics;
use crate::server::ConsensusServer;

const JOIN_ATTEMPTS: usize = 5;
const JOIN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Join,
    Remove(String),
    Info,
    Metrics,
    NotFound,
}

/// Splits the first segment off `path`: `/a/b/c` gives `("a", "/b/c")` and
/// `/a` gives `("a", "/")`.
pub fn shift_path(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    match path.find('/') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, "/"),
    }
}

pub fn route(method: &Method, path: &str) -> Route {
    let (head, tail) = shift_path(path);
    match (method, head) {
        (&Method::POST, "join") if tail == "/" => Route::Join,
        (&Method::DELETE, "remove") => match shift_path(tail) {
            (id, "/") if !id.is_empty() => Route::Remove(id.to_string()),
            _ => Route::NotFound,
        },
        (&Method::GET, "info") if tail == "/" => Route::Info,
        (&Method::GET, "metrics") if tail == "/" => Route::Metrics,
        _ => Route::NotFound,
    }
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn json<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = text(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error_response(e: &Error) -> Response<Body> {
    let status = match e {
        Error::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Membership(_) => StatusCode::CONFLICT,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text(status, e.to_string())
}

fn outcome(result: Result<()>) -> Response<Body> {
    match result {
        Ok(()) => text(StatusCode::OK, Body::empty()),
        Err(e) => error_response(&e),
    }
}

async fn handle(server: Arc<ConsensusServer>, req: Request<Body>) -> Response<Body> {
    let route = route(req.method(), req.uri().path());
    log::debug!("{} {} -> {:?}", req.method(), req.uri().path(), route);

    match route {
        Route::Join => {
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => body,
                Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
            };
            match serde_json::from_slice::<JoinRequest>(&body) {
                Ok(join) => {
                    log::info!("join request from {} at {}", join.id, join.addr);
                    outcome(server.add_voter(&join.id, &join.addr).await)
                }
                Err(e) => text(StatusCode::BAD_REQUEST, e.to_string()),
            }
        }
        Route::Remove(id) => outcome(server.remove_server(&id).await),
        Route::Info => json(&server.cluster_status()),
        Route::Metrics => match metrics::gather_text() {
            Ok(buffer) => text(StatusCode::OK, buffer),
            Err(e) => error_response(&e),
        },
        Route::NotFound => text(StatusCode::NOT_FOUND, Body::empty()),
    }
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, server: Arc<ConsensusServer>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    metrics::init_registry();
    let make_svc = make_service_fn(move |_| {
        let server = server.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(handle(server, req).await) }
            }))
        }
    });

    log::info!("http api listening on {}", listener.local_addr()?);
    hyper::Server::from_tcp(listener)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Asks the cluster member at `join_addr` to add this server as a voter,
/// retrying while that member has no leader yet.
pub async fn join(join_addr: &str, id: &str, addr: &str) -> Result<()> {
    let base = if join_addr.contains("://") {
        join_addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", join_addr.trim_end_matches('/'))
    };
    let body = serde_json::to_vec(&JoinRequest {
        id: id.to_string(),
        addr: addr.to_string(),
    })?;

    let client = Client::new();
    let mut last_error = None;
    for attempt in 1..=JOIN_ATTEMPTS {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/join", base))
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.clone()))
            .map_err(|e| Error::Config(format!("invalid join address {}: {}", join_addr, e)))?;

        match client.request(request).await {
            Ok(response) if response.status().is_success() => {
                log::info!("joined cluster through {}", base);
                return Ok(());
            }
            Ok(response) => {
                let status = response.status();
                let reason = hyper::body::to_bytes(response.into_body())
                    .await
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                last_error = Some(Error::Membership(format!("{}: {}", status, reason)));
            }
            Err(e) => last_error = Some(e.into()),
        }
        log::warn!(
            "join attempt {}/{} through {} failed: {}",
            attempt,
            JOIN_ATTEMPTS,
            base,
            last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
        );
        if attempt < JOIN_ATTEMPTS {
            tokio::time::sleep(JOIN_INTERVAL).await;
        }
    }
    Err(last_error.unwrap_or(Error::Timeout))
}
