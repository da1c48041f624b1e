//! HTTP surface offered to the local application.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_TYPE, PRAGMA};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tether_proto::{ActorRef, Invocation, Reply, RequestId, Target};
use tokio::net::TcpListener;

use crate::error::SidecarError;
use crate::invoke;
use crate::state::SidecarState;

type AppState = Arc<SidecarState>;

/// How a call should be answered, from the `Pragma` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for the reply.
    #[default]
    Wait,
    /// Fire and forget.
    Async,
    /// Return a request id to await later.
    Promise,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pragmas {
    pub direct: bool,
    pub mode: CallMode,
}

impl Pragmas {
    /// Reads every `Pragma` header. Values are comma separated and case
    /// insensitive; the first of `async` and `promise` wins.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut pragmas = Self::default();
        let values = headers
            .get_all(PRAGMA)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|value| value.trim().to_ascii_lowercase());

        for value in values {
            match value.as_str() {
                "http" => pragmas.direct = true,
                "async" if pragmas.mode == CallMode::Wait => pragmas.mode = CallMode::Async,
                "promise" if pragmas.mode == CallMode::Wait => pragmas.mode = CallMode::Promise,
                _ => {}
            }
        }
        pragmas
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/kill", get(kill))
        .route("/send/{service}/{*path}", post(send_service))
        .route("/call/{service}/{*path}", any(call_service))
        .route(
            "/session/{session}/send/{service}/{*path}",
            post(send_session),
        )
        .route(
            "/session/{session}/call/{service}/{*path}",
            any(call_session),
        )
        .route("/actor/{actor_type}/{id}/call/{*path}", post(call_actor))
        .route("/await", post(await_promise))
        .route("/set/{key}", post(set_key))
        .route("/get/{key}", get(get_key))
        .route("/del/{key}", get(del_key))
        .with_state(state)
}

/// Serves the router on `listener` until the sidecar is cancelled, then
/// drains in-flight requests for at most `shutdown_timeout`.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown_timeout: Duration,
) -> Result<(), SidecarError> {
    let cancel = state.cancel_token().clone();
    let address = listener.local_addr()?;
    let app = router(state);

    tracing::info!(address = %address, "Sidecar listening");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.map_err(SidecarError::Io),
        () = cancel.cancelled() => {}
    }

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(result) => result.map_err(SidecarError::Io)?,
        Err(_) => tracing::warn!(
            timeout_ms = shutdown_timeout.as_millis() as u64,
            "Shutdown timeout elapsed with requests in flight"
        ),
    }

    tracing::info!("Sidecar listener stopped");
    Ok(())
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "sidecar": state.id(),
        "service": state.identity().service,
    }))
}

async fn kill(State(state): State<AppState>) -> &'static str {
    tracing::info!("Shutdown requested over HTTP");
    state.cancel_token().cancel();
    "OK"
}

/// The reply relayed verbatim.
fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, reply.payload).into_response();

    let headers = response.headers_mut();
    headers.remove(CONTENT_TYPE);
    if !reply.content_type.is_empty() {
        match HeaderValue::from_str(&reply.content_type) {
            Ok(value) => {
                headers.insert(CONTENT_TYPE, value);
            }
            Err(e) => {
                tracing::debug!(content_type = %reply.content_type, error = %e, "Dropping invalid content type");
            }
        }
    }
    response
}

fn header(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn invocation_from(method: &Method, path: &str, headers: &HeaderMap, body: String) -> Invocation {
    Invocation::post(path, body)
        .with_method(method.as_str())
        .with_content_type(header(headers, CONTENT_TYPE))
        .with_accept(header(headers, axum::http::header::ACCEPT))
}

/// Runs a call in the mode its `Pragma` headers ask for.
async fn dispatch_call(
    state: &AppState,
    target: Target,
    invocation: Invocation,
    headers: &HeaderMap,
) -> Result<Response, SidecarError> {
    let pragmas = Pragmas::from_headers(headers);

    match (pragmas.mode, pragmas.direct) {
        (CallMode::Async, false) => {
            invoke::send(state, target, invocation).await?;
            Ok((StatusCode::ACCEPTED, "OK").into_response())
        }
        (CallMode::Async, true) => {
            invoke::tell_direct(state, target, invocation)?;
            Ok((StatusCode::ACCEPTED, "OK").into_response())
        }
        (CallMode::Promise, direct) => {
            let request = if direct {
                invoke::call_promise_direct(state, target, invocation)?
            } else {
                invoke::call_promise(state, target, invocation).await?
            };
            Ok((
                StatusCode::ACCEPTED,
                [(CONTENT_TYPE, "text/plain")],
                request.to_string(),
            )
                .into_response())
        }
        (CallMode::Wait, false) => Ok(reply_response(
            invoke::call(state, target, invocation).await?,
        )),
        (CallMode::Wait, true) => Ok(reply_response(
            invoke::call_direct(state, target, invocation).await?,
        )),
    }
}

async fn send_service(
    State(state): State<AppState>,
    Path((service, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<&'static str, SidecarError> {
    let invocation = invocation_from(&Method::POST, &path, &headers, body);
    invoke::send(&state, Target::service(service), invocation).await?;
    Ok("OK")
}

async fn send_session(
    State(state): State<AppState>,
    Path((session, service, path)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<&'static str, SidecarError> {
    let invocation = invocation_from(&Method::POST, &path, &headers, body);
    let target = Target::service(service).with_session(Some(session));
    invoke::send(&state, target, invocation).await?;
    Ok("OK")
}

async fn call_service(
    State(state): State<AppState>,
    method: Method,
    Path((service, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, SidecarError> {
    let invocation = invocation_from(&method, &path, &headers, body);
    dispatch_call(&state, Target::service(service), invocation, &headers).await
}

async fn call_session(
    State(state): State<AppState>,
    method: Method,
    Path((session, service, path)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, SidecarError> {
    let invocation = invocation_from(&method, &path, &headers, body);
    let target = Target::service(service).with_session(Some(session));
    dispatch_call(&state, target, invocation, &headers).await
}

#[derive(Debug, Deserialize)]
struct ActorQuery {
    session: Option<String>,
}

async fn call_actor(
    State(state): State<AppState>,
    Path((actor_type, id, path)): Path<(String, String, String)>,
    Query(query): Query<ActorQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, SidecarError> {
    let args = if body.trim().is_empty() {
        "[]".to_owned()
    } else {
        body
    };
    match serde_json::from_str::<serde_json::Value>(&args) {
        Ok(serde_json::Value::Array(_)) => {}
        Ok(_) => {
            return Err(SidecarError::BadRequest(
                "actor arguments must be a JSON array".into(),
            ))
        }
        Err(e) => return Err(SidecarError::BadRequest(e.to_string())),
    }

    let invocation = Invocation::post(&path, args)
        .with_content_type(Some("application/json".to_owned()))
        .with_accept(header(&headers, axum::http::header::ACCEPT));
    let target =
        Target::actor(ActorRef::new(actor_type, id)).with_session(query.session.filter(|s| !s.is_empty()));

    dispatch_call(&state, target, invocation, &headers).await
}

async fn await_promise(
    State(state): State<AppState>,
    body: String,
) -> Result<Response, SidecarError> {
    let request = RequestId::parse(&body)
        .ok_or_else(|| SidecarError::BadRequest("missing request id".into()))?;
    Ok(reply_response(invoke::await_reply(&state, &request).await?))
}

async fn set_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: String,
) -> Result<&'static str, SidecarError> {
    invoke::set(&state, &key, &body).await?;
    Ok("OK")
}

async fn get_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, SidecarError> {
    invoke::get(&state, &key).await
}

async fn del_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, SidecarError> {
    Ok(invoke::del(&state, &key).await?.to_string())
}
