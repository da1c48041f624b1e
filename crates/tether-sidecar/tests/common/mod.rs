//! Common utilities for sidecar integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde::Deserialize;
use tether_sidecar::config::{RetryConfig, SidecarConfig};
use tether_sidecar::{server, Sidecar, SidecarState};
use tether_state::{MemoryBus, MemoryKv, StateProvider};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// A throwaway application standing in for the managed process.
pub struct TestApp {
    pub port: u16,
    hits: Arc<AtomicUsize>,
}

impl TestApp {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Requests received on `/record`.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

async fn greet(body: String) -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain")], format!("Hello {body}"))
}

async fn record(State(hits): State<Arc<AtomicUsize>>) -> &'static str {
    hits.fetch_add(1, Ordering::SeqCst);
    "recorded"
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "finally"
}

async fn increment(Path(_id): Path<String>, Json(args): Json<Vec<i64>>) -> Json<i64> {
    Json(args.first().copied().unwrap_or(0) + 1)
}

async fn whoami(Path(id): Path<String>, Query(query): Query<SessionQuery>) -> String {
    format!("{id}/{}", query.session.unwrap_or_default())
}

pub async fn spawn_app() -> TestApp {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/greet", post(greet))
        .route("/record", post(record))
        .route("/slow", post(slow))
        .route("/actor/Counter/{id}/incr", post(increment))
        .route("/actor/Counter/{id}/whoami", post(whoami))
        .with_state(Arc::clone(&hits));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    TestApp { port, hits }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Sidecar configuration with a short retry budget.
pub fn config(id: &str, service: Option<&str>, actors: &[&str], app_port: u16) -> SidecarConfig {
    let mut config = SidecarConfig::default();
    config.sidecar.id = Some(id.to_owned());
    config.sidecar.service = service.map(str::to_owned);
    config.sidecar.actors = actors.iter().map(|a| (*a).to_owned()).collect();
    config.app.port = app_port;
    config.retry = RetryConfig {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(20),
        max_elapsed: Some(Duration::from_millis(200)),
        ..RetryConfig::default()
    };
    config.server.shutdown_timeout = Duration::from_secs(2);
    config
}

/// A shared bus and store, as a deployment would have. The bus records
/// marks per message.
#[derive(Clone)]
pub struct Cluster {
    pub bus: MemoryBus,
    pub kv: MemoryKv,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            bus: MemoryBus::recording(),
            kv: MemoryKv::new(),
        }
    }

    pub fn provider(&self) -> StateProvider {
        StateProvider::new(Arc::new(self.bus.clone()), Arc::new(self.kv.clone()))
    }

    pub async fn start(&self, config: &SidecarConfig) -> Sidecar {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Sidecar::from_config(config, &self.provider(), listener, CancellationToken::new())
            .await
            .unwrap()
    }

    pub async fn start_with(&self, state: SidecarState) -> Sidecar {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Sidecar::start(state, listener, 1, Duration::from_secs(2))
            .await
            .unwrap()
    }
}

/// Sends `request` to the sidecar's API in process.
pub async fn request(sidecar: &Sidecar, request: Request<Body>) -> Response {
    server::router(Arc::clone(sidecar.state()))
        .oneshot(request)
        .await
        .unwrap()
}

pub async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
