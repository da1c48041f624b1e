//! Delivery of invocations to an application over HTTP.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tether_proto::{Invocation, Reply, Target};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::retry::{Failure, RetryError, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// A response obtained from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl Delivered {
    pub fn into_reply(self) -> Reply {
        Reply::new(self.status, self.content_type, self.body)
    }
}

/// Hands an invocation to the process that serves it.
#[async_trait]
pub trait LocalDelivery: Send + Sync + fmt::Debug {
    async fn deliver(&self, invocation: &Invocation) -> Result<Delivered, DeliveryError>;
}

/// The invocation as the application sees it.
///
/// Service invocations pass through unchanged. Actor invocations are
/// rewritten to `/actor/{type}/{id}{path}`, carry the session as a query
/// parameter, and default to a JSON body.
pub fn application_invocation(target: &Target, invocation: Invocation) -> Invocation {
    match target {
        Target::Service { .. } => invocation,
        Target::Actor { actor, session } => {
            let mut path = format!("/actor/{}/{}{}", actor.actor_type, actor.id, invocation.path);
            if let Some(session) = session {
                path.push_str("?session=");
                path.push_str(session);
            }
            let content_type = invocation
                .content_type
                .or_else(|| Some("application/json".to_owned()));
            Invocation {
                path,
                content_type,
                ..invocation
            }
        }
    }
}

/// Connection settings shared by every HTTP delivery.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 256,
            pool_idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Pooled HTTP client with retry and cancellation.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(settings: &ClientSettings, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build_http();

        Self {
            client,
            policy,
            timeout: settings.request_timeout,
            cancel,
        }
    }

    /// A delivery target rooted at `base_url`.
    pub fn for_base(&self, base_url: impl Into<String>) -> HttpDelivery {
        HttpDelivery {
            base_url: base_url.into(),
            client: self.clone(),
        }
    }

    fn build_request(
        &self,
        url: &str,
        invocation: &Invocation,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, DeliveryError> {
        let method = Method::from_bytes(invocation.method.as_bytes())
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;

        let mut builder = Request::builder().method(method).uri(url);
        if let Some(content_type) = &invocation.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(accept) = &invocation.accept {
            builder = builder.header(ACCEPT, accept);
        }

        builder
            .body(Full::new(body))
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))
    }

    async fn execute(&self, url: &str, invocation: &Invocation) -> Result<Delivered, DeliveryError> {
        let body = Bytes::from(invocation.payload.clone());

        // Fail fast on requests that can never be built.
        self.build_request(url, invocation, body.clone())?;

        let outcome = self
            .policy
            .run(&self.cancel, || {
                let body = body.clone();
                async move {
                    let request = match self.build_request(url, invocation, body) {
                        Ok(request) => request,
                        Err(e) => return Err(Failure::Permanent(e)),
                    };

                    match tokio::time::timeout(self.timeout, self.client.request(request)).await {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => {
                            tracing::debug!(url = %url, error = %e, "Delivery attempt failed");
                            Err(Failure::Transient(DeliveryError::Transport(e.to_string())))
                        }
                        Err(_) => {
                            tracing::debug!(url = %url, "Delivery attempt timed out");
                            Err(Failure::Transient(DeliveryError::Transport(
                                "request timed out".to_owned(),
                            )))
                        }
                    }
                }
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(RetryError::Cancelled) => return Err(DeliveryError::Cancelled),
            Err(RetryError::Permanent(e) | RetryError::Exhausted(e)) => return Err(e),
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DeliveryError::Body(e.to_string()))?
            .to_bytes();

        Ok(Delivered {
            status,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// HTTP delivery to one application base URL.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    base_url: String,
    client: HttpClient,
}

impl HttpDelivery {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, invocation: &Invocation) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), invocation.path)
    }
}

#[async_trait]
impl LocalDelivery for HttpDelivery {
    async fn deliver(&self, invocation: &Invocation) -> Result<Delivered, DeliveryError> {
        let url = self.url_for(invocation);
        self.client.execute(&url, invocation).await
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::Router;
    use tether_proto::ActorRef;
    use tokio::net::TcpListener;

    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(5),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(5),
            max_elapsed: Some(Duration::from_millis(50)),
        }
    }

    async fn echo_app() -> String {
        let app = Router::new().route(
            "/echo",
            post(|body: String| async move { ([(CONTENT_TYPE, "text/plain")], body) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn service_invocation_passes_through() {
        let invocation = Invocation::post("/greet", "hi");
        let rewritten = application_invocation(&Target::service("greeter"), invocation.clone());
        assert_eq!(rewritten, invocation);
    }

    #[test]
    fn actor_invocation_is_rewritten() {
        let target = Target::actor(ActorRef::new("Counter", "c1")).with_session(Some("s9".into()));
        let rewritten = application_invocation(&target, Invocation::post("incr", "[1]"));

        assert_eq!(rewritten.path, "/actor/Counter/c1/incr?session=s9");
        assert_eq!(rewritten.content_type.as_deref(), Some("application/json"));
        assert_eq!(rewritten.method, "POST");
    }

    #[tokio::test]
    async fn delivers_and_reads_response() {
        let base = echo_app().await;
        let client = HttpClient::new(&ClientSettings::default(), quick_policy(), CancellationToken::new());

        let delivered = client
            .for_base(base)
            .deliver(&Invocation::post("/echo", "hello"))
            .await
            .unwrap();

        assert_eq!(delivered.status, 200);
        assert_eq!(delivered.body, "hello");
        assert!(delivered.content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let base = echo_app().await;
        let client = HttpClient::new(&ClientSettings::default(), quick_policy(), CancellationToken::new());

        let delivered = client
            .for_base(base)
            .deliver(&Invocation::post("/missing", ""))
            .await
            .unwrap();

        assert_eq!(delivered.status, 404);
    }

    #[tokio::test]
    async fn unreachable_application_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new(&ClientSettings::default(), quick_policy(), CancellationToken::new());
        let err = client
            .for_base(format!("http://{addr}"))
            .deliver(&Invocation::post("/echo", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Transport(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let client = HttpClient::new(&ClientSettings::default(), RetryPolicy::default(), cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client
            .for_base(format!("http://{addr}"))
            .deliver(&Invocation::post("/echo", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Cancelled);
    }

    #[tokio::test]
    async fn bad_method_is_rejected() {
        let client = HttpClient::new(&ClientSettings::default(), quick_policy(), CancellationToken::new());
        let err = client
            .for_base("http://127.0.0.1:1")
            .deliver(&Invocation::post("/x", "").with_method("BAD METHOD"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidRequest(_)));
    }
}
