//! Start-up and orderly shutdown of a sidecar.

use std::sync::Arc;
use std::time::Duration;

use tether_state::StateProvider;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SidecarConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SidecarError;
use crate::server;
use crate::state::SidecarState;

/// A running sidecar: the bus consumer and the HTTP listener.
pub struct Sidecar {
    state: Arc<SidecarState>,
    port: u16,
    dispatcher: JoinHandle<()>,
    server: JoinHandle<Result<(), SidecarError>>,
}

impl Sidecar {
    /// Subscribes to the bus and starts serving on `listener`.
    pub async fn start(
        state: SidecarState,
        listener: TcpListener,
        workers: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self, SidecarError> {
        let state = Arc::new(state);
        let port = listener.local_addr()?.port();

        let membership = state.identity().membership();
        let subscription = state.bus().subscribe(&membership).await?;
        info!(
            sidecar = %state.id(),
            service = ?membership.service,
            actors = ?membership.actor_types,
            "Joined bus"
        );

        let dispatcher = tokio::spawn(Dispatcher::new(Arc::clone(&state), workers).run(subscription));
        let server = tokio::spawn(server::serve(Arc::clone(&state), listener, shutdown_timeout));

        Ok(Self {
            state,
            port,
            dispatcher,
            server,
        })
    }

    /// Builds the state from configuration and starts.
    pub async fn from_config(
        config: &SidecarConfig,
        provider: &StateProvider,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<Self, SidecarError> {
        let state = SidecarState::from_config(config, provider, cancel);
        Self::start(
            state,
            listener,
            config.dispatch.workers,
            config.server.shutdown_timeout,
        )
        .await
    }

    pub fn state(&self) -> &Arc<SidecarState> {
        &self.state
    }

    /// The port the HTTP listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&self) {
        info!(sidecar = %self.state.id(), "Initiating graceful shutdown");
        self.state.cancel_token().cancel();
    }

    /// Waits until the sidecar is cancelled and drained. A listener failure
    /// cancels the sidecar and is returned.
    pub async fn wait(self) -> Result<(), SidecarError> {
        let served = match self.server.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Listener task failed");
                Ok(())
            }
        };
        if let Err(e) = &served {
            error!(error = %e, "Listener failed");
        }
        self.state.cancel_token().cancel();

        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }

        let abandoned = self.state.correlations().len();
        self.state.correlations().clear();
        info!(sidecar = %self.state.id(), abandoned, "Sidecar stopped");

        served
    }
}
