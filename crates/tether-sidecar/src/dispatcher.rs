//! Inbound message processing.
//!
//! Every message taken off the bus is confirmed, decoded and either executed
//! against the local application or forwarded to the route it is addressed
//! to. It is marked processed afterwards in every case, so a message that
//! cannot be handled is dropped rather than redelivered forever.

use std::sync::Arc;

use tether_proto::{Envelope, Invocation, Message, Protocol, Reply, Route, Target};
use tether_state::{Inbound, Subscription};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::delivery::{application_invocation, DeliveryError};
use crate::state::SidecarState;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Another consumer already owns it.
    Skipped,
    /// Malformed; logged and dropped.
    Dropped,
    /// Not ours; republished on its own route.
    Forwarded,
    Executed,
}

pub struct Dispatcher {
    state: Arc<SidecarState>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(state: Arc<SidecarState>, workers: usize) -> Self {
        Self {
            state,
            workers: workers.max(1),
        }
    }

    /// Consumes `subscription` until it closes or the sidecar is cancelled.
    /// With one worker messages are handled in arrival order.
    pub async fn run(self, mut subscription: Subscription) {
        let cancel = self.state.cancel_token().clone();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        tracing::info!(sidecar = %self.state.id(), workers = self.workers, "Dispatcher started");

        loop {
            let inbound = tokio::select! {
                () = cancel.cancelled() => break,
                next = subscription.next() => match next {
                    Some(inbound) => inbound,
                    None => {
                        tracing::warn!(sidecar = %self.state.id(), "Bus subscription closed");
                        break;
                    }
                },
            };

            if self.workers == 1 {
                dispatch(&self.state, &inbound).await;
                continue;
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let state = Arc::clone(&self.state);
            tasks.spawn(async move {
                dispatch(&state, &inbound).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Dispatch task failed");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task failed");
            }
        }

        tracing::info!(sidecar = %self.state.id(), "Dispatcher stopped");
    }
}

/// Handles one inbound message end to end.
pub async fn dispatch(state: &SidecarState, inbound: &Inbound) -> Outcome {
    if !inbound.confirm().await {
        tracing::debug!(message = %inbound.id(), "Message claimed elsewhere");
        return Outcome::Skipped;
    }

    let outcome = match Envelope::decode(inbound.message()) {
        Err(e) => {
            tracing::warn!(message = %inbound.id(), error = %e, "Dropping malformed message");
            Outcome::Dropped
        }
        Ok(envelope) => {
            if is_recipient(state, &envelope).await {
                execute(state, envelope).await;
                Outcome::Executed
            } else {
                forward(state, inbound.message(), &envelope.route()).await;
                Outcome::Forwarded
            }
        }
    };

    if let Err(e) = inbound.mark().await {
        tracing::warn!(message = %inbound.id(), error = %e, "Failed to mark message processed");
    }
    outcome
}

async fn is_recipient(state: &SidecarState, envelope: &Envelope) -> bool {
    let identity = state.identity();
    match envelope {
        Envelope::Callback { to, .. } => *to == identity.id,
        Envelope::Send { service, .. } => identity.service.as_ref() == Some(service),
        Envelope::Call { target, .. } => match target {
            Target::Service { name, .. } => identity.service.as_ref() == Some(name),
            Target::Actor { actor, .. } => owns_actor(state, actor).await,
        },
        Envelope::Tell { actor, .. } => owns_actor(state, actor).await,
    }
}

async fn owns_actor(state: &SidecarState, actor: &tether_proto::ActorRef) -> bool {
    if !state.identity().hosts_actor_type(&actor.actor_type) {
        return false;
    }
    match state.placement().owns(actor).await {
        Ok(owned) => owned,
        Err(e) => {
            tracing::warn!(actor = %actor, error = %e, "Placement lookup failed");
            false
        }
    }
}

/// Republishes the original message unchanged.
async fn forward(state: &SidecarState, message: &Message, route: &Route) {
    tracing::info!(route = %route, "Forwarding message");

    if let Err(e) = state.bus().publish(route, message).await {
        // An unreachable sidecar means its caller is gone too.
        if route.protocol() == Protocol::Sidecar {
            tracing::debug!(route = %route, error = %e, "Failed to forward message");
        } else {
            tracing::error!(route = %route, error = %e, "Failed to forward message");
        }
    }
}

async fn execute(state: &SidecarState, envelope: Envelope) {
    match envelope {
        Envelope::Send {
            service,
            session,
            invocation,
        } => {
            let target = Target::service(service).with_session(session);
            one_way(state, &target, invocation).await;
        }

        Envelope::Tell {
            actor,
            session,
            invocation,
        } => {
            let target = Target::actor(actor).with_session(session);
            one_way(state, &target, invocation).await;
        }

        Envelope::Call {
            target,
            invocation,
            reply_to,
        } => {
            let reply = match deliver(state, &target, invocation).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(callee = %target, request = %reply_to.request, error = %e, "Failed to call application");
                    Reply::bad_gateway()
                }
            };

            let callback = Envelope::callback_for(&reply_to, reply);
            if let Err(e) = state.bus().publish(&callback.route(), &callback.encode()).await {
                tracing::error!(to = %reply_to.from, request = %reply_to.request, error = %e, "Failed to send callback");
            }
        }

        Envelope::Callback { request, reply, .. } => {
            state.correlations().deliver(&request, reply);
        }
    }
}

async fn one_way(state: &SidecarState, target: &Target, invocation: Invocation) {
    match deliver(state, target, invocation).await {
        Ok(reply) => {
            tracing::debug!(callee = %target, status = reply.status_code, "Delivered message");
        }
        Err(e) => {
            tracing::error!(callee = %target, error = %e, "Failed to deliver message");
        }
    }
}

async fn deliver(
    state: &SidecarState,
    target: &Target,
    invocation: Invocation,
) -> Result<Reply, DeliveryError> {
    let invocation = application_invocation(target, invocation);
    state
        .local()
        .deliver(&invocation)
        .await
        .map(|delivered| delivered.into_reply())
}
