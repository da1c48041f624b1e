//! Outbound invocations issued on behalf of the local application.
//!
//! Bus invocations publish an envelope on the target's route. Calls register
//! a correlation slot first and wait on it for the callback. Direct
//! invocations skip the bus and go straight to the target application over
//! HTTP.

use std::sync::Arc;

use tether_proto::{Envelope, Invocation, Reply, ReplyTo, RequestId, Target};

use crate::delivery::{application_invocation, DeliveryError};
use crate::error::SidecarError;
use crate::state::SidecarState;

async fn publish(state: &SidecarState, envelope: &Envelope) -> Result<(), SidecarError> {
    state
        .bus()
        .publish(&envelope.route(), &envelope.encode())
        .await
        .map_err(SidecarError::from)
}

/// Fire-and-forget invocation over the bus.
pub async fn send(
    state: &SidecarState,
    target: Target,
    invocation: Invocation,
) -> Result<(), SidecarError> {
    publish(state, &Envelope::one_way(target, invocation)).await
}

/// Publishes a call and registers its correlation slot.
async fn start_call(
    state: &SidecarState,
    target: Target,
    invocation: Invocation,
) -> Result<RequestId, SidecarError> {
    let pending = state.correlations().register(RequestId::generate());
    let request = pending.request().clone();

    let envelope = Envelope::Call {
        target,
        invocation,
        reply_to: ReplyTo {
            from: state.id().to_owned(),
            request: request.clone(),
        },
    };

    if let Err(e) = publish(state, &envelope).await {
        state.correlations().abandon(&request);
        return Err(e);
    }
    Ok(request)
}

/// Request/response invocation over the bus.
pub async fn call(
    state: &SidecarState,
    target: Target,
    invocation: Invocation,
) -> Result<Reply, SidecarError> {
    let request = start_call(state, target, invocation).await?;
    await_reply(state, &request).await
}

/// Starts a call and returns its request id without waiting.
pub async fn call_promise(
    state: &SidecarState,
    target: Target,
    invocation: Invocation,
) -> Result<RequestId, SidecarError> {
    start_call(state, target, invocation).await
}

/// Waits for the reply to a call started with [`call_promise`]. Only the
/// first waiter for a given id gets the reply.
pub async fn await_reply(state: &SidecarState, request: &RequestId) -> Result<Reply, SidecarError> {
    state
        .correlations()
        .wait(request, state.cancel_token())
        .await
        .map_err(SidecarError::from)
}

async fn deliver_direct(
    state: &SidecarState,
    target: &Target,
    invocation: Invocation,
) -> Result<Reply, SidecarError> {
    let delivery = state.direct_delivery(target)?;
    let invocation = application_invocation(target, invocation);

    match delivery.deliver(&invocation).await {
        Ok(delivered) => Ok(delivered.into_reply()),
        Err(DeliveryError::Cancelled) => Err(SidecarError::Cancelled),
        Err(e) => {
            tracing::error!(callee = %target, error = %e, "Direct delivery failed");
            Ok(Reply::bad_gateway())
        }
    }
}

/// Fire-and-forget invocation straight to the target application.
pub fn tell_direct(
    state: &Arc<SidecarState>,
    target: Target,
    invocation: Invocation,
) -> Result<(), SidecarError> {
    // Resolve eagerly so an unknown target is reported to the caller.
    state.direct_delivery(&target)?;

    let state = Arc::clone(state);
    tokio::spawn(async move {
        match deliver_direct(&state, &target, invocation).await {
            Ok(reply) => {
                tracing::debug!(callee = %target, status = reply.status_code, "Delivered message")
            }
            Err(e) => tracing::debug!(callee = %target, error = %e, "Direct send abandoned"),
        }
    });
    Ok(())
}

/// Request/response invocation straight to the target application.
pub async fn call_direct(
    state: &SidecarState,
    target: Target,
    invocation: Invocation,
) -> Result<Reply, SidecarError> {
    deliver_direct(state, &target, invocation).await
}

/// Direct call whose reply is collected later with [`await_reply`].
pub fn call_promise_direct(
    state: &Arc<SidecarState>,
    target: Target,
    invocation: Invocation,
) -> Result<RequestId, SidecarError> {
    state.direct_delivery(&target)?;

    let pending = state.correlations().register(RequestId::generate());
    let request = pending.request().clone();

    let state = Arc::clone(state);
    let id = request.clone();
    tokio::spawn(async move {
        match deliver_direct(&state, &target, invocation).await {
            Ok(reply) => {
                state.correlations().deliver(&id, reply);
            }
            Err(e) => {
                tracing::debug!(callee = %target, error = %e, "Direct call abandoned");
                state.correlations().abandon(&id);
            }
        }
    });
    Ok(request)
}

pub async fn set(state: &SidecarState, key: &str, value: &str) -> Result<(), SidecarError> {
    state
        .kv()
        .put(&state.state_key(key), value.as_bytes())
        .await
        .map_err(SidecarError::from)
}

pub async fn get(state: &SidecarState, key: &str) -> Result<String, SidecarError> {
    match state.kv().get(&state.state_key(key)).await? {
        Some(value) => Ok(String::from_utf8_lossy(&value).into_owned()),
        None => Err(SidecarError::KeyNotFound(key.to_owned())),
    }
}

/// Deletes `key`, returning how many entries were removed.
pub async fn del(state: &SidecarState, key: &str) -> Result<u32, SidecarError> {
    let removed = state.kv().delete(&state.state_key(key)).await?;
    Ok(u32::from(removed))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_state::{Bus, MemoryBus, MemoryKv, Membership, StateProvider};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::SidecarConfig;

    fn state_on(bus: &MemoryBus, id: &str) -> SidecarState {
        let provider = StateProvider::new(Arc::new(bus.clone()), Arc::new(MemoryKv::new()));
        let mut config = SidecarConfig::default();
        config.sidecar.id = Some(id.into());
        SidecarState::from_config(&config, &provider, CancellationToken::new())
    }

    #[tokio::test]
    async fn send_publishes_on_service_route() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");
        let mut greeter = bus
            .subscribe(&Membership::new("car-b").with_service("greeter"))
            .await
            .unwrap();

        send(&state, Target::service("greeter"), Invocation::post("/hi", "x"))
            .await
            .unwrap();

        let envelope = Envelope::decode(greeter.next().await.unwrap().message()).unwrap();
        assert!(matches!(envelope, Envelope::Send { service, .. } if service == "greeter"));
    }

    #[tokio::test]
    async fn send_without_subscriber_fails() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");

        let err = send(&state, Target::service("nobody"), Invocation::post("/", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::Publish(_)));
    }

    #[tokio::test]
    async fn failed_call_publish_leaves_no_slot() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");

        let err = call(&state, Target::service("nobody"), Invocation::post("/", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::Publish(_)));
        assert!(state.correlations().is_empty());
    }

    #[tokio::test]
    async fn promise_then_await() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");
        let mut greeter = bus
            .subscribe(&Membership::new("car-b").with_service("greeter"))
            .await
            .unwrap();

        let request = call_promise(&state, Target::service("greeter"), Invocation::post("/hi", ""))
            .await
            .unwrap();

        match Envelope::decode(greeter.next().await.unwrap().message()).unwrap() {
            Envelope::Call { reply_to, .. } => {
                assert_eq!(reply_to.from, "car-a");
                assert_eq!(reply_to.request, request);
            }
            other => panic!("expected call, got {other:?}"),
        }

        state
            .correlations()
            .deliver(&request, Reply::new(200, "text/plain", "done"));
        let reply = await_reply(&state, &request).await.unwrap();
        assert_eq!(reply.payload, "done");

        let again = await_reply(&state, &request).await.unwrap_err();
        assert!(matches!(again, SidecarError::UnknownRequest(_)));
    }

    #[tokio::test]
    async fn await_is_cancelled_on_shutdown() {
        let bus = MemoryBus::new();
        let state = Arc::new(state_on(&bus, "car-a"));
        let _greeter = bus
            .subscribe(&Membership::new("car-b").with_service("greeter"))
            .await
            .unwrap();

        let request = call_promise(&state, Target::service("greeter"), Invocation::post("/", ""))
            .await
            .unwrap();

        let cancel = state.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = await_reply(&state, &request).await.unwrap_err();
        assert!(matches!(err, SidecarError::Cancelled));
    }

    #[tokio::test]
    async fn direct_call_without_route() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");

        let err = call_direct(&state, Target::service("billing"), Invocation::post("/", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::NoDirectRoute(_)));
    }

    #[tokio::test]
    async fn store_round_trip() {
        let bus = MemoryBus::new();
        let state = state_on(&bus, "car-a");

        assert!(matches!(
            get(&state, "user").await,
            Err(SidecarError::KeyNotFound(_))
        ));

        set(&state, "user", "alice").await.unwrap();
        assert_eq!(get(&state, "user").await.unwrap(), "alice");
        assert_eq!(
            state.kv().get("state:user").await.unwrap(),
            Some(b"alice".to_vec())
        );

        assert_eq!(del(&state, "user").await.unwrap(), 1);
        assert_eq!(del(&state, "user").await.unwrap(), 0);
    }
}
