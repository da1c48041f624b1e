//! Wire protocol for tether sidecars.
//!
//! Sidecars exchange [`Envelope`]s over a shared publish/subscribe bus. On the
//! bus an envelope is a flat string map:
//!
//! ```text
//! protocol=service to=greeter command=call method=POST path=/hello
//! from=<origin sidecar> request=<correlation id> payload=...
//! ```
//!
//! Every `call` is answered by exactly one `callback` addressed to the origin
//! sidecar (`protocol=sidecar to=<from>`) echoing the `request` id.
//!
//! # Example
//!
//! ```
//! use tether_proto::{Envelope, Invocation, ReplyTo, RequestId, Target};
//!
//! let call = Envelope::Call {
//!     target: Target::service("greeter"),
//!     invocation: Invocation::post("/hello", "world"),
//!     reply_to: ReplyTo { from: "sidecar-a".into(), request: RequestId::generate() },
//! };
//! let wire = call.encode();
//! assert_eq!(Envelope::decode(&wire).unwrap(), call);
//! ```

mod envelope;
mod error;
mod types;

pub use envelope::{
    keys, normalise_path, Command, Envelope, Invocation, Message, Protocol, ReplyTo, Route, Target,
};
pub use error::ProtocolError;
pub use types::{ActorRef, Reply, RequestId};
