//! Tether sidecar.
//!
//! Runs next to an application process and connects it to the other
//! applications of the deployment. Outbound invocations arrive over HTTP and
//! are published on a shared bus; inbound messages are taken off the bus and
//! relayed to the application. Calls are correlated with their callbacks
//! through a table of pending requests.

pub mod config;
pub mod correlation;
pub mod delivery;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod invoke;
pub mod launcher;
pub mod lifecycle;
pub mod placement;
pub mod retry;
pub mod server;
pub mod state;

pub use config::SidecarConfig;
pub use error::SidecarError;
pub use lifecycle::Sidecar;
pub use state::{Identity, SidecarState};
