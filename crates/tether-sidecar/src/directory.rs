//! Static routes for direct (bus-less) invocations.

use std::collections::HashMap;

use tether_proto::Target;

/// Where a direct invocation goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectRoute<'a> {
    /// This sidecar's own application.
    Local,
    /// Base URL of another application.
    Remote(&'a str),
}

/// Maps service names and actor types to application base URLs.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    routes: HashMap<String, String>,
    service: Option<String>,
    actor_types: Vec<String>,
}

impl Directory {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self {
            routes,
            ..Self::default()
        }
    }

    /// Names served by the local application.
    #[must_use]
    pub fn with_local(mut self, service: Option<String>, actor_types: Vec<String>) -> Self {
        self.service = service;
        self.actor_types = actor_types;
        self
    }

    pub fn resolve(&self, target: &Target) -> Option<DirectRoute<'_>> {
        let (name, local) = match target {
            Target::Service { name, .. } => (name, self.service.as_ref() == Some(name)),
            Target::Actor { actor, .. } => (
                &actor.actor_type,
                self.actor_types.contains(&actor.actor_type),
            ),
        };

        if local {
            return Some(DirectRoute::Local);
        }
        self.routes.get(name).map(|url| DirectRoute::Remote(url))
    }
}
