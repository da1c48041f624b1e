//! Common types used across the protocol.

use std::fmt;

/// Correlation ID linking a `call` (or promise) to its later `callback`.
///
/// Generated ids are random UUIDs. Ids received from other sidecars are
/// accepted verbatim as long as they are not empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a fresh random request id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an id received from the wire or from an HTTP caller.
    ///
    /// Surrounding whitespace is trimmed; returns `None` for an empty id.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a logical actor instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorRef {
    pub actor_type: String,
    pub id: String,
}

impl ActorRef {
    pub fn new(actor_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            actor_type: actor_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.actor_type, self.id)
    }
}

/// Result of a relayed HTTP call, carried back to the origin in a `callback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status_code: u16,
    pub content_type: String,
    pub payload: String,
}

impl Reply {
    pub fn new(status_code: u16, content_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            status_code,
            content_type: content_type.into(),
            payload: payload.into(),
        }
    }

    /// Synthetic reply used when the callee could not be reached at all.
    #[must_use]
    pub fn bad_gateway() -> Self {
        Self::new(502, "text/plain", "Bad Gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn parse_trims_and_rejects_empty() {
        assert_eq!(RequestId::parse("  r1\n").unwrap().as_str(), "r1");
        assert!(RequestId::parse("").is_none());
        assert!(RequestId::parse(" \t").is_none());
    }

    #[test]
    fn actor_display() {
        assert_eq!(ActorRef::new("Counter", "42").to_string(), "Counter[42]");
    }
}
