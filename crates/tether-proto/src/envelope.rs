//! Envelope types for bus messages.
//!
//! On the bus an envelope is a flat string-keyed map. In memory it is a
//! tagged enum keyed by command, so each variant only carries the fields
//! that command needs and validation happens once, in [`Envelope::decode`].

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProtocolError;
use crate::types::{ActorRef, Reply, RequestId};

/// Wire representation understood by the bus.
pub type Message = BTreeMap<String, String>;

/// Keys of the wire representation.
pub mod keys {
    pub const PROTOCOL: &str = "protocol";
    pub const TO: &str = "to";
    pub const ID: &str = "id";
    pub const SESSION: &str = "session";
    pub const COMMAND: &str = "command";
    pub const METHOD: &str = "method";
    pub const PATH: &str = "path";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const ACCEPT: &str = "accept";
    pub const PAYLOAD: &str = "payload";
    pub const FROM: &str = "from";
    pub const REQUEST: &str = "request";
    pub const STATUS_CODE: &str = "statusCode";
}

/// What the `to` key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Service,
    Sidecar,
    Actor,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Sidecar => "sidecar",
            Self::Actor => "actor",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "service" => Ok(Self::Service),
            "sidecar" => Ok(Self::Sidecar),
            "actor" => Ok(Self::Actor),
            other => Err(ProtocolError::UnknownProtocol(other.to_owned())),
        }
    }
}

/// Command carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Fire-and-forget to a service.
    Send,
    /// Request expecting exactly one callback.
    Call,
    /// Fire-and-forget to an actor.
    Tell,
    /// Result of a call, addressed to the origin sidecar.
    Callback,
}

impl Command {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Call => "call",
            Self::Tell => "tell",
            Self::Callback => "callback",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "send" => Ok(Self::Send),
            "call" => Ok(Self::Call),
            "tell" => Ok(Self::Tell),
            "callback" => Ok(Self::Callback),
            other => Err(ProtocolError::UnknownCommand(other.to_owned())),
        }
    }
}

/// Bus addressing of an envelope.
///
/// Actors are routed by type; which instance owns a given id is decided by
/// the receiving sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Service(String),
    Actor(String),
    Sidecar(String),
}

impl Route {
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Service(_) => Protocol::Service,
            Self::Actor(_) => Protocol::Actor,
            Self::Sidecar(_) => Protocol::Sidecar,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Service(name) | Self::Actor(name) | Self::Sidecar(name) => name,
        }
    }

    /// Topic key used by bus backends.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.protocol().as_str(), self.name())
    }

    /// Reads the addressing of a raw message without decoding the rest.
    pub fn of(message: &Message) -> Result<Self, ProtocolError> {
        let protocol = Protocol::parse(field(message, keys::PROTOCOL).unwrap_or_default())?;
        let to = field(message, keys::TO)
            .ok_or(ProtocolError::MissingField {
                command: "any",
                field: keys::TO,
            })?
            .to_owned();
        Ok(match protocol {
            Protocol::Service => Self::Service(to),
            Protocol::Actor => Self::Actor(to),
            Protocol::Sidecar => Self::Sidecar(to),
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Logical destination of a send, tell or call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Service {
        name: String,
        session: Option<String>,
    },
    Actor {
        actor: ActorRef,
        session: Option<String>,
    },
}

impl Target {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service {
            name: name.into(),
            session: None,
        }
    }

    #[must_use]
    pub fn actor(actor: ActorRef) -> Self {
        Self::Actor {
            actor,
            session: None,
        }
    }

    #[must_use]
    pub fn with_session(self, session: Option<String>) -> Self {
        match self {
            Self::Service { name, .. } => Self::Service { name, session },
            Self::Actor { actor, .. } => Self::Actor { actor, session },
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::Service { session, .. } | Self::Actor { session, .. } => session.as_deref(),
        }
    }

    #[must_use]
    pub fn route(&self) -> Route {
        match self {
            Self::Service { name, .. } => Route::Service(name.clone()),
            Self::Actor { actor, .. } => Route::Actor(actor.actor_type.clone()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service { name, .. } => f.write_str(name),
            Self::Actor { actor, .. } => write!(f, "{actor}"),
        }
    }
}

/// The HTTP call being relayed to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub method: String,
    /// Always starts with `/`.
    pub path: String,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub payload: String,
}

impl Invocation {
    /// A POST of `payload` to `path`.
    pub fn post(path: impl AsRef<str>, payload: impl Into<String>) -> Self {
        Self {
            method: "POST".to_owned(),
            path: normalise_path(path.as_ref()),
            content_type: None,
            accept: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type.filter(|v| !v.is_empty());
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: Option<String>) -> Self {
        self.accept = accept.filter(|v| !v.is_empty());
        self
    }
}

/// Where the callback for a call must go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    /// Origin sidecar id.
    pub from: String,
    pub request: RequestId,
}

/// A routed unit of the sidecar protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Send {
        service: String,
        session: Option<String>,
        invocation: Invocation,
    },
    Tell {
        actor: ActorRef,
        session: Option<String>,
        invocation: Invocation,
    },
    Call {
        target: Target,
        invocation: Invocation,
        reply_to: ReplyTo,
    },
    Callback {
        /// Origin sidecar id of the call being answered.
        to: String,
        request: RequestId,
        reply: Reply,
    },
}

impl Envelope {
    /// Fire-and-forget envelope: `send` for services, `tell` for actors.
    #[must_use]
    pub fn one_way(target: Target, invocation: Invocation) -> Self {
        match target {
            Target::Service { name, session } => Self::Send {
                service: name,
                session,
                invocation,
            },
            Target::Actor { actor, session } => Self::Tell {
                actor,
                session,
                invocation,
            },
        }
    }

    /// The callback answering a call.
    #[must_use]
    pub fn callback_for(reply_to: &ReplyTo, reply: Reply) -> Self {
        Self::Callback {
            to: reply_to.from.clone(),
            request: reply_to.request.clone(),
            reply,
        }
    }

    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::Send { .. } => Command::Send,
            Self::Tell { .. } => Command::Tell,
            Self::Call { .. } => Command::Call,
            Self::Callback { .. } => Command::Callback,
        }
    }

    #[must_use]
    pub fn route(&self) -> Route {
        match self {
            Self::Send { service, .. } => Route::Service(service.clone()),
            Self::Tell { actor, .. } => Route::Actor(actor.actor_type.clone()),
            Self::Call { target, .. } => target.route(),
            Self::Callback { to, .. } => Route::Sidecar(to.clone()),
        }
    }

    /// Serialises to the bus representation. Absent optional fields are omitted.
    #[must_use]
    pub fn encode(&self) -> Message {
        let mut message = Message::new();
        message.insert(keys::COMMAND.to_owned(), self.command().as_str().to_owned());

        match self {
            Self::Send {
                service,
                session,
                invocation,
            } => {
                encode_target(
                    &mut message,
                    &Target::Service {
                        name: service.clone(),
                        session: session.clone(),
                    },
                );
                encode_invocation(&mut message, invocation);
            }
            Self::Tell {
                actor,
                session,
                invocation,
            } => {
                encode_target(
                    &mut message,
                    &Target::Actor {
                        actor: actor.clone(),
                        session: session.clone(),
                    },
                );
                encode_invocation(&mut message, invocation);
            }
            Self::Call {
                target,
                invocation,
                reply_to,
            } => {
                encode_target(&mut message, target);
                encode_invocation(&mut message, invocation);
                insert(&mut message, keys::FROM, &reply_to.from);
                insert(&mut message, keys::REQUEST, reply_to.request.as_str());
            }
            Self::Callback { to, request, reply } => {
                insert(&mut message, keys::PROTOCOL, Protocol::Sidecar.as_str());
                insert(&mut message, keys::TO, to);
                insert(&mut message, keys::REQUEST, request.as_str());
                insert(
                    &mut message,
                    keys::STATUS_CODE,
                    &reply.status_code.to_string(),
                );
                insert(&mut message, keys::CONTENT_TYPE, &reply.content_type);
                insert(&mut message, keys::PAYLOAD, &reply.payload);
            }
        }

        message
    }

    /// Parses and validates a bus message.
    pub fn decode(message: &Message) -> Result<Self, ProtocolError> {
        let command = Command::parse(field(message, keys::COMMAND).ok_or(
            ProtocolError::MissingField {
                command: "any",
                field: keys::COMMAND,
            },
        )?)?;
        let route = Route::of(message)?;
        let name = command.as_str();

        match command {
            Command::Callback => {
                let protocol = route.protocol();
                let Route::Sidecar(to) = route else {
                    return Err(ProtocolError::InvalidTarget {
                        command: name,
                        protocol: protocol.as_str(),
                    });
                };
                let request = request_id(message, name)?;
                let raw_status = required(message, keys::STATUS_CODE, name)?;
                let status_code =
                    raw_status
                        .parse::<u16>()
                        .map_err(|e| ProtocolError::InvalidField {
                            field: keys::STATUS_CODE,
                            reason: format!("{raw_status:?}: {e}"),
                        })?;
                Ok(Self::Callback {
                    to,
                    request,
                    reply: Reply {
                        status_code,
                        content_type: field(message, keys::CONTENT_TYPE)
                            .unwrap_or_default()
                            .to_owned(),
                        payload: field(message, keys::PAYLOAD).unwrap_or_default().to_owned(),
                    },
                })
            }
            Command::Send => {
                let target = decode_target(message, &route, name)?;
                let Target::Service { name: service, session } = target else {
                    return Err(ProtocolError::InvalidTarget {
                        command: name,
                        protocol: Protocol::Actor.as_str(),
                    });
                };
                Ok(Self::Send {
                    service,
                    session,
                    invocation: decode_invocation(message, name)?,
                })
            }
            Command::Tell => {
                let target = decode_target(message, &route, name)?;
                let Target::Actor { actor, session } = target else {
                    return Err(ProtocolError::InvalidTarget {
                        command: name,
                        protocol: Protocol::Service.as_str(),
                    });
                };
                Ok(Self::Tell {
                    actor,
                    session,
                    invocation: decode_invocation(message, name)?,
                })
            }
            Command::Call => Ok(Self::Call {
                target: decode_target(message, &route, name)?,
                invocation: decode_invocation(message, name)?,
                reply_to: ReplyTo {
                    from: required(message, keys::FROM, name)?.to_owned(),
                    request: request_id(message, name)?,
                },
            }),
        }
    }
}

/// Ensures a relayed path starts with exactly one `/`.
#[must_use]
pub fn normalise_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn field<'a>(message: &'a Message, key: &str) -> Option<&'a str> {
    message
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn required<'a>(
    message: &'a Message,
    key: &'static str,
    command: &'static str,
) -> Result<&'a str, ProtocolError> {
    field(message, key).ok_or(ProtocolError::MissingField {
        command,
        field: key,
    })
}

fn request_id(message: &Message, command: &'static str) -> Result<RequestId, ProtocolError> {
    required(message, keys::REQUEST, command)
        .map(RequestId::parse)?
        .ok_or(ProtocolError::MissingField {
            command,
            field: keys::REQUEST,
        })
}

fn insert(message: &mut Message, key: &str, value: &str) {
    if !value.is_empty() {
        message.insert(key.to_owned(), value.to_owned());
    }
}

fn encode_target(message: &mut Message, target: &Target) {
    match target {
        Target::Service { name, .. } => {
            insert(message, keys::PROTOCOL, Protocol::Service.as_str());
            insert(message, keys::TO, name);
        }
        Target::Actor { actor, .. } => {
            insert(message, keys::PROTOCOL, Protocol::Actor.as_str());
            insert(message, keys::TO, &actor.actor_type);
            insert(message, keys::ID, &actor.id);
        }
    }
    if let Some(session) = target.session() {
        insert(message, keys::SESSION, session);
    }
}

fn decode_target(
    message: &Message,
    route: &Route,
    command: &'static str,
) -> Result<Target, ProtocolError> {
    let session = field(message, keys::SESSION).map(str::to_owned);
    match route {
        Route::Service(name) => Ok(Target::Service {
            name: name.clone(),
            session,
        }),
        Route::Actor(actor_type) => Ok(Target::Actor {
            actor: ActorRef::new(actor_type.clone(), required(message, keys::ID, command)?),
            session,
        }),
        Route::Sidecar(_) => Err(ProtocolError::InvalidTarget {
            command,
            protocol: Protocol::Sidecar.as_str(),
        }),
    }
}

fn encode_invocation(message: &mut Message, invocation: &Invocation) {
    insert(message, keys::METHOD, &invocation.method);
    insert(message, keys::PATH, &invocation.path);
    if let Some(content_type) = &invocation.content_type {
        insert(message, keys::CONTENT_TYPE, content_type);
    }
    if let Some(accept) = &invocation.accept {
        insert(message, keys::ACCEPT, accept);
    }
    insert(message, keys::PAYLOAD, &invocation.payload);
}

fn decode_invocation(message: &Message, command: &'static str) -> Result<Invocation, ProtocolError> {
    let path = required(message, keys::PATH, command)?;
    Ok(Invocation {
        method: field(message, keys::METHOD).unwrap_or("POST").to_owned(),
        path: normalise_path(path),
        content_type: field(message, keys::CONTENT_TYPE).map(str::to_owned),
        accept: field(message, keys::ACCEPT).map(str::to_owned),
        payload: field(message, keys::PAYLOAD).unwrap_or_default().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn message(pairs: &[(&str, &str)]) -> Message {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn call_wire_format() {
        let envelope = Envelope::Call {
            target: Target::service("greeter").with_session(Some("s1".into())),
            invocation: Invocation::post("hello", "world")
                .with_content_type(Some("text/plain".into())),
            reply_to: ReplyTo {
                from: "sidecar-a".into(),
                request: RequestId::parse("r1").unwrap(),
            },
        };

        let wire = envelope.encode();
        assert_eq!(
            wire,
            message(&[
                ("protocol", "service"),
                ("to", "greeter"),
                ("session", "s1"),
                ("command", "call"),
                ("method", "POST"),
                ("path", "/hello"),
                ("content-type", "text/plain"),
                ("payload", "world"),
                ("from", "sidecar-a"),
                ("request", "r1"),
            ])
        );
        assert_eq!(Envelope::decode(&wire).unwrap(), envelope);
    }

    #[test]
    fn actor_call_carries_id() {
        let envelope = Envelope::Call {
            target: Target::actor(ActorRef::new("Counter", "42")),
            invocation: Invocation::post("/incr", "[1]"),
            reply_to: ReplyTo {
                from: "a".into(),
                request: RequestId::parse("r2").unwrap(),
            },
        };
        let wire = envelope.encode();
        assert_eq!(wire.get("protocol").map(String::as_str), Some("actor"));
        assert_eq!(wire.get("to").map(String::as_str), Some("Counter"));
        assert_eq!(wire.get("id").map(String::as_str), Some("42"));
        assert_eq!(envelope.route(), Route::Actor("Counter".into()));
        assert_eq!(Envelope::decode(&wire).unwrap(), envelope);
    }

    #[test]
    fn callback_keeps_empty_payload() {
        let reply_to = ReplyTo {
            from: "origin".into(),
            request: RequestId::parse("r3").unwrap(),
        };
        let envelope = Envelope::callback_for(&reply_to, Reply::new(204, "", ""));
        let wire = envelope.encode();
        assert!(!wire.contains_key("payload"));
        assert_eq!(wire.get("statusCode").map(String::as_str), Some("204"));
        assert_eq!(envelope.route(), Route::Sidecar("origin".into()));
        assert_eq!(Envelope::decode(&wire).unwrap(), envelope);
    }

    #[test]
    fn one_way_picks_command_from_target() {
        let send = Envelope::one_way(Target::service("s"), Invocation::post("/", ""));
        assert_eq!(send.command(), Command::Send);
        let tell = Envelope::one_way(
            Target::actor(ActorRef::new("T", "1")),
            Invocation::post("/", ""),
        );
        assert_eq!(tell.command(), Command::Tell);
    }

    #[test]
    fn missing_method_defaults_to_post() {
        let decoded = Envelope::decode(&message(&[
            ("protocol", "service"),
            ("to", "s"),
            ("command", "send"),
            ("path", "x"),
        ]))
        .unwrap();
        let Envelope::Send { invocation, .. } = decoded else {
            panic!("expected send");
        };
        assert_eq!(invocation.method, "POST");
        assert_eq!(invocation.path, "/x");
    }

    #[rstest]
    #[case::unknown_command(
        &[("protocol", "service"), ("to", "s"), ("command", "poke"), ("path", "/")],
        ProtocolError::UnknownCommand("poke".into())
    )]
    #[case::unknown_protocol(
        &[("protocol", "carrier-pigeon"), ("to", "s"), ("command", "send"), ("path", "/")],
        ProtocolError::UnknownProtocol("carrier-pigeon".into())
    )]
    #[case::missing_command(
        &[("protocol", "service"), ("to", "s")],
        ProtocolError::MissingField { command: "any", field: "command" }
    )]
    #[case::call_without_request(
        &[("protocol", "service"), ("to", "s"), ("command", "call"), ("path", "/"), ("from", "a")],
        ProtocolError::MissingField { command: "call", field: "request" }
    )]
    #[case::call_without_from(
        &[("protocol", "service"), ("to", "s"), ("command", "call"), ("path", "/"), ("request", "r")],
        ProtocolError::MissingField { command: "call", field: "from" }
    )]
    #[case::callback_to_service(
        &[("protocol", "service"), ("to", "s"), ("command", "callback"), ("request", "r"), ("statusCode", "200")],
        ProtocolError::InvalidTarget { command: "callback", protocol: "service" }
    )]
    #[case::send_to_actor(
        &[("protocol", "actor"), ("to", "T"), ("id", "1"), ("command", "send"), ("path", "/")],
        ProtocolError::InvalidTarget { command: "send", protocol: "actor" }
    )]
    #[case::tell_to_service(
        &[("protocol", "service"), ("to", "s"), ("command", "tell"), ("path", "/")],
        ProtocolError::InvalidTarget { command: "tell", protocol: "service" }
    )]
    #[case::actor_without_id(
        &[("protocol", "actor"), ("to", "T"), ("command", "tell"), ("path", "/")],
        ProtocolError::MissingField { command: "tell", field: "id" }
    )]
    fn rejects_malformed(#[case] pairs: &[(&str, &str)], #[case] expected: ProtocolError) {
        assert_eq!(Envelope::decode(&message(pairs)).unwrap_err(), expected);
    }

    #[test]
    fn rejects_non_numeric_status() {
        let err = Envelope::decode(&message(&[
            ("protocol", "sidecar"),
            ("to", "a"),
            ("command", "callback"),
            ("request", "r"),
            ("statusCode", "ok"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidField {
                field: "statusCode",
                ..
            }
        ));
    }

    #[test]
    fn route_of_raw_message() {
        let raw = message(&[("protocol", "sidecar"), ("to", "abc"), ("command", "bogus")]);
        assert_eq!(Route::of(&raw).unwrap(), Route::Sidecar("abc".into()));
        assert_eq!(Route::of(&raw).unwrap().key(), "sidecar:abc");
    }
}
