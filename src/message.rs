//! Wire codec: text payloads to typed protocol messages and back.
//!
//! Decoding happens in two steps. [`decode`] turns raw bytes into the generic
//! tagged array `[type, ...fields]`, and [`Message::from_parts`] applies the
//! per-type validator. Encoding is the inverse and round-trips losslessly.

use serde_json::Value;

use crate::{
    error::RelayError,
    event::{is_hex, Event},
    filter::Filter,
};

/// Longest accepted client-chosen subscription id.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

pub const UNPARSEABLE: &str = "unparseable message";
pub const NOT_AN_ARRAY: &str = "message is not an array";
pub const TYPE_MISSING: &str = "message type missing";
pub const TYPE_NOT_STRING: &str = "message type must be a string";

/// Message type tag, the first element of every wire array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Event,
    Req,
    Close,
    Ok,
    Eose,
    Notice,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "EVENT" => Self::Event,
            "REQ" => Self::Req,
            "CLOSE" => Self::Close,
            "OK" => Self::Ok,
            "EOSE" => Self::Eose,
            "NOTICE" => Self::Notice,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Req => "REQ",
            Self::Close => "CLOSE",
            Self::Ok => "OK",
            Self::Eose => "EOSE",
            Self::Notice => "NOTICE",
        }
    }
}

/// Machine-readable prefix of a command result reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonPrefix {
    Duplicate,
    Deleted,
    Blocked,
    Invalid,
    Pow,
    Restricted,
    Error,
}

impl ReasonPrefix {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "duplicate" => Self::Duplicate,
            "deleted" => Self::Deleted,
            "blocked" => Self::Blocked,
            "invalid" => Self::Invalid,
            "pow" => Self::Pow,
            "restricted" => Self::Restricted,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Deleted => "deleted",
            Self::Blocked => "blocked",
            Self::Invalid => "invalid",
            Self::Pow => "pow",
            Self::Restricted => "restricted",
            Self::Error => "error",
        }
    }
}

/// Body of an `OK` message (NIP-20 command result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub event_id: String,
    pub accepted: bool,
    /// Empty, or `<prefix>: <text>`.
    pub message: String,
}

impl CommandResult {
    pub fn accepted(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    pub fn rejected(event_id: impl Into<String>, prefix: ReasonPrefix, text: &str) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: false,
            message: format!("{}: {}", prefix.as_str(), text),
        }
    }

    pub fn prefix(&self) -> Option<ReasonPrefix> {
        let (prefix, _) = self.message.split_once(':')?;
        ReasonPrefix::from_prefix(prefix)
    }
}

/// Every protocol message the relay reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `["EVENT", <event>]`, client publishing.
    Event(Event),
    /// `["EVENT", <sub-id>, <event>]`, relay delivering to a subscription.
    SubscribedEvent { sub_id: String, event: Event },
    /// `["REQ", <sub-id>, <filter>...]`
    Req { sub_id: String, filters: Vec<Filter> },
    /// `["CLOSE", <sub-id>]`
    Close { sub_id: String },
    /// `["EOSE", <sub-id>]`, end of stored events.
    Eose { sub_id: String },
    /// `["OK", <event-id>, <bool>, <reason>]`
    Ok(CommandResult),
    /// `["NOTICE", <text>]`
    Notice(String),
}

/// Decode a raw payload into the generic tagged array.
///
/// The first element is guaranteed to be a string on success.
pub fn decode(payload: &[u8]) -> Result<Vec<Value>, RelayError> {
    let text = std::str::from_utf8(payload).map_err(|_| RelayError::bad_message(UNPARSEABLE))?;
    let value: Value =
        serde_json::from_str(text).map_err(|_| RelayError::bad_message(UNPARSEABLE))?;
    let Value::Array(parts) = value else {
        return Err(RelayError::bad_message(NOT_AN_ARRAY));
    };
    match parts.first() {
        None => Err(RelayError::bad_message(TYPE_MISSING)),
        Some(Value::String(_)) => Ok(parts),
        Some(_) => Err(RelayError::bad_message(TYPE_NOT_STRING)),
    }
}

/// Type tag of a decoded message, or `None` for an unknown tag.
pub fn message_type(parts: &[Value]) -> Option<MessageType> {
    parts
        .first()
        .and_then(Value::as_str)
        .and_then(MessageType::from_tag)
}

/// Raw type tag of a decoded message, for diagnostics.
pub fn type_tag(parts: &[Value]) -> &str {
    parts.first().and_then(Value::as_str).unwrap_or_default()
}

pub fn unrecognized(parts: &[Value]) -> RelayError {
    RelayError::bad_message(format!("unrecognized message type: {}", type_tag(parts)))
}

impl Message {
    /// Decode and validate a raw payload in one step.
    pub fn parse(payload: &[u8]) -> Result<Self, RelayError> {
        Self::from_parts(&decode(payload)?)
    }

    /// Validate a decoded array against its type's exact shape.
    pub fn from_parts(parts: &[Value]) -> Result<Self, RelayError> {
        let ty = message_type(parts).ok_or_else(|| unrecognized(parts))?;
        let name = ty.as_str();
        match ty {
            MessageType::Event => match parts {
                [_, event] => Ok(Self::Event(parse_event(event)?)),
                [_, sub_id, event] => Ok(Self::SubscribedEvent {
                    sub_id: parse_sub_id(sub_id)?,
                    event: parse_event(event)?,
                }),
                _ => Err(RelayError::bad_message(
                    "EVENT message must have 2 or 3 elements",
                )),
            },
            MessageType::Req => {
                let [_, sub_id, filters @ ..] = parts else {
                    return Err(RelayError::bad_message(
                        "REQ message must have a subscription id",
                    ));
                };
                Ok(Self::Req {
                    sub_id: parse_sub_id(sub_id)?,
                    filters: filters
                        .iter()
                        .map(Filter::from_value)
                        .collect::<Result<_, _>>()?,
                })
            }
            MessageType::Close | MessageType::Eose => {
                let [_, sub_id] = parts else {
                    return Err(arity(name, 2));
                };
                let sub_id = parse_sub_id(sub_id)?;
                Ok(if ty == MessageType::Close {
                    Self::Close { sub_id }
                } else {
                    Self::Eose { sub_id }
                })
            }
            MessageType::Ok => {
                let (id, accepted, message) = match parts {
                    [_, id, accepted] => (id, accepted, None),
                    [_, id, accepted, message] => (id, accepted, Some(message)),
                    _ => {
                        return Err(RelayError::bad_message(
                            "OK message must have 3 or 4 elements",
                        ))
                    }
                };
                let event_id = id
                    .as_str()
                    .filter(|id| is_hex(id, 64))
                    .ok_or_else(|| {
                        RelayError::bad_message("OK event id must be 64 lowercase hex characters")
                    })?;
                let accepted = accepted
                    .as_bool()
                    .ok_or_else(|| RelayError::bad_message("OK status must be a boolean"))?;
                let message = match message {
                    None => String::new(),
                    Some(m) => {
                        let m = m
                            .as_str()
                            .ok_or_else(|| RelayError::bad_message("OK reason must be a string"))?;
                        validate_reason(m)?;
                        m.to_string()
                    }
                };
                Ok(Self::Ok(CommandResult {
                    event_id: event_id.to_string(),
                    accepted,
                    message,
                }))
            }
            MessageType::Notice => match parts {
                [_, Value::String(text)] => Ok(Self::Notice(text.clone())),
                [_, _] => Err(RelayError::bad_message("NOTICE text must be a string")),
                _ => Err(arity(name, 2)),
            },
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Event(_) | Self::SubscribedEvent { .. } => MessageType::Event,
            Self::Req { .. } => MessageType::Req,
            Self::Close { .. } => MessageType::Close,
            Self::Eose { .. } => MessageType::Eose,
            Self::Ok(_) => MessageType::Ok,
            Self::Notice(_) => MessageType::Notice,
        }
    }

    /// Structured JSON array form.
    pub fn to_value(&self) -> Value {
        let tag = Value::from(self.message_type().as_str());
        let mut parts = vec![tag];
        match self {
            Self::Event(event) => parts.push(event_value(event)),
            Self::SubscribedEvent { sub_id, event } => {
                parts.push(sub_id.as_str().into());
                parts.push(event_value(event));
            }
            Self::Req { sub_id, filters } => {
                parts.push(sub_id.as_str().into());
                parts.extend(filters.iter().map(Filter::to_value));
            }
            Self::Close { sub_id } | Self::Eose { sub_id } => parts.push(sub_id.as_str().into()),
            Self::Ok(result) => {
                parts.push(result.event_id.as_str().into());
                parts.push(result.accepted.into());
                parts.push(result.message.as_str().into());
            }
            Self::Notice(text) => parts.push(text.as_str().into()),
        }
        Value::Array(parts)
    }

    /// Canonical JSON text ready for the transport.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

fn arity(name: &str, len: usize) -> RelayError {
    RelayError::bad_message(format!("{name} message must have {len} elements"))
}

fn parse_sub_id(val: &Value) -> Result<String, RelayError> {
    match val.as_str() {
        Some(id) if !id.is_empty() && id.chars().count() <= MAX_SUBSCRIPTION_ID_LEN => {
            Ok(id.to_string())
        }
        _ => Err(RelayError::bad_message(format!(
            "subscription id must be a non-empty string of at most {MAX_SUBSCRIPTION_ID_LEN} characters"
        ))),
    }
}

fn parse_event(val: &Value) -> Result<Event, RelayError> {
    if !val.is_object() {
        return Err(RelayError::bad_message("event must be an object"));
    }
    serde_json::from_value(val.clone())
        .map_err(|e| RelayError::bad_message(format!("invalid event object: {e}")))
}

fn event_value(event: &Event) -> Value {
    serde_json::to_value(event).unwrap_or(Value::Null)
}

/// Accept an empty reason or `<known prefix>: <text>`.
fn validate_reason(reason: &str) -> Result<(), RelayError> {
    if reason.is_empty() {
        return Ok(());
    }
    let valid = reason
        .split_once(':')
        .is_some_and(|(prefix, rest)| {
            ReasonPrefix::from_prefix(prefix).is_some() && rest.starts_with(' ')
        });
    if valid {
        Ok(())
    } else {
        Err(RelayError::bad_message(
            "OK reason must be empty or start with a known prefix",
        ))
    }
}
