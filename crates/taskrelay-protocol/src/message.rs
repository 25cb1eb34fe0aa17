//! Relay wire messages.
//!
//! Frames are JSON arrays sent as WebSocket text:
//!
//! ```text
//! client → relay   ["REQ", subId, filter...]  ["EVENT", event]  ["CLOSE", subId]
//! relay → client   ["EVENT", subId, event]    ["EOSE", subId]
//!                  ["OK", id, accepted, msg]  ["NOTICE", msg]   ["CLOSED", subId, msg]
//! ```

use crate::error::{Error, Result};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#b", skip_serializing_if = "Option::is_none")]
    pub scope_tags: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn scope_tag(mut self, tag: impl Into<String>) -> Self {
        self.scope_tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn d_tag(mut self, tag: impl Into<String>) -> Self {
        self.d_tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Messages a client sends to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(Event),
    Close(String),
}

impl ClientMessage {
    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Event(event) => {
                Value::Array(vec![Value::from("EVENT"), serde_json::to_value(event)?])
            }
            ClientMessage::Close(subscription_id) => Value::Array(vec![
                Value::from("CLOSE"),
                Value::from(subscription_id.as_str()),
            ]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Messages a relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Eose(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| Error::InvalidMessage("frame is not an array".into()))?;
        let label = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessage("missing frame label".into()))?;

        let str_at = |index: usize| -> Result<String> {
            frame
                .get(index)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidMessage(format!("{label}: missing field {index}")))
        };

        match label {
            "EVENT" => {
                let subscription_id = str_at(1)?;
                let raw = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| Error::InvalidMessage("EVENT: missing event".into()))?;
                let event: Event = serde_json::from_value(raw)?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(RelayMessage::Eose(str_at(1)?)),
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(1)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            other => Err(Error::InvalidMessage(format!("unknown label {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{UnsignedEvent, KIND_ENTITY, KIND_SCOPE_METADATA};
    use crate::keys::Identity;

    #[test]
    fn req_frame_uses_tag_filter_names() {
        let msg = ClientMessage::Req {
            subscription_id: "sub1".into(),
            filters: vec![Filter::new()
                .kinds([KIND_SCOPE_METADATA, KIND_ENTITY])
                .scope_tag("abc")],
        };
        let json = msg.to_json().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0], "REQ");
        assert_eq!(parsed[1], "sub1");
        assert_eq!(parsed[2]["#b"][0], "abc");
        assert_eq!(parsed[2]["kinds"][1], 30301);
        assert!(parsed[2].get("since").is_none());
    }

    #[test]
    fn close_frame() {
        let json = ClientMessage::Close("sub1".into()).to_json().unwrap();
        assert_eq!(json, r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn event_frame_parses_back() {
        let identity = Identity::generate();
        let event = UnsignedEvent::new(KIND_ENTITY, "{}")
            .tag("d", "t1")
            .sign(&identity, 10)
            .unwrap();
        let inbound = format!(
            r#"["EVENT","sub1",{}]"#,
            serde_json::to_string(&event).unwrap()
        );
        match RelayMessage::from_json(&inbound).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(*parsed, event);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn control_frames_parse() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s"]"#).unwrap(),
            RelayMessage::Eose("s".into())
        );
        assert_eq!(
            RelayMessage::from_json(r#"["OK","abc",false,"blocked: rate"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: false,
                message: "blocked: rate".into(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","hello"]"#).unwrap(),
            RelayMessage::Notice("hello".into())
        );
        assert!(matches!(
            RelayMessage::from_json(r#"["CLOSED","s"]"#).unwrap(),
            RelayMessage::Closed { .. }
        ));
    }

    #[test]
    fn garbage_frames_are_rejected() {
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json(r#"["AUTH","x"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","s"]"#).is_err());
        assert!(RelayMessage::from_json("not json").is_err());
    }
}
