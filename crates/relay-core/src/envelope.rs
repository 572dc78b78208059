use serde::{Deserialize, Serialize};

use crate::errors::EnvelopeError;
use crate::ids::Identifier;

/// Envelope kind, lowercase on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Join,
    Leave,
    Message,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Message => "message",
            Self::Ack => "ack",
        }
    }

    pub fn requires_channel(&self) -> bool {
        !matches!(self, Self::Ack)
    }
}

/// Application message exchanged with clients.
///
/// `{"type":"message","channel":"general","content":"hi","sender":"user42"}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: String,
}

impl Envelope {
    pub fn new(kind: MessageType, channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            channel: Some(channel.into()),
            content: content.into(),
            sender: String::new(),
        }
    }

    pub fn message(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageType::Message, channel, content)
    }

    pub fn ack(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Ack,
            channel: None,
            content: content.into(),
            sender: String::new(),
        }
    }

    /// Channel name, if present and non-empty.
    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    /// Channel name, or an error for kinds that must carry one.
    pub fn require_channel(&self) -> Result<&str, EnvelopeError> {
        self.channel_name().ok_or(EnvelopeError::MissingChannel {
            kind: self.kind.as_str(),
        })
    }

    /// Replace any client-supplied sender with the server-side form.
    pub fn stamp_sender(&mut self, id: Identifier) {
        self.sender = id.display_name();
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Decode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_message_envelope() {
        let raw = r#"{"type":"message","channel":"general","content":"hi","sender":"spoofed"}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.kind, MessageType::Message);
        assert_eq!(env.channel_name(), Some("general"));
        assert_eq!(env.content, "hi");
        assert_eq!(env.sender, "spoofed");
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let env = Envelope::decode(r#"{"type":"join","channel":"news"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Join);
        assert!(env.content.is_empty());
        assert!(env.sender.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Envelope::decode(r#"{"type":"shout","channel":"x"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode(_)));
    }

    #[test]
    fn ack_omits_channel_on_the_wire() {
        let json: serde_json::Value =
            serde_json::from_slice(&Envelope::ack("received").encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["content"], "received");
        assert!(json.get("channel").is_none());
        assert_eq!(json["sender"], "");
    }

    #[test]
    fn stamp_sender_overwrites_client_value() {
        let mut env = Envelope::decode(r#"{"type":"message","channel":"g","sender":"me"}"#).unwrap();
        env.stamp_sender(Identifier::from_raw(7));
        assert_eq!(env.sender, "user7");
    }

    #[test]
    fn empty_channel_is_missing() {
        let env = Envelope::decode(r#"{"type":"leave","channel":""}"#).unwrap();
        assert!(env.channel_name().is_none());
        assert!(matches!(
            env.require_channel(),
            Err(EnvelopeError::MissingChannel { kind: "leave" })
        ));
        assert!(!MessageType::Ack.requires_channel());
        assert!(MessageType::Leave.requires_channel());
    }
}
