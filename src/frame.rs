//! Wire frame codec (C1, spec §4.1, §6).
//!
//! A [`Frame`] is the application-level message carried inside
//! `relay:send`/`relay:deliver` envelopes. An [`Envelope`] is the outer
//! Relay↔Client message. Both decode through a tolerant path: an unknown
//! `type` never fails the parse, it becomes `Frame::Unknown`/
//! `Envelope::Unknown` so one bad or newer-version message never takes down
//! a session (§7 "Protocol" policy).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{DeviceId, MessageStatus, ReactionEmoji, SyncMessage};

pub type FrameId = String;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatTextPayload {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatAckPayload {
    pub ack_message_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatReactPayload {
    pub target_message_id: String,
    pub reaction: Option<ReactionEmoji>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeletePayload {
    pub target_message_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClearScope {
    Dm,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatClearPayload {
    pub scope: ClearScope,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatForgetPayload {
    pub scope: ClearScope,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSyncRequestPayload {
    pub since: i64,
    pub limit: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSyncResponsePayload {
    pub messages: Vec<SyncMessage>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileOfferPayload {
    pub file_id: String,
    pub message_id: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkPayload {
    pub file_id: String,
    pub index: u64,
    pub total: u64,
    pub data_base64: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileCompletePayload {
    pub file_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub is_typing: bool,
}

/// The type-specific payload of a [`Frame`]. Serialized flat alongside the
/// frame's other fields via the custom `Serialize`/`Deserialize` impls
/// below, since the wire shape is `{ type, messageId, from, to, createdAt,
/// payload }` rather than an internally-tagged enum.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    ChatText(ChatTextPayload),
    ChatAck(ChatAckPayload),
    ChatReact(ChatReactPayload),
    ChatDelete(ChatDeletePayload),
    ChatClear(ChatClearPayload),
    ChatForget(ChatForgetPayload),
    ChatSyncRequest(ChatSyncRequestPayload),
    ChatSyncResponse(ChatSyncResponsePayload),
    Announce(AnnouncePayload),
    FileOffer(FileOfferPayload),
    FileChunk(FileChunkPayload),
    FileComplete(FileCompletePayload),
    Typing(TypingPayload),
    /// Any `type` not in the closed set above (§4.1 "unknown type values
    /// must be discarded without closing the connection").
    Unknown,
}

impl FramePayload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            FramePayload::ChatText(_) => "chat:text",
            FramePayload::ChatAck(_) => "chat:ack",
            FramePayload::ChatReact(_) => "chat:react",
            FramePayload::ChatDelete(_) => "chat:delete",
            FramePayload::ChatClear(_) => "chat:clear",
            FramePayload::ChatForget(_) => "chat:forget",
            FramePayload::ChatSyncRequest(_) => "chat:sync:request",
            FramePayload::ChatSyncResponse(_) => "chat:sync:response",
            FramePayload::Announce(_) => "announce",
            FramePayload::FileOffer(_) => "file:offer",
            FramePayload::FileChunk(_) => "file:chunk",
            FramePayload::FileComplete(_) => "file:complete",
            FramePayload::Typing(_) => "typing",
            FramePayload::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_id: FrameId,
    pub from: DeviceId,
    /// `None` means broadcast (spec §4.1 `to: deviceId | null`).
    pub to: Option<DeviceId>,
    pub created_at: i64,
    pub payload: FramePayload,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: String,
    message_id: String,
    from: String,
    to: Option<String>,
    created_at: i64,
    payload: Value,
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let payload = match &self.payload {
            FramePayload::ChatText(p) => serde_json::to_value(p),
            FramePayload::ChatAck(p) => serde_json::to_value(p),
            FramePayload::ChatReact(p) => serde_json::to_value(p),
            FramePayload::ChatDelete(p) => serde_json::to_value(p),
            FramePayload::ChatClear(p) => serde_json::to_value(p),
            FramePayload::ChatForget(p) => serde_json::to_value(p),
            FramePayload::ChatSyncRequest(p) => serde_json::to_value(p),
            FramePayload::ChatSyncResponse(p) => serde_json::to_value(p),
            FramePayload::Announce(p) => serde_json::to_value(p),
            FramePayload::FileOffer(p) => serde_json::to_value(p),
            FramePayload::FileChunk(p) => serde_json::to_value(p),
            FramePayload::FileComplete(p) => serde_json::to_value(p),
            FramePayload::Typing(p) => serde_json::to_value(p),
            FramePayload::Unknown => Ok(Value::Null),
        }
        .map_err(serde::ser::Error::custom)?;

        let wire = WireFrame {
            frame_type: self.payload.type_tag().to_string(),
            message_id: self.message_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            created_at: self.created_at,
            payload,
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireFrame::deserialize(deserializer)?;
        let payload = decode_payload(&wire.frame_type, wire.payload);
        Ok(Frame {
            message_id: wire.message_id,
            from: wire.from,
            to: wire.to,
            created_at: wire.created_at,
            payload,
        })
    }
}

fn decode_payload(frame_type: &str, value: Value) -> FramePayload {
    fn decode<T: for<'a> Deserialize<'a>>(value: Value) -> Option<T> {
        serde_json::from_value(value).ok()
    }

    match frame_type {
        "chat:text" => decode(value).map(FramePayload::ChatText),
        "chat:ack" => decode(value).map(FramePayload::ChatAck),
        "chat:react" => decode(value).map(FramePayload::ChatReact),
        "chat:delete" => decode(value).map(FramePayload::ChatDelete),
        "chat:clear" => decode(value).map(FramePayload::ChatClear),
        "chat:forget" => decode(value).map(FramePayload::ChatForget),
        "chat:sync:request" => decode(value).map(FramePayload::ChatSyncRequest),
        "chat:sync:response" => decode(value).map(FramePayload::ChatSyncResponse),
        "announce" => decode(value).map(FramePayload::Announce),
        "file:offer" => decode(value).map(FramePayload::FileOffer),
        "file:chunk" => decode(value).map(FramePayload::FileChunk),
        "file:complete" => decode(value).map(FramePayload::FileComplete),
        "typing" => decode(value).map(FramePayload::Typing),
        _ => None,
    }
    .unwrap_or(FramePayload::Unknown)
}

/// Error code carried by a `relay:error` envelope (§4.4).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    NotReady,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayErrorPayload {
    pub code: RelayErrorCode,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelaySendAckPayload {
    pub frame_message_id: String,
    pub delivered_to: Vec<DeviceId>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDeltaPayload {
    pub op: PresenceOp,
    pub peer: Option<crate::models::Peer>,
    pub device_id: Option<DeviceId>,
    pub revision: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceOp {
    Upsert,
    Remove,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshotPayload {
    pub peers: Vec<crate::models::Peer>,
    pub revision: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementSnapshotPayload {
    pub frames: Vec<Frame>,
    pub reactions: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementExpiredPayload {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementReactionsPayload {
    pub message_id: String,
    pub reactions: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub profile: crate::models::Profile,
}

/// The outer Relay↔Client envelope (§4.4, §6). Unlike [`Frame`], every
/// variant's payload shape is known up front, so `#[serde(tag = "type")]`
/// is sufficient, plus a catch-all for forward compatibility.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Hello(HelloPayload),
    HelloOk,
    Heartbeat,
    Pong,
    UpdateProfile(HelloPayload),
    PresenceRequest,
    Presence(PresenceSnapshotPayload),
    PresenceDelta(PresenceDeltaPayload),
    Send(Frame),
    Deliver(Frame),
    SendAck(RelaySendAckPayload),
    AnnouncementSnapshot(AnnouncementSnapshotPayload),
    AnnouncementExpired(AnnouncementExpiredPayload),
    AnnouncementReactions(AnnouncementReactionsPayload),
    Error(RelayErrorPayload),
    Unknown,
}

impl Envelope {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "relay:hello",
            Envelope::HelloOk => "relay:hello:ok",
            Envelope::Heartbeat => "relay:heartbeat",
            Envelope::Pong => "relay:pong",
            Envelope::UpdateProfile(_) => "relay:updateProfile",
            Envelope::PresenceRequest => "relay:presence:request",
            Envelope::Presence(_) => "relay:presence",
            Envelope::PresenceDelta(_) => "relay:presence:delta",
            Envelope::Send(_) => "relay:send",
            Envelope::Deliver(_) => "relay:deliver",
            Envelope::SendAck(_) => "relay:send:ack",
            Envelope::AnnouncementSnapshot(_) => "relay:announcement:snapshot",
            Envelope::AnnouncementExpired(_) => "relay:announcement:expired",
            Envelope::AnnouncementReactions(_) => "relay:announcement:reactions",
            Envelope::Error(_) => "relay:error",
            Envelope::Unknown => "unknown",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let payload = match self {
            Envelope::Hello(p) | Envelope::UpdateProfile(p) => serde_json::to_value(p),
            Envelope::Presence(p) => serde_json::to_value(p),
            Envelope::PresenceDelta(p) => serde_json::to_value(p),
            Envelope::Send(f) | Envelope::Deliver(f) => serde_json::to_value(f),
            Envelope::SendAck(p) => serde_json::to_value(p),
            Envelope::AnnouncementSnapshot(p) => serde_json::to_value(p),
            Envelope::AnnouncementExpired(p) => serde_json::to_value(p),
            Envelope::AnnouncementReactions(p) => serde_json::to_value(p),
            Envelope::Error(p) => serde_json::to_value(p),
            Envelope::HelloOk
            | Envelope::Heartbeat
            | Envelope::Pong
            | Envelope::PresenceRequest
            | Envelope::Unknown => Ok(Value::Object(Default::default())),
        }
        .map_err(serde::ser::Error::custom)?;

        WireEnvelope {
            envelope_type: self.type_tag().to_string(),
            payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireEnvelope::deserialize(deserializer)?;
        fn decode<T: for<'a> Deserialize<'a>>(value: Value) -> Option<T> {
            serde_json::from_value(value).ok()
        }

        let envelope = match wire.envelope_type.as_str() {
            "relay:hello" => decode(wire.payload).map(Envelope::Hello),
            "relay:hello:ok" => Some(Envelope::HelloOk),
            "relay:heartbeat" => Some(Envelope::Heartbeat),
            "relay:pong" => Some(Envelope::Pong),
            "relay:updateProfile" => decode(wire.payload).map(Envelope::UpdateProfile),
            "relay:presence:request" => Some(Envelope::PresenceRequest),
            "relay:presence" => decode(wire.payload).map(Envelope::Presence),
            "relay:presence:delta" => decode(wire.payload).map(Envelope::PresenceDelta),
            "relay:send" => decode(wire.payload).map(Envelope::Send),
            "relay:deliver" => decode(wire.payload).map(Envelope::Deliver),
            "relay:send:ack" => decode(wire.payload).map(Envelope::SendAck),
            "relay:announcement:snapshot" => {
                decode(wire.payload).map(Envelope::AnnouncementSnapshot)
            }
            "relay:announcement:expired" => {
                decode(wire.payload).map(Envelope::AnnouncementExpired)
            }
            "relay:announcement:reactions" => {
                decode(wire.payload).map(Envelope::AnnouncementReactions)
            }
            "relay:error" => decode(wire.payload).map(Envelope::Error),
            _ => None,
        }
        .unwrap_or(Envelope::Unknown);

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_text_frame_round_trips() {
        let frame = Frame {
            message_id: "m1".to_string(),
            from: "a".to_string(),
            to: Some("b".to_string()),
            created_at: 1000,
            payload: FramePayload::ChatText(ChatTextPayload {
                text: "hello".to_string(),
            }),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"chat:text\""));
        let decoded: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn broadcast_frame_has_null_to() {
        let frame = Frame {
            message_id: "m2".to_string(),
            from: "a".to_string(),
            to: None,
            created_at: 1000,
            payload: FramePayload::Announce(AnnouncePayload {
                text: "hi all".to_string(),
            }),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json["to"].is_null());
    }

    #[test]
    fn unknown_frame_type_does_not_fail_parse() {
        let json = serde_json::json!({
            "type": "future:frame",
            "messageId": "m3",
            "from": "a",
            "to": null,
            "createdAt": 1,
            "payload": { "whatever": true }
        });
        let frame: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(frame.payload, FramePayload::Unknown);
    }

    #[test]
    fn unknown_envelope_type_does_not_fail_parse() {
        let json = serde_json::json!({ "type": "relay:somethingNew", "payload": {} });
        let envelope: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope, Envelope::Unknown);
    }

    #[test]
    fn hello_ok_round_trips_with_empty_payload() {
        let json = serde_json::to_value(Envelope::HelloOk).unwrap();
        let decoded: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, Envelope::HelloOk);
    }
}
