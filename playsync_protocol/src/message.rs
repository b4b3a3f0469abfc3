// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by simulation clients to the relay. Requests carry
//   a `request_id`; notifications do not.
// - `ServerMessage`: sent by the relay. Every request is answered by exactly
//   one `Response` echoing its `request_id`, so several requests may be in
//   flight on one connection. Everything else is a push.
//
// Every message after `Open` restates the `play_id` the connection opened;
// the relay rejects a mismatch with `BadRequest`.
//
// Tick lists in responses are compressed with `codec::pack`, the same form
// as the `TickPack` pushes.

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::types::{
    Event, GetStartPointOptions, GetTickListOptions, Permission, PlayEndReason, PlayId,
    StartPoint, TickPack,
};

/// Correlates a `Response` with the request that caused it.
pub type RequestId = u64;

/// Wire names of the `ClientMessage` variants that expect a `Response`.
pub const REQUEST_KINDS: [&str; 8] = [
    "Open",
    "Close",
    "Authenticate",
    "GetTickList",
    "PutStartPoint",
    "GetStartPoint",
    "GetStorageData",
    "PutStorageData",
];

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Bind this connection to a play.
    Open {
        request_id: RequestId,
        play_id: PlayId,
    },
    /// Leave the play and unbind the connection.
    Close {
        request_id: RequestId,
        play_id: PlayId,
    },
    /// Exchange a play token for a permission.
    Authenticate {
        request_id: RequestId,
        play_id: PlayId,
        token: String,
    },
    /// One encoded `TickPack`. Kept as a raw value so a malformed pack is
    /// reported as `BadRequest` instead of failing the whole frame.
    SendTickPack {
        play_id: PlayId,
        pack: serde_json::Value,
    },
    SendEvent { play_id: PlayId, event: Event },
    SubscribeTick { play_id: PlayId },
    UnsubscribeTick { play_id: PlayId },
    SubscribeEvent { play_id: PlayId },
    UnsubscribeEvent { play_id: PlayId },
    GetTickList {
        request_id: RequestId,
        play_id: PlayId,
        options: GetTickListOptions,
    },
    PutStartPoint {
        request_id: RequestId,
        play_id: PlayId,
        start_point: StartPoint,
    },
    GetStartPoint {
        request_id: RequestId,
        play_id: PlayId,
        options: GetStartPointOptions,
    },
    /// Arbitrary key/value storage. Always answered with `NotImplemented`.
    GetStorageData {
        request_id: RequestId,
        play_id: PlayId,
        keys: serde_json::Value,
    },
    /// Arbitrary key/value storage. Always answered with `NotImplemented`.
    PutStorageData {
        request_id: RequestId,
        play_id: PlayId,
        key: serde_json::Value,
        value: serde_json::Value,
    },
}

impl ClientMessage {
    /// The request id, or `None` for notifications.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Open { request_id, .. }
            | ClientMessage::Close { request_id, .. }
            | ClientMessage::Authenticate { request_id, .. }
            | ClientMessage::GetTickList { request_id, .. }
            | ClientMessage::PutStartPoint { request_id, .. }
            | ClientMessage::GetStartPoint { request_id, .. }
            | ClientMessage::GetStorageData { request_id, .. }
            | ClientMessage::PutStorageData { request_id, .. } => Some(*request_id),
            ClientMessage::SendTickPack { .. }
            | ClientMessage::SendEvent { .. }
            | ClientMessage::SubscribeTick { .. }
            | ClientMessage::UnsubscribeTick { .. }
            | ClientMessage::SubscribeEvent { .. }
            | ClientMessage::UnsubscribeEvent { .. } => None,
        }
    }

    /// The `request_id` of a frame that has the outer shape of a request but
    /// did not parse as one, so the failure can still be answered with a
    /// `Response`. `None` for anything else.
    pub fn recover_request_id(value: &serde_json::Value) -> Option<RequestId> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let (kind, body) = object.iter().next()?;
        if !REQUEST_KINDS.contains(&kind.as_str()) {
            return None;
        }
        body.get("request_id")?.as_u64()
    }

    /// The play this message is addressed to.
    pub fn play_id(&self) -> &PlayId {
        match self {
            ClientMessage::Open { play_id, .. }
            | ClientMessage::Close { play_id, .. }
            | ClientMessage::Authenticate { play_id, .. }
            | ClientMessage::SendTickPack { play_id, .. }
            | ClientMessage::SendEvent { play_id, .. }
            | ClientMessage::SubscribeTick { play_id }
            | ClientMessage::UnsubscribeTick { play_id }
            | ClientMessage::SubscribeEvent { play_id }
            | ClientMessage::UnsubscribeEvent { play_id }
            | ClientMessage::GetTickList { play_id, .. }
            | ClientMessage::PutStartPoint { play_id, .. }
            | ClientMessage::GetStartPoint { play_id, .. }
            | ClientMessage::GetStorageData { play_id, .. }
            | ClientMessage::PutStorageData { play_id, .. } => play_id,
        }
    }
}

/// Successful payload of a `Response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Ack,
    Permission(Permission),
    /// `None` means "no data": nothing was accepted in the range yet.
    TickList(Option<Vec<TickPack>>),
    StartPoint(Option<StartPoint>),
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Answer to the request with the same id.
    Response {
        request_id: RequestId,
        result: Result<ResponseBody, ErrorPayload>,
    },
    /// A notification from this connection failed.
    NotificationFailed { error: ErrorPayload },
    /// A newly accepted tick.
    TickPack { pack: TickPack },
    /// A newly sent event.
    Event { event: Event },
    /// The play was terminated from outside; the relay closes the
    /// connection after this.
    PlayEnd { reason: PlayEndReason },
    /// The play's lifetime was extended.
    PlayExtend {
        /// New expiry, milliseconds since the Unix epoch.
        expires_at: i64,
        remaining_ms: u64,
    },
}
