// Core data types for the tick/event log.
//
// Shared by `message.rs` (protocol messages), `codec.rs` (tick compression),
// and the relay's store and registry (`playsync_relay::store`,
// `playsync_relay::registry`).
//
// - `Tick` is one simulation step, optionally carrying `Event`s.
// - `TickFrame` is a contiguous run of event-free frames; it only exists on
//   the wire, never in storage.
// - `TickPack` is the only shape ticks travel in: a bare frame number, a
//   full `Tick`, or a `TickFrame`. It is `#[serde(untagged)]` so a bare frame
//   is a JSON integer.
// - `StartPoint` is a full-state snapshot that lets a late joiner resume at
//   `frame` without replaying earlier ticks.
// - `Permission` has exactly two profiles, selected by `PermissionKind`.
//
// `PlayId` is validated on construction (and on deserialization) to
// `[A-Za-z0-9_-]{1,128}`. The store builds key prefixes from it, so the
// character set keeps one play's prefix from ever being a prefix of
// another's.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AmflowError;

/// Simulation step number.
pub type Frame = i64;

/// Longest accepted play id.
pub const MAX_PLAY_ID_LEN: usize = 128;

/// Identifier of one play (session). Never reused by the upstream allocator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayId(String);

impl PlayId {
    pub fn new(id: impl Into<String>) -> Result<Self, AmflowError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_PLAY_ID_LEN {
            return Err(AmflowError::bad_request(format!(
                "play id must be 1..={MAX_PLAY_ID_LEN} characters"
            )));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(AmflowError::bad_request(format!(
                "play id contains invalid characters: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PlayId {
    type Error = AmflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PlayId::new(value)
    }
}

impl From<PlayId> for String {
    fn from(id: PlayId) -> Self {
        id.0
    }
}

impl std::fmt::Display for PlayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority and structural flags of an event.
///
/// Bits 0-1 hold the priority; bit 3 marks the event ignorable (may be
/// left out of filtered replays); bit 4 marks it transient (broadcast live,
/// never persisted).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFlags(pub u8);

impl EventFlags {
    pub const PRIORITY_MASK: u8 = 0b0_0011;
    pub const IGNORABLE: u8 = 0b0_1000;
    pub const TRANSIENT: u8 = 0b1_0000;

    pub fn priority(self) -> u8 {
        self.0 & Self::PRIORITY_MASK
    }

    pub fn is_ignorable(self) -> bool {
        self.0 & Self::IGNORABLE != 0
    }

    pub fn is_transient(self) -> bool {
        self.0 & Self::TRANSIENT != 0
    }
}

/// An out-of-band input or control record.
///
/// The relay only looks at `flags`. Every other field is kept as it arrived,
/// whatever its name or shape, and serialized back next to `flags`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub flags: EventFlags,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Event {
    /// An event with no fields besides its flags.
    pub fn with_flags(flags: u8) -> Self {
        Self {
            flags: EventFlags(flags),
            fields: Map::new(),
        }
    }

    /// An event identified by a numeric `code` field.
    pub fn new(code: u32, flags: u8) -> Self {
        Self::with_flags(flags).with_field("code", code)
    }

    /// Set a field. `flags` is reserved for the bitmask and is left alone.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if name != "flags" {
            self.fields.insert(name, value.into());
        }
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Every field except `flags`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// One simulation step. Most ticks carry no events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub frame: Frame,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
}

impl Tick {
    pub fn bare(frame: Frame) -> Self {
        Self {
            frame,
            events: Vec::new(),
        }
    }

    pub fn with_events(frame: Frame, events: Vec<Event>) -> Self {
        Self { frame, events }
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Every frame in `from..=to` has no events. Wire-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickFrame {
    pub from: Frame,
    pub to: Frame,
}

/// Compact wire form of ticks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TickPack {
    /// A single event-free frame.
    Frame(Frame),
    /// A frame carrying events.
    Tick(Tick),
    /// A run of event-free frames.
    Range(TickFrame),
}

/// Full-state snapshot enabling catch-up from `frame`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartPoint {
    pub frame: Frame,
    /// Wall-clock time the snapshot was taken, in milliseconds.
    pub timestamp: i64,
    pub data: serde_json::Value,
}

/// Range query over persisted ticks: frames `begin..end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTickListOptions {
    pub begin: Frame,
    pub end: Frame,
    #[serde(default)]
    pub exclude_ignorable: bool,
}

/// Start-point selector. Both fields empty (or `frame == Some(0)`) selects
/// the earliest snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStartPointOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Which permission profile a token grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Active,
    Passive,
}

impl PermissionKind {
    /// Label persisted next to a token hash.
    pub fn label(self) -> &'static str {
        match self {
            PermissionKind::Active => "active",
            PermissionKind::Passive => "passive",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "active" => Some(PermissionKind::Active),
            "passive" => Some(PermissionKind::Passive),
            _ => None,
        }
    }

    pub fn permission(self) -> Permission {
        match self {
            PermissionKind::Active => Permission {
                write_tick: true,
                read_tick: true,
                subscribe_tick: true,
                send_event: true,
                subscribe_event: true,
                max_event_priority: 2,
            },
            PermissionKind::Passive => Permission {
                write_tick: false,
                read_tick: true,
                subscribe_tick: true,
                send_event: true,
                subscribe_event: false,
                max_event_priority: 2,
            },
        }
    }
}

/// Capabilities granted to an authenticated connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub write_tick: bool,
    pub read_tick: bool,
    pub subscribe_tick: bool,
    pub send_event: bool,
    pub subscribe_event: bool,
    pub max_event_priority: u8,
}

/// Why a play was terminated from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayEndReason {
    OwnerInitiated,
    Timeout,
    ContentDeleted,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_id_accepts_simple_ids() {
        assert!(PlayId::new("12345").is_ok());
        assert!(PlayId::new("play_a-1").is_ok());
    }

    #[test]
    fn play_id_rejects_separators_and_empty() {
        assert!(PlayId::new("").is_err());
        assert!(PlayId::new("a:b").is_err());
        assert!(PlayId::new("a/b").is_err());
        assert!(PlayId::new("x".repeat(MAX_PLAY_ID_LEN + 1)).is_err());
    }

    #[test]
    fn play_id_deserialization_validates() {
        let ok: PlayId = serde_json::from_str(r#""42""#).unwrap();
        assert_eq!(ok.as_str(), "42");
        assert!(serde_json::from_str::<PlayId>(r#""4:2""#).is_err());
    }

    #[test]
    fn event_flags_bits() {
        let flags = EventFlags(EventFlags::IGNORABLE | 2);
        assert!(flags.is_ignorable());
        assert!(!flags.is_transient());
        assert_eq!(flags.priority(), 2);
        assert!(EventFlags(EventFlags::TRANSIENT).is_transient());
    }

    #[test]
    fn events_keep_arbitrary_fields() {
        let wire = r#"{"flags":9,"kind":"move","args":[1,-2],"player":{"id":"p1"}}"#;
        let event: Event = serde_json::from_str(wire).unwrap();
        assert!(event.flags.is_ignorable());
        assert_eq!(event.flags.priority(), 1);
        assert_eq!(event.field("kind"), Some(&serde_json::json!("move")));
        assert_eq!(event.field("code"), None);
        assert_eq!(event.fields().len(), 3);

        let back: serde_json::Value = serde_json::to_value(&event).unwrap();
        let original: serde_json::Value = serde_json::from_str(wire).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn events_need_flags() {
        assert!(serde_json::from_str::<Event>(r#"{"code":1}"#).is_err());
        assert!(serde_json::from_str::<Event>(r#"{"flags":"high"}"#).is_err());
        let bare: Event = serde_json::from_str(r#"{"flags":0}"#).unwrap();
        assert_eq!(bare, Event::with_flags(0));
    }

    #[test]
    fn with_field_leaves_flags_alone() {
        let event = Event::with_flags(EventFlags::TRANSIENT).with_field("flags", 0);
        assert!(event.flags.is_transient());
        assert!(event.fields().is_empty());
    }

    #[test]
    fn tick_pack_wire_shapes() {
        assert_eq!(serde_json::to_string(&TickPack::Frame(7)).unwrap(), "7");
        assert_eq!(
            serde_json::to_string(&TickPack::Range(TickFrame { from: 1, to: 4 })).unwrap(),
            r#"{"from":1,"to":4}"#
        );
        assert_eq!(
            serde_json::to_string(&TickPack::Tick(Tick::bare(3))).unwrap(),
            r#"{"frame":3}"#
        );
    }

    #[test]
    fn tick_pack_parses_each_shape() {
        let frame: TickPack = serde_json::from_str("12").unwrap();
        assert_eq!(frame, TickPack::Frame(12));

        let range: TickPack = serde_json::from_str(r#"{"from":2,"to":9}"#).unwrap();
        assert_eq!(range, TickPack::Range(TickFrame { from: 2, to: 9 }));

        let tick: TickPack =
            serde_json::from_str(r#"{"frame":5,"events":[{"code":1,"flags":8}]}"#).unwrap();
        match tick {
            TickPack::Tick(t) => {
                assert_eq!(t.frame, 5);
                assert!(t.events[0].flags.is_ignorable());
            }
            other => panic!("expected Tick, got {other:?}"),
        }

        assert!(serde_json::from_str::<TickPack>(r#""seven""#).is_err());
    }

    #[test]
    fn permission_profiles() {
        let active = PermissionKind::Active.permission();
        assert!(active.write_tick && active.subscribe_event);

        let passive = PermissionKind::Passive.permission();
        assert!(!passive.write_tick);
        assert!(!passive.subscribe_event);
        assert!(passive.read_tick && passive.send_event && passive.subscribe_tick);
    }

    #[test]
    fn permission_labels_roundtrip() {
        for kind in [PermissionKind::Active, PermissionKind::Passive] {
            assert_eq!(PermissionKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(PermissionKind::from_label("admin"), None);
    }
}
