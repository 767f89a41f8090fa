//! Log event data model.
//!
//! A [`LogEvent`] is the atomic unit that flows through the engine. The
//! in-memory form carries a few UI-only fields (`original`, `open`,
//! `children`) that never leave the process; [`LogEventWire`] is the strict
//! subset that goes onto the relay.
//!
//! `metadata` stays an open JSON map so unknown keys round-trip, but the
//! keys the engine actually reads are exposed through typed views keyed by
//! [`EventType`] (see [`LogEvent::details`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open metadata bag attached to every event.
pub type Metadata = serde_json::Map<String, Value>;

/// Recognized metadata keys.
pub mod keys {
    pub const KILLER_NAME: &str = "killerName";
    pub const VICTIM_NAME: &str = "victimName";
    pub const IS_AI_VICTIM: &str = "isAIVictim";
    pub const CAUSE_NAME: &str = "causeName";
    pub const DAMAGE_TYPE: &str = "damageType";
    pub const VEHICLE_NAME: &str = "vehicleName";
    pub const VEHICLE_ID: &str = "vehicleId";
    pub const IS_AI_VEHICLE: &str = "isAIVehicle";
    pub const KILL_COUNT: &str = "killCount";
    pub const VICTIMS: &str = "victims";
    pub const START_TIME: &str = "startTime";
    pub const END_TIME: &str = "endTime";
}

/// Event type tag.
///
/// Unknown tags are preserved verbatim in [`EventType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ActorDeath,
    Destruction,
    VehicleControlFlow,
    QuantumTravel,
    QuantumArrival,
    KillingSpree,
    BountyKillGroup,
    LocationChange,
    LandingPad,
    SystemQuit,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ActorDeath => "actor_death",
            EventType::Destruction => "destruction",
            EventType::VehicleControlFlow => "vehicle_control_flow",
            EventType::QuantumTravel => "quantum_travel",
            EventType::QuantumArrival => "quantum_arrival",
            EventType::KillingSpree => "killing_spree",
            EventType::BountyKillGroup => "bounty_kill_group",
            EventType::LocationChange => "location_change",
            EventType::LandingPad => "landing_pad",
            EventType::SystemQuit => "system_quit",
            EventType::Other(tag) => tag,
        }
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "actor_death" => EventType::ActorDeath,
            "destruction" => EventType::Destruction,
            "vehicle_control_flow" => EventType::VehicleControlFlow,
            "quantum_travel" => EventType::QuantumTravel,
            "quantum_arrival" => EventType::QuantumArrival,
            "killing_spree" => EventType::KillingSpree,
            "bounty_kill_group" => EventType::BountyKillGroup,
            "location_change" => EventType::LocationChange,
            "landing_pad" => EventType::LandingPad,
            "system_quit" => EventType::SystemQuit,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        EventType::from(tag.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timestamped gameplay event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Content-derived id, unique within one log stream.
    pub id: String,
    /// Account id of the user whose client emitted the event. Written as
    /// `sourceUserId`; the older `userId` spelling is still read.
    #[serde(rename = "sourceUserId", alias = "userId")]
    pub user_id: String,
    /// In-game character name at emission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    pub event_type: EventType,
    /// ISO-8601; authoritative for ordering within one source.
    pub timestamp: String,
    #[serde(default)]
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
    /// Only populated on composite events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LogEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
}

impl LogEvent {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        event_type: EventType,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            player: None,
            event_type,
            timestamp: timestamp.into(),
            line: String::new(),
            original: None,
            metadata: Metadata::new(),
            children: Vec::new(),
            open: None,
        }
    }

    pub fn with_player(mut self, player: impl Into<String>) -> Self {
        self.player = Some(player.into());
        self
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.line = line.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Parsed timestamp, `None` if the stored string is not valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Boolean metadata flag. Accepts JSON booleans and the strings "true"/"false".
    pub fn meta_flag(&self, key: &str) -> bool {
        match self.metadata.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Typed view of the metadata keys recognized for this event type.
    pub fn details(&self) -> EventDetails<'_> {
        match self.event_type {
            EventType::ActorDeath => EventDetails::ActorDeath(ActorDeath {
                killer_name: self.meta_str(keys::KILLER_NAME),
                victim_name: self.meta_str(keys::VICTIM_NAME),
                is_ai_victim: self.meta_flag(keys::IS_AI_VICTIM),
                damage_type: self.meta_str(keys::DAMAGE_TYPE),
            }),
            EventType::Destruction => EventDetails::Destruction(Destruction {
                vehicle_name: self.meta_str(keys::VEHICLE_NAME),
                vehicle_id: self.meta_str(keys::VEHICLE_ID),
                cause_name: self.meta_str(keys::CAUSE_NAME),
                is_ai_vehicle: self.meta_flag(keys::IS_AI_VEHICLE),
            }),
            EventType::KillingSpree => EventDetails::KillingSpree(Spree {
                kill_count: self
                    .metadata
                    .get(keys::KILL_COUNT)
                    .and_then(Value::as_u64)
                    .unwrap_or(self.children.len() as u64),
                victims: self
                    .metadata
                    .get(keys::VICTIMS)
                    .and_then(Value::as_array)
                    .map(|v| v.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default(),
            }),
            _ => EventDetails::Other,
        }
    }

    /// True when this is an `actor_death` logged by the killer themself.
    pub fn is_kill(&self) -> bool {
        match (self.details(), self.player.as_deref()) {
            (EventDetails::ActorDeath(death), Some(player)) => death.killer_name == Some(player),
            _ => false,
        }
    }
}

/// Parse an ISO-8601 / RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Recognized keys of an `actor_death` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorDeath<'a> {
    pub killer_name: Option<&'a str>,
    pub victim_name: Option<&'a str>,
    pub is_ai_victim: bool,
    pub damage_type: Option<&'a str>,
}

/// Recognized keys of a `destruction` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Destruction<'a> {
    pub vehicle_name: Option<&'a str>,
    pub vehicle_id: Option<&'a str>,
    pub cause_name: Option<&'a str>,
    pub is_ai_vehicle: bool,
}

/// Recognized keys of a `killing_spree` composite.
#[derive(Debug, Clone, PartialEq)]
pub struct Spree<'a> {
    pub kill_count: u64,
    pub victims: Vec<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventDetails<'a> {
    ActorDeath(ActorDeath<'a>),
    Destruction(Destruction<'a>),
    KillingSpree(Spree<'a>),
    Other,
}

/// Wire form of a [`LogEvent`]: no `original`, `open` or `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventWire {
    pub id: String,
    #[serde(rename = "sourceUserId", alias = "userId")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    pub event_type: EventType,
    pub timestamp: String,
    #[serde(default)]
    pub line: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

impl From<&LogEvent> for LogEventWire {
    fn from(event: &LogEvent) -> Self {
        Self {
            id: event.id.clone(),
            user_id: event.user_id.clone(),
            player: event.player.clone(),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp.clone(),
            line: event.line.clone(),
            metadata: event.metadata.clone(),
        }
    }
}

impl From<LogEventWire> for LogEvent {
    fn from(wire: LogEventWire) -> Self {
        Self {
            id: wire.id,
            user_id: wire.user_id,
            player: wire.player,
            event_type: wire.event_type,
            timestamp: wire.timestamp,
            line: wire.line,
            original: None,
            metadata: wire.metadata,
            children: Vec::new(),
            open: None,
        }
    }
}
