//! Room labels and the beacon-pair table that maps the two strongest beacons
//! to the room they jointly indicate.

use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde_derive::{Deserialize, Serialize};

pub const UNDETERMINED_ROOM: &str = "Undetermined room";

/// The estimator's room decision. `Undetermined` is the sentinel used before any
/// beacon pair has resolved to a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum RoomLabel {
    #[default]
    Undetermined,
    Room(String),
}

impl RoomLabel {
    pub fn room(name: impl Into<String>) -> Self {
        RoomLabel::from(name.into())
    }

    pub fn is_determined(&self) -> bool {
        matches!(self, RoomLabel::Room(_))
    }
}

impl fmt::Display for RoomLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomLabel::Undetermined => f.write_str(UNDETERMINED_ROOM),
            RoomLabel::Room(name) => f.write_str(name),
        }
    }
}

impl From<String> for RoomLabel {
    fn from(value: String) -> Self {
        if value.is_empty() || value == UNDETERMINED_ROOM {
            RoomLabel::Undetermined
        } else {
            RoomLabel::Room(value)
        }
    }
}

impl From<RoomLabel> for String {
    fn from(value: RoomLabel) -> Self {
        value.to_string()
    }
}

/// Unordered pair of beacon identifiers. Stored sorted so that `(a, b)` and
/// `(b, a)` hash and compare the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeaconPair(String, String);

impl BeaconPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            BeaconPair(a.to_string(), b.to_string())
        } else {
            BeaconPair(b.to_string(), a.to_string())
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.0 == self.1
    }
}

impl fmt::Display for BeaconPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.0, self.1)
    }
}

/// Symmetric adjacency table from the two strongest beacons to a room.
#[derive(Debug, Clone, Default)]
pub struct RoomTable {
    rooms: HashMap<BeaconPair, String>,
}

impl RoomTable {
    pub fn new() -> Self {
        RoomTable::default()
    }

    /// Adds a mapping. A pair that is already present is overwritten.
    pub fn insert(&mut self, a: &str, b: &str, room: impl Into<String>) {
        let pair = BeaconPair::new(a, b);
        let room = room.into();
        if let Some(previous) = self.rooms.get(&pair) {
            warn!("Beacon pair {} remapped from {} to {}", pair, previous, room);
        }
        self.rooms.insert(pair, room);
    }

    pub fn lookup(&self, a: &str, b: &str) -> Option<&str> {
        self.rooms.get(&BeaconPair::new(a, b)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Beacon names advertised by the deployed ESP32 transmitters.
pub const DEFAULT_BEACONS: [&str; 6] = [
    "ESP32-BEACON-1",
    "ESP32-BEACON-2",
    "ESP32-BEACON-3",
    "ESP32-BEACON-4",
    "ESP32-BEACON-5",
    "ESP32_BEACON",
];

const DEFAULT_ROOMS: [(&str, &str, &str); 8] = [
    ("ESP32-BEACON-1", "ESP32-BEACON-2", "Room 405-712"),
    ("ESP32-BEACON-2", "ESP32-BEACON-3", "Room 405-722"),
    ("ESP32-BEACON-3", "ESP32-BEACON-4", "Room 405-722"),
    ("ESP32-BEACON-2", "ESP32-BEACON-4", "Room 405-722"),
    ("ESP32-BEACON-2", "ESP32_BEACON", "Room 405-722"),
    ("ESP32-BEACON-3", "ESP32_BEACON", "Room 405-722"),
    ("ESP32-BEACON-4", "ESP32_BEACON", "Room 405-722"),
    ("ESP32-BEACON-4", "ESP32-BEACON-5", "Room 405-736"),
];

impl RoomTable {
    /// The mapping for the level 4 deployment of building 405.
    pub fn building_405() -> Self {
        let mut table = RoomTable::new();
        for (a, b, room) in DEFAULT_ROOMS {
            table.insert(a, b, room);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_symmetric() {
        let table = RoomTable::building_405();
        assert_eq!(
            table.lookup("ESP32-BEACON-1", "ESP32-BEACON-2"),
            Some("Room 405-712")
        );
        assert_eq!(
            table.lookup("ESP32-BEACON-2", "ESP32-BEACON-1"),
            Some("Room 405-712")
        );
        assert_eq!(
            table.lookup("ESP32_BEACON", "ESP32-BEACON-4"),
            Some("Room 405-722")
        );
        assert_eq!(
            table.lookup("ESP32-BEACON-5", "ESP32-BEACON-4"),
            Some("Room 405-736")
        );
    }

    #[test]
    fn test_unmapped_pair() {
        let table = RoomTable::building_405();
        assert_eq!(table.lookup("ESP32-BEACON-1", "ESP32-BEACON-5"), None);
        assert_eq!(table.lookup("ESP32-BEACON-1", "ESP32-BEACON-1"), None);
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn test_insert_overwrites_pair_in_either_order() {
        let mut table = RoomTable::new();
        table.insert("1", "2", "Room A");
        table.insert("2", "1", "Room B");
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("1", "2"), Some("Room B"));
    }

    #[test]
    fn test_room_label_sentinel() {
        assert_eq!(RoomLabel::room(UNDETERMINED_ROOM), RoomLabel::Undetermined);
        assert_eq!(RoomLabel::room(""), RoomLabel::Undetermined);
        assert_eq!(RoomLabel::Undetermined.to_string(), "Undetermined room");
        assert_eq!(RoomLabel::room("Room 405-712").to_string(), "Room 405-712");
        assert!(!RoomLabel::Undetermined.is_determined());
    }

    #[test]
    fn test_room_label_serializes_as_string() {
        let json = serde_json::to_string(&RoomLabel::room("Room 405-722")).unwrap();
        assert_eq!(json, "\"Room 405-722\"");
        let label: RoomLabel = serde_json::from_str("\"Undetermined room\"").unwrap();
        assert_eq!(label, RoomLabel::Undetermined);
    }
}
