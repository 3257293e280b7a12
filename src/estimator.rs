//! Room estimation from beacon signal strength.
//!
//! Each allowed beacon keeps a short window of raw RSSI readings and a
//! truncating mean over that window. After every accepted reading the two
//! strongest beacons are looked up as an unordered pair in a [`RoomTable`].
//! Anything short of a table hit falls back according to [`FallbackPolicy`].

use std::collections::{BTreeMap, HashSet, VecDeque};

use log::{debug, info};
use serde_derive::Deserialize;
use tokio::sync::watch;

use crate::messages::BeaconSample;
use crate::rooms::{DEFAULT_BEACONS, RoomLabel, RoomTable};

pub const DEFAULT_WINDOW: usize = 7;

/// What the current room becomes when the strongest pair does not resolve.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    #[default]
    ReuseLastKnown,
    ResetToUndetermined,
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub allowed: HashSet<String>,
    pub table: RoomTable,
    pub fallback: FallbackPolicy,
    pub window: usize,
    pub initial_room: RoomLabel,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            allowed: DEFAULT_BEACONS.iter().map(|b| b.to_string()).collect(),
            table: RoomTable::building_405(),
            fallback: FallbackPolicy::default(),
            window: DEFAULT_WINDOW,
            initial_room: RoomLabel::Undetermined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconState {
    recent_samples: VecDeque<i32>,
    smoothed_strength: i32,
}

impl BeaconState {
    fn new(signal_strength: i32, window: usize) -> Self {
        let mut recent_samples = VecDeque::with_capacity(window);
        recent_samples.push_back(signal_strength);
        BeaconState {
            recent_samples,
            smoothed_strength: signal_strength,
        }
    }

    fn push(&mut self, signal_strength: i32, window: usize) {
        while self.recent_samples.len() >= window {
            self.recent_samples.pop_front();
        }
        self.recent_samples.push_back(signal_strength);

        let sum: i64 = self.recent_samples.iter().map(|s| i64::from(*s)).sum();
        // Integer division truncates toward zero.
        self.smoothed_strength = (sum / self.recent_samples.len() as i64) as i32;
    }

    #[cfg(test)]
    pub fn recent_samples(&self) -> impl Iterator<Item = i32> + '_ {
        self.recent_samples.iter().copied()
    }

    pub fn smoothed_strength(&self) -> i32 {
        self.smoothed_strength
    }
}

/// Per-session state. Created empty when scanning starts and dropped when it
/// stops.
#[derive(Debug, Clone)]
pub struct EstimatorState {
    beacons: BTreeMap<String, BeaconState>,
    current_room: RoomLabel,
    last_known_room: RoomLabel,
}

impl EstimatorState {
    fn new(initial_room: &RoomLabel) -> Self {
        EstimatorState {
            beacons: BTreeMap::new(),
            current_room: initial_room.clone(),
            last_known_room: initial_room.clone(),
        }
    }
}

pub struct RoomEstimator {
    config: EstimatorConfig,
    state: EstimatorState,
    room_tx: watch::Sender<RoomLabel>,
}

impl RoomEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        debug!(
            "Estimating rooms from {} beacons and {} mapped pairs",
            config.allowed.len(),
            config.table.len()
        );
        let state = EstimatorState::new(&config.initial_room);
        let (room_tx, _) = watch::channel(state.current_room.clone());
        RoomEstimator {
            config,
            state,
            room_tx,
        }
    }

    /// Receiver that sees every change of the current room.
    pub fn subscribe(&self) -> watch::Receiver<RoomLabel> {
        self.room_tx.subscribe()
    }

    /// Discards all beacon history and starts over from the initial room.
    pub fn reset(&mut self) {
        self.state = EstimatorState::new(&self.config.initial_room);
        self.publish();
    }

    pub fn observe(&mut self, sample: &BeaconSample) {
        if !self.config.allowed.contains(&sample.beacon_id) {
            debug!("Ignored beacon {} (not in allow-list)", sample.beacon_id);
            return;
        }

        let window = self.config.window.max(1);
        let beacon = self
            .state
            .beacons
            .entry(sample.beacon_id.clone())
            .and_modify(|beacon| beacon.push(sample.signal_strength, window))
            .or_insert_with(|| BeaconState::new(sample.signal_strength, window));
        debug!(
            "Beacon {} sampled at {} dBm, smoothed {} dBm",
            sample.beacon_id,
            sample.signal_strength,
            beacon.smoothed_strength()
        );

        self.recompute();
    }

    /// Beacons ranked by smoothed strength, strongest first. Equal strengths
    /// keep identifier order.
    pub fn ranked(&self) -> Vec<(&str, i32)> {
        let mut ranked: Vec<(&str, i32)> = self
            .state
            .beacons
            .iter()
            .map(|(id, beacon)| (id.as_str(), beacon.smoothed_strength))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    pub fn recompute(&mut self) {
        let ranked = self.ranked();
        debug!("Beacon ranking: {:?}", ranked);

        let resolved = match ranked.as_slice() {
            [(first, _), (second, _), ..] => {
                let room = self
                    .config
                    .table
                    .lookup(first, second)
                    .map(RoomLabel::room)
                    .filter(RoomLabel::is_determined);
                if room.is_none() {
                    debug!("No room mapped for beacons {}, {}", first, second);
                }
                room
            }
            _ => {
                debug!("Less than 2 beacons detected");
                None
            }
        };

        match resolved {
            Some(room) => {
                self.state.last_known_room = room.clone();
                self.state.current_room = room;
            }
            None => {
                self.state.current_room = match self.config.fallback {
                    FallbackPolicy::ReuseLastKnown => self.state.last_known_room.clone(),
                    FallbackPolicy::ResetToUndetermined => RoomLabel::Undetermined,
                };
            }
        }

        self.publish();
    }

    pub fn current_room_label(&self) -> &RoomLabel {
        &self.state.current_room
    }

    pub fn last_known_room(&self) -> &RoomLabel {
        &self.state.last_known_room
    }

    #[cfg(test)]
    pub fn beacon(&self, beacon_id: &str) -> Option<&BeaconState> {
        self.state.beacons.get(beacon_id)
    }

    pub fn beacon_count(&self) -> usize {
        self.state.beacons.len()
    }

    fn publish(&self) {
        let room = &self.state.current_room;
        let changed = self.room_tx.send_if_modified(|current| {
            if current == room {
                false
            } else {
                *current = room.clone();
                true
            }
        });
        if changed {
            info!("Current room: {}", room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_config() -> EstimatorConfig {
        let mut table = RoomTable::new();
        table.insert("1", "2", "Room 405-712");
        table.insert("2", "3", "Room 405-722");
        table.insert("3", "4", "Room 405-722");
        table.insert("2", "4", "Room 405-722");
        table.insert("4", "5", "Room 405-736");
        EstimatorConfig {
            allowed: ["1", "2", "3", "4", "5"].iter().map(|b| b.to_string()).collect(),
            table,
            ..EstimatorConfig::default()
        }
    }

    fn observe(estimator: &mut RoomEstimator, beacon_id: &str, signal_strength: i32) {
        estimator.observe(&BeaconSample::new(beacon_id, signal_strength));
    }

    #[test]
    fn test_smoothed_strength_truncates_toward_zero() {
        let mut estimator = RoomEstimator::new(numbered_config());
        observe(&mut estimator, "1", -50);
        assert_eq!(estimator.beacon("1").unwrap().smoothed_strength(), -50);

        observe(&mut estimator, "1", -51);
        // -101 / 2 = -50.5
        assert_eq!(estimator.beacon("1").unwrap().smoothed_strength(), -50);

        observe(&mut estimator, "1", -52);
        observe(&mut estimator, "1", -60);
        // -213 / 4 = -53.25
        assert_eq!(estimator.beacon("1").unwrap().smoothed_strength(), -53);
    }

    #[test]
    fn test_window_keeps_seven_most_recent() {
        let mut estimator = RoomEstimator::new(numbered_config());
        for strength in -60..=-51 {
            observe(&mut estimator, "2", strength);
        }
        let beacon = estimator.beacon("2").unwrap();
        let samples: Vec<i32> = beacon.recent_samples().collect();
        assert_eq!(samples, vec![-57, -56, -55, -54, -53, -52, -51]);
        // -378 / 7 = -54
        assert_eq!(beacon.smoothed_strength(), -54);
    }

    #[test]
    fn test_single_beacon_uses_last_known_room() {
        let config = EstimatorConfig {
            initial_room: RoomLabel::room("Room 405-712"),
            ..numbered_config()
        };
        let mut estimator = RoomEstimator::new(config);
        observe(&mut estimator, "4", -30);
        observe(&mut estimator, "4", -90);
        assert_eq!(estimator.beacon_count(), 1);
        assert_eq!(
            estimator.current_room_label(),
            &RoomLabel::room("Room 405-712")
        );
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-712"));
    }

    #[test]
    fn test_no_beacons_recompute_keeps_initial_room() {
        let mut estimator = RoomEstimator::new(numbered_config());
        estimator.recompute();
        assert_eq!(estimator.current_room_label(), &RoomLabel::Undetermined);
    }

    #[test]
    fn test_mapped_pair_in_either_order() {
        let mut forward = RoomEstimator::new(numbered_config());
        observe(&mut forward, "1", -40);
        observe(&mut forward, "2", -70);
        assert_eq!(forward.current_room_label(), &RoomLabel::room("Room 405-712"));

        let mut reversed = RoomEstimator::new(numbered_config());
        observe(&mut reversed, "2", -70);
        observe(&mut reversed, "1", -40);
        assert_eq!(reversed.current_room_label(), &RoomLabel::room("Room 405-712"));
        assert_eq!(reversed.last_known_room(), &RoomLabel::room("Room 405-712"));
    }

    #[test]
    fn test_unmapped_pair_falls_back_without_touching_last_known() {
        let config = EstimatorConfig {
            initial_room: RoomLabel::room("Room 405-736"),
            ..numbered_config()
        };
        let mut estimator = RoomEstimator::new(config);
        observe(&mut estimator, "1", -40);
        observe(&mut estimator, "5", -45);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-736"));
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-736"));
    }

    #[test]
    fn test_stronger_unmapped_beacon_keeps_previous_room() {
        let mut estimator = RoomEstimator::new(numbered_config());
        observe(&mut estimator, "1", -50);
        observe(&mut estimator, "2", -60);
        observe(&mut estimator, "1", -48);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-712"));

        for _ in 0..6 {
            observe(&mut estimator, "3", -40);
        }
        let top: Vec<&str> = estimator.ranked().iter().take(2).map(|(id, _)| *id).collect();
        assert_eq!(top, vec!["3", "1"]);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-712"));
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-712"));
    }

    #[test]
    fn test_sentinel_table_entry_is_not_a_hit() {
        let mut table = RoomTable::new();
        table.insert("1", "2", "Room 405-712");
        table.insert("1", "3", "Undetermined room");
        table.insert("2", "3", "");
        let config = EstimatorConfig {
            table,
            ..numbered_config()
        };
        let mut estimator = RoomEstimator::new(config);
        observe(&mut estimator, "1", -40);
        observe(&mut estimator, "2", -50);
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-712"));

        for _ in 0..7 {
            observe(&mut estimator, "3", -45);
        }
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-712"));
        for _ in 0..7 {
            observe(&mut estimator, "1", -90);
        }
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-712"));
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-712"));
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut estimator = RoomEstimator::new(numbered_config());
        observe(&mut estimator, "3", -55);
        observe(&mut estimator, "4", -58);
        estimator.recompute();
        let first = estimator.current_room_label().clone();
        estimator.recompute();
        assert_eq!(estimator.current_room_label(), &first);
        assert_eq!(first, RoomLabel::room("Room 405-722"));
    }

    #[test]
    fn test_unknown_beacon_is_ignored() {
        let mut estimator = RoomEstimator::new(numbered_config());
        observe(&mut estimator, "1", -50);
        observe(&mut estimator, "2", -60);
        let before = estimator.current_room_label().clone();

        observe(&mut estimator, "UNKNOWN-DEVICE", -10);
        assert!(estimator.beacon("UNKNOWN-DEVICE").is_none());
        assert_eq!(estimator.beacon_count(), 2);
        assert_eq!(estimator.current_room_label(), &before);
        assert_eq!(estimator.last_known_room(), &before);
    }

    #[test]
    fn test_equal_strengths_rank_by_identifier() {
        let mut estimator = RoomEstimator::new(numbered_config());
        observe(&mut estimator, "4", -50);
        observe(&mut estimator, "2", -50);
        observe(&mut estimator, "3", -50);
        let ranked = estimator.ranked();
        assert_eq!(ranked, vec![("2", -50), ("3", -50), ("4", -50)]);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-722"));
    }

    #[test]
    fn test_reset_to_undetermined_policy() {
        let config = EstimatorConfig {
            fallback: FallbackPolicy::ResetToUndetermined,
            ..numbered_config()
        };
        let mut estimator = RoomEstimator::new(config);
        observe(&mut estimator, "1", -50);
        observe(&mut estimator, "2", -60);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-712"));

        for _ in 0..7 {
            observe(&mut estimator, "5", -30);
        }
        assert_eq!(estimator.current_room_label(), &RoomLabel::Undetermined);
        assert_eq!(estimator.last_known_room(), &RoomLabel::room("Room 405-712"));
    }

    #[test]
    fn test_default_config_resolves_deployed_beacons() {
        let mut estimator = RoomEstimator::new(EstimatorConfig::default());
        observe(&mut estimator, "ESP32_BEACON", -45);
        observe(&mut estimator, "ESP32-BEACON-3", -52);
        observe(&mut estimator, "ESP32-BEACON-1", -80);
        assert_eq!(estimator.current_room_label(), &RoomLabel::room("Room 405-722"));
    }

    #[test]
    fn test_subscribers_see_room_changes() {
        let mut estimator = RoomEstimator::new(numbered_config());
        let mut rx = estimator.subscribe();
        assert_eq!(*rx.borrow_and_update(), RoomLabel::Undetermined);

        observe(&mut estimator, "1", -50);
        assert!(!rx.has_changed().unwrap());

        observe(&mut estimator, "2", -60);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), RoomLabel::room("Room 405-712"));

        // same room again is not a change
        observe(&mut estimator, "2", -61);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_reset_discards_beacons() {
        let mut estimator = RoomEstimator::new(numbered_config());
        let mut rx = estimator.subscribe();
        observe(&mut estimator, "1", -50);
        observe(&mut estimator, "2", -60);
        rx.borrow_and_update();

        estimator.reset();
        assert_eq!(estimator.beacon_count(), 0);
        assert_eq!(estimator.current_room_label(), &RoomLabel::Undetermined);
        assert_eq!(estimator.last_known_room(), &RoomLabel::Undetermined);
        assert!(rx.has_changed().unwrap());
    }
}
