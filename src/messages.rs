use std::time::SystemTime;

/// One advertisement heard from a beacon.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct BeaconSample {
    pub beacon_id: String,
    /// dBm, usually negative
    pub signal_strength: i32,
    pub observed_at: SystemTime,
}

impl BeaconSample {
    pub fn new(beacon_id: impl Into<String>, signal_strength: i32) -> Self {
        BeaconSample {
            beacon_id: beacon_id.into(),
            signal_strength,
            observed_at: SystemTime::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanCommand {
    Start,
    Stop,
    Shutdown,
}
