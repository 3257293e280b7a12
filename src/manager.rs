use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::estimator::RoomEstimator;
use crate::messages::{BeaconSample, ScanCommand};
use crate::rooms::RoomLabel;

/// The part of the bluetooth stack a scanning session drives.
#[allow(async_fn_in_trait)]
pub trait Radio {
    async fn start_scan(&self) -> anyhow::Result<()>;
    async fn stop_scan(&self) -> anyhow::Result<()>;
}

/// Owns the room estimator for the lifetime of the process and applies beacon
/// samples to it one at a time, in the order the scanner delivered them.
pub struct Manager<R> {
    radio: R,
    estimator: RoomEstimator,
    samples: mpsc::Receiver<BeaconSample>,
    commands: broadcast::Receiver<ScanCommand>,
    rescan_interval: Duration,
    scanning: bool,
}

impl<R: Radio> Manager<R> {
    pub fn new(
        radio: R,
        estimator: RoomEstimator,
        samples: mpsc::Receiver<BeaconSample>,
        commands: broadcast::Receiver<ScanCommand>,
        rescan_interval: Duration,
    ) -> Self {
        Manager {
            radio,
            estimator,
            samples,
            commands,
            rescan_interval,
            scanning: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomLabel> {
        self.estimator.subscribe()
    }

    /// Scans until shutdown is requested or the sample stream ends. Returns
    /// the room estimated when the loop finished.
    pub async fn run_loop(mut self) -> anyhow::Result<RoomLabel> {
        self.run(None).await
    }

    /// Scans for a fixed period and returns the room estimated at the end.
    pub async fn run_for(mut self, duration: Duration) -> anyhow::Result<RoomLabel> {
        self.run(Some(duration)).await
    }

    async fn run(&mut self, limit: Option<Duration>) -> anyhow::Result<RoomLabel> {
        self.start().await?;

        let mut rescan = tokio::time::interval(self.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the scan was just started.
        rescan.tick().await;

        let timeout = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Ok(ScanCommand::Start) => {
                        if let Err(err) = self.start().await {
                            error!("Error starting scan: {:?}", err);
                        }
                    }
                    Ok(ScanCommand::Stop) => self.stop().await,
                    Ok(ScanCommand::Shutdown) => {
                        debug!("Shutdown requested");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Command channel closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Command receiver lagged, skipped {} commands", skipped);
                    }
                },
                sample = self.samples.recv() => match sample {
                    Some(sample) if self.scanning => self.estimator.observe(&sample),
                    Some(sample) => {
                        debug!("Dropped sample from {} while stopped", sample.beacon_id);
                    }
                    None => {
                        info!("Beacon sample stream closed");
                        break;
                    }
                },
                _ = rescan.tick() => {
                    if self.scanning {
                        if let Err(err) = self.radio.start_scan().await {
                            warn!("Error re-triggering scan: {:?}", err);
                        }
                        self.estimator.recompute();
                    }
                }
                () = &mut timeout => {
                    debug!("Scan period elapsed");
                    break;
                }
            }
        }

        let room = self.estimator.current_room_label().clone();
        self.stop().await;
        Ok(room)
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.scanning {
            debug!("Already scanning");
            return Ok(());
        }
        self.radio.start_scan().await?;
        self.estimator.reset();
        self.scanning = true;
        info!("Started beacon scanning");
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        if let Err(err) = self.radio.stop_scan().await {
            error!("Error stopping scan: {:?}", err);
        }
        info!(
            "Stopped beacon scanning ({} beacons seen, last known room: {})",
            self.estimator.beacon_count(),
            self.estimator.last_known_room()
        );
        self.estimator.reset();
    }
}
