use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::manager::Radio;
use crate::messages::BeaconSample;

/// Returns the first bluetooth adapter on this host.
pub async fn first_adapter() -> anyhow::Result<Adapter> {
    let bt_manager = Manager::new().await?;
    let adapters = bt_manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no bluetooth adapter found"))
}

impl Radio for Adapter {
    async fn start_scan(&self) -> anyhow::Result<()> {
        Ok(btleplug::api::Central::start_scan(self, ScanFilter::default()).await?)
    }

    async fn stop_scan(&self) -> anyhow::Result<()> {
        Ok(btleplug::api::Central::stop_scan(self).await?)
    }
}

/// Turns advertisement events into beacon samples until the event stream ends
/// or the receiving session goes away.
pub async fn forward_advertisements(
    adapter: Adapter,
    tx: mpsc::Sender<BeaconSample>,
) -> anyhow::Result<()> {
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };

        let sample = match read_sample(&adapter, &id).await {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(err) => {
                warn!("Error reading peripheral {:?}: {:?}", id, err);
                continue;
            }
        };

        if tx.send(sample).await.is_err() {
            debug!("Session closed, no longer forwarding advertisements");
            return Ok(());
        }
    }

    info!("No more bluetooth events");
    Ok(())
}

async fn read_sample(adapter: &Adapter, id: &PeripheralId) -> anyhow::Result<Option<BeaconSample>> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    match (properties.local_name, properties.rssi) {
        (Some(name), Some(rssi)) => {
            debug!("Discovered peripheral {} with RSSI {}", name, rssi);
            Ok(Some(BeaconSample::new(name, i32::from(rssi))))
        }
        (name, _) => {
            debug!("Skipped peripheral {:?} {:?} (no name or RSSI)", id, name);
            Ok(None)
        }
    }
}
