use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::{broadcast, watch};

use crate::{config, messages::ScanCommand, rooms::RoomLabel};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct RoomMqttMessage {
    publisher: String,
    room: RoomLabel,
    determined: bool,
    timestamp: u64,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"asset-locator".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("assets".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/scan/start", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/scan/stop", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ScanCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = scan_command(&p.topic) else {
                            continue;
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding scan command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_room(&self, room: &RoomLabel) -> Result<(), rumqttc::ClientError> {
        info!("Announcing room {} on MQTT", room);
        let message = RoomMqttMessage {
            publisher: self.publisher_id.clone(),
            room: room.clone(),
            determined: room.is_determined(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error encoding room announcement: {:?}", err);
                return Ok(());
            }
        };
        self.client
            .publish(self.room_topic(), QoS::AtLeastOnce, true, payload)
            .await
    }

    /// Publishes every room the receiver observes until the estimator goes away.
    pub async fn announce_rooms(&self, mut rooms: watch::Receiver<RoomLabel>) {
        while rooms.changed().await.is_ok() {
            let room = rooms.borrow_and_update().clone();
            if let Err(err) = self.announce_room(&room).await {
                error!("Error announcing room: {:?}", err);
            }
        }
        debug!("Room announcements finished");
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    fn room_topic(&self) -> String {
        format!(
            "{}/{}/room",
            self.topic_path,
            sanitize_name(&self.publisher_id)
        )
    }
}

fn scan_command(topic: &str) -> Option<ScanCommand> {
    match topic {
        t if t.ends_with("/scan/start") => Some(ScanCommand::Start),
        t if t.ends_with("/scan/stop") => Some(ScanCommand::Stop),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
