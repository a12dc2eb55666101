use crate::home_assistant::{EntityState, HomeAssistantAPI};
use crate::sensor::{SensorReading, TankSensor};
use crate::tank_coordinator::Snapshot;
use std::time::Duration;
use tokio::sync::watch::Receiver;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const UNAVAILABLE: &str = "unavailable";

/// Pushes sensor states to Home Assistant whenever the coordinator snapshot changes
pub struct SensorPublisher {
    sensors: Vec<TankSensor>,
    updates: Receiver<Snapshot>,
    ha_client: HomeAssistantAPI,
}

impl SensorPublisher {
    pub fn new(
        sensors: Vec<TankSensor>,
        updates: Receiver<Snapshot>,
        ha_client: HomeAssistantAPI,
    ) -> Self {
        tracing::info!("Publishing {} sensor(s) to Home Assistant", sensors.len());
        for sensor in &sensors {
            tracing::debug!("  {} ({})", sensor.entity_id(), sensor.unique_id());
        }
        Self {
            sensors,
            updates,
            ha_client,
        }
    }

    /// Publishes the current snapshot, then again after every refresh, until the
    /// coordinator goes away or the task is aborted.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        loop {
            let snapshot = self.updates.borrow_and_update().clone();
            self.publish_all(&snapshot).await;

            if self.updates.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("Tank coordinator stopped, sensor publisher exiting");
    }

    /// Writes every sensor's state for `snapshot`. Returns how many writes succeeded.
    pub async fn publish_all(&self, snapshot: &Snapshot) -> usize {
        let mut published = 0;
        for sensor in &self.sensors {
            let reading = sensor.reading(snapshot);
            let state = entity_state(sensor, reading.as_ref());
            match self.publish_with_retry(&sensor.entity_id(), &state).await {
                Ok(()) => published += 1,
                Err(e) => tracing::error!("Failed to publish {}: {e:#}", sensor.entity_id()),
            }
        }
        tracing::debug!("Published {published}/{} sensor state(s)", self.sensors.len());
        published
    }

    async fn publish_with_retry(&self, entity_id: &str, state: &EntityState) -> anyhow::Result<()> {
        const MAX_RETRIES: u32 = 3;

        let mut attempt = 1;
        loop {
            match self.ha_client.set_state(entity_id, state).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!("HA write attempt {attempt} for {entity_id} failed: {e}. Retrying...");
                    sleep(Duration::from_millis(200 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("All {MAX_RETRIES} attempts failed")));
                }
            }
        }
    }
}

/// State body for one sensor. No reading means the sensor is unavailable.
pub fn entity_state(sensor: &TankSensor, reading: Option<&SensorReading>) -> EntityState {
    let state = match reading {
        Some(reading) => reading.value.to_string(),
        None => UNAVAILABLE.to_string(),
    };
    let kind = sensor.kind;
    let mut entity = EntityState::new(state)
        .with_attribute("friendly_name", sensor.friendly_name())
        .with_attribute("unique_id", sensor.unique_id())
        .with_attribute("unit_of_measurement", kind.unit())
        .with_attribute("state_class", "measurement")
        .with_attribute("device_id", sensor.device.identifier.as_str())
        .with_attribute("device_name", sensor.device.name.as_str())
        .with_attribute("device_manufacturer", sensor.device.manufacturer)
        .with_attribute("device_model", sensor.device.model);
    if let Some(device_class) = kind.device_class() {
        entity = entity.with_attribute("device_class", device_class);
    }
    if let Some(icon) = kind.icon() {
        entity = entity.with_attribute("icon", icon);
    }
    if let Some(category) = kind.entity_category() {
        entity = entity.with_attribute("entity_category", category);
    }
    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{sensors_for, SensorKind};
    use crate::tank::TankInfo;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn tank() -> TankInfo {
        TankInfo {
            sensor_ids: vec!["A1".to_string()],
            tank_number: 1,
            battery_level: "Excellent".to_string(),
            capacity: 200.0,
            remaining: 50.0,
        }
    }

    fn snapshot(success: bool) -> Snapshot {
        Snapshot {
            tanks: Arc::from(vec![tank()]),
            last_update_success: success,
        }
    }

    #[test]
    fn test_entity_state_attributes() {
        let sensor = TankSensor::new(&tank(), SensorKind::Battery);
        let reading = sensor.reading(&snapshot(true));
        let state = entity_state(&sensor, reading.as_ref());

        assert_eq!(state.state, "100");
        assert_eq!(state.attributes["friendly_name"], "Tank 1 Battery Level");
        assert_eq!(state.attributes["unique_id"], "A1_battery");
        assert_eq!(state.attributes["unit_of_measurement"], "%");
        assert_eq!(state.attributes["device_class"], "battery");
        assert_eq!(state.attributes["entity_category"], "diagnostic");
        assert_eq!(state.attributes["device_name"], "Tank 1");
        assert!(!state.attributes.contains_key("icon"));
    }

    #[test]
    fn test_entity_state_keeps_remaining_gallons() {
        let mut t = tank();
        t.remaining = 187.456;
        let snap = Snapshot {
            tanks: Arc::from(vec![t.clone()]),
            last_update_success: true,
        };
        let sensor = TankSensor::new(&t, SensorKind::TankLevel);
        let state = entity_state(&sensor, sensor.reading(&snap).as_ref());

        assert_eq!(state.state, "187.456");
        assert_eq!(state.attributes["unit_of_measurement"], "gal");
    }

    #[test]
    fn test_entity_state_unavailable() {
        let sensor = TankSensor::new(&tank(), SensorKind::TankVolume);
        let state = entity_state(&sensor, None);

        assert_eq!(state.state, "unavailable");
        assert_eq!(state.attributes["icon"], "mdi:hydraulic-oil-level");
        assert!(!state.attributes.contains_key("device_class"));
    }

    #[tokio::test]
    async fn test_publish_all() {
        let mut server = mockito::Server::new_async().await;
        let battery = server
            .mock("POST", "/api/states/sensor.smartoilgauge_a1_battery")
            .match_body(Matcher::PartialJson(json!({"state": "100"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.smartoilgauge_a1_battery", "state": "100", "last_changed": "", "last_updated": ""}"#)
            .create_async()
            .await;
        let level = server
            .mock("POST", "/api/states/sensor.smartoilgauge_a1_tank_level")
            .match_body(Matcher::PartialJson(json!({"state": "50"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.smartoilgauge_a1_tank_level", "state": "50", "last_changed": "", "last_updated": ""}"#)
            .create_async()
            .await;
        let volume = server
            .mock("POST", "/api/states/sensor.smartoilgauge_a1_tank_volume")
            .match_body(Matcher::PartialJson(json!({"state": "25"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.smartoilgauge_a1_tank_volume", "state": "25", "last_changed": "", "last_updated": ""}"#)
            .create_async()
            .await;

        let (_tx, rx) = watch::channel(snapshot(true));
        let publisher = SensorPublisher::new(
            sensors_for(&[tank()], &["A1".to_string()]),
            rx,
            HomeAssistantAPI::with_endpoint(&server.url(), "token"),
        );

        assert_eq!(publisher.publish_all(&snapshot(true)).await, 3);
        battery.assert_async().await;
        level.assert_async().await;
        volume.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_failed_refresh_as_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Regex("^/api/states/sensor\\.smartoilgauge_a1_".to_string()))
            .match_body(Matcher::PartialJson(json!({"state": "unavailable"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.x", "state": "unavailable", "last_changed": "", "last_updated": ""}"#)
            .expect(3)
            .create_async()
            .await;

        let (_tx, rx) = watch::channel(snapshot(false));
        let publisher = SensorPublisher::new(
            sensors_for(&[tank()], &["A1".to_string()]),
            rx,
            HomeAssistantAPI::with_endpoint(&server.url(), "token"),
        );

        assert_eq!(publisher.publish_all(&snapshot(false)).await, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_spawned_publisher_follows_updates() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/api/states/sensor.smartoilgauge_a1_tank_level")
            .match_body(Matcher::PartialJson(json!({"state": "50"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.smartoilgauge_a1_tank_level", "state": "50", "last_changed": "", "last_updated": ""}"#)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/api/states/sensor.smartoilgauge_a1_tank_level")
            .match_body(Matcher::PartialJson(json!({"state": "42"})))
            .with_status(200)
            .with_body(r#"{"entity_id": "sensor.smartoilgauge_a1_tank_level", "state": "42", "last_changed": "", "last_updated": ""}"#)
            .create_async()
            .await;

        let (tx, rx) = watch::channel(snapshot(true));
        let handle = SensorPublisher::new(
            vec![TankSensor::new(&tank(), SensorKind::TankLevel)],
            rx,
            HomeAssistantAPI::with_endpoint(&server.url(), "token"),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        first.assert_async().await;

        let mut drained = tank();
        drained.remaining = 42.0;
        tx.send_replace(Snapshot {
            tanks: Arc::from(vec![drained]),
            last_update_success: true,
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        second.assert_async().await;

        // Dropping the sender ends the publisher
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("Publisher should exit once the coordinator is gone")
            .unwrap();
    }
}
