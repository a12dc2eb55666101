use crate::home_assistant::HomeAssistantAPI;
use crate::sensor::{sensors_for, TankSensor};
use crate::sensor_publisher::SensorPublisher;
use crate::smart_oil_gauge::{error_status, SmartOilGaugeClient};
use crate::tank_coordinator::TankCoordinator;
use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::io::Write;
use std::{env, fs};
use tokio::task::JoinHandle;

pub const ENTRY_VERSION: u32 = 1;
pub const DEFAULT_ENTRY_FILE: &str = "smartoilgauge.json";

/// Credentials and tank selection saved by the setup flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub version: u32,
    pub title: String,
    pub client_id: String,
    pub client_secret: String,
    /// Keys of the tanks to publish
    pub sensors: Vec<String>,
}

impl ConfigEntry {
    pub fn new(client_id: &str, client_secret: &str, sensors: Vec<String>) -> Self {
        Self {
            version: ENTRY_VERSION,
            title: "Smart Oil Gauge".to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            sensors,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config entry {}", path.display()))?;
        let entry: ConfigEntry = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config entry {}", path.display()))?;
        if entry.version != ENTRY_VERSION {
            anyhow::bail!(
                "Config entry {} has version {}, expected {ENTRY_VERSION}",
                path.display(),
                entry.version
            );
        }
        Ok(entry)
    }

    /// Writes the entry as pretty JSON. On unix only the owner can read it back,
    /// since it holds the client secret.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        write_private(path, raw.as_bytes())
            .with_context(|| format!("Failed to write config entry {}", path.display()))
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // The mode above only applies to new files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)
}

/// Location of the config entry, `SOG_ENTRY_FILE` or `smartoilgauge.json`
pub fn entry_path() -> PathBuf {
    env::var("SOG_ENTRY_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENTRY_FILE))
}

#[derive(Debug, thiserror::Error)]
pub enum EntrySetupError {
    /// The stored credentials were rejected; setup has to be run again
    #[error("Authentication failed: {0:#}")]
    AuthFailed(#[source] anyhow::Error),
    /// Anything else; setting the entry up again later may work
    #[error("Not ready: {0:#}")]
    NotReady(#[source] anyhow::Error),
}

/// An entry whose session is logged in and whose first refresh succeeded
pub struct LoadedEntry {
    pub coordinator: Arc<TankCoordinator>,
    pub sensors: Vec<TankSensor>,
}

/// Logs in, performs the startup refresh and builds the sensors for the enabled tanks
pub async fn setup_entry(
    entry: &ConfigEntry,
    mut api: SmartOilGaugeClient,
) -> Result<LoadedEntry, EntrySetupError> {
    match api.login().await {
        Ok(true) => {}
        Ok(false) => {
            return Err(EntrySetupError::AuthFailed(anyhow::anyhow!(
                "Smart Oil Gauge did not issue an access token"
            )))
        }
        Err(e) if error_status(&e) == Some(reqwest::StatusCode::BAD_REQUEST) => {
            return Err(EntrySetupError::AuthFailed(e))
        }
        Err(e) => return Err(EntrySetupError::NotReady(e)),
    }

    let coordinator = Arc::new(TankCoordinator::new(api));
    let tanks = coordinator
        .refresh()
        .await
        .map_err(|e| EntrySetupError::NotReady(e.into()))?;

    for key in &entry.sensors {
        if !tanks.iter().any(|tank| &tank.key() == key) {
            tracing::warn!("Enabled tank {key} is not on the account anymore");
        }
    }

    let sensors = sensors_for(&tanks, &entry.sensors);
    tracing::info!(
        "Config entry `{}` ready with {} sensor(s)",
        entry.title,
        sensors.len()
    );
    Ok(LoadedEntry {
        coordinator,
        sensors,
    })
}

impl LoadedEntry {
    /// Starts the polling schedule and the Home Assistant publisher
    pub fn start(self, ha_client: HomeAssistantAPI, period: Duration) -> RunningEntry {
        let publisher =
            SensorPublisher::new(self.sensors, self.coordinator.subscribe(), ha_client).spawn();
        let scheduler = Arc::clone(&self.coordinator).spawn(period);
        RunningEntry {
            coordinator: self.coordinator,
            scheduler,
            publisher,
        }
    }
}

pub struct RunningEntry {
    pub coordinator: Arc<TankCoordinator>,
    scheduler: JoinHandle<()>,
    publisher: JoinHandle<()>,
}

impl RunningEntry {
    /// Stops scheduling refreshes and publishing
    pub fn unload(self) {
        self.scheduler.abort();
        self.publisher.abort();
        tracing::info!("Config entry unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("smartoilgauge-{}-{name}.json", std::process::id()))
    }

    async fn start_server(login_status: usize) -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token.php")
            .with_status(login_status)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "test_token", "expires_in": 3600}"#)
            .create_async()
            .await;
        server
    }

    fn api(server: &mockito::ServerGuard) -> SmartOilGaugeClient {
        SmartOilGaugeClient::with_endpoint(&server.url(), "id", "secret").unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("roundtrip");
        let entry = ConfigEntry::new("id", "secret", vec!["00A1".to_string()]);

        entry.save(&path).unwrap();
        assert_eq!(ConfigEntry::load(&path).unwrap(), entry);

        fs::remove_file(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_entry_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("private");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        ConfigEntry::new("id", "secret", vec![]).save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(ConfigEntry::load(&path).unwrap().client_secret, "secret");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_rejects_other_versions() {
        let path = temp_path("version");
        fs::write(
            &path,
            r#"{"version": 2, "title": "x", "client_id": "a", "client_secret": "b", "sensors": []}"#,
        )
        .unwrap();

        let err = ConfigEntry::load(&path).unwrap_err();
        assert!(err.to_string().contains("version 2"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        assert!(ConfigEntry::load(&temp_path("missing")).is_err());
    }

    #[tokio::test]
    async fn test_setup_entry_builds_enabled_sensors() {
        let mut server = start_server(200).await;
        server
            .mock("POST", "/auto/get_tank_data.php")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"result": "ok", "data": [
                    {"sensor_id": "A", "tank_num": "1", "battery": "Good", "nominal": "275", "gallons": "100"},
                    {"sensor_id": "B", "tank_num": "2", "battery": "Good", "nominal": "275", "gallons": "200"}
                ]}"#,
            )
            .create_async()
            .await;

        let entry = ConfigEntry::new("id", "secret", vec!["B".to_string(), "gone".to_string()]);
        let loaded = setup_entry(&entry, api(&server)).await.unwrap();

        assert_eq!(loaded.sensors.len(), 3);
        assert!(loaded.sensors.iter().all(|s| s.tank_key == "B"));
        assert_eq!(loaded.coordinator.snapshot().tanks.len(), 2);
    }

    #[tokio::test]
    async fn test_setup_entry_bad_request_is_auth_failure() {
        let server = start_server(400).await;
        let entry = ConfigEntry::new("id", "secret", vec![]);

        let Err(err) = setup_entry(&entry, api(&server)).await else {
            panic!("Expected setup to fail");
        };
        assert!(matches!(err, EntrySetupError::AuthFailed(_)));
        assert!(err.to_string().starts_with("Authentication failed"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<reqwest::Error>().is_some());
    }

    #[tokio::test]
    async fn test_setup_entry_server_error_is_not_ready() {
        let server = start_server(503).await;
        let entry = ConfigEntry::new("id", "secret", vec![]);

        let result = setup_entry(&entry, api(&server)).await;
        assert!(matches!(result, Err(EntrySetupError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_setup_entry_failed_first_refresh_is_not_ready() {
        let mut server = start_server(200).await;
        server
            .mock("POST", "/auto/get_tank_data.php")
            .with_status(500)
            .create_async()
            .await;
        let entry = ConfigEntry::new("id", "secret", vec![]);

        let result = setup_entry(&entry, api(&server)).await;
        assert!(matches!(result, Err(EntrySetupError::NotReady(_))));
    }
}
