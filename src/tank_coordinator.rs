use crate::smart_oil_gauge::SmartOilGaugeClient;
use crate::tank::TankInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How often the cloud is polled once the entry is set up
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// The tanks as of the most recent poll.
///
/// A failed refresh keeps the previous tanks and only clears
/// `last_update_success`, so readers never see a partially written list.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tanks: Arc<[TankInfo]>,
    pub last_update_success: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            tanks: Arc::from(Vec::new()),
            last_update_success: true,
        }
    }
}

impl Snapshot {
    pub fn tank(&self, key: &str) -> Option<&TankInfo> {
        self.tanks.iter().find(|tank| tank.key() == key)
    }
}

/// Any failure while refreshing: network, expired session or a malformed response.
/// Callers treat all of them as stale data until the next cycle.
#[derive(Debug, thiserror::Error)]
#[error("Smart Oil Gauge update failed: {source:#}")]
pub struct UpdateFailed {
    #[source]
    source: anyhow::Error,
}

/// Owns the API session and the current snapshot, and polls on a fixed cadence.
pub struct TankCoordinator {
    api: Mutex<SmartOilGaugeClient>,
    snapshot: watch::Sender<Snapshot>,
}

impl TankCoordinator {
    pub fn new(api: SmartOilGaugeClient) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            api: Mutex::new(api),
            snapshot,
        }
    }

    /// Fetches all tanks, stores them as the current snapshot and returns them
    pub async fn refresh(&self) -> Result<Arc<[TankInfo]>, UpdateFailed> {
        // The lock also keeps overlapping refreshes from racing on the session token
        let result = self.api.lock().await.fetch_all_tanks().await;

        match result {
            Ok(tanks) => {
                let tanks: Arc<[TankInfo]> = tanks.into();
                tracing::info!("Fetched {} tank(s) from Smart Oil Gauge", tanks.len());
                self.snapshot.send_replace(Snapshot {
                    tanks: Arc::clone(&tanks),
                    last_update_success: true,
                });
                Ok(tanks)
            }
            Err(source) => {
                tracing::warn!("Smart Oil Gauge refresh failed: {source:#}");
                self.snapshot
                    .send_modify(|snapshot| snapshot.last_update_success = false);
                Err(UpdateFailed { source })
            }
        }
    }

    /// Latest stored snapshot, without waiting on a refresh in progress
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Notified after every refresh attempt, successful or not
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Refreshes every `period`, starting one period from now.
    ///
    /// The startup refresh is done by entry setup before the schedule starts.
    /// Aborting the returned handle stops further refreshes.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("Polling Smart Oil Gauge every {}s", period.as_secs());

            loop {
                ticker.tick().await;
                // Failures are already logged; the next tick is the retry
                let _ = self.refresh().await;
            }
        })
    }
}
