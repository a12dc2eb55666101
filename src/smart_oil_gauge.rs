use crate::tank::TankInfo;
use anyhow::Context;
use serde_derive::Deserialize;
use std::env;
use std::time::{Duration, Instant};

pub const DEFAULT_API_URL: &str = "https://api.dropletfuel.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;
// Refresh the bearer token slightly before the cloud considers it expired
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 30;

/// Client for the Smart Oil Gauge cloud API.
///
/// Holds one session: `login` exchanges the client credentials for a bearer
/// token that `fetch_all_tanks` then uses until it expires.
pub struct SmartOilGaugeClient {
    endpoint_url: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
    token: Option<AccessToken>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl SmartOilGaugeClient {
    /// Creates a client against `SOG_API_URL`, or the public cloud when unset
    pub fn new(client_id: &str, client_secret: &str) -> anyhow::Result<Self> {
        let endpoint_url = env::var("SOG_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::with_endpoint(&endpoint_url, client_id, client_secret)
    }

    pub fn with_endpoint(
        endpoint_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> anyhow::Result<Self> {
        Self::with_timeouts(
            endpoint_url,
            client_id,
            client_secret,
            REQUEST_TIMEOUT,
            CONNECT_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        endpoint_url: &str,
        client_id: &str,
        client_secret: &str,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            client,
            token: None,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.as_ref().is_some_and(|token| !token.is_expired())
    }

    /// Exchanges the client credentials for an access token.
    ///
    /// Returns `Ok(false)` when the cloud answers without a token. HTTP error
    /// statuses are returned as errors wrapping the `reqwest::Error`, so callers
    /// can tell a rejected login (400) apart from other failures.
    pub async fn login(&mut self) -> anyhow::Result<bool> {
        self.token = None;
        let response: TokenResponse = self
            .client
            .post(format!("{}/token.php", self.endpoint_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.access_token {
            Some(value) if !value.is_empty() => {
                let lifetime = response
                    .expires_in
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
                    .saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
                self.token = Some(AccessToken {
                    value,
                    expires_at: Instant::now() + Duration::from_secs(lifetime),
                });
                tracing::debug!("Logged in to Smart Oil Gauge, token valid for {lifetime}s");
                Ok(true)
            }
            _ => {
                tracing::warn!(
                    "Smart Oil Gauge login returned no token: {}",
                    response.error.unwrap_or_default()
                );
                Ok(false)
            }
        }
    }

    /// Fetches every tank on the account. One malformed record fails the whole fetch.
    pub async fn fetch_all_tanks(&mut self) -> anyhow::Result<Vec<TankInfo>> {
        let token = self.valid_token().await?;
        let response = self
            .client
            .post(format!("{}/auto/get_tank_data.php", self.endpoint_url))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Force a fresh login on the next fetch
            self.token = None;
        }

        let body: TankDataResponse = response.error_for_status()?.json().await?;
        if body.result != "ok" {
            anyhow::bail!("Tank data request failed with result `{}`", body.result);
        }

        body.data
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                TankInfo::try_from(raw).with_context(|| format!("Malformed tank record #{index}"))
            })
            .collect()
    }

    async fn valid_token(&mut self) -> anyhow::Result<String> {
        if !self.is_logged_in() && !self.login().await? {
            anyhow::bail!("Smart Oil Gauge rejected the client credentials");
        }
        self.token
            .as_ref()
            .map(|token| token.value.clone())
            .context("No access token after login")
    }
}

/// HTTP status behind an API error, if the server answered at all
pub fn error_status(err: &anyhow::Error) -> Option<reqwest::StatusCode> {
    err.downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
}

/// True when no connection to the cloud could be opened before the connect timeout.
/// Refused connections and timeouts on an open connection are not included.
pub fn is_connect_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_connect() && e.is_timeout())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TankDataResponse {
    result: String,
    #[serde(default)]
    data: Vec<RawTank>,
}

#[derive(Debug, Deserialize)]
struct RawTank {
    sensor_id: SensorIds,
    tank_num: NumberOrString,
    #[serde(default)]
    battery: String,
    nominal: NumberOrString,
    gallons: NumberOrString,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SensorIds {
    Many(Vec<String>),
    Joined(String),
}

impl SensorIds {
    fn into_vec(self) -> Vec<String> {
        let ids = match self {
            SensorIds::Many(ids) => ids,
            SensorIds::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        ids.into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

// The cloud is inconsistent about quoting numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn to_f64(&self, field: &str) -> anyhow::Result<f64> {
        let value = match self {
            NumberOrString::Number(value) => *value,
            NumberOrString::Text(text) => text
                .trim()
                .parse()
                .with_context(|| format!("Field `{field}` is not a number: `{text}`"))?,
        };
        if !value.is_finite() {
            anyhow::bail!("Field `{field}` is not finite");
        }
        Ok(value)
    }
}

impl TryFrom<RawTank> for TankInfo {
    type Error = anyhow::Error;

    fn try_from(raw: RawTank) -> Result<Self, Self::Error> {
        let sensor_ids = raw.sensor_id.into_vec();
        if sensor_ids.is_empty() {
            anyhow::bail!("Tank record has no sensor id");
        }
        let tank_num = raw.tank_num.to_f64("tank_num")?;
        if tank_num < 0.0 || tank_num.fract() != 0.0 || tank_num > u32::MAX as f64 {
            anyhow::bail!("Field `tank_num` is not a tank number: {tank_num}");
        }
        Ok(TankInfo {
            sensor_ids,
            tank_number: tank_num as u32,
            battery_level: raw.battery,
            capacity: raw.nominal.to_f64("nominal")?,
            remaining: raw.gallons.to_f64("gallons")?,
        })
    }
}
