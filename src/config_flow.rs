//! Interactive setup: validate credentials, discover tanks, pick which to publish.
//!
//! The flow never raises. Login and discovery failures come back as form
//! errors on the step that caused them, so the caller can ask again.

use crate::config_entry::ConfigEntry;
use crate::smart_oil_gauge::{error_status, is_connect_timeout, SmartOilGaugeClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormError {
    #[error("Invalid authentication")]
    InvalidAuth,
    #[error("Failed to connect")]
    CannotConnect,
    #[error("Selection contains unknown tanks")]
    InvalidSelection,
    #[error("Unexpected error")]
    Unknown,
}

impl FormError {
    /// Sorts a login or discovery failure: 400 means bad credentials,
    /// a connect timeout is a connectivity problem, anything else is unknown.
    pub fn classify(err: &anyhow::Error) -> Self {
        if is_connect_timeout(err) {
            FormError::CannotConnect
        } else if error_status(err) == Some(reqwest::StatusCode::BAD_REQUEST) {
            FormError::InvalidAuth
        } else {
            FormError::Unknown
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            FormError::InvalidAuth => "invalid_auth",
            FormError::CannotConnect => "cannot_connect",
            FormError::InvalidSelection => "invalid_selection",
            FormError::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

/// A discovered tank the operator can enable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankOption {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowResult {
    /// Credentials form, with the reason the previous attempt failed
    AskCredentials { error: Option<FormError> },
    /// Tank selection form, everything selected by default
    SelectTanks {
        options: Vec<TankOption>,
        default: Vec<String>,
        error: Option<FormError>,
    },
    CreateEntry(ConfigEntry),
}

pub struct SetupFlow {
    endpoint_url: Option<String>,
    credentials: Option<Credentials>,
    options: Vec<TankOption>,
}

impl Default for SetupFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupFlow {
    /// Flow against `SOG_API_URL`, or the public cloud when unset
    pub fn new() -> Self {
        Self {
            endpoint_url: None,
            credentials: None,
            options: Vec::new(),
        }
    }

    pub fn with_endpoint(endpoint_url: &str) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.to_string()),
            ..Self::new()
        }
    }

    pub fn start(&self) -> FlowResult {
        FlowResult::AskCredentials { error: None }
    }

    /// Logs in once and discovers the tanks on the account
    pub async fn step_user(&mut self, credentials: Credentials) -> FlowResult {
        match self.discover(&credentials).await {
            Ok(options) => {
                tracing::info!("Discovered {} tank(s)", options.len());
                self.credentials = Some(credentials);
                self.options = options;
                self.select_tanks(None)
            }
            Err(error) => FlowResult::AskCredentials { error: Some(error) },
        }
    }

    /// Finishes the flow with the chosen tank keys
    pub fn step_devices(&mut self, selection: Vec<String>) -> FlowResult {
        let Some(credentials) = &self.credentials else {
            return self.start();
        };
        if selection
            .iter()
            .any(|key| !self.options.iter().any(|option| &option.key == key))
        {
            return self.select_tanks(Some(FormError::InvalidSelection));
        }

        FlowResult::CreateEntry(ConfigEntry::new(
            &credentials.client_id,
            &credentials.client_secret,
            selection,
        ))
    }

    async fn discover(&self, credentials: &Credentials) -> Result<Vec<TankOption>, FormError> {
        let client = match &self.endpoint_url {
            Some(url) => SmartOilGaugeClient::with_endpoint(
                url,
                &credentials.client_id,
                &credentials.client_secret,
            ),
            None => SmartOilGaugeClient::new(&credentials.client_id, &credentials.client_secret),
        };
        let mut api = client.map_err(|e| {
            tracing::error!("Unexpected exception: {e:#}");
            FormError::Unknown
        })?;

        let logged_in = api.login().await.map_err(|e| classify_logged(&e))?;
        if !logged_in {
            return Err(FormError::InvalidAuth);
        }

        let tanks = api.fetch_all_tanks().await.map_err(|e| classify_logged(&e))?;
        Ok(tanks
            .iter()
            .map(|tank| TankOption {
                key: tank.key(),
                name: tank.display_name(),
            })
            .collect())
    }

    fn select_tanks(&self, error: Option<FormError>) -> FlowResult {
        FlowResult::SelectTanks {
            options: self.options.clone(),
            default: self.options.iter().map(|option| option.key.clone()).collect(),
            error,
        }
    }
}

fn classify_logged(err: &anyhow::Error) -> FormError {
    let error = FormError::classify(err);
    if error == FormError::Unknown {
        tracing::error!("Unexpected exception: {err:#}");
    } else {
        tracing::warn!("Setup failed ({}): {err:#}", error.key());
    }
    error
}
