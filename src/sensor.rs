//! Projection of tank snapshots into individual sensor entities.
//!
//! Every tank yields three sensors: battery level, gallons remaining and
//! percent full. Values are recomputed from the coordinator snapshot each
//! time it changes and are never stored.

use crate::tank::TankInfo;
use crate::tank_coordinator::Snapshot;
use std::fmt;

pub const DOMAIN: &str = "smartoilgauge";
pub const MANUFACTURER: &str = "Smart Oil Gauge";
pub const MODEL: &str = "Smart Oil Gauge Sensor";

pub const PERCENTAGE: &str = "%";
pub const GALLONS: &str = "gal";
const TANK_ICON: &str = "mdi:hydraulic-oil-level";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Battery,
    /// Gallons remaining
    TankLevel,
    /// Percent full
    TankVolume,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Battery,
        SensorKind::TankLevel,
        SensorKind::TankVolume,
    ];

    pub fn device_type(self) -> &'static str {
        match self {
            SensorKind::Battery => "battery",
            SensorKind::TankLevel => "tank_level",
            SensorKind::TankVolume => "tank_volume",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Battery => "Battery Level",
            SensorKind::TankLevel => "Tank Level",
            SensorKind::TankVolume => "Tank Volume",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SensorKind::Battery | SensorKind::TankVolume => PERCENTAGE,
            SensorKind::TankLevel => GALLONS,
        }
    }

    pub fn device_class(self) -> Option<&'static str> {
        match self {
            SensorKind::Battery => Some("battery"),
            _ => None,
        }
    }

    pub fn icon(self) -> Option<&'static str> {
        match self {
            SensorKind::Battery => None,
            SensorKind::TankLevel | SensorKind::TankVolume => Some(TANK_ICON),
        }
    }

    pub fn entity_category(self) -> Option<&'static str> {
        match self {
            SensorKind::Battery => Some("diagnostic"),
            _ => None,
        }
    }

    /// Derives this metric from a tank record. None means the value is unknown.
    pub fn value_for(self, tank: &TankInfo) -> Option<f64> {
        match self {
            SensorKind::Battery => tank.battery().percentage().map(f64::from),
            SensorKind::TankLevel => Some(tank.remaining),
            // Trim float noise such as 68.18181818181819; adding 0.0 turns -0 into 0
            SensorKind::TankVolume => tank
                .percent_full()
                .map(|percent| (percent * 100.0).round() / 100.0 + 0.0),
        }
    }
}

/// Groups the sensors of one tank under a single device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Value(f64),
    Unknown,
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Value(value) => write!(f, "{value}"),
            SensorValue::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub tank_key: String,
    pub kind: SensorKind,
    pub value: SensorValue,
    pub unit: &'static str,
}

/// One published sensor entity bound to a tank key
#[derive(Debug, Clone, PartialEq)]
pub struct TankSensor {
    pub tank_key: String,
    pub kind: SensorKind,
    pub device: DeviceInfo,
}

impl TankSensor {
    pub fn new(tank: &TankInfo, kind: SensorKind) -> Self {
        let tank_key = tank.key();
        Self {
            device: DeviceInfo {
                identifier: tank_key.clone(),
                name: tank.display_name(),
                manufacturer: MANUFACTURER,
                model: MODEL,
            },
            tank_key,
            kind,
        }
    }

    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.tank_key, self.kind.device_type())
    }

    pub fn entity_id(&self) -> String {
        format!(
            "sensor.{DOMAIN}_{}_{}",
            slugify(&self.tank_key),
            self.kind.device_type()
        )
    }

    pub fn friendly_name(&self) -> String {
        format!("{} {}", self.device.name, self.kind.name())
    }

    /// Current reading for this sensor.
    ///
    /// None when the last refresh failed or the tank vanished from the
    /// snapshot; the sensor is then unavailable rather than stale.
    pub fn reading(&self, snapshot: &Snapshot) -> Option<SensorReading> {
        if !snapshot.last_update_success {
            return None;
        }
        let tank = snapshot.tank(&self.tank_key)?;
        let value = match self.kind.value_for(tank) {
            Some(value) => SensorValue::Value(value),
            None => SensorValue::Unknown,
        };
        Some(SensorReading {
            tank_key: self.tank_key.clone(),
            kind: self.kind,
            value,
            unit: self.kind.unit(),
        })
    }
}

/// Three sensors for every tank whose key is in `enabled`
pub fn sensors_for(tanks: &[TankInfo], enabled: &[String]) -> Vec<TankSensor> {
    tanks
        .iter()
        .filter(|tank| enabled.contains(&tank.key()))
        .flat_map(|tank| SensorKind::ALL.map(|kind| TankSensor::new(tank, kind)))
        .collect()
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}
