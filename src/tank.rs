/// One physical tank as reported by the Smart Oil Gauge cloud on the latest poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TankInfo {
    pub sensor_ids: Vec<String>,
    pub tank_number: u32,
    pub battery_level: String,
    /// Total tank capacity in gallons
    pub capacity: f64,
    /// Gallons currently in the tank
    pub remaining: f64,
}

impl TankInfo {
    /// Stable key for the tank, built from its ordered sensor ids.
    pub fn key(&self) -> String {
        tank_key(&self.sensor_ids)
    }

    pub fn display_name(&self) -> String {
        format!("Tank {}", self.tank_number)
    }

    pub fn battery(&self) -> BatteryLevel {
        BatteryLevel::from_label(&self.battery_level)
    }

    /// How full the tank is, in percent. None when the capacity is unusable.
    pub fn percent_full(&self) -> Option<f64> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 || !self.remaining.is_finite() {
            return None;
        }
        Some((1.0 - (self.capacity - self.remaining) / self.capacity) * 100.0)
    }
}

pub fn tank_key<S: AsRef<str>>(sensor_ids: &[S]) -> String {
    sensor_ids
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("-")
}

/// Battery state reported by the gauge as a qualitative label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

impl BatteryLevel {
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Excellent" => BatteryLevel::Excellent,
            "Good" => BatteryLevel::Good,
            "Fair" => BatteryLevel::Fair,
            "Poor" => BatteryLevel::Poor,
            _ => BatteryLevel::Unknown,
        }
    }

    pub fn percentage(self) -> Option<u8> {
        match self {
            BatteryLevel::Excellent => Some(100),
            BatteryLevel::Good => Some(75),
            BatteryLevel::Fair => Some(50),
            BatteryLevel::Poor => Some(25),
            BatteryLevel::Unknown => None,
        }
    }
}
