//! Sensor streams, metric types and measurement units.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NormalizeError;

// ---

/// What a stream measures. Fixed for the lifetime of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Temperature,
    Humidity,
    Co2,
    Vpd,
    Ec,
    Ph,
    Light,
}

impl MetricType {
    // ---
    pub const ALL: [MetricType; 7] = [
        MetricType::Temperature,
        MetricType::Humidity,
        MetricType::Co2,
        MetricType::Vpd,
        MetricType::Ec,
        MetricType::Ph,
        MetricType::Light,
    ];

    /// The unit every value of this metric is stored in.
    pub fn canonical_unit(self) -> Unit {
        // ---
        match self {
            MetricType::Temperature => Unit::Fahrenheit,
            MetricType::Humidity => Unit::Percent,
            MetricType::Co2 => Unit::Ppm,
            MetricType::Vpd => Unit::Kilopascal,
            MetricType::Ec => Unit::MicrosiemensPerCm,
            MetricType::Ph => Unit::Ph,
            MetricType::Light => Unit::MicromolePerM2S,
        }
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            MetricType::Temperature => "temperature",
            MetricType::Humidity => "humidity",
            MetricType::Co2 => "co2",
            MetricType::Vpd => "vpd",
            MetricType::Ec => "ec",
            MetricType::Ph => "ph",
            MetricType::Light => "light",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        MetricType::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| NormalizeError::UnknownMetric(s.to_string()))
    }
}

/// Units reported by vendor devices.
///
/// `Percent` is shared between families: relative humidity for
/// [`MetricType::Humidity`], volume percent for [`MetricType::Co2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    Fahrenheit,
    Celsius,
    Kelvin,
    Percent,
    Fraction,
    Ppm,
    Ppb,
    Kilopascal,
    Pascal,
    Hectopascal,
    Psi,
    MicrosiemensPerCm,
    MillisiemensPerCm,
    DecisiemensPerM,
    Ph,
    MicromolePerM2S,
    MillimolePerM2S,
}

impl Unit {
    // ---
    pub fn symbol(self) -> &'static str {
        // ---
        match self {
            Unit::Fahrenheit => "°F",
            Unit::Celsius => "°C",
            Unit::Kelvin => "K",
            Unit::Percent => "%",
            Unit::Fraction => "fraction",
            Unit::Ppm => "ppm",
            Unit::Ppb => "ppb",
            Unit::Kilopascal => "kPa",
            Unit::Pascal => "Pa",
            Unit::Hectopascal => "hPa",
            Unit::Psi => "psi",
            Unit::MicrosiemensPerCm => "µS/cm",
            Unit::MillisiemensPerCm => "mS/cm",
            Unit::DecisiemensPerM => "dS/m",
            Unit::Ph => "pH",
            Unit::MicromolePerM2S => "µmol/m²/s",
            Unit::MillimolePerM2S => "mmol/m²/s",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = NormalizeError;

    /// Parse a vendor unit label. Matching ignores case, whitespace and
    /// the micro/mu and superscript spellings devices disagree on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                'µ' | 'μ' => 'u',
                '²' => '2',
                other => other,
            })
            .collect();

        let unit = match key.as_str() {
            "°f" | "f" | "degf" | "deg_f" | "fahrenheit" => Unit::Fahrenheit,
            "°c" | "c" | "degc" | "deg_c" | "celsius" => Unit::Celsius,
            "k" | "kelvin" => Unit::Kelvin,
            "%" | "percent" | "pct" | "%rh" | "rh" => Unit::Percent,
            "fraction" | "ratio" => Unit::Fraction,
            "ppm" => Unit::Ppm,
            "ppb" => Unit::Ppb,
            "kpa" => Unit::Kilopascal,
            "pa" => Unit::Pascal,
            "hpa" | "mbar" => Unit::Hectopascal,
            "psi" => Unit::Psi,
            "us/cm" | "us" => Unit::MicrosiemensPerCm,
            "ms/cm" | "ms" => Unit::MillisiemensPerCm,
            "ds/m" => Unit::DecisiemensPerM,
            "ph" => Unit::Ph,
            "umol/m2/s" | "umol" | "ppfd" => Unit::MicromolePerM2S,
            "mmol/m2/s" | "mmol" => Unit::MillimolePerM2S,
            _ => return Err(NormalizeError::UnknownUnit(s.to_string())),
        };
        Ok(unit)
    }
}

impl TryFrom<String> for Unit {
    type Error = NormalizeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.symbol().to_string()
    }
}

/// A named, site-scoped series of readings for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStream {
    // ---
    pub id: Uuid,
    pub site_id: Uuid,
    pub equipment_id: Option<Uuid>,
    pub name: String,
    pub metric: MetricType,
    pub canonical_unit: Unit,
    pub created_at: DateTime<Utc>,
}

impl SensorStream {
    // ---
    pub fn new(
        site_id: Uuid,
        equipment_id: Option<Uuid>,
        name: impl Into<String>,
        metric: MetricType,
        created_at: DateTime<Utc>,
    ) -> Self {
        // ---
        SensorStream {
            id: Uuid::new_v4(),
            site_id,
            equipment_id,
            name: name.into(),
            metric,
            canonical_unit: metric.canonical_unit(),
            created_at,
        }
    }
}
