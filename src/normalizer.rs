//! Unit conversion and quality judgment for incoming readings.
//!
//! Every metric family maps its accepted units onto the canonical unit
//! with an affine formula `canonical = value * scale + offset`. Linear
//! families (pressure, conductivity, concentration, light) have a zero
//! offset; temperature is the only family that needs one.
//!
//! Quality rules, applied to the canonical value:
//! - source timestamp more than the skew tolerance ahead of `now`
//!   -> `BadFutureTimestamp`
//! - value outside the metric's expected range -> `BadOutOfRange`
//! - otherwise `Good`
//!
//! When both checks fail, `BadFutureTimestamp` is recorded.

use std::ops::RangeInclusive;

use chrono::{DateTime, Duration, Utc};

use crate::error::NormalizeError;
use crate::models::{MetricType, NormalizedReading, QualityCode, RawReading, SensorStream, Unit};

// ---

#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
    scale: f64,
    offset: f64,
}

impl Affine {
    // ---
    const IDENTITY: Affine = Affine::linear(1.0);

    const fn linear(scale: f64) -> Self {
        Affine { scale, offset: 0.0 }
    }

    fn forward(self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    fn inverse(self, value: f64) -> f64 {
        (value - self.offset) / self.scale
    }
}

/// Formula taking `unit` to the canonical unit of `metric`, or `None` if
/// the unit is not part of the metric's family.
fn to_canonical(metric: MetricType, unit: Unit) -> Option<Affine> {
    // ---
    use MetricType as M;

    let affine = match (metric, unit) {
        (M::Temperature, Unit::Fahrenheit) => Affine::IDENTITY,
        (M::Temperature, Unit::Celsius) => Affine {
            scale: 9.0 / 5.0,
            offset: 32.0,
        },
        (M::Temperature, Unit::Kelvin) => Affine {
            scale: 9.0 / 5.0,
            offset: -459.67,
        },

        (M::Humidity, Unit::Percent) => Affine::IDENTITY,
        (M::Humidity, Unit::Fraction) => Affine::linear(100.0),

        (M::Co2, Unit::Ppm) => Affine::IDENTITY,
        (M::Co2, Unit::Ppb) => Affine::linear(0.001),
        (M::Co2, Unit::Percent) => Affine::linear(10_000.0),

        (M::Vpd, Unit::Kilopascal) => Affine::IDENTITY,
        (M::Vpd, Unit::Pascal) => Affine::linear(0.001),
        (M::Vpd, Unit::Hectopascal) => Affine::linear(0.1),
        (M::Vpd, Unit::Psi) => Affine::linear(6.894_757),

        (M::Ec, Unit::MicrosiemensPerCm) => Affine::IDENTITY,
        (M::Ec, Unit::MillisiemensPerCm) => Affine::linear(1_000.0),
        (M::Ec, Unit::DecisiemensPerM) => Affine::linear(1_000.0),

        (M::Ph, Unit::Ph) => Affine::IDENTITY,

        (M::Light, Unit::MicromolePerM2S) => Affine::IDENTITY,
        (M::Light, Unit::MillimolePerM2S) => Affine::linear(1_000.0),

        _ => return None,
    };
    Some(affine)
}

/// Convert `value` between two units of the same metric family.
///
/// Same-unit conversion is the identity. A unit outside the family is an
/// error, never a pass-through. A result that overflows to infinity is
/// rejected like a non-finite input.
pub fn convert(
    metric: MetricType,
    value: f64,
    from: Unit,
    to: Unit,
) -> Result<f64, NormalizeError> {
    // ---
    if !value.is_finite() {
        return Err(NormalizeError::NonFiniteValue);
    }

    let unsupported = |unit| NormalizeError::UnsupportedConversion { unit, metric };
    let from_affine = to_canonical(metric, from).ok_or_else(|| unsupported(from))?;
    let to_affine = to_canonical(metric, to).ok_or_else(|| unsupported(to))?;

    if from == to {
        return Ok(value);
    }
    let converted = to_affine.inverse(from_affine.forward(value));
    if !converted.is_finite() {
        return Err(NormalizeError::NonFiniteValue);
    }
    Ok(converted)
}

/// Physically plausible range for `metric`, in its canonical unit.
pub fn expected_range(metric: MetricType) -> RangeInclusive<f64> {
    // ---
    match metric {
        MetricType::Temperature => -50.0..=150.0,
        MetricType::Humidity => 0.0..=100.0,
        MetricType::Co2 => 0.0..=5_000.0,
        MetricType::Vpd => 0.0..=10.0,
        MetricType::Ec => 0.0..=20_000.0,
        MetricType::Ph => 0.0..=14.0,
        MetricType::Light => 0.0..=3_000.0,
    }
}

/// Stateless converter; holds only the timestamp skew tolerance.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    future_skew: Duration,
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer::new(Duration::seconds(60))
    }
}

impl Normalizer {
    // ---
    pub fn new(future_skew: Duration) -> Self {
        Normalizer { future_skew }
    }

    /// Convert `raw` into `stream`'s canonical unit and attach a quality
    /// judgment. `now` comes from the injected clock.
    pub fn normalize(
        &self,
        raw: &RawReading,
        stream: &SensorStream,
        now: DateTime<Utc>,
    ) -> Result<NormalizedReading, NormalizeError> {
        // ---
        let unit: Unit = raw.unit.parse()?;
        let target = stream.metric.canonical_unit();
        let value = convert(stream.metric, raw.value, unit, target)?;

        Ok(NormalizedReading {
            stream_id: raw.stream_id,
            value,
            quality: self.assess(stream.metric, value, raw.source_ts, now),
            source_ts: raw.source_ts,
            ingested_at: raw.ingested_at,
            message_id: raw.message_id.clone(),
            metadata: raw.metadata.clone(),
        })
    }

    /// Quality of a canonical value. Both checks always run; the timestamp
    /// judgment takes precedence. A skew that overflows the calendar leaves
    /// nothing in the future.
    pub fn assess(
        &self,
        metric: MetricType,
        canonical_value: f64,
        source_ts: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QualityCode {
        // ---
        let limit = now.checked_add_signed(self.future_skew);
        let in_future = matches!((source_ts, limit), (Some(ts), Some(limit)) if ts > limit);
        let in_range = expected_range(metric).contains(&canonical_value);

        match (in_future, in_range) {
            (true, _) => QualityCode::BadFutureTimestamp,
            (false, false) => QualityCode::BadOutOfRange,
            (false, true) => QualityCode::Good,
        }
    }
}
