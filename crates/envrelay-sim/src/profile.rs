//! ---
//! relay_section: "11-simulation-test-harness"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Sensor probability profiles and value sampling."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use envrelay_msg::{SensorType, SensorValue, SENSOR_ERROR_SENTINEL};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Distance beyond the configured range covered by out-of-range samples.
const OUT_OF_RANGE_SPAN: f64 = 10.0;

fn default_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_jitter() -> Duration {
    Duration::from_secs(5)
}

/// Profile of a numeric sensor (temperature, humidity).
///
/// Each sample is correct with `probability_correct`, out of range with
/// `probability_out_of_range`, and a sensor error otherwise.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeProfile {
    pub probability_correct: f64,
    pub probability_out_of_range: f64,
    pub range_min: f64,
    pub range_max: f64,
    #[serde(default = "default_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_ms: Duration,
    /// Upper bound of the random wait before each sample.
    #[serde(default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter_ms: Duration,
}

/// Profile of a smoke detector; the remaining probability yields no reading.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmokeProfile {
    pub probability_true: f64,
    pub probability_false: f64,
    #[serde(default = "default_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval_ms: Duration,
    #[serde(default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter_ms: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorProfile {
    Range(RangeProfile),
    Smoke(SmokeProfile),
}

impl SensorProfile {
    /// Load the profile of `sensor` from a JSON file.
    pub fn from_path(sensor: SensorType, path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read sensor profile {}", path.display()))?;
        Self::from_json(sensor, &contents)
            .with_context(|| format!("invalid sensor profile {}", path.display()))
    }

    pub fn from_json(sensor: SensorType, contents: &str) -> Result<Self> {
        let profile = match sensor {
            SensorType::Smoke => SensorProfile::Smoke(serde_json::from_str(contents)?),
            SensorType::Temperature | SensorType::Humidity => {
                SensorProfile::Range(serde_json::from_str(contents)?)
            }
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        let (first, second) = match self {
            SensorProfile::Range(profile) => {
                if !profile.range_min.is_finite() || !profile.range_max.is_finite() {
                    bail!(
                        "range bounds must be finite, got [{}, {}]",
                        profile.range_min,
                        profile.range_max
                    );
                }
                if profile.range_min > profile.range_max {
                    bail!(
                        "range_min {} exceeds range_max {}",
                        profile.range_min,
                        profile.range_max
                    );
                }
                (profile.probability_correct, profile.probability_out_of_range)
            }
            SensorProfile::Smoke(profile) => (profile.probability_true, profile.probability_false),
        };
        for probability in [first, second] {
            if !(0.0..=1.0).contains(&probability) {
                bail!("probability {probability} is outside [0, 1]");
            }
        }
        if first + second > 1.0 {
            bail!("probabilities add up to {}, more than 1", first + second);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        match self {
            SensorProfile::Range(profile) => profile.interval_ms,
            SensorProfile::Smoke(profile) => profile.interval_ms,
        }
    }

    pub fn jitter(&self) -> Duration {
        match self {
            SensorProfile::Range(profile) => profile.jitter_ms,
            SensorProfile::Smoke(profile) => profile.jitter_ms,
        }
    }

    /// Draw one reading.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SensorValue {
        let roll: f64 = rng.gen();
        match self {
            SensorProfile::Range(profile) => {
                if roll < profile.probability_correct {
                    SensorValue::Numeric(rng.gen_range(profile.range_min..=profile.range_max))
                } else if roll < profile.probability_correct + profile.probability_out_of_range {
                    let value = if rng.gen_bool(0.5) {
                        rng.gen_range(profile.range_min - OUT_OF_RANGE_SPAN..profile.range_min)
                    } else {
                        rng.gen_range(profile.range_max..profile.range_max + OUT_OF_RANGE_SPAN)
                    };
                    SensorValue::Numeric(value)
                } else {
                    SensorValue::Numeric(SENSOR_ERROR_SENTINEL)
                }
            }
            SensorProfile::Smoke(profile) => {
                if roll < profile.probability_true {
                    SensorValue::Flag(true)
                } else if roll < profile.probability_true + profile.probability_false {
                    SensorValue::Flag(false)
                } else {
                    SensorValue::Absent
                }
            }
        }
    }
}
