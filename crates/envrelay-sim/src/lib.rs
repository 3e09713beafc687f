//! ---
//! relay_section: "11-simulation-test-harness"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Sensor simulator module exports."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Simulated edge sensors for envrelay.
//!
//! Each worker samples its probability profile after a random delay and
//! pushes the reading to the first reachable relay.

pub mod fleet;
pub mod profile;

pub use fleet::{FleetStats, SensorFleet, SensorWorker};
pub use profile::{RangeProfile, SensorProfile, SmokeProfile};
