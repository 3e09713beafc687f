//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Relay runtime and node orchestration."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Relay runtime, quality analysis, and the lifecycles of the relay, store,
//! and quality controller nodes.

pub mod analyzer;
pub mod node;
pub mod quality;
pub mod relay;
pub mod services;

pub use analyzer::{window_mean, Assessment, QualityAnalyzer};
pub use node::{ActiveRelay, BackupActivation, NodeHandle, RelayNode};
pub use quality::QualityController;
pub use relay::{Disposition, RelayRuntime, RelayStats};
pub use services::{start_quality, start_store, ServiceHandle};
