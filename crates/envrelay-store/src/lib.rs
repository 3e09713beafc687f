//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Central store: the adapter trait, its backends, and the cloud-side service
//! that relays talk to.

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the store subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for IO errors encountered while reading/writing collection files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A message kind that has no collection was offered for storage.
    #[error("{0} messages are not stored")]
    NotStorable(&'static str),
}

pub mod collection;
pub mod jsonl;
pub mod memory;
pub mod report;
pub mod service;

pub use collection::{CentralStore, Collection};
pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use report::ReportTask;
pub use service::{StoreCounters, StoreService};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_storable_names_the_kind() {
        let err = StoreError::NotStorable("heartbeat");
        assert_eq!(format!("{err}"), "heartbeat messages are not stored");
    }
}
