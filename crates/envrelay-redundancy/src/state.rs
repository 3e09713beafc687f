//! ---
//! relay_section: "07-resilience-fault-tolerance"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Redundancy planning and failover coordinators."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Role a relay node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailoverState {
    PrimaryActive,
    BackupStandby,
    BackupActive,
}

impl FailoverState {
    /// Whether the node should be relaying sensor traffic.
    pub fn is_active(&self) -> bool {
        matches!(self, FailoverState::PrimaryActive | FailoverState::BackupActive)
    }
}

/// Copy of the monitor state published to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSnapshot {
    pub state: FailoverState,
    /// Silent periods left before promotion.
    pub consecutive_missed: u32,
    pub last_promotion: Option<DateTime<Utc>>,
}

/// State change produced by a monitor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Transition {
    Promoted,
    Demoted,
}

/// Heartbeat countdown driving promotion and demotion.
///
/// Pure state machine: the caller feeds it one input per monitor tick and acts
/// on the returned [`Transition`].
#[derive(Debug, Clone)]
pub struct FailoverMonitor {
    state: FailoverState,
    threshold: u32,
    remaining: u32,
    last_promotion: Option<DateTime<Utc>>,
}

impl FailoverMonitor {
    /// Monitor for a node configured as primary; it never changes role.
    pub fn primary(threshold: u32) -> Self {
        Self {
            state: FailoverState::PrimaryActive,
            threshold: threshold.max(1),
            remaining: threshold.max(1),
            last_promotion: None,
        }
    }

    /// Monitor for a backup node, starting in standby with a full countdown.
    pub fn backup(threshold: u32) -> Self {
        Self {
            state: FailoverState::BackupStandby,
            threshold: threshold.max(1),
            remaining: threshold.max(1),
            last_promotion: None,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        RoleSnapshot {
            state: self.state,
            consecutive_missed: self.remaining,
            last_promotion: self.last_promotion,
        }
    }

    /// A heartbeat arrived within the current tick.
    pub fn on_heartbeat(&mut self) -> Option<Transition> {
        self.remaining = self.threshold;
        match self.state {
            FailoverState::BackupActive => {
                self.state = FailoverState::BackupStandby;
                info!("heartbeat resumed; demoting backup relay");
                Some(Transition::Demoted)
            }
            FailoverState::BackupStandby => None,
            FailoverState::PrimaryActive => {
                warn!("primary relay received a heartbeat; is a second primary running?");
                None
            }
        }
    }

    /// A full tick passed without a heartbeat.
    pub fn on_timeout(&mut self) -> Option<Transition> {
        if self.state == FailoverState::PrimaryActive {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        debug!(remaining = self.remaining, state = %self.state, "heartbeat missed");
        if self.remaining == 0 && self.state == FailoverState::BackupStandby {
            self.state = FailoverState::BackupActive;
            self.last_promotion = Some(Utc::now());
            info!(threshold = self.threshold, "heartbeat silent; promoting backup relay");
            return Some(Transition::Promoted);
        }
        None
    }

    /// Undo a promotion whose relay could not be started.
    ///
    /// The countdown stays at zero so the next silent tick promotes again.
    pub fn rollback_promotion(&mut self) {
        if self.state == FailoverState::BackupActive {
            self.state = FailoverState::BackupStandby;
            self.remaining = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_after_threshold_timeouts() {
        let mut monitor = FailoverMonitor::backup(5);
        for _ in 0..4 {
            assert_eq!(monitor.on_timeout(), None);
        }
        assert_eq!(monitor.state(), FailoverState::BackupStandby);
        assert_eq!(monitor.on_timeout(), Some(Transition::Promoted));
        assert_eq!(monitor.state(), FailoverState::BackupActive);
        assert!(monitor.snapshot().last_promotion.is_some());
    }

    #[test]
    fn promotion_is_idempotent() {
        let mut monitor = FailoverMonitor::backup(2);
        monitor.on_timeout();
        assert_eq!(monitor.on_timeout(), Some(Transition::Promoted));
        for _ in 0..10 {
            assert_eq!(monitor.on_timeout(), None);
        }
        assert_eq!(monitor.snapshot().consecutive_missed, 0);
    }

    #[test]
    fn heartbeat_resets_countdown_and_demotes() {
        let mut monitor = FailoverMonitor::backup(3);
        monitor.on_timeout();
        monitor.on_timeout();
        assert_eq!(monitor.on_heartbeat(), None);
        assert_eq!(monitor.snapshot().consecutive_missed, 3);

        for _ in 0..3 {
            monitor.on_timeout();
        }
        assert_eq!(monitor.state(), FailoverState::BackupActive);
        assert_eq!(monitor.on_heartbeat(), Some(Transition::Demoted));
        assert_eq!(monitor.state(), FailoverState::BackupStandby);
    }

    #[test]
    fn primary_never_transitions() {
        let mut monitor = FailoverMonitor::primary(1);
        assert_eq!(monitor.on_timeout(), None);
        assert_eq!(monitor.on_heartbeat(), None);
        assert!(monitor.state().is_active());
    }

    #[test]
    fn rollback_promotes_again_on_next_silence() {
        let mut monitor = FailoverMonitor::backup(1);
        assert_eq!(monitor.on_timeout(), Some(Transition::Promoted));
        monitor.rollback_promotion();
        assert_eq!(monitor.state(), FailoverState::BackupStandby);
        assert_eq!(monitor.on_timeout(), Some(Transition::Promoted));
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let monitor = FailoverMonitor::backup(0);
        assert_eq!(monitor.threshold(), 1);
    }
}
