//! Instance phase derivation
//!
//! A provider reports two things about an instance: its raw power status
//! and a history of actions. Neither alone says what the instance is doing,
//! so the phase is derived from the most recent action first and the power
//! status second. Right after the control plane issues an action, the
//! provider can still report the previous one; an [`Immunity`] window makes
//! the locally recorded phase win until it expires.

use crate::provider::{ActionKind, ActionStatus, InstanceStatus, ProviderAction};
use crate::state::ServerState;
use tokio::time::Instant;

/// What an instance is doing, as far as the control plane can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Unknown,
    Active,
    Snapshotting,
    ShuttingDown,
    Destroying,
    Creating,
    PoweredOff,
    /// The most recent action failed
    Errored,
}

impl InstancePhase {
    /// A provider-side action is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Snapshotting | Self::ShuttingDown | Self::Destroying | Self::Creating
        )
    }
}

/// Locally recorded phase that overrides the provider until `until`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Immunity {
    pub phase: InstancePhase,
    pub until: Instant,
}

impl Immunity {
    /// The recorded phase, if the window is still open at `now`
    pub fn active_at(&self, now: Instant) -> Option<InstancePhase> {
        (now < self.until).then_some(self.phase)
    }
}

/// Derive the phase from the latest action and the raw status.
///
/// `shutdown_requested` is set when the server is locally in Shutdown: a
/// completed action on an instance that still reports active then means the
/// power-off has not landed yet.
pub fn derive(
    action: Option<&ProviderAction>,
    status: InstanceStatus,
    shutdown_requested: bool,
) -> InstancePhase {
    let Some(action) = action else {
        return from_status(status, shutdown_requested);
    };

    match action.status {
        ActionStatus::Errored => InstancePhase::Errored,
        ActionStatus::Completed => from_status(status, shutdown_requested),
        ActionStatus::InProgress => match action.kind {
            ActionKind::Create => InstancePhase::Creating,
            ActionKind::Snapshot => InstancePhase::Snapshotting,
            ActionKind::Shutdown => InstancePhase::ShuttingDown,
            ActionKind::Destroy => InstancePhase::Destroying,
            ActionKind::Other => InstancePhase::Unknown,
        },
    }
}

fn from_status(status: InstanceStatus, shutdown_requested: bool) -> InstancePhase {
    match status {
        InstanceStatus::Active if shutdown_requested => InstancePhase::ShuttingDown,
        InstanceStatus::Active => InstancePhase::Active,
        InstanceStatus::New => InstancePhase::Creating,
        InstanceStatus::Off | InstanceStatus::Archive => InstancePhase::PoweredOff,
        InstanceStatus::Unknown => InstancePhase::Unknown,
    }
}

/// What the monitor should do once the phase of a non-responding instance is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Set(ServerState),
    Keep,
    Snapshot,
    Destroy,
}

/// Reconcile a server's state with the phase of its instance.
///
/// Only used when the health probe did not answer.
pub fn settle(current: ServerState, phase: InstancePhase) -> Verdict {
    use ServerState::*;

    match phase {
        InstancePhase::Creating => Verdict::Set(Starting),
        InstancePhase::Snapshotting => Verdict::Set(Snapshot),
        InstancePhase::ShuttingDown => Verdict::Set(Shutdown),
        InstancePhase::Destroying => Verdict::Set(Destroy),
        InstancePhase::Errored | InstancePhase::Unknown => Verdict::Set(Unavailable),
        InstancePhase::Active => match current {
            Snapshot => Verdict::Destroy,
            Initializing | Off => Verdict::Set(Starting),
            Started => Verdict::Set(Unavailable),
            Starting | Unavailable | Shutdown | Destroy => Verdict::Keep,
        },
        InstancePhase::PoweredOff => match current {
            Shutdown => Verdict::Snapshot,
            Snapshot | Destroy => Verdict::Keep,
            _ => Verdict::Set(Unavailable),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn action(kind: ActionKind, status: ActionStatus) -> ProviderAction {
        ProviderAction { id: 1, kind, status }
    }

    #[test]
    fn test_errored_action_wins() {
        let errored = action(ActionKind::Create, ActionStatus::Errored);
        assert_eq!(
            derive(Some(&errored), InstanceStatus::Active, false),
            InstancePhase::Errored
        );
    }

    #[test]
    fn test_completed_action_uses_status() {
        let done = action(ActionKind::Create, ActionStatus::Completed);
        assert_eq!(
            derive(Some(&done), InstanceStatus::Active, false),
            InstancePhase::Active
        );
        assert_eq!(
            derive(Some(&done), InstanceStatus::Off, false),
            InstancePhase::PoweredOff
        );
        assert_eq!(
            derive(Some(&done), InstanceStatus::Active, true),
            InstancePhase::ShuttingDown
        );
    }

    #[test]
    fn test_in_progress_actions() {
        let cases = [
            (ActionKind::Create, InstancePhase::Creating),
            (ActionKind::Snapshot, InstancePhase::Snapshotting),
            (ActionKind::Shutdown, InstancePhase::ShuttingDown),
            (ActionKind::Destroy, InstancePhase::Destroying),
            (ActionKind::Other, InstancePhase::Unknown),
        ];
        for (kind, expected) in cases {
            let running = action(kind, ActionStatus::InProgress);
            assert_eq!(derive(Some(&running), InstanceStatus::Active, false), expected);
        }
    }

    #[test]
    fn test_no_history() {
        assert_eq!(derive(None, InstanceStatus::New, false), InstancePhase::Creating);
        assert_eq!(derive(None, InstanceStatus::Off, false), InstancePhase::PoweredOff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immunity_window() {
        let immunity = Immunity {
            phase: InstancePhase::ShuttingDown,
            until: Instant::now() + Duration::from_secs(10),
        };
        assert_eq!(
            immunity.active_at(Instant::now()),
            Some(InstancePhase::ShuttingDown)
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(immunity.active_at(Instant::now()), None);
    }

    #[test]
    fn test_settle_running_without_probe() {
        use ServerState::*;
        assert_eq!(settle(Started, InstancePhase::Active), Verdict::Set(Unavailable));
        assert_eq!(settle(Starting, InstancePhase::Active), Verdict::Keep);
        assert_eq!(settle(Off, InstancePhase::Active), Verdict::Set(Starting));
        assert_eq!(settle(Snapshot, InstancePhase::Active), Verdict::Destroy);
    }

    #[test]
    fn test_settle_powered_off() {
        use ServerState::*;
        assert_eq!(settle(Shutdown, InstancePhase::PoweredOff), Verdict::Snapshot);
        assert_eq!(settle(Snapshot, InstancePhase::PoweredOff), Verdict::Keep);
        assert_eq!(
            settle(Started, InstancePhase::PoweredOff),
            Verdict::Set(Unavailable)
        );
    }

    #[test]
    fn test_settle_transient() {
        use ServerState::*;
        assert_eq!(settle(Off, InstancePhase::Creating), Verdict::Set(Starting));
        assert_eq!(
            settle(Started, InstancePhase::ShuttingDown),
            Verdict::Set(Shutdown)
        );
        assert_eq!(settle(Starting, InstancePhase::Errored), Verdict::Set(Unavailable));
        assert!(InstancePhase::Creating.is_transient());
        assert!(!InstancePhase::Active.is_transient());
    }
}
