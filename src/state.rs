//! Server lifecycle states and the transition table
//!
//! [`plan`] maps a requested `(current, next)` pair to the side effects that
//! must be applied together with the state change. The table is pure so the
//! effects can be checked without any sockets or provider.

use crate::config::MessagesConfig;
use std::fmt;

const AQUA: &str = "\u{a7}b";
const WHITE: &str = "\u{a7}f";
const YELLOW: &str = "\u{a7}e";
const RED: &str = "\u{a7}c";
const GOLD: &str = "\u{a7}6";
const GREEN: &str = "\u{a7}a";

/// Lifecycle state of a managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Process just started, nothing observed yet
    Initializing,
    /// No instance exists
    Off,
    /// Instance being created or game server booting
    Starting,
    /// Game server answering; traffic is forwarded
    Started,
    /// Game server stopping and instance powering off
    Shutdown,
    /// Snapshot of the powered-off instance in progress
    Snapshot,
    /// Instance being deleted
    Destroy,
    /// Something went wrong; the monitor may recover it later
    Unavailable,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Off => "off",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Shutdown => "shutdown",
            Self::Snapshot => "snapshot",
            Self::Destroy => "destroy",
            Self::Unavailable => "unavailable",
        }
    }

    /// States during which the instance is being torn down
    pub fn is_tearing_down(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Snapshot | Self::Destroy)
    }

    /// Server-list status text
    pub fn status_text(&self, messages: &MessagesConfig) -> String {
        let body = match self {
            Self::Initializing => format!("{}Initializing...", YELLOW),
            Self::Off => format!("{}Powered off. Connect to start.", GOLD),
            Self::Starting => format!("{}Starting up...", GREEN),
            Self::Started => format!("{}Online", GREEN),
            Self::Shutdown | Self::Snapshot | Self::Destroy => {
                format!("{}Shutting down...", YELLOW)
            }
            Self::Unavailable => format!("{}Unavailable", RED),
        };
        format!("{}{}{}{}", AQUA, messages.server_info_prefix, WHITE, body)
    }

    /// Whether the server list should show player counts for this state
    pub fn shows_connection(&self) -> bool {
        matches!(self, Self::Off | Self::Started)
    }

    /// Message shown to a player who connects while the server is not running.
    ///
    /// `None` for [`ServerState::Off`], where connecting may start the server.
    pub fn refusal_message(&self, messages: &MessagesConfig) -> Option<String> {
        let text = match self {
            Self::Off => return None,
            Self::Initializing => "Sorry, the server is not ready to take requests yet!\n\
                                   Try connecting again in a few seconds."
                .to_string(),
            Self::Starting => "Sorry, the server is still starting up.\n\
                               Try connecting again in a few minutes."
                .to_string(),
            Self::Started => "The server is online. Try connecting again.".to_string(),
            Self::Shutdown | Self::Snapshot | Self::Destroy => {
                "Sorry, the server is currently shutting down.\n\
                 You may start it again when it is completely powered off."
                    .to_string()
            }
            Self::Unavailable => format!(
                "The server is unavailable due to an error.\nContact {} for help.",
                messages.owner
            ),
        };
        Some(with_header(messages, &text))
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix a player-facing message with the configured header
pub fn with_header(messages: &MessagesConfig, text: &str) -> String {
    format!("{}{}\n\n{}{}", AQUA, messages.message_prefix, WHITE, text)
}

/// Effect applied atomically with a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Stop forwarding the server's hostnames to the instance
    StopForwarding,
    /// Route the server's hostnames to the connect handler
    RegisterHandler,
    /// Publish the state's status line
    SetStatus,
    /// Forward the server's hostnames to `instanceIP:gamePort`
    RegisterForward,
    /// Restart the idle timer from now
    ResetIdleBaseline,
}

/// A planned state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ServerState,
    pub to: ServerState,
    pub effects: Vec<SideEffect>,
    /// False for edges outside the normal lifecycle, which are still applied
    pub nominal: bool,
}

/// Plan the change from `current` to `next`.
///
/// Returns `None` when `next` repeats the current state, except for
/// `Initializing`, which is always re-applied.
pub fn plan(current: ServerState, next: ServerState) -> Option<Transition> {
    if current == next && next != ServerState::Initializing {
        return None;
    }

    let mut effects = Vec::new();
    if next == ServerState::Started {
        effects.push(SideEffect::RegisterForward);
        effects.push(SideEffect::ResetIdleBaseline);
    } else {
        if current == ServerState::Started {
            effects.push(SideEffect::StopForwarding);
            effects.push(SideEffect::RegisterHandler);
        } else if next == ServerState::Initializing {
            effects.push(SideEffect::RegisterHandler);
        }
        effects.push(SideEffect::SetStatus);
    }

    Some(Transition {
        from: current,
        to: next,
        effects,
        nominal: is_nominal(current, next),
    })
}

/// Edges of the normal lifecycle
pub fn is_nominal(current: ServerState, next: ServerState) -> bool {
    use ServerState::*;

    matches!(
        (current, next),
        (_, Unavailable)
            | (Unavailable, _)
            | (Initializing, Initializing | Off)
            | (Off, Starting)
            | (Starting, Started)
            | (Started, Shutdown)
            | (Shutdown, Snapshot)
            | (Snapshot, Destroy)
            | (Destroy, Off)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerState::*;

    const ALL: [ServerState; 8] = [
        Initializing,
        Off,
        Starting,
        Started,
        Shutdown,
        Snapshot,
        Destroy,
        Unavailable,
    ];

    #[test]
    fn test_repeat_is_noop_except_initializing() {
        for state in ALL {
            let planned = plan(state, state);
            if state == Initializing {
                assert!(planned.is_some());
            } else {
                assert!(planned.is_none(), "{} repeated should be a no-op", state);
            }
        }
    }

    #[test]
    fn test_entering_started_registers_forward() {
        let transition = plan(Starting, Started).unwrap();
        assert_eq!(
            transition.effects,
            vec![SideEffect::RegisterForward, SideEffect::ResetIdleBaseline]
        );
        assert!(transition.nominal);
    }

    #[test]
    fn test_leaving_started_stops_forwarding() {
        for next in ALL.into_iter().filter(|s| *s != Started) {
            let transition = plan(Started, next).unwrap();
            assert_eq!(transition.effects[0], SideEffect::StopForwarding);
            assert!(transition.effects.contains(&SideEffect::RegisterHandler));
            assert!(transition.effects.contains(&SideEffect::SetStatus));
        }
    }

    #[test]
    fn test_other_transitions_only_set_status() {
        let transition = plan(Shutdown, Snapshot).unwrap();
        assert_eq!(transition.effects, vec![SideEffect::SetStatus]);
    }

    #[test]
    fn test_initializing_registers_handler() {
        let transition = plan(Initializing, Initializing).unwrap();
        assert_eq!(
            transition.effects,
            vec![SideEffect::RegisterHandler, SideEffect::SetStatus]
        );
    }

    #[test]
    fn test_nominal_edges() {
        assert!(is_nominal(Initializing, Off));
        assert!(is_nominal(Off, Starting));
        assert!(is_nominal(Started, Shutdown));
        assert!(is_nominal(Shutdown, Snapshot));
        assert!(is_nominal(Snapshot, Destroy));
        assert!(is_nominal(Destroy, Off));
        assert!(is_nominal(Starting, Unavailable));
        assert!(is_nominal(Unavailable, Started));

        assert!(!is_nominal(Initializing, Started));
        assert!(!is_nominal(Off, Started));
        assert!(!is_nominal(Started, Off));
    }

    #[test]
    fn test_texts() {
        let messages = MessagesConfig {
            owner: "Alex".to_string(),
            ..Default::default()
        };

        assert!(Off.refusal_message(&messages).is_none());
        let unavailable = Unavailable.refusal_message(&messages).unwrap();
        assert!(unavailable.contains("Contact Alex"));
        assert!(unavailable.contains(&messages.message_prefix));

        assert!(Off.status_text(&messages).ends_with("Powered off. Connect to start."));
        assert!(Snapshot.status_text(&messages).contains("Shutting down"));
        assert!(Off.shows_connection());
        assert!(!Starting.shows_connection());
    }
}
