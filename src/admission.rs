//! What a player sees when connecting to a server that is not forwarding

use crate::gateway::{ConnectHandler, Player};
use crate::lifecycle::{Operation, Orchestrator};
use crate::state::with_header;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Answers logins with a state message; whitelisted players may cold-start an Off server
pub struct Admission {
    orchestrator: Arc<Orchestrator>,
}

impl Admission {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self { orchestrator })
    }
}

#[async_trait]
impl ConnectHandler for Admission {
    async fn on_connect(&self, server_name: &str, player: &Player) -> String {
        let Some(server) = self.orchestrator.context().fleet.get(server_name) else {
            warn!(server = server_name, "Login routed to an unknown server");
            return "Unknown server.".to_string();
        };

        let settings = server.settings();
        if let Some(message) = server.state().refusal_message(&settings.messages) {
            return message;
        }

        if !settings.may_start(&player.username) {
            info!(server = %server.name(), player = %player.username, ip = %player.ip, "Player not allowed to start server");
            return with_header(
                &settings.messages,
                &format!(
                    "You are not allowed to start this server.\nContact {} for access.",
                    settings.messages.owner
                ),
            );
        }

        info!(server = %server.name(), player = %player.username, ip = %player.ip, "Starting server for player");
        self.orchestrator.submit(server, Operation::Restore);

        with_header(
            &settings.messages,
            &format!(
                "The server is starting up. This takes about {}.\nTry connecting again soon.",
                settings.messages.boot_time
            ),
        )
    }
}
