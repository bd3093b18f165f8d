//! The configured set of managed servers

use crate::config::ServerConfig;
use crate::gateway::Listener;
use crate::server::{ManagedServer, ServerSettings};
use crate::state::ServerState;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of applying a reloaded server list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Settings were applied; names of the servers whose settings changed
    Applied { updated: Vec<String> },
    /// The server list changed shape; nothing was applied
    Refused(String),
}

/// Every managed server, in configuration order
#[derive(Debug)]
pub struct Fleet {
    servers: Vec<Arc<ManagedServer>>,
}

impl Fleet {
    pub fn new(configs: &[ServerConfig]) -> Self {
        Self {
            servers: configs
                .iter()
                .map(|config| Arc::new(ManagedServer::new(config)))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ManagedServer>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ManagedServer>> {
        self.servers.iter().find(|server| server.name() == name)
    }

    /// The server whose current instance has `ip`
    pub fn by_ip(&self, ip: &str) -> Option<&Arc<ManagedServer>> {
        self.servers
            .iter()
            .find(|server| server.ip().as_deref() == Some(ip))
    }

    /// The only server, if there is exactly one and it has no known address yet
    pub fn sole_unaddressed(&self) -> Option<&Arc<ManagedServer>> {
        match self.servers.as_slice() {
            [server] if server.ip().is_none() => Some(server),
            _ => None,
        }
    }

    /// Publish initial routes. Unavailable servers are registered, then marked.
    pub fn initialize(&self, listener: &dyn Listener, game_port: u16) {
        for server in &self.servers {
            server.set_state(ServerState::Initializing, listener, game_port);
            if !server.is_available() {
                server.set_state(ServerState::Unavailable, listener, game_port);
            }
        }
    }

    /// Apply reloaded server settings in place.
    ///
    /// Refuses when servers were added, removed, reordered or renamed.
    pub fn reload(
        &self,
        configs: &[ServerConfig],
        listener: &dyn Listener,
        game_port: u16,
    ) -> ReloadOutcome {
        if configs.len() != self.servers.len() {
            return ReloadOutcome::Refused(format!(
                "server count changed from {} to {}",
                self.servers.len(),
                configs.len()
            ));
        }
        for (server, config) in self.servers.iter().zip(configs) {
            if server.name() != config.name {
                return ReloadOutcome::Refused(format!(
                    "server '{}' was renamed or moved to '{}'",
                    server.name(),
                    config.name
                ));
            }
        }

        let mut updated = Vec::new();
        for (server, config) in self.servers.iter().zip(configs) {
            let settings = ServerSettings::from(config);
            if settings == server.settings() {
                continue;
            }

            let previous = server.update_settings(settings.clone());
            let kept: HashSet<&String> = settings.hostnames.iter().collect();
            let dropped: Vec<String> = previous
                .hostnames
                .iter()
                .filter(|hostname| !kept.contains(hostname))
                .cloned()
                .collect();
            if !dropped.is_empty() {
                listener.forget(&dropped);
            }

            if previous.available && !settings.available {
                warn!(server = %server.name(), "Server disabled by configuration");
                server.set_state(ServerState::Unavailable, listener, game_port);
            } else {
                if !previous.available && settings.available {
                    info!(server = %server.name(), "Server enabled by configuration");
                }
                server.refresh(listener, game_port);
            }

            updated.push(server.name().to_string());
        }

        ReloadOutcome::Applied { updated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Mode, RouteTable};

    fn configs() -> Vec<ServerConfig> {
        vec![
            ServerConfig::new("alpha", &["alpha.example.com"]),
            ServerConfig::new("beta", &["beta.example.com"]),
        ]
    }

    #[test]
    fn test_lookups() {
        let fleet = Fleet::new(&configs());
        assert_eq!(fleet.len(), 2);
        assert!(fleet.get("beta").is_some());
        assert!(fleet.get("gamma").is_none());

        fleet.get("beta").unwrap().record_instance(5, Some("10.0.0.5".to_string()));
        assert_eq!(fleet.by_ip("10.0.0.5").unwrap().name(), "beta");
        assert!(fleet.by_ip("10.0.0.6").is_none());
        assert!(fleet.sole_unaddressed().is_none());

        let single = Fleet::new(&configs()[..1]);
        assert_eq!(single.sole_unaddressed().unwrap().name(), "alpha");
    }

    #[test]
    fn test_initialize_registers_all_hostnames() {
        let mut configs = configs();
        configs[1].available = false;
        let fleet = Fleet::new(&configs);
        let routes = RouteTable::default();

        fleet.initialize(&routes, 25565);

        assert_eq!(fleet.get("alpha").unwrap().state(), ServerState::Initializing);
        assert_eq!(fleet.get("beta").unwrap().state(), ServerState::Unavailable);
        let beta = routes.lookup("beta.example.com").unwrap();
        assert_eq!(beta.server.as_deref(), Some("beta"));
        assert!(beta.status.text.contains("Unavailable"));
    }

    #[test]
    fn test_reload_refuses_structural_changes() {
        let fleet = Fleet::new(&configs());
        let routes = RouteTable::default();

        let outcome = fleet.reload(&configs()[..1], &routes, 25565);
        assert!(matches!(outcome, ReloadOutcome::Refused(_)));

        let mut renamed = configs();
        renamed[1].name = "gamma".to_string();
        assert!(matches!(
            fleet.reload(&renamed, &routes, 25565),
            ReloadOutcome::Refused(_)
        ));
        assert!(fleet.get("beta").is_some());
    }

    #[test]
    fn test_reload_updates_settings_and_routes() {
        let fleet = Fleet::new(&configs());
        let routes = RouteTable::default();
        fleet.initialize(&routes, 25565);

        let mut next = configs();
        next[0].hostnames = vec!["new.example.com".to_string()];
        next[0].max_players = 4;
        next[1].available = false;

        let outcome = fleet.reload(&next, &routes, 25565);
        assert_eq!(
            outcome,
            ReloadOutcome::Applied {
                updated: vec!["alpha".to_string(), "beta".to_string()]
            }
        );

        assert!(routes.lookup("alpha.example.com").is_none());
        let entry = routes.lookup("new.example.com").unwrap();
        assert_eq!(entry.mode, Mode::Handler);
        assert_eq!(entry.status.max_players, 4);
        assert_eq!(fleet.get("beta").unwrap().state(), ServerState::Unavailable);

        let unchanged = fleet.reload(&next, &routes, 25565);
        assert_eq!(unchanged, ReloadOutcome::Applied { updated: vec![] });
    }
}
