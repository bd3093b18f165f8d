use crate::codec::normalize_hostname;
use crate::crypto::ControlCipher;
use crate::provider::digitalocean::DEFAULT_API_URL;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Cloud provider API token
    #[serde(default)]
    pub api_token: String,

    /// Cloud provider API endpoint (default: DigitalOcean v2)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Port the control channel listens on, and that agents listen on
    #[serde(
        default = "default_control_port",
        alias = "communications_port",
        deserialize_with = "deserialize_port"
    )]
    pub control_port: u16,

    /// Shared control-channel key, 64 hex characters
    #[serde(default)]
    pub encryption_key: String,

    /// Bind address for the gateway and control listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the game server listens on inside each instance
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Port the gateway accepts game clients on
    #[serde(default = "default_game_port")]
    pub listen_port: u16,

    /// Instance ids that must never be destroyed, in addition to the primary
    #[serde(default)]
    pub protected_instances: Vec<u64>,

    /// Use the in-memory provider instead of the real API
    #[serde(default)]
    pub dry_run: bool,

    /// Loop intervals, retry backoff and deadlines
    #[serde(default)]
    pub timings: TimingsConfig,

    /// Managed servers, in order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Instance size and placement
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DropletConfig {
    /// Size slug (e.g. "1gb")
    #[serde(default)]
    pub memory: String,

    /// Region slug (e.g. "sgp1")
    #[serde(default)]
    pub region: String,

    /// Fingerprint of the SSH key authorized on created instances
    #[serde(default)]
    pub ssh_fingerprint: String,
}

/// Text used in connect-refusal messages and the server list
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MessagesConfig {
    /// Header shown above every connect message
    #[serde(default = "default_message_prefix")]
    pub message_prefix: String,

    /// Who players are told to contact
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Prefix of the server-list status line
    #[serde(default = "default_server_info_prefix")]
    pub server_info_prefix: String,

    /// How long a cold start takes, as shown to the player who triggered it
    #[serde(default = "default_boot_time")]
    pub boot_time: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            message_prefix: default_message_prefix(),
            owner: default_owner(),
            server_info_prefix: default_server_info_prefix(),
            boot_time: default_boot_time(),
        }
    }
}

/// Configuration for a single managed server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Unique name; instances are named `<name>-automated`
    pub name: String,

    /// Operator switch; unavailable servers are left alone by the monitor
    #[serde(default = "default_true")]
    pub available: bool,

    /// Hostnames routed to this server
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Max players advertised in the server list
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Minutes without players before an automatic shutdown
    #[serde(default = "default_auto_shutdown_minutes")]
    pub auto_shutdown_minutes: u64,

    #[serde(default)]
    pub droplet: DropletConfig,

    #[serde(default)]
    pub messages: MessagesConfig,

    /// Players allowed to start the server (empty: anyone)
    #[serde(default, rename = "start_whitelist")]
    pub whitelist: Vec<String>,
}

impl ServerConfig {
    /// Create a server config with defaults
    pub fn new(name: &str, hostnames: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            max_players: default_max_players(),
            auto_shutdown_minutes: default_auto_shutdown_minutes(),
            droplet: DropletConfig::default(),
            messages: MessagesConfig::default(),
            whitelist: Vec::new(),
        }
    }

    /// Set the start whitelist (builder pattern)
    pub fn with_whitelist(mut self, names: &[&str]) -> Self {
        self.whitelist = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Set the idle threshold (builder pattern)
    pub fn with_auto_shutdown_minutes(mut self, minutes: u64) -> Self {
        self.auto_shutdown_minutes = minutes;
        self
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.auto_shutdown_minutes.saturating_mul(60))
    }

    /// Validate the server configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Server with empty name".to_string());
        }
        if self.name.contains(char::is_whitespace) {
            return Err(format!("Server '{}': name must not contain whitespace", self.name));
        }
        if self.hostnames.is_empty() {
            return Err(format!("Server '{}': at least one hostname is required", self.name));
        }
        Ok(())
    }
}

/// Timing knobs, all in seconds
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TimingsConfig {
    /// Base reconciliation interval
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Reconciliation interval while any instance is mid-action
    #[serde(default = "default_transient_interval")]
    pub transient_interval_secs: u64,

    /// Delay before the next poll after a failed instance listing
    #[serde(default = "default_list_retry")]
    pub list_retry_secs: u64,

    /// Idle-shutdown scan interval
    #[serde(default = "default_tracker_interval")]
    pub tracker_interval_secs: u64,

    /// Wait between attempts of a failed provider call
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Minimum gap between two lifecycle operations on one server
    #[serde(default = "default_operation_spacing")]
    pub operation_spacing_secs: u64,

    /// How long a locally issued action overrides the provider's report
    #[serde(default = "default_immunity")]
    pub immunity_secs: u64,

    /// How long to wait for the agent to confirm the game server stopped
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Deadline for control-channel and probe sockets
    #[serde(default = "default_socket_deadline")]
    pub socket_deadline_secs: u64,

    /// Wait before retrying a restore that found an existing instance
    #[serde(default = "default_restore_wait")]
    pub restore_wait_secs: u64,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            transient_interval_secs: default_transient_interval(),
            list_retry_secs: default_list_retry(),
            tracker_interval_secs: default_tracker_interval(),
            retry_backoff_secs: default_retry_backoff(),
            operation_spacing_secs: default_operation_spacing(),
            immunity_secs: default_immunity(),
            stop_timeout_secs: default_stop_timeout(),
            socket_deadline_secs: default_socket_deadline(),
            restore_wait_secs: default_restore_wait(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_control_port() -> u16 {
    9010
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_game_port() -> u16 {
    25565
}

fn default_true() -> bool {
    true
}

fn default_max_players() -> u32 {
    30
}

fn default_auto_shutdown_minutes() -> u64 {
    15
}

fn default_message_prefix() -> String {
    "-- [ dropgate ] --".to_string()
}

fn default_owner() -> String {
    "the server owner".to_string()
}

fn default_server_info_prefix() -> String {
    "[dropgate] ".to_string()
}

fn default_boot_time() -> String {
    "5 minutes".to_string()
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_transient_interval() -> u64 {
    10
}

fn default_list_retry() -> u64 {
    10
}

fn default_tracker_interval() -> u64 {
    60
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_operation_spacing() -> u64 {
    10
}

fn default_immunity() -> u64 {
    10
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_socket_deadline() -> u64 {
    5
}

fn default_restore_wait() -> u64 {
    10
}

/// Ports may be written as numbers or as strings
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", text))),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content, is_toml(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn parse(content: &str, toml_format: bool) -> anyhow::Result<Self> {
        let config = if toml_format {
            toml::from_str(content)?
        } else {
            serde_json::from_str(content)?
        };
        Ok(config)
    }

    /// The control-channel cipher described by `encryption_key`
    pub fn cipher(&self) -> anyhow::Result<ControlCipher> {
        Ok(ControlCipher::from_hex(&self.encryption_key)?)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.cipher() {
            errors.push(format!("encryption_key: {}", e));
        }

        if self.api_token.trim().is_empty() && !self.dry_run {
            errors.push("api_token is required unless dry_run is set".to_string());
        }

        if self.control_port == 0 {
            errors.push("control_port must not be 0".to_string());
        }

        if self.servers.is_empty() {
            errors.push("at least one server must be configured".to_string());
        }

        let mut names = HashSet::new();
        let mut hostnames = HashSet::new();
        for server in &self.servers {
            if let Err(e) = server.validate() {
                errors.push(e);
            }
            if !names.insert(server.name.as_str()) {
                errors.push(format!("Server '{}' is defined more than once", server.name));
            }
            for hostname in &server.hostnames {
                if !hostnames.insert(normalize_hostname(hostname)) {
                    errors.push(format!(
                        "Server '{}': hostname '{}' is already routed",
                        server.name, hostname
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Top-level settings that differ from `other` and only apply after a restart
    pub fn restart_required(&self, other: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.api_token != other.api_token || self.api_url != other.api_url {
            changed.push("api_token");
        }
        if self.encryption_key.trim() != other.encryption_key.trim() {
            changed.push("encryption_key");
        }
        if self.control_port != other.control_port {
            changed.push("control_port");
        }
        if self.bind != other.bind || self.listen_port != other.listen_port {
            changed.push("listen_port");
        }
        if self.game_port != other.game_port {
            changed.push("game_port");
        }
        if self.protected_instances != other.protected_instances || self.dry_run != other.dry_run {
            changed.push("protected_instances");
        }
        if self.timings != other.timings {
            changed.push("timings");
        }
        changed
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn json_config() -> String {
        format!(
            r#"{{
                "api_token": "do-token",
                "communications_port": "9010",
                "encryption_key": "{}",
                "servers": [
                    {{
                        "name": "survival",
                        "available": true,
                        "hostnames": ["play.example.com"],
                        "max_players": 20,
                        "auto_shutdown_minutes": 10,
                        "droplet": {{
                            "memory": "2gb",
                            "region": "sgp1",
                            "ssh_fingerprint": "2e:a9:01"
                        }},
                        "messages": {{
                            "message_prefix": "-- [ example ] --",
                            "owner": "Alex",
                            "server_info_prefix": "[example] ",
                            "boot_time": "3 minutes"
                        }},
                        "start_whitelist": ["Alex", "Sam"]
                    }}
                ]
            }}"#,
            KEY
        )
    }

    #[test]
    fn test_parse_json_config() {
        let config = Config::parse(&json_config(), false).unwrap();
        assert_eq!(config.api_token, "do-token");
        assert_eq!(config.control_port, 9010);
        assert_eq!(config.servers.len(), 1);

        let server = &config.servers[0];
        assert_eq!(server.name, "survival");
        assert_eq!(server.max_players, 20);
        assert_eq!(server.idle_threshold(), Duration::from_secs(600));
        assert_eq!(server.droplet.region, "sgp1");
        assert_eq!(server.messages.owner, "Alex");
        assert_eq!(server.whitelist, vec!["Alex", "Sam"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = format!(
            r#"
api_token = "do-token"
control_port = 9100
encryption_key = "{}"
protected_instances = [1, 2]

[timings]
monitor_interval_secs = 20

[[servers]]
name = "creative"
hostnames = ["creative.example.com"]
"#,
            KEY
        );

        let config = Config::parse(&toml, true).unwrap();
        assert_eq!(config.control_port, 9100);
        assert_eq!(config.protected_instances, vec![1, 2]);
        assert_eq!(config.timings.monitor_interval_secs, 20);
        assert_eq!(config.timings.transient_interval_secs, 10);
        assert!(config.servers[0].available);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(r#"{"servers": []}"#, false).unwrap();
        assert_eq!(config.control_port, 9010);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.game_port, 25565);
        assert_eq!(config.listen_port, 25565);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert!(!config.dry_run);

        let timings = TimingsConfig::default();
        assert_eq!(timings.monitor_interval_secs, 30);
        assert_eq!(timings.tracker_interval_secs, 60);
        assert_eq!(timings.retry_backoff_secs, 5);
        assert_eq!(timings.stop_timeout_secs, 30);
        assert_eq!(timings.socket_deadline_secs, 5);

        let server = ServerConfig::new("srv", &["srv.example.com"]);
        assert_eq!(server.max_players, 30);
        assert_eq!(server.auto_shutdown_minutes, 15);
        assert_eq!(server.messages, MessagesConfig::default());
    }

    #[test]
    fn test_invalid_port_string() {
        let result = Config::parse(r#"{"communications_port": "ninety"}"#, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_errors() {
        let json = r#"{
            "encryption_key": "abcd",
            "servers": [
                {"name": "a", "hostnames": ["Play.Example.com"]},
                {"name": "a", "hostnames": ["play.example.com."]},
                {"name": "", "hostnames": []}
            ]
        }"#;

        let err = Config::parse(json, false).unwrap().validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("encryption_key"));
        assert!(message.contains("api_token"));
        assert!(message.contains("defined more than once"));
        assert!(message.contains("already routed"));
        assert!(message.contains("empty name"));
    }

    #[test]
    fn test_dry_run_needs_no_token() {
        let json = format!(
            r#"{{"dry_run": true, "encryption_key": "{}",
                "servers": [{{"name": "a", "hostnames": ["a.example.com"]}}]}}"#,
            KEY
        );
        Config::parse(&json, false).unwrap().validate().unwrap();
    }

    #[test]
    fn test_load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("config.json");
        std::fs::write(&json_path, json_config()).unwrap();
        assert_eq!(Config::load(&json_path).unwrap().servers[0].name, "survival");

        let toml_path = dir.path().join("config.toml");
        std::fs::write(
            &toml_path,
            format!(
                "api_token = \"t\"\nencryption_key = \"{}\"\n[[servers]]\nname = \"x\"\nhostnames = [\"x.example.com\"]\n",
                KEY
            ),
        )
        .unwrap();
        assert_eq!(Config::load(&toml_path).unwrap().servers[0].name, "x");
    }

    #[test]
    fn test_idle_threshold_saturates() {
        let server = ServerConfig::new("a", &["a.example.com"]).with_auto_shutdown_minutes(u64::MAX);
        assert_eq!(server.idle_threshold(), Duration::from_secs(u64::MAX));
        let server = ServerConfig::new("a", &["a.example.com"]).with_auto_shutdown_minutes(2);
        assert_eq!(server.idle_threshold(), Duration::from_secs(120));
    }

    #[test]
    fn test_restart_required() {
        let config = Config::parse(&json_config(), false).unwrap();
        assert!(config.restart_required(&config.clone()).is_empty());

        let mut changed = config.clone();
        changed.control_port = 9999;
        changed.api_token = "other".to_string();
        changed.servers[0].max_players = 5;
        assert_eq!(config.restart_required(&changed), vec!["api_token", "control_port"]);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/dropgate.json").is_err());
    }
}
