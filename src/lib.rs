//! Dropgate - on-demand game servers on ephemeral cloud instances
//!
//! This library provides the control plane that:
//! - Presents each game server under a stable hostname
//! - Restores an instance from its latest snapshot when a player connects
//! - Forwards players to the running instance and counts their sessions
//! - Shuts idle servers down, snapshots them and destroys the instance
//! - Reconciles local state with the cloud provider and a health probe
//! - Talks to the agent on each instance over an encrypted control channel

pub mod admission;
pub mod codec;
pub mod config;
pub mod context;
pub mod control;
pub mod crypto;
pub mod error;
pub mod fleet;
pub mod forwarder;
pub mod gateway;
pub mod lifecycle;
pub mod monitor;
pub mod phase;
pub mod probe;
pub mod provider;
pub mod server;
pub mod state;
pub mod tracker;
