use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use crate::registry::IdentitySource;

/// Two-party call signaling relay.
#[derive(Debug, Clone, Parser)]
#[command(name = "call-relay-server", version, about)]
pub struct Config {
    /// Address the websocket endpoint listens on
    #[arg(env = "CALL_RELAY_ADDRESS", default_value = "127.0.0.1:9000")]
    pub address: SocketAddr,

    /// Seconds a call may ring before the caller gets a missed-call notice
    #[arg(long, env = "CALL_RELAY_RING_TIMEOUT", default_value_t = 10)]
    pub ring_timeout_secs: u64,

    /// Identities handed out to connecting users, in order
    #[arg(
        long,
        env = "CALL_RELAY_USERS",
        value_delimiter = ',',
        default_values_t = [String::from("alice"), String::from("bob")],
        conflicts_with = "sequential_ids"
    )]
    pub users: Vec<String>,

    /// Hand out unbounded `user-N` identities instead of a fixed pool
    #[arg(long, env = "CALL_RELAY_SEQUENTIAL_IDS")]
    pub sequential_ids: bool,

    #[arg(long, env = "CALL_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Config {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn identity_source(&self) -> IdentitySource {
        if self.sequential_ids {
            IdentitySource::Sequential
        } else {
            IdentitySource::Pool(self.users.clone())
        }
    }
}
