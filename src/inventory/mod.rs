// Inventory module for host management

mod groups;
mod static_inv;

pub use groups::*;
pub use static_inv::*;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use zeroize::Zeroize;

use crate::output::errors::FanoutError;

/// A password or passphrase. Never printed, wiped on drop.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(********)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// How to reach a host over SSH
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Path to a private key file, or an inline PEM key
    #[serde(default)]
    pub private_key: Option<String>,
}

/// Escalation credentials
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authentication {
    #[serde(default)]
    pub sudo_user: Option<String>,
    #[serde(default)]
    pub sudo_password: Option<Secret>,
    #[serde(default)]
    pub su_user: Option<String>,
    #[serde(default)]
    pub su_password: Option<Secret>,
}

/// Transport options. Known keys are typed; anything else is kept in
/// `extra` and ignored by the SSH layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOptions {
    /// Connect timeout in seconds
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    /// Per-command timeout in seconds
    #[serde(default)]
    pub command_timeout: Option<u64>,
    #[serde(default)]
    pub compress: bool,
    /// Keepalive interval in seconds
    #[serde(default)]
    pub keepalive_interval: Option<u32>,
    /// `local` forces the local transport
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SessionOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_secs)
    }
}

/// A single host in the inventory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Host {
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub session: SessionOptions,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Host {
            connection: ConnectionInfo {
                host: address.into(),
                ..ConnectionInfo::default()
            },
            ..Host::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.connection.username = username.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.connection.password = Some(Secret::new(password));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.connection.port = Some(port);
        self
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.connection.private_key = Some(key.into());
        self
    }

    pub fn with_sudo(mut self, user: Option<&str>, password: Option<&str>) -> Self {
        self.authentication.sudo_user = user.map(str::to_string);
        self.authentication.sudo_password = password.map(Secret::new);
        self
    }

    pub fn with_su(mut self, user: Option<&str>, password: Option<&str>) -> Self {
        self.authentication.su_user = user.map(str::to_string);
        self.authentication.su_password = password.map(Secret::new);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    /// Host address; also the host's identity in every Response
    pub fn address(&self) -> &str {
        &self.connection.host
    }

    pub fn port(&self) -> u16 {
        self.connection.port.unwrap_or(22)
    }

    /// Login user, falling back to the local user
    pub fn username(&self) -> String {
        if self.connection.username.is_empty() {
            std::env::var("USER").unwrap_or_else(|_| "root".to_string())
        } else {
            self.connection.username.clone()
        }
    }

    /// Get the SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        if self.connection.username.is_empty() {
            format!("{}:{}", self.address(), self.port())
        } else {
            format!(
                "{}@{}:{}",
                self.connection.username,
                self.address(),
                self.port()
            )
        }
    }

    /// Check if this host should use local connection
    pub fn is_local(&self) -> bool {
        if let Some(conn) = &self.session.connection {
            return conn == "local";
        }

        matches!(self.address(), "localhost" | "127.0.0.1" | "::1")
    }

    /// Every configured password, for output redaction
    pub fn secrets(&self) -> Vec<&str> {
        [
            self.connection.password.as_ref(),
            self.authentication.sudo_password.as_ref(),
            self.authentication.su_password.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(Secret::expose)
        .filter(|s| !s.is_empty())
        .collect()
    }
}

/// The complete inventory: an ordered set of hosts, unique by address
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Host>,
}

impl Inventory {
    pub fn new() -> Self {
        Inventory::default()
    }

    /// Build an inventory, rejecting empty and duplicate addresses
    pub fn from_hosts(hosts: impl IntoIterator<Item = Host>) -> Result<Self, FanoutError> {
        let mut inv = Inventory::new();
        for host in hosts {
            inv.add_host(host)?;
        }
        Ok(inv)
    }

    /// Load inventory from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self, FanoutError> {
        parse_inventory_file(path)
    }

    /// Load inventory from a YAML string
    pub fn parse_str(content: &str) -> Result<Self, FanoutError> {
        parse_inventory(content)
    }

    /// Add a host to the inventory
    pub fn add_host(&mut self, host: Host) -> Result<(), FanoutError> {
        if host.address().trim().is_empty() {
            return Err(FanoutError::Inventory {
                message: "host with an empty address".to_string(),
                suggestion: Some("Set connection.host for every inventory record".to_string()),
            });
        }

        if self.get_host(host.address()).is_some() {
            return Err(FanoutError::Inventory {
                message: format!("duplicate host address {}", host.address()),
                suggestion: Some("Each host address may appear once".to_string()),
            });
        }

        self.hosts.push(host);
        Ok(())
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Get a single host by address
    pub fn get_host(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.address() == address)
    }

    /// Get hosts belonging to a group
    pub fn get_hosts(&self, group: &str) -> Vec<&Host> {
        self.hosts
            .iter()
            .filter(|h| host_matches_group(h, group))
            .collect()
    }

    /// Get the total number of hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Explicit group names, plus `all`
    pub fn group_names(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self
            .hosts
            .iter()
            .flat_map(|h| h.groups.iter().map(String::as_str))
            .collect();
        names.insert("all");
        names
    }
}

impl std::str::FromStr for Inventory {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_inventory(s)
    }
}
