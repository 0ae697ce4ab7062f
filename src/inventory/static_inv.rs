// Static YAML/JSON inventory parser

use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use super::{Authentication, Host, Inventory, Secret};
use crate::output::errors::FanoutError;

/// Values applied to every host that leaves them unset
#[derive(Debug, Default, Deserialize)]
struct Defaults {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    authentication: Authentication,
    #[serde(default)]
    groups: Vec<String>,
}

/// Parse inventory from a YAML file
pub fn parse_inventory_file(path: &Path) -> Result<Inventory, FanoutError> {
    let content = std::fs::read_to_string(path).map_err(|e| FanoutError::Io {
        message: format!("Failed to read inventory file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_inventory(&content)
}

/// Parse inventory from a YAML string.
///
/// Accepts either a top-level list of host records or a mapping with a
/// `hosts` list and optional `defaults`.
pub fn parse_inventory(content: &str) -> Result<Inventory, FanoutError> {
    let yaml: YamlValue = serde_yaml::from_str(content).map_err(|e| FanoutError::Inventory {
        message: format!("Invalid inventory YAML: {}", e),
        suggestion: Some("Check inventory file syntax".to_string()),
    })?;

    let (records, defaults) = match yaml {
        YamlValue::Sequence(records) => (records, Defaults::default()),
        YamlValue::Mapping(mut map) => {
            let records = match map.remove("hosts") {
                Some(YamlValue::Sequence(records)) => records,
                Some(_) => {
                    return Err(FanoutError::Inventory {
                        message: "'hosts' must be a list of host records".to_string(),
                        suggestion: Some("Write each host as '- connection: {host: ...}'".to_string()),
                    })
                }
                None => Vec::new(),
            };
            let defaults = match map.remove("defaults") {
                Some(value) => {
                    serde_yaml::from_value(value).map_err(|e| FanoutError::Inventory {
                        message: format!("Invalid 'defaults' section: {}", e),
                        suggestion: None,
                    })?
                }
                None => Defaults::default(),
            };
            (records, defaults)
        }
        YamlValue::Null => (Vec::new(), Defaults::default()),
        _ => {
            return Err(FanoutError::Inventory {
                message: "Inventory must be a list of hosts or a mapping".to_string(),
                suggestion: Some("Start with 'hosts:'".to_string()),
            });
        }
    };

    let mut inventory = Inventory::new();

    for (i, record) in records.into_iter().enumerate() {
        let mut host: Host = serde_yaml::from_value(record).map_err(|e| FanoutError::Inventory {
            message: format!("Invalid host record #{}: {}", i + 1, e),
            suggestion: Some("Each record needs at least 'connection: {host: <address>}'".to_string()),
        })?;
        apply_defaults(&mut host, &defaults);
        inventory.add_host(host)?;
    }

    Ok(inventory)
}

fn apply_defaults(host: &mut Host, defaults: &Defaults) {
    if host.connection.username.is_empty() {
        if let Some(user) = &defaults.username {
            host.connection.username = user.clone();
        }
    }
    if host.connection.port.is_none() {
        host.connection.port = defaults.port;
    }
    if host.connection.private_key.is_none() {
        host.connection.private_key = defaults.private_key.clone();
    }

    let auth = &mut host.authentication;
    fill(&mut auth.sudo_user, &defaults.authentication.sudo_user);
    fill_secret(&mut auth.sudo_password, &defaults.authentication.sudo_password);
    fill(&mut auth.su_user, &defaults.authentication.su_user);
    fill_secret(&mut auth.su_password, &defaults.authentication.su_password);

    for group in &defaults.groups {
        if !host.groups.contains(group) {
            host.groups.push(group.clone());
        }
    }
}

fn fill(slot: &mut Option<String>, default: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(default);
    }
}

fn fill_secret(slot: &mut Option<Secret>, default: &Option<Secret>) {
    if slot.is_none() {
        slot.clone_from(default);
    }
}
