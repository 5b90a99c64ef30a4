//! Process bootstrap configuration
//!
//! The peer set is static: every process loads the same JSON table and
//! resolves its own entry from it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::clock::ProcessId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("process {0} is not present in the config")]
    UnknownProcess(ProcessId),
}

/// One process's listening endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: ProcessId,
    pub address: String,
    pub port: u16,
}

/// The shared peer-table configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub num_processes: usize,
    pub messages_per_process: u32,
    pub messages_per_minute: u32,
    pub processes: Vec<ProcessEntry>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Split the table into this process's own endpoint and the
    /// `id -> "host:port"` map for everyone else.
    pub fn resolve(
        &self,
        id: ProcessId,
    ) -> Result<(ProcessEntry, HashMap<ProcessId, String>), ConfigError> {
        let own = self
            .processes
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or(ConfigError::UnknownProcess(id))?;
        let peers = self
            .processes
            .iter()
            .filter(|entry| entry.id != id)
            .map(|entry| (entry.id, format!("{}:{}", entry.address, entry.port)))
            .collect();
        Ok((own, peers))
    }
}
