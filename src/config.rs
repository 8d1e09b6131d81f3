use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::sys;

pub const AGENT_TEMP_DIR: &str = "rmm";
pub const TASK_PREFIX: &str = "RMMAgent_";
pub const UPDATE_ARTIFACT_PREFIX: &str = "rmmagent-v";

pub const SERVICE_NAME_AGENT: &str = "rmmagent";
pub const SERVICE_NAME_RPC: &str = "rmmrpc";
pub const SERVICE_NAME_MESHAGENT: &str = "mesh agent";
pub const MESH_AGENT_NAME: &str = "meshagent";
pub const MESH_AGENT_FOLDER: &str = "Mesh Agent";

pub const NATS_RMM_IDENTIFIER: &str = "RMMAGENT";
pub const NATS_DEFAULT_PORT: u16 = 4222;

#[cfg(windows)]
pub const AGENT_FILENAME: &str = "rmmagent.exe";
#[cfg(not(windows))]
pub const AGENT_FILENAME: &str = "rmmagent";

/// Installation directory for the agent binary and its support files.
pub fn program_dir() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(env::var("ProgramFiles").unwrap_or_else(|_| "C:\\Program Files".into()))
            .join("RMMAgent")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(env::var("RMMAGENT_DIR").unwrap_or_else(|_| "/opt/rmmagent".into()))
    }
}

/// Scratch directory for script bodies and downloaded artifacts.
pub fn agent_temp_dir() -> PathBuf {
    env::temp_dir().join(AGENT_TEMP_DIR)
}

pub fn create_agent_temp_dir() -> std::io::Result<()> {
    let dir = agent_temp_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}

/// Agent identity provisioned by the installer and read by every other mode.
/// Immutable for the life of the process; the installer writes a fresh copy
/// and the running services pick it up on their next restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub base_url: String,
    pub messaging_url: String,
    pub agent_id: String,
    pub token: String,
    pub pk: i32,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub py_enabled: bool,
}

impl AgentIdentity {
    /// Load the provisioned identity. Missing identity is fatal at start-up
    /// for every mode except install.
    pub async fn load() -> Result<Self> {
        let identity = sys::identity_load()
            .await
            .context("agent is not installed (identity not provisioned)")?;
        if identity.base_url.is_empty() || identity.agent_id.is_empty() {
            anyhow::bail!("agent identity is incomplete, reinstall the agent");
        }
        Ok(identity)
    }

    pub async fn save(&self) -> Result<()> {
        sys::identity_save(self).await
    }

    pub async fn delete() -> Result<()> {
        sys::identity_delete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_wire_fields_round_trip_json() {
        let id = AgentIdentity {
            base_url: "https://api.example.com".into(),
            messaging_url: "api.example.com".into(),
            agent_id: "A1".into(),
            token: "tok".into(),
            pk: 42,
            cert: Some("/tmp/ca.pem".into()),
            py_enabled: true,
        };
        let raw = serde_json::to_string(&id).unwrap();
        let back: AgentIdentity = serde_json::from_str(&raw).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn cert_defaults_to_none() {
        let raw = r#"{"base_url":"https://x","messaging_url":"x","agent_id":"a","token":"t","pk":1}"#;
        let id: AgentIdentity = serde_json::from_str(raw).unwrap();
        assert_eq!(id.cert, None);
        assert!(!id.py_enabled);
    }
}
