use log::{debug, error, info, warn};
use serde::Deserialize;
use std::time::Duration;
use sysinfo::System;

use crate::agent::Agent;
use crate::cmd;
use crate::config::{
    MESH_AGENT_NAME, SERVICE_NAME_AGENT, SERVICE_NAME_MESHAGENT, SERVICE_NAME_RPC,
};
use crate::sys;

#[derive(Debug, Default, Deserialize)]
pub struct RecoveryAction {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub shell_cmd: String,
}

/// Periodic recovery probe; the server decides what, if anything, to heal.
pub async fn check_for_recovery(agent: &Agent) {
    let url = format!("/api/v3/{}/recovery/", agent.identity.agent_id);
    let action: RecoveryAction = match agent.get_json(&url).await {
        Ok(a) => a,
        Err(e) => {
            debug!("recovery: {e}");
            return;
        }
    };
    dispatch(agent, &action.mode, &action.shell_cmd).await;
}

pub async fn dispatch(agent: &Agent, mode: &str, command: &str) {
    match mode {
        "mesh" => recover_mesh(agent).await,
        "rpc" => recover_rpc().await,
        "tacagent" | "agent" => recover_agent(agent).await,
        "command" => recover_command(command),
        "salt" => warn!("salt recovery is legacy and no longer shipped"),
        "" => {}
        other => debug!("unknown recovery mode: {other}"),
    }
}

pub async fn recover_agent(agent: &Agent) {
    debug!("attempting agent service recovery on {}", agent.hostname);
    if let Err(e) = sys::control_service(SERVICE_NAME_AGENT, "stop", 120).await {
        debug!("{e}");
    }
    sys::flush_dns().await;
    if let Err(e) = sys::control_service(SERVICE_NAME_AGENT, "start", 60).await {
        error!("{e}");
    }
    debug!("agent service recovery completed on {}", agent.hostname);
}

pub async fn recover_rpc() {
    info!("attempting RPC service recovery");
    if let Err(e) = sys::control_service(SERVICE_NAME_RPC, "stop", 90).await {
        debug!("{e}");
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Err(e) = sys::control_service(SERVICE_NAME_RPC, "start", 90).await {
        error!("{e}");
    }
}

/// Stop the sidecar service, kill anything of its lineage still holding on,
/// start it again, then re-sync the node id so the server can re-map this
/// host.
pub async fn recover_mesh(agent: &Agent) {
    info!("attempting mesh agent service recovery");
    if let Err(e) = sys::control_service(SERVICE_NAME_MESHAGENT, "stop", 60).await {
        debug!("{e}");
    }
    force_kill_by_name(MESH_AGENT_NAME);
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Err(e) = sys::control_service(SERVICE_NAME_MESHAGENT, "start", 60).await {
        error!("{e}");
    }
    agent.sync_mesh_node_id().await;
}

/// Kill every process whose name contains `fragment`.
pub fn force_kill_by_name(fragment: &str) {
    let mut sys = System::new();
    sys.refresh_processes();
    for (pid, p) in sys.processes() {
        if p.name().to_lowercase().contains(fragment) {
            debug!("killing {} with pid {pid}", p.name());
            if !p.kill() {
                debug!("could not kill pid {pid}");
            }
        }
    }
}

/// Arbitrary recovery command. The command processor becomes the parent so
/// the command may stop or kill this agent without taking itself down.
pub fn recover_command(command: &str) {
    info!("attempting shell recovery with command: {command}");
    if let Err(e) = cmd::run_shell_detached("cmd", command) {
        error!("recovery command: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_action_decodes_with_defaults() {
        let a: RecoveryAction = serde_json::from_str(r#"{"mode":"mesh"}"#).unwrap();
        assert_eq!(a.mode, "mesh");
        assert!(a.shell_cmd.is_empty());

        let a: RecoveryAction =
            serde_json::from_str(r#"{"mode":"command","shell_cmd":"net start foo"}"#).unwrap();
        assert_eq!(a.shell_cmd, "net start foo");
    }

    #[test]
    fn killing_an_unmatched_name_touches_nothing() {
        force_kill_by_name("rmmagent-test-no-such-process");
    }
}
