//! Non-Windows capability leaf. The deployment target is Windows; here the
//! shell and interpreter seams are real so the control plane stays fully
//! exercisable, and the Windows-only surfaces report unsupported instead of
//! pretending.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::cmd;
use crate::config::{self, AgentIdentity};
use crate::probes::{EventLogEntry, Software, WindowsService};
use crate::tasks::ScheduledTask;
use crate::wua::{UpdateInstallOutcome, WinUpdate};

fn unsupported(what: &str) -> anyhow::Error {
    anyhow::anyhow!("{what} is not supported on this platform")
}

pub fn shell_invocation(_shell: &str, command: &str) -> (String, Vec<String>) {
    // Every shell value routes through sh here.
    (
        "sh".to_string(),
        vec!["-c".to_string(), command.to_string()],
    )
}

pub fn script_extension(shell: &str) -> &'static str {
    match shell {
        "powershell" => ".ps1",
        "python" => ".py",
        _ => ".sh",
    }
}

pub fn script_invocation(
    shell: &str,
    script_path: &Path,
    python_bin: &Path,
) -> Option<(String, Vec<String>)> {
    let path = script_path.to_string_lossy().to_string();
    match shell {
        "powershell" => Some((
            "pwsh".to_string(),
            vec![
                "-NonInteractive".to_string(),
                "-NoProfile".to_string(),
                "-File".to_string(),
                path,
            ],
        )),
        "python" => Some((python_bin.to_string_lossy().to_string(), vec![path])),
        "cmd" => Some(("sh".to_string(), vec![path])),
        _ => None,
    }
}

pub fn ping_args(ip: &str) -> Vec<String> {
    vec!["-c".to_string(), "4".to_string(), ip.to_string()]
}

// ---------------------------------------------------------------------------
// Identity (key-value file under the program dir)

fn identity_path() -> std::path::PathBuf {
    config::program_dir().join("identity.json")
}

pub async fn identity_load() -> Result<AgentIdentity> {
    let path = identity_path();
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).context("malformed identity store")
}

pub async fn identity_save(id: &AgentIdentity) -> Result<()> {
    let path = identity_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, serde_json::to_vec_pretty(id)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub async fn identity_delete() -> Result<()> {
    match std::fs::remove_file(identity_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Windows-only surfaces

pub async fn list_services() -> Result<Vec<WindowsService>> {
    Err(unsupported("service enumeration"))
}

pub async fn service_detail(name: &str) -> Result<WindowsService> {
    Err(unsupported(&format!("service detail for {name}")))
}

pub async fn service_status(_name: &str) -> Result<String> {
    Err(unsupported("service status"))
}

pub async fn control_service(_name: &str, _action: &str, _timeout_secs: u64) -> Result<String> {
    Err(unsupported("service control"))
}

pub async fn edit_service(_name: &str, _start_type: &str) -> Result<String> {
    Err(unsupported("service edit"))
}

pub async fn installed_software() -> Result<Vec<Software>> {
    Err(unsupported("software inventory"))
}

pub async fn event_log(_log_name: &str, _days: i64) -> Result<Vec<EventLogEntry>> {
    Err(unsupported("event log"))
}

pub async fn reboot_required() -> Result<bool> {
    // Best-effort partial result; nothing to consult here.
    Ok(false)
}

pub async fn logged_on_user() -> Result<String> {
    Ok(std::env::var("USER").unwrap_or_else(|_| "None".to_string()))
}

pub async fn cpu_load_fast_path() -> Option<i32> {
    None
}

pub async fn create_task(_st: &ScheduledTask, _exe: &Path, _program_dir: &Path) -> Result<()> {
    Err(unsupported("scheduled tasks"))
}

pub async fn enable_task(_name: &str, _enabled: bool) -> Result<()> {
    Err(unsupported("scheduled tasks"))
}

pub async fn delete_task(_name: &str) -> Result<()> {
    Err(unsupported("scheduled tasks"))
}

pub async fn list_tasks() -> Result<Vec<String>> {
    Err(unsupported("scheduled tasks"))
}

pub async fn cleanup_tasks(_prefix: &str) -> Result<()> {
    Ok(())
}

pub async fn wua_enumerate() -> Result<Vec<WinUpdate>> {
    Err(unsupported("update catalog"))
}

pub async fn wua_install(_guid: &str) -> Result<UpdateInstallOutcome> {
    Err(unsupported("update catalog"))
}

pub async fn reboot_now() -> Result<()> {
    let out = cmd::run("shutdown", &["-r", "now"], 15).await;
    if out.exit_code != 0 {
        bail!("shutdown exited {}", out.exit_code);
    }
    Ok(())
}

pub async fn flush_dns() {}

pub async fn enable_ping() -> Result<()> {
    Err(unsupported("firewall configuration"))
}

pub async fn enable_rdp() -> Result<()> {
    Err(unsupported("remote desktop"))
}

pub async fn disable_sleep_hibernate() -> Result<()> {
    Err(unsupported("power configuration"))
}

pub async fn add_defender_exclusions(_program_dir: &Path) -> Result<()> {
    Err(unsupported("antivirus exclusions"))
}

pub async fn expand_archive(_zip: &Path, _dest: &Path) -> Result<()> {
    Err(unsupported("archive expansion"))
}

pub async fn install_agent_services(_exe: &Path, _program_dir: &Path) -> Result<()> {
    Err(unsupported("service installation"))
}

pub async fn remove_service(_name: &str, _program_dir: &Path) -> Result<()> {
    Err(unsupported("service removal"))
}

pub fn run_uninstaller() -> Result<()> {
    Err(unsupported("uninstaller"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // RMMAGENT_DIR is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[tokio::test]
    async fn identity_store_round_trips_every_field() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("RMMAGENT_DIR", dir.path());

        let id = AgentIdentity {
            base_url: "https://api.example.com".into(),
            messaging_url: "api.example.com".into(),
            agent_id: "A1".into(),
            token: "secret".into(),
            pk: 99,
            cert: Some("/etc/ca.pem".into()),
            py_enabled: true,
        };
        identity_save(&id).await.unwrap();
        let back = identity_load().await.unwrap();
        assert_eq!(id, back);

        identity_delete().await.unwrap();
        assert!(identity_load().await.is_err());
        // Deleting an absent store stays quiet.
        identity_delete().await.unwrap();
        std::env::remove_var("RMMAGENT_DIR");
    }

    #[test]
    fn all_shells_route_through_sh() {
        let (exe, args) = shell_invocation("cmd", "echo hi");
        assert_eq!(exe, "sh");
        assert_eq!(args, vec!["-c", "echo hi"]);
        let (exe, _) = shell_invocation("powershell", "echo hi");
        assert_eq!(exe, "sh");
    }
}
