//! Windows capability leaf. The OS surfaces the control plane needs (service
//! manager, task scheduler, event log, update catalog, registry) are reached
//! through the OS command processors via the process runner, which keeps the
//! deadline and process-tree containment semantics uniform with every other
//! child the agent spawns.

use anyhow::{bail, Result};
use log::debug;
use std::path::Path;

use super::scripts;
use crate::cmd;
use crate::config::{self, AgentIdentity, SERVICE_NAME_AGENT, SERVICE_NAME_RPC};
use crate::probes::{EventLogEntry, Software, WindowsService};
use crate::tasks::ScheduledTask;
use crate::wua::{UpdateInstallOutcome, WinUpdate};

/// Non-interactive PowerShell one-shot with a deadline.
async fn powershell(script: &str, timeout_secs: u64) -> Result<String> {
    let out = cmd::run(
        "powershell.exe",
        &[
            "-NonInteractive",
            "-NoProfile",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ],
        timeout_secs,
    )
    .await;
    if out.timed_out() {
        bail!("powershell timed out after {timeout_secs}s");
    }
    if out.exit_code != 0 {
        bail!("powershell exited {}: {}", out.exit_code, out.stderr.trim());
    }
    Ok(out.stdout)
}

pub fn shell_invocation(shell: &str, command: &str) -> (String, Vec<String>) {
    match shell {
        "powershell" => (
            "powershell.exe".to_string(),
            vec![
                "-NonInteractive".to_string(),
                "-NoProfile".to_string(),
                command.to_string(),
            ],
        ),
        // cmd and anything unrecognized go through the native processor.
        _ => (
            "cmd.exe".to_string(),
            vec!["/C".to_string(), command.to_string()],
        ),
    }
}

pub fn script_extension(shell: &str) -> &'static str {
    match shell {
        "powershell" => ".ps1",
        "python" => ".py",
        _ => ".bat",
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
            "powershell.exe".to_string(),
            vec![
                "-NonInteractive".to_string(),
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                path,
            ],
        )),
        "python" => Some((python_bin.to_string_lossy().to_string(), vec![path])),
        // Batch files run directly.
        "cmd" => Some((path, Vec::new())),
        _ => None,
    }
}

pub fn ping_args(ip: &str) -> Vec<String> {
    vec![ip.to_string()]
}

// ---------------------------------------------------------------------------
// Identity

pub async fn identity_load() -> Result<AgentIdentity> {
    let raw = powershell(&scripts::identity_get_script(), 20).await?;
    scripts::parse_identity(&raw)
}

pub async fn identity_save(id: &AgentIdentity) -> Result<()> {
    powershell(&scripts::identity_set_script(id), 20).await?;
    Ok(())
}

pub async fn identity_delete() -> Result<()> {
    powershell(&scripts::identity_delete_script(), 20).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Services

pub async fn list_services() -> Result<Vec<WindowsService>> {
    let raw = powershell(&scripts::service_list_script(), 60).await?;
    scripts::parse_services(&raw)
}

pub async fn service_detail(name: &str) -> Result<WindowsService> {
    let raw = powershell(&scripts::service_detail_script(name), 30).await?;
    scripts::parse_services(&raw)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("service {name} not found"))
}

pub async fn service_status(name: &str) -> Result<String> {
    Ok(service_detail(name).await?.status)
}

pub async fn control_service(name: &str, action: &str, timeout_secs: u64) -> Result<String> {
    match action {
        "restart" => {
            powershell(&scripts::service_action_script(name, "stop")?, timeout_secs).await?;
            powershell(&scripts::service_action_script(name, "start")?, timeout_secs).await?;
        }
        _ => {
            powershell(&scripts::service_action_script(name, action)?, timeout_secs).await?;
        }
    }
    service_status(name).await
}

pub async fn edit_service(name: &str, start_type: &str) -> Result<String> {
    powershell(&scripts::edit_service_script(name, start_type)?, 30).await?;
    Ok("ok".to_string())
}

// ---------------------------------------------------------------------------
// Host queries

pub async fn installed_software() -> Result<Vec<Software>> {
    let raw = powershell(&scripts::software_list_script(), 120).await?;
    scripts::parse_software(&raw)
}

pub async fn event_log(log_name: &str, days: i64) -> Result<Vec<EventLogEntry>> {
    let raw = powershell(&scripts::event_log_script(log_name, days), 90).await?;
    scripts::parse_event_log(&raw)
}

pub async fn reboot_required() -> Result<bool> {
    let raw = powershell(&scripts::reboot_required_script(), 20).await?;
    Ok(raw.trim().eq_ignore_ascii_case("true"))
}

pub async fn logged_on_user() -> Result<String> {
    let raw = powershell(&scripts::logged_on_user_script(), 20).await?;
    let user = crate::utils::strip_all(&raw);
    if user.is_empty() {
        Ok("None".to_string())
    } else {
        Ok(user)
    }
}

/// CIM load percentage; the caller falls back to a sampled average when this
/// fails.
pub async fn cpu_load_fast_path() -> Option<i32> {
    match powershell(&scripts::cpu_load_script(), 20).await {
        Ok(raw) => crate::utils::strip_all(&raw).parse().ok(),
        Err(e) => {
            debug!("cpu load fast path: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled tasks

pub async fn create_task(st: &ScheduledTask, exe: &Path, program_dir: &Path) -> Result<()> {
    let script = scripts::task_create_script(st, exe, program_dir)?;
    powershell(&script, 60).await?;
    Ok(())
}

pub async fn enable_task(name: &str, enabled: bool) -> Result<()> {
    powershell(&scripts::task_enable_script(name, enabled), 30).await?;
    Ok(())
}

pub async fn delete_task(name: &str) -> Result<()> {
    powershell(&scripts::task_delete_script(name), 30).await?;
    Ok(())
}

pub async fn list_tasks() -> Result<Vec<String>> {
    let raw = powershell(&scripts::task_list_script(), 30).await?;
    scripts::parse_task_list(&raw)
}

pub async fn cleanup_tasks(prefix: &str) -> Result<()> {
    powershell(&scripts::task_cleanup_script(prefix), 60).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Update catalog

pub async fn wua_enumerate() -> Result<Vec<WinUpdate>> {
    let raw = powershell(&scripts::wua_search_script(scripts::WUA_DEFAULT_QUERY), 1200).await?;
    scripts::parse_wua_updates(&raw)
}

pub async fn wua_install(guid: &str) -> Result<UpdateInstallOutcome> {
    let raw = powershell(&scripts::wua_install_script(guid), 3600).await?;
    if raw.contains("superseded") {
        Ok(UpdateInstallOutcome::Superseded)
    } else {
        Ok(UpdateInstallOutcome::Installed)
    }
}

// ---------------------------------------------------------------------------
// Host actions

pub async fn reboot_now() -> Result<()> {
    let out = cmd::run("shutdown.exe", &["/r", "/t", "5", "/f"], 15).await;
    if out.exit_code != 0 {
        bail!("shutdown.exe exited {}", out.exit_code);
    }
    Ok(())
}

pub async fn flush_dns() {
    let _ = cmd::run("ipconfig", &["/flushdns"], 15).await;
}

pub async fn enable_ping() -> Result<()> {
    let rule = "netsh advfirewall firewall add rule name=\"ICMP Allow incoming V4 echo request\" \
                protocol=icmpv4:8,any dir=in action=allow";
    let out = cmd::run_shell("cmd", rule, 10).await;
    if out.exit_code != 0 {
        bail!("netsh exited {}: {}", out.exit_code, out.merged());
    }
    Ok(())
}

pub async fn enable_rdp() -> Result<()> {
    powershell(&scripts::enable_rdp_script(), 20).await?;
    let rule = "netsh advfirewall firewall set rule group=\"Remote Desktop\" new enable=Yes";
    let out = cmd::run_shell("cmd", rule, 10).await;
    if out.exit_code != 0 {
        bail!("netsh exited {}: {}", out.exit_code, out.merged());
    }
    Ok(())
}

pub async fn disable_sleep_hibernate() -> Result<()> {
    powershell(&scripts::disable_hiberboot_script(), 20).await?;
    for current in ["ac", "dc"] {
        for setting in [
            format!("powercfg /set{current}valueindex scheme_current sub_buttons lidaction 0"),
            format!("powercfg /x -standby-timeout-{current} 0"),
            format!("powercfg /x -hibernate-timeout-{current} 0"),
            format!("powercfg /x -disk-timeout-{current} 0"),
            format!("powercfg /x -monitor-timeout-{current} 0"),
        ] {
            let _ = cmd::run_shell("cmd", &setting, 5).await;
        }
    }
    let _ = cmd::run_shell("cmd", "powercfg -S SCHEME_CURRENT", 5).await;
    Ok(())
}

pub async fn add_defender_exclusions(program_dir: &Path) -> Result<()> {
    powershell(&scripts::defender_exclusions_script(program_dir), 30).await?;
    Ok(())
}

pub async fn expand_archive(zip: &Path, dest: &Path) -> Result<()> {
    powershell(&scripts::expand_archive_script(zip, dest), 600).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Service installation (nssm, bundled beside the agent)

fn nssm_path(program_dir: &Path) -> String {
    let exe = if cfg!(target_arch = "x86") {
        "nssm-x86.exe"
    } else {
        "nssm.exe"
    };
    program_dir.join(exe).to_string_lossy().to_string()
}

pub async fn install_agent_services(exe: &Path, program_dir: &Path) -> Result<()> {
    let nssm = nssm_path(program_dir);
    let exe = exe.to_string_lossy();
    let commands: [Vec<&str>; 10] = [
        vec!["install", SERVICE_NAME_RPC, &exe, "-m", "rpc"],
        vec!["set", SERVICE_NAME_RPC, "DisplayName", "RMM Agent RPC Service"],
        vec!["set", SERVICE_NAME_RPC, "Description", "RMM Agent RPC Service"],
        vec!["set", SERVICE_NAME_RPC, "AppRestartDelay", "5000"],
        vec!["start", SERVICE_NAME_RPC],
        vec!["install", SERVICE_NAME_AGENT, &exe, "-m", "agentsvc"],
        vec!["set", SERVICE_NAME_AGENT, "DisplayName", "RMM Agent Service"],
        vec!["set", SERVICE_NAME_AGENT, "Description", "RMM Agent Service"],
        vec!["set", SERVICE_NAME_AGENT, "AppRestartDelay", "5000"],
        vec!["start", SERVICE_NAME_AGENT],
    ];
    for args in &commands {
        debug!("{nssm} {args:?}");
        let _ = cmd::run(&nssm, args, 25).await;
    }
    Ok(())
}

/// Stop and unregister a service left behind by an older agent.
pub async fn remove_service(name: &str, program_dir: &Path) -> Result<()> {
    let nssm = nssm_path(program_dir);
    let _ = cmd::run(&nssm, &["stop", name], 30).await;
    let _ = cmd::run(&nssm, &["remove", name, "confirm"], 30).await;
    Ok(())
}

/// Inno setup drops `unins000.exe`/`unins001.exe` beside the agent.
pub fn uninstall_exe(program_dir: &Path) -> std::path::PathBuf {
    if let Ok(entries) = std::fs::read_dir(program_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("unins") && name.ends_with(".exe") && name.contains("001") {
                return program_dir.join(name);
            }
        }
    }
    program_dir.join("unins000.exe")
}

pub fn run_uninstaller() -> Result<()> {
    let uninst = uninstall_exe(&config::program_dir());
    let uninst = uninst.to_string_lossy();
    cmd::run_detached(
        "cmd.exe",
        &[
            "/C",
            &uninst,
            "/VERYSILENT",
            "/SUPPRESSMSGBOXES",
            "/FORCECLOSEAPPLICATIONS",
        ],
    )?;
    Ok(())
}
