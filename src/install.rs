use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::agent::{download_file, Agent};
use crate::checkin;
use crate::cmd;
use crate::config::{
    self, AgentIdentity, NATS_DEFAULT_PORT, TASK_PREFIX, UPDATE_ARTIFACT_PREFIX,
};
use crate::sys;
use crate::utils::{generate_agent_id, jitter_secs, strip_all};

pub struct Installer {
    pub api_url: String,
    pub client_id: i32,
    pub site_id: i32,
    pub token: String,
    pub description: String,
    pub agent_type: String,
    pub power: bool,
    pub rdp: bool,
    pub ping: bool,
    pub windef: bool,
    pub py_enabled: bool,
    pub local_mesh: Option<String>,
    pub cert: Option<String>,
    pub timeout: u64,
    pub silent: bool,
}

#[derive(Deserialize)]
struct NewAgentResp {
    pk: i32,
    token: String,
}

/// Validate the server URL and derive the REST origin plus the messaging
/// host (the origin's host with any port stripped).
pub fn validate_server_url(raw: &str) -> Result<(String, String)> {
    let url = Url::parse(raw).context("invalid server URL")?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("invalid URL scheme {other} (must be http or https)"),
    }
    let host = url
        .host_str()
        .context("server URL is missing a host")?
        .to_string();
    let origin = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    Ok((origin, host))
}

async fn preflight_messaging_port(host: &str) -> Result<()> {
    tcp_check(&format!("{host}:{NATS_DEFAULT_PORT}"))
        .await
        .with_context(|| {
            format!(
                "either port {NATS_DEFAULT_PORT} TCP is not open on your RMM, \
                 or the messaging service is not running"
            )
        })
}

async fn tcp_check(addr: &str) -> Result<()> {
    tokio::time::timeout(
        Duration::from_secs(15),
        tokio::net::TcpStream::connect(addr),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connection to {addr} timed out"))??;
    Ok(())
}

fn installer_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Token {token}"))
            .context("token is not a valid header value")?,
    );
    Ok(headers)
}

async fn check_existing_install() -> Result<()> {
    let has_identity = sys::identity_load().await.is_ok();
    let mesh_installed = {
        let agent = Agent::from_identity(AgentIdentity::default(), "0")?;
        agent.mesh_system_exe.exists()
    };
    if has_identity || mesh_installed {
        println!("Existing installation found and must be removed before attempting to reinstall.");
        println!("Uninstall the agent, then re-run this installer.");
        std::process::exit(0);
    }
    Ok(())
}

/// One-shot bootstrap: provision identity, register with the server, stand
/// the agent up as OS services.
pub async fn install(version: &str, opts: Installer) -> Result<()> {
    check_existing_install().await?;

    let agent_id = generate_agent_id();
    debug!("agent id: {agent_id}");

    let (base_url, messaging_host) = validate_server_url(&opts.api_url)?;
    debug!("base url: {base_url}, messaging host: {messaging_host}");

    preflight_messaging_port(&messaging_host).await?;

    // Installer-token client, short deadline.
    let headers = installer_headers(&opts.token)?;
    let iclient = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .default_headers(headers.clone())
        .build()?;

    let creds = iclient
        .get(format!("{base_url}/api/v3/installer/"))
        .send()
        .await
        .context("unable to reach the installer endpoint")?;
    if creds.status().as_u16() == 401 {
        bail!("installer token has expired, please generate a new one");
    }
    let ver = iclient
        .post(format!("{base_url}/api/v3/installer/"))
        .json(&json!({ "version": version }))
        .send()
        .await?;
    if !ver.status().is_success() {
        bail!("installer version check failed: {}", ver.text().await?);
    }

    // Long-deadline client for the registration leg.
    let rclient = reqwest::Client::builder()
        .timeout(Duration::from_secs(opts.timeout))
        .default_headers(headers.clone())
        .build()?;

    if let Some(cert) = &opts.cert {
        if !Path::new(cert).exists() {
            bail!("{cert} does not exist");
        }
    }

    let program_dir = config::program_dir();
    std::fs::create_dir_all(&program_dir)
        .with_context(|| format!("creating {}", program_dir.display()))?;

    // Mesh sidecar: download or copy, install, then wait for a node id.
    let mesh_installer = program_dir.join(mesh_installer_name());
    match &opts.local_mesh {
        None => {
            info!("downloading mesh agent...");
            let arch = if cfg!(target_arch = "x86") { "32" } else { "64" };
            let resp = rclient
                .post(format!("{base_url}/api/v3/meshexe/"))
                .json(&json!({ "arch": arch }))
                .send()
                .await
                .context("failed to download the mesh agent")?;
            if !resp.status().is_success() {
                bail!(
                    "unable to download the mesh agent from the RMM server: {}",
                    resp.status()
                );
            }
            std::fs::write(&mesh_installer, resp.bytes().await?)?;
        }
        Some(local) => {
            std::fs::copy(local, &mesh_installer)
                .with_context(|| format!("copying {local}"))?;
        }
    }

    info!("installing mesh agent...");
    let mesh_out = cmd::run(&mesh_installer.to_string_lossy(), &["-fullinstall"], 90).await;
    if mesh_out.exit_code != 0 {
        warn!("mesh install: {}", mesh_out.merged().trim());
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let staging = Agent::from_identity(AgentIdentity::default(), version)?;
    let mesh_node_id = wait_for_mesh_node_id(&staging.mesh_system_exe).await;
    debug!("mesh node id: {mesh_node_id}");

    info!("adding agent to dashboard");
    let resp = rclient
        .post(format!("{base_url}/api/v3/newagent/"))
        .json(&json!({
            "agent_id": agent_id,
            "hostname": staging.hostname,
            "client": opts.client_id,
            "site": opts.site_id,
            "mesh_node_id": mesh_node_id,
            "description": opts.description,
            "monitoring_type": opts.agent_type,
        }))
        .send()
        .await?;
    if !resp.status().is_success() {
        bail!("agent registration failed: {}", resp.text().await?);
    }
    let registered: NewAgentResp = resp.json().await?;
    debug!("agent pk: {}", registered.pk);

    // Persist the identity, then rebuild the in-memory copy from it. The
    // running services only see it after their start below.
    let identity = AgentIdentity {
        base_url,
        messaging_url: messaging_host,
        agent_id,
        token: registered.token,
        pk: registered.pk,
        cert: opts.cert.clone(),
        py_enabled: opts.py_enabled,
    };
    identity.save().await?;
    let agent = Agent::from_identity(identity, version)?;

    checkin::send_wmi(&agent).await;
    checkin::installer_check_in_batch(&agent).await;

    debug!("creating temp dir");
    config::create_agent_temp_dir()?;

    info!("installing services...");
    sys::install_agent_services(&agent.exe, &agent.program_dir).await?;

    if opts.windef {
        info!("adding antivirus exclusions");
        if let Err(e) = sys::add_defender_exclusions(&agent.program_dir).await {
            warn!("{e}");
        }
    }
    if opts.power {
        info!("disabling sleep/hibernate...");
        if let Err(e) = sys::disable_sleep_hibernate().await {
            warn!("{e}");
        }
    }
    if opts.ping {
        info!("enabling ping...");
        if let Err(e) = sys::enable_ping().await {
            warn!("{e}");
        }
    }
    if opts.rdp {
        info!("enabling remote desktop...");
        if let Err(e) = sys::enable_rdp().await {
            warn!("{e}");
        }
    }

    if !opts.silent {
        println!(
            "Installation was successful!\nAllow a few minutes for the agent to show up in the RMM"
        );
    }
    Ok(())
}

fn mesh_installer_name() -> &'static str {
    if cfg!(target_arch = "x86") {
        "meshagent-x86.exe"
    } else {
        "meshagent.exe"
    }
}

/// The sidecar takes a while to mint its identity; poll until it answers
/// with a defined node id.
async fn wait_for_mesh_node_id(mesh_exe: &Path) -> String {
    let exe = mesh_exe.to_string_lossy().to_string();
    loop {
        debug!("getting mesh node id");
        let out = cmd::run(&exe, &["-nodeid"], 30).await;
        if out.outcome != cmd::Outcome::Exited || !out.stderr.is_empty() {
            debug!("mesh nodeid: {}", out.stderr.trim());
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        let node_id = strip_all(&out.stdout);
        if node_id.is_empty() || node_id.to_lowercase().contains("not defined") {
            debug!("mesh node id not ready: {node_id}");
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        return node_id;
    }
}

/// Self-update: download the new installer and hand off to it in a detached
/// process group, then let the caller exit so the service manager restarts
/// the new binary.
pub async fn agent_update(agent: &Agent, url: &str, inno: &str, version: &str) {
    // De-thunder fleet-wide update pushes.
    tokio::time::sleep(jitter_secs(1, 15)).await;
    cleanup_agent_updates(&agent.program_dir);

    let updater = agent.program_dir.join(inno);
    info!("agent updating from {} to {version}", agent.version);
    info!("downloading agent update from {url}");
    if let Err(e) = download_file(url, &updater, Duration::from_secs(15 * 60), None).await {
        error!("update download: {e}");
        let _ = sys::control_service(config::SERVICE_NAME_RPC, "start", 10).await;
        return;
    }

    let log_file = config::agent_temp_dir().join("rmmagent-update.txt");
    let command = format!(
        "\"{}\" /VERYSILENT /LOG={}",
        updater.display(),
        log_file.display()
    );
    if let Err(e) = cmd::run_shell_detached("cmd", &command) {
        error!("launching updater: {e}");
        let _ = sys::control_service(config::SERVICE_NAME_RPC, "start", 10).await;
        return;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Remove stale update artifacts from the install dir and the agent temp
/// dir.
pub fn cleanup_agent_updates(program_dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(program_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(UPDATE_ARTIFACT_PREFIX) && name.ends_with(".exe") {
                debug!("removing update artifact {name}");
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    let _ = std::fs::remove_dir_all(config::agent_temp_dir());
}

/// Uninstall leftovers: credential namespace, prefixed scheduled tasks, and
/// update artifacts.
pub async fn uninstall_cleanup() {
    if let Err(e) = AgentIdentity::delete().await {
        debug!("identity cleanup: {e}");
    }
    cleanup_agent_updates(&config::program_dir());
    if let Err(e) = sys::cleanup_tasks(TASK_PREFIX).await {
        debug!("task cleanup: {e}");
    }
}

/// Idempotent cleanup of artifacts from older agent generations.
pub async fn run_migrations(agent: &Agent) {
    for svc in ["checkrunner"] {
        if sys::service_status(svc).await.is_ok() {
            info!("removing obsolete service {svc}");
            if let Err(e) = sys::remove_service(svc, &agent.program_dir).await {
                debug!("{e}");
            }
        }
    }
    // Legacy repair task from the first-generation agent.
    if let Err(e) = sys::delete_task("RMM_fixmesh").await {
        debug!("{e}");
    }
}

/// Provision the bundled python runtime. Gated by the feature flag; the
/// interpreter is a plain external executable as far as the agent is
/// concerned.
pub async fn get_python(agent: &Agent, force: bool) {
    if !agent.identity.py_enabled {
        debug!("python is disabled on this agent instance, skipping installation");
        return;
    }
    if agent.python_bin.exists() && !force {
        return;
    }

    let (zip_name, folder) = if cfg!(target_arch = "x86") {
        ("py38-x32.zip", "py38-x32")
    } else {
        ("py38-x64.zip", "py38-x64")
    };
    let py_folder = agent.program_dir.join(folder);
    let py_zip = agent.program_dir.join(zip_name);
    if force {
        let _ = std::fs::remove_dir_all(&py_folder);
    }

    let url = format!("{}/static/{}", agent.identity.base_url, zip_name);
    debug!("downloading {url}");
    if let Err(e) = download_file(&url, &py_zip, Duration::from_secs(20 * 60), None).await {
        error!("unable to download the python runtime: {e}");
        return;
    }
    if let Err(e) = sys::expand_archive(&py_zip, &agent.program_dir).await {
        error!("unpacking python runtime: {e}");
    }
    let _ = std::fs::remove_file(&py_zip);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https_origins() {
        let (base, host) = validate_server_url("https://api.example.com").unwrap();
        assert_eq!(base, "https://api.example.com");
        assert_eq!(host, "api.example.com");

        let (base, host) = validate_server_url("http://10.0.0.5:8000").unwrap();
        assert_eq!(base, "http://10.0.0.5:8000");
        // The port never belongs to the messaging host.
        assert_eq!(host, "10.0.0.5");
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(validate_server_url("ftp://api.example.com").is_err());
        assert!(validate_server_url("not a url").is_err());
        assert!(validate_server_url("").is_err());
    }

    #[test]
    fn update_artifact_cleanup_only_touches_its_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("rmmagent-v1.7.1.exe");
        let keep = dir.path().join("notes.txt");
        std::fs::write(&stale, b"x").unwrap();
        std::fs::write(&keep, b"x").unwrap();

        cleanup_agent_updates(dir.path());
        assert!(!stale.exists());
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn preflight_fails_on_a_closed_port() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(tcp_check(&addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn preflight_succeeds_against_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tcp_check(&addr.to_string()).await.unwrap();
    }
}
