use anyhow::{bail, Context, Result};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cmd;
use crate::config::{self, AgentIdentity, NATS_DEFAULT_PORT, NATS_RMM_IDENTIFIER};
use crate::probes;
use crate::utils::strip_all;

const API_URL_SOFTWARE: &str = "/api/v3/software/";
const API_URL_SYNCMESH: &str = "/api/v3/syncmesh/";

/// Aggregate handed to every mode: provisioned identity, REST client, and
/// the host paths the agent cares about.
pub struct Agent {
    pub identity: AgentIdentity,
    pub version: String,
    pub hostname: String,
    pub program_dir: PathBuf,
    pub exe: PathBuf,
    pub python_bin: PathBuf,
    pub mesh_system_exe: PathBuf,
    client: reqwest::Client,
}

impl Agent {
    pub async fn new(version: &str) -> Result<Self> {
        let identity = AgentIdentity::load().await?;
        Self::from_identity(identity, version)
    }

    /// Build from an in-memory identity; the installer uses this after
    /// registration, before the stored copy is visible to the services.
    pub fn from_identity(identity: AgentIdentity, version: &str) -> Result<Self> {
        let program_dir = config::program_dir();
        let exe = program_dir.join(config::AGENT_FILENAME);
        let py_folder = if cfg!(target_arch = "x86") {
            "py38-x32"
        } else {
            "py38-x64"
        };
        #[cfg(windows)]
        let python_bin = program_dir.join(py_folder).join("python.exe");
        #[cfg(not(windows))]
        let python_bin = program_dir.join(py_folder).join("python3");

        #[cfg(windows)]
        let mesh_system_exe = PathBuf::from(
            std::env::var("ProgramFiles").unwrap_or_else(|_| "C:\\Program Files".into()),
        )
        .join(config::MESH_AGENT_FOLDER)
        .join("MeshAgent.exe");
        #[cfg(not(windows))]
        let mesh_system_exe = program_dir.join("meshagent");

        let client = build_client(&identity)?;
        Ok(Self {
            identity,
            version: version.to_string(),
            hostname: probes::hostname(),
            program_dir,
            exe,
            python_bin,
            mesh_system_exe,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.identity.base_url, path)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.client.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            bail!("GET {path} returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        if !resp.status().is_success() {
            bail!("POST {path} returned {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    pub async fn patch_json<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let resp = self.client.patch(self.url(path)).json(body).send().await?;
        if !resp.status().is_success() {
            bail!("PATCH {path} returned {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    pub async fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let resp = self.client.put(self.url(path)).json(body).send().await?;
        if !resp.status().is_success() {
            bail!("PUT {path} returned {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    pub fn nats_server(&self) -> String {
        format!(
            "tls://{}:{}",
            self.identity.messaging_url, NATS_DEFAULT_PORT
        )
    }

    /// Bus connection authenticated as this agent. Reconnect is infinite
    /// with a 5 second backoff; publishes buffer across outages.
    pub async fn nats_connect(&self) -> Result<async_nats::Client> {
        let mut opts = async_nats::ConnectOptions::new()
            .name(NATS_RMM_IDENTIFIER)
            .user_and_password(self.identity.agent_id.clone(), self.identity.token.clone())
            .retry_on_initial_connect()
            .reconnect_delay_callback(|_attempts| Duration::from_secs(5));
        if let Some(cert) = &self.identity.cert {
            opts = opts.add_root_certificates(PathBuf::from(cert));
        }
        Ok(opts.connect(self.nats_server()).await?)
    }

    /// Ask the sidecar for its node id and post it so the server can re-map
    /// this host to its remote-administration identity.
    pub async fn sync_mesh_node_id(&self) {
        let out = cmd::run(&self.mesh_system_exe.to_string_lossy(), &["-nodeid"], 10).await;
        if !out.stderr.is_empty() {
            debug!("mesh nodeid: {}", out.stderr.trim());
            return;
        }
        let node_id = strip_all(&out.stdout);
        if node_id.is_empty() || node_id.to_lowercase().contains("not defined") {
            debug!("failed getting mesh node id: {node_id}");
            return;
        }
        let payload = json!({
            "func": "syncmesh",
            "agent_id": self.identity.agent_id,
            "nodeid": node_id,
        });
        if let Err(e) = self.post_json(API_URL_SYNCMESH, &payload).await {
            debug!("syncmesh: {e}");
        }
    }

    pub async fn send_software(&self) {
        let software = match crate::sys::installed_software().await {
            Ok(sw) => sw,
            Err(e) => {
                debug!("software inventory: {e}");
                return;
            }
        };
        let payload = json!({
            "agent_id": self.identity.agent_id,
            "software": software,
        });
        if let Err(e) = self.post_json(API_URL_SOFTWARE, &payload).await {
            debug!("send software: {e}");
        }
    }

    /// Publish the hardware snapshot, then the software inventory.
    pub async fn sync(&self) {
        crate::checkin::send_wmi(self).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.send_software().await;
    }
}

fn build_client(identity: &AgentIdentity) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !identity.token.is_empty() {
        let value = format!("Token {}", identity.token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&value).context("token is not a valid header value")?,
        );
    }

    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .default_headers(headers);
    if let Some(cert) = &identity.cert {
        let pem = std::fs::read(cert).with_context(|| format!("reading CA cert {cert}"))?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

/// Download a file to disk with a caller-supplied deadline. Used for the
/// mesh installer and agent updates, which get far more than the 15 second
/// API default.
pub async fn download_file(
    url: &str,
    dest: &Path,
    timeout: Duration,
    headers: Option<HeaderMap>,
) -> Result<()> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(h) = headers {
        builder = builder.default_headers(h);
    }
    let client = builder.build()?;
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        bail!("download of {url} returned {}", resp.status());
    }
    let body = resp.bytes().await?;
    std::fs::write(dest, &body).with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            base_url: "https://api.example.com".into(),
            messaging_url: "api.example.com".into(),
            agent_id: "A1".into(),
            token: "tok".into(),
            pk: 1,
            cert: None,
            py_enabled: false,
        }
    }

    #[test]
    fn messaging_endpoint_pins_the_bus_port() {
        let agent = Agent::from_identity(identity(), "1.7.2").unwrap();
        assert_eq!(agent.nats_server(), "tls://api.example.com:4222");
    }

    #[test]
    fn rest_urls_join_the_base() {
        let agent = Agent::from_identity(identity(), "1.7.2").unwrap();
        assert_eq!(
            agent.url("/api/v3/software/"),
            "https://api.example.com/api/v3/software/"
        );
    }

    #[test]
    fn missing_cert_file_fails_client_construction() {
        let mut id = identity();
        id.cert = Some("/nonexistent/ca.pem".into());
        assert!(Agent::from_identity(id, "1.7.2").is_err());
    }
}
