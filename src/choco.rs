use log::{debug, error};
use serde_json::json;
use std::time::Duration;

use crate::agent::Agent;
use crate::cmd;
use crate::script;

const API_URL_CHOCO: &str = "/api/v3/choco/";
const CHOCO_BOOTSTRAP_URL: &str = "https://chocolatey.org/install.ps1";

/// Fetch the Chocolatey bootstrap script and run it; report success either
/// way so the server stops retrying.
pub async fn install_choco(agent: &Agent) {
    let installed = bootstrap(agent).await;
    let payload = json!({ "agent_id": agent.identity.agent_id, "installed": installed });
    if let Err(e) = agent.post_json(API_URL_CHOCO, &payload).await {
        debug!("choco result: {e}");
    }
}

async fn bootstrap(agent: &Agent) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!("choco client: {e}");
            return false;
        }
    };
    let body = match client.get(CHOCO_BOOTSTRAP_URL).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!("choco bootstrap: {e}");
                return false;
            }
        },
        Ok(resp) => {
            debug!("choco bootstrap returned {}", resp.status());
            return false;
        }
        Err(e) => {
            debug!("choco bootstrap: {e}");
            return false;
        }
    };

    let out = script::run_script(&body, "powershell", &[], 900, &agent.python_bin).await;
    if out.exit_code != 0 {
        debug!("choco install exited {}: {}", out.exit_code, out.stderr.trim());
        return false;
    }
    true
}

/// `choco install` one package; the raw output goes back to the server's
/// pending action.
pub async fn install_with_choco(name: &str) -> String {
    let out = cmd::run(
        "choco.exe",
        &[
            "install",
            name,
            "--yes",
            "--force",
            "--force-dependencies",
        ],
        1200,
    )
    .await;
    if out.outcome == cmd::Outcome::SpawnError {
        error!("choco: {}", out.stderr.trim());
    }
    out.merged()
}
