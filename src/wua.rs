use log::{debug, error};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::agent::Agent;
use crate::sys;

const API_URL_WINUPDATES: &str = "/api/v3/winupdates/";
const API_URL_SUPERSEDED: &str = "/api/v3/superseded/";

/// One catalog entry from the update agent.
#[derive(Clone, Debug, Serialize)]
pub struct WinUpdate {
    pub guid: String,
    pub title: String,
    pub description: String,
    pub severity: String,
    pub installed: bool,
    pub downloaded: bool,
    pub kb_article_ids: Vec<String>,
    pub categories: Vec<String>,
    pub category_ids: Vec<String>,
    pub more_info_urls: Vec<String>,
    pub support_url: String,
    pub revision_number: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateInstallOutcome {
    Installed,
    /// The update vanished from the catalog between scan and install.
    Superseded,
}

/// Enumerate the catalog and post the inventory.
pub async fn get_win_updates(agent: &Agent) {
    let updates = match sys::wua_enumerate().await {
        Ok(u) => u,
        Err(e) => {
            error!("update scan: {e}");
            return;
        }
    };
    for u in &updates {
        debug!(
            "update {} installed={} downloaded={}",
            u.guid, u.installed, u.downloaded
        );
    }
    let payload = json!({ "agent_id": agent.identity.agent_id, "updates": updates });
    if let Err(e) = agent.post_json(API_URL_WINUPDATES, &payload).await {
        debug!("update inventory: {e}");
    }
}

/// Install by GUID, reporting each result as it lands, then report whether
/// the host now needs a reboot.
pub async fn install_updates(agent: &Agent, guids: &[String]) {
    let agent_id = &agent.identity.agent_id;
    for guid in guids {
        match sys::wua_install(guid).await {
            Ok(UpdateInstallOutcome::Installed) => {
                debug!("installed update {guid}");
                let result = json!({ "agent_id": agent_id, "updateid": guid, "success": true });
                if let Err(e) = agent.patch_json(API_URL_WINUPDATES, &result).await {
                    debug!("update result: {e}");
                }
            }
            Ok(UpdateInstallOutcome::Superseded) => {
                debug!("update {guid} is superseded");
                let superseded = json!({ "agent_id": agent_id, "updateid": guid });
                if let Err(e) = agent.post_json(API_URL_SUPERSEDED, &superseded).await {
                    debug!("superseded: {e}");
                }
            }
            Err(e) => {
                error!("installing update {guid}: {e}");
                let result = json!({ "agent_id": agent_id, "updateid": guid, "success": false });
                if let Err(e) = agent.patch_json(API_URL_WINUPDATES, &result).await {
                    debug!("update result: {e}");
                }
            }
        }
    }

    // Let the servicing stack settle before asking.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let needs_reboot = match sys::reboot_required().await {
        Ok(v) => v,
        Err(e) => {
            error!("reboot required: {e}");
            false
        }
    };
    let payload = json!({ "agent_id": agent_id, "needs_reboot": needs_reboot });
    if let Err(e) = agent.put_json(API_URL_WINUPDATES, &payload).await {
        debug!("needs reboot: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_record_serializes_its_identity() {
        let u = WinUpdate {
            guid: "g-1".into(),
            title: "KB500".into(),
            description: String::new(),
            severity: "Critical".into(),
            installed: false,
            downloaded: true,
            kb_article_ids: vec!["500".into()],
            categories: vec!["Security Updates".into()],
            category_ids: vec![],
            more_info_urls: vec![],
            support_url: String::new(),
            revision_number: 3,
        };
        let v = serde_json::to_value(&u).unwrap();
        assert_eq!(v["guid"], "g-1");
        assert_eq!(v["revision_number"], 3);
        assert_eq!(v["kb_article_ids"][0], "500");
    }
}
