use async_nats::Client;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};

use crate::agent::Agent;
use crate::checks;
use crate::config;
use crate::install;
use crate::probes;
use crate::recovery;
use crate::sys;
use crate::utils::{jitter_ms, jitter_secs};

const API_URL_CHECKIN: &str = "/api/v3/checkin/";

pub const NATS_MODE_HELLO: &str = "agent-hello";
pub const NATS_MODE_OSINFO: &str = "agent-agentinfo";
pub const NATS_MODE_WINSERVICES: &str = "agent-winsvc";
pub const NATS_MODE_DISKS: &str = "agent-disks";
pub const NATS_MODE_PUBLICIP: &str = "agent-publicip";
pub const NATS_MODE_WMI: &str = "agent-wmi";

// Ticker period ranges in seconds; each period is drawn once at start.
pub const HELLO_RANGE: (u64, u64) = (40, 110);
pub const OSINFO_RANGE: (u64, u64) = (250, 450);
pub const WINSVC_RANGE: (u64, u64) = (700, 1000);
pub const PUBLICIP_RANGE: (u64, u64) = (300, 500);
pub const DISKS_RANGE: (u64, u64) = (200, 600);
pub const LOGGEDUSER_RANGE: (u64, u64) = (850, 1400);
pub const SOFTWARE_RANGE: (u64, u64) = (2400, 3000);
pub const SYNCMESH_RANGE: (u64, u64) = (2400, 2900);
pub const RECOVERY_RANGE: (u64, u64) = (180, 300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckInMode {
    Hello,
    OsInfo,
    WinServices,
    Disks,
    PublicIp,
    LoggedOnUser,
    Software,
    Startup,
    Wmi,
}

#[derive(Serialize)]
struct CheckInNats<'a> {
    agent_id: &'a str,
    version: &'a str,
}

#[derive(Serialize)]
struct AgentInfoNats<'a> {
    agent_id: &'a str,
    logged_in_username: String,
    hostname: &'a str,
    operating_system: String,
    plat: String,
    total_ram: f64,
    boot_time: i64,
    needs_reboot: bool,
}

#[derive(Serialize)]
struct WinSvcNats<'a> {
    agent_id: &'a str,
    services: Vec<probes::WindowsService>,
}

#[derive(Serialize)]
struct WinDisksNats<'a> {
    agent_id: &'a str,
    disks: Vec<probes::Disk>,
}

#[derive(Serialize)]
struct PublicIPNats<'a> {
    agent_id: &'a str,
    public_ip: String,
}

/// `-m agentsvc`: the heartbeat scheduler and the check runner side by side,
/// the same shape the service manager supervises.
pub async fn run_agent_service(agent: Agent) {
    let agent = Arc::new(agent);
    let svc = tokio::spawn(agent_svc(Arc::clone(&agent)));
    let checker = tokio::spawn(checks::check_runner_loop(Arc::clone(&agent)));
    let _ = tokio::join!(svc, checker);
}

/// The long-lived scheduler: one startup sequence, then independent jittered
/// tickers. A failed tick logs and waits for the next; nothing here unwinds.
pub async fn agent_svc(agent: Arc<Agent>) {
    info!("agent service started");

    if let Err(e) = config::create_agent_temp_dir() {
        error!("temp dir: {e}");
    }

    // Stagger fleet-wide restarts.
    let delay = jitter_secs(14, 22);
    debug!("sleeping for {delay:?}");
    tokio::time::sleep(delay).await;

    install::run_migrations(&agent).await;

    let nc = match agent.nats_connect().await {
        Ok(nc) => Some(nc),
        Err(e) => {
            error!("bus connection: {e}");
            None
        }
    };

    let startup = [
        CheckInMode::Hello,
        CheckInMode::OsInfo,
        CheckInMode::WinServices,
        CheckInMode::Disks,
        CheckInMode::PublicIp,
        CheckInMode::Software,
        CheckInMode::LoggedOnUser,
    ];
    for mode in startup {
        check_in(&agent, nc.as_ref(), mode).await;
        tokio::time::sleep(jitter_ms(300, 900)).await;
    }
    agent.sync_mesh_node_id().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    recovery::check_for_recovery(&agent).await;

    // The server uses the startup check-in to kick off first-scan workflows.
    tokio::time::sleep(jitter_secs(2, 7)).await;
    check_in(&agent, nc.as_ref(), CheckInMode::Startup).await;

    let mut hello = ticker(HELLO_RANGE);
    let mut osinfo = ticker(OSINFO_RANGE);
    let mut winsvc = ticker(WINSVC_RANGE);
    let mut publicip = ticker(PUBLICIP_RANGE);
    let mut disks = ticker(DISKS_RANGE);
    let mut loggeduser = ticker(LOGGEDUSER_RANGE);
    let mut software = ticker(SOFTWARE_RANGE);
    let mut syncmesh = ticker(SYNCMESH_RANGE);
    let mut recovery_tick = ticker(RECOVERY_RANGE);

    loop {
        tokio::select! {
            _ = hello.tick() => check_in(&agent, nc.as_ref(), CheckInMode::Hello).await,
            _ = osinfo.tick() => check_in(&agent, nc.as_ref(), CheckInMode::OsInfo).await,
            _ = winsvc.tick() => check_in(&agent, nc.as_ref(), CheckInMode::WinServices).await,
            _ = publicip.tick() => check_in(&agent, nc.as_ref(), CheckInMode::PublicIp).await,
            _ = disks.tick() => check_in(&agent, nc.as_ref(), CheckInMode::Disks).await,
            _ = loggeduser.tick() => check_in(&agent, nc.as_ref(), CheckInMode::LoggedOnUser).await,
            _ = software.tick() => check_in(&agent, nc.as_ref(), CheckInMode::Software).await,
            _ = syncmesh.tick() => agent.sync_mesh_node_id().await,
            _ = recovery_tick.tick() => recovery::check_for_recovery(&agent).await,
        }
    }
}

fn ticker(range: (u64, u64)) -> tokio::time::Interval {
    let period = jitter_secs(range.0, range.1);
    interval_at(Instant::now() + period, period)
}

/// One check-in. The six migrated subjects publish msgpack snapshots on the
/// bus; software and startup stay on their REST endpoints.
pub async fn check_in(agent: &Agent, nc: Option<&Client>, mode: CheckInMode) {
    let agent_id = agent.identity.agent_id.as_str();
    match mode {
        CheckInMode::Hello => {
            let payload = CheckInNats {
                agent_id,
                version: &agent.version,
            };
            publish(agent, nc, NATS_MODE_HELLO, &payload).await;
        }
        // The logged-on user rides the agent-info snapshot.
        CheckInMode::OsInfo | CheckInMode::LoggedOnUser => {
            let (plat, operating_system) = probes::os_info();
            let needs_reboot = sys::reboot_required().await.unwrap_or(false);
            let payload = AgentInfoNats {
                agent_id,
                logged_in_username: probes::logged_on_user().await,
                hostname: &agent.hostname,
                operating_system,
                plat,
                total_ram: probes::total_ram(),
                boot_time: probes::boot_time(),
                needs_reboot,
            };
            publish(agent, nc, NATS_MODE_OSINFO, &payload).await;
        }
        CheckInMode::WinServices => {
            let services = match sys::list_services().await {
                Ok(s) => s,
                Err(e) => {
                    debug!("services: {e}");
                    return;
                }
            };
            let payload = WinSvcNats { agent_id, services };
            publish(agent, nc, NATS_MODE_WINSERVICES, &payload).await;
        }
        CheckInMode::Disks => {
            let payload = WinDisksNats {
                agent_id,
                disks: probes::disks(),
            };
            publish(agent, nc, NATS_MODE_DISKS, &payload).await;
        }
        CheckInMode::PublicIp => {
            let payload = PublicIPNats {
                agent_id,
                public_ip: probes::public_ip().await,
            };
            publish(agent, nc, NATS_MODE_PUBLICIP, &payload).await;
        }
        CheckInMode::Software => agent.send_software().await,
        CheckInMode::Startup => {
            let payload = json!({
                "func": "startup",
                "agent_id": agent_id,
                "version": agent.version,
            });
            if let Err(e) = agent.post_json(API_URL_CHECKIN, &payload).await {
                debug!("startup checkin: {e}");
            }
        }
        CheckInMode::Wmi => {
            let mut payload = probes::wmi_info();
            payload["agent_id"] = json!(agent_id);
            publish(agent, nc, NATS_MODE_WMI, &payload).await;
        }
    }
}

/// Publish one snapshot on the agent's subject. The reply field carries the
/// mode discriminator; no reply is expected.
async fn publish<P: Serialize>(agent: &Agent, nc: Option<&Client>, mode: &str, payload: &P) {
    let Some(nc) = nc else {
        debug!("no bus connection, dropping {mode}");
        return;
    };
    let buf = match rmp_serde::to_vec_named(payload) {
        Ok(buf) => buf,
        Err(e) => {
            error!("encoding {mode}: {e}");
            return;
        }
    };
    if let Err(e) = nc
        .publish_with_reply(
            agent.identity.agent_id.clone(),
            mode.to_string(),
            buf.into(),
        )
        .await
    {
        debug!("publish {mode}: {e}");
        return;
    }
    let _ = nc.flush().await;
}

/// One-shot hardware snapshot publish, used by the wmi and sync modes.
pub async fn send_wmi(agent: &Agent) {
    match agent.nats_connect().await {
        Ok(nc) => check_in(agent, Some(&nc), CheckInMode::Wmi).await,
        Err(e) => debug!("wmi publish: {e}"),
    }
}

/// The sysinfo command refreshes the server's view in one shot.
pub async fn send_sysinfo(agent: &Agent) {
    match agent.nats_connect().await {
        Ok(nc) => {
            for mode in [
                CheckInMode::OsInfo,
                CheckInMode::PublicIp,
                CheckInMode::Disks,
            ] {
                check_in(agent, Some(&nc), mode).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            check_in(agent, Some(&nc), CheckInMode::Wmi).await;
        }
        Err(e) => debug!("sysinfo publish: {e}"),
    }
}

/// Startup batch emitted once right after registration.
pub async fn installer_check_in_batch(agent: &Agent) {
    match agent.nats_connect().await {
        Ok(nc) => {
            let startup = [
                CheckInMode::Hello,
                CheckInMode::OsInfo,
                CheckInMode::WinServices,
                CheckInMode::Disks,
                CheckInMode::PublicIp,
                CheckInMode::Software,
                CheckInMode::LoggedOnUser,
            ];
            for mode in startup {
                check_in(agent, Some(&nc), mode).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        Err(e) => error!("installer checkin: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_periods_come_from_the_spec_ranges() {
        for (range, max_expected) in [
            (HELLO_RANGE, 110),
            (OSINFO_RANGE, 450),
            (WINSVC_RANGE, 1000),
            (PUBLICIP_RANGE, 500),
            (DISKS_RANGE, 600),
            (LOGGEDUSER_RANGE, 1400),
            (SOFTWARE_RANGE, 3000),
            (SYNCMESH_RANGE, 2900),
            (RECOVERY_RANGE, 300),
        ] {
            assert!(range.0 < range.1);
            assert_eq!(range.1, max_expected);
            let t = ticker(range);
            let period = t.period().as_secs();
            assert!((range.0..=range.1).contains(&period));
        }
    }

    #[test]
    fn hello_payload_is_agent_id_and_version() {
        let payload = CheckInNats {
            agent_id: "A1",
            version: "1.7.2",
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v, serde_json::json!({"agent_id": "A1", "version": "1.7.2"}));
    }

    #[test]
    fn hello_payload_msgpack_round_trips() {
        let payload = CheckInNats {
            agent_id: "A1",
            version: "1.7.2",
        };
        let buf = rmp_serde::to_vec_named(&payload).unwrap();
        let back: serde_json::Value = rmp_serde::from_slice(&buf).unwrap();
        assert_eq!(back["agent_id"], "A1");
        assert_eq!(back["version"], "1.7.2");
    }
}
