use anyhow::Result;
use async_nats::{Client, Subject};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::agent::Agent;
use crate::checkin;
use crate::choco;
use crate::cmd;
use crate::install;
use crate::probes;
use crate::recovery;
use crate::script;
use crate::sys;
use crate::tasks::{self, ScheduledTask};
use crate::wua;

// Single-instance gates for the expensive commands. The "already running"
// path is a no-op, never a wait; process exit releases everything.
static AGENT_UPDATE_LOCK: AtomicBool = AtomicBool::new(false);
static WIN_UPDATE_SCAN_LOCK: AtomicBool = AtomicBool::new(false);
static WIN_UPDATE_INSTALL_LOCK: AtomicBool = AtomicBool::new(false);

struct LockGuard(&'static AtomicBool);

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn try_lock(lock: &'static AtomicBool) -> Option<LockGuard> {
    lock.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| LockGuard(lock))
}

fn default_timeout() -> u64 {
    15
}

#[derive(Debug, Default, Deserialize)]
pub struct ShellPayload {
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScriptPayload {
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamePayload {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SvcActionPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SvcEditPayload {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "startType", default)]
    pub start_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventLogPayload {
    #[serde(default)]
    pub logname: String,
    #[serde(default)]
    pub days: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecoverPayload {
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentUpdatePayload {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub inno: String,
    #[serde(default)]
    pub version: String,
}

/// The command union on the wire: a msgpack map discriminated by `func`.
/// Unknown tags land on the catch-all and are dropped, which is what keeps
/// old agents quiet when the server grows new commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "func", rename_all = "lowercase")]
pub enum NatsMsg {
    Ping,
    Procs,
    KillProc {
        #[serde(default)]
        procpid: i32,
    },
    RawCmd {
        #[serde(rename = "payload", default)]
        data: ShellPayload,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    WinServices,
    WinSvcDetail {
        #[serde(rename = "payload", default)]
        data: NamePayload,
    },
    WinSvcAction {
        #[serde(rename = "payload", default)]
        data: SvcActionPayload,
    },
    EditWinSvc {
        #[serde(rename = "payload", default)]
        data: SvcEditPayload,
    },
    RunScript {
        #[serde(rename = "payload", default)]
        data: ScriptPayload,
        #[serde(default)]
        script_args: Vec<String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    RunScriptFull {
        #[serde(rename = "payload", default)]
        data: ScriptPayload,
        #[serde(default)]
        script_args: Vec<String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    Recover {
        #[serde(rename = "payload", default)]
        data: RecoverPayload,
    },
    SchedTask {
        #[serde(rename = "schedtaskpayload", default)]
        task: ScheduledTask,
    },
    DelSchedTask {
        #[serde(rename = "schedtaskpayload", default)]
        task: ScheduledTask,
    },
    EnableSchedTask {
        #[serde(rename = "schedtaskpayload", default)]
        task: ScheduledTask,
    },
    ListSchedTasks,
    EventLog {
        #[serde(rename = "payload", default)]
        data: EventLogPayload,
    },
    SoftwareList,
    RebootNow,
    NeedsReboot,
    SysInfo,
    Sync,
    Wmi,
    CpuLoadAvg,
    RunChecks,
    RunTask {
        #[serde(default)]
        taskpk: i32,
    },
    PublicIp,
    InstallChoco,
    InstallWithChoco {
        #[serde(default)]
        choco_prog_name: String,
        #[serde(default)]
        pending_action_pk: i32,
    },
    GetWinUpdates,
    InstallWinUpdates {
        #[serde(default)]
        guids: Vec<String>,
    },
    AgentUpdate {
        #[serde(rename = "payload", default)]
        data: AgentUpdatePayload,
    },
    Uninstall,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize)]
struct ScriptResp {
    stdout: String,
    stderr: String,
    retcode: i32,
    execution_time: f64,
}

/// Subscribe on the agent's subject and dispatch. Every handler runs in a
/// detached task so the subscription loop never blocks; a failed handler
/// logs and dies alone.
pub async fn run_rpc_service(agent: Agent) -> Result<()> {
    info!("RPC service started");
    let agent = Arc::new(agent);
    let nc = agent.nats_connect().await?;
    let mut sub = nc.subscribe(agent.identity.agent_id.clone()).await?;
    nc.flush().await?;

    while let Some(msg) = sub.next().await {
        let decoded: NatsMsg = match rmp_serde::from_slice(&msg.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };
        tokio::spawn(handle(Arc::clone(&agent), nc.clone(), msg.reply, decoded));
    }
    Ok(())
}

/// Encode one msgpack frame on the reply subject, if the caller gave one.
async fn respond<T: Serialize + ?Sized>(nc: &Client, reply: &Option<Subject>, value: &T) {
    let Some(reply) = reply else { return };
    match rmp_serde::to_vec_named(value) {
        Ok(buf) => {
            if let Err(e) = nc.publish(reply.clone(), buf.into()).await {
                debug!("reply: {e}");
            }
            let _ = nc.flush().await;
        }
        Err(e) => error!("encoding reply: {e}"),
    }
}

async fn handle(agent: Arc<Agent>, nc: Client, reply: Option<Subject>, msg: NatsMsg) {
    match msg {
        NatsMsg::Ping => {
            debug!("pong");
            respond(&nc, &reply, "pong").await;
        }

        NatsMsg::Procs => {
            respond(&nc, &reply, &probes::procs()).await;
        }

        NatsMsg::KillProc { procpid } => match cmd::kill_proc(procpid as u32) {
            Ok(()) => respond(&nc, &reply, "ok").await,
            Err(e) => {
                debug!("{e}");
                respond(&nc, &reply, &e.to_string()).await;
            }
        },

        NatsMsg::RawCmd { data, timeout } => {
            let out = cmd::run_shell(&data.shell, &data.command, timeout).await;
            debug!("rawcmd exited {}", out.exit_code);
            respond(&nc, &reply, &out.merged()).await;
        }

        NatsMsg::WinServices => match sys::list_services().await {
            Ok(services) => respond(&nc, &reply, &services).await,
            Err(e) => respond(&nc, &reply, &e.to_string()).await,
        },

        NatsMsg::WinSvcDetail { data } => match sys::service_detail(&data.name).await {
            Ok(svc) => respond(&nc, &reply, &svc).await,
            Err(e) => respond(&nc, &reply, &e.to_string()).await,
        },

        NatsMsg::WinSvcAction { data } => {
            match sys::control_service(&data.name, &data.action, 60).await {
                Ok(status) => respond(&nc, &reply, &status).await,
                Err(e) => {
                    debug!("{e}");
                    respond(&nc, &reply, &e.to_string()).await;
                }
            }
        }

        NatsMsg::EditWinSvc { data } => {
            match sys::edit_service(&data.name, &data.start_type).await {
                Ok(status) => respond(&nc, &reply, &status).await,
                Err(e) => {
                    debug!("{e}");
                    respond(&nc, &reply, &e.to_string()).await;
                }
            }
        }

        NatsMsg::RunScript {
            data,
            script_args,
            timeout,
        } => {
            let out = script::run_script(
                &data.code,
                &data.shell,
                &script_args,
                timeout,
                &agent.python_bin,
            )
            .await;
            respond(&nc, &reply, &format!("{}{}", out.stdout, out.stderr)).await;
        }

        NatsMsg::RunScriptFull {
            data,
            script_args,
            timeout,
        } => {
            let start = Instant::now();
            let out = script::run_script(
                &data.code,
                &data.shell,
                &script_args,
                timeout,
                &agent.python_bin,
            )
            .await;
            let resp = ScriptResp {
                stdout: out.stdout,
                stderr: out.stderr,
                retcode: out.exit_code,
                execution_time: start.elapsed().as_secs_f64(),
            };
            respond(&nc, &reply, &resp).await;
        }

        NatsMsg::Recover { data } => {
            match data.mode.as_str() {
                "mesh" => {
                    debug!("recovering mesh");
                    recovery::recover_mesh(&agent).await;
                }
                "tacagent" => {
                    debug!("recovering agent");
                    recovery::recover_agent(&agent).await;
                }
                "salt" => warn!("salt recovery is legacy and no longer shipped"),
                other => debug!("unknown recovery mode: {other}"),
            }
            respond(&nc, &reply, "ok").await;
        }

        NatsMsg::SchedTask { task } => match tasks::create(&agent, &task).await {
            Ok(()) => respond(&nc, &reply, "ok").await,
            Err(e) => {
                error!("{e}");
                respond(&nc, &reply, &e.to_string()).await;
            }
        },

        NatsMsg::DelSchedTask { task } => match tasks::delete(&task.name).await {
            Ok(()) => respond(&nc, &reply, "ok").await,
            Err(e) => {
                error!("{e}");
                respond(&nc, &reply, &e.to_string()).await;
            }
        },

        NatsMsg::EnableSchedTask { task } => match tasks::enable(&task).await {
            Ok(()) => respond(&nc, &reply, "ok").await,
            Err(e) => {
                error!("{e}");
                respond(&nc, &reply, &e.to_string()).await;
            }
        },

        NatsMsg::ListSchedTasks => {
            let names = tasks::list().await.unwrap_or_default();
            respond(&nc, &reply, &names).await;
        }

        NatsMsg::EventLog { data } => {
            let days = data.days.parse().unwrap_or_default();
            let events = sys::event_log(&data.logname, days).await.unwrap_or_else(|e| {
                debug!("event log: {e}");
                Vec::new()
            });
            respond(&nc, &reply, &events).await;
        }

        NatsMsg::SoftwareList => match sys::installed_software().await {
            Ok(software) => respond(&nc, &reply, &software).await,
            Err(e) => respond(&nc, &reply, &e.to_string()).await,
        },

        NatsMsg::RebootNow => {
            debug!("scheduling immediate reboot");
            respond(&nc, &reply, "ok").await;
            if let Err(e) = sys::reboot_now().await {
                error!("{e}");
            }
        }

        NatsMsg::NeedsReboot => {
            let needed = sys::reboot_required().await.unwrap_or_else(|e| {
                debug!("reboot required: {e}");
                false
            });
            respond(&nc, &reply, &needed).await;
        }

        NatsMsg::SysInfo => {
            checkin::send_sysinfo(&agent).await;
            respond(&nc, &reply, "ok").await;
        }

        NatsMsg::Sync => {
            debug!("sending system info and software");
            agent.sync().await;
        }

        NatsMsg::Wmi => {
            debug!("sending wmi");
            checkin::send_wmi(&agent).await;
        }

        NatsMsg::CpuLoadAvg => {
            let load = probes::cpu_load_avg().await;
            debug!("cpu load average: {load}");
            respond(&nc, &reply, &load).await;
        }

        NatsMsg::RunChecks => {
            if probes::checks_running() {
                debug!("checks are already running, please wait");
                respond(&nc, &reply, "busy").await;
            } else {
                respond(&nc, &reply, "ok").await;
                let exe = agent.exe.to_string_lossy().to_string();
                let out = cmd::run(&exe, &["-m", "runchecks"], 600).await;
                if out.outcome != cmd::Outcome::Exited {
                    error!("rpc runchecks: {:?} {}", out.outcome, out.stderr.trim());
                }
            }
        }

        NatsMsg::RunTask { taskpk } => {
            debug!("running task {taskpk}");
            if let Err(e) = tasks::run_task(&agent, taskpk).await {
                debug!("{e}");
            }
        }

        NatsMsg::PublicIp => {
            respond(&nc, &reply, &probes::public_ip().await).await;
        }

        NatsMsg::InstallChoco => {
            choco::install_choco(&agent).await;
        }

        NatsMsg::InstallWithChoco {
            choco_prog_name,
            pending_action_pk,
        } => {
            respond(&nc, &reply, "ok").await;
            let results = choco::install_with_choco(&choco_prog_name).await;
            let url = format!("/api/v3/{pending_action_pk}/chocoresult/");
            if let Err(e) = agent.patch_json(&url, &json!({ "results": results })).await {
                debug!("choco result: {e}");
            }
        }

        NatsMsg::GetWinUpdates => match try_lock(&WIN_UPDATE_SCAN_LOCK) {
            None => debug!("already checking for updates"),
            Some(_guard) => {
                debug!("checking for updates");
                wua::get_win_updates(&agent).await;
            }
        },

        NatsMsg::InstallWinUpdates { guids } => match try_lock(&WIN_UPDATE_INSTALL_LOCK) {
            None => debug!("already installing updates"),
            Some(_guard) => {
                debug!("installing updates {guids:?}");
                wua::install_updates(&agent, &guids).await;
            }
        },

        NatsMsg::AgentUpdate { data } => match try_lock(&AGENT_UPDATE_LOCK) {
            None => {
                debug!("agent update already running");
                respond(&nc, &reply, "updaterunning").await;
            }
            Some(guard) => {
                respond(&nc, &reply, "ok").await;
                install::agent_update(&agent, &data.url, &data.inno, &data.version).await;
                drop(guard);
                // The service manager restarts us on the new binary.
                let _ = nc.flush().await;
                std::process::exit(0);
            }
        },

        NatsMsg::Uninstall => {
            respond(&nc, &reply, "ok").await;
            if let Err(e) = sys::run_uninstaller() {
                error!("uninstall: {e}");
            }
            let _ = nc.flush().await;
            std::process::exit(0);
        }

        NatsMsg::Unknown => {
            debug!("dropping unknown command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: serde_json::Value) -> NatsMsg {
        let buf = rmp_serde::to_vec_named(&value).unwrap();
        rmp_serde::from_slice(&buf).unwrap()
    }

    #[test]
    fn decodes_ping() {
        assert!(matches!(decode(json!({ "func": "ping" })), NatsMsg::Ping));
    }

    #[test]
    fn decodes_runscript_with_payload_and_args() {
        let msg = decode(json!({
            "func": "runscript",
            "payload": { "shell": "powershell", "code": "Start-Sleep -Seconds 30" },
            "script_args": ["a", "b"],
            "timeout": 3,
        }));
        match msg {
            NatsMsg::RunScript {
                data,
                script_args,
                timeout,
            } => {
                assert_eq!(data.shell, "powershell");
                assert_eq!(data.code, "Start-Sleep -Seconds 30");
                assert_eq!(script_args, vec!["a", "b"]);
                assert_eq!(timeout, 3);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn runscript_timeout_defaults_when_absent() {
        let msg = decode(json!({ "func": "runscript", "payload": { "shell": "cmd", "code": "x" } }));
        match msg {
            NatsMsg::RunScript { timeout, .. } => assert_eq!(timeout, 15),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decodes_killproc_pid() {
        match decode(json!({ "func": "killproc", "procpid": 4242 })) {
            NatsMsg::KillProc { procpid } => assert_eq!(procpid, 4242),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decodes_schedtask_with_embedded_task() {
        let msg = decode(json!({
            "func": "schedtask",
            "schedtaskpayload": {
                "pk": 7, "type": "rmm", "name": "RMMAgent_7",
                "trigger": "manual", "enabled": true
            },
        }));
        match msg {
            NatsMsg::SchedTask { task } => {
                assert_eq!(task.pk, 7);
                assert_eq!(task.name, "RMMAgent_7");
                assert_eq!(task.trigger, "manual");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decodes_installwinupdates_guids() {
        match decode(json!({ "func": "installwinupdates", "guids": ["g1", "g2"] })) {
            NatsMsg::InstallWinUpdates { guids } => assert_eq!(guids, vec!["g1", "g2"]),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn decodes_agentupdate_payload() {
        let msg = decode(json!({
            "func": "agentupdate",
            "payload": { "url": "https://dl/x.exe", "inno": "x.exe", "version": "1.7.3" },
        }));
        match msg {
            NatsMsg::AgentUpdate { data } => {
                assert_eq!(data.inno, "x.exe");
                assert_eq!(data.version, "1.7.3");
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn unknown_func_lands_on_the_catch_all() {
        assert!(matches!(
            decode(json!({ "func": "brand-new-command", "payload": { "x": 1 } })),
            NatsMsg::Unknown
        ));
    }

    #[test]
    fn recover_mode_round_trips() {
        match decode(json!({ "func": "recover", "payload": { "mode": "mesh" } })) {
            NatsMsg::Recover { data } => assert_eq!(data.mode, "mesh"),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn single_instance_lock_is_compare_and_set() {
        static LOCK: AtomicBool = AtomicBool::new(false);
        let guard = try_lock(&LOCK).expect("first take succeeds");
        assert!(try_lock(&LOCK).is_none(), "second take is a no-op");
        drop(guard);
        assert!(try_lock(&LOCK).is_some(), "released on drop");
    }

    #[test]
    fn replies_are_single_msgpack_frames() {
        let buf = rmp_serde::to_vec_named("pong").unwrap();
        let back: String = rmp_serde::from_slice(&buf).unwrap();
        assert_eq!(back, "pong");
    }
}
