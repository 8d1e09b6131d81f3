use anyhow::Result;
use futures_util::future::join_all;
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::agent::Agent;
use crate::cmd;
use crate::probes;
use crate::script;
use crate::sys;
use crate::tasks;
use crate::utils::{django_string_resp, jitter_ms, jitter_secs};

const API_URL_CHECKRUNNER: &str = "/api/v3/checkrunner/";

/// Deadline for one spawned check batch.
const RUNCHECKS_TIMEOUT: u64 = 600;
const DEFAULT_CHECK_INTERVAL: u64 = 120;
const PING_TIMEOUT: u64 = 90;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AssignedTask {
    #[serde(default)]
    pub pk: i32,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Check {
    #[serde(default)]
    pub pk: i32,
    #[serde(rename = "type", default)]
    pub check_type: String,
    #[serde(default = "default_check_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub disk: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub script: Script,
    #[serde(default)]
    pub svc_name: String,
    #[serde(default)]
    pub log_name: String,
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub assigned_tasks: Vec<AssignedTask>,
}

fn default_check_timeout() -> u64 {
    DEFAULT_CHECK_INTERVAL
}

#[derive(Debug, Default, Deserialize)]
struct CheckBatch {
    #[serde(default)]
    checks: Vec<Check>,
}

#[derive(Debug, Deserialize)]
struct CheckInfo {
    interval: u64,
}

async fn check_interval(agent: &Agent) -> u64 {
    let url = format!("/api/v3/{}/checkinterval/", agent.identity.agent_id);
    match agent.get_json::<CheckInfo>(&url).await {
        Ok(info) => info.interval,
        Err(e) => {
            debug!("check interval: {e}");
            DEFAULT_CHECK_INTERVAL
        }
    }
}

/// Periodic check loop. Each batch runs as a separate invocation of this
/// binary so a wedged check cannot take the service down with it.
pub async fn check_runner_loop(agent: Arc<Agent>) {
    info!("checkrunner service started");
    tokio::time::sleep(jitter_secs(14, 22)).await;
    let exe = agent.exe.to_string_lossy().to_string();
    loop {
        let interval = check_interval(&agent).await;
        if probes::checks_running() {
            debug!("checks are already running, waiting for the next tick");
        } else {
            let out = cmd::run(&exe, &["-m", "runchecks"], RUNCHECKS_TIMEOUT).await;
            if out.outcome != cmd::Outcome::Exited {
                error!("runchecks batch: {:?} {}", out.outcome, out.stderr.trim());
            }
        }
        debug!("checkrunner sleeping for {interval} seconds");
        tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
    }
}

/// Fetch the pending batch and fan out. Most checks get a short random
/// jitter so a batch does not hammer disk and network at once; cpuload
/// checks are already a sampling window and skip it. Service and event-log
/// checks are cheap individually but unbounded in count, so each list runs
/// sequentially inside its own task.
pub async fn run_checks(agent: Agent) -> Result<()> {
    let agent = Arc::new(agent);
    let url = format!("/api/v3/{}/checkrunner/", agent.identity.agent_id);
    let batch: CheckBatch = agent.get_json(&url).await?;

    let mut handles = Vec::new();
    let mut svc_checks = Vec::new();
    let mut event_checks = Vec::new();

    for check in batch.checks {
        match check.check_type.as_str() {
            "diskspace" | "memory" | "ping" | "script" => {
                let agent = Arc::clone(&agent);
                handles.push(tokio::spawn(async move {
                    tokio::time::sleep(jitter_ms(300, 950)).await;
                    run_one(&agent, &check).await;
                }));
            }
            "cpuload" => {
                let agent = Arc::clone(&agent);
                handles.push(tokio::spawn(async move {
                    run_one(&agent, &check).await;
                }));
            }
            "winsvc" => svc_checks.push(check),
            "eventlog" => event_checks.push(check),
            other => debug!("unknown check type: {other}"),
        }
    }

    if !svc_checks.is_empty() {
        let agent = Arc::clone(&agent);
        handles.push(tokio::spawn(async move {
            for check in svc_checks {
                winsvc_check(&agent, &check).await;
            }
        }));
    }
    if !event_checks.is_empty() {
        let agent = Arc::clone(&agent);
        handles.push(tokio::spawn(async move {
            for check in event_checks {
                eventlog_check(&agent, &check).await;
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_one(agent: &Agent, check: &Check) {
    match check.check_type.as_str() {
        "diskspace" => disk_check(agent, check).await,
        "cpuload" => cpu_check(agent, check).await,
        "memory" => mem_check(agent, check).await,
        "ping" => ping_check(agent, check).await,
        "script" => script_check(agent, check).await,
        _ => {}
    }
}

/// PATCH one result; a literal "failing" reply runs the enabled assigned
/// tasks. A single check failure never aborts the batch.
async fn report(agent: &Agent, check: &Check, payload: Value) {
    let resp = match agent.patch_json(API_URL_CHECKRUNNER, &payload).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!("check {}: {e}", check.pk);
            return;
        }
    };
    let pks = tasks_to_run(&resp, &check.assigned_tasks);
    if !pks.is_empty() {
        join_all(pks.iter().map(|pk| tasks::run_task(agent, *pk)))
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .for_each(|e| debug!("assigned task: {e}"));
    }
}

pub fn tasks_to_run(resp: &str, assigned: &[AssignedTask]) -> Vec<i32> {
    if django_string_resp(resp) != "failing" {
        return Vec::new();
    }
    assigned.iter().filter(|t| t.enabled).map(|t| t.pk).collect()
}

pub fn disk_check_payload(check: &Check, disk: Option<&probes::Disk>) -> Value {
    match disk {
        Some(d) => {
            let percent_used = if d.total > 0 {
                (d.used as f64 / d.total as f64) * 100.0
            } else {
                0.0
            };
            json!({
                "id": check.pk,
                "exists": true,
                "percent_used": percent_used,
                "total": d.total,
                "free": d.free,
            })
        }
        None => json!({ "id": check.pk, "exists": false }),
    }
}

async fn disk_check(agent: &Agent, check: &Check) {
    let disk = probes::disk_usage(&check.disk);
    if disk.is_none() {
        debug!("disk {} not found", check.disk);
    }
    report(agent, check, disk_check_payload(check, disk.as_ref())).await;
}

async fn cpu_check(agent: &Agent, check: &Check) {
    let payload = json!({ "id": check.pk, "percent": probes::cpu_load_avg().await });
    report(agent, check, payload).await;
}

async fn mem_check(agent: &Agent, check: &Check) {
    let payload = json!({ "id": check.pk, "percent": probes::mem_percent() });
    report(agent, check, payload).await;
}

pub fn ping_check_payload(check: &Check, out: &cmd::CmdOutput) -> Value {
    let (has_stdout, has_stderr, output) = if out.timed_out() {
        (false, true, format!("Ping check {} timed out", check.ip))
    } else if out.exit_code != 0 || !out.stderr.is_empty() {
        (false, true, format!("{}\n{}", out.stdout, out.stderr))
    } else {
        (true, false, out.stdout.clone())
    };
    json!({
        "id": check.pk,
        "has_stdout": has_stdout,
        "has_stderr": has_stderr,
        "output": output,
    })
}

/// Runs the OS ping binary; the output is reported verbatim, no parsing.
async fn ping_check(agent: &Agent, check: &Check) {
    let args = sys::ping_args(&check.ip);
    let argrefs: Vec<&str> = args.iter().map(String::as_str).collect();
    let out = cmd::run("ping", &argrefs, PING_TIMEOUT).await;
    report(agent, check, ping_check_payload(check, &out)).await;
}

async fn script_check(agent: &Agent, check: &Check) {
    let start = Instant::now();
    let out = script::run_script(
        &check.script.code,
        &check.script.shell,
        &check.script.args,
        check.timeout,
        &agent.python_bin,
    )
    .await;
    let payload = json!({
        "id": check.pk,
        "stdout": out.stdout,
        "stderr": out.stderr,
        "retcode": out.exit_code,
        "runtime": start.elapsed().as_secs_f64(),
    });
    report(agent, check, payload).await;
}

async fn winsvc_check(agent: &Agent, check: &Check) {
    let (exists, status) = match sys::service_status(&check.svc_name).await {
        Ok(status) => (true, status),
        Err(e) => {
            debug!("service {}: {e}", check.svc_name);
            (false, "n/a".to_string())
        }
    };
    let payload = json!({ "id": check.pk, "exists": exists, "status": status });
    report(agent, check, payload).await;
}

async fn eventlog_check(agent: &Agent, check: &Check) {
    let log = sys::event_log(&check.log_name, check.days)
        .await
        .unwrap_or_else(|e| {
            debug!("event log {}: {e}", check.log_name);
            Vec::new()
        });
    let payload = json!({ "id": check.pk, "log": log });
    report(agent, check, payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_server_batch_shape() {
        let raw = r#"{"checks":[{"pk":7,"type":"diskspace","disk":"C:",
            "assigned_tasks":[{"pk":42,"enabled":true}]}]}"#;
        let batch: CheckBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.checks.len(), 1);
        let c = &batch.checks[0];
        assert_eq!(c.pk, 7);
        assert_eq!(c.check_type, "diskspace");
        assert_eq!(c.disk, "C:");
        assert_eq!(c.assigned_tasks[0].pk, 42);
        assert_eq!(c.timeout, 120);
    }

    #[test]
    fn failing_reply_selects_only_enabled_tasks() {
        let assigned = vec![
            AssignedTask { pk: 1, enabled: true },
            AssignedTask { pk: 2, enabled: false },
            AssignedTask { pk: 3, enabled: true },
        ];
        assert_eq!(tasks_to_run("failing", &assigned), vec![1, 3]);
        // The server wraps bare strings in quotes.
        assert_eq!(tasks_to_run("\"failing\"", &assigned), vec![1, 3]);
        assert!(tasks_to_run("ok", &assigned).is_empty());
        assert!(tasks_to_run("", &assigned).is_empty());
    }

    #[test]
    fn missing_disk_reports_exists_false_only() {
        let check = Check {
            pk: 7,
            check_type: "diskspace".into(),
            disk: "ZZ:".into(),
            ..Default::default()
        };
        let payload = disk_check_payload(&check, None);
        assert_eq!(payload, json!({ "id": 7, "exists": false }));
    }

    #[test]
    fn present_disk_reports_usage() {
        let check = Check {
            pk: 7,
            ..Default::default()
        };
        let disk = probes::Disk {
            device: "C:".into(),
            fstype: "NTFS".into(),
            total: 1000,
            used: 250,
            free: 750,
            percent: 25,
        };
        let payload = disk_check_payload(&check, Some(&disk));
        assert_eq!(payload["exists"], json!(true));
        assert_eq!(payload["percent_used"], json!(25.0));
        assert_eq!(payload["total"], json!(1000));
        assert_eq!(payload["free"], json!(750));
    }

    #[test]
    fn ping_timeout_reports_stderr_side() {
        let check = Check {
            pk: 9,
            ip: "10.0.0.1".into(),
            ..Default::default()
        };
        let out = cmd::CmdOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: cmd::EXIT_TIMEOUT,
            outcome: cmd::Outcome::TimedOut,
        };
        let payload = ping_check_payload(&check, &out);
        assert_eq!(payload["has_stderr"], json!(true));
        assert_eq!(payload["has_stdout"], json!(false));
        assert!(payload["output"].as_str().unwrap().contains("timed out"));
    }

    #[test]
    fn clean_ping_reports_stdout_side() {
        let check = Check {
            pk: 9,
            ip: "10.0.0.1".into(),
            ..Default::default()
        };
        let out = cmd::CmdOutput {
            stdout: "4 packets".into(),
            stderr: String::new(),
            exit_code: 0,
            outcome: cmd::Outcome::Exited,
        };
        let payload = ping_check_payload(&check, &out);
        assert_eq!(payload["has_stdout"], json!(true));
        assert_eq!(payload["output"], json!("4 packets"));
    }
}
