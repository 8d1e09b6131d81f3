use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

use crate::agent::Agent;
use crate::checks::Script;
use crate::script;
use crate::sys;

/// Host scheduled-task definition pushed from the server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(default)]
    pub pk: i32,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub deleteafter: bool,
    #[serde(default)]
    pub weekdays: u8,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub month: String,
    #[serde(default)]
    pub day: u32,
    #[serde(default)]
    pub hour: u32,
    #[serde(rename = "min", default)]
    pub minute: u32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub run_asap_after_missed: bool,
}

pub async fn create(agent: &Agent, st: &ScheduledTask) -> Result<()> {
    sys::create_task(st, &agent.exe, &agent.program_dir).await
}

pub async fn enable(st: &ScheduledTask) -> Result<()> {
    sys::enable_task(&st.name, st.enabled).await
}

pub async fn delete(name: &str) -> Result<()> {
    sys::delete_task(name).await
}

pub async fn list() -> Result<Vec<String>> {
    sys::list_tasks().await
}

#[derive(Debug, Default, Deserialize)]
struct AutomatedTask {
    #[serde(default)]
    script: Script,
    #[serde(default)]
    script_args: Vec<String>,
    #[serde(default = "default_task_timeout")]
    timeout: u64,
}

fn default_task_timeout() -> u64 {
    120
}

/// Fetch an assigned task by pk, execute it, and PATCH the result back to
/// the same endpoint.
pub async fn run_task(agent: &Agent, pk: i32) -> Result<()> {
    let url = format!("/api/v3/{pk}/{}/taskrunner/", agent.identity.agent_id);
    let task: AutomatedTask = agent.get_json(&url).await?;

    let start = Instant::now();
    let out = script::run_script(
        &task.script.code,
        &task.script.shell,
        &task.script_args,
        task.timeout,
        &agent.python_bin,
    )
    .await;
    debug!("task {pk} finished with code {}", out.exit_code);

    let payload = json!({
        "stdout": out.stdout,
        "stderr": out.stderr,
        "retcode": out.exit_code,
        "execution_time": start.elapsed().as_secs_f64(),
    });
    agent.patch_json(&url, &payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_server_wire_format() {
        let raw = r#"{
            "pk": 42, "type": "rmm", "name": "RMMAgent_42", "trigger": "weekly",
            "enabled": true, "deleteafter": false, "weekdays": 42,
            "year": 0, "month": "", "day": 0, "hour": 9, "min": 30,
            "path": "", "workdir": "", "args": "", "parallel": false,
            "run_asap_after_missed": true
        }"#;
        let st: ScheduledTask = serde_json::from_str(raw).unwrap();
        assert_eq!(st.pk, 42);
        assert_eq!(st.task_type, "rmm");
        assert_eq!(st.minute, 30);
        assert!(st.run_asap_after_missed);
    }

    #[test]
    fn missing_fields_default() {
        let st: ScheduledTask =
            serde_json::from_str(r#"{"name":"x","type":"custom","trigger":"manual"}"#).unwrap();
        assert_eq!(st.weekdays, 0);
        assert!(!st.parallel);
        assert!(!st.deleteafter);
    }

    #[test]
    fn automated_task_defaults_its_timeout() {
        let t: AutomatedTask = serde_json::from_str(r#"{"script":{"code":"x","shell":"cmd"}}"#).unwrap();
        assert_eq!(t.timeout, 120);
        assert!(t.script_args.is_empty());
    }
}
