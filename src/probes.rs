use log::debug;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use sysinfo::{Disks, System};

use crate::config::AGENT_FILENAME;
use crate::sys;

#[derive(Clone, Debug, Serialize)]
pub struct Disk {
    pub device: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowsService {
    pub name: String,
    pub display_name: String,
    pub binpath: String,
    pub description: String,
    pub status: String,
    pub start_type: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Software {
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub install_date: String,
    pub size: u64,
    pub source: String,
    pub location: String,
    pub uninstall: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventLogEntry {
    pub source: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "eventID")]
    pub event_id: i64,
    pub message: String,
    pub time: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub membytes: u64,
    pub cpu_percent: String,
}

/// Fixed disks with usage. Removable media are skipped.
pub fn disks() -> Vec<Disk> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| !d.is_removable())
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            let used = total.saturating_sub(free);
            Disk {
                device: d.mount_point().to_string_lossy().to_string(),
                fstype: d.file_system().to_string_lossy().to_string(),
                total,
                used,
                free,
                percent: if total > 0 {
                    ((used as f64 / total as f64) * 100.0).round() as i32
                } else {
                    0
                },
            }
        })
        .collect()
}

/// Usage for a single drive, by mount point ("C:" matches "C:\").
pub fn disk_usage(target: &str) -> Option<Disk> {
    let want = target.trim_end_matches(['\\', '/']).to_lowercase();
    disks().into_iter().find(|d| {
        d.device.trim_end_matches(['\\', '/']).to_lowercase() == want
    })
}

pub fn mem_percent() -> i32 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0;
    }
    ((sys.used_memory() as f64 / total as f64) * 100.0).round() as i32
}

/// Total RAM in gigabytes, rounded up.
pub fn total_ram() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory() as f64 / 1_073_741_824.0).ceil()
}

pub fn boot_time() -> i64 {
    System::boot_time() as i64
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Platform id and a formatted OS name line.
pub fn os_info() -> (String, String) {
    let plat = System::distribution_id();
    let name = System::long_os_version()
        .or_else(System::name)
        .unwrap_or_else(|| "unknown".to_string());
    let bits = if cfg!(target_pointer_width = "64") {
        "64 bit"
    } else {
        "32 bit"
    };
    let build = System::kernel_version().unwrap_or_else(|| "unknown".to_string());
    (plat, format!("{name}, {bits} (build {build})"))
}

/// CPU load 0-100. The CIM fast path answers in-place on Windows; the
/// fallback is a 10 second sampling window, which is why the check engine
/// does not jitter cpuload checks.
pub async fn cpu_load_avg() -> i32 {
    if let Some(v) = sys::cpu_load_fast_path().await {
        return v.clamp(0, 100);
    }
    sampled_cpu_load(Duration::from_secs(10)).await
}

async fn sampled_cpu_load(window: Duration) -> i32 {
    let mut sys = System::new();
    sys.refresh_cpu();
    tokio::time::sleep(window).await;
    sys.refresh_cpu();
    (sys.global_cpu_info().cpu_usage().round() as i32).clamp(0, 100)
}

pub async fn logged_on_user() -> String {
    match sys::logged_on_user().await {
        Ok(user) => user,
        Err(e) => {
            debug!("logged on user: {e}");
            "None".to_string()
        }
    }
}

const PUBLIC_IP_ENDPOINTS: [&str; 2] = ["https://icanhazip.com", "https://ifconfig.co/ip"];

/// Public IP as seen from the outside. Plain-text echo services, no parsing
/// beyond address validation.
pub async fn public_ip() -> String {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(8))
        .build()
    {
        Ok(c) => c,
        Err(_) => return "error".to_string(),
    };

    for url in PUBLIC_IP_ENDPOINTS {
        match client.get(url).send().await {
            Ok(resp) => {
                if let Ok(body) = resp.text().await {
                    let ip = crate::utils::strip_all(&body);
                    if ip.parse::<std::net::IpAddr>().is_ok() {
                        return ip;
                    }
                }
            }
            Err(e) => debug!("public ip via {url}: {e}"),
        }
    }
    "error".to_string()
}

pub fn procs() -> Vec<ProcessInfo> {
    let mut sys = System::new();
    sys.refresh_processes();
    let mut out: Vec<ProcessInfo> = sys
        .processes()
        .values()
        .map(|p| ProcessInfo {
            name: p.name().to_string(),
            pid: p.pid().as_u32(),
            membytes: p.memory(),
            cpu_percent: format!("{:.1}%", p.cpu_usage()),
        })
        .collect();
    out.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    out
}

/// A check batch is already in flight when another instance of this binary
/// is running with the `runchecks` argument.
pub fn checks_running() -> bool {
    let me = std::process::id();
    let mut sys = System::new();
    sys.refresh_processes();
    sys.processes().iter().any(|(pid, p)| {
        pid.as_u32() != me
            && p.name().contains(AGENT_FILENAME.trim_end_matches(".exe"))
            && p.cmd().iter().any(|a| a == "runchecks")
    })
}

/// Hardware/OS snapshot published on the wmi subject.
pub fn wmi_info() -> serde_json::Value {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    let models: BTreeSet<String> = sys.cpus().iter().map(|c| c.brand().trim().to_string()).collect();
    let (plat, os) = os_info();
    json!({
        "cpu_model": models.into_iter().collect::<Vec<_>>(),
        "total_ram": total_ram(),
        "hostname": hostname(),
        "plat": plat,
        "operating_system": os,
        "boot_time": boot_time(),
        "disks": disks(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_percent_is_a_percentage() {
        let p = mem_percent();
        assert!((0..=100).contains(&p));
    }

    #[test]
    fn total_ram_is_positive_whole_gigabytes() {
        let gb = total_ram();
        assert!(gb >= 1.0);
        assert_eq!(gb, gb.ceil());
    }

    #[test]
    fn os_info_is_populated() {
        let (plat, full) = os_info();
        assert!(!plat.is_empty());
        assert!(full.contains("bit"));
    }

    #[test]
    fn missing_drive_reports_none() {
        assert!(disk_usage("ZZ:").is_none());
    }

    #[test]
    fn no_check_batch_is_running_here() {
        assert!(!checks_running());
    }

    #[test]
    fn process_list_includes_this_process() {
        let me = std::process::id();
        assert!(procs().iter().any(|p| p.pid == me));
    }

    #[tokio::test]
    async fn sampled_cpu_load_stays_in_range() {
        let v = sampled_cpu_load(Duration::from_millis(300)).await;
        assert!((0..=100).contains(&v));
    }

    #[test]
    fn event_log_wire_names_match_the_server() {
        let e = EventLogEntry {
            source: "scm".into(),
            event_type: "INFO".into(),
            event_id: 1,
            message: "m".into(),
            time: "t".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("eventType").is_some());
        assert!(v.get("eventID").is_some());
    }
}
