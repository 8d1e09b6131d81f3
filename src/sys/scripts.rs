//! PowerShell one-shots the Windows leaf feeds through the process runner,
//! plus the parsers for their `ConvertTo-Json` output. Everything here is
//! pure so the rendering and parsing can be exercised on any platform.

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;

use crate::config::AgentIdentity;
use crate::probes::{EventLogEntry, Software, WindowsService};
use crate::tasks::ScheduledTask;
use crate::wua::WinUpdate;

pub const REG_PATH: &str = r"HKLM:\SOFTWARE\RMMAgent";

/// Single-quote a value for interpolation into a PowerShell command.
pub fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// `ConvertTo-Json` collapses single-element collections to a bare object.
fn one_or_many<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(v) = serde_json::from_str::<Vec<T>>(raw) {
        return Ok(v);
    }
    let single: T = serde_json::from_str(raw).context("unexpected JSON shape")?;
    Ok(vec![single])
}

// ---------------------------------------------------------------------------
// Services

#[derive(Deserialize)]
struct PsService {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "DisplayName")]
    display_name: Option<String>,
    #[serde(rename = "State")]
    state: Option<String>,
    #[serde(rename = "StartMode")]
    start_mode: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "PathName")]
    path_name: Option<String>,
}

pub fn service_list_script() -> String {
    "Get-CimInstance -ClassName Win32_Service | \
     Select-Object Name,DisplayName,State,StartMode,Description,PathName | \
     ConvertTo-Json -Compress"
        .to_string()
}

pub fn service_detail_script(name: &str) -> String {
    format!(
        "Get-CimInstance -ClassName Win32_Service -Filter \"Name='{}'\" | \
         Select-Object Name,DisplayName,State,StartMode,Description,PathName | \
         ConvertTo-Json -Compress",
        name.replace('\'', "''")
    )
}

pub fn service_action_script(name: &str, action: &str) -> Result<String> {
    let name = ps_quote(name);
    Ok(match action {
        "start" => format!("Start-Service -Name {name}"),
        "stop" => format!("Stop-Service -Name {name} -Force"),
        "restart" => format!("Restart-Service -Name {name} -Force"),
        _ => bail!("unknown service action: {action}"),
    })
}

pub fn edit_service_script(name: &str, start_type: &str) -> Result<String> {
    let mode = match start_type {
        "automatic" | "auto" => "Automatic",
        "manual" => "Manual",
        "disabled" => "Disabled",
        _ => bail!("unknown start type: {start_type}"),
    };
    Ok(format!(
        "Set-Service -Name {} -StartupType {mode}",
        ps_quote(name)
    ))
}

fn normalize_start_mode(mode: &str) -> String {
    match mode {
        "Auto" => "automatic".to_string(),
        other => other.to_lowercase(),
    }
}

pub fn parse_services(raw: &str) -> Result<Vec<WindowsService>> {
    let parsed: Vec<PsService> = one_or_many(raw)?;
    Ok(parsed
        .into_iter()
        .filter_map(|s| {
            let name = s.name?;
            Some(WindowsService {
                name,
                display_name: s.display_name.unwrap_or_default(),
                status: s.state.unwrap_or_default().to_lowercase(),
                start_type: normalize_start_mode(&s.start_mode.unwrap_or_default()),
                description: s.description.unwrap_or_default(),
                binpath: s.path_name.unwrap_or_default(),
            })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Installed software

#[derive(Deserialize)]
struct PsSoftware {
    #[serde(rename = "DisplayName")]
    display_name: Option<String>,
    #[serde(rename = "DisplayVersion")]
    display_version: Option<String>,
    #[serde(rename = "Publisher")]
    publisher: Option<String>,
    #[serde(rename = "InstallDate")]
    install_date: Option<String>,
    #[serde(rename = "EstimatedSize")]
    estimated_size: Option<u64>,
    #[serde(rename = "InstallLocation")]
    install_location: Option<String>,
    #[serde(rename = "InstallSource")]
    install_source: Option<String>,
    #[serde(rename = "UninstallString")]
    uninstall_string: Option<String>,
}

pub fn software_list_script() -> String {
    "Get-ItemProperty 'HKLM:\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*',\
'HKLM:\\Software\\Wow6432Node\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*' \
-ErrorAction SilentlyContinue | Where-Object { $_.DisplayName } | \
Select-Object DisplayName,DisplayVersion,Publisher,InstallDate,EstimatedSize,\
InstallLocation,InstallSource,UninstallString | ConvertTo-Json -Compress"
        .to_string()
}

pub fn parse_software(raw: &str) -> Result<Vec<Software>> {
    let parsed: Vec<PsSoftware> = one_or_many(raw)?;
    Ok(parsed
        .into_iter()
        .filter_map(|s| {
            let name = s.display_name?;
            Some(Software {
                name,
                version: s.display_version.unwrap_or_default(),
                publisher: s.publisher.unwrap_or_default(),
                install_date: s.install_date.unwrap_or_default(),
                size: s.estimated_size.unwrap_or_default(),
                location: s.install_location.unwrap_or_default(),
                source: s.install_source.unwrap_or_default(),
                uninstall: s.uninstall_string.unwrap_or_default(),
            })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Event log

#[derive(Deserialize)]
struct PsEvent {
    #[serde(rename = "TimeCreated")]
    time_created: Option<String>,
    #[serde(rename = "Id")]
    id: Option<i64>,
    #[serde(rename = "LevelDisplayName")]
    level: Option<String>,
    #[serde(rename = "ProviderName")]
    provider: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

pub fn event_log_script(log_name: &str, days: i64) -> String {
    format!(
        "Get-WinEvent -FilterHashtable @{{LogName={}; StartTime=(Get-Date).AddDays(-{days})}} \
         -MaxEvents 500 -ErrorAction SilentlyContinue | \
         Select-Object @{{n='TimeCreated';e={{$_.TimeCreated.ToString('o')}}}},\
Id,LevelDisplayName,ProviderName,Message | ConvertTo-Json -Compress",
        ps_quote(log_name)
    )
}

fn level_to_event_type(level: &str) -> String {
    match level {
        "Information" => "INFO".to_string(),
        "Warning" => "WARNING".to_string(),
        "Error" | "Critical" => "ERROR".to_string(),
        other => other.to_uppercase(),
    }
}

pub fn parse_event_log(raw: &str) -> Result<Vec<EventLogEntry>> {
    let parsed: Vec<PsEvent> = one_or_many(raw)?;
    Ok(parsed
        .into_iter()
        .map(|e| EventLogEntry {
            source: e.provider.unwrap_or_default(),
            event_type: level_to_event_type(&e.level.unwrap_or_default()),
            event_id: e.id.unwrap_or_default(),
            message: e.message.unwrap_or_default(),
            time: e.time_created.unwrap_or_default(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Scheduled tasks

const WEEKDAY_BITS: [(u8, &str); 7] = [
    (1, "Sunday"),
    (2, "Monday"),
    (4, "Tuesday"),
    (8, "Wednesday"),
    (16, "Thursday"),
    (32, "Friday"),
    (64, "Saturday"),
];

pub fn weekday_names(mask: u8) -> Vec<&'static str> {
    WEEKDAY_BITS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

pub fn month_number(month: &str) -> u32 {
    match month {
        "February" => 2,
        "March" => 3,
        "April" => 4,
        "May" => 5,
        "June" => 6,
        "July" => 7,
        "August" => 8,
        "September" => 9,
        "October" => 10,
        "November" => 11,
        "December" => 12,
        _ => 1,
    }
}

/// Start boundary that can never fire on its own; manual and
/// check-failure tasks are demand-start only.
const UNREACHABLE_BOUNDARY: &str = "1975-01-01T01:00:00";

fn once_boundary(st: &ScheduledTask) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(st.year, month_number(&st.month), st.day)
        .with_context(|| format!("invalid task date {}-{}-{}", st.year, st.month, st.day))
}

pub fn task_create_script(st: &ScheduledTask, exe: &Path, program_dir: &Path) -> Result<String> {
    let mut lines: Vec<String> = Vec::new();

    // Action
    let (path, workdir, args) = match st.task_type.as_str() {
        "rmm" => (
            exe.to_string_lossy().to_string(),
            program_dir.to_string_lossy().to_string(),
            format!("-m taskrunner -p {}", st.pk),
        ),
        "schedreboot" => (
            "shutdown.exe".to_string(),
            String::new(),
            "/r /t 5 /f".to_string(),
        ),
        "custom" => (st.path.clone(), st.workdir.clone(), st.args.clone()),
        other => bail!("unknown task type: {other}"),
    };

    let mut action = format!("$action = New-ScheduledTaskAction -Execute {}", ps_quote(&path));
    if !args.is_empty() {
        action.push_str(&format!(" -Argument {}", ps_quote(&args)));
    }
    if !workdir.is_empty() {
        action.push_str(&format!(" -WorkingDirectory {}", ps_quote(&workdir)));
    }
    lines.push(action);

    // Trigger
    match st.trigger.as_str() {
        "once" => {
            let date = once_boundary(st)?;
            let start = format!(
                "{}T{:02}:{:02}:00",
                date.format("%Y-%m-%d"),
                st.hour,
                st.minute
            );
            lines.push(format!(
                "$trigger = New-ScheduledTaskTrigger -Once -At ([datetime]{})",
                ps_quote(&start)
            ));
            if st.deleteafter {
                let end = date
                    .and_hms_opt(st.hour, st.minute, 0)
                    .context("invalid task time")?
                    + Duration::minutes(10);
                lines.push(format!(
                    "$trigger.EndBoundary = {}",
                    ps_quote(&end.format("%Y-%m-%dT%H:%M:%S").to_string())
                ));
            }
        }
        "weekly" => {
            let days = weekday_names(st.weekdays);
            if days.is_empty() {
                bail!("weekly task has an empty weekday mask");
            }
            lines.push(format!(
                "$trigger = New-ScheduledTaskTrigger -Weekly -DaysOfWeek {} \
                 -At ([datetime]::Today.AddHours({}).AddMinutes({}))",
                days.join(","),
                st.hour,
                st.minute
            ));
        }
        "manual" | "checkfailure" => {
            lines.push(format!(
                "$trigger = New-ScheduledTaskTrigger -Once -At ([datetime]'{UNREACHABLE_BOUNDARY}')"
            ));
        }
        other => bail!("unknown task trigger: {other}"),
    }

    // Settings and principal
    let mut settings = String::from(
        "$settings = New-ScheduledTaskSettingsSet -AllowStartIfOnBatteries \
         -DontStopIfGoingOnBatteries -WakeToRun",
    );
    settings.push_str(if st.parallel {
        " -MultipleInstances Parallel"
    } else {
        " -MultipleInstances IgnoreNew"
    });
    if st.run_asap_after_missed {
        settings.push_str(" -StartWhenAvailable");
    }
    lines.push(settings);
    if st.deleteafter {
        lines.push("$settings.DeleteExpiredTaskAfter = 'PT15M'".to_string());
    }
    lines.push(
        "$principal = New-ScheduledTaskPrincipal -UserId 'SYSTEM' -LogonType ServiceAccount \
         -RunLevel Highest"
            .to_string(),
    );
    lines.push(format!(
        "Register-ScheduledTask -TaskName {} -Action $action -Trigger $trigger \
         -Settings $settings -Principal $principal -Force | Out-Null",
        ps_quote(&st.name)
    ));

    Ok(lines.join("\n"))
}

pub fn task_enable_script(name: &str, enabled: bool) -> String {
    let cmdlet = if enabled {
        "Enable-ScheduledTask"
    } else {
        "Disable-ScheduledTask"
    };
    format!("{cmdlet} -TaskName {} | Out-Null", ps_quote(name))
}

pub fn task_delete_script(name: &str) -> String {
    format!(
        "Unregister-ScheduledTask -TaskName {} -Confirm:$false",
        ps_quote(name)
    )
}

pub fn task_list_script() -> String {
    "(Get-ScheduledTask | Select-Object -ExpandProperty TaskName) | ConvertTo-Json -Compress"
        .to_string()
}

pub fn task_cleanup_script(prefix: &str) -> String {
    format!(
        "Get-ScheduledTask | Where-Object {{ $_.TaskName -like {} }} | \
         Unregister-ScheduledTask -Confirm:$false",
        ps_quote(&format!("{prefix}*"))
    )
}

pub fn parse_task_list(raw: &str) -> Result<Vec<String>> {
    one_or_many(raw)
}

// ---------------------------------------------------------------------------
// Windows Update catalog

#[derive(Deserialize)]
struct PsUpdate {
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "Guid")]
    guid: Option<String>,
    #[serde(rename = "RevisionNumber")]
    revision_number: Option<i32>,
    #[serde(rename = "Severity")]
    severity: Option<String>,
    #[serde(rename = "Installed")]
    installed: Option<bool>,
    #[serde(rename = "Downloaded")]
    downloaded: Option<bool>,
    #[serde(rename = "KBArticleIDs")]
    kb_article_ids: Option<Vec<String>>,
    #[serde(rename = "Categories")]
    categories: Option<Vec<String>>,
    #[serde(rename = "CategoryIDs")]
    category_ids: Option<Vec<String>>,
    #[serde(rename = "MoreInfoURLs")]
    more_info_urls: Option<Vec<String>>,
    #[serde(rename = "SupportURL")]
    support_url: Option<String>,
}

pub const WUA_DEFAULT_QUERY: &str =
    "IsInstalled=1 or IsInstalled=0 and Type='Software' and IsHidden=0";

pub fn wua_search_script(query: &str) -> String {
    format!(
        "$session = New-Object -ComObject 'Microsoft.Update.Session'\n\
         $searcher = $session.CreateUpdateSearcher()\n\
         $result = $searcher.Search({})\n\
         $result.Updates | ForEach-Object {{ [pscustomobject]@{{\n\
         Title=$_.Title; Description=$_.Description; Guid=$_.Identity.UpdateID;\n\
         RevisionNumber=$_.Identity.RevisionNumber; Severity=$_.MsrcSeverity;\n\
         Installed=$_.IsInstalled; Downloaded=$_.IsDownloaded;\n\
         KBArticleIDs=@($_.KBArticleIDs); Categories=@($_.Categories | ForEach-Object {{ $_.Name }});\n\
         CategoryIDs=@($_.Categories | ForEach-Object {{ $_.CategoryID }});\n\
         MoreInfoURLs=@($_.MoreInfoUrls); SupportURL=$_.SupportUrl }} }} | \
         ConvertTo-Json -Compress -Depth 4",
        ps_quote(query)
    )
}

pub fn wua_install_script(guid: &str) -> String {
    format!(
        "$session = New-Object -ComObject 'Microsoft.Update.Session'\n\
         $searcher = $session.CreateUpdateSearcher()\n\
         $result = $searcher.Search({})\n\
         if ($result.Updates.Count -eq 0) {{ Write-Output 'superseded'; exit 0 }}\n\
         $coll = New-Object -ComObject 'Microsoft.Update.UpdateColl'\n\
         foreach ($u in $result.Updates) {{\n\
         if (-not $u.EulaAccepted) {{ $u.AcceptEula() | Out-Null }}\n\
         $coll.Add($u) | Out-Null }}\n\
         $downloader = $session.CreateUpdateDownloader(); $downloader.Updates = $coll\n\
         $downloader.Download() | Out-Null\n\
         $installer = $session.CreateUpdateInstaller(); $installer.Updates = $coll\n\
         $installer.Install() | Out-Null\n\
         Write-Output 'installed'",
        ps_quote(&format!("UpdateID='{}'", guid.replace('\'', "")))
    )
}

pub fn parse_wua_updates(raw: &str) -> Result<Vec<WinUpdate>> {
    let parsed: Vec<PsUpdate> = one_or_many(raw)?;
    Ok(parsed
        .into_iter()
        .filter_map(|u| {
            let guid = u.guid?;
            Some(WinUpdate {
                guid,
                title: u.title.unwrap_or_default(),
                description: u.description.unwrap_or_default(),
                severity: u.severity.unwrap_or_default(),
                revision_number: u.revision_number.unwrap_or_default(),
                installed: u.installed.unwrap_or_default(),
                downloaded: u.downloaded.unwrap_or_default(),
                kb_article_ids: u.kb_article_ids.unwrap_or_default(),
                categories: u.categories.unwrap_or_default(),
                category_ids: u.category_ids.unwrap_or_default(),
                more_info_urls: u.more_info_urls.unwrap_or_default(),
                support_url: u.support_url.unwrap_or_default(),
            })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Identity registry namespace

#[derive(Deserialize)]
struct PsIdentity {
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "MessagingURL")]
    messaging_url: Option<String>,
    #[serde(rename = "AgentID")]
    agent_id: Option<String>,
    #[serde(rename = "Token")]
    token: Option<String>,
    #[serde(rename = "AgentPK")]
    agent_pk: Option<String>,
    #[serde(rename = "Cert")]
    cert: Option<String>,
    #[serde(rename = "PyEnabled")]
    py_enabled: Option<String>,
}

pub fn identity_get_script() -> String {
    format!(
        "Get-ItemProperty -Path '{REG_PATH}' | \
         Select-Object BaseURL,MessagingURL,AgentID,Token,AgentPK,Cert,PyEnabled | \
         ConvertTo-Json -Compress"
    )
}

pub fn identity_set_script(id: &AgentIdentity) -> String {
    let mut lines = vec![format!("New-Item -Path '{REG_PATH}' -Force | Out-Null")];
    let mut set = |name: &str, value: &str| {
        lines.push(format!(
            "Set-ItemProperty -Path '{REG_PATH}' -Name '{name}' -Value {}",
            ps_quote(value)
        ));
    };
    set("BaseURL", &id.base_url);
    set("MessagingURL", &id.messaging_url);
    set("AgentID", &id.agent_id);
    set("Token", &id.token);
    set("AgentPK", &id.pk.to_string());
    if let Some(cert) = &id.cert {
        set("Cert", cert);
    }
    set("PyEnabled", if id.py_enabled { "true" } else { "false" });
    lines.join("\n")
}

pub fn identity_delete_script() -> String {
    format!("Remove-Item -Path '{REG_PATH}' -Recurse -Force")
}

pub fn parse_identity(raw: &str) -> Result<AgentIdentity> {
    let parsed: PsIdentity = serde_json::from_str(raw.trim())?;
    Ok(AgentIdentity {
        base_url: parsed.base_url.unwrap_or_default(),
        messaging_url: parsed.messaging_url.unwrap_or_default(),
        agent_id: parsed.agent_id.unwrap_or_default(),
        token: parsed.token.unwrap_or_default(),
        pk: parsed
            .agent_pk
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        cert: parsed.cert.filter(|c| !c.is_empty()),
        py_enabled: parsed.py_enabled.as_deref() == Some("true"),
    })
}

// ---------------------------------------------------------------------------
// Misc host toggles

pub fn reboot_required_script() -> String {
    "Test-Path 'HKLM:\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\WindowsUpdate\\Auto Update\\RebootRequired'"
        .to_string()
}

pub fn logged_on_user_script() -> String {
    "((Get-CimInstance -ClassName Win32_ComputerSystem).Username).Split('\\')[1]".to_string()
}

pub fn cpu_load_script() -> String {
    "(Get-CimInstance -ClassName Win32_Processor).LoadPercentage".to_string()
}

pub fn enable_rdp_script() -> String {
    "Set-ItemProperty -Path 'HKLM:\\SYSTEM\\CurrentControlSet\\Control\\Terminal Server' \
     -Name 'fDenyTSConnections' -Value 0"
        .to_string()
}

pub fn disable_hiberboot_script() -> String {
    "Set-ItemProperty -Path 'HKLM:\\SYSTEM\\CurrentControlSet\\Control\\Session Manager\\Power' \
     -Name 'HiberbootEnabled' -Value 0"
        .to_string()
}

pub fn defender_exclusions_script(program_dir: &Path) -> String {
    let dir = program_dir.to_string_lossy();
    format!(
        "Add-MpPreference -ExclusionPath '{dir}\\*'\n\
         Add-MpPreference -ExclusionPath '{}\\*'\n\
         Add-MpPreference -ExclusionPath 'C:\\Program Files\\Mesh Agent\\*'",
        crate::config::agent_temp_dir().to_string_lossy()
    )
}

pub fn expand_archive_script(zip: &Path, dest: &Path) -> String {
    format!(
        "Expand-Archive -Path {} -DestinationPath {} -Force",
        ps_quote(&zip.to_string_lossy()),
        ps_quote(&dest.to_string_lossy())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_task() -> ScheduledTask {
        ScheduledTask {
            pk: 42,
            task_type: "rmm".into(),
            name: "RMMAgent_foo".into(),
            trigger: "once".into(),
            year: 2026,
            month: "March".into(),
            day: 4,
            hour: 13,
            minute: 30,
            ..Default::default()
        }
    }

    #[test]
    fn rmm_task_runs_the_agent_binary() {
        let script = task_create_script(
            &base_task(),
            &PathBuf::from(r"C:\Program Files\RMMAgent\rmmagent.exe"),
            &PathBuf::from(r"C:\Program Files\RMMAgent"),
        )
        .unwrap();
        assert!(script.contains("-Argument '-m taskrunner -p 42'"));
        assert!(script.contains("rmmagent.exe"));
        assert!(script.contains("-At ([datetime]'2026-03-04T13:30:00')"));
        assert!(script.contains("-RunLevel Highest"));
        assert!(script.contains("-MultipleInstances IgnoreNew"));
        assert!(!script.contains("EndBoundary"));
    }

    #[test]
    fn delete_after_run_gets_end_boundary_and_expiry() {
        let mut st = base_task();
        st.deleteafter = true;
        let script =
            task_create_script(&st, &PathBuf::from("agent.exe"), &PathBuf::from(".")).unwrap();
        assert!(script.contains("$trigger.EndBoundary = '2026-03-04T13:40:00'"));
        assert!(script.contains("DeleteExpiredTaskAfter = 'PT15M'"));
    }

    #[test]
    fn manual_and_checkfailure_are_demand_start_only() {
        for trigger in ["manual", "checkfailure"] {
            let mut st = base_task();
            st.trigger = trigger.into();
            let script =
                task_create_script(&st, &PathBuf::from("agent.exe"), &PathBuf::from(".")).unwrap();
            assert!(script.contains("1975-01-01T01:00:00"), "{trigger}");
        }
    }

    #[test]
    fn weekly_task_maps_the_weekday_mask() {
        let mut st = base_task();
        st.trigger = "weekly".into();
        st.weekdays = 2 | 8 | 32;
        let script =
            task_create_script(&st, &PathBuf::from("agent.exe"), &PathBuf::from(".")).unwrap();
        assert!(script.contains("-DaysOfWeek Monday,Wednesday,Friday"));
        assert!(script.contains("AddHours(13).AddMinutes(30)"));
    }

    #[test]
    fn schedreboot_task_uses_the_shutdown_utility() {
        let mut st = base_task();
        st.task_type = "schedreboot".into();
        let script =
            task_create_script(&st, &PathBuf::from("agent.exe"), &PathBuf::from(".")).unwrap();
        assert!(script.contains("'shutdown.exe'"));
        assert!(script.contains("'/r /t 5 /f'"));
    }

    #[test]
    fn parallel_flag_flips_instance_policy() {
        let mut st = base_task();
        st.parallel = true;
        let script =
            task_create_script(&st, &PathBuf::from("agent.exe"), &PathBuf::from(".")).unwrap();
        assert!(script.contains("-MultipleInstances Parallel"));
    }

    #[test]
    fn weekday_mask_covers_all_bits() {
        assert_eq!(weekday_names(0x7f).len(), 7);
        assert_eq!(weekday_names(0), Vec::<&str>::new());
        assert_eq!(weekday_names(1), vec!["Sunday"]);
        assert_eq!(weekday_names(64), vec!["Saturday"]);
    }

    #[test]
    fn parses_single_service_object_and_array() {
        let single = r#"{"Name":"Spooler","DisplayName":"Print Spooler","State":"Running","StartMode":"Auto","Description":null,"PathName":"C:\\spoolsv.exe"}"#;
        let svcs = parse_services(single).unwrap();
        assert_eq!(svcs.len(), 1);
        assert_eq!(svcs[0].status, "running");
        assert_eq!(svcs[0].start_type, "automatic");

        let arr = format!("[{single},{single}]");
        assert_eq!(parse_services(&arr).unwrap().len(), 2);
        assert!(parse_services("").unwrap().is_empty());
    }

    #[test]
    fn parses_task_name_list() {
        assert_eq!(
            parse_task_list(r#"["RMMAgent_1","Other"]"#).unwrap(),
            vec!["RMMAgent_1".to_string(), "Other".to_string()]
        );
        assert_eq!(parse_task_list(r#""OnlyOne""#).unwrap(), vec!["OnlyOne"]);
    }

    #[test]
    fn parses_registry_identity() {
        let raw = r#"{"BaseURL":"https://api.example.com","MessagingURL":"api.example.com","AgentID":"A1","Token":"t0k","AgentPK":"7","Cert":null,"PyEnabled":"false"}"#;
        let id = parse_identity(raw).unwrap();
        assert_eq!(id.pk, 7);
        assert_eq!(id.agent_id, "A1");
        assert_eq!(id.cert, None);
        assert!(!id.py_enabled);
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(ps_quote("it's"), "'it''s'");
        let script = task_delete_script("o'brien");
        assert!(script.contains("'o''brien'"));
    }

    #[test]
    fn event_log_levels_normalize() {
        let raw = r#"[{"TimeCreated":"2026-01-01T00:00:00","Id":7045,"LevelDisplayName":"Warning","ProviderName":"Service Control Manager","Message":"m"}]"#;
        let events = parse_event_log(raw).unwrap();
        assert_eq!(events[0].event_type, "WARNING");
        assert_eq!(events[0].event_id, 7045);
    }

    #[test]
    fn wua_install_script_marks_missing_updates_superseded() {
        let script = wua_install_script("abc-123");
        assert!(script.contains("UpdateID='abc-123'"));
        assert!(script.contains("'superseded'"));
        assert!(script.contains("'installed'"));
    }
}
