use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::error;
use std::fs::OpenOptions;
use std::sync::Arc;

pub mod agent;
pub mod checkin;
pub mod checks;
pub mod choco;
pub mod cmd;
pub mod config;
pub mod install;
pub mod probes;
pub mod recovery;
pub mod rpc;
pub mod script;
pub mod sys;
pub mod tasks;
pub mod utils;
pub mod wua;

use crate::agent::Agent;
use crate::config::{SERVICE_NAME_AGENT, SERVICE_NAME_MESHAGENT, SERVICE_NAME_RPC};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const AGENT_LOG_FILE: &str = "agent.log";

#[derive(Parser)]
#[command(name = "rmmagent", version, about = "RMM endpoint agent", long_about = None)]
struct Cli {
    /// The mode to run: install, update, rpc, agentsvc, runchecks, checkrunner,
    /// sysinfo, software, sync, wmi, pk, publicip, getpython, runmigrations,
    /// taskrunner, cleanup
    #[arg(short = 'm', long, value_enum)]
    mode: Option<Mode>,

    /// Task pk (taskrunner mode)
    #[arg(short = 'p', long, default_value_t = 0)]
    pk: i32,

    /// Log level: info, warn, error, debug
    #[arg(long, default_value = "info")]
    log: String,

    /// Log destination: file, stdout
    #[arg(long, default_value = "file")]
    logto: String,

    /// API URL (install)
    #[arg(long)]
    api: Option<String>,

    /// Client ID (install)
    #[arg(long)]
    client_id: Option<i32>,

    /// Site ID (install)
    #[arg(long)]
    site_id: Option<i32>,

    /// Agent's authorization token (install)
    #[arg(long)]
    auth: Option<String>,

    /// Agent description to display on the RMM server (install)
    #[arg(long)]
    desc: Option<String>,

    /// Agent type: server or workstation (install)
    #[arg(long, default_value = "server")]
    agent_type: String,

    /// Disable sleep and hibernate (install)
    #[arg(long)]
    power: bool,

    /// Enable Remote Desktop (install)
    #[arg(long)]
    rdp: bool,

    /// Enable ping in the firewall ruleset (install)
    #[arg(long)]
    ping: bool,

    /// Add antivirus exclusions (install)
    #[arg(long)]
    windef: bool,

    /// Allow python scripts to execute on this system (install)
    #[arg(long)]
    py_enabled: bool,

    /// Path to a local mesh agent executable (install)
    #[arg(long)]
    local_mesh: Option<String>,

    /// Path to the certificate authority's .pem (install)
    #[arg(long)]
    cert: Option<String>,

    /// Installer timeout in seconds
    #[arg(long, default_value_t = 900)]
    timeout: u64,

    /// Do not prompt during installation
    #[arg(long)]
    silent: bool,

    /// Source URL for the update executable (update)
    #[arg(long)]
    updateurl: Option<String>,

    /// Installer filename (update)
    #[arg(long)]
    inno: Option<String>,

    /// Update version (update)
    #[arg(long)]
    updatever: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Install,
    Update,
    Rpc,
    Agentsvc,
    Winagentsvc,
    Runchecks,
    Checkrunner,
    Sysinfo,
    Software,
    Sync,
    Wmi,
    Pk,
    Publicip,
    Getpython,
    Runmigrations,
    Migrations,
    Taskrunner,
    Task,
    Cleanup,
}

#[tokio::main]
async fn main() {
    if std::env::args().len() == 1 {
        show_status().await;
        return;
    }

    let cli = Cli::parse();
    let to_stdout = cli.logto == "stdout" || matches!(cli.mode, Some(Mode::Install));
    setup_logging(&cli.log, to_stdout);

    let Some(mode) = cli.mode else {
        show_status().await;
        return;
    };

    match mode {
        Mode::Install => {
            let (Some(api), Some(client_id), Some(site_id), Some(auth)) =
                (cli.api, cli.client_id, cli.site_id, cli.auth)
            else {
                install_usage();
                std::process::exit(1);
            };
            let opts = install::Installer {
                api_url: api,
                client_id,
                site_id,
                token: auth,
                description: cli.desc.unwrap_or_else(probes::hostname),
                agent_type: cli.agent_type,
                power: cli.power,
                rdp: cli.rdp,
                ping: cli.ping,
                windef: cli.windef,
                py_enabled: cli.py_enabled,
                local_mesh: cli.local_mesh,
                cert: cli.cert,
                timeout: cli.timeout,
                silent: cli.silent,
            };
            if let Err(e) = install::install(VERSION, opts).await {
                error!("{e:#}");
                println!("ERROR: {e:#}");
                std::process::exit(1);
            }
        }

        Mode::Update => {
            let (Some(url), Some(inno), Some(ver)) = (cli.updateurl, cli.inno, cli.updatever)
            else {
                update_usage();
                std::process::exit(1);
            };
            let agent = must_agent().await;
            install::agent_update(&agent, &url, &inno, &ver).await;
        }

        Mode::Rpc => {
            let agent = must_agent().await;
            if let Err(e) = rpc::run_rpc_service(agent).await {
                error!("{e:#}");
                std::process::exit(1);
            }
        }

        Mode::Agentsvc | Mode::Winagentsvc => {
            checkin::run_agent_service(must_agent().await).await;
        }

        Mode::Runchecks => {
            let agent = must_agent().await;
            if let Err(e) = checks::run_checks(agent).await {
                error!("runchecks: {e:#}");
                std::process::exit(1);
            }
        }

        Mode::Checkrunner => {
            checks::check_runner_loop(Arc::new(must_agent().await)).await;
        }

        Mode::Sysinfo => {
            let agent = must_agent().await;
            checkin::send_sysinfo(&agent).await;
        }

        Mode::Software => {
            let agent = must_agent().await;
            agent.send_software().await;
        }

        Mode::Sync => {
            let agent = must_agent().await;
            agent.sync().await;
        }

        Mode::Wmi => {
            let agent = must_agent().await;
            checkin::send_wmi(&agent).await;
        }

        Mode::Pk => {
            let agent = must_agent().await;
            println!("{}", agent.identity.pk);
        }

        Mode::Publicip => {
            println!("{}", probes::public_ip().await);
        }

        Mode::Getpython => {
            let agent = must_agent().await;
            install::get_python(&agent, true).await;
        }

        Mode::Runmigrations | Mode::Migrations => {
            let agent = must_agent().await;
            install::run_migrations(&agent).await;
        }

        Mode::Taskrunner | Mode::Task => {
            if cli.pk == 0 {
                return;
            }
            let agent = must_agent().await;
            if let Err(e) = tasks::run_task(&agent, cli.pk).await {
                error!("taskrunner: {e:#}");
                std::process::exit(1);
            }
        }

        Mode::Cleanup => {
            install::uninstall_cleanup().await;
        }
    }
}

/// Identity is mandatory for every mode but install.
async fn must_agent() -> Agent {
    match Agent::new(VERSION).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn show_status() {
    println!("RMM Agent v{VERSION}");
    for (label, svc) in [
        ("Agent Service", SERVICE_NAME_AGENT),
        ("RPC Service", SERVICE_NAME_RPC),
        ("Mesh Agent", SERVICE_NAME_MESHAGENT),
    ] {
        let status = sys::service_status(svc)
            .await
            .unwrap_or_else(|_| "Not Installed".to_string());
        println!("{label}: {status}");
    }
}

fn setup_logging(level: &str, to_stdout: bool) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    if !to_stdout {
        let path = config::program_dir().join(AGENT_LOG_FILE);
        if let Ok(file) = OpenOptions::new().append(true).create(true).open(path) {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.init();
}

fn install_usage() {
    println!(
        "Usage: {} -m install --api <https://api.example.com> --client-id X --site-id X --auth <TOKEN>",
        config::AGENT_FILENAME
    );
}

fn update_usage() {
    println!(
        "Usage: {} -m update --updateurl https://example.com/rmmagent-v1.7.3.exe --inno rmmagent-v1.7.3.exe --updatever 1.7.3",
        config::AGENT_FILENAME
    );
}
