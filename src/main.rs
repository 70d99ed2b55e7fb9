//! fleet-control CLI
//!
//! Entry point for the `fleet-control` daemon and its inspection commands.

use clap::{Parser, Subcommand};
use fleet_control::config::{parse_override, SettingDiff, GLOBAL_SCOPE};
use fleet_control::scheduler::{self, Scheduler, ShutdownState};
use fleet_control::vault::{Cipher, EncryptionKey, KEY_FILE_NAME};
use fleet_control::{ClusterHandle, Collaborators, Fleet, FleetError, SourceOptions, TickConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet-control")]
#[command(about = "Fleet monitor configuration and coordination", version)]
struct Cli {
    /// Main configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Working directory (default: monitoring-datadir)
    #[arg(long, global = true)]
    datadir: Option<PathBuf>,

    /// Clusters to monitor, comma-separated (default: discovered)
    #[arg(long, global = true, value_delimiter = ',')]
    cluster: Vec<String>,

    /// Command line setting, highest precedence (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_override)]
    set: Vec<(String, String)>,

    /// Log filter, e.g. "info" or "fleet_control=debug" (default: RUST_LOG or info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop until SIGINT/SIGTERM
    Run {
        /// Skip pulling the configuration repository on start
        #[arg(long)]
        no_git_pull: bool,
    },

    /// Print the effective configuration of the first --cluster, or the
    /// server scope when none is given
    Resolve {
        /// Print a single setting
        #[arg(long, short = 'k')]
        key: Option<String>,
    },

    /// Print the immutable/dynamic snapshot of the first --cluster as JSON
    Snapshot,

    /// Encrypt a value with the working directory key
    Encrypt {
        plaintext: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let options = SourceOptions {
        config_file: cli.config.clone(),
        include_dir: None,
        datadir: cli.datadir.clone(),
        clusters: cli.cluster.clone(),
        overrides: cli.set.clone(),
    };
    let scope = cli.cluster.first().cloned();

    let result = match cli.command {
        Commands::Run { no_git_pull } => run_daemon(&options, !no_git_pull),
        Commands::Resolve { key } => run_resolve(&options, scope.as_deref(), key.as_deref()),
        Commands::Snapshot => run_snapshot(&options, scope.as_deref()),
        Commands::Encrypt { plaintext } => run_encrypt(&options, &plaintext),
    };

    if let Err(e) = result {
        error!(error = %e, "fatal");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_fleet(options: &SourceOptions, init_git: bool) -> Result<Fleet, FleetError> {
    Fleet::init_config(options, init_git, Collaborators::live()?)
}

fn run_daemon(options: &SourceOptions, init_git: bool) -> Result<(), FleetError> {
    let fleet = Arc::new(load_fleet(options, init_git)?);
    let timing = TickConfig::from_settings(&fleet.global().settings);
    let timing = match timing.validate() {
        Ok(()) => timing,
        Err(e) => {
            error!(error = %e, "invalid timing, using defaults");
            TickConfig::default()
        }
    };

    let shutdown = Arc::new(ShutdownState::new());
    if let Err(e) = scheduler::install(Arc::clone(&shutdown)) {
        error!(error = %e, "failed to install signal handler");
    }

    let report = Scheduler::new(fleet, timing, shutdown).run();
    info!(
        ticks = report.ticks,
        pushed = report.pushed,
        backed_up = report.backed_up,
        "fleet-control stopped"
    );
    Ok(())
}

fn run_resolve(options: &SourceOptions, cluster: Option<&str>, key: Option<&str>) -> Result<(), FleetError> {
    let fleet = load_fleet(options, false)?;
    if let Some(key) = key {
        let handler = fleet.registry().lookup(key)?;
        if handler.is_secret() {
            println!("{} = \"{}\"", key, fleet_control::config::REDACTED);
        } else {
            println!("{} = {}", key, fleet.resolve(key, cluster)?.to_toml_literal());
        }
        return Ok(());
    }

    println!("# scope: {}", cluster.unwrap_or(GLOBAL_SCOPE));
    for (name, value) in fleet.redacted_config(cluster)? {
        println!("{} = {}", name, value);
    }
    Ok(())
}

#[derive(Serialize)]
struct SnapshotOutput {
    cluster: String,
    generated_at: String,
    immutable: BTreeMap<String, toml::Value>,
    overrides: BTreeMap<String, toml::Value>,
    dynamic: BTreeMap<String, toml::Value>,
    /// Keys whose current value differs from the value at start.
    changed: Vec<SettingDiff>,
    sources: Vec<fleet_control::config::ConfigSource>,
}

fn run_snapshot(options: &SourceOptions, cluster: Option<&str>) -> Result<(), FleetError> {
    let fleet = load_fleet(options, false)?;
    let name = match cluster {
        Some(name) => name.to_string(),
        None => fleet
            .cluster_names()
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::UnknownCluster(String::new()))?,
    };
    let config = fleet.cluster(&name)?.effective_config();

    let render = |map: &BTreeMap<fleet_settings::SettingId, fleet_settings::SettingValue>| {
        map.iter()
            .map(|(id, value)| {
                let shown = if id.is_secret() {
                    toml::Value::String(fleet_control::config::REDACTED.to_string())
                } else {
                    fleet_control::config::to_toml(value)
                };
                (id.name().to_string(), shown)
            })
            .collect::<BTreeMap<_, _>>()
    };
    let output = SnapshotOutput {
        cluster: name,
        generated_at: chrono::Utc::now().to_rfc3339(),
        immutable: render(&config.snapshot.immutable),
        overrides: render(&config.snapshot.overrides),
        dynamic: render(&config.snapshot.dynamic),
        changed: config
            .snapshot
            .diff(&config.settings)
            .into_iter()
            .filter(|d| !d.key.is_secret())
            .collect(),
        sources: config.sources.clone(),
    };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing snapshot: {}", e),
    }
    Ok(())
}

fn run_encrypt(options: &SourceOptions, plaintext: &str) -> Result<(), FleetError> {
    let sources = fleet_control::ConfigSources::load(options)?;
    let path = sources.datadir().join(KEY_FILE_NAME);
    let (key, _) = EncryptionKey::load_or_generate(&path).map_err(|source| FleetError::Datadir {
        path: path.clone(),
        source,
    })?;
    println!("{}", Cipher::new(&key).seal(plaintext)?);
    Ok(())
}
