//! Binary entrypoint for the meshsync CLI.
//!
//! Commands:
//! - `init` - write a starter `meshsync.toml`
//! - `ports` - list serial ports
//! - `smoke-test [--target <t>] [--timeout <s>]` - connect, wait for the config download, print a summary
//! - `export <file>` - save the device's configuration as a JSON document
//! - `import <file> [--groups radio,module,channel]` - commit a (partial) JSON document
//! - `set <section> <field> <value>` - edit one field and commit its group
//! - `send-text <text> [--channel n]` - broadcast a text message
//! - `watch` - print manager events until interrupted
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshsync::bulk::BulkConfigDocument;
use meshsync::commit::CommitReport;
use meshsync::config::Config;
use meshsync::connection::{ConnectionHandle, ConnectionManager, ManagerEvent, SessionSettings};
use meshsync::device::sections::{ConfigGroup, SectionKey};
use meshsync::overlay::EditValue;

#[derive(Parser)]
#[command(name = "meshsync")]
#[command(about = "Connection and configuration engine for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshsync.toml", global = true)]
    config: String,

    /// Device target overriding the config file (serial port or host[:port])
    #[arg(short, long, global = true)]
    target: Option<String>,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// List serial ports
    Ports,
    /// Connect, download the device configuration and print a summary
    SmokeTest {
        /// Seconds to wait for the configuration download
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Export the device configuration to a JSON file
    Export { file: String },
    /// Commit the contents of a JSON configuration document
    Import {
        file: String,
        /// Groups to commit (default: every group present in the document)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<ConfigGroup>,
    },
    /// Edit one field (e.g. `set lora txPower 20`) and commit its group
    Set {
        section: String,
        field: String,
        /// JSON value; bare words are taken as strings
        value: String,
    },
    /// Broadcast a text message
    SendText {
        text: String,
        #[arg(long, default_value_t = 0)]
        channel: u32,
    },
    /// Print connection events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        Config::create_default(&cli.config).await?;
        println!("Wrote default configuration to {}", cli.config);
        return Ok(());
    }

    let config = match Config::load(&cli.config).await {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("{} (using defaults)", e);
            None
        }
    };
    init_logging(&config, cli.verbose);
    let config = config.unwrap_or_default();

    if let Commands::Ports = cli.command {
        let ports = meshsync::transport::list_serial_ports()?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let target = match &cli.target {
        Some(t) => config.connection.target_for(t),
        None => config.connection.transport_target(),
    };
    let manager = ConnectionManager::new(SessionSettings::from(&config));
    let target_name = target.handle();
    let handle = manager
        .connect(target, true)
        .await
        .with_context(|| format!("Failed to connect to {}", target_name))?;

    let configure_wait = match &cli.command {
        Commands::SmokeTest { timeout } => Duration::from_secs(*timeout),
        _ => Duration::from_millis(config.timeouts.configure_timeout_ms) + Duration::from_secs(1),
    };
    let node = manager.wait_connected(&handle, configure_wait).await;

    let result = run_command(cli.command, &manager, &handle, node).await;

    manager.disconnect_all().await;
    result
}

async fn run_command(
    command: Commands,
    manager: &ConnectionManager,
    handle: &ConnectionHandle,
    node: Result<u32, meshsync::errors::StateError>,
) -> Result<()> {
    match command {
        Commands::SmokeTest { timeout } => smoke_test(manager, handle, node.ok(), timeout),
        Commands::Export { file } => {
            node?;
            let doc = manager.export_config(handle)?;
            doc.save_to_file(&file)?;
            info!("Exported configuration to {}", file);
            Ok(())
        }
        Commands::Import { file, groups } => {
            node?;
            let doc = BulkConfigDocument::load_from_file(&file)?;
            let groups = if groups.is_empty() { document_groups(&doc) } else { groups };
            let report = manager.commit_document(handle, &doc, &groups).await?;
            print_report(&report)
        }
        Commands::Set { section, field, value } => {
            node?;
            let key: SectionKey = section.parse()?;
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            manager.edit_field(handle, key, &field, EditValue::Set(value)).await?;
            info!(
                "{} pending change(s) in {}",
                manager.get_pending_changes(handle, key),
                key
            );
            let report = manager.commit(handle, &[key.group()]).await?;
            print_report(&report)
        }
        Commands::SendText { text, channel } => {
            node?;
            let id = manager.send_text(handle, channel, &text).await?;
            info!("Text acknowledged (id {})", id);
            Ok(())
        }
        Commands::Watch => watch(manager).await,
        Commands::Init | Commands::Ports => Ok(()),
    }
}

fn document_groups(doc: &BulkConfigDocument) -> Vec<ConfigGroup> {
    let mut groups = Vec::new();
    if doc.radio.is_some() {
        groups.push(ConfigGroup::Radio);
    }
    if doc.module.is_some() {
        groups.push(ConfigGroup::Module);
    }
    if doc.channels.is_some() {
        groups.push(ConfigGroup::Channel);
    }
    groups
}

fn print_report(report: &CommitReport) -> Result<()> {
    for (group, outcome) in &report.outcomes {
        match outcome {
            Ok(()) => println!("{}: ok", group),
            Err(e) => println!("{}: {}", group, e),
        }
    }
    if report.is_success() {
        Ok(())
    } else {
        Err(anyhow!("commit failed for {:?}", report.failed_groups()))
    }
}

fn smoke_test(manager: &ConnectionManager, handle: &ConnectionHandle, node: Option<u32>, timeout: u64) -> Result<()> {
    let snapshot = manager.get_snapshot(handle);
    let status_ok = node.is_some() && snapshot.config_complete;
    if !status_ok {
        warn!("Configuration download incomplete. Is the device in PROTO serial mode?");
    }
    let payload = serde_json::json!({
        "status": if status_ok { "ok" } else { "incomplete" },
        "state": manager.state(handle),
        "node": node.map(|n| format!("!{:08x}", n)),
        "firmware": snapshot.metadata.as_ref().map(|m| m.firmware_version.clone()),
        "node_count": snapshot.nodes.len(),
        "channels": snapshot.channels.iter().filter(|c| c.is_some()).count(),
        "radio_sections": snapshot.reported_radio_sections().len(),
        "metrics": meshsync::metrics::snapshot(),
        "timeout_seconds": timeout,
    });
    println!("{}", payload);
    if status_ok {
        Ok(())
    } else {
        Err(anyhow!("smoke test incomplete"))
    }
}

async fn watch(manager: &ConnectionManager) -> Result<()> {
    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ManagerEvent::StateChanged { handle, state }) => {
                    println!("{}: {}", handle, state);
                    if !matches!(state, meshsync::connection::ConnectionState::Pending
                        | meshsync::connection::ConnectionState::Connected(_)) {
                        return Ok(());
                    }
                }
                Some(ManagerEvent::TextReceived { handle, message }) => {
                    println!(
                        "{}: [ch{}] !{:08x}: {}",
                        handle,
                        message.channel,
                        message.from,
                        meshsync::logutil::escape_log(&message.text)
                    );
                }
                Some(ManagerEvent::SnapshotUpdated { handle }) => {
                    log::debug!("{}: snapshot updated", handle);
                }
                Some(other) => log::debug!("{:?}", other),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| {
            match std::fs::OpenOptions::new().create(true).append(true).open(file) {
                Ok(f) => Some(f),
                Err(e) => {
                    eprintln!("Cannot open log file {}: {}", file, e);
                    None
                }
            }
        });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stderr);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    if builder.try_init().is_err() {
        eprintln!("Logger already initialised");
    }
}
