//! Binary entrypoint for the Pinotify CLI.
//!
//! Commands:
//! - `start` - run the notifier until Ctrl-C
//! - `init` - create a starter `config.toml`
//! - `status` - print local state as JSON
//! - `arm` / `disarm` - switch the notifier on or off in the config file
//! - `blink [--on <s>] [--off <s>]` - send one blink to the indicator (link smoke test)
//! - `set-token <token>` - store a new push device token and sync
//! - `ack` - acknowledge the active message and sync
//!
//! See the library crate docs for module-level details: `pinotify::`.
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use pinotify::command::{Command, CommandEncoder, CommandOutcome};
use pinotify::config::{ArmedFlag, Config};
use pinotify::link::LinkTransport;
use pinotify::notifier::{LogDisplay, Notifier};
use pinotify::state::StateStore;
use pinotify::sync::SyncClient;

#[derive(Parser)]
#[command(name = "pinotify")]
#[command(about = "Message notifier with a serial/Bluetooth blink indicator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notifier service
    Start,
    /// Write a default configuration file
    Init,
    /// Show device token, ack watermark and active message
    Status,
    /// Enable syncing and blinking
    Arm,
    /// Disable syncing and blinking
    Disarm,
    /// Send one blink command to the indicator
    Blink {
        /// Seconds lit (defaults to the configured pattern)
        #[arg(long)]
        on: Option<u8>,
        /// Seconds dark (defaults to the configured pattern)
        #[arg(long)]
        off: Option<u8>,
    },
    /// Store a new push device token and sync with the backend
    SetToken { token: String },
    /// Acknowledge the active message
    Ack,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    config.validate()?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        Commands::Init => {}
        Commands::Start => {
            info!("Starting Pinotify v{}", env!("CARGO_PKG_VERSION"));
            if !config.device.armed {
                warn!("Notifier is disarmed; run `pinotify arm` to enable syncing and blinking");
            }
            let notifier = build_notifier(&config, ArmedFlag::new(config.device.armed))?;
            notifier.add_display(Arc::new(LogDisplay));

            let (triggers, service) = notifier.spawn(config.poll.interval());
            // Catch up on anything missed while we were down.
            triggers.poll();

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            triggers.shutdown();
            if let Err(e) = service.await {
                error!("Notifier loop ended abnormally: {}", e);
            }
        }
        Commands::Status => {
            let store = StateStore::open_sled(config.storage.state_path(), config.device.device_id.clone())?;
            let payload = serde_json::json!({
                "armed": config.device.armed,
                "device_id": store.device_id(),
                "link_port": config.link.port,
                "device_token": store.device_token().is_some(),
                "acked_until_utc": store.acked_until_utc(),
                "active_message": store.active_message(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Arm => set_armed(config, &cli.config, true).await?,
        Commands::Disarm => set_armed(config, &cli.config, false).await?,
        Commands::Blink { on, off } => {
            let command = Command::blink(
                on.unwrap_or(config.link.blink_on_seconds),
                off.unwrap_or(config.link.blink_off_seconds),
            )?;
            // A smoke test blinks regardless of the armed flag.
            let transport = build_transport(&config)?;
            let encoder = CommandEncoder::new(transport.clone(), ArmedFlag::new(true), command);
            let outcome = encoder.start_blinking().await;
            let payload = match &outcome {
                Ok(CommandOutcome::Sent { attempts }) => serde_json::json!({
                    "status": "ok",
                    "byte": command.encode(),
                    "attempts": attempts,
                    "link": format!("{:?}", transport.status()),
                }),
                Ok(CommandOutcome::Disarmed) => serde_json::json!({ "status": "disarmed" }),
                Err(e) => serde_json::json!({
                    "status": "failed",
                    "byte": command.encode(),
                    "error": e.to_string(),
                    "link": format!("{:?}", transport.status()),
                }),
            };
            transport.disconnect().await;
            println!("{}", payload);
            std::process::exit(if outcome.is_ok() { 0 } else { 1 });
        }
        Commands::SetToken { token } => {
            let notifier = build_notifier(&config, ArmedFlag::new(config.device.armed))?;
            match notifier.update_device_token(&token).await {
                Ok(()) => println!("Device token updated."),
                Err(e) if notifier.store().device_token().as_deref() == Some(token.as_str()) => {
                    println!("Device token stored; sync failed: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Ack => {
            let notifier = build_notifier(&config, ArmedFlag::new(config.device.armed))?;
            match notifier.ack_current_message().await? {
                Some(message) => println!(
                    "Acknowledged message from {} (watermark {}).",
                    message.sender,
                    notifier.store().acked_until_utc()
                ),
                None => println!("No active message."),
            }
            notifier.encoder().transport().disconnect().await;
        }
    }

    Ok(())
}

async fn set_armed(mut config: Config, path: &str, armed: bool) -> Result<()> {
    config.device.armed = armed;
    config.save(path).await?;
    println!("Notifier {}.", if armed { "armed" } else { "disarmed" });
    Ok(())
}

#[cfg(feature = "serial")]
fn build_transport(config: &Config) -> Result<Arc<LinkTransport>> {
    use pinotify::link::serial::SerialConnector;
    let connector = SerialConnector::new(config.link.baud_rate)
        .with_read_timeout(config.link.read_timeout())
        .with_settle(config.link.settle());
    Ok(Arc::new(LinkTransport::new(
        Arc::new(connector),
        config.link.port.clone(),
        config.link.send_attempts,
    )))
}

#[cfg(not(feature = "serial"))]
fn build_transport(_config: &Config) -> Result<Arc<LinkTransport>> {
    Err(anyhow::anyhow!("the indicator link requires the 'serial' feature"))
}

#[cfg(feature = "http")]
fn build_notifier(config: &Config, armed: ArmedFlag) -> Result<Notifier> {
    use pinotify::sync::http::HttpBackend;
    let store = Arc::new(StateStore::open_sled(
        config.storage.state_path(),
        config.device.device_id.clone(),
    )?);
    let backend = Arc::new(HttpBackend::new(&config.backend));
    let sync = Arc::new(SyncClient::new(store, backend, armed.clone()));
    let blink = Command::blink(config.link.blink_on_seconds, config.link.blink_off_seconds)?;
    let encoder = CommandEncoder::new(build_transport(config)?, armed, blink);
    Ok(Notifier::new(sync, encoder))
}

#[cfg(not(feature = "http"))]
fn build_notifier(_config: &Config, _armed: ArmedFlag) -> Result<Notifier> {
    Err(anyhow::anyhow!("syncing with the backend requires the 'http' feature"))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg
            .logging
            .level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
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
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
