use crate::console::{self, OperatorCommand};
use anyhow::{bail, Context};
use clap::Args;
use liftdesk_core::serial::{
    CommandOutcome, DriverCommand, DriverConfig, Panel, PanelEmitter, ProtocolProfile,
    SerialConnector, PROFILE_NAMES,
};
use liftdesk_core::settings::{self, Settings};
use liftdesk_core::telemetry::TelemetryHistory;
use liftdesk_core::{ConnectionStatus, PanelEvent, DEFAULT_BAUD_RATE};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[derive(Args)]
pub struct PanelArgs {
    /// Serial port (defaults to the first USB serial port)
    #[arg(long, env = "LIFTDESK_PORT")]
    pub port: Option<String>,

    /// Baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Firmware protocol profile
    #[arg(long, default_value = "handshake", value_parser = clap::builder::PossibleValuesParser::new(PROFILE_NAMES.iter().copied()))]
    pub profile: String,

    /// Settings file (defaults to ~/.liftdesk/settings.json)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// How long the device gets to acknowledge the handshake
    #[arg(long, default_value = "3000")]
    pub handshake_timeout_ms: u64,

    /// Close the session after this long without data
    #[arg(long, default_value = "10000")]
    pub stale_after_ms: u64,

    /// Directory for CSV exports without an explicit path
    #[arg(long, default_value = ".")]
    pub export_dir: PathBuf,

    /// Print panel events as JSON lines instead of text
    #[arg(long)]
    pub json: bool,
}

/// Prints panel updates and keeps the telemetry history.
struct ConsoleEmitter {
    json: bool,
    history: Mutex<TelemetryHistory>,
}

impl ConsoleEmitter {
    fn new(json: bool) -> Self {
        Self {
            json,
            history: Mutex::new(TelemetryHistory::new()),
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, TelemetryHistory> {
        // A poisoned history is still usable; it only ever grows
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PanelEmitter for ConsoleEmitter {
    fn emit_status(&self, status: ConnectionStatus) {
        if self.json {
            println!("{}", serde_json::json!({ "status": status }));
        } else {
            println!("[status] {}", status);
        }
    }

    fn emit_event(&self, event: PanelEvent) {
        if let PanelEvent::Sample(sample) = &event {
            self.history().push(sample.clone());
        }

        if self.json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("[console] failed to serialize event: {}", e),
            }
            return;
        }

        match event {
            PanelEvent::Ready => println!("[panel] device ready"),
            PanelEvent::Height { display, .. } => println!("[height] {}", display),
            PanelEvent::Angle { display, .. } => println!("[angle] {}", display),
            PanelEvent::Regulator { which, value } => {
                println!("[regulator] {} = {}", which.tag(), value)
            }
            PanelEvent::Homing { state } => println!("[homing] {}", state.display_text()),
            PanelEvent::Motor { on } => {
                println!("[motor] {}", if on { "on" } else { "off" })
            }
            PanelEvent::Sample(_) => {}
        }
    }

    fn emit_error(&self, error: String) {
        eprintln!("[error] {}", error);
    }
}

pub async fn run(args: PanelArgs) -> anyhow::Result<()> {
    let Some(profile) = ProtocolProfile::by_name(&args.profile) else {
        bail!("unknown protocol profile: {}", args.profile);
    };
    let settings_path = args.settings.clone().unwrap_or_else(settings::default_path);
    let mut settings = Settings::load(&settings_path);

    let config = DriverConfig {
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        stale_after: Duration::from_millis(args.stale_after_ms),
        ..DriverConfig::with_profile(profile)
    };
    let connector = SerialConnector::new(args.port.clone()).with_baud_rate(args.baud);
    let emitter = Arc::new(ConsoleEmitter::new(args.json));
    let mut panel = Panel::new(config, emitter.clone());

    println!("{}", console::HELP);
    let terms = settings.regulator;
    println!(
        "Saved regulator terms: P={} S={} D={} (window {})",
        terms.p, terms.s, terms.d, settings.view_window
    );
    if let Err(e) = panel.connect(&connector).await {
        log::warn!("[console] initial connect failed: {}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(end) = panel.reap().await {
            log::info!("[console] previous session ended: {:?}", end);
        }

        let command = match console::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match command {
            OperatorCommand::Device(command) => {
                let regulator = match &command {
                    DriverCommand::Regulator(terms) => Some(*terms),
                    _ => None,
                };
                match panel.send(command).await {
                    Ok(CommandOutcome::Sent) => {
                        if let Some(terms) = regulator {
                            settings.regulator = terms;
                            save_settings(&settings, &settings_path);
                        }
                    }
                    Ok(CommandOutcome::Skipped) => println!("System is already homed"),
                    Err(e) => eprintln!("{}", e),
                }
            }
            OperatorCommand::Window(size) => {
                settings.set_view_window(size);
                save_settings(&settings, &settings_path);
                println!("Showing the last {} samples", settings.view_window);
            }
            OperatorCommand::History => {
                let history = emitter.history();
                for sample in history.window(settings.view_window) {
                    println!("{}\t{}\t{}", sample.timestamp, sample.target, sample.actual);
                }
            }
            OperatorCommand::Export(path) => {
                let history = emitter.history();
                let result = match path {
                    Some(path) => history.export_to(&path).map(|_| path),
                    None => history.export_to_dir(&args.export_dir),
                };
                match result {
                    Ok(path) => println!("Exported {} samples to {}", history.len(), path.display()),
                    Err(e) => eprintln!("{}", e),
                }
            }
            OperatorCommand::Connect => {
                if let Err(e) = panel.connect(&connector).await {
                    eprintln!("{}", e);
                }
            }
            OperatorCommand::Disconnect => {
                if panel.disconnect().await.is_none() {
                    println!("Not connected");
                }
            }
            OperatorCommand::Help => println!("{}", console::HELP),
            OperatorCommand::Quit => break,
        }
    }

    panel.disconnect().await;
    Ok(())
}

fn save_settings(settings: &Settings, path: &std::path::Path) {
    if let Err(e) = settings.save(path) {
        log::warn!("[console] {}", e);
    }
}
