mod console;
mod panel;

use clap::{Parser, Subcommand};
use liftdesk_core::serial::list_ports;

#[derive(Parser)]
#[command(
    name = "liftdesk",
    about = "Liftdesk operator console for serial actuators"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Connect to an actuator and drive it from stdin
    Panel(panel::PanelArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ports => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                match port.description {
                    Some(desc) => println!("{}\t{}\t{}", port.name, port.kind, desc),
                    None => println!("{}\t{}", port.name, port.kind),
                }
            }
        }
        Commands::Panel(args) => {
            panel::run(args).await?;
        }
    }
    Ok(())
}
