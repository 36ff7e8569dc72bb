//! Operator console command parsing
//!
//! One command per stdin line, e.g. `target 50`, `motor on`, `psd 1.5 20 0.3`.

use liftdesk_core::serial::DriverCommand;
use liftdesk_core::RegulatorTerms;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Forward to the running driver
    Device(DriverCommand),
    /// Set and persist the number of samples `history` shows
    Window(u32),
    /// Print the samples in the current window
    History,
    /// Write the full history as CSV; `None` uses the default file name
    Export(Option<PathBuf>),
    Connect,
    Disconnect,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  target <0-100>      move to a target position
  set                 next homing step (min, then max)
  min | max           send the min/max position command directly
  calibrate           start calibration (tri-confirm profile)
  motor on|off        switch the motor
  psd <p> <s> <d>     send regulator terms (each 0-200)
  window <1-1000>     samples shown by `history`
  history             show recent samples
  export [path]       write all samples as CSV
  connect | disconnect
  help | quit";

pub fn parse(line: &str) -> Result<OperatorCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let command = match head.to_ascii_lowercase().as_str() {
        "target" | "t" => {
            let value = single_arg(head, &args)?;
            let percent: u8 = value
                .parse()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| format!("target must be 0-100, got {}", value))?;
            OperatorCommand::Device(DriverCommand::SetTarget(percent))
        }
        "set" => OperatorCommand::Device(DriverCommand::SetPosition),
        "min" => OperatorCommand::Device(DriverCommand::SetMin),
        "max" => OperatorCommand::Device(DriverCommand::SetMax),
        "calibrate" => OperatorCommand::Device(DriverCommand::Calibrate),
        "motor" => match single_arg(head, &args)? {
            "on" | "1" => OperatorCommand::Device(DriverCommand::Motor(true)),
            "off" | "0" => OperatorCommand::Device(DriverCommand::Motor(false)),
            other => return Err(format!("motor takes on or off, got {}", other)),
        },
        "psd" => {
            if args.len() != 3 {
                return Err("psd takes three values: psd <p> <s> <d>".to_string());
            }
            let mut values = [0.0; 3];
            for (slot, raw) in values.iter_mut().zip(&args) {
                *slot = raw
                    .parse::<f64>()
                    .map_err(|_| format!("not a number: {}", raw))?;
            }
            OperatorCommand::Device(DriverCommand::Regulator(RegulatorTerms::new(
                values[0], values[1], values[2],
            )))
        }
        "window" => {
            let value = single_arg(head, &args)?;
            let size = value
                .parse::<u32>()
                .map_err(|_| format!("window must be a positive number, got {}", value))?;
            OperatorCommand::Window(size)
        }
        "history" => OperatorCommand::History,
        "export" => match args.as_slice() {
            [] => OperatorCommand::Export(None),
            [path] => OperatorCommand::Export(Some(PathBuf::from(*path))),
            _ => return Err("export takes at most one path".to_string()),
        },
        "connect" => OperatorCommand::Connect,
        "disconnect" => OperatorCommand::Disconnect,
        "help" | "?" => OperatorCommand::Help,
        "quit" | "exit" | "q" => OperatorCommand::Quit,
        other => return Err(format!("unknown command: {} (try help)", other)),
    };
    Ok(command)
}

fn single_arg<'a>(head: &str, args: &[&'a str]) -> Result<&'a str, String> {
    match args {
        [value] => Ok(*value),
        _ => Err(format!("{} takes exactly one value", head)),
    }
}
