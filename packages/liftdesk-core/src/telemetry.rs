//! Telemetry history and CSV export

use crate::serial::RegulatorKind;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_VIEW_WINDOW: u32 = 100;
pub const MAX_VIEW_WINDOW: u32 = 1000;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("No data to export")]
    Empty,
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Last regulator telemetry reported by the device, per term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegulatorSnapshot {
    pub p: Option<f64>,
    pub s: Option<f64>,
    pub d: Option<f64>,
    pub x: Option<f64>,
}

impl RegulatorSnapshot {
    pub fn set(&mut self, which: RegulatorKind, value: f64) {
        let slot = match which {
            RegulatorKind::P => &mut self.p,
            RegulatorKind::S => &mut self.s,
            RegulatorKind::D => &mut self.d,
            RegulatorKind::X => &mut self.x,
        };
        *slot = Some(value);
    }

    pub fn get(&self, which: RegulatorKind) -> Option<f64> {
        match which {
            RegulatorKind::P => self.p,
            RegulatorKind::S => self.s,
            RegulatorKind::D => self.d,
            RegulatorKind::X => self.x,
        }
    }

    pub fn is_empty(&self) -> bool {
        RegulatorKind::ALL.iter().all(|k| self.get(*k).is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// RFC 3339, UTC
    pub timestamp: String,
    pub target: f64,
    pub actual: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regulator: Option<RegulatorSnapshot>,
}

impl TelemetrySample {
    pub fn at(now: DateTime<Utc>, target: f64, actual: f64, regulator: RegulatorSnapshot) -> Self {
        Self {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            target,
            actual,
            regulator: (!regulator.is_empty()).then_some(regulator),
        }
    }

    pub fn now(target: f64, actual: f64, regulator: RegulatorSnapshot) -> Self {
        Self::at(Utc::now(), target, actual, regulator)
    }
}

/// Append-only sample history.
#[derive(Debug, Default, Clone)]
pub struct TelemetryHistory {
    samples: Vec<TelemetrySample>,
}

impl TelemetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[TelemetrySample] {
        &self.samples
    }

    /// The most recent `size` samples (clamped to 1..=1000).
    pub fn window(&self, size: u32) -> &[TelemetrySample] {
        let size = clamp_view_window(size) as usize;
        let start = self.samples.len().saturating_sub(size);
        &self.samples[start..]
    }

    pub fn to_csv(&self) -> Result<String, TelemetryError> {
        if self.samples.is_empty() {
            return Err(TelemetryError::Empty);
        }

        let with_regulator = self.samples.iter().any(|s| s.regulator.is_some());
        let mut csv = String::from("Timestamp,Target,Actual");
        if with_regulator {
            csv.push_str(",P,S,D,X");
        }
        csv.push('\n');

        for sample in &self.samples {
            let _ = write!(csv, "{},{},{}", sample.timestamp, sample.target, sample.actual);
            if with_regulator {
                let snapshot = sample.regulator.unwrap_or_default();
                for which in RegulatorKind::ALL {
                    match snapshot.get(which) {
                        Some(v) => {
                            let _ = write!(csv, ",{}", v);
                        }
                        None => csv.push(','),
                    }
                }
            }
            csv.push('\n');
        }
        Ok(csv)
    }

    /// Write the history as CSV into `dir` under the default file name.
    pub fn export_to_dir(&self, dir: &Path) -> Result<PathBuf, TelemetryError> {
        let path = dir.join(default_export_file_name(Utc::now()));
        self.export_to(&path)?;
        Ok(path)
    }

    pub fn export_to(&self, path: &Path) -> Result<(), TelemetryError> {
        let csv = self.to_csv()?;
        std::fs::write(path, csv).map_err(|source| TelemetryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("[telemetry] exported {} samples to {}", self.len(), path.display());
        Ok(())
    }
}

pub fn clamp_view_window(size: u32) -> u32 {
    size.clamp(1, MAX_VIEW_WINDOW)
}

/// `angle_data_2024-05-01T10-20-30.123Z.csv`
pub fn default_export_file_name(now: DateTime<Utc>) -> String {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true).replace(':', "-");
    format!("angle_data_{}.csv", stamp)
}
