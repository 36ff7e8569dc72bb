pub mod serial;
pub mod settings;
pub mod telemetry;

use serde::{Deserialize, Serialize};

pub use serial::{HomingState, RegulatorKind};
pub use telemetry::TelemetrySample;

/// Baud rate the actuator firmware listens on
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Upper bound the firmware accepts for each regulator term
pub const REGULATOR_TERM_MAX: f64 = 200.0;

// ============================================
// Connection status (what the operator sees)
// ============================================

/// Connection status shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Device lost, reader closed, or no data within the staleness threshold
    ConnectionLost,
    HandshakeFailed,
    Disconnected,
}

impl ConnectionStatus {
    pub fn display_text(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::ConnectionLost => "Connection lost",
            ConnectionStatus::HandshakeFailed => "Handshake failed",
            ConnectionStatus::Disconnected => "Disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_text())
    }
}

// ============================================
// Panel events (adapter payloads)
// ============================================

/// Events the driver pushes to whatever renders the panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum PanelEvent {
    /// Handshake done, the device accepts commands
    Ready,
    Height { value: f64, display: String },
    Angle { value: f64, display: String },
    Regulator { which: RegulatorKind, value: f64 },
    Homing { state: HomingState },
    Motor { on: bool },
    Sample(TelemetrySample),
}

/// Format a percent reading the way the panel displays it (`42.5%`).
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

// ============================================
// Regulator terms
// ============================================

/// Operator-set regulator terms sent as `P:`, `S:` and `D:` lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegulatorTerms {
    pub p: f64,
    pub s: f64,
    pub d: f64,
}

impl RegulatorTerms {
    pub fn new(p: f64, s: f64, d: f64) -> Self {
        Self { p, s, d }.clamped()
    }

    /// Clamp every term into `0..=REGULATOR_TERM_MAX`. NaN becomes 0.
    pub fn clamped(self) -> Self {
        fn clamp(v: f64) -> f64 {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, REGULATOR_TERM_MAX)
            }
        }
        Self {
            p: clamp(self.p),
            s: clamp(self.s),
            d: clamp(self.d),
        }
    }
}

impl Default for RegulatorTerms {
    fn default() -> Self {
        Self {
            p: 0.0,
            s: 0.0,
            d: 0.0,
        }
    }
}
