//! Encoder and decoder for the actuator line protocol
//!
//! Outbound: one ASCII command per line, `\n` terminated, no other framing.
//! Inbound records are matched against an ordered list of independent
//! patterns. Matching is non-exclusive: a record yields one event for every
//! pattern it satisfies.
//!
//! - `HEIGHT:42.5` - current height percent
//! - `A:12.0` - current angle
//! - `P:1.5` / `S:..` / `D:..` / `X:..` - regulator telemetry
//! - `Z:0` / `Z:1` - motor status
//! - handshake ack and homing confirmations come from the profile

use super::profile::{InboundPattern, ProtocolProfile};
use crate::RegulatorTerms;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Target position {0} is out of range (0-100)")]
    TargetOutOfRange(u8),
    #[error("Command {command} is not supported by the {profile} protocol profile")]
    Unsupported {
        command: &'static str,
        profile: String,
    },
    #[error("Invalid pattern for profile {profile}: {message}")]
    Pattern { profile: String, message: String },
}

/// Regulator term identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegulatorKind {
    P,
    S,
    D,
    X,
}

impl RegulatorKind {
    pub const ALL: [RegulatorKind; 4] = [
        RegulatorKind::P,
        RegulatorKind::S,
        RegulatorKind::D,
        RegulatorKind::X,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            RegulatorKind::P => "P",
            RegulatorKind::S => "S",
            RegulatorKind::D => "D",
            RegulatorKind::X => "X",
        }
    }
}

/// Events decoded from one inbound record
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    HandshakeAck,
    HeightReading { value: f64 },
    AngleReading { value: f64 },
    RegulatorTerm { which: RegulatorKind, value: f64 },
    MinPositionConfirmed,
    MaxPositionConfirmed,
    MotorStatus { on: bool },
    /// Nothing matched; surfaced for logging only
    Unrecognized { raw: String },
}

/// Commands the panel can send
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Handshake,
    SetTarget(u8),
    SetMin,
    SetMax,
    Calibrate,
    Motor(bool),
    Regulator { which: RegulatorKind, value: f64 },
}

impl Command {
    /// Target position command, rejecting values above 100.
    pub fn set_target(percent: u8) -> Result<Self, CodecError> {
        if percent > 100 {
            return Err(CodecError::TargetOutOfRange(percent));
        }
        Ok(Command::SetTarget(percent))
    }

    /// The three lines sent when the operator applies regulator terms.
    pub fn regulator_burst(terms: &RegulatorTerms) -> [Command; 3] {
        [
            Command::Regulator {
                which: RegulatorKind::P,
                value: terms.p,
            },
            Command::Regulator {
                which: RegulatorKind::S,
                value: terms.s,
            },
            Command::Regulator {
                which: RegulatorKind::D,
                value: terms.d,
            },
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake => "handshake",
            Command::SetTarget(_) => "set-target",
            Command::SetMin => "set-min",
            Command::SetMax => "set-max",
            Command::Calibrate => "calibrate",
            Command::Motor(_) => "motor",
            Command::Regulator { .. } => "regulator",
        }
    }

    /// Encode into a single newline-terminated wire line.
    pub fn encode(&self, profile: &ProtocolProfile) -> Result<String, CodecError> {
        let body = match self {
            Command::Handshake => match &profile.handshake {
                Some(tags) => tags.request.clone(),
                None => return Err(self.unsupported(profile)),
            },
            Command::SetTarget(percent) => {
                if *percent > 100 {
                    return Err(CodecError::TargetOutOfRange(*percent));
                }
                format!("{}:{}", profile.target_tag, percent)
            }
            Command::SetMin => profile.set_min.clone(),
            Command::SetMax => profile.set_max.clone(),
            Command::Calibrate => match &profile.calibrate {
                Some(cmd) => cmd.clone(),
                None => return Err(self.unsupported(profile)),
            },
            Command::Motor(on) => format!("{}:{}", profile.motor_tag, if *on { 1 } else { 0 }),
            Command::Regulator { which, value } => format!("{}:{}", which.tag(), value),
        };
        Ok(format!("{}\n", body))
    }

    fn unsupported(&self, profile: &ProtocolProfile) -> CodecError {
        CodecError::Unsupported {
            command: self.name(),
            profile: profile.name.clone(),
        }
    }
}

// ============================================
// Decoder
// ============================================

#[derive(Debug, Clone, Copy)]
enum MatcherKind {
    Ack,
    Height,
    Angle,
    Regulator(RegulatorKind),
    MinConfirm,
    MaxConfirm,
    Motor,
}

#[derive(Debug)]
struct Matcher {
    kind: MatcherKind,
    regex: Regex,
}

impl Matcher {
    fn apply(&self, record: &str) -> Option<ProtocolEvent> {
        let caps = self.regex.captures(record)?;
        match self.kind {
            MatcherKind::Ack => Some(ProtocolEvent::HandshakeAck),
            MatcherKind::MinConfirm => Some(ProtocolEvent::MinPositionConfirmed),
            MatcherKind::MaxConfirm => Some(ProtocolEvent::MaxPositionConfirmed),
            MatcherKind::Height => {
                parse_number(caps.get(1)?.as_str()).map(|value| ProtocolEvent::HeightReading { value })
            }
            MatcherKind::Angle => {
                parse_number(caps.get(1)?.as_str()).map(|value| ProtocolEvent::AngleReading { value })
            }
            MatcherKind::Regulator(which) => parse_number(caps.get(1)?.as_str())
                .map(|value| ProtocolEvent::RegulatorTerm { which, value }),
            MatcherKind::Motor => match caps.get(1)?.as_str() {
                "0" => Some(ProtocolEvent::MotorStatus { on: false }),
                "1" => Some(ProtocolEvent::MotorStatus { on: true }),
                _ => None,
            },
        }
    }
}

/// Parse a numeric payload; anything non-finite counts as no match.
fn parse_number(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

const NUMBER: &str = r"(-?\d+(?:\.\d+)?)";

fn pattern_regex(pattern: &InboundPattern) -> String {
    match pattern {
        InboundPattern::Exact(lit) => format!("^{}$", regex::escape(lit)),
        InboundPattern::Token(lit) => format!(r"(?:^|[^\w]){}(?:[^\w.]|$)", regex::escape(lit)),
    }
}

/// Stateless record decoder built from a profile.
#[derive(Debug)]
pub struct Decoder {
    matchers: Vec<Matcher>,
    ack: Option<Regex>,
}

impl Decoder {
    pub fn new(profile: &ProtocolProfile) -> Result<Self, CodecError> {
        let compile = |source: &str| {
            Regex::new(source).map_err(|e| CodecError::Pattern {
                profile: profile.name.clone(),
                message: e.to_string(),
            })
        };

        let mut specs: Vec<(MatcherKind, String)> = vec![
            (MatcherKind::Height, format!(r"\bHEIGHT:{}", NUMBER)),
            (MatcherKind::Angle, format!(r"\bA:{}", NUMBER)),
        ];
        for which in RegulatorKind::ALL {
            specs.push((
                MatcherKind::Regulator(which),
                format!(r"\b{}:{}", which.tag(), NUMBER),
            ));
        }
        specs.push((
            MatcherKind::Motor,
            format!(r"\b{}:([01])\b", regex::escape(&profile.motor_tag)),
        ));
        for pattern in &profile.min_confirm {
            specs.push((MatcherKind::MinConfirm, pattern_regex(pattern)));
        }
        for pattern in &profile.max_confirm {
            specs.push((MatcherKind::MaxConfirm, pattern_regex(pattern)));
        }

        let ack = match &profile.handshake {
            Some(tags) => {
                let source = pattern_regex(&tags.ack);
                specs.push((MatcherKind::Ack, source.clone()));
                Some(compile(&source)?)
            }
            None => None,
        };

        let mut matchers = Vec::with_capacity(specs.len());
        for (kind, source) in specs {
            matchers.push(Matcher {
                kind,
                regex: compile(&source)?,
            });
        }

        Ok(Self { matchers, ack })
    }

    /// Apply every matcher to the record.
    ///
    /// Returns `[Unrecognized]` when nothing matched. Several confirmation
    /// patterns of the same kind collapse into one event.
    pub fn decode(&self, record: &str) -> Vec<ProtocolEvent> {
        let mut events: Vec<ProtocolEvent> = Vec::new();
        for matcher in &self.matchers {
            if let Some(event) = matcher.apply(record) {
                if !events.contains(&event) {
                    events.push(event);
                }
            }
        }

        if events.is_empty() {
            events.push(ProtocolEvent::Unrecognized {
                raw: record.to_string(),
            });
        }
        events
    }

    /// Whether the record is the handshake acknowledgement.
    pub fn is_ack(&self, record: &str) -> bool {
        self.ack.as_ref().is_some_and(|re| re.is_match(record))
    }
}
