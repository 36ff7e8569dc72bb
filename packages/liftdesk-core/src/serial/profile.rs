//! Protocol profiles
//!
//! The firmware exists in several revisions that disagree on command letters
//! and on whether a handshake is required. Each revision is a named table of
//! tags; the codec and the state machines read everything from the table.

/// How an inbound confirmation record is recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPattern {
    /// The whole (trimmed) record equals the literal
    Exact(String),
    /// The literal appears anywhere in the record as a standalone token
    Token(String),
}

/// Handshake request/ack pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTags {
    pub request: String,
    pub ack: InboundPattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub name: String,
    /// `None` means the session is usable as soon as the port opens
    pub handshake: Option<HandshakeTags>,
    /// Tag for `<tag>:<0..100>` target position commands
    pub target_tag: String,
    /// Full command line (without newline) sent to set the minimum position
    pub set_min: String,
    pub set_max: String,
    pub calibrate: Option<String>,
    pub motor_tag: String,
    pub min_confirm: Vec<InboundPattern>,
    pub max_confirm: Vec<InboundPattern>,
}

/// Built-in profile names, default first.
pub const PROFILE_NAMES: &[&str] = &["handshake", "classic", "tri-confirm"];

impl ProtocolProfile {
    /// Original web panel revision: no handshake, `A:` targets, `H:0`/`H:1`
    /// for homing in both directions.
    pub fn classic() -> Self {
        Self {
            name: "classic".to_string(),
            handshake: None,
            target_tag: "A".to_string(),
            set_min: "H:0".to_string(),
            set_max: "H:1".to_string(),
            calibrate: None,
            motor_tag: "Z".to_string(),
            min_confirm: vec![InboundPattern::Token("H:0".to_string())],
            max_confirm: vec![InboundPattern::Token("H:1".to_string())],
        }
    }

    /// `M`/`N` handshake, `T:` targets, `B`/`C` homing, `D`/`E` confirmations.
    pub fn handshake() -> Self {
        Self {
            name: "handshake".to_string(),
            handshake: Some(HandshakeTags {
                request: "M".to_string(),
                ack: InboundPattern::Exact("N".to_string()),
            }),
            target_tag: "T".to_string(),
            set_min: "B".to_string(),
            set_max: "C".to_string(),
            calibrate: None,
            motor_tag: "Z".to_string(),
            min_confirm: vec![InboundPattern::Exact("D".to_string())],
            max_confirm: vec![InboundPattern::Exact("E".to_string())],
        }
    }

    /// Handshake revision with a separate calibrate command and three
    /// confirmations: `C` min set, `D` max set, `E` homed.
    pub fn tri_confirm() -> Self {
        Self {
            name: "tri-confirm".to_string(),
            calibrate: Some("D".to_string()),
            min_confirm: vec![InboundPattern::Exact("C".to_string())],
            max_confirm: vec![
                InboundPattern::Exact("D".to_string()),
                InboundPattern::Exact("E".to_string()),
            ],
            ..Self::handshake()
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "classic" => Some(Self::classic()),
            "handshake" => Some(Self::handshake()),
            "tri-confirm" => Some(Self::tri_confirm()),
            _ => None,
        }
    }

    pub fn has_handshake(&self) -> bool {
        self.handshake.is_some()
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::handshake()
    }
}
