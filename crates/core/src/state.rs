use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the external messaging session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    NotConnected,
    Connecting,
    Restoring,
    Open,
    AuthError,
    Timeout,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Connecting => "connecting",
            Self::Restoring => "restoring",
            Self::Open => "open",
            Self::AuthError => "auth_error",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    /// Phases in which a scannable pairing code may be held.
    pub fn admits_pairing_code(&self) -> bool {
        matches!(self, Self::Connecting | Self::Restoring)
    }

    /// Map a backend `state` string onto a phase.
    ///
    /// The backend also reports transport-level words such as `disconnected`
    /// or `close`; those mean the session is gone. Anything unrecognised is
    /// treated as an error state rather than silently as connected.
    pub fn from_wire(state: &str) -> Self {
        match state.parse() {
            Ok(phase) => phase,
            Err(UnknownPhase(_)) => match state.trim().to_ascii_lowercase().as_str() {
                "disconnected" | "close" | "closed" | "logged_out" => Self::NotConnected,
                _ => Self::Error,
            },
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session phase: {0}")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "not_connected" => Ok(Self::NotConnected),
            "connecting" => Ok(Self::Connecting),
            "restoring" => Ok(Self::Restoring),
            "open" => Ok(Self::Open),
            "auth_error" => Ok(Self::AuthError),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// Opaque QR-equivalent payload used to pair a new device.
///
/// The contents are never logged; `Debug` only reports the length.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    /// Returns `None` for an empty payload, which the backend uses to mean
    /// "no code yet".
    pub fn new(code: impl Into<String>) -> Option<Self> {
        let code = code.into();
        if code.is_empty() { None } else { Some(Self(code)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingCode(<{} bytes>)", self.0.len())
    }
}

/// A single committed (or proposed) view of the session.
///
/// Proposals may arrive with inconsistent fields because they are built
/// independently by the fetcher, the push channel and commands. Call
/// [`ConnectionState::normalized`] to obtain the canonical form: the phase
/// always wins over `is_connected`, and a pairing code only survives in the
/// phases that admit one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub phase: Phase,
    pub pairing_code: Option<PairingCode>,
}

impl ConnectionState {
    pub fn new(phase: Phase, pairing_code: Option<PairingCode>) -> Self {
        Self {
            is_connected: phase == Phase::Open,
            phase,
            pairing_code,
        }
        .normalized()
    }

    pub fn not_connected() -> Self {
        Self::new(Phase::NotConnected, None)
    }

    pub fn open() -> Self {
        Self::new(Phase::Open, None)
    }

    pub fn connecting(pairing_code: Option<PairingCode>) -> Self {
        Self::new(Phase::Connecting, pairing_code)
    }

    /// Build a state exactly as a collaborator reported it, without
    /// normalisation.
    pub fn reported(is_connected: bool, phase: Phase, pairing_code: Option<PairingCode>) -> Self {
        Self {
            is_connected,
            phase,
            pairing_code,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.is_connected = self.phase == Phase::Open;
        if !self.phase.admits_pairing_code() {
            self.pairing_code = None;
        }
        self
    }

    pub fn is_normalized(&self) -> bool {
        self.is_connected == (self.phase == Phase::Open)
            && (self.pairing_code.is_none() || self.phase.admits_pairing_code())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (connected: {}, pairing code: {})",
            self.phase,
            self.is_connected,
            if self.pairing_code.is_some() { "yes" } else { "no" }
        )
    }
}

/// The bounded polling loops the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    /// Waiting for a brand-new pairing to complete.
    Connection,
    /// Waiting for a previously paired session to resume.
    Restoration,
    /// Following the progress of a bulk message campaign.
    Campaign,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Restoration => "restoration",
            Self::Campaign => "campaign",
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStopReason {
    /// The stop predicate matched.
    Settled,
    /// The attempt ceiling was reached.
    Exhausted,
    /// The credential was rejected mid-poll.
    Unauthorized,
    /// Cancelled by its owner (supersession, connect, disconnect, push update, teardown).
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(value: &str) -> Option<PairingCode> {
        PairingCode::new(value)
    }

    #[test]
    fn phase_wins_over_reported_connected_flag() {
        let state = ConnectionState::reported(true, Phase::NotConnected, None).normalized();
        assert!(!state.is_connected);
        assert_eq!(state.phase, Phase::NotConnected);

        let state = ConnectionState::reported(false, Phase::Open, None).normalized();
        assert!(state.is_connected);
    }

    #[test]
    fn pairing_code_cleared_outside_pairing_phases() {
        for phase in [
            Phase::NotConnected,
            Phase::Open,
            Phase::AuthError,
            Phase::Timeout,
            Phase::Error,
        ] {
            let state = ConnectionState::reported(false, phase, code("2@abc")).normalized();
            assert!(state.pairing_code.is_none(), "{phase} kept a pairing code");
        }

        let state = ConnectionState::reported(false, Phase::Restoring, code("2@abc")).normalized();
        assert_eq!(state.pairing_code, code("2@abc"));
    }

    #[test]
    fn empty_pairing_code_is_absent() {
        assert!(PairingCode::new("").is_none());
    }

    #[test]
    fn pairing_code_debug_hides_contents() {
        let code = PairingCode::new("2@secret-payload").unwrap();
        let rendered = format!("{code:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("16 bytes"));
    }

    #[test]
    fn wire_states_parse() {
        assert_eq!(Phase::from_wire("not_connected"), Phase::NotConnected);
        assert_eq!(Phase::from_wire("restoring"), Phase::Restoring);
        assert_eq!(Phase::from_wire("OPEN"), Phase::Open);
        assert_eq!(Phase::from_wire("auth_error"), Phase::AuthError);
        assert_eq!(Phase::from_wire("disconnected"), Phase::NotConnected);
        assert_eq!(Phase::from_wire("mystery"), Phase::Error);
    }

    #[test]
    fn phase_serializes_as_snake_case() {
        let json = serde_json::to_string(&Phase::AuthError).unwrap();
        assert_eq!(json, "\"auth_error\"");
    }
}
