//! Engine Events und Hilfstypen
//!
//! Die Typen in diesem Modul beschreiben, was die externe Telefonie-Engine
//! bei jedem `iterate()` meldet. Die Abbildung auf die Session-Zustände
//! passiert in `session`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Handle eines Anrufs innerhalb der Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

// ============================================================================
// ENGINE STATES
// ============================================================================

/// Registrierungs-Status wie ihn die Engine meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRegistrationState {
    None,
    Progress,
    Ok,
    Cleared,
    Failed,
}

/// Call-Status wie ihn die Engine meldet
///
/// Feiner als `CallState`: mehrere Engine-Zustände fallen auf einen
/// Session-Zustand zusammen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCallState {
    IncomingReceived,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    OutgoingEarlyMedia,
    Connected,
    StreamsRunning,
    Pausing,
    Paused,
    PausedByRemote,
    Resuming,
    End,
    Released,
    Error,
}

// ============================================================================
// REMOTE PARTY
// ============================================================================

/// Gegenstelle eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteParty {
    /// SIP-Adresse, z.B. `sip:1001@pbx.example.com`
    pub address: String,
    pub display_name: Option<String>,
}

impl RemoteParty {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// User-Teil der SIP-Adresse (`sip:1001@host` → `1001`)
    pub fn user_part(&self) -> &str {
        let without_scheme = self
            .address
            .strip_prefix("sips:")
            .or_else(|| self.address.strip_prefix("sip:"))
            .unwrap_or(&self.address);
        let user = without_scheme
            .split_once('@')
            .map(|(user, _)| user)
            .unwrap_or(without_scheme);
        user.split(';').next().unwrap_or(user)
    }
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Events die von der Engine pro Iteration ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Registrierungs-Status hat sich geändert
    RegistrationStateChanged {
        state: EngineRegistrationState,
        message: String,
    },

    /// Call-Status hat sich geändert
    CallStateChanged {
        call_id: CallId,
        state: EngineCallState,
        remote: RemoteParty,
        message: String,
    },
}

// ============================================================================
// AUDIO DEVICES
// ============================================================================

/// Art eines Audio-Geräts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDeviceKind {
    Microphone,
    Speaker,
    Earpiece,
    Bluetooth,
}

/// Ein von der Engine gemeldetes Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub kind: AudioDeviceKind,
    pub can_capture: bool,
    pub can_play: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_part() {
        assert_eq!(RemoteParty::new("sip:1001@pbx.example.com").user_part(), "1001");
        assert_eq!(RemoteParty::new("sips:alice@example.com").user_part(), "alice");
        assert_eq!(RemoteParty::new("sip:bob;tag=x").user_part(), "bob");
        assert_eq!(RemoteParty::new("0301234").user_part(), "0301234");
    }
}
