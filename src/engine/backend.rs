//! Telephony Engine Trait
//!
//! Schnittstelle zur externen SIP/RTP-Engine, gruppiert nach Fähigkeiten:
//! Lifecycle, Account/Registrierung, Calls, Audio-Geräte, Codecs und Events.
//!
//! Implementierungen müssen nicht thread-safe sein. Der `EngineAdapter`
//! besitzt die Engine exklusiv und ruft sie nur vom Dispatcher-Thread auf.

use super::events::{AudioDevice, CallId, EngineEvent};
use crate::config::Transport;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler, den die Engine selbst meldet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// CONFIG ENTRIES
// ============================================================================

/// Auth-Eintrag für Digest-Authentifizierung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub password: String,
    pub domain: String,
}

/// Proxy-/Registrierungs-Eintrag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Identität, z.B. `sip:alice@pbx.example.com`
    pub identity: String,
    /// Server-Adresse, z.B. `sip:pbx.example.com:5060;transport=udp`
    pub server_address: String,
    pub transport: Transport,
    /// Registrierungs-Gültigkeit in Sekunden
    pub expires: u32,
    pub register_enabled: bool,
}

/// Netzwerk-Policy, die beim Start gesetzt wird
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkPolicy {
    pub stun_server: Option<String>,
    /// RTP-Inaktivität in Sekunden, nach der die Engine den Call beendet
    pub rtp_timeout_secs: u32,
}

// ============================================================================
// ENGINE TRAIT
// ============================================================================

/// Fähigkeiten der externen Telefonie-Engine
pub trait TelephonyEngine {
    // Lifecycle
    fn create(&mut self) -> BackendResult<()>;
    fn start(&mut self) -> BackendResult<()>;
    fn stop(&mut self);
    /// Eine Iteration der Engine; liefert die Events in Emissions-Reihenfolge
    fn iterate(&mut self) -> Vec<EngineEvent>;
    fn set_network_policy(&mut self, policy: &NetworkPolicy) -> BackendResult<()>;

    // Account / Registrierung
    fn add_auth_info(&mut self, auth: AuthInfo) -> BackendResult<()>;
    fn clear_auth_info(&mut self) -> BackendResult<()>;
    fn proxy_count(&self) -> usize;
    fn add_proxy_config(&mut self, proxy: ProxyConfig) -> BackendResult<()>;
    fn clear_proxy_configs(&mut self) -> BackendResult<()>;
    fn set_register_enabled(&mut self, enabled: bool) -> BackendResult<()>;
    fn refresh_registrations(&mut self) -> BackendResult<()>;

    // Calls
    fn invite(&mut self, address: &str) -> BackendResult<CallId>;
    fn accept(&mut self, call: CallId) -> BackendResult<()>;
    fn terminate(&mut self, call: CallId) -> BackendResult<()>;
    fn set_mic_enabled(&mut self, enabled: bool) -> BackendResult<()>;

    // Audio-Geräte
    fn audio_devices(&self) -> Vec<AudioDevice>;
    fn set_input_device(&mut self, device_id: &str) -> BackendResult<()>;
    fn set_output_device(&mut self, device_id: &str) -> BackendResult<()>;

    // Codecs
    fn codec_names(&self) -> Vec<String>;
    fn set_codec_enabled(&mut self, name: &str, enabled: bool) -> BackendResult<()>;
    /// Setzt die Prioritäts-Reihenfolge der aktivierten Codecs
    fn set_codec_order(&mut self, names: &[String]) -> BackendResult<()>;
}
