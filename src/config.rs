//! Konfiguration
//!
//! - `AccountConfig`: SIP-Zugangsdaten, wie sie der Benutzer eingibt
//! - `SessionConfig`: feste Policies des Session-Managers (Takt, Timeouts,
//!   Codecs), überschreibbar über Umgebungsvariablen

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Engine-Takt (die Engine muss häufig gepollt werden)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Maximale Dauer einer Registrierung im Status `Progress`
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Registrierungs-Gültigkeit in Sekunden
pub const DEFAULT_REGISTRATION_EXPIRY: u32 = 3600;

/// Wartezeit nach `Ended`, bevor `Released` synthetisiert wird
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(2);

/// RTP-Inaktivität in Sekunden
pub const DEFAULT_RTP_TIMEOUT_SECS: u32 = 30;

/// Erlaubte Codecs in Prioritäts-Reihenfolge
pub const DEFAULT_CODECS: [&str; 3] = ["opus", "PCMU", "PCMA"];

/// Obergrenzen für Werte aus der Umgebung
const MAX_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
const MAX_RELEASE_GRACE: Duration = Duration::from_secs(3600);

const DEFAULT_SIP_PORT: u16 = 5060;
const DEFAULT_SIPS_PORT: u16 = 5061;

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown transport: {0}")]
pub struct UnknownTransport(pub String);

impl FromStr for Transport {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

// ============================================================================
// ACCOUNT CONFIG
// ============================================================================

/// SIP-Account, wie er vom Benutzer eingegeben wird
///
/// Ein leerer Username oder eine leere Domain bedeutet "abmelden".
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    pub domain: String,
    /// 0 = Standard-Port des Transports
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
}

impl AccountConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            port: 0,
            transport: Transport::Udp,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Leere Konfiguration = Abmeldung
    pub fn is_empty(&self) -> bool {
        self.username.trim().is_empty() || self.domain.trim().is_empty()
    }

    /// Effektiver Port (Standard-Port falls 0)
    pub fn effective_port(&self) -> u16 {
        match (self.port, self.transport) {
            (0, Transport::Tls) => DEFAULT_SIPS_PORT,
            (0, _) => DEFAULT_SIP_PORT,
            (port, _) => port,
        }
    }

    /// `sip:user@domain`
    pub fn identity(&self) -> String {
        format!("sip:{}@{}", self.username.trim(), self.domain.trim())
    }

    /// `sip:domain:port;transport=udp`
    pub fn server_address(&self) -> String {
        format!(
            "sip:{}:{};transport={}",
            self.domain.trim(),
            self.effective_port(),
            self.transport
        )
    }
}

// Passwort nie in Logs
impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .finish()
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Policies des Session-Managers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub registration_timeout: Duration,
    pub registration_expiry: u32,
    pub release_grace: Duration,
    /// Erlaubte Codecs in Prioritäts-Reihenfolge; alle anderen werden deaktiviert
    pub codecs: Vec<String>,
    pub stun_server: Option<String>,
    pub rtp_timeout_secs: u32,
    pub command_queue_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            registration_expiry: DEFAULT_REGISTRATION_EXPIRY,
            release_grace: DEFAULT_RELEASE_GRACE,
            codecs: DEFAULT_CODECS.iter().map(|c| c.to_string()).collect(),
            stun_server: None,
            rtp_timeout_secs: DEFAULT_RTP_TIMEOUT_SECS,
            command_queue_capacity: 64,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Standardwerte, überschrieben durch Umgebungsvariablen
    ///
    /// - `SIP_POLL_INTERVAL_MS`
    /// - `SIP_REGISTRATION_TIMEOUT_SECS`
    /// - `SIP_REGISTRATION_EXPIRY_SECS`
    /// - `SIP_RELEASE_GRACE_MS`
    /// - `SIP_CODECS` (kommagetrennt)
    /// - `SIP_STUN_SERVER`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                    None
                }
            }
        };

        if let Some(ms) = number("SIP_POLL_INTERVAL_MS").filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = number("SIP_REGISTRATION_TIMEOUT_SECS") {
            config.registration_timeout = clamped(
                "SIP_REGISTRATION_TIMEOUT_SECS",
                Duration::from_secs(secs),
                MAX_REGISTRATION_TIMEOUT,
            );
        }
        if let Some(secs) = number("SIP_REGISTRATION_EXPIRY_SECS") {
            config.registration_expiry = u32::try_from(secs).unwrap_or(u32::MAX);
        }
        if let Some(ms) = number("SIP_RELEASE_GRACE_MS") {
            config.release_grace =
                clamped("SIP_RELEASE_GRACE_MS", Duration::from_millis(ms), MAX_RELEASE_GRACE);
        }
        if let Some(codecs) = lookup("SIP_CODECS") {
            let codecs: Vec<String> = codecs
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            if !codecs.is_empty() {
                config.codecs = codecs;
            }
        }
        if let Some(stun) = lookup("SIP_STUN_SERVER").filter(|s| !s.trim().is_empty()) {
            config.stun_server = Some(stun.trim().to_string());
        }

        config
    }
}

fn clamped(key: &str, value: Duration, max: Duration) -> Duration {
    if value > max {
        tracing::warn!("{} too large ({:?}), using {:?}", key, value, max);
        max
    } else {
        value
    }
}

// ============================================================================
// TESTS
// ============================================================================
