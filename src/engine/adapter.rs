//! Engine Adapter
//!
//! Synchrone Fassade über einer `TelephonyEngine`. Der Adapter besitzt die
//! Engine exklusiv; alle Aufrufe laufen über `&mut self` und damit über den
//! einen Thread, der auch `step()` aufruft.

use super::backend::{AuthInfo, BackendError, NetworkPolicy, ProxyConfig, TelephonyEngine};
use super::events::{AudioDevice, AudioDeviceKind, CallId, EngineEvent, EngineRegistrationState};
use crate::config::{AccountConfig, SessionConfig};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Not registered")]
    NotRegistered,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl EngineError {
    fn op(operation: &'static str) -> impl FnOnce(BackendError) -> EngineError {
        move |e| EngineError::Operation {
            operation,
            message: e.0,
        }
    }

    /// Fatal = Engine muss neu initialisiert werden
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::NotInitialized)
    }
}

// ============================================================================
// ENGINE ADAPTER
// ============================================================================

pub struct EngineAdapter {
    engine: Box<dyn TelephonyEngine + Send>,
    initialized: bool,
    registered: bool,
    domain: Option<String>,
    codecs: Vec<String>,
    network: NetworkPolicy,
    registration_expiry: u32,
}

impl EngineAdapter {
    pub fn new(engine: Box<dyn TelephonyEngine + Send>, config: &SessionConfig) -> Self {
        Self {
            engine,
            initialized: false,
            registered: false,
            domain: None,
            codecs: config.codecs.clone(),
            network: NetworkPolicy {
                stun_server: config.stun_server.clone(),
                rtp_timeout_secs: config.rtp_timeout_secs,
            },
            registration_expiry: config.registration_expiry,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Letzter von der Engine gemeldeter Registrierungs-Status war `Ok`
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Erstellt die Engine, setzt Codec- und Netzwerk-Policy und startet sie
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Err(EngineError::AlreadyInitialized);
        }

        self.engine.create().map_err(EngineError::op("create"))?;
        self.apply_codec_policy()?;
        self.engine
            .set_network_policy(&self.network)
            .map_err(EngineError::op("set_network_policy"))?;
        self.engine.start().map_err(EngineError::op("start"))?;

        self.initialized = true;
        tracing::info!("Engine initialized (codecs: {:?})", self.codecs);
        Ok(())
    }

    /// Stoppt die Engine
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.engine.stop();
        self.initialized = false;
        self.registered = false;
        tracing::info!("Engine stopped");
    }

    /// Eine Engine-Iteration; liefert die Events in Emissions-Reihenfolge
    pub fn step(&mut self) -> Vec<EngineEvent> {
        if !self.initialized {
            return Vec::new();
        }

        let events = self.engine.iterate();
        for event in &events {
            match event {
                EngineEvent::RegistrationStateChanged {
                    state: EngineRegistrationState::Ok,
                    ..
                } => self.registered = true,
                // Refresh einer bestehenden Registrierung
                EngineEvent::RegistrationStateChanged {
                    state: EngineRegistrationState::Progress,
                    ..
                } => {}
                EngineEvent::RegistrationStateChanged { .. } => self.registered = false,
                EngineEvent::CallStateChanged { .. } => {}
            }
        }
        events
    }

    /// Aktiviert die Codecs der Allow-List in fester Reihenfolge, deaktiviert den Rest
    fn apply_codec_policy(&mut self) -> Result<(), EngineError> {
        let available = self.engine.codec_names();

        let mut enabled = Vec::new();
        for wanted in &self.codecs {
            match available.iter().find(|c| c.eq_ignore_ascii_case(wanted)) {
                Some(name) => enabled.push(name.clone()),
                None => tracing::warn!("Codec {} not offered by engine", wanted),
            }
        }

        for name in &available {
            let on = enabled.contains(name);
            self.engine
                .set_codec_enabled(name, on)
                .map_err(EngineError::op("set_codec_enabled"))?;
        }

        self.engine
            .set_codec_order(&enabled)
            .map_err(EngineError::op("set_codec_order"))
    }

    // ========================================================================
    // ACCOUNT
    // ========================================================================

    /// Ersetzt den Account atomar
    ///
    /// Alte Auth-/Proxy-Einträge werden vollständig entfernt, bevor neue
    /// hinzugefügt werden. Ein leerer Account endet nach dem Entfernen.
    pub fn configure_account(&mut self, account: &AccountConfig) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.retract_account()?;

        if account.is_empty() {
            tracing::info!("Account cleared");
            return Ok(());
        }

        self.engine
            .add_auth_info(AuthInfo {
                username: account.username.trim().to_string(),
                password: account.password.clone(),
                domain: account.domain.trim().to_string(),
            })
            .map_err(EngineError::op("add_auth_info"))?;

        let proxy = ProxyConfig {
            identity: account.identity(),
            server_address: account.server_address(),
            transport: account.transport,
            expires: self.registration_expiry,
            register_enabled: true,
        };

        if let Err(e) = self.engine.add_proxy_config(proxy) {
            // Keine halbe Konfiguration zurücklassen
            if let Err(rollback) = self.engine.clear_auth_info() {
                tracing::warn!("Failed to roll back auth info: {}", rollback);
            }
            return Err(EngineError::op("add_proxy_config")(e));
        }

        self.domain = Some(account.domain.trim().to_string());
        tracing::info!("Account configured: {}", account.identity());
        Ok(())
    }

    fn retract_account(&mut self) -> Result<(), EngineError> {
        self.engine
            .clear_proxy_configs()
            .map_err(EngineError::op("clear_proxy_configs"))?;
        self.engine
            .clear_auth_info()
            .map_err(EngineError::op("clear_auth_info"))?;
        self.domain = None;
        self.registered = false;
        Ok(())
    }

    /// Registrierung des installierten Proxy-Eintrags an-/abschalten
    pub fn set_registration_enabled(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        if self.engine.proxy_count() == 0 {
            return Ok(());
        }
        if !enabled {
            self.registered = false;
        }
        self.engine
            .set_register_enabled(enabled)
            .map_err(EngineError::op("set_register_enabled"))
    }

    /// Sendet ein erneutes REGISTER
    pub fn refresh_registration(&mut self) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.engine
            .refresh_registrations()
            .map_err(EngineError::op("refresh_registrations"))
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    pub fn originate_call(&mut self, address: &str) -> Result<CallId, EngineError> {
        self.ensure_initialized()?;
        if !self.registered {
            return Err(EngineError::NotRegistered);
        }
        let target = self.normalize_address(address)?;
        tracing::info!("Originating call to {}", target);
        self.engine
            .invite(&target)
            .map_err(EngineError::op("invite"))
    }

    pub fn accept_call(&mut self, call: CallId) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.engine.accept(call).map_err(EngineError::op("accept"))
    }

    pub fn terminate_call(&mut self, call: CallId) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.engine
            .terminate(call)
            .map_err(EngineError::op("terminate"))
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        self.engine
            .set_mic_enabled(!muted)
            .map_err(EngineError::op("set_mic_enabled"))
    }

    pub fn set_speaker(&mut self, on: bool) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        let devices = self.engine.audio_devices();
        let device = pick_output(&devices, on).ok_or_else(|| EngineError::Operation {
            operation: "set_output_device",
            message: "no matching output device".to_string(),
        })?;
        let id = device.id.clone();
        self.engine
            .set_output_device(&id)
            .map_err(EngineError::op("set_output_device"))
    }

    /// Best-effort Geräteauswahl; Fehler werden nur geloggt
    pub fn select_audio_devices(&mut self, speaker: bool) {
        if !self.initialized {
            return;
        }

        let devices = self.engine.audio_devices();

        match pick_input(&devices) {
            Some(input) => {
                if let Err(e) = self.engine.set_input_device(&input.id) {
                    tracing::warn!("Failed to select input device {}: {}", input.name, e);
                }
            }
            None => tracing::warn!("No audio input device available"),
        }

        match pick_output(&devices, speaker) {
            Some(output) => {
                if let Err(e) = self.engine.set_output_device(&output.id) {
                    tracing::warn!("Failed to select output device {}: {}", output.name, e);
                }
            }
            None => tracing::warn!("No audio output device available"),
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    /// Vervollständigt `1001` zu `sip:1001@domain`
    fn normalize_address(&self, address: &str) -> Result<String, EngineError> {
        let address = address.trim();
        let invalid = || EngineError::InvalidAddress(address.to_string());

        if address.is_empty() || address.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        if let Some(rest) = address
            .strip_prefix("sip:")
            .or_else(|| address.strip_prefix("sips:"))
        {
            return match rest.split_once('@') {
                Some((user, host)) if !user.is_empty() && !host.is_empty() => {
                    Ok(address.to_string())
                }
                _ => Err(invalid()),
            };
        }

        match address.split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() => {
                Ok(format!("sip:{}", address))
            }
            Some(_) => Err(invalid()),
            None => {
                let domain = self.domain.as_ref().ok_or_else(invalid)?;
                Ok(format!("sip:{}@{}", address, domain))
            }
        }
    }
}

/// Bevorzugt das eingebaute Mikrofon
fn pick_input(devices: &[AudioDevice]) -> Option<&AudioDevice> {
    let inputs = devices.iter().filter(|d| d.can_capture);
    inputs
        .clone()
        .find(|d| d.kind == AudioDeviceKind::Microphone)
        .or_else(|| inputs.clone().next())
}

/// Lautsprecher bzw. Hörmuschel, sonst das erste Ausgabegerät
fn pick_output(devices: &[AudioDevice], speaker: bool) -> Option<&AudioDevice> {
    let wanted = if speaker {
        AudioDeviceKind::Speaker
    } else {
        AudioDeviceKind::Earpiece
    };
    let outputs = devices.iter().filter(|d| d.can_play);
    outputs
        .clone()
        .find(|d| d.kind == wanted)
        .or_else(|| outputs.clone().find(|d| d.kind == AudioDeviceKind::Speaker))
        .or_else(|| outputs.clone().next())
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("initialized", &self.initialized)
            .field("registered", &self.registered)
            .field("domain", &self.domain)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
